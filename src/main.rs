use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use wavepilot::{
    HttpBackend, Orchestrator, PilotConfig, logger, model::OperationKind, plan::MigrationPlan,
};

#[derive(Parser)]
#[command(name = "wavepilot")]
#[command(about = "Plan and drive virtual machine migrations in waves")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to wavepilot.toml (defaults to the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Plan file listing hosts and waves
    #[arg(short, long, default_value = "wavepilot-plan.toml")]
    plan: PathBuf,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List the VMs on a source host
    Discover {
        /// Source host address from the plan
        #[arg(long)]
        host: String,
    },
    /// Download the pre-check report for a wave
    Precheck {
        #[arg(long)]
        wave: String,
        /// Where to write the report
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Clone, prepare and create target VMs for every VM of a wave
    Migrate {
        #[arg(long)]
        wave: String,
    },
    /// Ping every VM of a wave by hostname
    Ping {
        #[arg(long)]
        wave: String,
    },
    /// Refresh power state and OS of a wave's VMs
    Status {
        #[arg(long)]
        wave: String,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        unsafe {
            std::env::set_var("RUST_LOG", "wavepilot=debug");
        }
    }
    logger::init_logger();

    let config = PilotConfig::load(cli.config.as_deref()).context("failed to load configuration")?;

    let plan = if matches!(cli.command, Commands::Config) {
        MigrationPlan::default()
    } else {
        MigrationPlan::from_file(&cli.plan)
            .with_context(|| format!("failed to read plan {}", cli.plan.display()))?
    };
    let backend = HttpBackend::new(&config.backend.base_url, config.request_timeout())?;
    let orchestrator = Orchestrator::new(Arc::new(backend), config);

    let result = run(&orchestrator, &plan, cli.command).await;
    orchestrator.shutdown();
    result
}

async fn run(orchestrator: &Orchestrator, plan: &MigrationPlan, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Discover { host } => {
            plan.register_hosts(orchestrator);
            let host_id = orchestrator
                .store()
                .snapshot()
                .host_by_address(&host)
                .map(|h| h.id.clone())
                .with_context(|| format!("host {} is not in the plan", host))?;
            orchestrator.fetch_vms_for_host(&host_id).await?;

            println!(
                "{:<24} {:<12} {:<16} {:<24} {:<8}",
                "NAME", "POWER", "ADDRESS", "GUEST OS", "CPU"
            );
            println!("{}", "=".repeat(88));
            for vm in &orchestrator.store().snapshot().vms {
                println!(
                    "{:<24} {:<12} {:<16} {:<24} {:<8}",
                    vm.name,
                    vm.power_state,
                    vm.ip_address.as_deref().unwrap_or("-"),
                    vm.guest_os.as_deref().unwrap_or("-"),
                    vm.cpu_usage
                );
            }
        }
        Commands::Precheck { wave, output } => {
            let wave_id = plan.materialize_wave(orchestrator, &wave).await?;
            let document = orchestrator.generate_precheck_report(&wave_id).await?;
            let path =
                output.unwrap_or_else(|| PathBuf::from(format!("pre-check-report-wave-{}.pdf", wave)));
            std::fs::write(&path, document)
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!("Pre-check report written to {}", path.display());
        }
        Commands::Migrate { wave } => {
            let wave_id = plan.materialize_wave(orchestrator, &wave).await?;
            let (poller, _handle) = orchestrator.start_polling();
            let report = orchestrator.prepare_and_migrate_wave(&wave_id).await?;
            poller.shutdown();

            let snapshot = orchestrator.store().snapshot();
            let name_of = |vm_id: &str| {
                snapshot
                    .vm(&wave_id, vm_id)
                    .map(|vm| vm.name.clone())
                    .unwrap_or_else(|| vm_id.to_string())
            };
            for vm_id in &report.completed {
                println!("{:<24} target creation requested", name_of(vm_id));
            }
            for (vm_id, reason) in &report.aborted {
                println!("{:<24} stopped: {}", name_of(vm_id), reason);
            }
            if !report.all_completed() {
                bail!("{} VM(s) did not reach target creation", report.aborted.len());
            }
        }
        Commands::Ping { wave } => {
            let wave_id = plan.materialize_wave(orchestrator, &wave).await?;
            orchestrator.perform_ping_test(&wave_id).await;

            let snapshot = orchestrator.store().snapshot();
            let wave = snapshot.wave(&wave_id).context("wave disappeared")?;
            for vm in &wave.vms {
                let status = vm
                    .status(OperationKind::Ping)
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<24} {:<32} {}",
                    vm.name,
                    vm.hostname.as_deref().unwrap_or("-"),
                    status
                );
            }
        }
        Commands::Status { wave } => {
            let wave_id = plan.materialize_wave(orchestrator, &wave).await?;
            if !orchestrator.run_replication_check(&wave_id).await {
                bail!("VM status check failed for wave {}", wave);
            }
            for vm in orchestrator.replication_candidates(&wave_id) {
                println!(
                    "{:<24} {:<12} {:<8} {}",
                    vm.name,
                    vm.power_state,
                    vm.os_type.as_str(),
                    vm.guest_os.as_deref().unwrap_or("-")
                );
            }
        }
        Commands::Config => {
            print!("{}", toml::to_string_pretty(orchestrator.config())?);
        }
    }
    Ok(())
}
