use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use gpu_idle_scheduler::config::RunConfig;
use gpu_idle_scheduler::controller::Controller;
use gpu_idle_scheduler::error::{Result, SchedError};
use gpu_idle_scheduler::remote::inventory::discover_or_empty;
use gpu_idle_scheduler::remote::{
    GcloudInventory, GcloudRemote, Inventory, MachineIdentity, MachineRecord, RemoteHost,
    StaticInventory,
};
use gpu_idle_scheduler::scheduler::{Job, JobOutcome, JobStatus};
use gpu_idle_scheduler::shutdown::install_shutdown_handler;
use gpu_idle_scheduler::status::{OutcomeRecord, OutputFormat};

#[derive(Parser, Debug)]
#[command(name = "gpu-idle-scheduler")]
#[command(version)]
#[command(about = "Runs queued scripts on remote GPU machines once they go idle")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run every job in a JSON run file
    Run(RunArgs),

    /// List the GPU machines discovered in a project
    Discover {
        /// Cloud project to search
        #[arg(long)]
        project: String,

        /// Output format
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,
    },
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Path to the JSON run file
    config: PathBuf,

    /// Recent samples that must all be below the ceiling
    #[arg(long)]
    idle_window: Option<usize>,

    /// Utilization percentage treated as busy
    #[arg(long)]
    ceiling: Option<u8>,

    /// Milliseconds between polls of each machine
    #[arg(long)]
    poll_interval_ms: Option<u64>,

    /// Milliseconds between scheduling passes
    #[arg(long)]
    schedule_interval_ms: Option<u64>,

    /// Milliseconds between status reports
    #[arg(long)]
    status_interval_ms: Option<u64>,

    /// Also write each job's output to this directory
    #[arg(long)]
    results_dir: Option<PathBuf>,

    /// Output format for status reports and results
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Default, Serialize)]
struct OutcomeTally {
    completed: usize,
    failed: usize,
}

async fn run(args: RunArgs) -> Result<bool> {
    let mut config = RunConfig::load(&args.config).await?;
    let scheduler = &mut config.scheduler;
    if let Some(window) = args.idle_window {
        scheduler.idle_window = window;
    }
    if let Some(ceiling) = args.ceiling {
        scheduler.utilization_ceiling = ceiling;
    }
    if let Some(ms) = args.poll_interval_ms {
        scheduler.poll_interval_ms = ms;
    }
    if let Some(ms) = args.schedule_interval_ms {
        scheduler.schedule_interval_ms = ms;
    }
    if let Some(ms) = args.status_interval_ms {
        scheduler.status_interval_ms = ms;
    }
    scheduler.validate()?;

    let specs = config.job_specs()?;
    for spec in &specs {
        if !spec.script_path.is_file() {
            return Err(SchedError::Config(format!(
                "script {} does not exist",
                spec.script_path.display()
            )));
        }
    }
    if let Some(dir) = &args.results_dir {
        tokio::fs::create_dir_all(dir).await?;
    }

    let inventory: Box<dyn Inventory> = if config.machines.is_empty() {
        Box::new(GcloudInventory::new())
    } else {
        Box::new(StaticInventory::new(config.machines.clone()))
    };
    let records = discover_or_empty(inventory.as_ref(), &config.project_id).await;
    if records.is_empty() {
        return Err(SchedError::NoMachines(config.project_id));
    }

    let remotes = records
        .into_iter()
        .map(|record| {
            let identity = MachineIdentity::new(record, config.project_id.clone());
            let remote: Arc<dyn RemoteHost> = Arc::new(GcloudRemote::new(identity.clone()));
            (identity, remote)
        })
        .collect();
    let controller =
        Controller::with_remotes(config.scheduler.clone(), remotes).with_status_output(args.output);

    for spec in &specs {
        controller.submit(Job::from_spec(spec)).await;
    }

    let (outcome_tx, outcome_rx) = mpsc::channel(64);
    let printer = tokio::spawn(print_outcomes(outcome_rx, args.results_dir, args.output));

    let summary = controller.run(outcome_tx, install_shutdown_handler()).await;
    let tally = printer
        .await
        .map_err(|e| SchedError::Internal(format!("outcome printer failed: {e}")))?;

    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string(&tally)?),
        OutputFormat::Table => {
            println!();
            if summary.interrupted {
                println!(
                    "Interrupted with {} job(s) unfinished.",
                    summary.unfinished_jobs
                );
            } else {
                println!("All jobs completed.");
            }
            println!("Completed: {}  Failed: {}", tally.completed, tally.failed);
        }
    }

    Ok(!summary.interrupted && tally.failed == 0)
}

async fn print_outcomes(
    mut rx: mpsc::Receiver<JobOutcome>,
    results_dir: Option<PathBuf>,
    format: OutputFormat,
) -> OutcomeTally {
    let mut tally = OutcomeTally::default();

    while let Some(outcome) = rx.recv().await {
        match outcome.status {
            JobStatus::Completed => tally.completed += 1,
            _ => tally.failed += 1,
        }

        match format {
            OutputFormat::Json => match OutcomeRecord::new(&outcome).to_json_line() {
                Ok(line) => println!("{line}"),
                Err(e) => tracing::warn!(error = %e, "Could not serialize outcome"),
            },
            OutputFormat::Table => {
                println!("\n--- Results ---");
                println!(
                    "{} on {}: {}",
                    outcome.job.script_name(),
                    outcome.machine,
                    outcome.status
                );
                if let Some(output) = &outcome.output {
                    print!("{output}");
                    if !output.ends_with('\n') {
                        println!();
                    }
                }
                if let Some(error) = &outcome.error {
                    println!("Error: {error}");
                }
            }
        }

        if let (Some(dir), Some(output)) = (&results_dir, &outcome.output) {
            let path = dir.join(outcome.job.log_file_name());
            if let Err(e) = tokio::fs::write(&path, output).await {
                tracing::warn!(path = %path.display(), error = %e, "Could not save job output");
            }
        }
    }

    tally
}

async fn discover(project: String, output: OutputFormat) -> Result<bool> {
    let records: Vec<MachineRecord> = discover_or_empty(&GcloudInventory::new(), &project).await;

    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&records)?),
        OutputFormat::Table => {
            if records.is_empty() {
                println!("No VMs with GPUs found.");
            } else {
                println!("{:<32} {:<18} ZONE", "NAME", "ADDRESS");
                println!("{}", "-".repeat(70));
                for record in &records {
                    println!("{:<32} {:<18} {}", record.name, record.address, record.zone);
                }
            }
        }
    }

    Ok(!records.is_empty())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let result = match args.command {
        Commands::Run(run_args) => run(run_args).await,
        Commands::Discover { project, output } => discover(project, output).await,
    };

    match result {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    }
}
