use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tokenmeter::admission::{AdmissionController, DenialKind};
use tokenmeter::clock::{Clock, SystemClock};
use tokenmeter::config::Settings;
use tokenmeter::ratelimit::ConsolidatedUsage;
use tokenmeter::store::{MemoryStore, UsageStore};

#[derive(Parser)]
#[command(name = "tokenmeter")]
#[command(about = "Token usage metering and admission control", long_about = None)]
#[command(version)]
struct Cli {
    /// YAML settings file, overridden by TOKENMETER_* variables
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the configured limits per policy
    Limits,
    /// Drive admit/commit cycles for one principal against an in-memory store
    Simulate {
        /// Principal to meter
        #[arg(short, long, default_value = "demo-user")]
        principal: String,

        /// Number of admission attempts
        #[arg(short, long, default_value = "20")]
        requests: usize,

        /// Attempts in flight at once
        #[arg(short = 'C', long, default_value = "4")]
        concurrency: usize,

        /// Input tokens consumed by each admitted request
        #[arg(short, long, default_value = "500")]
        input: u64,

        /// Output tokens consumed by each admitted request
        #[arg(short, long, default_value = "1500")]
        output: u64,
    },
}

#[derive(Debug, Default, Serialize)]
struct SimulationSummary {
    principal: String,
    requests: usize,
    admitted: usize,
    committed: usize,
    denied_input: usize,
    denied_output: usize,
    reservation_failed: usize,
    final_usage: ConsolidatedUsage,
}

fn init_tracing(format: LogFormat) -> anyhow::Result<()> {
    let filter = EnvFilter::from_default_env().add_directive("tokenmeter=info".parse()?);
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format)?;

    let settings = Settings::load(cli.config.as_deref())?;
    info!(
        daily_output_limit = settings.daily_output_limit,
        monthly_output_limit = settings.monthly_output_limit,
        enable_hourly = settings.enable_hourly,
        "Settings loaded"
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = Arc::new(MemoryStore::new(clock.clone()));
    let reaper = store.spawn_reaper(Duration::from_secs(60));
    let controller = AdmissionController::from_settings(
        &settings,
        store.clone() as Arc<dyn UsageStore>,
        clock,
    )?;

    match cli.command {
        Commands::Limits => {
            println!("{}", serde_json::to_string_pretty(&controller.limits())?);
        }
        Commands::Simulate {
            principal,
            requests,
            concurrency,
            input,
            output,
        } => {
            let summary =
                simulate(&controller, principal, requests, concurrency.max(1), input, output).await;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }

    reaper.abort();
    Ok(())
}

async fn simulate(
    controller: &AdmissionController,
    principal: String,
    requests: usize,
    concurrency: usize,
    input: u64,
    output: u64,
) -> SimulationSummary {
    info!(principal = %principal, requests, concurrency, "Starting simulation");

    let outcomes: Vec<_> = stream::iter(0..requests)
        .map(|_| {
            let principal = principal.as_str();
            async move {
                let result = controller.admit(principal).await;
                let committed = match &result.reservation_id {
                    Some(id) => controller.commit(principal, id, input, output).await,
                    None => false,
                };
                (result.denial_kind, committed)
            }
        })
        .buffer_unordered(concurrency)
        .collect()
        .await;

    let mut summary = SimulationSummary {
        principal: principal.clone(),
        requests,
        ..SimulationSummary::default()
    };
    for (denial, committed) in outcomes {
        match denial {
            None => summary.admitted += 1,
            Some(DenialKind::Input) => summary.denied_input += 1,
            Some(DenialKind::Output) => summary.denied_output += 1,
            Some(DenialKind::ReservationFailed) => summary.reservation_failed += 1,
        }
        if committed {
            summary.committed += 1;
        }
    }
    if summary.admitted != summary.committed {
        warn!(
            admitted = summary.admitted,
            committed = summary.committed,
            "Some admitted requests could not be committed"
        );
    }

    summary.final_usage = controller.limiter().is_exceeded(&principal).await.usage;
    summary
}
