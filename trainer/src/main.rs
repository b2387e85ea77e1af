mod cli;
mod trainer;

use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use cli::TrainArgs;
use gantry_launch::RunError;
use time::OffsetDateTime;
use tokio::runtime::Builder;
use tracing::{error, info, Level};

#[derive(Parser, Debug)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Resolve the topology and build the launch command without running
    /// anything.
    Validate {
        #[clap(flatten)]
        args: TrainArgs,
    },
    /// Run this host's share of the training job.
    Run {
        #[clap(flatten)]
        args: TrainArgs,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();
    let (Commands::Validate { args: train } | Commands::Run { args: train }) = &args.command;
    gantry_logging::init_logging(train.log_output, Level::INFO, train.write_log.clone())?;

    let runtime = Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(async_main(args))
}

async fn async_main(args: Args) -> Result<()> {
    match args.command {
        Commands::Validate { args } => {
            let resolved = args.resolve()?;
            let command = resolved.launcher.build_command(
                &resolved.topology,
                &resolved.node,
                &resolved.entry,
                &resolved.user_args,
            )?;
            info!(
                role = %resolved.topology.role(),
                strategy = resolved.launcher.name(),
                command = %command,
                "config is OK"
            );
            Ok(())
        }
        Commands::Run { args } => {
            info!(
                "============ Trainer Startup at {} ============",
                OffsetDateTime::now_utc()
            );
            let output_dir = args.output_dir.clone();
            let readiness_timeout = Duration::from_secs(args.readiness_timeout_secs);

            let result = match args.resolve() {
                Ok(resolved) => trainer::train(&resolved, readiness_timeout).await,
                Err(err) => Err(err),
            };
            if let Err(err) = result {
                error!("{err:#}");
                trainer::write_failure_marker(&output_dir, &format!("{err:#}"));
                let return_code = err
                    .downcast_ref::<RunError>()
                    .and_then(RunError::return_code)
                    .unwrap_or(1);
                std::process::exit(return_code);
            }
            Ok(())
        }
    }
}
