#![forbid(unsafe_code)]

use std::io::IsTerminal;
use std::process::ExitCode;

use clap::Parser;
use populator_os::{IngestError, IngestionDriver, IngestionReport};
use populator_storage::RestConnector;
use populator_tools::populate_cli::{
    completion_flag, populator_config, render_dump, render_summary, retry_policy, CliError,
    LogFormat, PopulateArgs,
};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn main() -> ExitCode {
    let args = PopulateArgs::parse();
    init_logging(args.log_format);
    let report = match run(&args) {
        Ok(report) => report,
        Err(err) => {
            tracing::error!(error = %err, "could not start ingestion");
            eprintln!("{err}");
            return ExitCode::FAILURE;
        }
    };
    if args.dump_table_contents {
        print!("{}", render_dump(&report.dumped));
    }
    println!("{}", render_summary(&report));
    ExitCode::from(report.exit_code() as u8)
}

#[derive(Debug, thiserror::Error)]
enum StartError {
    #[error(transparent)]
    Cli(#[from] CliError),
    #[error(transparent)]
    Ingest(#[from] IngestError),
}

fn run(args: &PopulateArgs) -> Result<IngestionReport, StartError> {
    let config = populator_config(args)?;
    let connector = RestConnector::new(&args.zookeeper_quorum, args.rest_port);
    let driver = IngestionDriver::from_config(config, connector)?
        .with_retry_policy(retry_policy(args))
        .with_completion_flag(completion_flag(args))
        .with_stale_output_file(args.remove_output_file.clone());
    Ok(driver.run())
}

fn init_logging(format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let use_json = match format {
        LogFormat::Json => true,
        LogFormat::Text => false,
        LogFormat::Auto => !std::io::stdout().is_terminal(),
    };
    if use_json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().flatten_event(true).with_current_span(false))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer())
            .init();
    }
}
