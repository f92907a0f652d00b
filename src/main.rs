// src/main.rs

use std::fs;

use clap::Parser;
use log::LevelFilter;
use log4rs::{
    append::console::ConsoleAppender,
    append::file::FileAppender,
    config::{Appender, Root},
    encode::pattern::PatternEncoder,
    filter::threshold::ThresholdFilter,
    Config,
};

use graph2table::config::{CommandLineInput, RunAction, RunConfig};
use graph2table::output::{self, DeliveryTarget, OutputPlan};
use graph2table::{pipeline, AppError};

/// Sets up logging configuration.
fn setup_logging(verbose: bool) -> Result<(), Box<dyn std::error::Error>> {
    let log_level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    let log_file_path = std::env::temp_dir().join("graph2table.log");
    if let Some(parent) = log_file_path.parent() {
        fs::create_dir_all(parent)?;
    }

    let pattern = if verbose {
        "{d(%Y-%m-%d %H:%M:%S)} [{l}] - {m}{n}"
    } else {
        "{m}{n}"
    };

    let stderr_appender = ConsoleAppender::builder()
        .target(log4rs::append::console::Target::Stderr)
        .encoder(Box::new(PatternEncoder::new(pattern)))
        .build();

    let file_appender = FileAppender::builder()
        .encoder(Box::new(PatternEncoder::new(
            "{d(%Y-%m-%d %H:%M:%S)} [{l}] - {m}{n}",
        )))
        .build(&log_file_path)?;

    let config = Config::builder()
        .appender(Appender::builder().build("stderr", Box::new(stderr_appender)))
        .appender(
            Appender::builder()
                .filter(Box::new(ThresholdFilter::new(LevelFilter::Debug)))
                .build("file", Box::new(file_appender)),
        )
        .build(
            Root::builder()
                .appender("stderr")
                .appender("file")
                .build(log_level),
        )?;

    log4rs::init_config(config)?;
    log::info!("Logging initialized. Log file: {}", log_file_path.display());
    Ok(())
}

/// Full extraction: run every enabled query and write the tables.
async fn execute_run(config: &RunConfig) -> Result<(), AppError> {
    let summary = pipeline::run(config).await?;

    println!(
        "Wrote {} tables ({} rows) to {}",
        summary.tables_written,
        summary.rows_written,
        config.output_dir.display()
    );
    for name in &summary.failed_queries {
        eprintln!("Query '{name}' failed; its tables were skipped.");
    }
    if !summary.output.is_success() {
        return Err(AppError::Internal(format!(
            "{} output operations failed",
            summary.output.failed.len()
        )));
    }
    Ok(())
}

/// Sync actions answer on stdout instead of writing tables.
async fn execute_sync_action(config: &RunConfig) -> Result<(), AppError> {
    let result = pipeline::sync_action(config).await?;
    let rendered = serde_json::to_string_pretty(&result)?;
    let plan = OutputPlan::new().with_operation(DeliveryTarget::PrintToStdout { content: rendered });
    output::deliver(plan)?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = CommandLineInput::parse();

    setup_logging(cli.verbose)?;

    let config = RunConfig::resolve(cli)?;

    match config.action {
        RunAction::Run => execute_run(&config).await?,
        _ => execute_sync_action(&config).await?,
    }

    Ok(())
}
