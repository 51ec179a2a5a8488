use anyhow::Result;
use boardtestor::aggregator::RunSummary;
use boardtestor::config::RunConfig;
use boardtestor::config::cli_args::CliArgs;
use boardtestor::connection::SerialConnector;
use boardtestor::harness::HarnessRegistry;
use boardtestor::provisioner::{CommandFlasher, CommandImageBuilder, Provisioner};
use boardtestor::reporter::{JsonReportSink, LogSink, MarkdownReportSink};
use boardtestor::scheduler::Scheduler;
use log::{debug, error, info};
use std::process::ExitCode;
use std::sync::Arc;

/// Exit code for configuration and usage errors
const EXIT_CONFIG_ERROR: u8 = 2;

fn main() -> ExitCode {
    let args = CliArgs::parse_args();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(args.get_log_level()))
        .init();
    debug!("Parsed arguments: {args:?}");

    match run(&args) {
        Ok(summary) => {
            println!("{summary}");
            if summary.success() {
                println!("Succeeded!");
            } else {
                for failure in summary.failures() {
                    println!("FAILED {} on {}", failure.test, failure.target);
                }
                println!("Failed!");
            }
            ExitCode::from(summary.exit_code() as u8)
        }
        Err(e) => {
            error!("{e:#}");
            eprintln!("Error: {e:#}");
            ExitCode::from(EXIT_CONFIG_ERROR)
        }
    }
}

fn run(args: &CliArgs) -> Result<RunSummary> {
    let mut config = RunConfig::from_file(&args.config)?;
    config.apply_cli(args)?;
    info!(
        "Loaded {} with {} target(s) and {} test(s)",
        args.config.display(),
        config.targets.len(),
        config.tests.len()
    );

    let registry = HarnessRegistry::with_builtins();
    let cases = registry.test_cases(&config.tests, &config.defaults)?;

    let provisioner = Provisioner::new(Arc::new(CommandImageBuilder), Arc::new(CommandFlasher))
        .with_build(config.build);
    let jobs = config.jobs();
    let mut scheduler = Scheduler::new(
        config.targets,
        cases,
        provisioner,
        Arc::new(SerialConnector),
        jobs,
    )
    .with_sink(Box::new(LogSink));
    if let Some(path) = config.report {
        scheduler = scheduler.with_sink(Box::new(JsonReportSink::new(path)));
    }
    if let Some(path) = config.markdown {
        scheduler = scheduler.with_sink(Box::new(MarkdownReportSink::new(path)));
    }

    Ok(scheduler.run())
}
