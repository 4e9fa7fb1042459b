use clap::Parser;
use gits_subcapture::config::{Cli, CliCommand};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(cli.log_filter()).unwrap_or_else(|_| EnvFilter::new("info"));
    // Logs go to stderr; stdout carries the summary.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        CliCommand::Analyze(args) => {
            let trace = args.trace.clone();
            let config = args.into_config();
            let outcome = gits_subcapture::analyze(&config, &trace)?;
            println!("{}: {}", config.output.display(), outcome.summary());
        }
        CliCommand::Inspect(args) => {
            let summary = gits_subcapture::inspect(&args.trace)?;
            print!("{summary}");
        }
    }
    Ok(())
}
