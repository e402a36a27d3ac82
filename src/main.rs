use clap::Parser;
use trusty_rusty_tasks::cli::{report_error, Cli};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn main() {
    // Logging is opt-in via RUST_LOG and goes to stderr so JSON output stays clean.
    let filter = std::env::var("RUST_LOG")
        .ok()
        .and_then(|raw| EnvFilter::try_new(raw.trim()).ok())
        .unwrap_or_else(|| EnvFilter::new("off"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let cli = Cli::parse();
    if let Err(err) = cli.run() {
        report_error(&err);
        std::process::exit(1);
    }
}
