//! sqlshift command-line tool
//!
//! Validates, applies and rolls back SQLite schema migrations.

mod commands;
mod config;
mod output;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::Cli;

#[tokio::main]
async fn main() {
    // Usage errors exit 1; 2 is reserved for validation failures.
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = if e.use_stderr() { commands::EXIT_USAGE } else { 0 };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_directive().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let formatter = output::create_formatter(cli.format);

    match commands::execute(cli, &*formatter).await {
        Ok(output) => {
            println!("{}", output.text);
            if output.code != 0 {
                std::process::exit(output.code);
            }
        }
        Err(e) => {
            match e {
                commands::CliError::Engine(ref err) => eprintln!("{}", formatter.format_error(err)),
                _ => eprintln!("Error: {}", e),
            }
            std::process::exit(e.exit_code());
        }
    }
}
