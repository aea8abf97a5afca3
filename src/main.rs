use clap::Parser;

mod cli;
mod commands;

use cli::{Args, Commands};
use edenfs::error;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("EDENFS_LOG").unwrap_or_else(|_| "info".to_string()))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match run(args).await {
        Ok(code) => {
            std::process::exit(code);
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(commands::EXIT_UNREPAIRABLE);
        }
    }
}

async fn run(args: Args) -> error::Result<i32> {
    match args.command {
        Commands::Fsck {
            target,
            dry_run,
            json,
        } => commands::run_fsck(&target.resolve()?, dry_run, json),
        Commands::Show { target } => {
            commands::show_overlay(&target.resolve()?)?;
            Ok(0)
        }
    }
}
