// Minichain - CLI entry point

use clap::Parser;
use minichain::cli::{Cli, CliHandler};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let mut handler = match CliHandler::from_cli(&cli) {
        Ok(h) => h,
        Err(e) => {
            eprintln!("Error initializing: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = handler.handle(cli.command) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
