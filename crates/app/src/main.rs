mod cli;
mod processors;
mod session;
mod snapshot;

use clap::Parser;

use crate::cli::{Cli, Command};

fn main() {
    if let Err(err) = run() {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => session::run(args),
        Command::Devices => {
            cli::print_devices();
            Ok(())
        }
    }
}
