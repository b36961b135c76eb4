use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;
mod clock;
mod controller;
mod device;
mod error;
mod frame;
mod port;
mod proto;
mod shell;
#[cfg(test)]
mod testutil;

fn init_logging(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> Result<()> {
    let args = cli::Cli::parse();
    init_logging(args.debug);
    match args.cmd {
        cli::Cmd::Controller(opts) => controller::run(opts),
        cli::Cmd::Device(opts) => device::run(opts),
    }
}
