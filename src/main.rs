//! tasklane CLI entry point

use clap::Parser;
use std::process::ExitCode;
use tasklane::cli::{self, Cli, Identity};
use tasklane::TaskError;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> ExitCode {
    // stdout is for command output; diagnostics only when asked for
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();
    let identity = Identity::from_env();
    log::debug!("tm v{} as {}", env!("CARGO_PKG_VERSION"), identity.actor);

    // Other commands keep the default SIGINT behaviour
    let cancel = CancellationToken::new();
    if cli.command.follows() {
        let on_interrupt = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                on_interrupt.cancel();
            }
        });
    }

    match cli::execute(cli, &identity, cancel).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {:#}", err);
            let code = err.downcast_ref::<TaskError>().map_or(1, TaskError::exit_code);
            ExitCode::from(code)
        }
    }
}
