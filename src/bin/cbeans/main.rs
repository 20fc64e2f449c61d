mod args;

use std::process::ExitCode;

use anyhow::{Context, Result};
use chained_beans::broker::{Broker, BrokerConfig};
use chained_beans::server;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};

use crate::args::Args;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Logging
    if args.debug {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .init();
    } else {
        tracing_subscriber::fmt().json().init();
    }

    // Cancellation and termination channel.
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(error) = signal::ctrl_c().await {
                warn!(%error, "something strange with ctrl-c handling!");
            };
            cancel.cancel();
        });
    }

    let (shutdown_hold, mut shutdown_wait) = mpsc::channel::<()>(1);

    let exit_code = if let Err(error) =
        begin(args, &cancel, shutdown_hold).await
    {
        error!(%error, "encountered runtime error");
        cancel.cancel();
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    };

    // Every connection holds a sender; this returns once they've all closed.
    shutdown_wait.recv().await;

    exit_code
}

async fn begin(
    args: Args,
    cancel: &CancellationToken,
    shutdown_hold: mpsc::Sender<()>,
) -> Result<()> {
    let broker = Broker::new(BrokerConfig {
        max_job_size: args.max_job_size,
    });
    broker.spawn_sweepers(cancel);

    let listener = TcpListener::bind((args.listen, args.port))
        .await
        .context("binding listener")?;
    info!(
        addr = %listener.local_addr()?,
        max_job_size = args.max_job_size,
        "listening"
    );

    server::serve(listener, broker, cancel.clone(), shutdown_hold).await
}
