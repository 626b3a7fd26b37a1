mod args;

use std::process::ExitCode;

use clap::error::ErrorKind;
use clap::Parser;
use ironbeans::server::{Config, Server};
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::signal as tokio_signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};

use crate::args::Args;

/// Bad command line.
const EXIT_USAGE: u8 = 5;
/// A configuration we cannot honour.
const EXIT_UNSUPPORTED: u8 = 2;
/// Fatal initialisation failure: socket or signal setup.
const EXIT_INIT: u8 = 111;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e)
            if matches!(
                e.kind(),
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion
            ) =>
        {
            let _ = e.print();
            return ExitCode::SUCCESS;
        },
        Err(e) => {
            let _ = e.print();
            return ExitCode::from(EXIT_USAGE);
        },
    };

    // Logging
    if args.debug {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .init();
    } else {
        tracing_subscriber::fmt().json().init();
    }

    if args.detach {
        error!("unsupported configuration: detaching not yet implemented");
        return ExitCode::from(EXIT_UNSUPPORTED);
    }

    // Cancellation and termination channel: the accept loop, timer, and
    // every connection task watch `cancel`; `shutdown_wait` resolves once
    // the last of them has finished.
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(error) = tokio_signal::ctrl_c().await {
                warn!(%error, "something strange with ctrl-c handling!");
            };
            cancel.cancel();
        });
    }

    let listener = match TcpListener::bind((args.listen, args.port)).await {
        Ok(listener) => listener,
        Err(error) => {
            error!(%error, "failed to bind listen socket");
            return ExitCode::from(EXIT_INIT);
        },
    };

    let mut drain_signal = match signal(SignalKind::user_defined1()) {
        Ok(s) => s,
        Err(error) => {
            error!(%error, "failed to install SIGUSR1 handler");
            return ExitCode::from(EXIT_INIT);
        },
    };

    let server = Server::new(Config {
        max_job_size: args.max_job_size,
        heap_size: args.heap_size,
    });

    // SIGUSR1 puts the server into drain mode for the rest of its life.
    {
        let server = server.clone();
        tokio::spawn(async move {
            while drain_signal.recv().await.is_some() {
                server.drain().await;
            }
        });
    }

    tokio::spawn(server.clone().run_timer(cancel.clone()));

    let (shutdown_hold, mut shutdown_wait) = mpsc::channel::<()>(1);

    let exit_code = if let Err(error) =
        server.serve(listener, cancel.clone(), shutdown_hold).await
    {
        error!(%error, "encountered runtime error");
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    };

    // Give in-flight connections the chance to finish writing; recv resolves
    // once every task has dropped its hold on the channel.
    shutdown_wait.recv().await;

    info!("shut down");

    exit_code
}
