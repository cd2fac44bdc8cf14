use tokio::net::TcpListener;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use std::process;
use std::sync::Arc;

use burrow_lib::logging;
use burrow_lib::nat::{self, Nat};
use burrow_lib::privsep::{self, PrivOps};
use burrow_lib::proxy::Proxy;
use burrow_lib::resolver::{Resolver, SystemDns};
use burrow_lib::tunnel::chisel::ChiselTunnel;

mod cli;

use cli::{Command, StartArgs};

enum SignalMessage {
    Shutdown,
}

#[tokio::main]
async fn main() {
    let args = cli::parse();
    logging::init(&args.log_level);

    let result = match args.command {
        Command::Start(start_args) => start(start_args, &args.log_level).await,
        Command::Cleanup => cleanup(&args.log_level).await,
        Command::Priv => serve_priv().await,
        Command::Version => version(),
    };

    match result {
        Ok(()) => (),
        Err(exitcode::OK) => (),
        Err(code) => process::exit(code),
    }
}

async fn start(args: StartArgs, log_level: &str) -> Result<(), exitcode::ExitCode> {
    if unsafe { libc::getegid() } != 0 {
        tracing::warn!("root privilege is required to redirect packets");
    }

    let listen_port = if args.listen_port == 0 {
        find_free_port().await.map_err(|error| {
            tracing::error!(?error, "error allocating a listen port");
            exitcode::IOERR
        })?
    } else {
        args.listen_port
    };

    let mut signals = signal_channel()?;

    let priv_client = privsep::Client::start(log_level).await.map_err(|error| {
        tracing::error!(?error, "error starting privileged helper");
        exitcode::NOPERM
    })?;
    let priv_client: Arc<dyn PrivOps> = Arc::new(priv_client);

    let nat = nat::new(priv_client, listen_port).map_err(|error| {
        tracing::error!(?error, "error constructing NAT controller");
        exitcode::UNAVAILABLE
    })?;

    nat.cleanup().await.map_err(|error| {
        tracing::error!(?error, "error cleaning up stale NAT state");
        exitcode::OSERR
    })?;
    nat.setup().await.map_err(|error| {
        tracing::error!(?error, "error setting up NAT rules");
        exitcode::OSERR
    })?;

    // rules are installed from here on: tear them down on any error path
    let listener = match TcpListener::bind((args.listen_host, listen_port)).await {
        Ok(listener) => listener,
        Err(error) => {
            tracing::error!(?error, "error binding proxy listener");
            teardown_nat(&nat).await;
            return Err(exitcode::IOERR);
        }
    };

    let cancel = CancellationToken::new();
    let resolver = Resolver::new(
        Arc::clone(&nat),
        SystemDns,
        args.targets.clone(),
        args.exclude_subnets.clone(),
    );
    let resolver_task = tokio::spawn(resolver.run(args.dns_check_interval, cancel.clone()));

    let tunnel = Arc::new(ChiselTunnel::new(args.tunnel_config()));
    let proxy = Proxy::new(Arc::clone(&nat), tunnel);
    let (exit_sender, mut exit_receiver) = mpsc::channel(1);
    tokio::spawn(async move {
        if let Err(error) = proxy.run(listener).await {
            tracing::error!(?error, "proxy failed");
            let _ = exit_sender.send(()).await;
        }
    });

    let clean = tokio::select! {
        Some(SignalMessage::Shutdown) = signals.recv() => true,
        Some(()) = exit_receiver.recv() => false,
        else => false,
    };

    tracing::info!("shutting down");
    cancel.cancel();
    if let Err(error) = resolver_task.await {
        tracing::warn!(?error, "resolver task failed");
    }
    teardown_nat(&nat).await;

    if clean { Ok(()) } else { Err(exitcode::SOFTWARE) }
}

async fn cleanup(log_level: &str) -> Result<(), exitcode::ExitCode> {
    let priv_client = privsep::Client::start(log_level).await.map_err(|error| {
        tracing::error!(?error, "error starting privileged helper");
        exitcode::NOPERM
    })?;

    let nat = nat::new(Arc::new(priv_client), 0).map_err(|error| {
        tracing::error!(?error, "error constructing NAT controller");
        exitcode::UNAVAILABLE
    })?;

    nat.cleanup().await.map_err(|error| {
        tracing::error!(?error, "error cleaning up stale NAT state");
        exitcode::OSERR
    })
}

async fn serve_priv() -> Result<(), exitcode::ExitCode> {
    // termination signals are aimed at the parent; the helper must stay
    // alive until the request pipe closes
    let mut sigint = signal(SignalKind::interrupt()).map_err(|error| {
        tracing::error!(?error, "error setting up SIGINT handler");
        exitcode::IOERR
    })?;
    let mut sigterm = signal(SignalKind::terminate()).map_err(|error| {
        tracing::error!(?error, "error setting up SIGTERM handler");
        exitcode::IOERR
    })?;
    tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(_) = sigint.recv() => tracing::debug!("ignoring SIGINT"),
                Some(_) = sigterm.recv() => tracing::debug!("ignoring SIGTERM"),
                else => break,
            }
        }
    });

    privsep::Server::new().run().await.map_err(|error| {
        tracing::error!(?error, "privileged helper failed");
        exitcode::DATAERR
    })
}

fn version() -> Result<(), exitcode::ExitCode> {
    println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    Ok(())
}

fn signal_channel() -> Result<mpsc::Receiver<SignalMessage>, exitcode::ExitCode> {
    let (sender, receiver) = mpsc::channel(32);
    let mut sigint = signal(SignalKind::interrupt()).map_err(|error| {
        tracing::error!(?error, "error setting up SIGINT handler");
        exitcode::IOERR
    })?;
    let mut sigterm = signal(SignalKind::terminate()).map_err(|error| {
        tracing::error!(?error, "error setting up SIGTERM handler");
        exitcode::IOERR
    })?;
    let mut sighup = signal(SignalKind::hangup()).map_err(|error| {
        tracing::error!(?error, "error setting up SIGHUP handler");
        exitcode::IOERR
    })?;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(_) = sigint.recv() => {
                    tracing::debug!("received SIGINT");
                    if sender.send(SignalMessage::Shutdown).await.is_err() {
                        break;
                    }
                }
                Some(_) = sigterm.recv() => {
                    tracing::debug!("received SIGTERM");
                    if sender.send(SignalMessage::Shutdown).await.is_err() {
                        break;
                    }
                }
                Some(_) = sighup.recv() => {
                    tracing::debug!("received SIGHUP");
                    if sender.send(SignalMessage::Shutdown).await.is_err() {
                        break;
                    }
                }
                else => {
                    tracing::warn!("signal streams closed");
                    break;
                }
            }
        }
    });

    Ok(receiver)
}

async fn teardown_nat(nat: &Arc<dyn Nat>) {
    if let Err(error) = nat.shutdown().await {
        tracing::warn!(?error, "error shutting down NAT rules");
    }
}

/// Briefly bind a loopback listener to learn a free port. The proxy binds
/// the port for real right after, before any rules point at it.
async fn find_free_port() -> std::io::Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}
