//! The SOME/IP routing daemon.
//!
//! Hosts the routing manager for a machine. SIGINT/SIGTERM stop the daemon
//! (with final StopOffers on the wire), SIGUSR1 suspends routing and
//! SIGUSR2 resumes it.

use std::process::exit;

use clap::{App, Arg};
use tokio::signal::unix::{signal, SignalKind};

use someip::{RoutingState, Runtime};

#[tokio::main]
async fn main() {
    let matches = App::new("someipd")
        .about("SOME/IP routing manager daemon")
        .arg(
            Arg::new("daemonize")
                .short('d')
                .long("daemonize")
                .help("Detach from the controlling terminal (use a service manager in production)"),
        )
        .arg(
            Arg::new("quiet")
                .short('q')
                .long("quiet")
                .help("Suppress log output"),
        )
        .get_matches();

    if !matches.is_present("quiet") {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
            .init();
    }
    if matches.is_present("daemonize") {
        log::warn!("--daemonize: running in foreground, supervision is the service manager's job");
    }

    let runtime = match Runtime::from_env() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("someipd: configuration error: {e}");
            exit(1);
        }
    };

    let routing_name = runtime.config().routing.clone();
    let app = match runtime.create_application(&routing_name).await {
        Ok(app) => app,
        Err(e) => {
            eprintln!("someipd: failed to start routing manager: {e}");
            exit(1);
        }
    };
    log::info!("someipd up as '{routing_name}' ({:#06x})", app.client());

    let mut sigint = signal(SignalKind::interrupt()).expect("signal handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("signal handler");
    let mut sigusr1 = signal(SignalKind::user_defined1()).expect("signal handler");
    let mut sigusr2 = signal(SignalKind::user_defined2()).expect("signal handler");

    loop {
        tokio::select! {
            _ = sigint.recv() => break,
            _ = sigterm.recv() => break,
            _ = sigusr1.recv() => {
                log::info!("SIGUSR1: suspending routing");
                let _ = app.set_routing_state(RoutingState::Suspended).await;
            }
            _ = sigusr2.recv() => {
                log::info!("SIGUSR2: resuming routing");
                let _ = app.set_routing_state(RoutingState::Resumed).await;
            }
        }
    }

    log::info!("shutting down");
    app.stop().await;
    runtime.shutdown().await;
    exit(0);
}
