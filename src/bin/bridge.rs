use clap::{App, Arg};
use hmbus::bridge::Bridge;
use hmbus::config::{BridgeConfig, DEFAULT_CONFIG_PATH};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("hmbus-bridge")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Bridges a Heatmiser V3 thermostat bus to MQTT")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("JSON configuration file")
                .takes_value(true)
                .default_value(DEFAULT_CONFIG_PATH),
        )
        .get_matches();

    let path = matches.value_of("config").unwrap_or(DEFAULT_CONFIG_PATH);
    let config = match BridgeConfig::load(path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("hmbus-bridge: {err}");
            std::process::exit(2);
        }
    };
    let _guard = hmbus::logging::init(&config.log_level, config.log_dir.as_deref())?;
    info!(config = %path, version = env!("CARGO_PKG_VERSION"), "hmbus-bridge starting");

    let bridge = Bridge::new(config)?;
    let cancel = CancellationToken::new();
    let stop = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown requested");
        stop.cancel();
    });

    if let Err(err) = bridge.run(cancel).await {
        error!(error = %err, "bridge failed");
        return Err(err.into());
    }
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        tokio::select! {
            _ = ctrl_c() => {},
            _ = terminate() => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c().await;
    }
}

async fn ctrl_c() {
    if let Err(err) = signal::ctrl_c().await {
        warn!(?err, "failed to install Ctrl+C handler");
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            term.recv().await;
        }
        Err(err) => warn!(?err, "failed to install SIGTERM handler"),
    }
}
