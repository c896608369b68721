//! Frame capture binary.
use clap::Parser;
use framestore::{
    components::prelude::*,
    devices::software::bus::{Bus, ChannelBus, TcpBus},
    errors::{DriverError, DriverResult},
    logging::init_logging,
};
use std::{process::ExitCode, sync::Arc, thread, time::Duration};
use tracing::{error, info};

/// How often the binary checks whether the acquisition ended on its own.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Arguments required for starting the program from the command line.
#[derive(Parser, Debug)]
struct Args {
    /// Path to the YAML config file for the driver.
    #[arg(short, long)]
    filepath: String,
    /// Default log filter, overridden by `RUST_LOG`.
    #[arg(long, default_value = "info")]
    log_level: String,
    /// Log one JSON object per line.
    #[arg(long)]
    json: bool,
}

/// Bus for the binary: TCP when a consumer address is configured, otherwise
/// an in-process channel whose records are written to the log.
fn build_bus(config: &DriverConfig) -> DriverResult<Arc<dyn Bus>> {
    if let Some(address) = config.publish_address() {
        let bus =
            TcpBus::connect(address).map_err(|source| DriverError::BusConnect { address, source })?;
        info!(%address, "publishing frame records over tcp");
        return Ok(Arc::new(bus));
    }

    let (bus, receiver) = ChannelBus::new();
    thread::Builder::new()
        .name("bus-log".to_string())
        .spawn(move || {
            for message in receiver {
                info!(channel = %message.channel, payload = %message.payload, "frame record");
            }
        })
        .map_err(DriverError::Spawn)?;
    Ok(Arc::new(bus))
}

#[cfg(feature = "gige")]
async fn run(config: DriverConfig) -> DriverResult<bool> {
    use framestore::devices::hardware::gige::GigeEnumerator;

    let bus = build_bus(&config)?;
    let enumerator = GigeEnumerator::new().map_err(DriverError::DeviceUnavailable)?;
    let mut controller = LifecycleController::new(config, &enumerator, bus)?;
    controller.start()?;

    let mut poll = tokio::time::interval(POLL_INTERVAL);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received");
                break;
            }
            _ = poll.tick() => {
                if controller.is_finished() {
                    break;
                }
            }
        }
    }
    controller.request_stop();

    // Joining blocks until the thread has closed the camera, which is at
    // most one retrieval timeout away.
    let drained = tokio::task::block_in_place(|| {
        controller.join(None).map(|report| {
            info!(
                frames = report.frames,
                session = ?report.session.as_ref().map(|s| s.dir().display().to_string()),
                "acquisition finished"
            );
            if let Some(e) = report.error() {
                error!("acquisition failed: {e}");
            }
            report.is_drained()
        })
    });
    // The enumerator holds the library handle, keep it until the camera is
    // closed.
    drop(enumerator);

    Ok(drained.unwrap_or(false))
}

#[cfg(not(feature = "gige"))]
async fn run(config: DriverConfig) -> DriverResult<bool> {
    let _bus = build_bus(&config)?;
    error!("built without a camera backend, rebuild with `--features gige`");
    Ok(false)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args.log_level, args.json);

    let config = match DriverConfig::from_file(&args.filepath) {
        Ok(config) => config,
        Err(e) => {
            error!(filepath = %args.filepath, "failed to load config: {e}");
            return ExitCode::FAILURE;
        }
    };

    match run(config).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
