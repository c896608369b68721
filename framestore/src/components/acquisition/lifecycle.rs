use crate::{
    components::acquisition::{
        capture_loop::{AcquisitionLoop, AcquisitionReport, CancellationToken, RetrievalPolicy},
        publisher::MetadataPublisher,
        storage::{Clock, SessionStorage, SystemClock},
    },
    devices::{
        hardware::camera::{CameraController, CameraDevice, DeviceEnumerator},
        software::bus::Bus,
    },
    errors::{DriverError, DriverResult},
};
use serde::{Deserialize, Serialize};
use std::{
    ffi::OsStr,
    net::{Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    sync::{
        mpsc::{self, Receiver, RecvTimeoutError},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Prefix of environment variables overriding file configuration, e.g.
/// `FRAMESTORE_ADDRESS=10.0.0.5`.
pub const ENV_PREFIX: &str = "FRAMESTORE";

fn default_storage() -> PathBuf {
    PathBuf::from(".")
}

fn default_channel() -> String {
    "data".to_string()
}

fn default_retrieval_timeout_ms() -> u64 {
    2000
}

/// As with all elements of the driver, a configuration struct is consumed
/// to create the controller, which in turn owns the camera and the
/// acquisition thread.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct DriverConfig {
    /// Network address of the camera. Without one the first device found
    /// is used.
    #[serde(default)]
    address: Option<Ipv4Addr>,
    /// Root directory the session folders are created in.
    #[serde(default = "default_storage")]
    storage: PathBuf,
    /// Bus channel frame records are published on.
    #[serde(default = "default_channel")]
    channel: String,
    /// Upper bound for one blocking frame retrieval.
    #[serde(default = "default_retrieval_timeout_ms")]
    retrieval_timeout_ms: u64,
    /// What a timeout or failed grab does to the run.
    #[serde(default)]
    retrieval_policy: RetrievalPolicy,
    /// Consumer the binary forwards records to over TCP.
    #[serde(default)]
    publish_address: Option<SocketAddr>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self::new(default_storage())
    }
}

impl DriverConfig {
    /// Create a config storing sessions below `storage`, everything else
    /// left at its default.
    ///
    /// * `storage`: root directory for session folders.
    pub fn new(storage: impl Into<PathBuf>) -> Self {
        Self {
            address: None,
            storage: storage.into(),
            channel: default_channel(),
            retrieval_timeout_ms: default_retrieval_timeout_ms(),
            retrieval_policy: RetrievalPolicy::default(),
            publish_address: None,
        }
    }

    #[must_use]
    pub fn with_address(mut self, address: impl Into<Ipv4Addr>) -> Self {
        self.address = Some(address.into());
        self
    }

    #[must_use]
    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    #[must_use]
    pub fn with_retrieval_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.retrieval_timeout_ms = timeout_ms;
        self
    }

    #[must_use]
    pub fn with_retrieval_policy(mut self, policy: RetrievalPolicy) -> Self {
        self.retrieval_policy = policy;
        self
    }

    #[must_use]
    pub fn with_publish_address(mut self, address: SocketAddr) -> Self {
        self.publish_address = Some(address);
        self
    }

    /// Read a YAML config file, with `FRAMESTORE_*` environment variables
    /// taking precedence over the file.
    ///
    /// * `filepath`: path to the config file.
    pub fn from_file<F: AsRef<OsStr>>(filepath: F) -> DriverResult<Self> {
        let file = Path::new(&filepath);
        let config = config::Config::builder()
            .add_source(config::File::new(
                &file.to_string_lossy(),
                config::FileFormat::Yaml,
            ))
            .add_source(config::Environment::with_prefix(ENV_PREFIX))
            .build()?
            .try_deserialize::<DriverConfig>()?;
        Ok(config)
    }

    pub fn address(&self) -> Option<Ipv4Addr> {
        self.address
    }

    pub fn storage(&self) -> &Path {
        &self.storage
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn retrieval_timeout(&self) -> Duration {
        Duration::from_millis(self.retrieval_timeout_ms)
    }

    pub fn retrieval_policy(&self) -> RetrievalPolicy {
        self.retrieval_policy
    }

    pub fn publish_address(&self) -> Option<SocketAddr> {
        self.publish_address
    }
}

/// Public entry point of the driver. Opens and configures the camera on
/// construction, runs the acquisition loop on its own thread after
/// [`start`](Self::start), and winds it down on
/// [`request_stop`](Self::request_stop).
///
/// The camera is moved onto the acquisition thread when it starts. From
/// then on only that thread calls into the device; a stop request is a
/// flag the thread looks at between retrievals, after which it stops
/// grabbing and closes the device itself.
pub struct LifecycleController<D: CameraDevice> {
    /// Unique id of the controller.
    uuid: Uuid,
    config: DriverConfig,
    bus: Arc<dyn Bus>,
    clock: Arc<dyn Clock>,
    /// Present until the acquisition thread takes it over.
    camera: Option<CameraController<D>>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
    reports: Option<Receiver<AcquisitionReport>>,
    report: Option<AcquisitionReport>,
}

impl<D: CameraDevice> LifecycleController<D> {
    /// Open and configure the camera described by `config`. Any failure
    /// here aborts construction; nothing is left running.
    ///
    /// * `config`: driver configuration.
    /// * `enumerator`: device discovery for the camera backend in use.
    /// * `bus`: bus records are published on.
    pub fn new<E>(config: DriverConfig, enumerator: &E, bus: Arc<dyn Bus>) -> DriverResult<Self>
    where
        E: DeviceEnumerator<Device = D>,
    {
        let mut camera = CameraController::open(config.address, enumerator)?;
        camera.configure()?;

        Ok(Self {
            uuid: Uuid::new_v4(),
            config,
            bus,
            clock: Arc::new(SystemClock),
            camera: Some(camera),
            cancel: CancellationToken::new(),
            handle: None,
            reports: None,
            report: None,
        })
    }

    /// Replace the clock used for session and frame names.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn get_uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Register the output channel and spawn the acquisition thread.
    /// Returns straight away.
    pub fn start(&mut self) -> DriverResult<()> {
        if self.handle.is_some() || self.report.is_some() {
            return Err(DriverError::AlreadyStarted);
        }
        let camera = self.camera.take().ok_or(DriverError::Stopped)?;

        let publisher = MetadataPublisher::new(self.bus.clone(), self.config.channel.clone());
        publisher.register();

        let acquisition = AcquisitionLoop::new(
            camera,
            SessionStorage::new(self.config.storage.clone(), self.clock.clone()),
            publisher,
            self.bus.clone(),
            self.cancel.clone(),
        )
        .with_timeout(self.config.retrieval_timeout())
        .with_policy(self.config.retrieval_policy);

        let (report_tx, report_rx) = mpsc::sync_channel::<AcquisitionReport>(1);
        let handle = thread::Builder::new()
            .name("acquisition".to_string())
            .spawn(move || {
                let report = acquisition.run();
                // The controller may already be gone.
                let _ = report_tx.send(report);
            })
            .map_err(DriverError::Spawn)?;

        info!(uuid = %self.uuid, storage = %self.config.storage.display(), "acquisition started");
        self.handle = Some(handle);
        self.reports = Some(report_rx);
        Ok(())
    }

    /// Wait for the acquisition thread to finish, at most `timeout` when
    /// given. Does not ask the thread to stop.
    ///
    /// Returns the report of the finished run, or `None` if the thread is
    /// still running after the timeout or was never started.
    pub fn join(&mut self, timeout: Option<Duration>) -> Option<&AcquisitionReport> {
        if self.report.is_none() {
            let reports = self.reports.as_ref()?;
            let received = match timeout {
                Some(timeout) => reports.recv_timeout(timeout),
                None => reports.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };
            match received {
                Ok(report) => {
                    if let Some(handle) = self.handle.take() {
                        if handle.join().is_err() {
                            warn!(uuid = %self.uuid, "acquisition thread panicked after reporting");
                        }
                    }
                    self.report = Some(report);
                }
                Err(RecvTimeoutError::Timeout) => return None,
                Err(RecvTimeoutError::Disconnected) => {
                    error!(uuid = %self.uuid, "acquisition thread ended without a report");
                    self.reports = None;
                    return None;
                }
            }
        }
        self.report.as_ref()
    }

    /// Whether the acquisition thread has finished.
    pub fn is_finished(&self) -> bool {
        self.report.is_some() || self.handle.as_ref().map_or(false, JoinHandle::is_finished)
    }

    /// Stop grabbing, close the camera and shut the bus down. Does not
    /// wait: a running acquisition thread finishes its current retrieval
    /// (at most one retrieval timeout), then stops grabbing and closes
    /// the camera before exiting. Use [`join`](Self::join) to wait for it.
    pub fn request_stop(&mut self) {
        info!(uuid = %self.uuid, "stop requested");
        self.cancel.cancel();
        if let Some(mut camera) = self.camera.take() {
            if let Err(e) = camera.close() {
                warn!(uuid = %self.uuid, "failed to close camera: {e}");
            }
        }
        self.bus.shutdown();
    }
}

impl<D: CameraDevice> Drop for LifecycleController<D> {
    fn drop(&mut self) {
        // A detached acquisition thread must not outlive its owner.
        self.cancel.cancel();
    }
}
