use crate::{
    components::acquisition::{
        publisher::MetadataPublisher,
        storage::{Session, SessionStorage},
    },
    devices::{
        hardware::camera::{CameraController, CameraDevice, Retrieval},
        software::bus::Bus,
    },
    errors::{DriverError, DriverResult},
};
use serde::{Deserialize, Serialize};
use std::{
    sync::{Arc, Condvar, Mutex, PoisonError},
    time::{Duration, Instant},
};
use strum_macros::{Display as StrumDisplay, IntoStaticStr};
use tracing::{debug, info, info_span, warn};

/// Retrieval timeout used when none is configured.
pub const DEFAULT_RETRIEVAL_TIMEOUT: Duration = Duration::from_millis(2000);

/// Bus shutdown is not signalled, so a retry backoff looks at the bus this
/// often.
const LIVENESS_POLL: Duration = Duration::from_millis(50);

/// Lifecycle of the acquisition loop.
#[derive(StrumDisplay, IntoStaticStr, Copy, Clone, Debug, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Running,
    /// Stop observed, no further retrievals.
    Draining,
    Stopped,
}

/// How the loop reacts to a retrieval that produced no frame.
#[derive(Deserialize, Serialize, Copy, Clone, Debug, PartialEq, Eq, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RetrievalPolicy {
    /// The first timeout or failed grab ends the run.
    #[default]
    FailFast,
    /// Retry up to `max_attempts` consecutive failures, sleeping
    /// `backoff_ms` between them. A good frame resets the count.
    Retry { max_attempts: u32, backoff_ms: u64 },
}

impl RetrievalPolicy {
    /// Decide what a failed retrieval means for the run. `failures` counts
    /// consecutive failures and is owned by the loop. Returns how long to
    /// back off before the next retrieval.
    fn on_failure(self, failures: &mut u32, error: DriverError) -> DriverResult<Duration> {
        match self {
            RetrievalPolicy::FailFast => Err(error),
            RetrievalPolicy::Retry {
                max_attempts,
                backoff_ms,
            } => {
                *failures += 1;
                if *failures > max_attempts {
                    return Err(error);
                }
                warn!(attempt = *failures, max_attempts, "retrying after: {error}");
                Ok(Duration::from_millis(backoff_ms))
            }
        }
    }
}

#[derive(Debug, Default)]
struct CancelState {
    cancelled: Mutex<bool>,
    wake: Condvar,
}

/// Cooperative stop request shared between the caller and the loop. The
/// loop looks at it once per iteration, before each retrieval, and while
/// backing off between retries.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken(Arc<CancelState>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request the stop and wake anyone blocked in
    /// [`wait_timeout`](Self::wait_timeout).
    pub fn cancel(&self) {
        *self.lock() = true;
        self.0.wake.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.lock()
    }

    /// Block for at most `timeout`, returning early once cancelled.
    /// Returns whether the token is cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (cancelled, _) = self
            .0
            .wake
            .wait_timeout_while(self.lock(), timeout, |cancelled| !*cancelled)
            .unwrap_or_else(PoisonError::into_inner);
        *cancelled
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, bool> {
        self.0.cancelled.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Why the loop stopped.
#[derive(Debug)]
pub enum LoopExit {
    /// Stop was requested (token or bus liveness) and observed.
    Drained,
    /// An error ended the run.
    Failed(DriverError),
}

/// Summary of one finished acquisition run, handed back through `join`.
#[derive(Debug)]
pub struct AcquisitionReport {
    /// The session folder, if the run got as far as creating it.
    pub session: Option<Session>,
    /// Frames saved and published.
    pub frames: u64,
    /// Always `Stopped` once the loop has returned.
    pub state: LoopState,
    pub exit: LoopExit,
}

impl AcquisitionReport {
    pub fn is_drained(&self) -> bool {
        matches!(self.exit, LoopExit::Drained)
    }

    pub fn error(&self) -> Option<&DriverError> {
        match &self.exit {
            LoopExit::Drained => None,
            LoopExit::Failed(e) => Some(e),
        }
    }
}

/// The background worker: retrieve a frame, save it, announce it, repeat.
/// The loop owns the camera for the whole run and releases it on the way
/// out, so no other thread touches the device while it runs.
pub struct AcquisitionLoop<D: CameraDevice> {
    camera: CameraController<D>,
    storage: SessionStorage,
    publisher: MetadataPublisher,
    bus: Arc<dyn Bus>,
    cancel: CancellationToken,
    timeout: Duration,
    policy: RetrievalPolicy,
    state: LoopState,
}

impl<D: CameraDevice> AcquisitionLoop<D> {
    /// Assemble a loop around an opened and configured camera.
    ///
    /// * `camera`: controller owning the device.
    /// * `storage`: session storage below the configured root.
    /// * `publisher`: publisher for the registered output channel.
    /// * `bus`: bus whose liveness gates the loop.
    /// * `cancel`: stop request from the lifecycle controller.
    pub fn new(
        camera: CameraController<D>,
        storage: SessionStorage,
        publisher: MetadataPublisher,
        bus: Arc<dyn Bus>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            camera,
            storage,
            publisher,
            bus,
            cancel,
            timeout: DEFAULT_RETRIEVAL_TIMEOUT,
            policy: RetrievalPolicy::default(),
            state: LoopState::Idle,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_policy(mut self, policy: RetrievalPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Run until stopped or failed. The camera is stopped and closed
    /// before this returns, whatever the outcome.
    pub fn run(mut self) -> AcquisitionReport {
        let span = info_span!("acquisition", camera = %self.camera.uuid());
        let _enter = span.enter();

        let mut frames = 0;
        let mut session = None;
        let result = self
            .begin()
            .and_then(|started| self.acquire(session.insert(started), &mut frames));

        if let Err(e) = self.camera.close() {
            warn!("failed to release camera: {e}");
        }
        self.state = LoopState::Stopped;

        let exit = match result {
            Ok(()) => {
                info!(frames, "acquisition drained");
                LoopExit::Drained
            }
            Err(e) => {
                warn!(frames, "acquisition stopped: {e}");
                LoopExit::Failed(e)
            }
        };
        AcquisitionReport {
            session,
            frames,
            state: self.state,
            exit,
        }
    }

    /// `Idle -> Running`: session folder, settings snapshot, grabbing.
    fn begin(&mut self) -> DriverResult<Session> {
        let session = self.storage.create_session()?;
        self.storage.save_settings_snapshot(&session, &self.camera)?;
        self.camera.start_grabbing()?;
        self.state = LoopState::Running;
        Ok(session)
    }

    /// A stop was asked for, through the token or the bus.
    fn stop_requested(&self) -> bool {
        self.cancel.is_cancelled() || !self.bus.is_alive()
    }

    /// Sleep between retries, cut short by a stop request.
    fn back_off(&self, backoff: Duration) {
        // An unrepresentable deadline means waiting for the stop.
        let deadline = Instant::now().checked_add(backoff);
        loop {
            let remaining = deadline.map_or(LIVENESS_POLL, |deadline| {
                deadline.saturating_duration_since(Instant::now())
            });
            if remaining.is_zero() || self.stop_requested() {
                return;
            }
            self.cancel.wait_timeout(remaining.min(LIVENESS_POLL));
        }
    }

    fn acquire(&mut self, session: &Session, frames: &mut u64) -> DriverResult<()> {
        let mut failures = 0;
        while self.state == LoopState::Running {
            if self.stop_requested() {
                self.state = LoopState::Draining;
                debug!("stop observed, draining");
                break;
            }

            let missed = match self.camera.retrieve_frame(self.timeout) {
                Retrieval::Frame(buffer) => {
                    failures = 0;
                    let frame = self.storage.save_frame(session, &*buffer)?;
                    self.publisher.publish(&frame)?;
                    *frames += 1;
                    debug!(
                        name = %frame.name,
                        exposure = frame.exposure_us,
                        gain = frame.gain,
                        "frame saved"
                    );
                    continue;
                }
                Retrieval::Timeout => {
                    let timeout_ms = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX);
                    DriverError::RetrievalTimeout { timeout_ms }
                }
                Retrieval::Failed(reason) => DriverError::RetrievalFailed(reason),
            };

            // A stop that landed during the retrieval explains the missing
            // frame, drain instead of failing.
            if self.stop_requested() {
                debug!("stop observed during retrieval: {missed}");
                continue;
            }
            let backoff = self.policy.on_failure(&mut failures, missed)?;
            self.back_off(backoff);
        }
        Ok(())
    }
}
