use crate::errors::{CameraError, DriverError, DriverResult};
use image::DynamicImage;
use std::{fmt::Display, net::Ipv4Addr, ops::Deref, path::Path, time::Duration};
use strum_macros::{Display as StrumDisplay, IntoStaticStr};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Identification of a device as reported by the enumerator. Only network
/// (GigE) devices carry an address; USB devices are reachable as the first
/// device only.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Driver specific identifier used to open the device.
    pub id: String,
    /// Vendor model string, used for logging.
    pub model: String,
    /// Network address of the device.
    pub address: Option<Ipv4Addr>,
}

impl Display for DeviceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.address {
            Some(address) => write!(f, "{} ({}) @ {}", self.model, self.id, address),
            None => write!(f, "{} ({})", self.model, self.id),
        }
    }
}

/// Acquisition parameters the device applied to a single grab. With auto
/// exposure and auto gain running these change frame to frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Readings {
    /// Exposure time in microseconds.
    pub exposure_us: f64,
    /// Raw gain value.
    pub gain: i64,
}

impl Readings {
    /// Build readings from the values a device reports. Gain is rounded to
    /// the nearest integer. Values that are not finite are rejected rather
    /// than published.
    pub fn from_device(exposure_us: f64, gain: f64) -> Result<Self, CameraError> {
        if !exposure_us.is_finite() || exposure_us < 0.0 {
            return Err(CameraError::Feature {
                feature: "ExposureTime".to_string(),
                reason: format!("unusable reading {exposure_us}"),
            });
        }
        if !gain.is_finite() || gain.abs() >= i64::MAX as f64 {
            return Err(CameraError::Feature {
                feature: "Gain".to_string(),
                reason: format!("unusable reading {gain}"),
            });
        }
        #[allow(clippy::cast_possible_truncation)]
        let gain = gain.round() as i64;
        Ok(Self { exposure_us, gain })
    }
}

/// A device owned buffer holding one captured image.
pub trait GrabBuffer {
    /// Decode the buffer contents into an image that can be written to disk.
    fn to_image(&self) -> Result<DynamicImage, CameraError>;

    /// Exposure and gain in effect when the buffer was filled.
    fn readings(&self) -> Readings;
}

/// Outcome of a single blocking retrieval. Timeouts and device failures
/// are ordinary values so the acquisition loop can branch on them.
#[derive(Debug)]
pub enum Retrieval<B> {
    /// A filled buffer.
    Frame(B),
    /// Nothing arrived within the timeout.
    Timeout,
    /// The device reported a failed grab.
    Failed(String),
}

/// Configuration level access to one imaging device. The methods map onto
/// what the vendor SDKs expose; anything below this (transport, exposure
/// algorithms) belongs to the driver.
///
/// Implementations are not assumed to be reentrant: a device is driven from
/// one thread at a time.
pub trait CameraDevice: Send + 'static {
    /// Buffer type handed out by `retrieve`.
    type Buffer: GrabBuffer;

    /// Run exposure continuously in automatic mode.
    fn set_exposure_auto_continuous(&mut self) -> Result<(), CameraError>;

    /// Run gain continuously in automatic mode.
    fn set_gain_auto_continuous(&mut self) -> Result<(), CameraError>;

    /// Persist the complete feature state of the device to `path`.
    fn save_features(&self, path: &Path) -> Result<(), CameraError>;

    fn start_grabbing(&mut self) -> Result<(), CameraError>;

    fn stop_grabbing(&mut self) -> Result<(), CameraError>;

    /// Block for at most `timeout` waiting on the next filled buffer.
    fn retrieve(&mut self, timeout: Duration) -> Retrieval<Self::Buffer>;

    /// Hand the memory behind `buffer` back to the driver so it can be
    /// filled again.
    fn release(&mut self, buffer: &mut Self::Buffer);

    fn close(&mut self) -> Result<(), CameraError>;
}

/// Capability to discover devices and open one of them. Passed in rather
/// than reached through a process wide SDK factory, so tests can supply
/// their own device list.
pub trait DeviceEnumerator {
    /// Device type opened by this enumerator.
    type Device: CameraDevice;

    /// List the devices currently visible to the driver.
    fn enumerate(&self) -> Result<Vec<DeviceInfo>, CameraError>;

    /// Open the physical connection to `info`.
    fn open(&self, info: &DeviceInfo) -> Result<Self::Device, CameraError>;
}

/// Grab state of a controlled device.
#[derive(StrumDisplay, IntoStaticStr, Copy, Clone, Debug, PartialEq, Eq)]
pub enum GrabState {
    /// Opened and configured, not grabbing yet.
    Idle,
    /// Buffers are being filled.
    Grabbing,
    /// Grabbing stopped, handle still open.
    Stopped,
    /// Handle released.
    Closed,
}

/// Scoped ownership of one grab buffer. Dropping the guard returns the
/// buffer to the driver, whichever way the iteration using it ends.
pub struct GrabGuard<'a, D: CameraDevice> {
    device: &'a mut D,
    buffer: D::Buffer,
}

impl<D: CameraDevice> Deref for GrabGuard<'_, D> {
    type Target = D::Buffer;

    fn deref(&self) -> &Self::Target {
        &self.buffer
    }
}

impl<D: CameraDevice> Drop for GrabGuard<'_, D> {
    fn drop(&mut self) {
        self.device.release(&mut self.buffer);
    }
}

/// Owner of the device handle for one acquisition run. The controller tracks
/// the grab state so the device is only ever asked for transitions it can
/// make, and closes the handle exactly once (on `close` or on drop).
pub struct CameraController<D: CameraDevice> {
    /// Access to the backend driver.
    device: D,
    /// What the device was opened from.
    info: DeviceInfo,
    /// Unique identifier, used to tie log lines to a controller.
    uuid: Uuid,
    state: GrabState,
}

impl<D: CameraDevice> CameraController<D> {
    /// Resolve and open a device.
    ///
    /// Without an address the first enumerated device is opened. With an
    /// address only a device reporting that exact network address is
    /// accepted.
    ///
    /// * `address`: optional network address of the device.
    /// * `enumerator`: driver capability used to list and open devices.
    pub fn open<E>(address: Option<Ipv4Addr>, enumerator: &E) -> DriverResult<Self>
    where
        E: DeviceEnumerator<Device = D>,
    {
        let devices = enumerator
            .enumerate()
            .map_err(DriverError::DeviceUnavailable)?;
        debug!(count = devices.len(), "enumerated devices");

        let info = match address {
            None => devices.into_iter().next().ok_or(DriverError::NoDevices)?,
            Some(address) => devices
                .into_iter()
                .find(|dev| dev.address == Some(address))
                .ok_or(DriverError::DeviceNotFound { address })?,
        };

        let device = enumerator
            .open(&info)
            .map_err(DriverError::DeviceUnavailable)?;

        let uuid = Uuid::new_v4();
        info!(%uuid, device = %info, "opened camera");
        Ok(Self {
            device,
            info,
            uuid,
            state: GrabState::Idle,
        })
    }

    /// Put exposure and gain into continuous automatic mode.
    pub fn configure(&mut self) -> DriverResult<()> {
        self.device
            .set_exposure_auto_continuous()
            .map_err(DriverError::Device)?;
        self.device
            .set_gain_auto_continuous()
            .map_err(DriverError::Device)?;
        debug!(uuid = %self.uuid, "exposure and gain set to continuous auto");
        Ok(())
    }

    /// Write the device feature state to `path`.
    pub fn save_features(&self, path: &Path) -> DriverResult<()> {
        self.device
            .save_features(path)
            .map_err(|e| DriverError::storage(path, e))
    }

    /// Move from `Idle` to `Grabbing`.
    pub fn start_grabbing(&mut self) -> DriverResult<()> {
        if self.state != GrabState::Idle {
            return Err(DriverError::Device(CameraError::Feature {
                feature: "AcquisitionStart".to_string(),
                reason: format!("cannot start grabbing while {}", self.state),
            }));
        }
        self.device.start_grabbing().map_err(DriverError::Device)?;
        self.state = GrabState::Grabbing;
        info!(uuid = %self.uuid, "grabbing started");
        Ok(())
    }

    /// Move from `Grabbing` to `Stopped`. A no-op in any other state.
    ///
    /// Must not race an in-flight [`Self::retrieve_frame`]; the borrow on
    /// `&mut self` makes that hold for a single owner.
    pub fn stop_grabbing(&mut self) -> DriverResult<()> {
        if self.state != GrabState::Grabbing {
            return Ok(());
        }
        self.state = GrabState::Stopped;
        self.device.stop_grabbing().map_err(DriverError::Device)?;
        info!(uuid = %self.uuid, "grabbing stopped");
        Ok(())
    }

    /// Block up to `timeout` for the next frame. Outside of `Grabbing` no
    /// call reaches the device.
    pub fn retrieve_frame(&mut self, timeout: Duration) -> Retrieval<GrabGuard<'_, D>> {
        if self.state != GrabState::Grabbing {
            return Retrieval::Failed(format!("device is {}", self.state));
        }
        match self.device.retrieve(timeout) {
            Retrieval::Frame(buffer) => Retrieval::Frame(GrabGuard {
                device: &mut self.device,
                buffer,
            }),
            Retrieval::Timeout => Retrieval::Timeout,
            Retrieval::Failed(reason) => Retrieval::Failed(reason),
        }
    }

    /// Release the device handle, stopping grabbing first if needed. Calling
    /// it again after a successful close does nothing.
    pub fn close(&mut self) -> DriverResult<()> {
        if self.state == GrabState::Closed {
            return Ok(());
        }
        let stopped = self.stop_grabbing();
        self.state = GrabState::Closed;
        self.device.close().map_err(DriverError::Device)?;
        info!(uuid = %self.uuid, "camera closed");
        stopped
    }

    pub fn state(&self) -> GrabState {
        self.state
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }
}

impl<D: CameraDevice> Drop for CameraController<D> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(uuid = %self.uuid, "failed to close camera on drop: {e}");
        }
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::devices::mock::{FakeEnumerator, FakeProbe};
    use rstest::rstest;
    use std::str::FromStr;

    fn addr(ip: &str) -> Ipv4Addr {
        Ipv4Addr::from_str(ip).expect("Failed to create address")
    }

    #[rstest]
    #[case(1250.0, 11.6, 12)]
    #[case(0.0, -2.4, -2)]
    fn test_readings_from_device(#[case] exposure: f64, #[case] gain: f64, #[case] expected: i64) {
        let readings = Readings::from_device(exposure, gain).unwrap();
        assert_eq!(readings.exposure_us, exposure);
        assert_eq!(readings.gain, expected);
    }

    #[rstest]
    #[case(f64::NAN, 1.0)]
    #[case(f64::INFINITY, 1.0)]
    #[case(-5.0, 1.0)]
    #[case(100.0, f64::NAN)]
    #[case(100.0, f64::NEG_INFINITY)]
    fn test_unusable_readings_rejected(#[case] exposure: f64, #[case] gain: f64) {
        assert!(matches!(
            Readings::from_device(exposure, gain),
            Err(CameraError::Feature { .. })
        ));
    }

    #[test]
    fn test_open_without_address_picks_first_device() {
        let enumerator = FakeEnumerator::with_addresses(&["10.0.0.4", "10.0.0.5"]);
        let controller = CameraController::open(None, &enumerator).unwrap();
        assert_eq!(controller.info().address, Some(addr("10.0.0.4")));
        assert_eq!(controller.state(), GrabState::Idle);
    }

    #[rstest]
    #[case("10.0.0.5")]
    #[case("10.0.0.6")]
    fn test_open_with_address_matches_device(#[case] ip: &str) {
        let enumerator = FakeEnumerator::with_addresses(&["10.0.0.4", "10.0.0.5", "10.0.0.6"]);
        let controller = CameraController::open(Some(addr(ip)), &enumerator).unwrap();
        assert_eq!(controller.info().address, Some(addr(ip)));
    }

    #[test]
    fn test_open_with_unknown_address_fails() {
        let enumerator = FakeEnumerator::with_addresses(&["10.0.0.4"]);
        let result = CameraController::open(Some(addr("10.0.0.9")), &enumerator);
        assert!(matches!(
            result,
            Err(DriverError::DeviceNotFound { address }) if address == addr("10.0.0.9")
        ));
    }

    #[test]
    fn test_open_with_empty_device_list_fails() {
        let enumerator = FakeEnumerator::with_addresses(&[]);
        let result = CameraController::open(None, &enumerator);
        assert!(matches!(result, Err(DriverError::NoDevices)));
    }

    #[test]
    fn test_open_failure_is_device_unavailable() {
        let enumerator = FakeEnumerator::with_addresses(&["10.0.0.4"]).failing_open();
        let result = CameraController::open(None, &enumerator);
        assert!(matches!(result, Err(DriverError::DeviceUnavailable(_))));
    }

    #[test]
    fn test_configure_sets_auto_modes() {
        let enumerator = FakeEnumerator::with_addresses(&["10.0.0.4"]);
        let probe = enumerator.probe();
        let mut controller = CameraController::open(None, &enumerator).unwrap();
        controller.configure().unwrap();
        assert!(probe.auto_exposure());
        assert!(probe.auto_gain());
    }

    #[test]
    fn test_grab_state_transitions() {
        let enumerator = FakeEnumerator::with_addresses(&["10.0.0.4"]).with_frames(1);
        let mut controller = CameraController::open(None, &enumerator).unwrap();

        assert!(matches!(
            controller.retrieve_frame(Duration::from_millis(10)),
            Retrieval::Failed(_)
        ));

        controller.start_grabbing().unwrap();
        assert_eq!(controller.state(), GrabState::Grabbing);
        assert!(controller.start_grabbing().is_err());

        controller.stop_grabbing().unwrap();
        assert_eq!(controller.state(), GrabState::Stopped);
        assert!(matches!(
            controller.retrieve_frame(Duration::from_millis(10)),
            Retrieval::Failed(_)
        ));
    }

    #[test]
    fn test_guard_releases_buffer_on_drop() {
        let enumerator = FakeEnumerator::with_addresses(&["10.0.0.4"]).with_frames(2);
        let probe: FakeProbe = enumerator.probe();
        let mut controller = CameraController::open(None, &enumerator).unwrap();
        controller.start_grabbing().unwrap();

        for _ in 0..2 {
            match controller.retrieve_frame(Duration::from_millis(10)) {
                Retrieval::Frame(guard) => assert!(guard.readings().exposure_us > 0.0),
                Retrieval::Timeout => panic!("expected a frame, got a timeout"),
                Retrieval::Failed(reason) => panic!("expected a frame, got {reason}"),
            }
        }
        assert_eq!(probe.acquired(), 2);
        assert_eq!(probe.released(), 2);
    }

    #[test]
    fn test_close_is_idempotent() {
        let enumerator = FakeEnumerator::with_addresses(&["10.0.0.4"]);
        let probe = enumerator.probe();
        let mut controller = CameraController::open(None, &enumerator).unwrap();
        controller.start_grabbing().unwrap();

        controller.close().unwrap();
        controller.close().unwrap();
        drop(controller);

        assert_eq!(probe.stop_calls(), 1);
        assert_eq!(probe.close_calls(), 1);
    }

    #[test]
    fn test_drop_closes_device() {
        let enumerator = FakeEnumerator::with_addresses(&["10.0.0.4"]);
        let probe = enumerator.probe();
        let controller = CameraController::open(None, &enumerator).unwrap();
        drop(controller);
        assert_eq!(probe.close_calls(), 1);
    }
}
