//! Fake device, enumerator and bus used to drive the acquisition code
//! without hardware.

use crate::{
    components::acquisition::storage::Clock,
    devices::{
        hardware::camera::{
            CameraDevice, DeviceEnumerator, DeviceInfo, GrabBuffer, Readings, Retrieval,
        },
        software::bus::{Bus, BusError},
    },
    errors::CameraError,
    utils::image::{raw_to_image, PixelLayout},
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use image::DynamicImage;
use std::{
    collections::VecDeque,
    net::Ipv4Addr,
    path::Path,
    str::FromStr,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

/// What the fake device does on one retrieval.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Step {
    /// Hand out a filled buffer.
    Frame,
    /// Block for the timeout, then report nothing.
    Timeout,
    /// Report a failed grab immediately.
    Fail,
}

/// Shared counters observed by the tests.
#[derive(Default)]
struct ProbeState {
    acquired: AtomicUsize,
    released: AtomicUsize,
    start_calls: AtomicUsize,
    stop_calls: AtomicUsize,
    close_calls: AtomicUsize,
    retrievals: AtomicUsize,
    retrievals_while_idle: AtomicUsize,
    auto_exposure: AtomicBool,
    auto_gain: AtomicBool,
    grabbing: AtomicBool,
}

/// Cloneable view onto what happened to the fake device.
#[derive(Clone, Default)]
pub struct FakeProbe(Arc<ProbeState>);

impl FakeProbe {
    pub fn acquired(&self) -> usize {
        self.0.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.0.released.load(Ordering::SeqCst)
    }

    pub fn start_calls(&self) -> usize {
        self.0.start_calls.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> usize {
        self.0.stop_calls.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.0.close_calls.load(Ordering::SeqCst)
    }

    pub fn retrievals(&self) -> usize {
        self.0.retrievals.load(Ordering::SeqCst)
    }

    /// Retrievals that reached the device while it was not grabbing.
    pub fn retrievals_while_idle(&self) -> usize {
        self.0.retrievals_while_idle.load(Ordering::SeqCst)
    }

    pub fn auto_exposure(&self) -> bool {
        self.0.auto_exposure.load(Ordering::SeqCst)
    }

    pub fn auto_gain(&self) -> bool {
        self.0.auto_gain.load(Ordering::SeqCst)
    }
}

type Hook = Arc<dyn Fn() + Send + Sync>;

/// Enumerator over a fixed list of fake network cameras. Every device it
/// opens plays the same script of retrieval steps.
pub struct FakeEnumerator {
    devices: Vec<DeviceInfo>,
    script: Vec<Step>,
    on_script_end: Option<Hook>,
    fail_open: bool,
    fail_conversion: bool,
    probe: FakeProbe,
}

impl FakeEnumerator {
    /// Devices with the given addresses and an empty script.
    pub fn with_addresses(addresses: &[&str]) -> Self {
        let devices = addresses
            .iter()
            .enumerate()
            .map(|(idx, address)| DeviceInfo {
                id: format!("fake-{idx}"),
                model: "Fake GigE".to_string(),
                address: Ipv4Addr::from_str(address).ok(),
            })
            .collect();
        Self {
            devices,
            script: Vec::new(),
            on_script_end: None,
            fail_open: false,
            fail_conversion: false,
            probe: FakeProbe::default(),
        }
    }

    /// Yield `count` frames before the script runs out.
    pub fn with_frames(mut self, count: usize) -> Self {
        self.script = vec![Step::Frame; count];
        self
    }

    pub fn with_script(mut self, script: Vec<Step>) -> Self {
        self.script = script;
        self
    }

    /// Run `hook` when the last scripted step is handed out.
    pub fn on_script_end(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_script_end = Some(Arc::new(hook));
        self
    }

    pub fn failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    /// Buffers cannot be decoded, so saving them fails.
    pub fn failing_conversion(mut self) -> Self {
        self.fail_conversion = true;
        self
    }

    pub fn probe(&self) -> FakeProbe {
        self.probe.clone()
    }
}

impl DeviceEnumerator for FakeEnumerator {
    type Device = FakeDevice;

    fn enumerate(&self) -> Result<Vec<DeviceInfo>, CameraError> {
        Ok(self.devices.clone())
    }

    fn open(&self, info: &DeviceInfo) -> Result<Self::Device, CameraError> {
        if self.fail_open {
            return Err(CameraError::Open {
                id: info.id.clone(),
                reason: "link down".to_string(),
            });
        }
        Ok(FakeDevice {
            script: self.script.iter().copied().collect(),
            on_script_end: self.on_script_end.clone(),
            fail_conversion: self.fail_conversion,
            sequence: 0,
            probe: self.probe.clone(),
        })
    }
}

/// Device that plays back a script of retrieval steps. Once the script is
/// exhausted every retrieval times out.
pub struct FakeDevice {
    script: VecDeque<Step>,
    on_script_end: Option<Hook>,
    fail_conversion: bool,
    sequence: u32,
    probe: FakeProbe,
}

impl FakeDevice {
    const WIDTH: u32 = 8;
    const HEIGHT: u32 = 4;
}

impl CameraDevice for FakeDevice {
    type Buffer = FakeBuffer;

    fn set_exposure_auto_continuous(&mut self) -> Result<(), CameraError> {
        self.probe.0.auto_exposure.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn set_gain_auto_continuous(&mut self) -> Result<(), CameraError> {
        self.probe.0.auto_gain.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn save_features(&self, path: &Path) -> Result<(), CameraError> {
        std::fs::write(
            path,
            "# Fake GigE feature dump\nExposureAuto\tContinuous\nGainAuto\tContinuous\n",
        )?;
        Ok(())
    }

    fn start_grabbing(&mut self) -> Result<(), CameraError> {
        self.probe.0.start_calls.fetch_add(1, Ordering::SeqCst);
        self.probe.0.grabbing.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop_grabbing(&mut self) -> Result<(), CameraError> {
        self.probe.0.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.probe.0.grabbing.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn retrieve(&mut self, timeout: Duration) -> Retrieval<Self::Buffer> {
        let probe = &self.probe.0;
        probe.retrievals.fetch_add(1, Ordering::SeqCst);
        if !probe.grabbing.load(Ordering::SeqCst) {
            probe.retrievals_while_idle.fetch_add(1, Ordering::SeqCst);
        }

        let step = self.script.pop_front();
        if step.is_some() && self.script.is_empty() {
            if let Some(hook) = &self.on_script_end {
                hook();
            }
        }

        match step.unwrap_or(Step::Timeout) {
            Step::Frame => {
                probe.acquired.fetch_add(1, Ordering::SeqCst);
                self.sequence += 1;
                Retrieval::Frame(FakeBuffer {
                    data: vec![(self.sequence % 255) as u8; (Self::WIDTH * Self::HEIGHT) as usize],
                    readings: Readings {
                        exposure_us: 1000.0 + f64::from(self.sequence) * 12.5,
                        gain: i64::from(self.sequence),
                    },
                    fail_conversion: self.fail_conversion,
                })
            }
            Step::Timeout => {
                std::thread::sleep(timeout);
                Retrieval::Timeout
            }
            Step::Fail => Retrieval::Failed("incomplete frame".to_string()),
        }
    }

    fn release(&mut self, _buffer: &mut Self::Buffer) {
        self.probe.0.released.fetch_add(1, Ordering::SeqCst);
    }

    fn close(&mut self) -> Result<(), CameraError> {
        self.probe.0.close_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Mono8 buffer filled by [`FakeDevice`].
#[derive(Debug)]
pub struct FakeBuffer {
    data: Vec<u8>,
    readings: Readings,
    fail_conversion: bool,
}

impl GrabBuffer for FakeBuffer {
    fn to_image(&self) -> Result<DynamicImage, CameraError> {
        if self.fail_conversion {
            return Err(CameraError::Conversion("corrupt payload".to_string()));
        }
        raw_to_image(FakeDevice::WIDTH, FakeDevice::HEIGHT, PixelLayout::Mono8, &self.data)
    }

    fn readings(&self) -> Readings {
        self.readings
    }
}

/// Bus that accepts registration but refuses every publish.
#[derive(Default)]
pub struct RefusingBus {
    alive: AtomicBool,
    attempts: Mutex<Vec<String>>,
}

impl RefusingBus {
    pub fn new() -> Self {
        Self {
            alive: AtomicBool::new(true),
            attempts: Mutex::new(Vec::new()),
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.lock().map(|a| a.len()).unwrap_or_default()
    }
}

impl Bus for RefusingBus {
    fn register(&self, _channel: &str) {}

    fn publish(&self, _channel: &str, payload: String) -> Result<(), BusError> {
        if let Ok(mut attempts) = self.attempts.lock() {
            attempts.push(payload);
        }
        Err(BusError::Disconnected)
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn shutdown(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

/// Clock that starts at a fixed instant and advances by `step` on every
/// reading.
pub struct StepClock {
    next: Mutex<DateTime<Utc>>,
    step: ChronoDuration,
}

impl StepClock {
    pub fn new(start: DateTime<Utc>, step: ChronoDuration) -> Self {
        Self {
            next: Mutex::new(start),
            step,
        }
    }
}

impl Clock for StepClock {
    fn now(&self) -> DateTime<Utc> {
        let mut next = self.next.lock().unwrap();
        let now = *next;
        *next = now + self.step;
        now
    }
}
