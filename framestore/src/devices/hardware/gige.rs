use crate::{
    devices::hardware::camera::{
        CameraDevice, DeviceEnumerator, DeviceInfo, GrabBuffer, Readings, Retrieval,
    },
    errors::CameraError,
};
use aravis::{
    Aravis, Buffer, BufferStatus, Camera, CameraExt, CameraExtManual, PixelFormat, Stream,
    StreamExt,
};
use image::DynamicImage;
use serde::Serialize;
use std::{fmt::Display, fs::File, net::Ipv4Addr, path::Path, time::Duration};
use tracing::{debug, warn};

/// Number of buffers queued on the stream while grabbing.
const STREAM_BUFFERS: usize = 4;

/// Helper to turn a driver error into a feature error.
fn feature<E: Display>(name: &'static str) -> impl FnOnce(E) -> CameraError {
    move |e| CameraError::Feature {
        feature: name.to_string(),
        reason: e.to_string(),
    }
}

/// Only GigE Vision devices have a network address worth matching against,
/// USB3 ones report their bus location.
fn device_info(id: &str, model: &str, protocol: &str, address: &str) -> DeviceInfo {
    let address = if protocol.contains("GigE") {
        address.parse::<Ipv4Addr>().ok()
    } else {
        None
    };
    DeviceInfo {
        id: id.to_string(),
        model: model.to_string(),
        address,
    }
}

/// Device discovery through aravis. Keep the enumerator alive for as long
/// as cameras opened from it are in use, it holds the library handle.
pub struct GigeEnumerator {
    aravis: Aravis,
}

impl GigeEnumerator {
    pub fn new() -> Result<Self, CameraError> {
        let aravis = Aravis::initialize().map_err(|e| CameraError::Enumeration(e.to_string()))?;
        Ok(Self { aravis })
    }
}

impl DeviceEnumerator for GigeEnumerator {
    type Device = GigeCamera;

    fn enumerate(&self) -> Result<Vec<DeviceInfo>, CameraError> {
        let devices = self
            .aravis
            .get_device_list()
            .into_iter()
            .map(|dev| {
                device_info(
                    &dev.id.to_string_lossy(),
                    &format!("{} {}", dev.vendor.to_string_lossy(), dev.model.to_string_lossy()),
                    &dev.protocol.to_string_lossy(),
                    &dev.address.to_string_lossy(),
                )
            })
            .collect();
        Ok(devices)
    }

    fn open(&self, info: &DeviceInfo) -> Result<Self::Device, CameraError> {
        let camera = Camera::new(Some(info.id.as_str())).map_err(|e| CameraError::Open {
            id: info.id.clone(),
            reason: e.to_string(),
        })?;
        Ok(GigeCamera {
            camera,
            stream: None,
            layout: None,
        })
    }
}

/// Settings snapshot written at the start of every session. Aravis has no
/// feature persistence file of its own, so the values that matter for
/// reading the images back are dumped as YAML.
#[derive(Serialize)]
struct FeatureSnapshot {
    vendor: String,
    model: String,
    serial: String,
    pixel_format: String,
    region: (i32, i32, i32, i32),
    frame_rate: f64,
    exposure_time_us: f64,
    gain: f64,
}

/// Pixel format and size of the buffers allocated for the stream.
#[derive(Copy, Clone)]
struct BufferLayout {
    pixel_format: PixelFormat,
    width: usize,
    height: usize,
}

impl BufferLayout {
    fn build(self) -> Buffer {
        Buffer::new_leaked_image(self.pixel_format, self.width, self.height)
    }
}

/// A GigE Vision camera driven through aravis.
pub struct GigeCamera {
    camera: Camera,
    stream: Option<Stream>,
    layout: Option<BufferLayout>,
}

impl GigeCamera {
    fn readings(&self) -> Result<Readings, CameraError> {
        let exposure_us = self.camera.exposure_time().map_err(feature("ExposureTime"))?;
        let gain = self.camera.gain().map_err(feature("Gain"))?;
        Readings::from_device(exposure_us, gain)
    }

    fn buffer_layout(&self) -> Result<BufferLayout, CameraError> {
        let (_, _, w, h) = self.camera.region().map_err(feature("Region"))?;
        let pixel_format = self.camera.pixel_format().map_err(feature("PixelFormat"))?;
        let size = |v: i32| usize::try_from(v).map_err(feature("Region"));
        Ok(BufferLayout {
            pixel_format,
            width: size(w)?,
            height: size(h)?,
        })
    }
}

impl CameraDevice for GigeCamera {
    type Buffer = GigeBuffer;

    fn set_exposure_auto_continuous(&mut self) -> Result<(), CameraError> {
        self.camera
            .set_exposure_time_auto(aravis::Auto::Continuous)
            .map_err(feature("ExposureAuto"))
    }

    fn set_gain_auto_continuous(&mut self) -> Result<(), CameraError> {
        self.camera
            .set_gain_auto(aravis::Auto::Continuous)
            .map_err(feature("GainAuto"))
    }

    fn save_features(&self, path: &Path) -> Result<(), CameraError> {
        let cam = &self.camera;
        let snapshot = FeatureSnapshot {
            vendor: cam.vendor_name().map_err(feature("DeviceVendorName"))?.to_string(),
            model: cam.model_name().map_err(feature("DeviceModelName"))?.to_string(),
            serial: cam
                .device_serial_number()
                .map_err(feature("DeviceSerialNumber"))?
                .to_string(),
            pixel_format: cam
                .pixel_format_as_string()
                .map_err(feature("PixelFormat"))?
                .to_string(),
            region: cam.region().map_err(feature("Region"))?,
            frame_rate: cam.frame_rate().map_err(feature("AcquisitionFrameRate"))?,
            exposure_time_us: cam.exposure_time().map_err(feature("ExposureTime"))?,
            gain: cam.gain().map_err(feature("Gain"))?,
        };
        let file = File::create(path)?;
        serde_yaml::to_writer(file, &snapshot).map_err(|e| CameraError::Io(std::io::Error::other(e)))
    }

    fn start_grabbing(&mut self) -> Result<(), CameraError> {
        let layout = self.buffer_layout()?;
        let stream = self.camera.create_stream().map_err(feature("Stream"))?;
        for _ in 0..STREAM_BUFFERS {
            stream.push_buffer(&layout.build());
        }
        self.camera
            .start_acquisition()
            .map_err(feature("AcquisitionStart"))?;
        debug!(width = layout.width, height = layout.height, "stream started");
        self.stream = Some(stream);
        self.layout = Some(layout);
        Ok(())
    }

    fn stop_grabbing(&mut self) -> Result<(), CameraError> {
        let stopped = self
            .camera
            .stop_acquisition()
            .map_err(feature("AcquisitionStop"));
        self.stream = None;
        stopped
    }

    fn retrieve(&mut self, timeout: Duration) -> Retrieval<Self::Buffer> {
        let Some(stream) = &self.stream else {
            return Retrieval::Failed("stream not started".to_string());
        };
        let timeout_us = u64::try_from(timeout.as_micros()).unwrap_or(u64::MAX);
        let Some(buffer) = stream.timeout_pop_buffer(timeout_us) else {
            return Retrieval::Timeout;
        };

        if buffer.status() != BufferStatus::Success {
            let reason = format!("buffer status {:?}", buffer.status());
            stream.push_buffer(&buffer);
            return Retrieval::Failed(reason);
        }

        let readings = match self.readings() {
            Ok(readings) => readings,
            Err(e) => {
                warn!("dropping frame without usable readings: {e}");
                stream.push_buffer(&buffer);
                return Retrieval::Failed(e.to_string());
            }
        };
        // SAFETY: every buffer on the stream was built by
        // `Buffer::new_leaked_image`, as `into_image` requires.
        #[allow(unsafe_code)]
        let image = unsafe { buffer.into_image() }.map_err(|_| "unsupported pixel format".to_string());
        Retrieval::Frame(GigeBuffer { image, readings })
    }

    fn release(&mut self, _buffer: &mut Self::Buffer) {
        // The grabbed buffer was consumed by the image conversion, queue a
        // fresh one in its place.
        if let (Some(stream), Some(layout)) = (&self.stream, self.layout) {
            stream.push_buffer(&layout.build());
        }
    }

    fn close(&mut self) -> Result<(), CameraError> {
        self.stream = None;
        self.layout = None;
        Ok(())
    }
}

/// One grabbed frame from a [`GigeCamera`].
pub struct GigeBuffer {
    image: Result<DynamicImage, String>,
    readings: Readings,
}

impl GrabBuffer for GigeBuffer {
    fn to_image(&self) -> Result<DynamicImage, CameraError> {
        self.image.clone().map_err(CameraError::Conversion)
    }

    fn readings(&self) -> Readings {
        self.readings
    }
}
