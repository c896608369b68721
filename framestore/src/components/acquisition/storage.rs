use crate::{
    devices::hardware::camera::{CameraController, CameraDevice, GrabBuffer},
    errors::{DriverError, DriverResult},
};
use chrono::{DateTime, Duration as ChronoDuration, Timelike, Utc};
use image::ImageFormat;
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{debug, info};

/// Name of the feature snapshot written into every session folder.
pub const SETTINGS_FILE: &str = "settings.pfs";

/// Source of wall clock time for folder and file names.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The system clock.
#[derive(Copy, Clone, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Storage scope of one acquisition run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Session {
    /// `set_<epoch seconds>` of the moment the run started.
    folder_name: String,
    /// Absolute or relative location of the folder on disk.
    dir: PathBuf,
    started_at: DateTime<Utc>,
}

impl Session {
    pub fn folder_name(&self) -> &str {
        &self.folder_name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn settings_path(&self) -> PathBuf {
        self.dir.join(SETTINGS_FILE)
    }
}

/// A frame that has been written to disk.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    /// `<session folder>/<name>`, relative to the storage root.
    pub path: String,
    /// File name, `picture_<epoch seconds with fraction>.tiff`.
    pub name: String,
    /// Exposure in microseconds the device reported for this grab.
    pub exposure_us: f64,
    /// Gain the device reported for this grab.
    pub gain: i64,
    /// Time the file name was derived from.
    pub captured_at: DateTime<Utc>,
}

/// Owns the on-disk layout of acquisition runs below one root directory:
///
/// ```text
/// <root>/set_<epochSeconds>/settings.pfs
/// <root>/set_<epochSeconds>/picture_<epochSeconds>.<micros>.tiff
/// ```
pub struct SessionStorage {
    root: PathBuf,
    clock: Arc<dyn Clock>,
    /// Timestamp used for the previous frame name, names never repeat.
    last_stamp: Option<DateTime<Utc>>,
}

impl SessionStorage {
    /// * `root`: directory the session folders are created in.
    /// * `clock`: time source for folder and file names.
    pub fn new(root: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            root: root.into(),
            clock,
            last_stamp: None,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the folder for a new run. The folder must not exist yet, an
    /// existing folder from the same second is an error rather than reused.
    pub fn create_session(&self) -> DriverResult<Session> {
        let started_at = self.clock.now();
        let folder_name = format!("set_{}", started_at.timestamp());
        let dir = self.root.join(&folder_name);

        fs::create_dir(&dir).map_err(|e| DriverError::storage(&dir, e))?;
        info!(dir = %dir.display(), "created session");
        Ok(Session {
            folder_name,
            dir,
            started_at,
        })
    }

    /// Write the device feature state into the session, once per run and
    /// before grabbing starts.
    pub fn save_settings_snapshot<D: CameraDevice>(
        &self,
        session: &Session,
        camera: &CameraController<D>,
    ) -> DriverResult<PathBuf> {
        let path = session.settings_path();
        camera.save_features(&path)?;

        let size = fs::metadata(&path)
            .map_err(|e| DriverError::storage(&path, e))?
            .len();
        if size == 0 {
            return Err(DriverError::storage(&path, "feature snapshot is empty"));
        }
        debug!(path = %path.display(), size, "saved settings snapshot");
        Ok(path)
    }

    /// Convert `buffer` to TIFF and write it into the session.
    pub fn save_frame<B: GrabBuffer>(
        &mut self,
        session: &Session,
        buffer: &B,
    ) -> DriverResult<Frame> {
        let captured_at = self.next_stamp();
        let name = format!(
            "picture_{}.{:06}.tiff",
            captured_at.timestamp(),
            captured_at.timestamp_subsec_micros()
        );
        let file = session.dir.join(&name);

        let image = buffer
            .to_image()
            .map_err(|e| DriverError::storage(&file, e))?;
        image
            .save_with_format(&file, ImageFormat::Tiff)
            .map_err(|e| DriverError::storage(&file, e))?;

        let readings = buffer.readings();
        Ok(Frame {
            path: format!("{}/{}", session.folder_name, name),
            name,
            exposure_us: readings.exposure_us,
            gain: readings.gain,
            captured_at,
        })
    }

    /// Current time truncated to microseconds, bumped past the previous
    /// stamp when the clock has not advanced.
    fn next_stamp(&mut self) -> DateTime<Utc> {
        let now = self.clock.now();
        let mut stamp = now
            .with_nanosecond(now.timestamp_subsec_micros() * 1_000)
            .unwrap_or(now);
        if let Some(last) = self.last_stamp {
            if stamp <= last {
                stamp = last + ChronoDuration::microseconds(1);
            }
        }
        self.last_stamp = Some(stamp);
        stamp
    }
}
