use crate::components::acquisition::storage::Frame;
use serde::{Deserialize, Serialize};

/// Frame announcement published once for every saved frame. Consumers
/// resolve `path` against the storage root of the driver.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MetadataRecord {
    /// `<session folder>/<file name>`.
    pub path: String,
    /// File name of the frame.
    pub name: String,
    /// Exposure time in microseconds.
    pub exposure: f64,
    /// Raw gain.
    pub gain: i64,
}

impl From<&Frame> for MetadataRecord {
    fn from(frame: &Frame) -> Self {
        Self {
            path: frame.path.clone(),
            name: frame.name.clone(),
            exposure: frame.exposure_us,
            gain: frame.gain,
        }
    }
}

impl MetadataRecord {
    /// Serialize to the JSON payload put on the bus.
    pub fn to_payload(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
