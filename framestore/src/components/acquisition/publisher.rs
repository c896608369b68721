use crate::{
    components::acquisition::storage::Frame,
    devices::software::bus::Bus,
    errors::{DriverError, DriverResult},
    messages::data::frame::MetadataRecord,
};
use std::sync::Arc;
use tracing::trace;

/// Announces saved frames on one bus channel.
pub struct MetadataPublisher {
    bus: Arc<dyn Bus>,
    channel: String,
}

impl MetadataPublisher {
    /// * `bus`: bus shared with the lifecycle controller.
    /// * `channel`: channel name, `data` by default.
    pub fn new(bus: Arc<dyn Bus>, channel: impl Into<String>) -> Self {
        Self {
            bus,
            channel: channel.into(),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Register the output channel on the bus.
    pub fn register(&self) {
        self.bus.register(&self.channel);
    }

    /// Build the record for `frame` and hand it to the bus. Returns the
    /// record that was sent.
    pub fn publish(&self, frame: &Frame) -> DriverResult<MetadataRecord> {
        let record = MetadataRecord::from(frame);
        let payload = record
            .to_payload()
            .map_err(|e| DriverError::publish(&self.channel, e))?;
        trace!(channel = %self.channel, %payload, "publishing frame");
        self.bus
            .publish(&self.channel, payload)
            .map_err(|e| DriverError::publish(&self.channel, e))?;
        Ok(record)
    }
}
