/// Standardise what the driver sends to downstream consumers. Provide
/// a test suite to ensure the interface is respected.
pub mod data {
    /// Frame metadata announced for every image written to disk.
    pub mod frame;
}
