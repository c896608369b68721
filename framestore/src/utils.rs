/// Conversion of raw grab buffers into images.
pub mod image;
