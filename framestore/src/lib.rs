/**
Framestore drives a single industrial camera through one acquisition session:
frames are pulled off the device, written to a per-session folder on disk and
announced to downstream consumers over a message bus. Device access, storage
and publishing are kept behind small seams so each can be swapped or faked
without touching the acquisition loop.
*/

/// Components in the driver are created by grouping together
/// devices into a logical unit that performs some function,
/// such as running an acquisition session.
pub mod components;
/// Devices that are an atomic unit, and can be composed
/// with other devices into components to perform some function.
pub mod devices;
/// Error types shared by every layer of the driver.
pub mod errors;
/// Subscriber setup for the `tracing` output of the driver.
pub mod logging;
/// Message structure for communication out of the driver,
/// such as the metadata sent for every saved frame.
pub mod messages;
/// Development utilities for working with image information.
pub mod utils;
