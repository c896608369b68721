/// Components that run a camera acquisition session.
pub mod acquisition {
    /// Session folders, settings snapshots and frame files.
    pub mod storage;
    /// Frame metadata announcements on the bus.
    pub mod publisher;
    /// The grab, save and publish loop.
    pub mod capture_loop;
    /// Start, stop and join of the acquisition thread.
    pub mod lifecycle;
}

/// Helpful prelude when working with components.
pub mod prelude {
    pub use crate::components::acquisition::capture_loop::*;
    pub use crate::components::acquisition::lifecycle::*;
    pub use crate::components::acquisition::publisher::*;
    pub use crate::components::acquisition::storage::*;
}
