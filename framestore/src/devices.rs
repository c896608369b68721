/// Devices are the atomic units that can be combined together
/// into components. Their core responsibilities do not change
/// based on location, name etc.
pub mod hardware {
    /// Device interface for the network cameras.
    pub mod camera;
    /// GigE Vision backend built on aravis.
    #[cfg(feature = "gige")]
    pub mod gige;
}

/// Devices without hardware behind them.
pub mod software {
    /// Message bus the frame metadata is published on.
    pub mod bus;
}

#[cfg(test)]
pub mod mock;
