/// Errors that can occur while driving an XRSP link session.
#[derive(Debug, thiserror::Error)]
pub enum XrspError {
    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    #[error("Headset not found (no matching VID/PID on the bus)")]
    DeviceNotFound,

    #[error("Headset disconnected")]
    NoDevice,

    #[error("Timed out waiting for data")]
    Timeout,

    #[error("Bad topic frame: {0}")]
    Framing(String),

    #[error("Schema payload decode failed: {0}")]
    Schema(&'static str),

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Video pipeline fault: {0}")]
    Pipeline(String),

    #[error("Event channel disconnected")]
    ChannelDisconnected,
}

impl XrspError {
    /// True for transport failures that invalidate the device handle and
    /// require a reset-and-reopen cycle.
    pub fn is_fatal_transport(&self) -> bool {
        matches!(
            self,
            XrspError::NoDevice | XrspError::Usb(rusb::Error::NoDevice)
        )
    }
}
