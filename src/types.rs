/// A rigid-body pose as carried on the wire: orientation quaternion plus
/// position, both in the headset's tracking space.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Pose {
    /// Orientation quaternion [x, y, z, w].
    pub orientation: [f32; 4],
    /// Position in meters [x, y, z].
    pub position: [f32; 3],
}

impl Pose {
    pub const IDENTITY: Pose = Pose {
        orientation: [0.0, 0.0, 0.0, 1.0],
        position: [0.0, 0.0, 0.0],
    };
}

/// Full headset pose sample decoded from the pose topic.
#[derive(Debug, Clone, Copy)]
pub struct HeadsetPose {
    pub pose: Pose,
    pub linear_velocity: [f32; 3],
    pub linear_acceleration: [f32; 3],
    pub angular_velocity: [f32; 3],
    pub angular_acceleration: [f32; 3],
    /// Sample time converted to the local monotonic clock.
    pub timestamp_ns: i64,
    /// Interpupillary distance in meters.
    pub ipd_meters: f32,
}

/// Which device a haptic event targets.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HapticTarget {
    Left = 0,
    Right = 1,
    Gamepad = 2,
}

/// Haptic delivery mode.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HapticType {
    /// Amplitude-only rumble.
    Simple = 0,
    /// Sampled waveform, up to [`crate::messages::HAPTIC_BUFFER_MAX`] bytes.
    Buffered = 1,
}

/// Log level assigned by the headset to a forwarded log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceLogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

/// Events surfaced to the embedding application.
///
/// Streaming events (poses, hands, body) are dropped when the channel is
/// full; state-change events always use a blocking send.
#[derive(Debug, Clone)]
pub enum HostEvent {
    /// The handshake completed and the session is live.
    Paired,
    /// The link was torn down and the handshake restarted from scratch.
    SessionReset,
    /// Headset pose update.
    HeadPose(HeadsetPose),
    /// Raw hand-tracking payload.
    Hands(Vec<u8>),
    /// Raw hand-skeleton payload.
    Skeleton(Vec<u8>),
    /// Raw body-tracking payload.
    Body(Vec<u8>),
    /// A log line emitted by the headset runtime.
    DeviceLog { level: DeviceLogLevel, message: String },
    /// A named state blob delivered over runtime IPC.
    RuntimeState { name: String, data: Vec<u8> },
}
