//! XRSP wire-protocol constants: topics, builtin hostinfo message types,
//! command ids and the pairing state machine's states.

// -- Topics --
//
// One byte multiplexing the bulk stream. Topic 0 doubles as the filler
// frame used to pad output to the next 1024-byte boundary.
pub const TOPIC_FILLER: u8 = 0x00;
pub const TOPIC_HOSTINFO_ADV: u8 = 0x01;
pub const TOPIC_COMMAND: u8 = 0x02;
pub const TOPIC_POSE: u8 = 0x03;
pub const TOPIC_MESH: u8 = 0x04;
pub const TOPIC_VIDEO: u8 = 0x05;
pub const TOPIC_AUDIO: u8 = 0x06;
pub const TOPIC_HAPTIC: u8 = 0x07;
pub const TOPIC_HANDS: u8 = 0x08;
pub const TOPIC_SKELETON: u8 = 0x09;
pub const TOPIC_SLICE_0: u8 = 0x0A;
pub const TOPIC_SLICE_1: u8 = 0x0B;
pub const TOPIC_SLICE_2: u8 = 0x0C;
pub const TOPIC_SLICE_3: u8 = 0x0D;
pub const TOPIC_AUDIO_CONTROL: u8 = 0x1A;
pub const TOPIC_USER_SETTINGS_SYNC: u8 = 0x1B;
pub const TOPIC_INPUT_CONTROL: u8 = 0x1C;
pub const TOPIC_ASW: u8 = 0x1D;
pub const TOPIC_BODY: u8 = 0x1E;
pub const TOPIC_RUNTIME_IPC: u8 = 0x1F;
pub const TOPIC_CAMERA_STREAM: u8 = 0x20;
pub const TOPIC_LOGGING: u8 = 0x21;

/// Highest topic id the headset is known to emit.
pub const TOPIC_MAX: u8 = 0x23;

// -- Hostinfo builtin message types (TOPIC_HOSTINFO_ADV) --
pub const BUILTIN_PAIRING_ACK: u8 = 0x0;
pub const BUILTIN_INVITE: u8 = 0x1;
pub const BUILTIN_OK: u8 = 0x2;
pub const BUILTIN_ACK: u8 = 0x3;
pub const BUILTIN_ERROR: u8 = 0x4;
pub const BUILTIN_BYE: u8 = 0x5;
pub const BUILTIN_ECHO: u8 = 0x6;
pub const BUILTIN_PAIRING: u8 = 0x7;
pub const BUILTIN_CODE_GENERATION: u8 = 0x9;
pub const BUILTIN_CODE_GENERATION_ACK: u8 = 0xA;

// -- Echo direction (low bit of the hostinfo result field) --
pub const ECHO_PING: u16 = 0;
pub const ECHO_PONG: u16 = 1;

// -- Command topic ids (TOPIC_COMMAND) --
pub const COMMAND_RESET_GUARDIAN: u32 = 0x0B;
pub const COMMAND_TOGGLE_CHEMX: u32 = 0x0C;
pub const COMMAND_ENABLE_CAMERA_STREAM: u32 = 0x0D;
pub const COMMAND_DISABLE_CAMERA_STREAM: u32 = 0x0E;
pub const COMMAND_TOGGLE_ASW: u32 = 0x0F;
pub const COMMAND_DROP_FRAMES_STATE: u32 = 0x11;

// -- Runtime IPC message kinds (TOPIC_RUNTIME_IPC) --
pub const RIPC_MSG_CONNECT_TO_REMOTE_SERVER: u32 = 0x0;
pub const RIPC_MSG_RPC: u32 = 0x1;
pub const RIPC_MSG_SERVER_STATE_UPDATE: u32 = 0x2;
pub const RIPC_MSG_ENSURE_SERVICE_STARTED: u32 = 0x3;

/// Where the session is in the multi-round pairing handshake.
///
/// The state only ever advances; the sole regression path is a USB
/// reconnect, which resets to `WaitFirst`.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PairingState {
    WaitFirst = 0,
    WaitSecond = 1,
    Pairing = 2,
    Paired = 3,
}

impl PairingState {
    pub fn from_u8(v: u8) -> PairingState {
        match v {
            1 => PairingState::WaitSecond,
            2 => PairingState::Pairing,
            3 => PairingState::Paired,
            _ => PairingState::WaitFirst,
        }
    }
}

/// Headset hardware generation, advertised in the INVITE payload.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Quest1 = 1,
    Quest2 = 2,
    QuestPro = 3,
    Quest3 = 4,
    Unknown = 0,
}

impl DeviceType {
    pub fn from_u32(v: u32) -> DeviceType {
        match v {
            1 => DeviceType::Quest1,
            2 => DeviceType::Quest2,
            3 => DeviceType::QuestPro,
            4 => DeviceType::Quest3,
            _ => DeviceType::Unknown,
        }
    }

    /// Default streaming refresh rate for this device.
    ///
    /// The Quest 2 can do 120 Hz on a SuperSpeed link but is capped to 90 on
    /// slower cables; everything pre-Quest 2 runs at 72.
    pub fn default_fps(self, slow_link: bool) -> u32 {
        match self {
            DeviceType::Quest2 => {
                if slow_link {
                    90
                } else {
                    120
                }
            }
            DeviceType::QuestPro | DeviceType::Quest3 => 90,
            _ => 72,
        }
    }
}

/// Video codec negotiated in the second OK round.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    H264 = 0,
    Hevc = 1,
}

pub fn topic_str(topic: u8) -> &'static str {
    match topic {
        TOPIC_FILLER => "filler",
        TOPIC_HOSTINFO_ADV => "hostinfo-adv",
        TOPIC_COMMAND => "Command",
        TOPIC_POSE => "Pose",
        TOPIC_MESH => "Mesh",
        TOPIC_VIDEO => "Video",
        TOPIC_AUDIO => "Audio",
        TOPIC_HAPTIC => "Haptic",
        TOPIC_HANDS => "Hands",
        TOPIC_SKELETON => "Skeleton",
        TOPIC_SLICE_0 => "Slice 0",
        TOPIC_SLICE_1 => "Slice 1",
        TOPIC_SLICE_2 => "Slice 2",
        TOPIC_SLICE_3 => "Slice 3",
        TOPIC_AUDIO_CONTROL => "AudioControl",
        TOPIC_USER_SETTINGS_SYNC => "UserSettingsSync",
        TOPIC_INPUT_CONTROL => "InputControl",
        TOPIC_ASW => "Asw",
        TOPIC_BODY => "Body",
        TOPIC_RUNTIME_IPC => "RuntimeIPC",
        TOPIC_CAMERA_STREAM => "CameraStream",
        TOPIC_LOGGING => "Logging",
        _ => "unk topic",
    }
}

pub fn builtin_str(message_type: u8) -> &'static str {
    match message_type {
        BUILTIN_PAIRING_ACK => "PAIRING_ACK",
        BUILTIN_INVITE => "INVITE",
        BUILTIN_OK => "OK",
        BUILTIN_ACK => "ACK",
        BUILTIN_ERROR => "ERROR",
        BUILTIN_BYE => "BYE",
        BUILTIN_ECHO => "ECHO",
        BUILTIN_PAIRING => "PAIRING",
        BUILTIN_CODE_GENERATION => "CODE_GENERATION",
        BUILTIN_CODE_GENERATION_ACK => "CODE_GENERATION_ACK",
        _ => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pairing_state_roundtrip() {
        for s in [
            PairingState::WaitFirst,
            PairingState::WaitSecond,
            PairingState::Pairing,
            PairingState::Paired,
        ] {
            assert_eq!(PairingState::from_u8(s as u8), s);
        }
        assert_eq!(PairingState::from_u8(0xFF), PairingState::WaitFirst);
    }

    #[test]
    fn test_fps_table() {
        assert_eq!(DeviceType::Quest2.default_fps(false), 120);
        assert_eq!(DeviceType::Quest2.default_fps(true), 90);
        assert_eq!(DeviceType::QuestPro.default_fps(false), 90);
        assert_eq!(DeviceType::Quest3.default_fps(true), 90);
        assert_eq!(DeviceType::Quest1.default_fps(false), 72);
        assert_eq!(DeviceType::Unknown.default_fps(false), 72);
    }

    #[test]
    fn test_topic_names() {
        assert_eq!(topic_str(TOPIC_RUNTIME_IPC), "RuntimeIPC");
        assert_eq!(topic_str(0x3F), "unk topic");
        assert_eq!(builtin_str(BUILTIN_CODE_GENERATION_ACK), "CODE_GENERATION_ACK");
    }
}
