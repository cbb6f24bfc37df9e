//! Schema-encoded payloads carried inside topic frames and segmented
//! messages. All layouts are little-endian and padded to 8-byte multiples
//! so segment lengths stay expressible in quad-words.

use crate::error::XrspError;
use crate::types::{DeviceLogLevel, HapticTarget, HapticType, HeadsetPose, Pose};
use crate::Result;

/// Rectify mesh id for the standard foveated grid.
pub const MESH_FOVEATED: u32 = 1000;
pub const MESH_NONE: u32 = 0;

/// Buffered haptic waveforms cap out at this many bytes.
pub const HAPTIC_BUFFER_MAX: usize = 25;

bitflags::bitflags! {
    /// Flag bits in a video slice header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SliceFlags: u32 {
        /// Codec-specific data precedes the IDR payload.
        const CSD_PRESENT = 1 << 0;
        /// This is the last slice of its frame.
        const LAST_SLICE = 1 << 1;
    }
}

/// Little-endian read cursor over a payload.
struct Cursor<'a> {
    b: &'a [u8],
    off: usize,
}

impl<'a> Cursor<'a> {
    fn new(b: &'a [u8]) -> Cursor<'a> {
        Cursor { b, off: 0 }
    }

    fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8]> {
        if self.off + n > self.b.len() {
            return Err(XrspError::Schema(what));
        }
        let s = &self.b[self.off..self.off + n];
        self.off += n;
        Ok(s)
    }

    fn u16(&mut self, what: &'static str) -> Result<u16> {
        let s = self.take(2, what)?;
        Ok(u16::from_le_bytes([s[0], s[1]]))
    }

    fn u32(&mut self, what: &'static str) -> Result<u32> {
        let s = self.take(4, what)?;
        Ok(u32::from_le_bytes([s[0], s[1], s[2], s[3]]))
    }

    fn f32(&mut self, what: &'static str) -> Result<f32> {
        Ok(f32::from_bits(self.u32(what)?))
    }

    fn i64(&mut self, what: &'static str) -> Result<i64> {
        let s = self.take(8, what)?;
        let mut w = [0u8; 8];
        w.copy_from_slice(s);
        Ok(i64::from_le_bytes(w))
    }

    fn remaining(&self) -> usize {
        self.b.len() - self.off
    }
}

fn pad8(out: &mut Vec<u8>) {
    while out.len() % 8 != 0 {
        out.push(0);
    }
}

// -- Video slice header --

/// Header preceding the raw CSD/IDR bytes of one video slice.
///
/// Layout:
/// - `0x00` frame_idx u32, `0x04` rectify_mesh_id u32
/// - `0x08` pose quaternion [x,y,z,w] f32, `0x18` pose position [x,y,z] f32
/// - `0x24` slice_num u32, `0x28` flags u32, `0x2C` blit_y_pos u32
/// - `0x30` crop_blocks u32, `0x34` csd_size u32, `0x38` video_size u32
/// - `0x3C` reserved, `0x40` pose_timestamp i64
/// - `0x48` pipeline prediction delta u64 (encode-start to encode-done)
/// - `0x50..0x70` deadline plan: timestamp_09 (tx start), timestamp_0D
///   (GPU-end estimate), timestamp_0C (deadline), timestamp_0B (deadline+)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SliceHeader {
    pub frame_idx: u32,
    pub rectify_mesh_id: u32,
    pub pose: Pose,
    pub pose_timestamp: i64,
    pub slice_num: u32,
    pub flags: SliceFlags,
    pub blit_y_pos: u32,
    pub crop_blocks: u32,
    pub csd_size: u32,
    pub video_size: u32,
    pub pipeline_pred_delta: i64,
    pub timestamp_09: i64,
    pub timestamp_0d: i64,
    pub timestamp_0c: i64,
    pub timestamp_0b: i64,
}

impl SliceHeader {
    pub const SIZE: usize = 0x70;

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        out.extend_from_slice(&self.frame_idx.to_le_bytes());
        out.extend_from_slice(&self.rectify_mesh_id.to_le_bytes());
        for q in self.pose.orientation {
            out.extend_from_slice(&q.to_le_bytes());
        }
        for p in self.pose.position {
            out.extend_from_slice(&p.to_le_bytes());
        }
        out.extend_from_slice(&self.slice_num.to_le_bytes());
        out.extend_from_slice(&self.flags.bits().to_le_bytes());
        out.extend_from_slice(&self.blit_y_pos.to_le_bytes());
        out.extend_from_slice(&self.crop_blocks.to_le_bytes());
        out.extend_from_slice(&self.csd_size.to_le_bytes());
        out.extend_from_slice(&self.video_size.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&self.pose_timestamp.to_le_bytes());
        out.extend_from_slice(&self.pipeline_pred_delta.to_le_bytes());
        out.extend_from_slice(&self.timestamp_09.to_le_bytes());
        out.extend_from_slice(&self.timestamp_0d.to_le_bytes());
        out.extend_from_slice(&self.timestamp_0c.to_le_bytes());
        out.extend_from_slice(&self.timestamp_0b.to_le_bytes());
        debug_assert_eq!(out.len(), Self::SIZE);
        out
    }

    pub fn decode(b: &[u8]) -> Result<SliceHeader> {
        let mut c = Cursor::new(b);
        let frame_idx = c.u32("slice frame_idx")?;
        let rectify_mesh_id = c.u32("slice mesh id")?;
        let mut orientation = [0f32; 4];
        for q in &mut orientation {
            *q = c.f32("slice pose quat")?;
        }
        let mut position = [0f32; 3];
        for p in &mut position {
            *p = c.f32("slice pose pos")?;
        }
        let slice_num = c.u32("slice num")?;
        let flags = SliceFlags::from_bits_truncate(c.u32("slice flags")?);
        let blit_y_pos = c.u32("slice blit y")?;
        let crop_blocks = c.u32("slice crop blocks")?;
        let csd_size = c.u32("slice csd size")?;
        let video_size = c.u32("slice video size")?;
        c.u32("slice reserved")?;
        Ok(SliceHeader {
            frame_idx,
            rectify_mesh_id,
            pose: Pose { orientation, position },
            pose_timestamp: c.i64("slice pose ts")?,
            slice_num,
            flags,
            blit_y_pos,
            crop_blocks,
            csd_size,
            video_size,
            pipeline_pred_delta: c.i64("slice pred delta")?,
            timestamp_09: c.i64("slice ts09")?,
            timestamp_0d: c.i64("slice ts0d")?,
            timestamp_0c: c.i64("slice ts0c")?,
            timestamp_0b: c.i64("slice ts0b")?,
        })
    }
}

// -- Haptics --

/// One haptic event for a controller or gamepad.
#[derive(Debug, Clone)]
pub struct HapticEvent {
    pub timestamp: i64,
    pub target: HapticTarget,
    pub haptic_type: HapticType,
    pub amplitude: f32,
    pub pose_timestamp: i64,
    /// Waveform samples for buffered haptics; empty for simple ones.
    pub data: Vec<u8>,
}

impl HapticEvent {
    pub fn encode(&self) -> Vec<u8> {
        let data_len = self.data.len().min(HAPTIC_BUFFER_MAX);
        let mut out = Vec::with_capacity(0x20 + HAPTIC_BUFFER_MAX + 7);
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        out.extend_from_slice(&(self.target as u32).to_le_bytes());
        out.extend_from_slice(&(self.haptic_type as u32).to_le_bytes());
        out.extend_from_slice(&self.amplitude.to_le_bytes());
        out.extend_from_slice(&(data_len as u32).to_le_bytes());
        out.extend_from_slice(&self.pose_timestamp.to_le_bytes());
        out.extend_from_slice(&self.data[..data_len]);
        pad8(&mut out);
        out
    }
}

// -- Audio / input control --

/// The five-field control record shared by the audio-control and
/// input-control topics. Field semantics live with the peer (audio route
/// selection; hands/body/eye-tracking enables).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelControl {
    pub a: u16,
    pub b: u16,
    pub c: u32,
    pub d: f32,
    pub e: f32,
}

impl ChannelControl {
    pub const SIZE: usize = 16;

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        out.extend_from_slice(&self.a.to_le_bytes());
        out.extend_from_slice(&self.b.to_le_bytes());
        out.extend_from_slice(&self.c.to_le_bytes());
        out.extend_from_slice(&self.d.to_le_bytes());
        out.extend_from_slice(&self.e.to_le_bytes());
        out
    }

    pub fn decode(b: &[u8]) -> Result<ChannelControl> {
        let mut c = Cursor::new(b);
        Ok(ChannelControl {
            a: c.u16("control a")?,
            b: c.u16("control b")?,
            c: c.u32("control c")?,
            d: c.f32("control d")?,
            e: c.f32("control e")?,
        })
    }
}

// -- Command topic --

/// Raw command record on `TOPIC_COMMAND`.
#[derive(Debug, Clone, Copy)]
pub struct CommandPacket {
    pub stamp: u64,
    pub command: u32,
    pub args: [u32; 5],
}

impl CommandPacket {
    pub fn new(command: u32) -> CommandPacket {
        CommandPacket {
            stamp: 0x0005_EC94_E91B_9D83,
            command,
            args: [0; 5],
        }
    }

    pub fn with_arg1(mut self, v: u32) -> CommandPacket {
        self.args[1] = v;
        self
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32);
        out.extend_from_slice(&self.stamp.to_le_bytes());
        out.extend_from_slice(&self.command.to_le_bytes());
        for a in self.args {
            out.extend_from_slice(&a.to_le_bytes());
        }
        out
    }
}

// -- Runtime IPC envelope --

/// First segment of every runtime-IPC message.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeIpcHeader {
    pub cmd_id: u32,
    /// Byte length of the second segment.
    pub next_size: u32,
    pub client_id: u32,
    pub unk: u32,
    /// Optional inline blob (reply routing cookies and the like).
    pub data: Vec<u8>,
}

impl RuntimeIpcHeader {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(24 + self.data.len());
        out.extend_from_slice(&self.cmd_id.to_le_bytes());
        out.extend_from_slice(&self.next_size.to_le_bytes());
        out.extend_from_slice(&self.client_id.to_le_bytes());
        out.extend_from_slice(&self.unk.to_le_bytes());
        out.extend_from_slice(&(self.data.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.data);
        pad8(&mut out);
        out
    }

    pub fn decode(b: &[u8]) -> Result<RuntimeIpcHeader> {
        let mut c = Cursor::new(b);
        let cmd_id = c.u32("ipc cmd id")?;
        let next_size = c.u32("ipc next size")?;
        let client_id = c.u32("ipc client id")?;
        let unk = c.u32("ipc unk")?;
        let data_len = c.u32("ipc data len")? as usize;
        let data = c.take(data_len, "ipc data")?.to_vec();
        Ok(RuntimeIpcHeader {
            cmd_id,
            next_size,
            client_id,
            unk,
            data,
        })
    }
}

// -- Invite / headset description --

/// Per-eye lens half-angles in degrees, as advertised by the headset.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LensAngles {
    pub up: f32,
    pub down: f32,
    pub left: f32,
    pub right: f32,
}

/// Headset description carried in the INVITE's schema payload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InviteInfo {
    pub device_type: u32,
    pub resolution_width: u32,
    pub resolution_height: u32,
    pub refresh_rate_hz: f32,
    pub left_lens: LensAngles,
    pub right_lens: LensAngles,
}

impl InviteInfo {
    pub const SIZE: usize = 0x30;

    pub fn decode(b: &[u8]) -> Result<InviteInfo> {
        let mut c = Cursor::new(b);
        let device_type = c.u32("invite device type")?;
        let resolution_width = c.u32("invite res w")?;
        let resolution_height = c.u32("invite res h")?;
        let refresh_rate_hz = c.f32("invite refresh")?;
        let mut lens = |c: &mut Cursor| -> Result<LensAngles> {
            Ok(LensAngles {
                up: c.f32("lens up")?,
                down: c.f32("lens down")?,
                left: c.f32("lens left")?,
                right: c.f32("lens right")?,
            })
        };
        Ok(InviteInfo {
            device_type,
            resolution_width,
            resolution_height,
            refresh_rate_hz,
            left_lens: lens(&mut c)?,
            right_lens: lens(&mut c)?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        out.extend_from_slice(&self.device_type.to_le_bytes());
        out.extend_from_slice(&self.resolution_width.to_le_bytes());
        out.extend_from_slice(&self.resolution_height.to_le_bytes());
        out.extend_from_slice(&self.refresh_rate_hz.to_le_bytes());
        for l in [self.left_lens, self.right_lens] {
            out.extend_from_slice(&l.up.to_le_bytes());
            out.extend_from_slice(&l.down.to_le_bytes());
            out.extend_from_slice(&l.left.to_le_bytes());
            out.extend_from_slice(&l.right.to_le_bytes());
        }
        out
    }
}

// -- Pose --

/// Wire layout of one tracked pose: quaternion, position, first and second
/// derivatives, then an 8-byte-aligned headset-clock timestamp.
fn decode_wire_pose(c: &mut Cursor) -> Result<(Pose, [f32; 3], [f32; 3], [f32; 3], [f32; 3], i64)> {
    let mut orientation = [0f32; 4];
    for q in &mut orientation {
        *q = c.f32("pose quat")?;
    }
    let mut vecs = [[0f32; 3]; 5];
    for v in &mut vecs {
        for x in v.iter_mut() {
            *x = c.f32("pose vec")?;
        }
    }
    c.u32("pose pad")?;
    let timestamp = c.i64("pose timestamp")?;
    Ok((
        Pose {
            orientation,
            position: vecs[0],
        },
        vecs[1],
        vecs[2],
        vecs[3],
        vecs[4],
        timestamp,
    ))
}

fn encode_wire_pose(out: &mut Vec<u8>, pose: &Pose, derivs: &[[f32; 3]; 4], timestamp: i64) {
    for q in pose.orientation {
        out.extend_from_slice(&q.to_le_bytes());
    }
    for p in pose.position {
        out.extend_from_slice(&p.to_le_bytes());
    }
    for v in derivs {
        for x in v {
            out.extend_from_slice(&x.to_le_bytes());
        }
    }
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&timestamp.to_le_bytes());
}

/// Headset pose message (single-segment on `TOPIC_POSE`).
///
/// The timestamp stays in the headset clock here; conversion to local time
/// happens at the dispatch layer where the echo offset lives.
#[derive(Debug, Clone, Copy)]
pub struct PosePayload {
    pub pose: Pose,
    pub linear_velocity: [f32; 3],
    pub linear_acceleration: [f32; 3],
    pub angular_velocity: [f32; 3],
    pub angular_acceleration: [f32; 3],
    pub timestamp: i64,
    pub ipd_meters: f32,
}

impl PosePayload {
    pub fn decode(b: &[u8]) -> Result<PosePayload> {
        let mut c = Cursor::new(b);
        let (pose, lv, la, av, aa, timestamp) = decode_wire_pose(&mut c)?;
        let ipd_meters = c.f32("pose ipd")?;
        Ok(PosePayload {
            pose,
            linear_velocity: lv,
            linear_acceleration: la,
            angular_velocity: av,
            angular_acceleration: aa,
            timestamp,
            ipd_meters,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        encode_wire_pose(
            &mut out,
            &self.pose,
            &[
                self.linear_velocity,
                self.linear_acceleration,
                self.angular_velocity,
                self.angular_acceleration,
            ],
            self.timestamp,
        );
        out.extend_from_slice(&self.ipd_meters.to_le_bytes());
        pad8(&mut out);
        out
    }

    /// Convert to the public sample type, mapping the timestamp into local
    /// time via the supplied converter.
    pub fn to_sample(&self, from_target: impl Fn(i64) -> i64) -> HeadsetPose {
        HeadsetPose {
            pose: self.pose,
            linear_velocity: self.linear_velocity,
            linear_acceleration: self.linear_acceleration,
            angular_velocity: self.angular_velocity,
            angular_acceleration: self.angular_acceleration,
            timestamp_ns: from_target(self.timestamp),
            ipd_meters: self.ipd_meters,
        }
    }
}

// -- Device logging --

/// Leveled log entries batched on `TOPIC_LOGGING`.
#[derive(Debug, Clone)]
pub struct LoggingPayload {
    pub entries: Vec<(DeviceLogLevel, String)>,
}

impl LoggingPayload {
    pub fn decode(b: &[u8]) -> Result<LoggingPayload> {
        let mut c = Cursor::new(b);
        let count = c.u32("log count")?;
        let mut entries = Vec::new();
        for _ in 0..count {
            let level = match c.u32("log level")? {
                0 => DeviceLogLevel::Error,
                1 => DeviceLogLevel::Warn,
                2 => DeviceLogLevel::Info,
                _ => DeviceLogLevel::Debug,
            };
            let len = c.u32("log entry len")? as usize;
            let raw = c.take(len, "log entry data")?;
            let aligned = (len + 3) / 4 * 4;
            let pad = (aligned - len).min(c.remaining());
            c.take(pad, "log entry pad")?;
            entries.push((level, String::from_utf8_lossy(raw).into_owned()));
        }
        Ok(LoggingPayload { entries })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(self.entries.len() as u32).to_le_bytes());
        for (level, msg) in &self.entries {
            let lv = match level {
                DeviceLogLevel::Error => 0u32,
                DeviceLogLevel::Warn => 1,
                DeviceLogLevel::Info => 2,
                DeviceLogLevel::Debug => 3,
            };
            out.extend_from_slice(&lv.to_le_bytes());
            out.extend_from_slice(&(msg.len() as u32).to_le_bytes());
            out.extend_from_slice(msg.as_bytes());
            while out.len() % 4 != 0 {
                out.push(0);
            }
        }
        pad8(&mut out);
        out
    }
}

// -- Rectify mesh --

/// Distortion-correction grid uploaded once after pairing.
#[derive(Debug, Clone, PartialEq)]
pub struct RectifyMesh {
    pub mesh_id: u32,
    pub input_res: (u32, u32),
    pub output_res: (u32, u32),
    /// Interleaved [u1, v1, u2, v2] per vertex.
    pub vertices: Vec<[f32; 4]>,
    pub indices: Vec<u16>,
}

impl RectifyMesh {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(0x20 + self.vertices.len() * 16 + self.indices.len() * 2);
        out.extend_from_slice(&self.mesh_id.to_le_bytes());
        out.extend_from_slice(&self.input_res.0.to_le_bytes());
        out.extend_from_slice(&self.input_res.1.to_le_bytes());
        out.extend_from_slice(&self.output_res.0.to_le_bytes());
        out.extend_from_slice(&self.output_res.1.to_le_bytes());
        out.extend_from_slice(&(self.vertices.len() as u32).to_le_bytes());
        out.extend_from_slice(&(self.indices.len() as u32).to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        for v in &self.vertices {
            for x in v {
                out.extend_from_slice(&x.to_le_bytes());
            }
        }
        for i in &self.indices {
            out.extend_from_slice(&i.to_le_bytes());
        }
        pad8(&mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slice_header_roundtrip() {
        let hdr = SliceHeader {
            frame_idx: 74,
            rectify_mesh_id: MESH_FOVEATED,
            pose: Pose {
                orientation: [-0.5, 0.1, -0.09, -0.85],
                position: [0.01, 0.18, 0.19],
            },
            pose_timestamp: 18_789_777_081_583,
            slice_num: 4,
            flags: SliceFlags::LAST_SLICE,
            blit_y_pos: 1536,
            crop_blocks: 24,
            csd_size: 0,
            video_size: 1387,
            pipeline_pred_delta: 5_472_800,
            timestamp_09: 18_789_735_622_294,
            timestamp_0d: 18_789_744_739_291,
            timestamp_0c: 18_789_759_255_729,
            timestamp_0b: 18_789_764_254_886,
        };
        let wire = hdr.encode();
        assert_eq!(wire.len(), SliceHeader::SIZE);
        assert_eq!(wire.len() % 8, 0);
        assert_eq!(SliceHeader::decode(&wire).unwrap(), hdr);
    }

    #[test]
    fn test_haptic_buffered_clamps_waveform() {
        let ev = HapticEvent {
            timestamp: 1,
            target: HapticTarget::Right,
            haptic_type: HapticType::Buffered,
            amplitude: 1.0,
            pose_timestamp: 2,
            data: vec![0xFF; 64],
        };
        let wire = ev.encode();
        assert_eq!(wire.len() % 8, 0);
        let len = u32::from_le_bytes([wire[20], wire[21], wire[22], wire[23]]) as usize;
        assert_eq!(len, HAPTIC_BUFFER_MAX);
    }

    #[test]
    fn test_channel_control_roundtrip() {
        let ctl = ChannelControl {
            a: 1,
            b: 1,
            c: 0,
            d: 0.0,
            e: 0.5,
        };
        let wire = ctl.encode();
        assert_eq!(wire.len(), ChannelControl::SIZE);
        assert_eq!(ChannelControl::decode(&wire).unwrap(), ctl);
    }

    #[test]
    fn test_ipc_header_roundtrip() {
        let hdr = RuntimeIpcHeader {
            cmd_id: 3,
            next_size: 0x40,
            client_id: 0x4A60_DCCA,
            unk: 4,
            data: vec![1, 2, 3],
        };
        let wire = hdr.encode();
        assert_eq!(wire.len() % 8, 0);
        assert_eq!(RuntimeIpcHeader::decode(&wire).unwrap(), hdr);
    }

    #[test]
    fn test_invite_roundtrip() {
        let invite = InviteInfo {
            device_type: 2,
            resolution_width: 3664,
            resolution_height: 1920,
            refresh_rate_hz: 90.0,
            left_lens: LensAngles {
                up: 42.0,
                down: 43.0,
                left: 52.0,
                right: 49.0,
            },
            right_lens: LensAngles {
                up: 42.0,
                down: 43.0,
                left: 49.0,
                right: 52.0,
            },
        };
        let wire = invite.encode();
        assert_eq!(wire.len(), InviteInfo::SIZE);
        assert_eq!(InviteInfo::decode(&wire).unwrap(), invite);
    }

    #[test]
    fn test_pose_roundtrip() {
        let pose = PosePayload {
            pose: Pose {
                orientation: [0.0, 0.7, 0.0, 0.7],
                position: [0.1, 1.7, -0.2],
            },
            linear_velocity: [0.0, 0.1, 0.0],
            linear_acceleration: [0.0; 3],
            angular_velocity: [0.0, 0.0, 0.3],
            angular_acceleration: [0.0; 3],
            timestamp: 555_000,
            ipd_meters: 0.063,
        };
        let wire = pose.encode();
        assert_eq!(wire.len() % 8, 0);
        let back = PosePayload::decode(&wire).unwrap();
        assert_eq!(back.pose, pose.pose);
        assert_eq!(back.timestamp, pose.timestamp);
        assert_eq!(back.ipd_meters, pose.ipd_meters);

        let sample = back.to_sample(|t| t - 55_000);
        assert_eq!(sample.timestamp_ns, 500_000);
    }

    #[test]
    fn test_logging_roundtrip() {
        let payload = LoggingPayload {
            entries: vec![
                (DeviceLogLevel::Info, "Frame 74 decoded".to_string()),
                (DeviceLogLevel::Error, "Glitches: 1".to_string()),
            ],
        };
        let wire = payload.encode();
        let back = LoggingPayload::decode(&wire).unwrap();
        assert_eq!(back.entries, payload.entries);
    }

    #[test]
    fn test_mesh_encode_shape() {
        let mesh = RectifyMesh {
            mesh_id: MESH_FOVEATED,
            input_res: (3680, 1920),
            output_res: (3680, 1920),
            vertices: vec![[0.0, 0.0, 1.0, 1.0]; 4],
            indices: vec![0, 1, 2, 2, 1, 3],
        };
        let wire = mesh.encode();
        assert_eq!(wire.len() % 8, 0);
        assert_eq!(&wire[0..4], &MESH_FOVEATED.to_le_bytes());
        let vtx_count = u32::from_le_bytes([wire[20], wire[21], wire[22], wire[23]]);
        assert_eq!(vtx_count, 4);
    }

    #[test]
    fn test_truncated_payloads_error() {
        assert!(SliceHeader::decode(&[0; 16]).is_err());
        assert!(InviteInfo::decode(&[0; 8]).is_err());
        assert!(PosePayload::decode(&[0; 32]).is_err());
    }
}
