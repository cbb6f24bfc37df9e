//! Shared HMD state: the pose/geometry the protocol threads read and the
//! handshake mutates.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::Overrides;
use crate::messages::{InviteInfo, LensAngles, PosePayload, RectifyMesh, MESH_FOVEATED};
use crate::protocol::DeviceType;
use crate::types::Pose;

/// Read side of the HMD consumed by the video pipeline and the mesh/slice
/// emitters.
pub trait HmdSource: Send + Sync {
    /// Latest tracked head pose and its sample time. `target_ns` is the
    /// display time the caller is rendering for; prediction is up to the
    /// implementation and the default one returns the newest sample as-is.
    fn pose_at(&self, target_ns: i64) -> (Pose, i64);
    fn device_type(&self) -> DeviceType;
    fn fps(&self) -> u32;
    /// Encoded video frame size in pixels.
    fn encode_size(&self) -> (u32, u32);
    fn rectify_mesh(&self) -> RectifyMesh;
}

#[derive(Debug, Clone)]
struct HmdState {
    device_type: DeviceType,
    fps: u32,
    encode_width: u32,
    encode_height: u32,
    fov: [LensAngles; 2],
    /// Left lens half-angle as advertised; basis for the IPD trim.
    fov_angle_left: f32,
    pose: Pose,
    pose_ns: i64,
    ipd_meters: f32,
}

impl Default for HmdState {
    fn default() -> HmdState {
        HmdState {
            device_type: DeviceType::Unknown,
            fps: 72,
            encode_width: 3664,
            encode_height: 1920,
            fov: [LensAngles::default(); 2],
            fov_angle_left: 52.0,
            pose: Pose::IDENTITY,
            pose_ns: 0,
            ipd_meters: 0.063,
        }
    }
}

/// Default [`HmdSource`] implementation, doubling as the sink the invite
/// and pose handlers write into. One lock guards all of it.
#[derive(Clone, Default)]
pub struct SharedHmd {
    inner: Arc<Mutex<HmdState>>,
}

impl SharedHmd {
    pub fn new() -> SharedHmd {
        SharedHmd::default()
    }

    /// Apply the headset description from an INVITE: device type, FOV,
    /// render resolution and refresh rate, honoring the link speed and
    /// environment overrides.
    pub fn apply_invite(&self, invite: &InviteInfo, slow_link: bool, overrides: &Overrides) {
        let mut st = self.inner.lock();

        st.device_type = DeviceType::from_u32(invite.device_type);
        st.fps = overrides.fps.unwrap_or_else(|| st.device_type.default_fps(slow_link));

        // Slow cables halve the default render scale.
        let scale = overrides.scale.unwrap_or(if slow_link { 0.5 } else { 0.75 });
        let mut w = (invite.resolution_width as f32 * scale) as u32;
        let mut h = (invite.resolution_height as f32 * scale) as u32;
        if let Some(fw) = overrides.fb_w {
            w = fw;
        }
        if let Some(fh) = overrides.fb_h {
            h = fh;
        }
        // The encoder wants macroblock-aligned dimensions.
        st.encode_width = w & !0xF;
        st.encode_height = h & !0xF;

        st.fov = [invite.left_lens, invite.right_lens];
        st.fov_angle_left = invite.left_lens.left;

        log::info!(
            "headset {:?}: {} fps, scale {}, encode {}x{}",
            st.device_type,
            st.fps,
            scale,
            st.encode_width,
            st.encode_height
        );
    }

    /// Apply a decoded pose sample. `local_ns` is the sample time already
    /// converted to the local clock.
    pub fn apply_pose(&self, payload: &PosePayload, local_ns: i64) {
        let mut st = self.inner.lock();
        st.pose = payload.pose;
        st.pose_ns = local_ns;
        st.ipd_meters = payload.ipd_meters;

        // Quest 2 lens geometry shifts with the IPD slider; trim the
        // outer-edge angles to match the three detents.
        if st.device_type == DeviceType::Quest2 {
            let trim = if st.ipd_meters <= 0.059 {
                0.0
            } else if st.ipd_meters <= 0.066 {
                3.0
            } else {
                9.0
            };
            let angle = st.fov_angle_left - trim;
            st.fov[0].left = angle;
            st.fov[1].right = angle;
        }
    }

    /// Time of the newest pose sample, local clock.
    pub fn last_pose_ns(&self) -> i64 {
        self.inner.lock().pose_ns
    }

    pub fn fov(&self, eye: usize) -> LensAngles {
        self.inner.lock().fov[eye.min(1)]
    }

    pub fn ipd_meters(&self) -> f32 {
        self.inner.lock().ipd_meters
    }
}

impl HmdSource for SharedHmd {
    fn pose_at(&self, _target_ns: i64) -> (Pose, i64) {
        let st = self.inner.lock();
        (st.pose, st.pose_ns)
    }

    fn device_type(&self) -> DeviceType {
        self.inner.lock().device_type
    }

    fn fps(&self) -> u32 {
        self.inner.lock().fps
    }

    fn encode_size(&self) -> (u32, u32) {
        let st = self.inner.lock();
        (st.encode_width, st.encode_height)
    }

    fn rectify_mesh(&self) -> RectifyMesh {
        // Identity UV quad over the full frame. Real distortion grids come
        // from lens calibration, which lives outside this crate.
        let st = self.inner.lock();
        RectifyMesh {
            mesh_id: MESH_FOVEATED,
            input_res: (st.encode_width, st.encode_height),
            output_res: (st.encode_width, st.encode_height),
            vertices: vec![
                [0.0, 0.0, 0.0, 0.0],
                [1.0, 0.0, 1.0, 0.0],
                [0.0, 1.0, 0.0, 1.0],
                [1.0, 1.0, 1.0, 1.0],
            ],
            indices: vec![0, 1, 2, 2, 1, 3],
        }
    }
}
