//! Environment overrides for stream geometry and pacing.

/// Overrides read from the environment once at session start.
///
/// | Variable         | Effect                                            |
/// |------------------|---------------------------------------------------|
/// | `OVERRIDE_FPS`   | Force the target FPS, bypassing the device table. |
/// | `OVERRIDE_FB_W`  | Force the output width in pixels.                 |
/// | `OVERRIDE_FB_H`  | Force the output height in pixels.                |
/// | `OVERRIDE_SCALE` | Multiplier on the device-advertised resolution.   |
#[derive(Debug, Clone, Copy, Default)]
pub struct Overrides {
    pub fps: Option<u32>,
    pub fb_w: Option<u32>,
    pub fb_h: Option<u32>,
    pub scale: Option<f32>,
}

impl Overrides {
    pub fn from_env() -> Overrides {
        Overrides {
            fps: read_env_u32("OVERRIDE_FPS"),
            fb_w: read_env_u32("OVERRIDE_FB_W"),
            fb_h: read_env_u32("OVERRIDE_FB_H"),
            scale: read_env_f32("OVERRIDE_SCALE").filter(|s| *s > 0.0),
        }
    }
}

fn read_env_u32(name: &str) -> Option<u32> {
    std::env::var(name).ok().and_then(|v| v.trim().parse::<u32>().ok())
}

fn read_env_f32(name: &str) -> Option<f32> {
    std::env::var(name).ok().and_then(|v| v.trim().parse::<f32>().ok())
}
