//! # xrsp - host-side engine for the Quest Link wired protocol
//!
//! Drives a USB-attached Quest headset from a cold enumeration through the
//! multi-round pairing handshake into a live, frame-streaming XR session:
//! - Topic-multiplexed framing over one bulk endpoint pair, with filler
//!   padding and segmented schema messages on top
//! - Ping/pong clock synchronization against the headset clock
//! - Inbound dispatch for pose, hands, body, device logs and runtime-IPC
//! - A triple-buffered, multi-slice video pipeline fed by an external
//!   encoder, plus haptics and audio/input control side channels
//!
//! ## Quick Start
//! ```no_run
//! use xrsp::{Host, HostConfig, HostEvent};
//!
//! let host = Host::open(HostConfig::default()).unwrap();
//! let encoder = host.encoder(); // hand to the video encoder
//! for event in host.events().iter() {
//!     match event {
//!         HostEvent::Paired => println!("session live"),
//!         HostEvent::HeadPose(p) => println!("pos: {:?}", p.pose.position),
//!         _ => {}
//!     }
//! }
//! ```

pub mod clock;
pub mod config;
pub mod echo;
pub mod error;
pub mod framer;
pub mod handshake;
pub mod hmd;
pub mod host;
pub mod hostinfo;
pub mod messages;
pub mod protocol;
pub mod ripc;
pub mod segment;
pub mod types;
pub mod usb;
pub mod video;

pub use error::XrspError;
pub use hmd::{HmdSource, SharedHmd};
pub use host::{EncoderHandle, Host, HostConfig, META_VID, QUEST_XRSP_PIDS};
pub use protocol::{Codec, DeviceType, PairingState};
pub use types::*;
pub use usb::{Transport, UsbTransport};
pub use video::EncoderSink;

/// Result type alias for xrsp operations.
pub type Result<T> = std::result::Result<T, XrspError>;
