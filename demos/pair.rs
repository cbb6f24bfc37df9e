//! Open the first link-mode headset, run the pairing handshake and print
//! session events until interrupted.

use xrsp::{HmdSource, Host, HostConfig, HostEvent, META_VID, QUEST_XRSP_PIDS};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut host = None;
    for pid in QUEST_XRSP_PIDS {
        match Host::open(HostConfig { pid, ..HostConfig::default() }) {
            Ok(h) => {
                log::info!("opened {:04x}:{:04x}", META_VID, pid);
                host = Some(h);
                break;
            }
            Err(xrsp::XrspError::DeviceNotFound) => continue,
            Err(e) => {
                eprintln!("open failed: {}", e);
                std::process::exit(1);
            }
        }
    }
    let Some(host) = host else {
        eprintln!("no link-mode headset found (is the cable plugged in?)");
        std::process::exit(1);
    };

    let mut poses = 0u64;
    for event in host.events().iter() {
        match event {
            HostEvent::Paired => println!("paired: {:?}, {} fps", host.hmd().device_type(), host.hmd().fps()),
            HostEvent::SessionReset => println!("session reset, waiting for re-pair"),
            HostEvent::HeadPose(p) => {
                poses += 1;
                if poses % 500 == 0 {
                    println!("pose #{}: pos {:?} ipd {:.3}", poses, p.pose.position, p.ipd_meters);
                }
            }
            HostEvent::DeviceLog { level, message } => println!("[headset {:?}] {}", level, message),
            _ => {}
        }
    }
}
