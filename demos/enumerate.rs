use xrsp::{META_VID, QUEST_XRSP_PIDS};

fn main() {
    env_logger::init();

    let mut found = 0;
    for pid in QUEST_XRSP_PIDS {
        match xrsp::usb::enumerate(META_VID, pid) {
            Ok(devices) => {
                for (bus, addr) in devices {
                    println!("{:04x}:{:04x} at bus {:03} device {:03}", META_VID, pid, bus, addr);
                    found += 1;
                }
            }
            Err(e) => {
                eprintln!("enumeration failed: {}", e);
                std::process::exit(1);
            }
        }
    }

    if found == 0 {
        println!("no link-mode headset found");
    }
}
