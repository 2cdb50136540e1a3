#![allow(dead_code)]

use barst_rs::{AdcChannel, AdcConfig, Session, SessionConfig, SimDevice, SimServer};
use std::time::{Duration, Instant};

pub const DEVICE: &str = "/dev/adc0";

pub struct Rig {
    // fields drop in order: channel, session, server
    pub adc: AdcChannel,
    pub session: Session,
    pub device: SimDevice,
    pub server: SimServer,
}

pub fn connect(server: &SimServer) -> Session {
    Session::connect(SessionConfig::new(server.endpoint())).unwrap()
}

/// 10 bit, +-5 V, both sub-channels, 4096 record buffer.
pub fn ten_bit_pair() -> AdcConfig {
    AdcConfig::builder()
        .sampling_rate(1000.0)
        .bit_depth(10)
        .input_range(-5.0, 5.0)
        .buffer_capacity(4096)
        .transfer_size(100)
        .chan_a(true)
        .chan_b(true)
        .build()
        .unwrap()
}

pub fn single_channel() -> AdcConfig {
    AdcConfig::builder()
        .sampling_rate(1000.0)
        .bit_depth(16)
        .input_range(-10.0, 10.0)
        .buffer_capacity(1024)
        .transfer_size(8)
        .build()
        .unwrap()
}

pub fn rig(config: AdcConfig) -> Rig {
    let _ = env_logger::builder().is_test(true).try_init();
    let server = SimServer::start().unwrap();
    let device = server.add_device(DEVICE);
    let session = connect(&server);
    let adc = AdcChannel::open(&session, DEVICE, config).unwrap();
    Rig {
        adc,
        session,
        device,
        server,
    }
}

/// Polls `condition` for up to two seconds.
pub fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}
