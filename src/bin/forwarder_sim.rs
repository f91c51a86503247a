//! Forwarder Simulator
//!
//! Prints LoRa Basic Station style log output to stdout: uplinks, the odd
//! downlink, and unrelated chatter in between. Point the aggregator at it
//! instead of a real gateway:
//!
//! ```toml
//! [forwarder]
//! command = ["forwarder-sim", "500"]
//! ```
//!
//! Usage: cargo run --bin forwarder-sim [interval_ms] [count]

use chrono::Utc;
use std::env;
use tokio::time::{sleep, Duration};

/// Fake device addresses heard by the "gateway"
const DEV_ADDRS: [&str; 3] = ["260B1234", "260B5678", "01AB5678"];

const CHANNELS: [&str; 4] = ["868.1MHz", "868.3MHz", "868.5MHz", "867.1MHz"];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let interval_ms: u64 = env::args()
        .nth(1)
        .map(|s| s.parse::<u64>())
        .transpose()?
        .unwrap_or(1000);
    let count: Option<u64> = env::args().nth(2).map(|s| s.parse::<u64>()).transpose()?;

    emit("SYS:INFO", "Station Version   2.0.6(rpi/std) 2022-01-01 00:00:00");
    emit("SYS:INFO", "proto EUI   : 0:b827:ebff:fe61:51e3");
    emit("S2E:INFO", "Connected to MUXS.");

    let mut fcnt: u32 = 0;
    let mut n: u64 = 0;
    loop {
        if count.is_some_and(|c| n >= c) {
            break;
        }

        let dev_addr = DEV_ADDRS[(n % DEV_ADDRS.len() as u64) as usize];
        let freq = CHANNELS[(n % CHANNELS.len() as u64) as usize];
        let rssi = -40 - (n % 70) as i64;
        emit(
            "S2E:VERB",
            &format!(
                "RX {} DR5 SF7/BW125 snr=9.5 rssi={} xtime=0x{:X} - updf mhdr=40 DevAddr={} FCtrl=80 FCnt={} FOpts=[] 01 mic=305419896 (14 bytes)",
                freq,
                rssi,
                0x5A0000_u64 + n,
                dev_addr,
                fcnt
            ),
        );
        fcnt = fcnt.wrapping_add(1);

        match n % 5 {
            2 => emit("S2E:DEBU", "Time sync qualities: min=52 q90=61 max=76 (previous q90=62)"),
            4 => emit(
                "S2E:VERB",
                &format!(
                    "TX ::0 diid={} [ant#0] - dnmsg: {} 14.0dBm ant#0(0) DR5 SF7/BW125 frame=60{}",
                    n,
                    freq,
                    dev_addr
                ),
            ),
            _ => {}
        }

        n += 1;
        sleep(Duration::from_millis(interval_ms)).await;
    }

    Ok(())
}

fn emit(tag: &str, msg: &str) {
    println!(
        "{} [{}] {}",
        Utc::now().format("%Y-%m-%d %H:%M:%S%.3f"),
        tag,
        msg
    );
}
