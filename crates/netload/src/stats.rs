//! Interface packet counters read through `ip -j`.

use serde::Deserialize;
use serde_json::Value;

use crate::error::{LoadError, Result};
use crate::host::Host;
use crate::process::Cmd;

/// A monotonically non-decreasing receive-packet counter.
pub trait PacketCounter {
    fn rx_packets(&mut self) -> Result<u64>;
}

/// Any closure returning a sample is a counter, which keeps the pollers
/// testable without a real interface.
impl<F> PacketCounter for F
where
    F: FnMut() -> Result<u64>,
{
    fn rx_packets(&mut self) -> Result<u64> {
        self()
    }
}

/// Runs `ip -j <args>` on `host` and parses its JSON output.
pub fn ip(args: &str, host: &Host) -> Result<Value> {
    let proc = Cmd::run(&format!("ip -j {args}"), host)?;
    Ok(serde_json::from_str(&proc.stdout())?)
}

#[derive(Debug, Deserialize)]
struct LinkStats {
    stats64: Stats64,
}

#[derive(Debug, Deserialize)]
struct Stats64 {
    rx: Direction,
}

#[derive(Debug, Deserialize)]
struct Direction {
    packets: u64,
}

/// Extracts `[0].stats64.rx.packets` from `ip -s -j link show` output.
pub fn rx_packets_from(value: Value) -> Result<u64> {
    let first = match value {
        Value::Array(mut links) if !links.is_empty() => links.swap_remove(0),
        Value::Array(_) => return Err(LoadError::Stats("no such link".into())),
        other => other,
    };
    let link: LinkStats = serde_json::from_value(first)
        .map_err(|e| LoadError::Stats(format!("missing stats64.rx.packets: {e}")))?;
    Ok(link.stats64.rx.packets)
}

/// Receive counter of a named interface.
#[derive(Debug, Clone)]
pub struct IfaceCounter {
    ifname: String,
    host: Host,
}

impl IfaceCounter {
    pub fn new(ifname: impl Into<String>, host: Host) -> Self {
        Self {
            ifname: ifname.into(),
            host,
        }
    }
}

impl PacketCounter for IfaceCounter {
    fn rx_packets(&mut self) -> Result<u64> {
        let value = ip(&format!("-s link show dev {}", self.ifname), &self.host)?;
        rx_packets_from(value)
    }
}
