//! Background network traffic for kernel networking self-tests.
//!
//! Launches an `iperf3` client/server pair across a local and a remote host,
//! detects when traffic has ramped up by sampling interface packet counters,
//! and confirms on teardown that the connection has really closed.

pub mod config;
pub mod conntable;
pub mod error;
pub mod host;
pub mod load;
pub mod poll;
pub mod port;
pub mod process;
pub mod stats;

pub mod test_util;

pub use config::{Config, LoadTuning, NetEnv};
pub use error::{LoadError, Result};
pub use host::Host;
pub use load::TrafficMonitor;
pub use poll::PollTarget;
