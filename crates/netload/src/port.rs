//! Port selection and listen detection.
//!
//! Listening is detected from the target host's `/proc/net` tables rather
//! than by connecting, so a single-connection server is not consumed.

use std::fmt;
use std::net::{Ipv4Addr, TcpListener};
use std::thread;
use std::time::{Duration, Instant};

use rand::RngExt as _;

use crate::conntable::{has_listener, port_hex};
use crate::error::{LoadError, Result};
use crate::host::Host;
use crate::process::Cmd;

/// Default time to wait for a server to start listening.
pub const LISTEN_TIMEOUT: Duration = Duration::from_secs(5);

const LISTEN_POLL: Duration = Duration::from_millis(100);
const RAND_PORT_ATTEMPTS: u32 = 50;
const RAND_PORT_MIN: u16 = 10000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proto {
    Tcp,
    Udp,
}

impl fmt::Display for Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Proto::Tcp => "tcp",
            Proto::Udp => "udp",
        })
    }
}

/// Picks an unprivileged TCP port that is currently free on this host.
///
/// Tries random ports first so parallel runs don't collide on the kernel's
/// sequential ephemeral allocation, then falls back to an OS-assigned port.
pub fn rand_port() -> Result<u16> {
    let mut rng = rand::rng();
    for _ in 0..RAND_PORT_ATTEMPTS {
        let port = rng.random_range(RAND_PORT_MIN..=u16::MAX);
        if TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).is_ok() {
            return Ok(port);
        }
    }

    tracing::warn!("no random port free, using an ephemeral one");
    let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    Ok(listener.local_addr()?.port())
}

/// Blocks until `port` is listening on `host`, reading the host's
/// `/proc/net/<proto>*` tables every 100ms.
pub fn wait_port_listen(port: u16, proto: Proto, host: &Host, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    let cmd = format!("cat /proc/net/{proto}*");
    loop {
        let table = Cmd::run(&cmd, host)?.stdout();
        if has_listener(&table, port, proto == Proto::Tcp) {
            tracing::debug!(port, hex = %port_hex(port), %host, "port listening");
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(LoadError::PortListenTimeout {
                port,
                proto: proto.to_string(),
            });
        }
        thread::sleep(LISTEN_POLL);
    }
}
