//! Parsing of the kernel connection table (`/proc/net/tcp`, `/proc/net/tcp6`,
//! and the UDP equivalents).
//!
//! Each data row looks like
//!
//! ```text
//!    0: 0100007F:1F90 0100007F:C350 01 00000000:00000000 00:00000000 00000000 ...
//! ```
//!
//! with `sl`, `local_address`, `rem_address` and `st` as the first four
//! columns. Addresses are hex, ports are 4-digit uppercase hex, and the state
//! is a 2-digit hex code.

/// Kernel TCP state code (`st` column).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpState(pub u8);

impl TcpState {
    pub const ESTABLISHED: Self = Self(0x01);
    pub const FIN_WAIT1: Self = Self(0x04);
    pub const TIME_WAIT: Self = Self(0x06);
    pub const LISTEN: Self = Self(0x0A);

    /// TIME_WAIT is the only state counted as closed: the socket is gone as
    /// far as either peer is concerned.
    pub fn is_closed(self) -> bool {
        self == Self::TIME_WAIT
    }
}

/// One row of the connection table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnEntry {
    pub local_port: u16,
    pub remote_port: u16,
    pub state: TcpState,
}

/// Port in the table's own notation, e.g. `80` → `0050`.
pub fn port_hex(port: u16) -> String {
    format!("{port:04X}")
}

/// Parses one data row. Header lines and malformed rows yield `None`.
pub fn parse_line(line: &str) -> Option<ConnEntry> {
    let mut fields = line.split_whitespace();
    let slot = fields.next()?;
    if !slot.ends_with(':') {
        return None;
    }
    let local_port = endpoint_port(fields.next()?)?;
    let remote_port = endpoint_port(fields.next()?)?;
    let state = u8::from_str_radix(fields.next()?, 16).ok()?;
    Some(ConnEntry {
        local_port,
        remote_port,
        state: TcpState(state),
    })
}

fn endpoint_port(endpoint: &str) -> Option<u16> {
    let (_addr, port) = endpoint.rsplit_once(':')?;
    if port.len() != 4 {
        return None;
    }
    u16::from_str_radix(port, 16).ok()
}

/// All parseable rows of one or more concatenated tables.
pub fn entries(table: &str) -> impl Iterator<Item = ConnEntry> + '_ {
    table.lines().filter_map(parse_line)
}

/// Whether a connection whose peer is `port` is still open.
///
/// Read on the client's host, the server port shows up in the `rem_address`
/// column. Anything but TIME_WAIT counts as live.
pub fn has_live_peer(table: &str, port: u16) -> bool {
    entries(table).any(|e| e.remote_port == port && !e.state.is_closed())
}

/// Whether something is bound to local `port`. For TCP the socket must be in
/// LISTEN; UDP rows have no listen state, so any row counts.
pub fn has_listener(table: &str, port: u16, tcp: bool) -> bool {
    entries(table).any(|e| e.local_port == port && (!tcp || e.state == TcpState::LISTEN))
}
