//! Execution targets: the local host, a network namespace, or an ssh peer.

use std::fmt;
use std::process::Command;

/// Where a command runs.
///
/// Every command string is handed to `sh -c` on the target so globs such as
/// `/proc/net/tcp*` expand on the host that owns the files.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Host {
    #[default]
    Local,
    /// A Linux network namespace, entered via `ip netns exec`.
    Netns(String),
    /// A remote machine reached over ssh. `args` are passed before the target.
    Ssh { target: String, args: Vec<String> },
}

impl Host {
    /// Builds a `Command` running `cmd` through the shell on this host.
    pub fn command(&self, cmd: &str) -> Command {
        match self {
            Host::Local => {
                let mut c = Command::new("sh");
                c.args(["-c", cmd]);
                c
            }
            Host::Netns(name) => {
                let mut c = Command::new("ip");
                c.args(["netns", "exec", name, "sh", "-c", cmd]);
                c
            }
            Host::Ssh { target, args } => {
                let mut c = Command::new("ssh");
                c.args(args).arg(target).arg(cmd);
                c
            }
        }
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Host::Local => write!(f, "local host"),
            Host::Netns(name) => write!(f, "netns {name}"),
            Host::Ssh { target, .. } => write!(f, "ssh {target}"),
        }
    }
}
