//! Test environment and tuning.
//!
//! Configuration comes from a TOML file and is then overridden by the
//! environment variables kselftest's `net.config` uses (`NETIF`, `LOCAL_V4`,
//! `LOCAL_V6`, `REMOTE_V4`, `REMOTE_V6`, `REMOTE_TYPE`, `REMOTE_ARGS`). The
//! resolved [`NetEnv`] and [`LoadTuning`] are immutable.

use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{LoadError, Result};
use crate::host::Host;
use crate::poll::{DEFAULT_INTERVAL, DEFAULT_ITERATIONS};
use crate::port::LISTEN_TIMEOUT;
use crate::process::{Cmd, DEFAULT_GRACE};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConfigInput {
    pub ifname: Option<String>,
    pub local_v4: Option<String>,
    pub local_v6: Option<String>,
    pub remote_v4: Option<String>,
    pub remote_v6: Option<String>,
    pub remote: RemoteInput,
    pub tuning: LoadTuningInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RemoteInput {
    /// `local`, `netns` or `ssh`.
    pub kind: Option<String>,
    /// Namespace name or ssh destination.
    pub target: Option<String>,
    /// Extra ssh options, placed before the destination.
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoadTuningInput {
    pub poll_iterations: Option<u32>,
    pub poll_interval_ms: Option<u64>,
    pub settle_ms: Option<u64>,
    pub ramp_pps: Option<u64>,
    pub parallel: Option<u32>,
    pub duration_s: Option<u64>,
    pub stop_timeout_ms: Option<u64>,
    pub stop_poll_ms: Option<u64>,
    pub listen_timeout_ms: Option<u64>,
    pub grace_ms: Option<u64>,
}

/// Timing and sizing of the traffic workflow.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadTuning {
    pub poll_iterations: u32,
    pub poll_interval: Duration,
    /// Pause between the server listening and the client starting.
    pub settle: Duration,
    /// Rate that counts as ramped up.
    pub ramp_pps: u64,
    /// Parallel client streams (`iperf3 -P`).
    pub parallel: u32,
    /// Nominal client duration (`iperf3 -t`); teardown is always explicit.
    pub duration: Duration,
    pub stop_timeout: Duration,
    pub stop_poll: Duration,
    pub listen_timeout: Duration,
    /// Time a terminated process gets before it is killed.
    pub grace: Duration,
}

impl Default for LoadTuning {
    fn default() -> Self {
        Self {
            poll_iterations: DEFAULT_ITERATIONS,
            poll_interval: DEFAULT_INTERVAL,
            settle: Duration::from_millis(100),
            ramp_pps: 1000,
            parallel: 16,
            duration: Duration::from_secs(86400),
            stop_timeout: Duration::from_secs(5),
            stop_poll: Duration::from_millis(5),
            listen_timeout: LISTEN_TIMEOUT,
            grace: DEFAULT_GRACE,
        }
    }
}

impl LoadTuningInput {
    pub fn resolve(self) -> Result<LoadTuning> {
        let d = LoadTuning::default();
        let ms = |v: Option<u64>, default: Duration| v.map(Duration::from_millis).unwrap_or(default);

        let tuning = LoadTuning {
            poll_iterations: self.poll_iterations.unwrap_or(d.poll_iterations),
            poll_interval: ms(self.poll_interval_ms, d.poll_interval),
            settle: ms(self.settle_ms, d.settle),
            ramp_pps: self.ramp_pps.unwrap_or(d.ramp_pps),
            parallel: self.parallel.unwrap_or(d.parallel).max(1),
            duration: self.duration_s.map(Duration::from_secs).unwrap_or(d.duration),
            stop_timeout: ms(self.stop_timeout_ms, d.stop_timeout),
            stop_poll: ms(self.stop_poll_ms, d.stop_poll),
            listen_timeout: ms(self.listen_timeout_ms, d.listen_timeout),
            grace: ms(self.grace_ms, d.grace),
        };
        if tuning.poll_iterations == 0 {
            return Err(LoadError::Config("poll_iterations must be at least 1".into()));
        }
        if tuning.duration.is_zero() {
            return Err(LoadError::Config("duration_s must be non-zero".into()));
        }
        Ok(tuning)
    }
}

/// Addressing of the local and remote endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetEnv {
    /// Local interface whose receive counter is watched.
    pub ifname: String,
    /// Local address the remote connects to.
    pub addr: IpAddr,
    /// Remote address local clients connect to.
    pub remote_addr: IpAddr,
    pub remote: Host,
}

/// A fully resolved configuration file.
#[derive(Debug, Clone)]
pub struct Config {
    pub env: NetEnv,
    pub tuning: LoadTuning,
}

impl NetEnv {
    pub fn new(ifname: impl Into<String>, addr: IpAddr, remote_addr: IpAddr, remote: Host) -> Self {
        Self {
            ifname: ifname.into(),
            addr,
            remote_addr,
            remote,
        }
    }

    /// Fails unless `tool` is available locally and, with `remote`, on the
    /// remote host too.
    pub fn require_cmd(&self, tool: &str, remote: bool) -> Result<()> {
        check_cmd(tool, &Host::Local)?;
        if remote {
            check_cmd(tool, &self.remote)?;
        }
        Ok(())
    }
}

fn check_cmd(tool: &str, host: &Host) -> Result<()> {
    match Cmd::run(&format!("command -v {tool}"), host) {
        Ok(_) => Ok(()),
        Err(LoadError::CommandFailed { .. }) => Err(LoadError::MissingCommand {
            tool: tool.to_string(),
            host: host.to_string(),
        }),
        Err(e) => Err(e),
    }
}

impl ConfigInput {
    /// Overrides file values with kselftest-style variables from `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let set = |slot: &mut Option<String>, key: &str| {
            if let Some(v) = lookup(key).filter(|v| !v.trim().is_empty()) {
                *slot = Some(v.trim().to_string());
            }
        };
        set(&mut self.ifname, "NETIF");
        set(&mut self.local_v4, "LOCAL_V4");
        set(&mut self.local_v6, "LOCAL_V6");
        set(&mut self.remote_v4, "REMOTE_V4");
        set(&mut self.remote_v6, "REMOTE_V6");
        set(&mut self.remote.kind, "REMOTE_TYPE");
        set(&mut self.remote.target, "REMOTE_ARGS");
    }

    pub fn resolve(self) -> Result<Config> {
        let ifname = self
            .ifname
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| LoadError::Config("ifname (NETIF) is required".into()))?;

        let addr = pick_addr("local", self.local_v4.as_deref(), self.local_v6.as_deref())?;
        let remote_addr = pick_addr("remote", self.remote_v4.as_deref(), self.remote_v6.as_deref())?;
        let remote = self.remote.resolve()?;

        Ok(Config {
            env: NetEnv {
                ifname,
                addr,
                remote_addr,
                remote,
            },
            tuning: self.tuning.resolve()?,
        })
    }
}

impl RemoteInput {
    fn resolve(self) -> Result<Host> {
        let target = self.target.filter(|t| !t.trim().is_empty());
        match self.kind.as_deref().map(str::to_ascii_lowercase).as_deref() {
            None | Some("local") => Ok(Host::Local),
            Some("netns") => target
                .map(Host::Netns)
                .ok_or_else(|| LoadError::Config("netns remote needs a namespace name".into())),
            Some("ssh") => target
                .map(|target| Host::Ssh {
                    target,
                    args: self.args,
                })
                .ok_or_else(|| LoadError::Config("ssh remote needs a destination".into())),
            Some(other) => Err(LoadError::Config(format!("unknown remote type '{other}'"))),
        }
    }
}

/// IPv6 wins when both families are configured.
fn pick_addr(side: &str, v4: Option<&str>, v6: Option<&str>) -> Result<IpAddr> {
    let parse = |s: &str| {
        s.parse::<IpAddr>()
            .map_err(|e| LoadError::Config(format!("invalid {side} address '{s}': {e}")))
    };
    match (v4, v6) {
        (_, Some(v6)) => parse(v6),
        (Some(v4), None) => parse(v4),
        (None, None) => Err(LoadError::Config(format!(
            "{side} address required (set {side}_v4 or {side}_v6)"
        ))),
    }
}

impl Config {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        Self::parse(input, |_| None)
    }

    /// Reads `path` (when given) and applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let text = match path {
            Some(p) => std::fs::read_to_string(p)
                .map_err(|e| LoadError::Config(format!("reading {}: {e}", p.display())))?,
            None => String::new(),
        };
        Self::parse(&text, |key| std::env::var(key).ok())
    }

    fn parse<F>(input: &str, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut parsed: ConfigInput = if input.trim().is_empty() {
            ConfigInput::default()
        } else {
            toml::from_str(input).map_err(|e| LoadError::Config(format!("Invalid config TOML: {e}")))?
        };
        parsed.apply_env(lookup);
        parsed.resolve()
    }
}
