use std::time::Duration;

use thiserror::Error;

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("required command '{tool}' not available on {host}")]
    MissingCommand { tool: String, host: String },

    #[error("iperf3 traffic did not ramp up")]
    RampUp,

    #[error("Unexpected error occurred while running server command: {0}")]
    ServerCommand(#[source] Box<LoadError>),

    #[error("Unexpected error occurred while running client command: {0}")]
    ClientCommand(#[source] Box<LoadError>),

    #[error(
        "Waiting for client to stop timed out after {}s (elapsed {:.3}s)",
        .timeout.as_secs_f64(),
        .elapsed.as_secs_f64()
    )]
    StopTimeout { timeout: Duration, elapsed: Duration },

    #[error("failed to spawn `{cmd}`: {source}")]
    Spawn {
        cmd: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to wait for `{cmd}`: {source}")]
    Wait {
        cmd: String,
        #[source]
        source: std::io::Error,
    },

    #[error("command `{cmd}` failed (exit code {code:?}): {stderr}")]
    CommandFailed {
        cmd: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("waiting for {proto} port {port} to listen timed out")]
    PortListenTimeout { port: u16, proto: String },

    #[error("interface stats: {0}")]
    Stats(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, LoadError>;
