//! Background iperf3 traffic with ramp-up and teardown detection.
//!
//! [`TrafficMonitor::start`] launches a single-connection `iperf3` server
//! locally and a many-stream client on the remote host, then watches the
//! local interface's receive counter until traffic is flowing. Teardown stops
//! the client before the server and then polls the remote connection table
//! until the connection is really gone, so the next test starts from a quiet
//! link.

use std::thread;
use std::time::{Duration, Instant};

use crate::config::{LoadTuning, NetEnv};
use crate::conntable::{has_live_peer, port_hex};
use crate::error::{LoadError, Result};
use crate::host::Host;
use crate::poll::{poll_packets, PollTarget};
use crate::port::{rand_port, wait_port_listen, Proto};
use crate::process::{Bkg, Cmd};
use crate::stats::{IfaceCounter, PacketCounter};

/// A running iperf3 server/client pair.
pub struct TrafficMonitor {
    env: NetEnv,
    port: u16,
    tuning: LoadTuning,
    counter: Box<dyn PacketCounter>,
    server: Cmd,
    client: Cmd,
}

impl TrafficMonitor {
    /// Starts traffic with default tuning, watching `env.ifname`.
    pub fn start(env: &NetEnv, port: Option<u16>) -> Result<Self> {
        let counter = IfaceCounter::new(env.ifname.clone(), Host::Local);
        Self::start_with(env, port, LoadTuning::default(), Box::new(counter))
    }

    /// Starts traffic and returns once `counter` shows it ramping up.
    ///
    /// If the rate never reaches `tuning.ramp_pps`, both processes are stopped
    /// with their output logged and [`LoadError::RampUp`] is returned.
    pub fn start_with(
        env: &NetEnv,
        port: Option<u16>,
        tuning: LoadTuning,
        counter: Box<dyn PacketCounter>,
    ) -> Result<Self> {
        env.require_cmd("iperf3", true)?;

        let port = match port {
            Some(p) => p,
            None => rand_port()?,
        };

        let server = Cmd::background(&format!("iperf3 -s -1 -p {port}"), &Host::Local)?;
        wait_port_listen(port, Proto::Tcp, &Host::Local, tuning.listen_timeout)?;
        thread::sleep(tuning.settle);

        let client_cmd = format!(
            "iperf3 -c {} -P {} -p {port} -t {}",
            env.addr,
            tuning.parallel,
            tuning.duration.as_secs()
        );
        let client = Cmd::background(&client_cmd, &env.remote)?;

        tracing::info!(port, ifname = %env.ifname, remote = %env.remote, "iperf3 traffic started");

        let mut monitor = Self {
            env: env.clone(),
            port,
            tuning,
            counter,
            server,
            client,
        };

        let pps = monitor.tuning.ramp_pps;
        let ramped = match monitor.wait_pkts(PollTarget::Rate { pps }) {
            Ok(ramped) => ramped,
            Err(e) => {
                monitor.stop_after_failure();
                return Err(e);
            }
        };
        if !ramped {
            monitor.stop_after_failure();
            return Err(LoadError::RampUp);
        }

        tracing::info!(port, pps, "iperf3 traffic ramped up");
        Ok(monitor)
    }

    #[cfg(test)]
    pub(crate) fn from_parts(
        env: NetEnv,
        port: u16,
        tuning: LoadTuning,
        counter: Box<dyn PacketCounter>,
        server: Cmd,
        client: Cmd,
    ) -> Self {
        Self {
            env,
            port,
            tuning,
            counter,
            server,
            client,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Runs a one-shot exchange: a one-off server on the remote and a local
    /// client against it with `command` appended (e.g. `-u` for UDP).
    ///
    /// Returns the finished client. Errors name the phase that failed.
    pub fn run_remote_test(&self, env: &NetEnv, port: Option<u16>, command: &str) -> Result<Cmd> {
        run_remote_test(env, port, command, &self.tuning)
    }

    /// Polls the receive counter for `target` with this monitor's tuning.
    /// Running out of samples is `Ok(false)`.
    pub fn wait_pkts(&mut self, target: PollTarget) -> Result<bool> {
        poll_packets(
            self.counter.as_mut(),
            target,
            self.tuning.poll_iterations,
            self.tuning.poll_interval,
        )
    }

    /// Waits for `pkt_cnt` packets, then stops. Output is logged only when
    /// the count was not reached. Returns whether it was.
    pub fn wait_pkts_and_stop(mut self, pkt_cnt: u64) -> Result<bool> {
        let reached = self.wait_pkts(PollTarget::Count { packets: pkt_cnt })?;
        if !reached {
            tracing::warn!(pkt_cnt, port = self.port, "packet count not reached");
        }
        self.stop(!reached)?;
        Ok(reached)
    }

    /// Terminates the client, then the server, then waits for the
    /// connection to close on the remote side.
    pub fn stop(mut self, verbose: bool) -> Result<()> {
        self.terminate(verbose);
        self.wait_client_stopped()
    }

    fn terminate(&mut self, verbose: bool) {
        let grace = self.tuning.grace;
        for (name, proc) in [(">> Client:", &mut self.client), (">> Server:", &mut self.server)] {
            if let Err(e) = proc.process(true, false, grace) {
                tracing::warn!(cmd = %proc.command(), error = %e, "failed to terminate");
            }
            if verbose {
                log_output(name, proc);
            }
        }
    }

    fn stop_after_failure(&mut self) {
        self.terminate(true);
        if let Err(e) = self.wait_client_stopped() {
            tracing::warn!(error = %e, "teardown after failed start did not complete");
        }
    }

    fn wait_client_stopped(&self) -> Result<()> {
        let remote = &self.env.remote;
        wait_port_closed(
            || Ok(Cmd::run("cat /proc/net/tcp*", remote)?.stdout()),
            self.port,
            self.tuning.stop_timeout,
            self.tuning.stop_poll,
        )
    }
}

/// Free-standing form of [`TrafficMonitor::run_remote_test`].
pub fn run_remote_test(env: &NetEnv, port: Option<u16>, command: &str, tuning: &LoadTuning) -> Result<Cmd> {
    let server_phase = || -> Result<(u16, Bkg)> {
        let port = match port {
            Some(p) => p,
            None => rand_port()?,
        };
        // TCP listener by default; the client's arguments pick UDP.
        let server = Bkg::new(&format!("iperf3 -s 1 -p {port} --one-off"), &env.remote, true)?;
        if let Err(e) = wait_port_listen(port, Proto::Tcp, &env.remote, tuning.listen_timeout) {
            server.abort();
            return Err(e);
        }
        Ok((port, server))
    };
    let (port, server) = server_phase().map_err(|e| LoadError::ServerCommand(Box::new(e)))?;

    let client_cmd = format!("iperf3 -c {} -p {port} {command}", env.remote_addr);
    tracing::info!(port, cmd = %client_cmd, "running remote test client");
    let client = match Cmd::run(&client_cmd, &Host::Local) {
        Ok(client) => client,
        Err(e) => {
            // The server never got its connection; don't wait for it to exit.
            server.abort();
            return Err(LoadError::ClientCommand(Box::new(e)));
        }
    };

    // The one-off server exits by itself once the client is done.
    server
        .finish()
        .map_err(|e| LoadError::ServerCommand(Box::new(e)))?;
    Ok(client)
}

/// Polls the connection table returned by `fetch` until no live connection
/// to `port` remains.
///
/// Fails with [`LoadError::StopTimeout`] if one is still live after `timeout`.
pub fn wait_port_closed<F>(mut fetch: F, port: u16, timeout: Duration, sleep: Duration) -> Result<()>
where
    F: FnMut() -> Result<String>,
{
    let start = Instant::now();
    let end = start + timeout;
    while Instant::now() < end {
        let table = fetch()?;
        if !has_live_peer(&table, port) {
            tracing::debug!(port, hex = %port_hex(port), elapsed_ms = start.elapsed().as_millis() as u64, "connection closed");
            return Ok(());
        }
        thread::sleep(sleep);
    }
    Err(LoadError::StopTimeout {
        timeout,
        elapsed: start.elapsed(),
    })
}

fn log_output(name: &str, proc: &Cmd) {
    tracing::info!("{name}");
    for line in proc.stdout().lines().chain(proc.stderr().lines()) {
        tracing::info!("{line}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::have_cmd;
    use std::cell::Cell;
    use std::rc::Rc;

    fn live_row(port: u16) -> String {
        format!(
            "   1: 0200000A:C350 0100000A:{} 01 00000000:00000000 00:00000000 00000000     0        0 1 1\n",
            port_hex(port)
        )
    }

    fn closed_row(port: u16) -> String {
        format!(
            "   1: 0200000A:C350 0100000A:{} 06 00000000:00000000 03:00000F6A 00000000     0        0 0 3\n",
            port_hex(port)
        )
    }

    #[test]
    fn port_closed_after_retries() {
        let mut fetches = 0;
        wait_port_closed(
            || {
                fetches += 1;
                Ok(if fetches < 4 { live_row(80) } else { closed_row(80) })
            },
            80,
            Duration::from_secs(5),
            Duration::from_millis(1),
        )
        .unwrap();
        assert_eq!(fetches, 4);
    }

    #[test]
    fn port_closed_when_entry_disappears() {
        let mut fetches = 0;
        wait_port_closed(
            || {
                fetches += 1;
                Ok(if fetches < 3 { live_row(65535) } else { String::new() })
            },
            65535,
            Duration::from_secs(5),
            Duration::from_millis(1),
        )
        .unwrap();
        assert_eq!(fetches, 3);
    }

    #[test]
    fn other_ports_do_not_block_teardown() {
        wait_port_closed(
            || Ok(live_row(5202)),
            5201,
            Duration::from_millis(50),
            Duration::from_millis(1),
        )
        .unwrap();
    }

    #[test]
    fn live_port_times_out_with_elapsed() {
        let timeout = Duration::from_millis(100);
        let err = wait_port_closed(|| Ok(live_row(80)), 80, timeout, Duration::from_millis(5)).unwrap_err();
        match &err {
            LoadError::StopTimeout { elapsed, .. } => assert!(*elapsed >= timeout),
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.to_string().contains("timed out after 0.1s"), "{err}");
    }

    #[test]
    fn fetch_errors_propagate() {
        let err = wait_port_closed(
            || Err(LoadError::Stats("unreachable".into())),
            80,
            Duration::from_secs(1),
            Duration::from_millis(1),
        )
        .unwrap_err();
        assert!(matches!(err, LoadError::Stats(_)));
    }

    fn local_env() -> NetEnv {
        NetEnv::new(
            "lo",
            "127.0.0.1".parse().unwrap(),
            "127.0.0.1".parse().unwrap(),
            Host::Local,
        )
    }

    fn fast_tuning() -> LoadTuning {
        LoadTuning {
            poll_interval: Duration::ZERO,
            stop_timeout: Duration::from_secs(1),
            listen_timeout: Duration::from_millis(300),
            ..LoadTuning::default()
        }
    }

    /// A monitor over `sleep` processes and a scripted counter.
    fn scripted_monitor(samples: Vec<u64>) -> Option<(TrafficMonitor, Rc<Cell<usize>>)> {
        if !have_cmd("sleep") || !std::path::Path::new("/proc/net/tcp").exists() {
            return None;
        }
        let reads = Rc::new(Cell::new(0usize));
        let seen = reads.clone();
        let counter = move || -> Result<u64> {
            let i = seen.get();
            seen.set(i + 1);
            Ok(samples[i.min(samples.len() - 1)])
        };
        let server = Cmd::background("echo server-out; exec sleep 30", &Host::Local).unwrap();
        let client = Cmd::background("echo client-err >&2; exec sleep 30", &Host::Local).unwrap();
        let port = rand_port().unwrap();
        let monitor = TrafficMonitor::from_parts(
            local_env(),
            port,
            fast_tuning(),
            Box::new(counter),
            server,
            client,
        );
        Some((monitor, reads))
    }

    #[test]
    fn wait_pkts_and_stop_reports_count() {
        let Some((monitor, reads)) = scripted_monitor(vec![0, 500, 1500]) else {
            eprintln!("Skipping wait_pkts_and_stop_reports_count, no sleep or /proc");
            return;
        };
        let start = Instant::now();
        assert!(monitor.wait_pkts_and_stop(1000).unwrap());
        assert_eq!(reads.get(), 3);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn wait_pkts_and_stop_flat_counter() {
        let Some((monitor, reads)) = scripted_monitor(vec![42]) else {
            eprintln!("Skipping wait_pkts_and_stop_flat_counter, no sleep or /proc");
            return;
        };
        assert!(!monitor.wait_pkts_and_stop(1).unwrap());
        assert_eq!(reads.get(), 51);
    }

    #[test]
    fn stop_captures_output_once() {
        let Some((mut monitor, _)) = scripted_monitor(vec![0]) else {
            eprintln!("Skipping stop_captures_output_once, no sleep or /proc");
            return;
        };
        thread::sleep(Duration::from_millis(100));
        monitor.terminate(false);
        let client_status = monitor.client.status().expect("client reaped");
        let server_status = monitor.server.status().expect("server reaped");
        assert_eq!(monitor.client.stderr(), "client-err\n");
        assert_eq!(monitor.server.stdout(), "server-out\n");

        // A second pass must not signal or capture anything new.
        monitor.terminate(true);
        assert_eq!(monitor.client.status(), Some(client_status));
        assert_eq!(monitor.server.status(), Some(server_status));
        assert_eq!(monitor.client.stderr(), "client-err\n");
        monitor.stop(true).unwrap();
    }

    #[derive(Clone, Default)]
    struct LogBuf(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for LogBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    /// Runs `f` with a subscriber writing into a buffer and returns the log text.
    fn captured_logs(f: impl FnOnce()) -> String {
        let buf = LogBuf::default();
        let writer = buf.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        tracing::subscriber::with_default(subscriber, f);
        let bytes = buf.0.lock().unwrap().clone();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    #[test]
    fn verbose_stop_logs_each_process_once() {
        let Some((monitor, _)) = scripted_monitor(vec![0]) else {
            eprintln!("Skipping verbose_stop_logs_each_process_once, no sleep or /proc");
            return;
        };
        thread::sleep(Duration::from_millis(100));
        let logs = captured_logs(|| monitor.stop(true).unwrap());
        assert_eq!(logs.matches(">> Client:").count(), 1, "{logs}");
        assert_eq!(logs.matches(">> Server:").count(), 1, "{logs}");
        assert_eq!(logs.matches("client-err").count(), 1, "{logs}");
        assert_eq!(logs.matches("server-out").count(), 1, "{logs}");
    }

    #[test]
    fn quiet_stop_logs_no_output() {
        let Some((monitor, _)) = scripted_monitor(vec![0]) else {
            eprintln!("Skipping quiet_stop_logs_no_output, no sleep or /proc");
            return;
        };
        thread::sleep(Duration::from_millis(100));
        let logs = captured_logs(|| monitor.stop(false).unwrap());
        assert!(!logs.contains(">> Client:"), "{logs}");
        assert!(!logs.contains(">> Server:"), "{logs}");
        assert!(!logs.contains("client-err"), "{logs}");
        assert!(!logs.contains("server-out"), "{logs}");
    }

    #[test]
    fn remote_test_unreachable_remote_fails_in_server_phase() {
        let env = NetEnv {
            remote: Host::Netns("netload-unreachable-ns".into()),
            ..local_env()
        };
        let err = run_remote_test(&env, Some(5201), "-u", &fast_tuning()).unwrap_err();
        assert!(matches!(err, LoadError::ServerCommand(_)), "{err}");
        assert!(err.to_string().contains("server command"), "{err}");
    }
}
