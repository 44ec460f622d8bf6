//! End-to-end traffic over the loopback interface.
//!
//! Runs the real iperf3 server/client pair on this host, with `lo` as the
//! watched interface and the "remote" being the local host.
//!
//! **Requirements:** Linux `/proc/net/tcp`, `iperf3` and `ip` with JSON
//! output. Tests skip themselves otherwise.
//!
//! ```bash
//! cargo test -p netload --test loopback -- --nocapture
//! ```

use std::time::{Duration, Instant};

use netload::conntable::has_live_peer;
use netload::process::Cmd;
use netload::test_util::have_cmd;
use netload::{Host, LoadError, NetEnv, PollTarget, TrafficMonitor};

fn loopback_env() -> Option<NetEnv> {
    if !have_cmd("iperf3") || !have_cmd("ip") || !std::path::Path::new("/proc/net/tcp").exists() {
        return None;
    }
    Some(NetEnv::new(
        "lo",
        "127.0.0.1".parse().unwrap(),
        "127.0.0.1".parse().unwrap(),
        Host::Local,
    ))
}

#[test]
fn traffic_ramps_up_and_stops_cleanly() {
    let Some(env) = loopback_env() else {
        eprintln!("Skipping traffic_ramps_up_and_stops_cleanly, missing iperf3/ip/procfs");
        return;
    };

    let mut monitor = TrafficMonitor::start(&env, None).expect("traffic should ramp up on lo");
    let port = monitor.port();

    // Still flowing after start returned.
    assert!(monitor.wait_pkts(PollTarget::Rate { pps: 1000 }).unwrap());

    let start = Instant::now();
    assert!(monitor.wait_pkts_and_stop(1000).unwrap());
    assert!(start.elapsed() < Duration::from_secs(15));

    let table = Cmd::run("cat /proc/net/tcp*", &Host::Local).unwrap().stdout();
    assert!(!has_live_peer(&table, port), "connection to {port} still live");
}

#[test]
fn remote_one_shot_exchange() {
    let Some(env) = loopback_env() else {
        eprintln!("Skipping remote_one_shot_exchange, missing iperf3/ip/procfs");
        return;
    };

    let proc = netload::load::run_remote_test(&env, None, "-t 1", &Default::default())
        .expect("one-shot exchange");
    assert!(proc.status().unwrap().success());
    assert!(proc.stdout().contains("receiver"), "{}", proc.stdout());
}

#[test]
fn remote_client_failure_names_client_phase() {
    let Some(env) = loopback_env() else {
        eprintln!("Skipping remote_client_failure_names_client_phase, missing iperf3/ip/procfs");
        return;
    };

    let err = netload::load::run_remote_test(&env, None, "--no-such-iperf3-flag", &Default::default())
        .unwrap_err();
    assert!(matches!(err, LoadError::ClientCommand(_)), "{err}");
    assert!(err.to_string().contains("client command"), "{err}");
}
