//! Stand-in for `iperf3` used by the stub-tool integration tests.
//!
//! Understands just enough of the real command line:
//!
//! * `-s -p PORT` listens on PORT, takes one connection, drains it and exits.
//! * `-c ADDR -p PORT [-t SECS]` connects and sends until SECS pass or the
//!   peer goes away.
//! * `--refuse` makes a client exit 1 without connecting.

use anyhow::{bail, Context, Result};
use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, TcpListener, TcpStream};
use std::time::{Duration, Instant};

fn main() -> Result<()> {
    let mut args = std::env::args().skip(1);

    let mut server = false;
    let mut connect: Option<IpAddr> = None;
    let mut port: Option<u16> = None;
    let mut secs = 10u64;
    let mut refuse = false;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-s" => server = true,
            "-c" => {
                let addr = args.next().context("missing -c value")?;
                connect = Some(addr.parse()?);
            }
            "-p" => {
                port = Some(args.next().context("missing -p value")?.parse()?);
            }
            "-t" => {
                secs = args.next().context("missing -t value")?.parse()?;
            }
            "--refuse" => refuse = true,
            // -1, --one-off, -P N and friends don't change what we do.
            "-P" => {
                args.next();
            }
            _ => {}
        }
    }

    let port = port.context("missing -p")?;
    if server {
        return serve(port);
    }
    let Some(addr) = connect else {
        bail!("need -s or -c");
    };
    if refuse {
        eprintln!("iperf3: error - unable to connect to server: Connection refused");
        std::process::exit(1);
    }
    send(addr, port, Duration::from_secs(secs))
}

fn serve(port: u16) -> Result<()> {
    let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))
        .with_context(|| format!("bind {port}"))?;
    println!("Server listening on {port}");
    let (mut conn, peer) = listener.accept()?;
    println!("Accepted connection from {peer}");
    let mut buf = [0u8; 16 * 1024];
    let mut total = 0usize;
    loop {
        match conn.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => total += n,
        }
    }
    println!("receiver {total} bytes");
    Ok(())
}

fn send(addr: IpAddr, port: u16, duration: Duration) -> Result<()> {
    let mut conn =
        TcpStream::connect((addr, port)).with_context(|| format!("connect {addr}:{port}"))?;
    let buf = [0x5au8; 16 * 1024];
    let start = Instant::now();
    let mut total = 0usize;
    while start.elapsed() < duration {
        match conn.write(&buf) {
            Ok(n) => total += n,
            Err(_) => break,
        }
    }
    println!("sender {total} bytes");
    Ok(())
}
