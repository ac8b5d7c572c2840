//! Throughput exercise for the transport: bind a host, optionally connect
//! to a peer, and blast bytes at it. The receiving side reports the
//! average speed once in a while.
//!
//! Server: `chat 127.0.0.1:5000`
//! Client: `chat 127.0.0.1:5001 -c 127.0.0.1:5000`

use std::net::SocketAddr;
use std::process;
use std::time::Duration as StdDuration;

use getopts::Options;

use rudp::phy::UdpDevice;
use rudp::time::Instant;
use rudp::{Callbacks, Config, Connection, ConnectionId, Host};

const ITERATIONS_BEFORE_SLEEP: u32 = 100;

#[derive(Default)]
struct Meter {
    bytes_received: u64,
    window_start: Option<Instant>,
    reports: u32,
}

impl Callbacks for Meter {
    fn connected(&mut self, id: ConnectionId, _conn: &mut Connection) {
        println!("connection {id}: connected");
    }

    fn unable_to_connect(&mut self, id: ConnectionId, _conn: &mut Connection) {
        println!("connection {id}: unable to connect");
        process::exit(1);
    }

    fn incoming_connection(&mut self, id: ConnectionId, _conn: &mut Connection) {
        println!("connection {id}: incoming connection");
    }

    fn incoming_data(&mut self, _id: ConnectionId, conn: &mut Connection, _bytes_ready: u32) {
        let mut buf = [0u8; 65536];
        loop {
            let count = conn.read(&mut buf);
            if count == 0 {
                break;
            }
            self.bytes_received += count as u64;
        }

        let now = Instant::now();
        let start = *self.window_start.get_or_insert(now);
        self.reports += 1;
        if self.reports == 10_000 {
            let elapsed = (now - start).total_millis();
            if elapsed > 0 {
                let speed = self.bytes_received as f64 / elapsed as f64 * 1000.0;
                println!("===================== average speed: {speed:.0} bytes/sec");
            }
            self.window_start = Some(now);
            self.bytes_received = 0;
            self.reports = 0;
        }
    }

    fn connection_lost(&mut self, id: ConnectionId, _conn: &mut Connection) {
        println!("connection {id}: connection lost");
        process::exit(0);
    }
}

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    let mut opts = Options::new();
    opts.optopt("c", "connect", "connect to a remote host", "ADDR:PORT");
    opts.optflag("h", "help", "print this help");

    let matches = match opts.parse(&args[1..]) {
        Ok(matches) => matches,
        Err(err) => {
            eprintln!("{err}");
            process::exit(1);
        }
    };
    if matches.opt_present("h") || matches.free.len() != 1 {
        let brief = format!("Usage: {} BIND_ADDR:PORT [options]", args[0]);
        print!("{}", opts.usage(&brief));
        return;
    }

    let bind_addr: SocketAddr = matches.free[0].parse().expect("invalid bind address");
    let remote_addr: Option<SocketAddr> =
        matches.opt_str("c").map(|s| s.parse().expect("invalid remote address"));

    let config = Config {
        random_seed: Instant::now().total_millis() as u64,
        ..Config::default()
    };

    let mut device = match UdpDevice::bind(bind_addr, config.socket_buf_size) {
        Ok(device) => device,
        Err(err) => {
            eprintln!("can't bind {bind_addr}: {err}");
            process::exit(1);
        }
    };
    let mut host = Host::new(config);
    let mut meter = Meter::default();

    let conn = remote_addr.map(|remote| {
        host.connect(Instant::now(), remote)
            .expect("can't create a new connection")
    });

    let payload = [0x5au8; 10240];
    let mut idle_count = 0u32;
    loop {
        if host.poll(Instant::now(), &mut device, &mut meter) {
            idle_count = 0;
        } else {
            idle_count += 1;
            if idle_count > ITERATIONS_BEFORE_SLEEP {
                std::thread::sleep(StdDuration::from_millis(2));
                idle_count = 0;
            }
        }

        if let Some(conn) = conn {
            if host.state(conn) == rudp::State::Connected {
                host.send(conn, &payload);
            }
        }
    }
}
