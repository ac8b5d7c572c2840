/*! A connection-oriented, reliable, in-order byte-stream transport over UDP.

One bound datagram endpoint (a [Host]) multiplexes many logical
connections, each identified by a pair of 16-bit ports on top of the
network address. The transport provides ordered delivery, selective
acknowledgments with retransmission of lost data, TCP-style congestion
control, connection setup and teardown (including simultaneous open),
keep-alive pings, and bounded per-connection windows.

The stack is strictly single-threaded and cooperative: it only advances
inside [`Host::poll`], never blocks, and spawns nothing. The caller owns
the clock (any wrapping 32-bit millisecond source), the datagram socket
(anything implementing [`phy::Device`]), and receives notifications
through the [`Callbacks`] trait, synchronously on its own thread.

```no_run
use rudp::phy::UdpDevice;
use rudp::time::Instant;
use rudp::{Config, Host};

let config = Config::default();
let mut device = UdpDevice::bind("127.0.0.1:5000".parse().unwrap(), config.socket_buf_size)
    .expect("bind failed");
let mut host = Host::new(config);

let conn = host.connect(Instant::now(), "127.0.0.1:6000".parse().unwrap());

loop {
    if !host.poll(Instant::now(), &mut device, &mut ()) {
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
    # break;
}
# let _ = conn;
```

[Host]: struct.Host.html
[`Callbacks`]: trait.Callbacks.html
*/

#[macro_use]
mod macros;

pub mod config;
pub mod iface;
pub mod phy;
pub mod rand;
pub mod socket;
pub mod storage;
pub mod time;
pub mod wire;

pub use self::config::Config;
pub use self::iface::{Callbacks, ConnectionId, Host};
pub use self::socket::{Connection, State};
