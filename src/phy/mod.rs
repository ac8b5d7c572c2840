/*! Access to networking hardware.

The `phy` module provides the datagram adapter the rest of the stack is
written against: the [Device] trait, a non-blocking UDP implementation of
it ([UdpDevice]), and an in-memory [Loopback] mesh used by the tests and
able to simulate packet loss.

[Device]: trait.Device.html
[UdpDevice]: struct.UdpDevice.html
[Loopback]: struct.Loopback.html
*/

mod loopback;
mod udp;

pub use self::loopback::{Loopback, Network};
pub use self::udp::UdpDevice;

use std::net::SocketAddr;

/// Maximum size of a datagram, header included.
pub const MAX_PACKET_SIZE: usize = 1280;

/// A non-blocking datagram endpoint.
///
/// Every method returns immediately. A partial or failed send reports
/// zero bytes and is treated by the stack as a dropped packet; loss is
/// the transport's business, not the device's.
pub trait Device {
    /// Whether a datagram is ready to be received.
    fn data_available(&self) -> bool;

    /// Receive one datagram into `buf`, returning its length and source
    /// address, or `None` when nothing is pending.
    fn recv(&mut self, buf: &mut [u8]) -> Option<(usize, SocketAddr)>;

    /// Send one datagram to `dst`. Returns the number of bytes accepted;
    /// zero means the datagram was not sent.
    fn send(&mut self, buf: &[u8], dst: SocketAddr) -> usize;
}
