use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::os::fd::AsRawFd;

use super::Device;

/// A non-blocking UDP socket usable as a [`Device`].
///
/// Binds the socket, requests the configured kernel receive buffer and
/// switches to non-blocking mode. Datagram boundaries map one-to-one to
/// transport packets.
#[derive(Debug)]
pub struct UdpDevice {
    socket: UdpSocket,
}

impl UdpDevice {
    /// Bind a UDP socket to `addr` with a `recv_buf_size`-byte kernel
    /// receive buffer (pass [`Config::socket_buf_size`] here).
    ///
    /// [`Config::socket_buf_size`]: crate::config::Config::socket_buf_size
    pub fn bind(addr: SocketAddr, recv_buf_size: u32) -> io::Result<UdpDevice> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;

        // std exposes no SO_RCVBUF setter
        let value = recv_buf_size as libc::c_int;
        let rc = unsafe {
            libc::setsockopt(
                socket.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_RCVBUF,
                &value as *const libc::c_int as *const libc::c_void,
                core::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(UdpDevice { socket })
    }

    /// The local address the socket is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

impl Device for UdpDevice {
    fn data_available(&self) -> bool {
        let mut fds = [libc::pollfd {
            fd: self.socket.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        }];
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), 1, 0) };
        rc > 0 && (fds[0].revents & libc::POLLIN) != 0
    }

    fn recv(&mut self, buf: &mut [u8]) -> Option<(usize, SocketAddr)> {
        match self.socket.recv_from(buf) {
            Ok((size, addr)) => Some((size, addr)),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => None,
            Err(err) => {
                net_debug!("phy: recv failed: {}", err);
                None
            }
        }
    }

    fn send(&mut self, buf: &[u8], dst: SocketAddr) -> usize {
        match self.socket.send_to(buf, dst) {
            Ok(sent) => sent,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => 0,
            Err(err) => {
                net_debug!("phy: send to {} failed: {}", dst, err);
                0
            }
        }
    }
}
