use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::rc::Rc;

use super::{Device, MAX_PACKET_SIZE};
use crate::rand::Rand;

/// An in-memory datagram mesh.
///
/// Endpoints joined to the same network exchange datagrams through
/// per-endpoint queues, so several hosts can be driven from one thread
/// without touching a real socket. The network can drop a configurable
/// percentage of datagrams using a seeded [`Rand`], which makes loss
/// scenarios reproducible.
#[derive(Debug, Clone)]
pub struct Network {
    inner: Rc<RefCell<Inner>>,
}

#[derive(Debug)]
struct Inner {
    queues: BTreeMap<SocketAddr, VecDeque<(SocketAddr, Vec<u8>)>>,
    loss_percent: u32,
    rand: Rand,
}

impl Network {
    pub fn new() -> Network {
        Network {
            inner: Rc::new(RefCell::new(Inner {
                queues: BTreeMap::new(),
                loss_percent: 0,
                rand: Rand::new(0),
            })),
        }
    }

    /// Drop `percent` of delivered datagrams, drawn from a source seeded
    /// with `seed`.
    pub fn set_loss(&self, percent: u32, seed: u64) {
        let mut inner = self.inner.borrow_mut();
        inner.loss_percent = percent.min(100);
        inner.rand = Rand::new(seed);
    }

    /// Attach an endpoint with the given address to the network.
    pub fn join(&self, addr: SocketAddr) -> Loopback {
        self.inner.borrow_mut().queues.entry(addr).or_default();
        Loopback {
            addr,
            network: self.inner.clone(),
        }
    }
}

impl Default for Network {
    fn default() -> Network {
        Network::new()
    }
}

/// One endpoint of a [`Network`].
#[derive(Debug)]
pub struct Loopback {
    addr: SocketAddr,
    network: Rc<RefCell<Inner>>,
}

impl Loopback {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Device for Loopback {
    fn data_available(&self) -> bool {
        self.network
            .borrow()
            .queues
            .get(&self.addr)
            .is_some_and(|queue| !queue.is_empty())
    }

    fn recv(&mut self, buf: &mut [u8]) -> Option<(usize, SocketAddr)> {
        let (src, datagram) = self
            .network
            .borrow_mut()
            .queues
            .get_mut(&self.addr)?
            .pop_front()?;
        let size = datagram.len().min(buf.len());
        buf[..size].copy_from_slice(&datagram[..size]);
        Some((size, src))
    }

    fn send(&mut self, buf: &[u8], dst: SocketAddr) -> usize {
        if buf.len() > MAX_PACKET_SIZE {
            return 0;
        }

        let mut inner = self.network.borrow_mut();
        if inner.loss_percent > 0 && inner.rand.rand_u32() % 100 < inner.loss_percent {
            net_trace!("phy: loopback dropped {} octets to {}", buf.len(), dst);
            return buf.len();
        }

        match inner.queues.get_mut(&dst) {
            Some(queue) => {
                queue.push_back((self.addr, buf.to_vec()));
                buf.len()
            }
            // no such endpoint, the datagram vanishes into the void
            None => buf.len(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn delivers_between_endpoints() {
        let network = Network::new();
        let mut a = network.join(addr(5000));
        let mut b = network.join(addr(6000));

        assert!(!b.data_available());
        assert_eq!(a.send(b"hello", addr(6000)), 5);
        assert!(b.data_available());

        let mut buf = [0u8; 16];
        let (size, src) = b.recv(&mut buf).unwrap();
        assert_eq!(&buf[..size], b"hello");
        assert_eq!(src, addr(5000));
        assert!(!b.data_available());
    }

    #[test]
    fn full_loss_drops_everything() {
        let network = Network::new();
        let mut a = network.join(addr(5000));
        let b = network.join(addr(6000));

        network.set_loss(100, 1);
        assert_eq!(a.send(b"hello", addr(6000)), 5);
        assert!(!b.data_available());
    }

    #[test]
    fn oversized_datagram_rejected() {
        let network = Network::new();
        let mut a = network.join(addr(5000));
        let big = vec![0u8; MAX_PACKET_SIZE + 1];
        assert_eq!(a.send(&big, addr(6000)), 0);
    }
}
