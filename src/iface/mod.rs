/*! Host orchestration.

A [Host] multiplexes many logical connections over one datagram endpoint.
It owns the port table and the connection lists, decodes and dispatches
incoming datagrams, drives every connection's timers, and reaps terminated
connections — all within [`Host::poll`], the single cooperative tick.

[Host]: struct.Host.html
*/

use core::fmt;
use std::net::SocketAddr;

use slab::Slab;

use crate::config::Config;
use crate::phy::{Device, MAX_PACKET_SIZE};
use crate::rand::Rand;
use crate::socket::{ConfirmOutcome, Connection, HandshakePoll, State};
use crate::time::Instant;
use crate::wire::{Packet, Repr, SeqNumber};

/// Opaque handle to a connection owned by a [Host].
///
/// Handles of destroyed connections read as [`State::Closed`] and may be
/// reused for later connections, mirroring the in-place identity reuse of
/// recycled entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(usize);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The five notifications a host can raise while polling.
///
/// All methods default to doing nothing, so an implementation only
/// overrides what it cares about; `()` implements the trait for callers
/// that inspect connection states manually. Every callback runs
/// synchronously inside [`Host::poll`], on its caller's thread, and
/// receives the connection itself: reading inside `incoming_data` is the
/// intended pattern, since the window and the acknowledgments only move
/// forward as data is consumed.
pub trait Callbacks {
    /// A connection started locally (or by rendezvous) is established.
    fn connected(&mut self, _id: ConnectionId, _conn: &mut Connection) {}
    /// A locally started connection ran out of handshake attempts.
    fn unable_to_connect(&mut self, _id: ConnectionId, _conn: &mut Connection) {}
    /// A remotely initiated connection completed its handshake.
    fn incoming_connection(&mut self, _id: ConnectionId, _conn: &mut Connection) {}
    /// New contiguous bytes are ready; the argument is the total
    /// currently readable.
    fn incoming_data(&mut self, _id: ConnectionId, _conn: &mut Connection, _bytes_ready: u32) {}
    /// An established connection timed out or was torn down.
    fn connection_lost(&mut self, _id: ConnectionId, _conn: &mut Connection) {}
}

impl Callbacks for () {}

/// Number of entries in the dense port table; index 0 and 65535 are never
/// allocated.
const PORT_TABLE_SIZE: usize = 1 << 16;

/// A transport endpoint multiplexing connections over one datagram socket.
pub struct Host {
    config: Config,
    rand: Rand,
    connections: Slab<Connection>,
    /// Live connections, in creation order.
    conn_list: Vec<ConnectionId>,
    /// Connections in [`State::ConnectStarted`].
    started: Vec<ConnectionId>,
    /// Unconfirmed connections in [`State::ConnectReceived`].
    incoming: Vec<ConnectionId>,
    /// Dense local-port table; the double meaning of port 0 (CONNECT on
    /// the wire, unassigned locally) keeps entry 0 permanently empty.
    ports: Vec<Option<ConnectionId>>,
}

impl Host {
    pub fn new(config: Config) -> Host {
        let rand = Rand::new(config.random_seed);
        Host {
            config,
            rand,
            connections: Slab::new(),
            conn_list: Vec::new(),
            started: Vec::new(),
            incoming: Vec::new(),
            ports: vec![None; PORT_TABLE_SIZE],
        }
    }

    /// Make progress: drain the device, dispatch every datagram, then
    /// advance every connection's state machine once. Returns whether
    /// anything happened; callers typically sleep briefly on `false`.
    ///
    /// The timestamp drives every timer in the host; production callers
    /// pass [`Instant::now`].
    pub fn poll(
        &mut self,
        now: Instant,
        device: &mut dyn Device,
        callbacks: &mut dyn Callbacks,
    ) -> bool {
        let mut progressed = false;
        if self.ingress(now, device, callbacks) {
            progressed = true;
        }
        if self.process_connections(now, device, callbacks) {
            progressed = true;
        }
        progressed
    }

    /// Start a connection to `remote`. The CONNECT datagram leaves on the
    /// next poll. `None` when ports or connection slots are exhausted
    /// and nothing can be recycled.
    pub fn connect(&mut self, now: Instant, remote: SocketAddr) -> Option<ConnectionId> {
        let id = self.allocate_connection(remote, now)?;
        self.started.push(id);
        self.connections[id.0].start_connect();
        net_trace!("host: connection {} started to {}", id, remote);
        Some(id)
    }

    /// The state of a connection; stale handles read as [`State::Closed`].
    pub fn state(&self, id: ConnectionId) -> State {
        self.connections
            .get(id.0)
            .map_or(State::Closed, |conn| conn.state)
    }

    /// The peer address of an established connection.
    pub fn remote_address(&self, id: ConnectionId) -> Option<SocketAddr> {
        match self.connections.get(id.0) {
            Some(conn) if conn.state == State::Connected => Some(conn.remote_addr),
            _ => None,
        }
    }

    /// Borrow a connection for inspection.
    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(id.0)
    }

    /// Borrow a connection mutably, e.g. to `send` or `read` outside of a
    /// callback.
    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.connections.get_mut(id.0)
    }

    /// Append data to a connection's send buffer; see [`Connection::send`].
    pub fn send(&mut self, id: ConnectionId, data: &[u8]) -> usize {
        self.connections
            .get_mut(id.0)
            .map_or(0, |conn| conn.send(data))
    }

    /// Read delivered data from a connection; see [`Connection::read`].
    pub fn read(&mut self, id: ConnectionId, buf: &mut [u8]) -> usize {
        self.connections
            .get_mut(id.0)
            .map_or(0, |conn| conn.read(buf))
    }

    /// Destroy a connection immediately. No callback fires; the handle
    /// becomes stale.
    pub fn close(&mut self, id: ConnectionId) {
        let Some(conn) = self.connections.get(id.0) else {
            return;
        };
        let port = conn.local_port;
        // a terminated connection's port may already belong to someone else
        if self.ports[port as usize] == Some(id) {
            self.ports[port as usize] = None;
        }
        self.conn_list.retain(|&other| other != id);
        self.started.retain(|&other| other != id);
        self.incoming.retain(|&other| other != id);
        self.connections.remove(id.0);
        net_trace!("host: connection {} closed", id);
    }

    /// Tear down every connection, notifying `connection_lost` for the
    /// established ones, and leave the host empty.
    pub fn shutdown(&mut self, callbacks: &mut dyn Callbacks) {
        for id in self.conn_list.clone() {
            if self.connections.contains(id.0) {
                self.terminate(id, callbacks);
            }
        }
        self.connections.clear();
        self.conn_list.clear();
        self.started.clear();
        self.incoming.clear();
        self.ports.iter_mut().for_each(|entry| *entry = None);
    }

    // === ingress ===

    fn ingress(
        &mut self,
        now: Instant,
        device: &mut dyn Device,
        callbacks: &mut dyn Callbacks,
    ) -> bool {
        let mut buf = [0u8; MAX_PACKET_SIZE];
        let mut received = false;

        while device.data_available() {
            let Some((len, src)) = device.recv(&mut buf) else {
                break;
            };
            if len == 0 {
                continue;
            }
            self.dispatch(now, &buf[..len], src, device, callbacks);
            received = true;
        }

        received
    }

    fn dispatch(
        &mut self,
        now: Instant,
        data: &[u8],
        src: SocketAddr,
        device: &mut dyn Device,
        callbacks: &mut dyn Callbacks,
    ) {
        let repr = match Packet::new_checked(data).and_then(|packet| Repr::parse(&packet)) {
            Ok(repr) => repr,
            Err(_) => {
                net_debug!("host: malformed packet from {}", src);
                return;
            }
        };
        // length-checked above
        let payload = Packet::new_unchecked(data).payload();

        net_trace!("host: incoming {} + {} octets", repr, payload.len());

        if repr.dst_port == 0 {
            self.process_connect(&repr, src, now);
            return;
        }

        let Some(id) = self.ports[repr.dst_port as usize] else {
            net_trace!("host: no connection on port {}", repr.dst_port);
            return;
        };

        let state = match self.connections.get(id.0) {
            Some(conn) if conn.remote_addr == src => conn.state,
            Some(_) => {
                net_trace!("host: address mismatch on port {}", repr.dst_port);
                return;
            }
            None => return,
        };

        match state {
            State::ConnectStarted => {
                if self.connections[id.0].handle_connect_ack(&repr, now) {
                    self.started.retain(|&other| other != id);
                    net_trace!("host: connection {} established", id);
                    callbacks.connected(id, &mut self.connections[id.0]);
                }
            }
            State::ConnectReceived | State::ConnectReceivedWhileStarted => {
                match self.connections[id.0].handle_confirm(&repr, payload, now) {
                    ConfirmOutcome::Ignored => {}
                    ConfirmOutcome::Rendezvous => {
                        net_trace!("host: rendezvous connection {} established", id);
                        callbacks.connected(id, &mut self.connections[id.0]);
                    }
                    ConfirmOutcome::Incoming => {
                        self.incoming.retain(|&other| other != id);
                        net_trace!("host: incoming connection {} established", id);
                        callbacks.incoming_connection(id, &mut self.connections[id.0]);
                    }
                }
            }
            State::Connected => {
                self.connections[id.0].process_established(&repr, payload, now, device);
            }
            State::Init | State::Closed => {}
        }
    }

    /// A datagram with destination port 0: CONNECT handling.
    fn process_connect(&mut self, repr: &Repr, src: SocketAddr, now: Instant) {
        // a CONNECT from a known peer only refreshes its timer
        if let Some(id) = self.find_active(src, repr.src_port) {
            self.connections[id.0].touch_rx(now);
            net_trace!("host: duplicate CONNECT received");
            return;
        }

        // simultaneous open with a peer we are connecting to
        if let Some(id) = self.find_started(src) {
            self.started.retain(|&other| other != id);
            self.connections[id.0].handle_rendezvous_connect(repr.src_port, repr.seq_number, now);
            return;
        }

        let Some(id) = self.allocate_connection(src, now) else {
            net_debug!("host: CONNECT from {} dropped, no connection available", src);
            return;
        };
        self.incoming.push(id);
        self.connections[id.0].handle_incoming_connect(repr.src_port, repr.seq_number, now);
        net_trace!("host: CONNECT received, incoming connection {}", id);
    }

    fn find_active(&self, remote: SocketAddr, remote_port: u16) -> Option<ConnectionId> {
        self.conn_list.iter().copied().find(|&id| {
            let conn = &self.connections[id.0];
            conn.remote_port == remote_port && conn.remote_addr == remote
        })
    }

    fn find_started(&self, remote: SocketAddr) -> Option<ConnectionId> {
        self.started
            .iter()
            .copied()
            .find(|&id| self.connections[id.0].remote_addr == remote)
    }

    // === connection allocation ===

    fn allocate_connection(&mut self, remote: SocketAddr, now: Instant) -> Option<ConnectionId> {
        if self.conn_list.len() >= self.config.max_connections as usize {
            return self.recycle_oldest(remote, now);
        }

        let Some(port) = self.draw_port() else {
            return self.recycle_oldest(remote, now);
        };

        let isn = SeqNumber(self.rand.rand_u32());
        let conn = Connection::new(self.config.clone(), remote, port, isn, now);
        let id = ConnectionId(self.connections.insert(conn));
        self.ports[port as usize] = Some(id);
        self.conn_list.push(id);
        Some(id)
    }

    /// Uniform draw from the currently free local ports in `[1, 65534]`.
    fn draw_port(&mut self) -> Option<u16> {
        let free = self.ports[1..PORT_TABLE_SIZE - 1]
            .iter()
            .filter(|entry| entry.is_none())
            .count();
        if free == 0 {
            return None;
        }

        let pick = self.rand.rand_u32() as usize % free;
        let mut seen = 0;
        for port in 1..PORT_TABLE_SIZE - 1 {
            if self.ports[port].is_none() {
                if seen == pick {
                    return Some(port as u16);
                }
                seen += 1;
            }
        }
        None
    }

    /// Recycle the oldest unconfirmed incoming connection in place: same
    /// local port, same handle, fresh state.
    fn recycle_oldest(&mut self, remote: SocketAddr, now: Instant) -> Option<ConnectionId> {
        let mut oldest: Option<ConnectionId> = None;
        for &id in &self.incoming {
            match oldest {
                None => oldest = Some(id),
                Some(other) => {
                    let id_created = self.connections[id.0].created_at;
                    let other_created = self.connections[other.0].created_at;
                    if id_created.is_before(other_created) {
                        oldest = Some(id);
                    }
                }
            }
        }

        let id = oldest?;
        self.incoming.retain(|&other| other != id);

        let port = self.connections[id.0].local_port;
        let isn = SeqNumber(self.rand.rand_u32());
        self.connections[id.0] = Connection::new(self.config.clone(), remote, port, isn, now);
        // the port table entry already points at this handle
        net_trace!("host: recycled connection {} on port {}", id, port);
        Some(id)
    }

    // === per-tick connection processing ===

    fn process_connections(
        &mut self,
        now: Instant,
        device: &mut dyn Device,
        callbacks: &mut dyn Callbacks,
    ) -> bool {
        let mut state_changed = false;

        for id in self.conn_list.clone() {
            let Some(state) = self.connections.get(id.0).map(|conn| conn.state) else {
                continue;
            };

            match state {
                State::ConnectStarted
                | State::ConnectReceived
                | State::ConnectReceivedWhileStarted => {
                    match self.connections[id.0].poll_handshake(now, device) {
                        HandshakePoll::Idle => {}
                        HandshakePoll::Progressed => state_changed = true,
                        HandshakePoll::Exhausted => {
                            self.terminate(id, callbacks);
                            state_changed = true;
                        }
                    }
                }
                State::Connected => {
                    if self.connections[id.0].idle_timed_out(now) {
                        self.terminate(id, callbacks);
                        state_changed = true;
                        continue;
                    }

                    let delivered = self.connections[id.0].deliver_ready();
                    if delivered > 0 {
                        let ready = self.connections[id.0].rx_bytes_ready;
                        callbacks.incoming_data(id, &mut self.connections[id.0], ready);
                        state_changed = true;
                    }

                    if self.connections[id.0].egress(now, device) {
                        state_changed = true;
                    }
                }
                State::Init | State::Closed => {}
            }
        }

        state_changed
    }

    /// Terminate a connection, firing the callback its state owes.
    /// Connections the application never learned about are destroyed
    /// outright; the rest stay readable as [`State::Closed`] until closed.
    fn terminate(&mut self, id: ConnectionId, callbacks: &mut dyn Callbacks) {
        let conn = &mut self.connections[id.0];
        let previous = conn.state;
        let port = conn.local_port;
        conn.state = State::Closed;
        conn.release();

        self.ports[port as usize] = None;
        self.conn_list.retain(|&other| other != id);

        match previous {
            State::ConnectStarted => {
                self.started.retain(|&other| other != id);
                net_debug!("host: connection {} unable to connect", id);
                callbacks.unable_to_connect(id, &mut self.connections[id.0]);
            }
            State::ConnectReceivedWhileStarted => {
                net_debug!("host: connection {} unable to connect", id);
                callbacks.unable_to_connect(id, &mut self.connections[id.0]);
            }
            State::ConnectReceived => {
                self.incoming.retain(|&other| other != id);
                // the application never saw this connection
                self.connections.remove(id.0);
            }
            State::Connected => {
                net_debug!("host: connection {} lost", id);
                callbacks.connection_lost(id, &mut self.connections[id.0]);
            }
            State::Init => {
                self.connections.remove(id.0);
            }
            State::Closed => {}
        }
    }
}
