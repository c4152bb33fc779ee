//! Deterministic in-memory network for tests and simulation.
//!
//! A [`MemHub`] is a process-local network: every node gets a [`MemNet`]
//! handle, connections are matched against registered listeners, and all
//! readiness surfaces as per-node event queues that the test loop drains
//! with [`MemNet::poll_event`]. Delivery preserves per-connection order.
//!
//! Dialing an absent or unreachable address yields a transport that fails
//! asynchronously, the same way a non-blocking TCP connect does.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use gmcast_core::Addr;

use super::{Fd, Listener, Net, NetEvent, Transport, TransportState};

type NodeId = u32;

#[derive(Debug, Default)]
struct HubState {
    next_fd: Fd,
    next_node: NodeId,
    listeners: HashMap<Addr, ListenerSlot>,
    conns: HashMap<Fd, ConnState>,
    queues: HashMap<NodeId, VecDeque<NetEvent>>,
    unreachable: HashSet<Addr>,
}

#[derive(Debug)]
struct ListenerSlot {
    fd: Fd,
    node: NodeId,
    /// Endpoint fds awaiting accept.
    backlog: VecDeque<Fd>,
}

#[derive(Debug)]
struct ConnState {
    node: NodeId,
    peer: Option<Fd>,
    state: TransportState,
}

impl HubState {
    fn alloc_fd(&mut self) -> Fd {
        self.next_fd += 1;
        self.next_fd
    }

    fn push_event(&mut self, node: NodeId, fd: Fd, frame: Bytes) {
        self.queues.entry(node).or_default().push_back(NetEvent { fd, frame });
    }

    fn close_endpoint(&mut self, fd: Fd) {
        let Some(conn) = self.conns.get_mut(&fd) else {
            return;
        };
        if conn.state == TransportState::Closed {
            return;
        }
        conn.state = TransportState::Closed;
        let peer = conn.peer.take();

        // Fail the far end and let it hear about it.
        let mut notify = None;
        if let Some(peer_fd) = peer {
            if let Some(peer_conn) = self.conns.get_mut(&peer_fd) {
                if matches!(
                    peer_conn.state,
                    TransportState::Connected | TransportState::Connecting
                ) {
                    peer_conn.state = TransportState::Failed;
                    peer_conn.peer = None;
                    notify = Some((peer_conn.node, peer_fd));
                }
            }
        }
        if let Some((node, fd)) = notify {
            self.push_event(node, fd, Bytes::new());
        }
    }
}

/// A process-local network shared by every node in a test.
#[derive(Clone, Default)]
pub struct MemHub {
    inner: Arc<Mutex<HubState>>,
}

impl MemHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand out a per-node network handle.
    pub fn net(&self) -> MemNet {
        let mut hub = self.inner.lock().unwrap();
        let node = hub.next_node;
        hub.next_node += 1;
        hub.queues.insert(node, VecDeque::new());
        MemNet {
            inner: self.inner.clone(),
            node,
        }
    }

    /// Make an address unreachable (or reachable again) for new connects.
    /// Established connections are unaffected.
    pub fn set_reachable(&self, addr: &Addr, reachable: bool) {
        let mut hub = self.inner.lock().unwrap();
        if reachable {
            hub.unreachable.remove(addr);
        } else {
            hub.unreachable.insert(*addr);
        }
    }
}

/// One node's view of the hub. Clones share the node's event queue, so a
/// test can keep a clone for draining while the engine owns the original.
#[derive(Clone)]
pub struct MemNet {
    inner: Arc<Mutex<HubState>>,
    node: NodeId,
}

impl MemNet {
    /// Pop the next readiness event for this node.
    pub fn poll_event(&self) -> Option<NetEvent> {
        let mut hub = self.inner.lock().unwrap();
        hub.queues.get_mut(&self.node).and_then(VecDeque::pop_front)
    }
}

impl Net for MemNet {
    fn listen(&mut self, addr: &Addr) -> io::Result<Box<dyn Listener>> {
        let mut hub = self.inner.lock().unwrap();
        if hub.listeners.contains_key(addr) {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("{addr} already has a listener"),
            ));
        }
        let fd = hub.alloc_fd();
        hub.listeners.insert(
            *addr,
            ListenerSlot {
                fd,
                node: self.node,
                backlog: VecDeque::new(),
            },
        );
        Ok(Box::new(MemListener {
            inner: self.inner.clone(),
            addr: *addr,
            fd,
        }))
    }

    fn connect(&mut self, addr: &Addr) -> io::Result<Box<dyn Transport>> {
        let mut hub = self.inner.lock().unwrap();
        let fd = hub.alloc_fd();

        let reachable = !hub.unreachable.contains(addr) && hub.listeners.contains_key(addr);
        if !reachable {
            // Asynchronous failure, like a refused non-blocking TCP connect.
            hub.conns.insert(
                fd,
                ConnState {
                    node: self.node,
                    peer: None,
                    state: TransportState::Failed,
                },
            );
            hub.push_event(self.node, fd, Bytes::new());
        } else {
            let peer_fd = hub.alloc_fd();
            let slot = hub.listeners.get_mut(addr).expect("listener checked above");
            let listener_node = slot.node;
            let listener_fd = slot.fd;
            slot.backlog.push_back(peer_fd);
            hub.conns.insert(
                fd,
                ConnState {
                    node: self.node,
                    peer: Some(peer_fd),
                    state: TransportState::Connected,
                },
            );
            hub.conns.insert(
                peer_fd,
                ConnState {
                    node: listener_node,
                    peer: Some(fd),
                    state: TransportState::Connected,
                },
            );
            hub.push_event(listener_node, listener_fd, Bytes::new());
            hub.push_event(self.node, fd, Bytes::new());
        }

        Ok(Box::new(MemTransport {
            inner: self.inner.clone(),
            fd,
        }))
    }
}

#[derive(Debug)]
pub struct MemTransport {
    inner: Arc<Mutex<HubState>>,
    fd: Fd,
}

impl Transport for MemTransport {
    fn fd(&self) -> Fd {
        self.fd
    }

    fn state(&self) -> TransportState {
        let hub = self.inner.lock().unwrap();
        hub.conns
            .get(&self.fd)
            .map(|c| c.state)
            .unwrap_or(TransportState::Closed)
    }

    fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        let mut hub = self.inner.lock().unwrap();
        let conn = hub
            .conns
            .get(&self.fd)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        if conn.state != TransportState::Connected {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        }
        let peer_fd = conn
            .peer
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        let peer_node = hub
            .conns
            .get(&peer_fd)
            .map(|c| c.node)
            .ok_or_else(|| io::Error::from(io::ErrorKind::BrokenPipe))?;
        hub.push_event(peer_node, peer_fd, Bytes::copy_from_slice(frame));
        Ok(())
    }

    fn close(&mut self) {
        let mut hub = self.inner.lock().unwrap();
        hub.close_endpoint(self.fd);
    }
}

impl Drop for MemTransport {
    fn drop(&mut self) {
        self.close();
    }
}

#[derive(Debug)]
pub struct MemListener {
    inner: Arc<Mutex<HubState>>,
    addr: Addr,
    fd: Fd,
}

impl Listener for MemListener {
    fn fd(&self) -> Fd {
        self.fd
    }

    fn accept(&mut self) -> io::Result<Box<dyn Transport>> {
        let mut hub = self.inner.lock().unwrap();
        let slot = hub
            .listeners
            .get_mut(&self.addr)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        match slot.backlog.pop_front() {
            Some(fd) => Ok(Box::new(MemTransport {
                inner: self.inner.clone(),
                fd,
            })),
            None => Err(io::Error::from(io::ErrorKind::WouldBlock)),
        }
    }

    fn close(&mut self) {
        let mut hub = self.inner.lock().unwrap();
        if let Some(slot) = hub.listeners.remove(&self.addr) {
            // Unaccepted connections are torn down with the listener.
            for fd in slot.backlog {
                hub.close_endpoint(fd);
            }
        }
    }
}

impl Drop for MemListener {
    fn drop(&mut self) {
        self.close();
    }
}
