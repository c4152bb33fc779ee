//! The gmcast engine — listener, dialers, reconnect schedule, topology
//! propagation and stable-view pruning.
//!
//! Single-threaded and synchronous by contract: an outer event loop drives
//! the engine through [`handle_timers`](GmcastEngine::handle_timers),
//! [`handle_up`](GmcastEngine::handle_up) and
//! [`handle_stable_view`](GmcastEngine::handle_stable_view), each of which
//! runs to completion. Every mutation that can change the set of
//! established peers ends in a topology broadcast, so the mesh converges
//! on the full set of live peers.

use std::collections::{BTreeSet, VecDeque};
use std::io;
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use uuid::Uuid;

use gmcast_core::wire::{self, Message};
use gmcast_core::{Addr, LinkMap, View, ViewKind};

use crate::addrbook::{AddrBook, AddrEntry};
use crate::clock::Clock;
use crate::config::{ConfigError, GmcastConfig};
use crate::net::{Fd, Listener, Net, TransportState};
use crate::proto::{PeerProto, ProtoState};
use crate::registry::ConnectionRegistry;

/// Retry budget before an address is forgotten.
pub const MAX_RETRY_CNT: i32 = 120;
/// Retries granted to freshly established or gossip-discovered addresses.
pub const RETRY_GRANT: i32 = 60;
/// Reconnect sweep cadence.
pub const CHECK_PERIOD: Duration = Duration::from_secs(1);
/// Grace window between a forget and the entry's erasure.
pub const FORGET_GRACE: Duration = Duration::from_secs(5);
/// Jitter window for the first dial to a discovered address, to
/// desynchronize fleet-wide connects.
pub const JITTER_WINDOW_MS: u64 = 100;
/// Log every Nth reconnect attempt at info.
const RECONNECT_LOG_PERIOD: i32 = 30;

/// Metadata attached to each datagram delivered upward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtoUpMeta {
    pub source: Uuid,
}

/// Which address book an insertion targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Book {
    Pending,
    Remote,
}

// ── Status snapshot ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PeerStatus {
    pub fd: Fd,
    pub uuid: Uuid,
    pub addr: Addr,
    pub handshake_uuid: Uuid,
}

#[derive(Debug, Clone)]
pub struct AddrStatus {
    pub addr: Addr,
    pub uuid: Uuid,
    pub retry_cnt: i32,
    pub next_reconnect: Instant,
}

#[derive(Debug, Clone)]
pub struct EngineStatus {
    pub uuid: Uuid,
    pub listen_addr: Addr,
    pub established: Vec<PeerStatus>,
    pub pending: Vec<AddrStatus>,
    pub remote: Vec<AddrStatus>,
}

// ── Engine ────────────────────────────────────────────────────────────────────

pub struct GmcastEngine {
    my_uuid: Uuid,
    group: String,
    listen_addr: Addr,
    initial_addr: Option<Addr>,
    net: Box<dyn Net>,
    clock: Box<dyn Clock>,
    rng: SmallRng,
    listener: Option<Box<dyn Listener>>,
    pending_addrs: AddrBook,
    remote_addrs: AddrBook,
    registry: ConnectionRegistry,
    check_period: Duration,
    next_check: Instant,
    deliveries: VecDeque<(Bytes, ProtoUpMeta)>,
}

impl GmcastEngine {
    /// Parse the `gmcast://` URL and set up an engine around the given
    /// network and clock. Fails on any configuration error; the engine
    /// refuses to start half-configured.
    pub fn new(
        uri: &str,
        net: Box<dyn Net>,
        clock: Box<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        let cfg = GmcastConfig::parse(uri)?;
        let my_uuid = Uuid::new_v4();
        let now = clock.now();
        if let Some(initial) = &cfg.initial_addr {
            tracing::debug!(uuid = %my_uuid, initial = %initial, "initial addr");
        }
        tracing::debug!(uuid = %my_uuid, listen = %cfg.listen_addr, "listening");
        Ok(Self {
            my_uuid,
            group: cfg.group,
            listen_addr: cfg.listen_addr,
            initial_addr: cfg.initial_addr,
            net,
            clock,
            rng: SmallRng::from_entropy(),
            listener: None,
            pending_addrs: AddrBook::new(),
            remote_addrs: AddrBook::new(),
            registry: ConnectionRegistry::new(),
            check_period: CHECK_PERIOD,
            next_check: now,
            deliveries: VecDeque::new(),
        })
    }

    /// Seed the jitter RNG, for deterministic tests.
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng = SmallRng::seed_from_u64(seed);
        self
    }

    pub fn uuid(&self) -> Uuid {
        self.my_uuid
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn listen_addr(&self) -> Addr {
        self.listen_addr
    }

    /// Open the listener and, when seeded, start dialing the seed peer.
    pub fn connect(&mut self) -> io::Result<()> {
        tracing::debug!(uuid = %self.my_uuid, "gmcast connect");
        let listener = self.net.listen(&self.listen_addr)?;
        self.listener = Some(listener);
        if let Some(addr) = self.initial_addr {
            self.insert_address(addr, Uuid::nil(), Book::Pending);
            self.gmcast_connect(addr);
        }
        Ok(())
    }

    /// Close the listener, destroy every connection, clear both books.
    pub fn close(&mut self) {
        tracing::debug!(uuid = %self.my_uuid, "gmcast close");
        if let Some(mut listener) = self.listener.take() {
            listener.close();
        }
        self.registry.clear();
        self.pending_addrs.clear();
        self.remote_addrs.clear();
    }

    // ── Entry points ──────────────────────────────────────────────────────────

    /// Timer tick. Runs the reconnect sweep when due and returns the next
    /// deadline the host loop should wake us at.
    pub fn handle_timers(&mut self) -> Instant {
        let now = self.clock.now();
        if now >= self.next_check {
            self.reconnect();
            self.next_check = now + self.check_period;
        }
        self.next_check
    }

    /// One inbound readiness event: a frame, a liveness notification
    /// (zero-length), or an accept-ready marker on the listener fd.
    pub fn handle_up(&mut self, fd: Fd, dgram: Bytes) {
        let Some(listener) = self.listener.as_ref() else {
            return;
        };
        if fd == listener.fd() {
            self.gmcast_accept();
            return;
        }
        let Some(prev_state) = self.registry.get(fd).map(|p| p.state()) else {
            // Connection already torn down; late event.
            return;
        };

        if dgram.is_empty() {
            self.handle_liveness(fd);
            return;
        }

        if prev_state == ProtoState::Failed {
            tracing::warn!(fd, "datagram for failed connection");
            self.handle_failed(fd);
            return;
        }

        let mut cursor = dgram.clone();
        let msg = match Message::decode(&mut cursor) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(fd, error = %e, "malformed frame");
                if let Some(p) = self.registry.get_mut(fd) {
                    p.set_failed();
                }
                self.handle_failed(fd);
                return;
            }
        };

        if msg.frame_type() >= wire::T_USER_BASE {
            self.deliveries.push_back((
                dgram.slice(wire::HEADER_LEN..),
                ProtoUpMeta {
                    source: msg.source(),
                },
            ));
            return;
        }

        let result = match self.registry.get_mut(fd) {
            Some(p) => p.handle_message(msg),
            None => return,
        };
        if let Err(e) = result {
            tracing::debug!(fd, error = %e, "protocol failure");
            self.handle_failed(fd);
            return;
        }

        // Establishment runs first so duplicate connections are arbitrated
        // by handshake uuid (symmetric on both ends) before any generic
        // topology pass could drop one of them by iteration order.
        if prev_state != ProtoState::Ok
            && self.registry.get(fd).map(|p| p.state()) == Some(ProtoState::Ok)
        {
            self.handle_established(fd);
        } else if self.registry.get(fd).map(|p| p.changed()).unwrap_or(false) {
            self.update_addresses();
            self.reconnect();
        }
    }

    /// Fan a user datagram out to every connection in the registry. The
    /// transport rejects what it cannot deliver; errors never abort the
    /// fan-out.
    pub fn handle_down(&mut self, payload: &[u8]) {
        let mut frame = BytesMut::with_capacity(wire::HEADER_LEN + payload.len());
        Message::User {
            source: self.my_uuid,
        }
        .encode(&mut frame);
        frame.put_slice(payload);

        for (fd, p) in self.registry.iter_mut() {
            if let Err(e) = p.send_raw(&frame) {
                tracing::debug!(fd = *fd, error = %e, "transport rejected datagram");
            }
        }
    }

    /// Prune against an agreed membership snapshot. Non-primary views are
    /// informational only.
    pub fn handle_stable_view(&mut self, view: &View) {
        tracing::info!(kind = ?view.kind, members = view.members.len(), "stable view");
        if view.kind != ViewKind::Primary {
            return;
        }

        let known: BTreeSet<Uuid> = self.remote_addrs.iter().map(|(_, e)| e.uuid).collect();
        for uuid in &known {
            if !view.members.contains_key(uuid) {
                self.gmcast_forget(*uuid);
            }
        }
        for uuid in view.members.keys() {
            if let Some((_, entry)) = self.remote_addrs.find_by_uuid_mut(uuid) {
                tracing::info!(%uuid, "declaring stable");
                entry.retry_cnt = -1;
            }
        }
    }

    /// Drain the next upward delivery.
    pub fn poll_up(&mut self) -> Option<(Bytes, ProtoUpMeta)> {
        self.deliveries.pop_front()
    }

    /// Drop every connection to `uuid` and put its addresses on a short
    /// grace timer; the next reconnect sweep after the grace erases them.
    pub fn gmcast_forget(&mut self, uuid: Uuid) {
        tracing::info!(%uuid, "forgetting peer");
        for fd in self.registry.collect_fds(|p| p.remote_uuid() == uuid) {
            self.registry.remove(fd);
        }
        let now = self.clock.now();
        for (_, entry) in self.remote_addrs.iter_mut() {
            if entry.uuid == uuid {
                entry.retry_cnt = MAX_RETRY_CNT + 1;
                entry.next_reconnect = now + FORGET_GRACE;
            }
        }
        self.update_addresses();
    }

    /// Current engine state, for status logging and tests.
    pub fn status(&self) -> EngineStatus {
        let established = self
            .registry
            .iter()
            .filter(|(_, p)| p.state() == ProtoState::Ok)
            .map(|(fd, p)| PeerStatus {
                fd: *fd,
                uuid: p.remote_uuid(),
                addr: p.remote_addr().expect("established peer has an address"),
                handshake_uuid: p.handshake_uuid(),
            })
            .collect();
        let snapshot = |book: &AddrBook| {
            book.iter()
                .map(|(addr, e)| AddrStatus {
                    addr: *addr,
                    uuid: e.uuid,
                    retry_cnt: e.retry_cnt,
                    next_reconnect: e.next_reconnect,
                })
                .collect()
        };
        EngineStatus {
            uuid: self.my_uuid,
            listen_addr: self.listen_addr,
            established,
            pending: snapshot(&self.pending_addrs),
            remote: snapshot(&self.remote_addrs),
        }
    }

    // ── Connection lifecycle ──────────────────────────────────────────────────

    fn gmcast_accept(&mut self) {
        let Some(listener) = self.listener.as_mut() else {
            return;
        };
        let transport = match listener.accept() {
            Ok(t) => t,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                return;
            }
        };
        let fd = transport.fd();
        let mut peer = PeerProto::accepted(
            transport,
            self.my_uuid,
            self.listen_addr,
            self.group.clone(),
        );
        if let Err(e) = peer.send_handshake() {
            // Transport failure surfaces as a liveness event; keep the
            // proto registered so the normal teardown path runs.
            tracing::debug!(fd, error = %e, "handshake send failed");
        }
        self.registry.insert_unique(fd, peer);
    }

    fn gmcast_connect(&mut self, addr: Addr) {
        if addr == self.listen_addr {
            return;
        }
        let transport = match self.net.connect(&addr) {
            Ok(t) => t,
            Err(e) => {
                // Address stays in its book, subject to the retry sweep.
                tracing::debug!(%addr, error = %e, "connect failed");
                return;
            }
        };
        let fd = transport.fd();
        let mut peer = PeerProto::dialed(
            transport,
            addr,
            self.my_uuid,
            self.listen_addr,
            self.group.clone(),
        );
        peer.await_handshake();
        self.registry.insert_unique(fd, peer);
    }

    fn handle_liveness(&mut self, fd: Fd) {
        let Some(p) = self.registry.get(fd) else {
            return;
        };
        match (p.transport_state(), p.state()) {
            (TransportState::Connected, ProtoState::Init | ProtoState::HandshakeWait) => {
                tracing::debug!(fd, "transport connected");
            }
            (TransportState::Connected, _) => {
                tracing::warn!(fd, "zero length datagram");
            }
            _ => {
                if let Some(p) = self.registry.get_mut(fd) {
                    p.set_failed();
                }
                self.handle_failed(fd);
            }
        }
    }

    /// A proto reached OK: move its address into the remote book, refresh
    /// the retry budget and collapse duplicate connections to the same
    /// peer.
    fn handle_established(&mut self, fd: Fd) {
        let Some(p) = self.registry.get(fd) else {
            return;
        };
        let est_uuid = p.remote_uuid();
        let est_hs = p.handshake_uuid();
        let Some(est_addr) = p.remote_addr() else {
            panic!(
                "protocol error: established peer {est_uuid} on fd {fd} has no remote address"
            );
        };
        tracing::debug!(uuid = %est_uuid, addr = %est_addr, "connection established");

        if self.pending_addrs.remove(&est_addr).is_some() {
            tracing::debug!(addr = %est_addr, "moved out of pending list");
        }
        if !self.remote_addrs.contains(&est_addr) {
            self.insert_address(est_addr, est_uuid, Book::Remote);
        }
        if let Some(entry) = self.remote_addrs.get_mut(&est_addr) {
            entry.retry_cnt = MAX_RETRY_CNT - RETRY_GRANT;
        }

        // Collapse duplicates: both ends see the same pair of handshake
        // uuids, so both keep the connection with the larger one.
        for other_fd in self.registry.collect_fds(|p| p.remote_uuid() == est_uuid) {
            if other_fd == fd {
                continue;
            }
            let Some(other_hs) = self.registry.get(other_fd).map(|p| p.handshake_uuid())
            else {
                continue;
            };
            if other_hs < est_hs {
                tracing::debug!(fd = other_fd, kept = fd, "dropping duplicate connection");
                self.registry.remove(other_fd);
            } else if other_hs > est_hs {
                tracing::debug!(fd, kept = other_fd, "dropping established duplicate");
                self.registry.remove(fd);
                break;
            }
        }

        self.update_addresses();
    }

    /// A proto failed: consume retry budget unless another live connection
    /// to the same peer remains, then destroy it.
    fn handle_failed(&mut self, fd: Fd) {
        let Some(failed) = self.registry.remove(fd) else {
            return;
        };
        let remote_uuid = failed.remote_uuid();
        let survivor = self
            .registry
            .iter()
            .any(|(_, p)| p.state() <= ProtoState::Ok && p.remote_uuid() == remote_uuid);

        if !survivor {
            if let Some(addr) = failed.remote_addr() {
                let rtime = self.clock.now() + self.check_period;
                let entry = match self.pending_addrs.get_mut(&addr) {
                    Some(e) => Some(e),
                    None => self.remote_addrs.get_mut(&addr),
                };
                if let Some(entry) = entry {
                    entry.retry_cnt += 1;
                    entry.next_reconnect = rtime;
                    tracing::debug!(%addr, retry = entry.retry_cnt, "scheduling reconnect");
                }
            }
        }
        drop(failed);
        self.update_addresses();
    }

    // ── Bookkeeping ───────────────────────────────────────────────────────────

    fn insert_address(&mut self, addr: Addr, uuid: Uuid, book: Book) {
        if addr == self.listen_addr {
            panic!("attempt to add own listen address {addr} to address book");
        }
        let now = self.clock.now();
        let target = match book {
            Book::Pending => &mut self.pending_addrs,
            Book::Remote => &mut self.remote_addrs,
        };
        if target.insert(addr, AddrEntry::new(uuid, now)) {
            tracing::debug!(%addr, %uuid, "new address entry");
        } else {
            tracing::warn!(%addr, "duplicate address entry");
        }
    }

    fn is_connected(&self, addr: &Addr, uuid: Uuid) -> bool {
        self.registry.iter().any(|(_, p)| {
            p.remote_addr() == Some(*addr) || (!uuid.is_nil() && p.remote_uuid() == uuid)
        })
    }

    /// Rebuild the topology from established connections, broadcast it,
    /// and adopt addresses reported by peers.
    fn update_addresses(&mut self) {
        let mut link_map = LinkMap::new();
        let mut seen = BTreeSet::new();

        // Established connections define the topology. Duplicate uuids are
        // dropped here; the later-seen connection loses.
        for fd in self.registry.collect_fds(|p| p.state() == ProtoState::Ok) {
            let Some(p) = self.registry.get(fd) else {
                continue;
            };
            let uuid = p.remote_uuid();
            let Some(addr) = p.remote_addr() else {
                panic!(
                    "protocol error: local ({}, {}), established peer {uuid} without address",
                    self.my_uuid, self.listen_addr
                );
            };
            if uuid.is_nil() {
                panic!(
                    "protocol error: local ({}, {}), established peer at {addr} with nil uuid",
                    self.my_uuid, self.listen_addr
                );
            }
            if !self.remote_addrs.contains(&addr) {
                tracing::warn!(%addr, "connection exists but no address book entry");
                self.insert_address(addr, uuid, Book::Remote);
            }
            if seen.insert(uuid) {
                link_map.insert(uuid, addr);
            } else {
                tracing::debug!(fd, %uuid, "dropping duplicate established entry");
                self.registry.remove(fd);
            }
        }

        // Tell every established peer what we can see.
        for fd in self.registry.collect_fds(|p| p.state() == ProtoState::Ok) {
            if let Some(p) = self.registry.get_mut(fd) {
                if let Err(e) = p.send_topology_change(&link_map) {
                    tracing::debug!(fd, error = %e, "topology send failed");
                }
            }
        }

        // Adopt peer-reported links we have never heard of, jittered so a
        // whole fleet does not dial a newcomer in the same instant.
        let mut reported: Vec<(Uuid, Addr)> = Vec::new();
        for (_, p) in self.registry.iter() {
            if p.state() == ProtoState::Ok {
                for (uuid, addr) in p.link_map() {
                    reported.push((*uuid, *addr));
                }
            }
        }
        let now = self.clock.now();
        for (uuid, addr) in reported {
            if uuid == self.my_uuid
                || self.remote_addrs.contains(&addr)
                || self.pending_addrs.contains(&addr)
            {
                continue;
            }
            tracing::debug!(%addr, %uuid, "peer reports address not in books");
            self.insert_address(addr, uuid, Book::Pending);
            let jitter = Duration::from_millis(self.rng.gen_range(0..JITTER_WINDOW_MS));
            if let Some(entry) = self.pending_addrs.get_mut(&addr) {
                entry.retry_cnt = MAX_RETRY_CNT - RETRY_GRANT;
                entry.next_reconnect = now + jitter;
                self.next_check = self.next_check.min(now + jitter);
            }
        }

        // The engine has observed every change that led here.
        for (_, p) in self.registry.iter_mut() {
            p.clear_changed();
        }
    }

    /// Walk both books and dial whatever is due; erase whatever ran out of
    /// budget.
    fn reconnect(&mut self) {
        let now = self.clock.now();

        for addr in self.pending_addrs.addrs() {
            let Some(entry) = self.pending_addrs.get(&addr) else {
                continue;
            };
            let (retry_cnt, due) = (entry.retry_cnt, entry.next_reconnect);
            if self.is_connected(&addr, Uuid::nil()) {
                continue;
            }
            if retry_cnt > MAX_RETRY_CNT {
                tracing::debug!(%addr, "forgetting pending address");
                self.pending_addrs.remove(&addr);
            } else if due <= now {
                self.gmcast_connect(addr);
            }
        }

        for addr in self.remote_addrs.addrs() {
            let Some(entry) = self.remote_addrs.get(&addr) else {
                continue;
            };
            let (uuid, retry_cnt, due) = (entry.uuid, entry.retry_cnt, entry.next_reconnect);
            assert!(uuid != self.my_uuid, "own uuid in remote address book");
            if self.is_connected(&addr, uuid) {
                continue;
            }
            if retry_cnt > MAX_RETRY_CNT {
                tracing::debug!(%uuid, %addr, "forgetting remote address");
                self.remote_addrs.remove(&addr);
            } else if due <= now {
                if retry_cnt % RECONNECT_LOG_PERIOD == 0 {
                    tracing::info!(%uuid, %addr, attempt = retry_cnt, "reconnecting");
                }
                self.gmcast_connect(addr);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::net::mem::MemHub;

    fn engine(hub: &MemHub, uri: &str) -> (GmcastEngine, crate::net::mem::MemNet, ManualClock) {
        let net = hub.net();
        let clock = ManualClock::new();
        let engine = GmcastEngine::new(uri, Box::new(net.clone()), Box::new(clock.clone()))
            .unwrap()
            .with_rng_seed(7);
        (engine, net, clock)
    }

    #[test]
    fn handle_timers_returns_future_deadline() {
        let hub = MemHub::new();
        let (mut engine, _net, clock) = engine(
            &hub,
            "gmcast://0.0.0.0?gmcast.group=g&gmcast.listen_addr=tcp://127.0.0.1:4567",
        );
        engine.connect().unwrap();
        let next = engine.handle_timers();
        assert_eq!(next, clock.now() + CHECK_PERIOD);
        assert!(next >= clock.now());
    }

    #[test]
    #[should_panic(expected = "own listen address")]
    fn refuses_own_listen_address_in_book() {
        let hub = MemHub::new();
        let (mut engine, _net, _clock) = engine(
            &hub,
            "gmcast://127.0.0.1:4567?gmcast.group=g&gmcast.listen_addr=tcp://127.0.0.1:4567",
        );
        engine.connect().unwrap();
    }

    #[test]
    fn close_clears_everything() {
        let hub = MemHub::new();
        // Listener for the seed so the dial gets somewhere.
        let (mut seed, _seed_net, _seed_clock) = engine(
            &hub,
            "gmcast://0.0.0.0?gmcast.group=g&gmcast.listen_addr=tcp://127.0.0.1:4567",
        );
        seed.connect().unwrap();

        let (mut engine, net, _clock) = engine(
            &hub,
            "gmcast://127.0.0.1:4567?gmcast.group=g&gmcast.listen_addr=tcp://127.0.0.1:4568",
        );
        engine.connect().unwrap();
        assert_eq!(engine.status().pending.len(), 1);

        engine.close();
        let status = engine.status();
        assert!(status.pending.is_empty());
        assert!(status.remote.is_empty());
        assert!(status.established.is_empty());

        // With the listener down, events are ignored.
        while let Some(ev) = net.poll_event() {
            engine.handle_up(ev.fd, ev.frame);
        }
        assert!(engine.status().established.is_empty());
    }

    #[test]
    fn dial_to_own_listen_addr_is_noop() {
        let hub = MemHub::new();
        let (mut engine, _net, _clock) = engine(
            &hub,
            "gmcast://0.0.0.0?gmcast.group=g&gmcast.listen_addr=tcp://127.0.0.1:4567",
        );
        engine.connect().unwrap();
        engine.gmcast_connect("tcp://127.0.0.1:4567".parse().unwrap());
        assert!(engine.registry.is_empty());
    }
}
