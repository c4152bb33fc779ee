//! Per-connection handshake state machine.
//!
//! One `PeerProto` exists per transport connection and exclusively owns it.
//! The accepting side opens with HANDSHAKE; the dialer answers with
//! HANDSHAKE_RESPONSE; the acceptor confirms with a terminal
//! HANDSHAKE_RESPONSE of its own. The acceptor mints the per-connection
//! `handshake_uuid` and the dialer adopts it, so both ends hold the same
//! arbitration key when duplicate connections have to be collapsed.

use bytes::BytesMut;
use thiserror::Error;
use uuid::Uuid;

use gmcast_core::wire::{HandshakeBody, Message};
use gmcast_core::{Addr, LinkMap};

use crate::net::{Fd, Transport, TransportState};

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("group mismatch: ours '{ours}', peer presented '{theirs}'")]
    GroupMismatch { ours: String, theirs: String },
    #[error("unexpected {frame} in state {state:?}")]
    UnexpectedFrame {
        frame: &'static str,
        state: ProtoState,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Ordered so that `state <= Ok` reads as "not failed".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProtoState {
    Init,
    HandshakeWait,
    HandshakeSent,
    Ok,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Acceptor,
    Dialer,
}

pub struct PeerProto {
    transport: Box<dyn Transport>,
    role: Role,
    state: ProtoState,
    local_uuid: Uuid,
    local_addr: Addr,
    group: String,
    /// Connection arbitration key. Minted by the acceptor in
    /// `send_handshake`; nil on the dialer until the handshake arrives.
    handshake_uuid: Uuid,
    remote_uuid: Uuid,
    remote_addr: Option<Addr>,
    /// Most recent link map the peer reported.
    link_map: LinkMap,
    /// Raised when the peer reached OK or replaced its link map; the
    /// engine observes it and reacts with a topology update.
    changed: bool,
}

impl PeerProto {
    /// A connection we accepted. The peer's address is unknown until it
    /// tells us its listen endpoint.
    pub fn accepted(
        transport: Box<dyn Transport>,
        local_uuid: Uuid,
        local_addr: Addr,
        group: String,
    ) -> Self {
        Self {
            transport,
            role: Role::Acceptor,
            state: ProtoState::Init,
            local_uuid,
            local_addr,
            group,
            handshake_uuid: Uuid::nil(),
            remote_uuid: Uuid::nil(),
            remote_addr: None,
            link_map: LinkMap::new(),
            changed: false,
        }
    }

    /// A connection we dialed to a known address.
    pub fn dialed(
        transport: Box<dyn Transport>,
        remote_addr: Addr,
        local_uuid: Uuid,
        local_addr: Addr,
        group: String,
    ) -> Self {
        Self {
            transport,
            role: Role::Dialer,
            state: ProtoState::Init,
            local_uuid,
            local_addr,
            group,
            handshake_uuid: Uuid::nil(),
            remote_uuid: Uuid::nil(),
            remote_addr: Some(remote_addr),
            link_map: LinkMap::new(),
            changed: false,
        }
    }

    // ── Accessors ─────────────────────────────────────────────────────────────

    pub fn fd(&self) -> Fd {
        self.transport.fd()
    }

    pub fn state(&self) -> ProtoState {
        self.state
    }

    pub fn transport_state(&self) -> TransportState {
        self.transport.state()
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn handshake_uuid(&self) -> Uuid {
        self.handshake_uuid
    }

    pub fn remote_uuid(&self) -> Uuid {
        self.remote_uuid
    }

    pub fn remote_addr(&self) -> Option<Addr> {
        self.remote_addr
    }

    pub fn link_map(&self) -> &LinkMap {
        &self.link_map
    }

    pub fn changed(&self) -> bool {
        self.changed
    }

    pub fn clear_changed(&mut self) {
        self.changed = false;
    }

    pub fn set_failed(&mut self) {
        self.state = ProtoState::Failed;
    }

    // ── Transitions ───────────────────────────────────────────────────────────

    /// Acceptor opening move: mint the connection's arbitration key and
    /// present ourselves.
    pub fn send_handshake(&mut self) -> Result<(), ProtoError> {
        debug_assert_eq!(self.state, ProtoState::Init);
        debug_assert_eq!(self.role, Role::Acceptor);
        self.handshake_uuid = Uuid::new_v4();
        let msg = Message::Handshake {
            source: self.local_uuid,
            body: self.identity_body(),
        };
        self.send(&msg)?;
        self.state = ProtoState::HandshakeSent;
        tracing::debug!(fd = self.fd(), handshake = %self.handshake_uuid, "sent handshake");
        Ok(())
    }

    /// Dialer opening move: the acceptor speaks first.
    pub fn await_handshake(&mut self) {
        debug_assert_eq!(self.state, ProtoState::Init);
        self.state = ProtoState::HandshakeWait;
    }

    pub fn handle_message(&mut self, msg: Message) -> Result<(), ProtoError> {
        match (self.state, msg) {
            (ProtoState::HandshakeWait, Message::Handshake { source, body }) => {
                self.check_group(&body)?;
                self.handshake_uuid = body.handshake_uuid;
                self.remote_uuid = source;
                self.remote_addr = Some(body.listen_addr);
                let reply = Message::HandshakeResponse {
                    source: self.local_uuid,
                    body: self.identity_body(),
                };
                self.send(&reply)?;
                self.state = ProtoState::HandshakeSent;
                Ok(())
            }
            (ProtoState::HandshakeSent, Message::HandshakeResponse { source, body }) => {
                self.check_group(&body)?;
                self.remote_uuid = source;
                self.remote_addr = Some(body.listen_addr);
                self.state = ProtoState::Ok;
                self.changed = true;
                tracing::debug!(
                    fd = self.fd(),
                    remote = %self.remote_uuid,
                    handshake = %self.handshake_uuid,
                    "handshake complete"
                );
                if self.role == Role::Acceptor {
                    // Terminal confirmation so the dialer reaches OK too.
                    let reply = Message::HandshakeResponse {
                        source: self.local_uuid,
                        body: self.identity_body(),
                    };
                    self.send(&reply)?;
                }
                Ok(())
            }
            (ProtoState::Ok, Message::TopologyChange { links, .. }) => {
                // Only a differing map counts as a change; identical
                // rebroadcasts must not trigger another topology round.
                if links != self.link_map {
                    self.link_map = links;
                    self.changed = true;
                }
                Ok(())
            }
            (state, msg) => {
                self.state = ProtoState::Failed;
                Err(ProtoError::UnexpectedFrame {
                    frame: msg.type_name(),
                    state,
                })
            }
        }
    }

    /// Broadcast leg of a topology update. Only valid once established.
    pub fn send_topology_change(&mut self, links: &LinkMap) -> Result<(), ProtoError> {
        debug_assert_eq!(self.state, ProtoState::Ok);
        let msg = Message::TopologyChange {
            source: self.local_uuid,
            links: links.clone(),
        };
        self.send(&msg)
    }

    /// Push a pre-encoded frame straight to the transport.
    pub fn send_raw(&mut self, frame: &[u8]) -> std::io::Result<()> {
        self.transport.send(frame)
    }

    fn identity_body(&self) -> HandshakeBody {
        HandshakeBody {
            handshake_uuid: self.handshake_uuid,
            group: self.group.clone(),
            listen_addr: self.local_addr,
        }
    }

    fn check_group(&mut self, body: &HandshakeBody) -> Result<(), ProtoError> {
        if body.group != self.group {
            self.state = ProtoState::Failed;
            return Err(ProtoError::GroupMismatch {
                ours: self.group.clone(),
                theirs: body.group.clone(),
            });
        }
        Ok(())
    }

    fn send(&mut self, msg: &Message) -> Result<(), ProtoError> {
        let mut buf = BytesMut::new();
        msg.encode(&mut buf);
        self.transport.send(&buf)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::{Arc, Mutex};

    /// Test transport that records every sent frame.
    #[derive(Clone)]
    #[derive(Debug)]
    struct CaptureTransport {
        fd: Fd,
        sent: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl CaptureTransport {
        fn new(fd: Fd) -> Self {
            Self {
                fd,
                sent: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn take(&self) -> Vec<Message> {
            self.sent
                .lock()
                .unwrap()
                .drain(..)
                .map(|raw| {
                    let mut buf = bytes::Bytes::from(raw);
                    Message::decode(&mut buf).expect("captured frame must parse")
                })
                .collect()
        }
    }

    impl Transport for CaptureTransport {
        fn fd(&self) -> Fd {
            self.fd
        }
        fn state(&self) -> TransportState {
            TransportState::Connected
        }
        fn send(&mut self, frame: &[u8]) -> io::Result<()> {
            self.sent.lock().unwrap().push(frame.to_vec());
            Ok(())
        }
        fn close(&mut self) {}
    }

    fn addr(s: &str) -> Addr {
        s.parse().unwrap()
    }

    struct Side {
        proto: PeerProto,
        wire: CaptureTransport,
        uuid: Uuid,
    }

    fn acceptor_side(group: &str) -> Side {
        let wire = CaptureTransport::new(1);
        let uuid = Uuid::new_v4();
        let proto = PeerProto::accepted(
            Box::new(wire.clone()),
            uuid,
            addr("tcp://10.0.0.1:4567"),
            group.to_string(),
        );
        Side { proto, wire, uuid }
    }

    fn dialer_side(group: &str) -> Side {
        let wire = CaptureTransport::new(2);
        let uuid = Uuid::new_v4();
        let proto = PeerProto::dialed(
            Box::new(wire.clone()),
            addr("tcp://10.0.0.1:4567"),
            uuid,
            addr("tcp://10.0.0.2:4567"),
            group.to_string(),
        );
        Side { proto, wire, uuid }
    }

    /// Run the full three-message exchange between two sides.
    fn complete_handshake(acc: &mut Side, dial: &mut Side) {
        acc.proto.send_handshake().unwrap();
        dial.proto.await_handshake();

        let mut to_dialer = acc.wire.take();
        dial.proto.handle_message(to_dialer.remove(0)).unwrap();
        assert_eq!(dial.proto.state(), ProtoState::HandshakeSent);

        let mut to_acceptor = dial.wire.take();
        acc.proto.handle_message(to_acceptor.remove(0)).unwrap();
        assert_eq!(acc.proto.state(), ProtoState::Ok);

        let mut terminal = acc.wire.take();
        dial.proto.handle_message(terminal.remove(0)).unwrap();
        assert_eq!(dial.proto.state(), ProtoState::Ok);
    }

    #[test]
    fn three_message_exchange_reaches_ok() {
        let mut acc = acceptor_side("g");
        let mut dial = dialer_side("g");
        complete_handshake(&mut acc, &mut dial);

        assert_eq!(acc.proto.remote_uuid(), dial.uuid);
        assert_eq!(dial.proto.remote_uuid(), acc.uuid);
        assert_eq!(
            acc.proto.remote_addr(),
            Some(addr("tcp://10.0.0.2:4567"))
        );
        assert_eq!(
            dial.proto.remote_addr(),
            Some(addr("tcp://10.0.0.1:4567"))
        );
        // Both ends hold the same arbitration key.
        assert!(!acc.proto.handshake_uuid().is_nil());
        assert_eq!(acc.proto.handshake_uuid(), dial.proto.handshake_uuid());
        // Both flagged the change for the engine.
        assert!(acc.proto.changed());
        assert!(dial.proto.changed());
    }

    #[test]
    fn group_mismatch_fails_dialer() {
        let mut acc = acceptor_side("galaxy");
        let mut dial = dialer_side("andromeda");
        acc.proto.send_handshake().unwrap();
        dial.proto.await_handshake();

        let mut to_dialer = acc.wire.take();
        let err = dial.proto.handle_message(to_dialer.remove(0)).unwrap_err();
        assert!(matches!(err, ProtoError::GroupMismatch { .. }));
        assert_eq!(dial.proto.state(), ProtoState::Failed);
        // No reply goes out.
        assert!(dial.wire.take().is_empty());
    }

    #[test]
    fn topology_change_replaces_link_map() {
        let mut acc = acceptor_side("g");
        let mut dial = dialer_side("g");
        complete_handshake(&mut acc, &mut dial);
        acc.proto.clear_changed();

        let mut links = LinkMap::new();
        links.insert(Uuid::new_v4(), addr("tcp://10.0.0.3:4567"));
        dial.proto.send_topology_change(&links).unwrap();

        let mut frames = dial.wire.take();
        acc.proto.handle_message(frames.remove(0)).unwrap();
        assert_eq!(acc.proto.link_map(), &links);
        assert!(acc.proto.changed());
    }

    #[test]
    fn identical_topology_does_not_raise_changed() {
        let mut acc = acceptor_side("g");
        let mut dial = dialer_side("g");
        complete_handshake(&mut acc, &mut dial);
        acc.proto.clear_changed();

        let mut links = LinkMap::new();
        links.insert(Uuid::new_v4(), addr("tcp://10.0.0.3:4567"));
        acc.proto
            .handle_message(Message::TopologyChange {
                source: dial.uuid,
                links: links.clone(),
            })
            .unwrap();
        assert!(acc.proto.changed());
        acc.proto.clear_changed();

        // Same map again: nothing changed.
        acc.proto
            .handle_message(Message::TopologyChange {
                source: dial.uuid,
                links,
            })
            .unwrap();
        assert!(!acc.proto.changed());
    }

    #[test]
    fn unexpected_frame_fails_connection() {
        let mut acc = acceptor_side("g");
        acc.proto.send_handshake().unwrap();
        let _ = acc.wire.take();

        // A topology frame before the handshake completes is a protocol
        // violation.
        let msg = Message::TopologyChange {
            source: Uuid::new_v4(),
            links: LinkMap::new(),
        };
        let err = acc.proto.handle_message(msg).unwrap_err();
        assert!(matches!(err, ProtoError::UnexpectedFrame { .. }));
        assert_eq!(acc.proto.state(), ProtoState::Failed);
    }

    #[test]
    fn state_order_reads_not_failed() {
        assert!(ProtoState::Init <= ProtoState::Ok);
        assert!(ProtoState::HandshakeWait <= ProtoState::Ok);
        assert!(ProtoState::HandshakeSent <= ProtoState::Ok);
        assert!(ProtoState::Ok <= ProtoState::Ok);
        assert!(ProtoState::Failed > ProtoState::Ok);
    }
}
