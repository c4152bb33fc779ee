//! Owning map from transport fd to peer proto.
//!
//! An fd appears at most once. Removing an entry drops the proto, whose
//! transport closes on drop; dropping the whole registry tears down every
//! connection.

use std::collections::BTreeMap;

use crate::net::Fd;
use crate::proto::PeerProto;

#[derive(Default)]
pub struct ConnectionRegistry {
    protos: BTreeMap<Fd, PeerProto>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a proto under its fd. An fd collision means two live
    /// transports claim the same token, which is a programming error.
    pub fn insert_unique(&mut self, fd: Fd, proto: PeerProto) {
        if self.protos.insert(fd, proto).is_some() {
            panic!("fd {fd} registered twice");
        }
    }

    pub fn get(&self, fd: Fd) -> Option<&PeerProto> {
        self.protos.get(&fd)
    }

    pub fn get_mut(&mut self, fd: Fd) -> Option<&mut PeerProto> {
        self.protos.get_mut(&fd)
    }

    pub fn remove(&mut self, fd: Fd) -> Option<PeerProto> {
        self.protos.remove(&fd)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Fd, &PeerProto)> {
        self.protos.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&Fd, &mut PeerProto)> {
        self.protos.iter_mut()
    }

    /// Fds matching a predicate, snapshotted so callers can erase while
    /// walking.
    pub fn collect_fds(&self, pred: impl Fn(&PeerProto) -> bool) -> Vec<Fd> {
        self.protos
            .iter()
            .filter(|(_, p)| pred(p))
            .map(|(fd, _)| *fd)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.protos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.protos.is_empty()
    }

    pub fn clear(&mut self) {
        self.protos.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::{Transport, TransportState};
    use crate::proto::ProtoState;
    use gmcast_core::Addr;
    use std::io;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use uuid::Uuid;

    #[derive(Debug)]
    struct TrackedTransport {
        fd: Fd,
        closed: Arc<AtomicBool>,
    }

    impl Transport for TrackedTransport {
        fn fd(&self) -> Fd {
            self.fd
        }
        fn state(&self) -> TransportState {
            TransportState::Connected
        }
        fn send(&mut self, _frame: &[u8]) -> io::Result<()> {
            Ok(())
        }
        fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    impl Drop for TrackedTransport {
        fn drop(&mut self) {
            self.close();
        }
    }

    fn proto(fd: Fd, closed: Arc<AtomicBool>) -> PeerProto {
        let addr: Addr = "tcp://10.0.0.1:4567".parse().unwrap();
        PeerProto::accepted(
            Box::new(TrackedTransport { fd, closed }),
            Uuid::new_v4(),
            addr,
            "g".to_string(),
        )
    }

    #[test]
    fn remove_drops_and_closes() {
        let closed = Arc::new(AtomicBool::new(false));
        let mut registry = ConnectionRegistry::new();
        registry.insert_unique(7, proto(7, closed.clone()));
        assert_eq!(registry.len(), 1);

        let taken = registry.remove(7).unwrap();
        assert!(!closed.load(Ordering::SeqCst));
        drop(taken);
        assert!(closed.load(Ordering::SeqCst));
        assert!(registry.is_empty());
    }

    #[test]
    fn clear_closes_everything() {
        let c1 = Arc::new(AtomicBool::new(false));
        let c2 = Arc::new(AtomicBool::new(false));
        let mut registry = ConnectionRegistry::new();
        registry.insert_unique(1, proto(1, c1.clone()));
        registry.insert_unique(2, proto(2, c2.clone()));
        registry.clear();
        assert!(c1.load(Ordering::SeqCst));
        assert!(c2.load(Ordering::SeqCst));
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn duplicate_fd_panics() {
        let mut registry = ConnectionRegistry::new();
        let closed = Arc::new(AtomicBool::new(false));
        registry.insert_unique(3, proto(3, closed.clone()));
        registry.insert_unique(3, proto(3, closed));
    }

    #[test]
    fn collect_fds_filters() {
        let mut registry = ConnectionRegistry::new();
        let closed = Arc::new(AtomicBool::new(false));
        registry.insert_unique(1, proto(1, closed.clone()));
        registry.insert_unique(2, proto(2, closed));
        let fds = registry.collect_fds(|p| p.state() == ProtoState::Init);
        assert_eq!(fds, vec![1, 2]);
    }
}
