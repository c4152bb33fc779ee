//! Address books — where peers live and when to redial them.
//!
//! The engine keeps two of these: `pending` for addresses it is still
//! trying to reach and `remote` for addresses that completed a handshake
//! at least once. An address lives in at most one book at a time.

use std::collections::BTreeMap;
use std::time::Instant;

use gmcast_core::Addr;
use uuid::Uuid;

/// Bookkeeping for one known peer address.
#[derive(Debug, Clone)]
pub struct AddrEntry {
    pub uuid: Uuid,
    /// Attempt counter doubling as a lifecycle sentinel: -1 means freshly
    /// established or declared stable; values above the retry budget mean
    /// the address is forgotten on the next reconnect sweep.
    pub retry_cnt: i32,
    pub next_reconnect: Instant,
    pub last_seen: Instant,
}

impl AddrEntry {
    pub fn new(uuid: Uuid, now: Instant) -> Self {
        Self {
            uuid,
            retry_cnt: 0,
            next_reconnect: now,
            last_seen: now,
        }
    }
}

/// One of the two address books.
#[derive(Debug, Default)]
pub struct AddrBook {
    entries: BTreeMap<Addr, AddrEntry>,
}

impl AddrBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert without overwriting. Returns false if the address is already
    /// present (the existing entry is kept).
    pub fn insert(&mut self, addr: Addr, entry: AddrEntry) -> bool {
        match self.entries.entry(addr) {
            std::collections::btree_map::Entry::Occupied(_) => false,
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(entry);
                true
            }
        }
    }

    pub fn get(&self, addr: &Addr) -> Option<&AddrEntry> {
        self.entries.get(addr)
    }

    pub fn get_mut(&mut self, addr: &Addr) -> Option<&mut AddrEntry> {
        self.entries.get_mut(addr)
    }

    pub fn contains(&self, addr: &Addr) -> bool {
        self.entries.contains_key(addr)
    }

    pub fn remove(&mut self, addr: &Addr) -> Option<AddrEntry> {
        self.entries.remove(addr)
    }

    pub fn find_by_uuid(&self, uuid: &Uuid) -> Option<(&Addr, &AddrEntry)> {
        self.entries.iter().find(|(_, e)| e.uuid == *uuid)
    }

    pub fn find_by_uuid_mut(&mut self, uuid: &Uuid) -> Option<(&Addr, &mut AddrEntry)> {
        self.entries.iter_mut().find(|(_, e)| e.uuid == *uuid)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Addr, &AddrEntry)> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&Addr, &mut AddrEntry)> {
        self.entries.iter_mut()
    }

    /// Snapshot of the keys, for sweeps that erase while walking.
    pub fn addrs(&self) -> Vec<Addr> {
        self.entries.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> Addr {
        s.parse().unwrap()
    }

    #[test]
    fn insert_rejects_duplicates() {
        let now = Instant::now();
        let mut book = AddrBook::new();
        let first = Uuid::new_v4();
        assert!(book.insert(addr("tcp://10.0.0.1:4567"), AddrEntry::new(first, now)));
        assert!(!book.insert(
            addr("tcp://10.0.0.1:4567"),
            AddrEntry::new(Uuid::new_v4(), now)
        ));
        // Original entry survives.
        assert_eq!(book.get(&addr("tcp://10.0.0.1:4567")).unwrap().uuid, first);
        assert_eq!(book.len(), 1);
    }

    #[test]
    fn find_by_uuid() {
        let now = Instant::now();
        let mut book = AddrBook::new();
        let uuid = Uuid::new_v4();
        book.insert(addr("tcp://10.0.0.1:4567"), AddrEntry::new(Uuid::new_v4(), now));
        book.insert(addr("tcp://10.0.0.2:4567"), AddrEntry::new(uuid, now));

        let (found_addr, entry) = book.find_by_uuid(&uuid).unwrap();
        assert_eq!(*found_addr, addr("tcp://10.0.0.2:4567"));
        assert_eq!(entry.uuid, uuid);
        assert!(book.find_by_uuid(&Uuid::new_v4()).is_none());
    }

    #[test]
    fn sweep_with_erase() {
        let now = Instant::now();
        let mut book = AddrBook::new();
        for i in 1..=3 {
            book.insert(
                addr(&format!("tcp://10.0.0.{i}:4567")),
                AddrEntry::new(Uuid::new_v4(), now),
            );
        }
        for a in book.addrs() {
            if a != addr("tcp://10.0.0.2:4567") {
                book.remove(&a);
            }
        }
        assert_eq!(book.len(), 1);
        assert!(book.contains(&addr("tcp://10.0.0.2:4567")));
    }
}
