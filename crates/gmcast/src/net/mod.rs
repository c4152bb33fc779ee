//! Transport seam between the engine and whatever moves the bytes.
//!
//! The engine never touches sockets: it drives [`Net`], [`Listener`] and
//! [`Transport`] implementations, all of them non-blocking. Readiness flows
//! the other way as [`NetEvent`]s that the host loop feeds into
//! `GmcastEngine::handle_up`. A zero-length frame on a connection fd is a
//! liveness notification (the engine then inspects [`Transport::state`]),
//! and any event on the listener fd means a connection is ready to accept.

use std::io;

use bytes::Bytes;
use gmcast_core::Addr;

pub mod mem;
pub mod tcp;

/// Endpoint token, unique per [`Net`] instance for its lifetime.
pub type Fd = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// Non-blocking connect still in flight.
    Connecting,
    Connected,
    Failed,
    /// Closed by this side.
    Closed,
}

/// One end of a connection. Exclusively owned by its peer proto; dropping
/// it closes the connection.
pub trait Transport: Send + std::fmt::Debug {
    fn fd(&self) -> Fd;
    fn state(&self) -> TransportState;
    /// Queue one whole frame for delivery. Never blocks; frames arrive
    /// whole and in order, or not at all.
    fn send(&mut self, frame: &[u8]) -> io::Result<()>;
    fn close(&mut self);
}

pub trait Listener: Send + std::fmt::Debug {
    fn fd(&self) -> Fd;
    /// Take the next pending inbound connection.
    /// `WouldBlock` when none is waiting.
    fn accept(&mut self) -> io::Result<Box<dyn Transport>>;
    fn close(&mut self);
}

pub trait Net: Send {
    fn listen(&mut self, addr: &Addr) -> io::Result<Box<dyn Listener>>;
    /// Begin a non-blocking connect. Completion or failure is reported
    /// asynchronously by a zero-length event on the returned transport's fd.
    fn connect(&mut self, addr: &Addr) -> io::Result<Box<dyn Transport>>;
}

/// One readiness event for the host loop to feed into the engine.
#[derive(Debug, Clone)]
pub struct NetEvent {
    pub fd: Fd,
    pub frame: Bytes,
}
