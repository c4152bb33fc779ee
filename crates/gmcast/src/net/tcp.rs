//! Tokio-backed TCP network.
//!
//! Each connection gets a reader task (length-prefixed frames in, one
//! [`NetEvent`] per frame) and a writer task fed through an unbounded
//! channel, so [`Transport::send`] never blocks. Connects and accepts run
//! in their own tasks; completion and failure both surface as zero-length
//! events, exactly like the rest of the [`net`](crate::net) contract.
//!
//! Must be used from within a tokio runtime; the host loop
//! ([`Runner`](crate::runner::Runner)) provides one.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use gmcast_core::Addr;

use super::{Fd, Listener, Net, NetEvent, Transport, TransportState};

/// Frames above this are treated as a protocol violation and fail the
/// connection.
const MAX_FRAME_LEN: usize = 1 << 20;

enum WriteCmd {
    Frame(Bytes),
    Shutdown,
}

#[derive(Debug)]
struct ConnShared {
    state: Mutex<TransportState>,
}

impl ConnShared {
    fn new(state: TransportState) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(state),
        })
    }

    fn get(&self) -> TransportState {
        *self.state.lock().unwrap()
    }

    fn set(&self, state: TransportState) {
        *self.state.lock().unwrap() = state;
    }

    /// Flip to Failed unless this side already closed deliberately.
    fn fail(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if *state == TransportState::Closed {
            return false;
        }
        *state = TransportState::Failed;
        true
    }
}

pub struct TokioNet {
    events: mpsc::UnboundedSender<NetEvent>,
    next_fd: Arc<AtomicU64>,
}

impl TokioNet {
    /// Returns the net and the event stream the host loop must drain into
    /// `GmcastEngine::handle_up`.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<NetEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                events: tx,
                next_fd: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    fn alloc_fd(&self) -> Fd {
        self.next_fd.fetch_add(1, Ordering::SeqCst) + 1
    }
}

impl Net for TokioNet {
    fn listen(&mut self, addr: &Addr) -> io::Result<Box<dyn Listener>> {
        // Bind synchronously so configuration errors surface immediately.
        let std_listener = std::net::TcpListener::bind(addr.socket_addr())?;
        std_listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(std_listener)?;

        let fd = self.alloc_fd();
        let backlog: Arc<Mutex<VecDeque<TcpStream>>> = Arc::default();
        let (stop_tx, mut stop_rx) = tokio::sync::oneshot::channel::<()>();

        let events = self.events.clone();
        let task_backlog = backlog.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            tracing::debug!(listener_fd = fd, peer = %peer, "inbound connection");
                            task_backlog.lock().unwrap().push_back(stream);
                            if events.send(NetEvent { fd, frame: Bytes::new() }).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(listener_fd = fd, error = %e, "accept error");
                        }
                    },
                }
            }
        });

        Ok(Box::new(TcpListenerHandle {
            fd,
            backlog,
            stop: Some(stop_tx),
            events: self.events.clone(),
            next_fd: self.next_fd.clone(),
        }))
    }

    fn connect(&mut self, addr: &Addr) -> io::Result<Box<dyn Transport>> {
        let fd = self.alloc_fd();
        let shared = ConnShared::new(TransportState::Connecting);
        let (out_tx, out_rx) = mpsc::unbounded_channel();

        let events = self.events.clone();
        let task_shared = shared.clone();
        let target = addr.socket_addr();
        tokio::spawn(async move {
            match TcpStream::connect(target).await {
                Ok(stream) => {
                    task_shared.set(TransportState::Connected);
                    let _ = events.send(NetEvent {
                        fd,
                        frame: Bytes::new(),
                    });
                    run_connection(fd, stream, out_rx, task_shared, events).await;
                }
                Err(e) => {
                    tracing::debug!(fd, error = %e, "connect failed");
                    task_shared.set(TransportState::Failed);
                    let _ = events.send(NetEvent {
                        fd,
                        frame: Bytes::new(),
                    });
                }
            }
        });

        Ok(Box::new(TcpTransport {
            fd,
            shared,
            out: out_tx,
        }))
    }
}

#[derive(Debug)]
pub struct TcpTransport {
    fd: Fd,
    shared: Arc<ConnShared>,
    out: mpsc::UnboundedSender<WriteCmd>,
}

impl Transport for TcpTransport {
    fn fd(&self) -> Fd {
        self.fd
    }

    fn state(&self) -> TransportState {
        self.shared.get()
    }

    fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        if self.shared.get() != TransportState::Connected {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        }
        self.out
            .send(WriteCmd::Frame(Bytes::copy_from_slice(frame)))
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))
    }

    fn close(&mut self) {
        self.shared.set(TransportState::Closed);
        let _ = self.out.send(WriteCmd::Shutdown);
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.close();
    }
}

#[derive(Debug)]
pub struct TcpListenerHandle {
    fd: Fd,
    backlog: Arc<Mutex<VecDeque<TcpStream>>>,
    stop: Option<tokio::sync::oneshot::Sender<()>>,
    events: mpsc::UnboundedSender<NetEvent>,
    next_fd: Arc<AtomicU64>,
}

impl Listener for TcpListenerHandle {
    fn fd(&self) -> Fd {
        self.fd
    }

    fn accept(&mut self) -> io::Result<Box<dyn Transport>> {
        let stream = self
            .backlog
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| io::Error::from(io::ErrorKind::WouldBlock))?;

        let fd = self.next_fd.fetch_add(1, Ordering::SeqCst) + 1;
        let shared = ConnShared::new(TransportState::Connected);
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let events = self.events.clone();
        let task_shared = shared.clone();
        tokio::spawn(async move {
            run_connection(fd, stream, out_rx, task_shared, events).await;
        });

        Ok(Box::new(TcpTransport {
            fd,
            shared,
            out: out_tx,
        }))
    }

    fn close(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        self.backlog.lock().unwrap().clear();
    }
}

impl Drop for TcpListenerHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Reader and writer halves of one live connection. Runs until either half
/// errors, the peer hangs up, or the owner shuts the writer down.
async fn run_connection(
    fd: Fd,
    stream: TcpStream,
    mut out: mpsc::UnboundedReceiver<WriteCmd>,
    shared: Arc<ConnShared>,
    events: mpsc::UnboundedSender<NetEvent>,
) {
    let (mut rd, mut wr) = stream.into_split();

    let writer_shared = shared.clone();
    let writer_events = events.clone();
    let writer = tokio::spawn(async move {
        while let Some(cmd) = out.recv().await {
            match cmd {
                WriteCmd::Frame(frame) => {
                    let len = (frame.len() as u32).to_be_bytes();
                    if let Err(e) = wr.write_all(&len).await {
                        tracing::debug!(fd, error = %e, "write failed");
                        break;
                    }
                    if let Err(e) = wr.write_all(&frame).await {
                        tracing::debug!(fd, error = %e, "write failed");
                        break;
                    }
                }
                WriteCmd::Shutdown => break,
            }
        }
        if writer_shared.fail() {
            let _ = writer_events.send(NetEvent {
                fd,
                frame: Bytes::new(),
            });
        }
    });

    loop {
        let mut len_raw = [0u8; 4];
        if let Err(e) = rd.read_exact(&mut len_raw).await {
            tracing::debug!(fd, error = %e, "connection closed");
            break;
        }
        let len = u32::from_be_bytes(len_raw) as usize;
        if len > MAX_FRAME_LEN {
            tracing::warn!(fd, len, "oversized frame");
            break;
        }
        let mut frame = vec![0u8; len];
        if let Err(e) = rd.read_exact(&mut frame).await {
            tracing::debug!(fd, error = %e, "read failed");
            break;
        }
        if events
            .send(NetEvent {
                fd,
                frame: Bytes::from(frame),
            })
            .is_err()
        {
            break;
        }
    }

    writer.abort();
    if shared.fail() {
        let _ = events.send(NetEvent {
            fd,
            frame: Bytes::new(),
        });
    }
}
