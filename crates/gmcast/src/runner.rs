//! Stock tokio host loop for the engine.
//!
//! The engine itself is synchronous; the runner owns it, drains network
//! readiness into `handle_up`, sleeps until the deadline `handle_timers`
//! reports, and bridges user traffic and stable views through an
//! [`EngineHandle`].

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use tokio::sync::mpsc;

use gmcast_core::View;

use crate::engine::{GmcastEngine, ProtoUpMeta};
use crate::net::NetEvent;

const STATUS_LOG_PERIOD: Duration = Duration::from_secs(5);

/// Cheap, cloneable handle for talking to a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    down_tx: mpsc::UnboundedSender<Bytes>,
    view_tx: mpsc::UnboundedSender<View>,
}

impl EngineHandle {
    /// Fan a user datagram out to the whole group.
    pub fn send(&self, payload: Bytes) -> Result<()> {
        self.down_tx
            .send(payload)
            .map_err(|_| anyhow!("engine stopped"))
    }

    /// Deliver a stable-view notification from the view engine.
    pub fn stable_view(&self, view: View) -> Result<()> {
        self.view_tx
            .send(view)
            .map_err(|_| anyhow!("engine stopped"))
    }
}

pub struct Runner {
    engine: GmcastEngine,
    events: mpsc::UnboundedReceiver<NetEvent>,
    down_rx: mpsc::UnboundedReceiver<Bytes>,
    view_rx: mpsc::UnboundedReceiver<View>,
    up_tx: mpsc::UnboundedSender<(Bytes, ProtoUpMeta)>,
    // Keep one sender of each alive so recv() never reports closed even
    // after every external handle is dropped.
    _down_keep: mpsc::UnboundedSender<Bytes>,
    _view_keep: mpsc::UnboundedSender<View>,
}

impl Runner {
    /// Wrap an engine. `events` is the receiver handed out by the net
    /// implementation (e.g. [`TokioNet::new`](crate::net::tcp::TokioNet::new)).
    /// Returns the runner, a handle for sends and views, and the upward
    /// delivery stream.
    pub fn new(
        engine: GmcastEngine,
        events: mpsc::UnboundedReceiver<NetEvent>,
    ) -> (
        Self,
        EngineHandle,
        mpsc::UnboundedReceiver<(Bytes, ProtoUpMeta)>,
    ) {
        let (down_tx, down_rx) = mpsc::unbounded_channel();
        let (view_tx, view_rx) = mpsc::unbounded_channel();
        let (up_tx, up_rx) = mpsc::unbounded_channel();
        let handle = EngineHandle {
            down_tx: down_tx.clone(),
            view_tx: view_tx.clone(),
        };
        (
            Self {
                engine,
                events,
                down_rx,
                view_rx,
                up_tx,
                _down_keep: down_tx,
                _view_keep: view_tx,
            },
            handle,
            up_rx,
        )
    }

    /// Open the listener and drive the engine until the network goes away.
    pub async fn run(mut self) -> Result<()> {
        self.engine
            .connect()
            .context("failed to open gmcast listener")?;

        let mut status = tokio::time::interval(STATUS_LOG_PERIOD);
        loop {
            let deadline = tokio::time::Instant::from_std(self.engine.handle_timers());
            tokio::select! {
                ev = self.events.recv() => match ev {
                    Some(ev) => self.engine.handle_up(ev.fd, ev.frame),
                    None => break,
                },
                Some(payload) = self.down_rx.recv() => {
                    self.engine.handle_down(&payload);
                }
                Some(view) = self.view_rx.recv() => {
                    self.engine.handle_stable_view(&view);
                }
                _ = status.tick() => {
                    let s = self.engine.status();
                    tracing::info!(
                        established = s.established.len(),
                        pending = s.pending.len(),
                        remote = s.remote.len(),
                        "mesh status"
                    );
                }
                _ = tokio::time::sleep_until(deadline) => {}
            }

            while let Some((payload, meta)) = self.engine.poll_up() {
                // A dropped subscriber just means nobody is listening.
                let _ = self.up_tx.send((payload, meta));
            }
        }
        self.engine.close();
        Ok(())
    }
}
