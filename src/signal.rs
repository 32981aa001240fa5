//! # Rendezvous Client
//!
//! The rendezvous service bootstraps the overlay: it assigns peer
//! identities, hands out an initial view, and relays handshake
//! messages between peers that have no channel yet. Steady-state
//! traffic never touches it.
//!
//! The wire is a persistent bidirectional text channel carrying one
//! JSON document per frame. The hop budget is forced to zero on this
//! path: the rendezvous relays exactly once and never floods.
//!
//! [`SignalClient`] adapts a [`RendezvousChannel`] to the same
//! [`PeerTransport`] surface peer channels use, so the router can keep
//! it in the connection table under the reserved `"signal"` key. On
//! platforms that idle connections out after ~30 s the client emits a
//! keepalive tick, which the peer task turns into a
//! `signal:keepalive` self-message.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::messages::{kind, FirstView, Message, NodeDescriptor, PeerId, SIGNAL};
use crate::transport::{ChannelState, EventSender, PeerTransport, TransportEvent, TransportPayload};

/// Keepalive cadence for platforms that idle connections out.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// The persistent text-frame channel toward the rendezvous service.
#[async_trait]
pub trait RendezvousChannel: Send + Sync {
    async fn send_frame(&self, frame: String) -> Result<()>;
    fn state(&self) -> ChannelState;
    fn close(&self);
}

/// Opens rendezvous channels. The router re-invokes this when it finds
/// the channel closed while falling back to the rendezvous.
pub trait RendezvousConnector: Send + Sync {
    fn connect(&self, events: EventSender) -> SignalClient;
}

/// Adapter presenting a rendezvous channel as a peer transport.
pub struct SignalClient {
    channel: Arc<dyn RendezvousChannel>,
    tasks: Vec<JoinHandle<()>>,
}

impl SignalClient {
    /// Wrap a connected channel. `frames` is the inbound side;
    /// `keepalive` enables the periodic tick.
    pub fn new(
        channel: Arc<dyn RendezvousChannel>,
        mut frames: mpsc::UnboundedReceiver<String>,
        events: EventSender,
        keepalive: bool,
    ) -> Self {
        let mut tasks = Vec::new();

        let reader_events = events.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(frame) = frames.recv().await {
                match Message::from_frame(&frame) {
                    Ok(message) => {
                        let _ = reader_events.send(TransportEvent {
                            remote: SIGNAL.to_string(),
                            payload: TransportPayload::Inbound(message),
                        });
                    }
                    Err(e) => warn!(error = %e, "dropping malformed rendezvous frame"),
                }
            }
            debug!("rendezvous frame stream ended");
            let _ = reader_events.send(TransportEvent {
                remote: SIGNAL.to_string(),
                payload: TransportPayload::State(ChannelState::Closed),
            });
        }));

        if keepalive {
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(KEEPALIVE_INTERVAL);
                ticker.tick().await; // immediate first tick is not a keepalive
                loop {
                    ticker.tick().await;
                    if events
                        .send(TransportEvent {
                            remote: SIGNAL.to_string(),
                            payload: TransportPayload::Keepalive,
                        })
                        .is_err()
                    {
                        break;
                    }
                }
            }));
        }

        Self { channel, tasks }
    }
}

impl Drop for SignalClient {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[async_trait]
impl PeerTransport for SignalClient {
    async fn send(&self, message: &Message) -> Result<()> {
        // The rendezvous relays exactly once; the hop budget is zero
        // on the wire.
        let mut wire = message.clone();
        wire.ttl = 0;
        self.channel.send_frame(wire.to_frame()).await
    }

    fn state(&self) -> ChannelState {
        self.channel.state()
    }

    fn create_channel(&self) {}

    async fn create_offer(&self) -> Result<String> {
        bail!("rendezvous channel has no session handshake")
    }

    async fn create_answer(&self, _remote_sdp: &str) -> Result<String> {
        bail!("rendezvous channel has no session handshake")
    }

    async fn set_remote_description(&self, _sdp: &str) -> Result<()> {
        bail!("rendezvous channel has no session handshake")
    }

    async fn add_ice_candidate(&self, _candidate: &str) -> Result<()> {
        bail!("rendezvous channel has no session handshake")
    }

    fn close(&self) {
        self.channel.close();
    }
}

// ============================================================================
// In-memory rendezvous service
// ============================================================================

/// Process-local rendezvous double: assigns the identity each
/// connector was built with, serves a `first-view` on connect, and
/// relays frames by destination. `to = "-1"` fans out to every other
/// connected client, which is all a tracker needs to do for tests.
#[derive(Clone, Default)]
pub struct MemorySignalServer {
    inner: Arc<Mutex<ServerInner>>,
}

#[derive(Default)]
struct ServerInner {
    clients: HashMap<PeerId, ClientSlot>,
}

struct ClientSlot {
    frames: mpsc::UnboundedSender<String>,
    open: bool,
}

impl MemorySignalServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A connector that will register under `id` when the peer task
    /// connects.
    pub fn connector(&self, id: impl Into<PeerId>) -> MemorySignalConnector {
        MemorySignalConnector {
            server: self.clone(),
            id: id.into(),
            keepalive: false,
        }
    }

    /// Same, for an endpoint that idles out and needs keepalives.
    pub fn connector_with_keepalive(&self, id: impl Into<PeerId>) -> MemorySignalConnector {
        MemorySignalConnector {
            keepalive: true,
            ..self.connector(id)
        }
    }

    pub fn connected_ids(&self) -> Vec<PeerId> {
        let inner = self.inner.lock().expect("server lock");
        inner
            .clients
            .iter()
            .filter(|(_, slot)| slot.open)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Drop a client, as a platform idle-out would.
    pub fn disconnect(&self, id: &PeerId) {
        let mut inner = self.inner.lock().expect("server lock");
        if let Some(slot) = inner.clients.get_mut(id) {
            slot.open = false;
            // Replacing the sender ends the reader's stream.
            let (dead, _) = mpsc::unbounded_channel();
            slot.frames = dead;
        }
    }

    fn register(&self, id: &PeerId) -> mpsc::UnboundedReceiver<String> {
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();

        let mut inner = self.inner.lock().expect("server lock");
        let view: Vec<NodeDescriptor> = inner
            .clients
            .iter()
            .filter(|(other, slot)| slot.open && *other != id)
            .map(|(other, _)| NodeDescriptor::new(other.clone()))
            .collect();

        let first_view = Message::new(
            kind::FIRST_VIEW,
            SIGNAL,
            id.clone(),
            0,
            serde_json::to_value(FirstView {
                id: id.clone(),
                view,
            })
            .expect("first-view serializes"),
        );
        let _ = frames_tx.send(first_view.to_frame());

        inner.clients.insert(
            id.clone(),
            ClientSlot {
                frames: frames_tx,
                open: true,
            },
        );
        frames_rx
    }

    fn is_open(&self, id: &PeerId) -> bool {
        let inner = self.inner.lock().expect("server lock");
        inner.clients.get(id).is_some_and(|slot| slot.open)
    }

    fn route(&self, from: &PeerId, frame: String) {
        let parsed = match Message::from_frame(&frame) {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "rendezvous dropping malformed frame");
                return;
            }
        };
        let inner = self.inner.lock().expect("server lock");
        match parsed.to.as_str() {
            SIGNAL => {
                debug!(from = %from, kind = %parsed.kind, "rendezvous consumed frame");
            }
            crate::messages::ANY_PEER => {
                for (id, slot) in inner.clients.iter() {
                    if id != from && slot.open {
                        let _ = slot.frames.send(frame.clone());
                    }
                }
            }
            to => match inner.clients.get(to) {
                Some(slot) if slot.open => {
                    let _ = slot.frames.send(frame);
                }
                _ => debug!(to = %to, "rendezvous has no client for frame"),
            },
        }
    }
}

pub struct MemorySignalConnector {
    server: MemorySignalServer,
    id: PeerId,
    keepalive: bool,
}

impl RendezvousConnector for MemorySignalConnector {
    fn connect(&self, events: EventSender) -> SignalClient {
        let frames_rx = self.server.register(&self.id);
        let channel = Arc::new(MemorySignalChannel {
            server: self.server.clone(),
            id: self.id.clone(),
        });
        SignalClient::new(channel, frames_rx, events, self.keepalive)
    }
}

struct MemorySignalChannel {
    server: MemorySignalServer,
    id: PeerId,
}

#[async_trait]
impl RendezvousChannel for MemorySignalChannel {
    async fn send_frame(&self, frame: String) -> Result<()> {
        if !self.server.is_open(&self.id) {
            bail!("rendezvous channel closed");
        }
        self.server.route(&self.id, frame);
        Ok(())
    }

    fn state(&self) -> ChannelState {
        if self.server.is_open(&self.id) {
            ChannelState::Open
        } else {
            ChannelState::Closed
        }
    }

    fn close(&self) {
        self.server.disconnect(&self.id);
    }
}
