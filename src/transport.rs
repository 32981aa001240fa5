//! # Transport Capabilities
//!
//! The overlay core never talks to a network directly. It consumes two
//! capabilities:
//!
//! | Capability | Purpose |
//! |------------|---------|
//! | [`PeerTransport`] | One bidirectional datagram channel per remote peer |
//! | [`TransportFactory`] | Builds an adapter when a session is initiated |
//!
//! An adapter walks `connecting → open → (closing)? → closed` and never
//! re-opens. The core tolerates state changes arriving out of handshake
//! order and assumes nothing about the timing between offer creation
//! and channel open.
//!
//! Adapters push everything they observe into the owning peer task
//! through a single [`TransportEvent`] stream; the peer task is the
//! only consumer and owns all connection state.
//!
//! The in-memory [`MemoryHub`] implements the same capability for
//! tests and demos: a process-local pair transport with a simulated
//! descriptor exchange.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::messages::{Message, PeerId};

/// Channel lifecycle. Strictly forward-moving.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl ChannelState {
    /// Connecting or open: the session is still worth keeping.
    pub fn is_live(self) -> bool {
        matches!(self, ChannelState::Connecting | ChannelState::Open)
    }
}

/// Sender half of the peer task's transport inbox.
pub type EventSender = mpsc::UnboundedSender<TransportEvent>;

/// Anything a transport (or the rendezvous client) surfaces to the
/// peer task.
#[derive(Debug)]
pub struct TransportEvent {
    pub remote: PeerId,
    pub payload: TransportPayload,
}

#[derive(Debug)]
pub enum TransportPayload {
    /// A message arrived on this channel.
    Inbound(Message),
    /// The channel changed state.
    State(ChannelState),
    /// Emitted by the rendezvous client when the platform needs a
    /// periodic keepalive message.
    Keepalive,
}

/// One bidirectional channel toward a single remote.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Send a message over the channel. Fails unless the channel is
    /// open.
    async fn send(&self, message: &Message) -> Result<()>;

    fn state(&self) -> ChannelState;

    /// Prepare the datagram channel on the offering side. Must be
    /// called before [`PeerTransport::create_offer`].
    fn create_channel(&self);

    /// Produce a session descriptor as the offering side.
    async fn create_offer(&self) -> Result<String>;

    /// Produce a session descriptor answering `remote_sdp`.
    async fn create_answer(&self, remote_sdp: &str) -> Result<String>;

    /// Apply the remote session descriptor (the answer, on the
    /// offering side).
    async fn set_remote_description(&self, sdp: &str) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: &str) -> Result<()>;

    fn close(&self);
}

/// Builds a [`PeerTransport`] toward `remote`. The adapter reports all
/// of its events through `events`, tagged with `remote`.
pub trait TransportFactory: Send + Sync {
    fn create(&self, local: &PeerId, remote: &PeerId, events: EventSender)
        -> Box<dyn PeerTransport>;
}

// ============================================================================
// In-memory pair transport
// ============================================================================

/// Process-local transport hub. Every adapter created through a
/// [`MemoryFactory`] registers an endpoint here; the hub delivers
/// messages between paired endpoints and simulates the descriptor
/// exchange: the channel opens on both sides when the offering side
/// applies the answer.
#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<Mutex<HubInner>>,
}

#[derive(Default)]
struct HubInner {
    endpoints: HashMap<(PeerId, PeerId), Endpoint>,
}

struct Endpoint {
    state: ChannelState,
    events: EventSender,
    candidates: Vec<String>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn factory(&self) -> MemoryFactory {
        MemoryFactory { hub: self.clone() }
    }

    fn register(&self, local: &PeerId, remote: &PeerId, events: EventSender) {
        let mut inner = self.inner.lock().expect("hub lock");
        inner.endpoints.insert(
            (local.clone(), remote.clone()),
            Endpoint {
                state: ChannelState::Connecting,
                events,
                candidates: Vec::new(),
            },
        );
    }

    fn state_of(&self, local: &PeerId, remote: &PeerId) -> ChannelState {
        let inner = self.inner.lock().expect("hub lock");
        inner
            .endpoints
            .get(&(local.clone(), remote.clone()))
            .map(|e| e.state)
            .unwrap_or(ChannelState::Closed)
    }

    fn deliver(&self, local: &PeerId, remote: &PeerId, message: &Message) -> Result<()> {
        let inner = self.inner.lock().expect("hub lock");
        let own = inner
            .endpoints
            .get(&(local.clone(), remote.clone()))
            .ok_or_else(|| anyhow::anyhow!("no endpoint {local}->{remote}"))?;
        if own.state != ChannelState::Open {
            bail!("channel {local}->{remote} is {:?}", own.state);
        }
        let peer = inner
            .endpoints
            .get(&(remote.clone(), local.clone()))
            .ok_or_else(|| anyhow::anyhow!("peer endpoint {remote}->{local} gone"))?;
        let _ = peer.events.send(TransportEvent {
            remote: local.clone(),
            payload: TransportPayload::Inbound(message.clone()),
        });
        Ok(())
    }

    fn transition(inner: &mut HubInner, key: (PeerId, PeerId), state: ChannelState) {
        if let Some(endpoint) = inner.endpoints.get_mut(&key) {
            if endpoint.state == state {
                return;
            }
            endpoint.state = state;
            let _ = endpoint.events.send(TransportEvent {
                remote: key.1.clone(),
                payload: TransportPayload::State(state),
            });
        }
    }

    fn open_pair(&self, a: &PeerId, b: &PeerId) {
        let mut inner = self.inner.lock().expect("hub lock");
        Self::transition(&mut inner, (a.clone(), b.clone()), ChannelState::Open);
        Self::transition(&mut inner, (b.clone(), a.clone()), ChannelState::Open);
    }

    fn close_pair(&self, a: &PeerId, b: &PeerId) {
        let mut inner = self.inner.lock().expect("hub lock");
        Self::transition(&mut inner, (a.clone(), b.clone()), ChannelState::Closed);
        Self::transition(&mut inner, (b.clone(), a.clone()), ChannelState::Closed);
    }

    fn record_candidate(&self, local: &PeerId, remote: &PeerId, candidate: &str) {
        let mut inner = self.inner.lock().expect("hub lock");
        if let Some(endpoint) = inner.endpoints.get_mut(&(local.clone(), remote.clone())) {
            endpoint.candidates.push(candidate.to_string());
        }
    }

    /// Candidates applied on the `local -> remote` endpoint. Test
    /// introspection.
    pub fn applied_candidates(&self, local: &PeerId, remote: &PeerId) -> Vec<String> {
        let inner = self.inner.lock().expect("hub lock");
        inner
            .endpoints
            .get(&(local.clone(), remote.clone()))
            .map(|e| e.candidates.clone())
            .unwrap_or_default()
    }

    /// Drop the channel between two peers, as a network failure would.
    pub fn sever(&self, a: &PeerId, b: &PeerId) {
        self.close_pair(a, b);
    }
}

pub struct MemoryFactory {
    hub: MemoryHub,
}

impl TransportFactory for MemoryFactory {
    fn create(
        &self,
        local: &PeerId,
        remote: &PeerId,
        events: EventSender,
    ) -> Box<dyn PeerTransport> {
        self.hub.register(local, remote, events);
        Box::new(MemoryTransport {
            hub: self.hub.clone(),
            local: local.clone(),
            remote: remote.clone(),
        })
    }
}

struct MemoryTransport {
    hub: MemoryHub,
    local: PeerId,
    remote: PeerId,
}

#[async_trait]
impl PeerTransport for MemoryTransport {
    async fn send(&self, message: &Message) -> Result<()> {
        self.hub.deliver(&self.local, &self.remote, message)
    }

    fn state(&self) -> ChannelState {
        self.hub.state_of(&self.local, &self.remote)
    }

    fn create_channel(&self) {
        // The paired endpoint is materialized lazily by the answering
        // side; nothing to prepare here.
    }

    async fn create_offer(&self) -> Result<String> {
        Ok(format!("offer:{}", self.local))
    }

    async fn create_answer(&self, remote_sdp: &str) -> Result<String> {
        if !remote_sdp.starts_with("offer:") {
            bail!("not an offer descriptor: {remote_sdp}");
        }
        Ok(format!("answer:{}", self.local))
    }

    async fn set_remote_description(&self, sdp: &str) -> Result<()> {
        if sdp.starts_with("answer:") {
            // Handshake complete from the offerer's perspective: the
            // datagram channel comes up on both ends.
            self.hub.open_pair(&self.local, &self.remote);
            Ok(())
        } else if sdp.starts_with("offer:") {
            Ok(())
        } else {
            bail!("unrecognized descriptor: {sdp}")
        }
    }

    async fn add_ice_candidate(&self, candidate: &str) -> Result<()> {
        self.hub.record_candidate(&self.local, &self.remote, candidate);
        Ok(())
    }

    fn close(&self) {
        self.hub.close_pair(&self.local, &self.remote);
    }
}
