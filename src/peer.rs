//! # Peer Core
//!
//! The router at the center of every node. One task owns all routing
//! state: the connection table (with the rendezvous under its reserved
//! key), the arena of candidates buffered for sessions that do not
//! exist yet, and the outbound queue of messages waiting for a route.
//!
//! ## Routing decision
//!
//! For every outbound message, in order:
//!
//! 1. bulk kinds gated by the heavy-admission policy are sent only
//!    over connections whose outgoing weight is heavy; otherwise an
//!    upgrade is solicited and the message parks in the queue;
//! 2. an open channel to the destination wins;
//! 3. else the head of the route hint is consumed if it is an open
//!    neighbor;
//! 4. else handshake kinds flood over open channels, excluding every
//!    peer that already relayed the message;
//! 5. else the message is queued, and a `request-peer` goes out to
//!    solicit a session toward the destination.
//!
//! The queue is swept on a fixed tick: expired entries fire their
//! timeout notifier and drop, survivors are re-routed, idle channels
//! are closed and closed ones purged.
//!
//! ## Session bring-up
//!
//! Sessions are negotiated over the overlay itself (or the rendezvous
//! as relay of last resort): `request-peer` makes the receiver produce
//! an offer, the offer makes the initiator produce an answer, and
//! candidates trickle in either direction, buffered until their
//! session exists.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::emitter::Emitter;
use crate::errors::SwarmError;
use crate::extensions::{self, Extension, HeavyPolicy};
use crate::gossip::GossipHandle;
use crate::media::{MediaManager, PartStatus, PipelineDone, SegmentIndex};
use crate::messages::{
    kind, CandidatePayload, FirstView, Message, NodeDescriptor, PartRequest, PeerId,
    SessionDescriptor, ViewUpdatePayload, WeightPayload, WeightVerb, ANY_PEER, FORWARDABLE,
    SIGNAL, SOURCE,
};
use crate::signal::RendezvousConnector;
use crate::transport::{
    ChannelState, EventSender, PeerTransport, TransportEvent, TransportFactory, TransportPayload,
};
use crate::util::contains_match;

/// Queue maintenance cadence.
pub const DEFAULT_QUEUE_TIMEOUT: Duration = Duration::from_millis(1000);

/// Open channels idle longer than this are closed by maintenance.
pub const DEFAULT_INACTIVITY_TIMEOUT: Duration = Duration::from_millis(10_000);

#[derive(Clone, Debug)]
pub struct PeerConfig {
    /// Hop budget stamped on locally originated messages.
    pub ttl: u32,
    pub queue_timeout: Duration,
    pub inactivity_timeout: Duration,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            ttl: crate::messages::DEFAULT_TTL,
            queue_timeout: DEFAULT_QUEUE_TIMEOUT,
            inactivity_timeout: DEFAULT_INACTIVITY_TIMEOUT,
        }
    }
}

/// Connection weight classes. Bulk media flows only over heavy
/// channels; admission is capped by the gossip engine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Weight {
    #[default]
    Light,
    Heavy,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConnectionWeight {
    /// What we admitted from the remote.
    pub incoming: Weight,
    /// What the remote admitted from us.
    pub outgoing: Weight,
}

struct ConnectionEntry {
    transport: Box<dyn PeerTransport>,
    state: ChannelState,
    last_activity: Instant,
    weight: ConnectionWeight,
}

impl ConnectionEntry {
    fn new(transport: Box<dyn PeerTransport>) -> Self {
        let state = transport.state();
        Self {
            transport,
            state,
            last_activity: Instant::now(),
            weight: ConnectionWeight::default(),
        }
    }
}

struct QueuedMessage {
    message: Message,
    deadline: Option<Instant>,
    on_timeout: Option<oneshot::Sender<()>>,
}

impl QueuedMessage {
    fn new(
        message: Message,
        timeout: Option<Duration>,
        on_timeout: Option<oneshot::Sender<()>>,
    ) -> Self {
        Self {
            message,
            deadline: timeout.map(|t| Instant::now() + t),
            on_timeout,
        }
    }

    fn bare(message: Message) -> Self {
        Self::new(message, None, None)
    }
}

// ============================================================================
// Shared state handed to extension handlers
// ============================================================================

/// Everything the router owns. Extension handlers receive a mutable
/// borrow and communicate outward exclusively through [`PeerState::emit`].
pub struct PeerState {
    pub(crate) id: PeerId,
    pub(crate) config: PeerConfig,
    connections: HashMap<PeerId, ConnectionEntry>,
    pending_candidates: HashMap<PeerId, Vec<String>>,
    queue: Vec<QueuedMessage>,
    outbox: Vec<Message>,
    factory: Arc<dyn TransportFactory>,
    connector: Arc<dyn RendezvousConnector>,
    events_tx: EventSender,
    pub(crate) heavy: Option<Arc<dyn HeavyPolicy>>,
    pub(crate) gossip: Option<GossipHandle>,
    pub(crate) media: Option<MediaManager>,
    view: Vec<NodeDescriptor>,
    max_connections: usize,
}

impl PeerState {
    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn ttl(&self) -> u32 {
        self.config.ttl
    }

    /// Queue a message for routing once the current dispatch returns.
    pub fn emit(&mut self, message: Message) {
        self.outbox.push(message);
    }

    /// Build a reply seeded for reverse-path delivery: the relay trail
    /// of the original becomes the route hint of the reply.
    pub fn respond_to(&self, original: &Message, kind: &str, data: Value) -> Message {
        let mut reply = Message::new(
            kind,
            self.id.clone(),
            original.from.clone(),
            self.config.ttl,
            data,
        );
        reply.route = original.forward_by.clone();
        reply
    }

    /// A fresh locally-originated message.
    pub fn message_to(&self, kind: &str, to: impl Into<PeerId>, data: Value) -> Message {
        Message::new(kind, self.id.clone(), to, self.config.ttl, data)
    }

    /// Remotes with an open channel, rendezvous excluded.
    pub fn open_neighbors(&self) -> Vec<PeerId> {
        self.connections
            .iter()
            .filter(|(id, conn)| id.as_str() != SIGNAL && conn.state == ChannelState::Open)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn media(&self) -> Option<&MediaManager> {
        self.media.as_ref()
    }

    pub fn media_mut(&mut self) -> Option<&mut MediaManager> {
        self.media.as_mut()
    }
}

/// The builder's view of a peer under construction; extensions install
/// their pieces through this.
pub struct PeerSetup<'a> {
    state: &'a mut PeerState,
    emitter: &'a mut Emitter<PeerState>,
    gossip_out: &'a mut Option<mpsc::UnboundedReceiver<Message>>,
    media_done: &'a mut Option<mpsc::UnboundedReceiver<PipelineDone>>,
}

impl PeerSetup<'_> {
    /// Register a message handler.
    pub fn on(&mut self, kind: &str, handler: impl FnMut(&mut PeerState, &Message) + Send + 'static) {
        self.emitter.on(kind, handler);
    }

    pub fn set_heavy_policy(&mut self, policy: Arc<dyn HeavyPolicy>) {
        self.state.heavy = Some(policy);
    }

    pub fn install_gossip(
        &mut self,
        handle: GossipHandle,
        out: mpsc::UnboundedReceiver<Message>,
    ) {
        self.state.gossip = Some(handle);
        *self.gossip_out = Some(out);
    }

    pub fn install_media(&mut self, mut manager: MediaManager) {
        *self.media_done = manager.take_done_events();
        self.state.media = Some(manager);
    }
}

// ============================================================================
// Public handle
// ============================================================================

enum Command {
    Send {
        message: Message,
        timeout: Option<Duration>,
        on_timeout: Option<oneshot::Sender<()>>,
        reply: oneshot::Sender<Result<(), SwarmError>>,
    },
    RequestPeer {
        to: PeerId,
        timeout: Option<Duration>,
        on_timeout: Option<oneshot::Sender<()>>,
        reply: oneshot::Sender<Result<(), SwarmError>>,
    },
    Snapshot(oneshot::Sender<PeerSnapshot>),
    SetMetadata {
        index: SegmentIndex,
        reply: oneshot::Sender<anyhow::Result<()>>,
    },
    AppendHead {
        bytes: Vec<u8>,
        reply: oneshot::Sender<anyhow::Result<()>>,
    },
    AppendPart {
        number: String,
        bytes: Vec<u8>,
        reply: oneshot::Sender<Result<(), SwarmError>>,
    },
    RequestParts {
        count: usize,
        chunk_size: usize,
        reply: oneshot::Sender<Vec<(usize, PeerId)>>,
    },
    Quit,
}

/// Diagnostic snapshot of the router state.
#[derive(Clone, Debug)]
pub struct PeerSnapshot {
    pub id: PeerId,
    pub connections: Vec<ConnectionInfo>,
    pub queue_len: usize,
    /// (kind, destination) of every queued message.
    pub queued: Vec<(String, PeerId)>,
    pub pending_candidates: Vec<(PeerId, usize)>,
    pub view: Vec<NodeDescriptor>,
    pub max_connections: usize,
    pub parts: Vec<PartStatus>,
    /// What each remote advertises, when media is installed.
    pub availability: Vec<(PeerId, Vec<usize>)>,
}

impl PeerSnapshot {
    pub fn connection(&self, remote: &str) -> Option<&ConnectionInfo> {
        self.connections.iter().find(|c| c.remote == remote)
    }

    pub fn open_peers(&self) -> Vec<PeerId> {
        self.connections
            .iter()
            .filter(|c| c.remote != SIGNAL && c.state == ChannelState::Open)
            .map(|c| c.remote.clone())
            .collect()
    }
}

#[derive(Clone, Debug)]
pub struct ConnectionInfo {
    pub remote: PeerId,
    pub state: ChannelState,
    pub weight: ConnectionWeight,
}

/// Cheap handle to a peer task.
#[derive(Clone)]
pub struct PeerHandle {
    cmd_tx: mpsc::Sender<Command>,
}

impl PeerHandle {
    pub async fn send(&self, message: Message) -> Result<(), SwarmError> {
        let (reply, rx) = oneshot::channel();
        let _ = self
            .cmd_tx
            .send(Command::Send {
                message,
                timeout: None,
                on_timeout: None,
                reply,
            })
            .await;
        rx.await.unwrap_or(Ok(()))
    }

    /// Send with a queue residency bound; the returned receiver fires
    /// exactly once if the message expires unsent.
    pub async fn send_with_timeout(
        &self,
        message: Message,
        timeout: Duration,
    ) -> Result<oneshot::Receiver<()>, SwarmError> {
        let (notify_tx, notify_rx) = oneshot::channel();
        let (reply, rx) = oneshot::channel();
        let _ = self
            .cmd_tx
            .send(Command::Send {
                message,
                timeout: Some(timeout),
                on_timeout: Some(notify_tx),
                reply,
            })
            .await;
        rx.await.unwrap_or(Ok(()))?;
        Ok(notify_rx)
    }

    /// Solicit a session. `to` defaults to any peer.
    pub async fn request_peer(&self, to: impl Into<PeerId>) -> Result<(), SwarmError> {
        let (reply, rx) = oneshot::channel();
        let _ = self
            .cmd_tx
            .send(Command::RequestPeer {
                to: to.into(),
                timeout: None,
                on_timeout: None,
                reply,
            })
            .await;
        rx.await.unwrap_or(Ok(()))
    }

    pub async fn request_any_peer(&self) -> Result<(), SwarmError> {
        self.request_peer(ANY_PEER).await
    }

    /// [`PeerHandle::request_peer`] with a queue residency bound, like
    /// [`PeerHandle::send_with_timeout`].
    pub async fn request_peer_with_timeout(
        &self,
        to: impl Into<PeerId>,
        timeout: Duration,
    ) -> Result<oneshot::Receiver<()>, SwarmError> {
        let (notify_tx, notify_rx) = oneshot::channel();
        let (reply, rx) = oneshot::channel();
        let _ = self
            .cmd_tx
            .send(Command::RequestPeer {
                to: to.into(),
                timeout: Some(timeout),
                on_timeout: Some(notify_tx),
                reply,
            })
            .await;
        rx.await.unwrap_or(Ok(()))?;
        Ok(notify_rx)
    }

    pub async fn snapshot(&self) -> PeerSnapshot {
        let (reply, rx) = oneshot::channel();
        let _ = self.cmd_tx.send(Command::Snapshot(reply)).await;
        rx.await.unwrap_or(PeerSnapshot {
            id: String::new(),
            connections: Vec::new(),
            queue_len: 0,
            queued: Vec::new(),
            pending_candidates: Vec::new(),
            view: Vec::new(),
            max_connections: 0,
            parts: Vec::new(),
            availability: Vec::new(),
        })
    }

    /// Adopt the segment index from the demuxer.
    pub async fn set_metadata(&self, index: SegmentIndex) -> anyhow::Result<()> {
        let (reply, rx) = oneshot::channel();
        let _ = self.cmd_tx.send(Command::SetMetadata { index, reply }).await;
        rx.await.map_err(|_| anyhow::anyhow!("peer task gone"))?
    }

    /// Feed the file head (everything before the first cluster).
    pub async fn append_head(&self, bytes: Vec<u8>) -> anyhow::Result<()> {
        let (reply, rx) = oneshot::channel();
        let _ = self.cmd_tx.send(Command::AppendHead { bytes, reply }).await;
        rx.await.map_err(|_| anyhow::anyhow!("peer task gone"))?
    }

    /// Feed part bytes fetched outside the overlay (origin fallback).
    pub async fn append_part(&self, number: &str, bytes: Vec<u8>) -> Result<(), SwarmError> {
        let (reply, rx) = oneshot::channel();
        let _ = self
            .cmd_tx
            .send(Command::AppendPart {
                number: number.to_string(),
                bytes,
                reply,
            })
            .await;
        rx.await.unwrap_or(Ok(()))
    }

    /// Pick the next missing parts and request them from the overlay.
    /// Returns the picks; entries paired with the origin sentinel are
    /// the caller's to fetch.
    pub async fn request_parts(
        &self,
        count: usize,
        chunk_size: usize,
    ) -> Vec<(usize, PeerId)> {
        let (reply, rx) = oneshot::channel();
        let _ = self
            .cmd_tx
            .send(Command::RequestParts {
                count,
                chunk_size,
                reply,
            })
            .await;
        rx.await.unwrap_or_default()
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }
}

// ============================================================================
// Builder
// ============================================================================

pub struct PeerBuilder {
    config: PeerConfig,
    factory: Arc<dyn TransportFactory>,
    connector: Arc<dyn RendezvousConnector>,
    extensions: Vec<Box<dyn Extension>>,
}

impl PeerBuilder {
    pub fn new(factory: Arc<dyn TransportFactory>, connector: Arc<dyn RendezvousConnector>) -> Self {
        Self {
            config: PeerConfig::default(),
            factory,
            connector,
            extensions: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: PeerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_extension(mut self, extension: Box<dyn Extension>) -> Self {
        self.extensions.push(extension);
        self
    }

    /// Connect the rendezvous channel, install the extensions, and
    /// start the router task.
    pub fn spawn(self) -> PeerHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let mut state = PeerState {
            id: PeerId::new(),
            config: self.config,
            connections: HashMap::new(),
            pending_candidates: HashMap::new(),
            queue: Vec::new(),
            outbox: Vec::new(),
            factory: self.factory,
            connector: self.connector,
            events_tx: events_tx.clone(),
            heavy: None,
            gossip: None,
            media: None,
            view: Vec::new(),
            max_connections: 0,
        };

        let signal = state.connector.connect(events_tx);
        state
            .connections
            .insert(SIGNAL.to_string(), ConnectionEntry::new(Box::new(signal)));

        let mut emitter = Emitter::new();
        let mut gossip_out = None;
        let mut media_done = None;
        {
            let mut setup = PeerSetup {
                state: &mut state,
                emitter: &mut emitter,
                gossip_out: &mut gossip_out,
                media_done: &mut media_done,
            };
            for extension in self.extensions {
                extension.install(&mut setup);
            }
        }

        let actor = PeerActor {
            state,
            emitter,
            gossip_out,
            media_done,
        };
        tokio::spawn(actor.run(cmd_rx, events_rx));

        PeerHandle { cmd_tx }
    }
}

// ============================================================================
// Actor
// ============================================================================

struct PeerActor {
    state: PeerState,
    emitter: Emitter<PeerState>,
    gossip_out: Option<mpsc::UnboundedReceiver<Message>>,
    media_done: Option<mpsc::UnboundedReceiver<PipelineDone>>,
}

async fn recv_opt<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl PeerActor {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut events_rx: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        let mut ticker = tokio::time::interval(self.state.config.queue_timeout);
        ticker.tick().await; // the immediate first tick is not maintenance
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(command) => {
                        if self.handle_command(command).await {
                            break;
                        }
                    }
                    None => break,
                },
                Some(event) = events_rx.recv() => self.handle_event(event).await,
                Some(message) = recv_opt(&mut self.gossip_out) => self.handle_gossip_out(message).await,
                Some(done) = recv_opt(&mut self.media_done) => self.handle_media_done(done).await,
                _ = ticker.tick() => self.maintenance().await,
            }
        }
        debug!(id = %self.state.id, "peer task quitting");
        if let Some(gossip) = &self.state.gossip {
            gossip.quit().await;
        }
    }

    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Send {
                message,
                timeout,
                on_timeout,
                reply,
            } => {
                let result = self.submit(message, timeout, on_timeout).await;
                let _ = reply.send(result);
            }
            Command::RequestPeer {
                to,
                timeout,
                on_timeout,
                reply,
            } => {
                let message = self.state.message_to(kind::REQUEST_PEER, to, Value::Null);
                let result = self.submit(message, timeout, on_timeout).await;
                let _ = reply.send(result);
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Command::SetMetadata { index, reply } => {
                let result = match self.state.media.as_mut() {
                    Some(media) => media.set_metadata(index),
                    None => Err(anyhow::anyhow!("media extension not installed")),
                };
                let _ = reply.send(result);
            }
            Command::AppendHead { bytes, reply } => {
                let result = match self.state.media.as_mut() {
                    Some(media) => {
                        media.append_head(bytes);
                        Ok(())
                    }
                    None => Err(anyhow::anyhow!("media extension not installed")),
                };
                let _ = reply.send(result);
            }
            Command::AppendPart {
                number,
                bytes,
                reply,
            } => {
                let result = match self.state.media.as_mut() {
                    Some(media) => media.append(&number, bytes),
                    None => Err(SwarmError::InvalidMessage("media")),
                };
                let outcome = match result {
                    Ok(Some(completed)) => {
                        extensions::advertise_completed(&mut self.state, completed);
                        self.flush_outbox().await;
                        Ok(())
                    }
                    Ok(None) => Ok(()),
                    Err(e) => Err(e),
                };
                let _ = reply.send(outcome);
            }
            Command::RequestParts {
                count,
                chunk_size,
                reply,
            } => {
                let picks = self.request_parts(count, chunk_size).await;
                let _ = reply.send(picks);
            }
            Command::Quit => return true,
        }
        false
    }

    fn snapshot(&self) -> PeerSnapshot {
        PeerSnapshot {
            id: self.state.id.clone(),
            connections: self
                .state
                .connections
                .iter()
                .map(|(remote, conn)| ConnectionInfo {
                    remote: remote.clone(),
                    state: conn.state,
                    weight: conn.weight,
                })
                .collect(),
            queue_len: self.state.queue.len(),
            queued: self
                .state
                .queue
                .iter()
                .map(|q| (q.message.kind.clone(), q.message.to.clone()))
                .collect(),
            pending_candidates: self
                .state
                .pending_candidates
                .iter()
                .map(|(remote, candidates)| (remote.clone(), candidates.len()))
                .collect(),
            view: self.state.view.clone(),
            max_connections: self.state.max_connections,
            parts: self
                .state
                .media
                .as_ref()
                .map(|m| m.part_statuses())
                .unwrap_or_default(),
            availability: self
                .state
                .media
                .as_ref()
                .map(|m| m.remote_availability())
                .unwrap_or_default(),
        }
    }

    // ------------------------------------------------------------------
    // Egress
    // ------------------------------------------------------------------

    // Boxed explicitly (rather than `async fn`) so the future's type is
    // a concrete, nominally-Send `Pin<Box<dyn Future + Send>>` instead
    // of an opaque type whose Send-ness would need to be inferred
    // through the submit -> dispatch -> flush -> submit cycle below.
    fn submit<'a>(
        &'a mut self,
        message: Message,
        timeout: Option<Duration>,
        on_timeout: Option<oneshot::Sender<()>>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), SwarmError>> + Send + 'a>>
    {
        Box::pin(async move {
            message.validate()?;
            if message.to == self.state.id {
                self.dispatch_local(message).await;
                return Ok(());
            }
            let mut overflow = Vec::new();
            self.process_message(QueuedMessage::new(message, timeout, on_timeout), &mut overflow)
                .await;
            self.state.queue.append(&mut overflow);
            Ok(())
        })
    }

    /// The routing decision. Messages that cannot leave now end up in
    /// `out_queue`.
    async fn process_message(&mut self, queued: QueuedMessage, out_queue: &mut Vec<QueuedMessage>) {
        let to = queued.message.to.clone();

        // 1. Heavy admission gate.
        let is_heavy = self
            .state
            .heavy
            .as_ref()
            .is_some_and(|policy| policy.is_heavy(&queued.message));
        if is_heavy && to != SIGNAL && to != SOURCE && to != ANY_PEER {
            let admitted = self.state.connections.get(&to).is_some_and(|conn| {
                conn.state == ChannelState::Open && conn.weight.outgoing == Weight::Heavy
            });
            if admitted {
                self.send_direct(&to, queued.message).await;
                return;
            }
            self.solicit_heavy_upgrade(&to, out_queue).await;
            out_queue.push(queued);
            return;
        }

        // 2. Open channel to the destination.
        if self
            .state
            .connections
            .get(&to)
            .is_some_and(|conn| conn.state == ChannelState::Open)
        {
            self.send_direct(&to, queued.message).await;
            return;
        }

        // 3. Route hint, consumed head-first.
        if let Some(head) = queued.message.route.first().cloned() {
            if self
                .state
                .connections
                .get(&head)
                .is_some_and(|conn| conn.state == ChannelState::Open)
            {
                let mut message = queued.message;
                message.route.remove(0);
                self.send_direct(&head, message).await;
                return;
            }
        }

        // 4. Handshake kinds flood.
        if FORWARDABLE.contains(&queued.message.kind.as_str())
            && self.broadcast(&queued.message).await
        {
            return;
        }

        // 5. Park and solicit.
        self.requeue(queued, out_queue).await;
    }

    async fn requeue(&mut self, queued: QueuedMessage, out_queue: &mut Vec<QueuedMessage>) {
        let message = &queued.message;
        if message.to == SIGNAL || message.to == SOURCE {
            out_queue.push(queued);
            return;
        }
        if message.kind == kind::REQUEST_PEER {
            if !self.queue_has_request_peer(&message.from, &message.to, out_queue) {
                out_queue.push(queued);
            }
            return;
        }

        let to = message.to.clone();
        trace!(
            kind = %message.kind,
            error = %SwarmError::UnknownDestination(to.clone()),
            "parking message"
        );
        out_queue.push(queued);

        // Solicit a session toward the destination.
        let request = self
            .state
            .message_to(kind::REQUEST_PEER, to, Value::Null);
        if !self.broadcast(&request).await
            && !self.queue_has_request_peer(&request.from, &request.to, out_queue)
        {
            out_queue.push(QueuedMessage::bare(request));
        }
    }

    fn queue_has_request_peer(
        &self,
        from: &PeerId,
        to: &PeerId,
        building: &[QueuedMessage],
    ) -> bool {
        let template = json!({"type": kind::REQUEST_PEER, "from": from, "to": to});
        let haystack: Vec<Value> = building
            .iter()
            .chain(self.state.queue.iter())
            .map(|q| serde_json::to_value(&q.message).expect("message serializes"))
            .collect();
        contains_match(&template, &haystack)
    }

    async fn solicit_heavy_upgrade(&mut self, to: &PeerId, out_queue: &mut Vec<QueuedMessage>) {
        let request = self.state.message_to(
            kind::GOSSIP_WEIGHT,
            to.clone(),
            json!(WeightPayload {
                value: WeightVerb::RequestHeavy
            }),
        );
        if self
            .state
            .connections
            .get(to)
            .is_some_and(|conn| conn.state == ChannelState::Open)
        {
            self.send_direct(to, request).await;
            return;
        }
        // No channel yet; park the upgrade request unless one is
        // already waiting.
        let template = json!({
            "type": kind::GOSSIP_WEIGHT,
            "to": to,
            "data": {"value": "request-heavy"},
        });
        let haystack: Vec<Value> = out_queue
            .iter()
            .chain(self.state.queue.iter())
            .map(|q| serde_json::to_value(&q.message).expect("message serializes"))
            .collect();
        if !contains_match(&template, &haystack) {
            out_queue.push(QueuedMessage::bare(request));
        }
    }

    /// Sender-excluded flood. True when at least one copy left the
    /// node, counting the rendezvous fallback.
    async fn broadcast(&mut self, message: &Message) -> bool {
        let mut excluded: HashSet<&str> = message.forward_by.iter().map(String::as_str).collect();
        excluded.insert(message.from.as_str());

        let targets: Vec<PeerId> = self
            .state
            .connections
            .iter()
            .filter(|(id, conn)| {
                id.as_str() != SIGNAL
                    && conn.state == ChannelState::Open
                    && !excluded.contains(id.as_str())
            })
            .map(|(id, _)| id.clone())
            .collect();

        for target in &targets {
            self.send_direct(target, message.clone()).await;
        }
        if !targets.is_empty() {
            return true;
        }

        // Fall back to the rendezvous for our own messages only.
        if message.from != self.state.id {
            return false;
        }
        let signal_state = self
            .state
            .connections
            .get(SIGNAL)
            .map(|conn| conn.state)
            .unwrap_or(ChannelState::Closed);
        match signal_state {
            ChannelState::Open => {
                self.send_direct(&SIGNAL.to_string(), message.clone()).await;
                true
            }
            ChannelState::Closing | ChannelState::Closed => {
                debug!("rendezvous channel lost, reconnecting");
                self.replace_signal();
                false
            }
            ChannelState::Connecting => false,
        }
    }

    fn replace_signal(&mut self) {
        let signal = self.state.connector.connect(self.state.events_tx.clone());
        self.state
            .connections
            .insert(SIGNAL.to_string(), ConnectionEntry::new(Box::new(signal)));
    }

    async fn send_direct(&mut self, remote: &PeerId, message: Message) {
        let Some(conn) = self.state.connections.get_mut(remote) else {
            return;
        };
        conn.last_activity = Instant::now();
        if let Err(e) = conn.transport.send(&message).await {
            warn!(
                error = %SwarmError::TransportFailure(e.to_string()),
                remote = %remote,
                kind = %message.kind,
                "send failed"
            );
        }
    }

    // ------------------------------------------------------------------
    // Ingress
    // ------------------------------------------------------------------

    async fn handle_event(&mut self, event: TransportEvent) {
        match event.payload {
            TransportPayload::Inbound(message) => {
                self.touch(&event.remote);
                self.on_inbound(message).await;
            }
            TransportPayload::State(new_state) => {
                match self.state.connections.get_mut(&event.remote) {
                    Some(conn) => {
                        trace!(remote = %event.remote, state = ?new_state, "channel state change");
                        conn.state = new_state;
                        conn.last_activity = Instant::now();
                    }
                    None => {
                        debug!(remote = %event.remote, "state change for unknown channel");
                        return;
                    }
                }
                if new_state == ChannelState::Open {
                    self.on_channel_open(event.remote).await;
                }
            }
            TransportPayload::Keepalive => {
                if !self.state.id.is_empty() {
                    let ping = Message::new(kind::KEEPALIVE, self.state.id.clone(), SIGNAL, 0, Value::Null);
                    let _ = self.submit(ping, None, None).await;
                }
            }
        }
    }

    async fn on_inbound(&mut self, message: Message) {
        if message.to == self.state.id || self.state.id.is_empty() {
            self.dispatch_local(message).await;
        } else if message.to == ANY_PEER {
            self.dispatch_local(message.clone()).await;
            self.forward(message).await;
        } else {
            self.forward(message).await;
        }
    }

    /// Relay on behalf of others: spend one hop, leave our mark, and
    /// re-route. A message with an exhausted hop budget stops here.
    async fn forward(&mut self, mut message: Message) {
        if message.ttl == 0 {
            trace!(kind = %message.kind, to = %message.to, "hop budget exhausted");
            return;
        }
        message.ttl -= 1;
        message.forward_by.push(self.state.id.clone());
        if let Err(e) = self.submit(message, None, None).await {
            debug!(error = %e, "dropping unforwardable message");
        }
    }

    async fn dispatch_local(&mut self, message: Message) {
        let message_kind = message.kind.clone();
        let builtin = match message_kind.as_str() {
            kind::REQUEST_PEER => {
                self.handle_request_peer(&message).await;
                true
            }
            kind::OFFER => {
                self.handle_offer(&message).await;
                true
            }
            kind::ANSWER => {
                self.handle_answer(&message).await;
                true
            }
            kind::ICE_CANDIDATE => {
                self.handle_candidate(&message).await;
                true
            }
            kind::FIRST_VIEW => {
                self.handle_first_view(&message).await;
                true
            }
            kind::GOSSIP_REQUEST_EXCHANGE
            | kind::GOSSIP_ANSWER_REQUEST
            | kind::GOSSIP_DESCRIPTOR_UPDATE
            | kind::GOSSIP_BANDWIDTH => {
                match &self.state.gossip {
                    Some(gossip) => gossip.deliver(message.clone()).await,
                    None => debug!(kind = %message_kind, "gossip extension not installed"),
                }
                true
            }
            kind::GOSSIP_WEIGHT => {
                self.handle_weight(&message);
                true
            }
            // Keepalives only ever travel toward the rendezvous;
            // nothing dispatches them locally.
            kind::CONNECTED => true,
            _ => false,
        };

        let extension = if self.emitter.handles(&message_kind) {
            self.emitter.dispatch(&mut self.state, &message);
            true
        } else {
            false
        };

        if !builtin && !extension {
            warn!(kind = %message_kind, from = %message.from, "no handler for message kind, dropping");
        }
        self.flush_outbox().await;
    }

    async fn flush_outbox(&mut self) {
        while !self.state.outbox.is_empty() {
            let pending = std::mem::take(&mut self.state.outbox);
            for message in pending {
                if let Err(e) = self.submit(message, None, None).await {
                    warn!(error = %e, "dropping invalid handler message");
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Session handshake
    // ------------------------------------------------------------------

    async fn handle_request_peer(&mut self, message: &Message) {
        let from = &message.from;
        if from == &self.state.id || from == SIGNAL {
            return;
        }
        if self
            .state
            .connections
            .get(from)
            .is_some_and(|conn| conn.state.is_live())
        {
            trace!(remote = %from, "session already live, ignoring request-peer");
            return;
        }

        let transport =
            self.state
                .factory
                .create(&self.state.id, from, self.state.events_tx.clone());
        transport.create_channel();
        self.state
            .connections
            .insert(from.clone(), ConnectionEntry::new(transport));
        self.drain_candidates(from).await;

        let offer = {
            let conn = self.state.connections.get(from).expect("just inserted");
            conn.transport.create_offer().await
        };
        match offer {
            Ok(sdp) => {
                let reply = self
                    .state
                    .respond_to(message, kind::OFFER, json!(SessionDescriptor { sdp }));
                self.state.emit(reply);
            }
            Err(e) => warn!(
                error = %SwarmError::TransportFailure(e.to_string()),
                remote = %from,
                "offer creation failed"
            ),
        }
    }

    async fn handle_offer(&mut self, message: &Message) {
        let from = &message.from;
        let Ok(descriptor) = message.data_as::<SessionDescriptor>() else {
            warn!(from = %from, "offer without a session descriptor");
            return;
        };
        if self
            .state
            .connections
            .get(from)
            .is_some_and(|conn| conn.state == ChannelState::Open)
        {
            trace!(remote = %from, "channel already open, ignoring offer");
            return;
        }

        let transport =
            self.state
                .factory
                .create(&self.state.id, from, self.state.events_tx.clone());
        self.state
            .connections
            .insert(from.clone(), ConnectionEntry::new(transport));

        let answer = {
            let conn = self.state.connections.get(from).expect("just inserted");
            conn.transport.create_answer(&descriptor.sdp).await
        };
        match answer {
            Ok(sdp) => {
                let reply = self
                    .state
                    .respond_to(message, kind::ANSWER, json!(SessionDescriptor { sdp }));
                self.state.emit(reply);
            }
            Err(e) => warn!(
                error = %SwarmError::TransportFailure(e.to_string()),
                remote = %from,
                "answer creation failed"
            ),
        }
        self.drain_candidates(from).await;
    }

    async fn handle_answer(&mut self, message: &Message) {
        let from = &message.from;
        let Ok(descriptor) = message.data_as::<SessionDescriptor>() else {
            warn!(from = %from, "answer without a session descriptor");
            return;
        };
        match self.state.connections.get(from) {
            Some(conn) if conn.state == ChannelState::Connecting => {
                if let Err(e) = conn.transport.set_remote_description(&descriptor.sdp).await {
                    warn!(
                        error = %SwarmError::TransportFailure(e.to_string()),
                        remote = %from,
                        "applying answer failed"
                    );
                }
            }
            _ => warn!(error = %SwarmError::HandshakeMismatch(from.clone()), "ignoring answer"),
        }
    }

    async fn handle_candidate(&mut self, message: &Message) {
        let from = &message.from;
        let Ok(payload) = message.data_as::<CandidatePayload>() else {
            warn!(from = %from, "icecandidate without a candidate");
            return;
        };
        match self.state.connections.get(from) {
            Some(conn) => {
                if let Err(e) = conn.transport.add_ice_candidate(&payload.candidate).await {
                    warn!(
                        error = %SwarmError::TransportFailure(e.to_string()),
                        remote = %from,
                        "applying candidate failed"
                    );
                }
            }
            None => {
                // Candidate ahead of its session; buffered until the
                // offer creates one.
                self.state
                    .pending_candidates
                    .entry(from.clone())
                    .or_default()
                    .push(payload.candidate);
            }
        }
    }

    async fn drain_candidates(&mut self, remote: &PeerId) {
        let pending = self
            .state
            .pending_candidates
            .remove(remote)
            .unwrap_or_default();
        if pending.is_empty() {
            return;
        }
        debug!(remote = %remote, count = pending.len(), "draining buffered candidates");
        let Some(conn) = self.state.connections.get(remote) else {
            return;
        };
        for candidate in pending {
            if let Err(e) = conn.transport.add_ice_candidate(&candidate).await {
                warn!(
                    error = %SwarmError::TransportFailure(e.to_string()),
                    remote = %remote,
                    "applying buffered candidate failed"
                );
            }
        }
    }

    async fn handle_first_view(&mut self, message: &Message) {
        let Ok(first) = message.data_as::<FirstView>() else {
            warn!("malformed first-view");
            return;
        };
        debug!(id = %first.id, "rendezvous assigned identity");
        self.state.id = first.id;
        if let Some(gossip) = &self.state.gossip {
            gossip.deliver(message.clone()).await;
        }
    }

    // ------------------------------------------------------------------
    // Weight protocol
    // ------------------------------------------------------------------

    fn handle_weight(&mut self, message: &Message) {
        let Ok(payload) = message.data_as::<WeightPayload>() else {
            warn!(from = %message.from, "malformed weight message");
            return;
        };
        let from = message.from.clone();
        match payload.value {
            WeightVerb::RequestHeavy => {
                let heavy_count = self.heavy_incoming_count();
                let cap = self.state.max_connections;
                let verb = match self.state.connections.get_mut(&from) {
                    Some(conn)
                        if conn.weight.incoming == Weight::Light && heavy_count < cap =>
                    {
                        conn.weight.incoming = Weight::Heavy;
                        WeightVerb::AckHeavy
                    }
                    _ => WeightVerb::NoackHeavy,
                };
                debug!(remote = %from, verb = ?verb, heavy = heavy_count, cap, "heavy admission");
                let reply =
                    self.state
                        .respond_to(message, kind::GOSSIP_WEIGHT, json!(WeightPayload { value: verb }));
                self.state.emit(reply);
            }
            WeightVerb::RequestLight => {
                if let Some(conn) = self.state.connections.get_mut(&from) {
                    conn.weight.incoming = Weight::Light;
                }
                let reply = self.state.respond_to(
                    message,
                    kind::GOSSIP_WEIGHT,
                    json!(WeightPayload {
                        value: WeightVerb::AckLight
                    }),
                );
                self.state.emit(reply);
            }
            WeightVerb::AckHeavy => {
                if let Some(conn) = self.state.connections.get_mut(&from) {
                    conn.weight.outgoing = Weight::Heavy;
                }
            }
            WeightVerb::AckLight => {
                if let Some(conn) = self.state.connections.get_mut(&from) {
                    conn.weight.outgoing = Weight::Light;
                }
            }
            WeightVerb::NoackHeavy | WeightVerb::NoackLight => {
                trace!(remote = %from, verb = ?payload.value, "weight request declined");
            }
        }
    }

    fn heavy_incoming_count(&self) -> usize {
        self.state
            .connections
            .iter()
            .filter(|(id, conn)| id.as_str() != SIGNAL && conn.weight.incoming == Weight::Heavy)
            .count()
    }

    // ------------------------------------------------------------------
    // Cross-task plumbing
    // ------------------------------------------------------------------

    async fn handle_gossip_out(&mut self, message: Message) {
        if message.kind == kind::GOSSIP_VIEW_UPDATE {
            let Ok(update) = message.data_as::<ViewUpdatePayload>() else {
                warn!("malformed view update from gossip task");
                return;
            };
            if let Some(media) = self.state.media.as_mut() {
                media.update_remote_from_view(&update.view);
            }
            self.state.view = update.view;
            self.state.max_connections = update.max_connections;
            return;
        }
        if let Err(e) = self.submit(message, None, None).await {
            debug!(error = %e, "dropping gossip egress");
        }
    }

    async fn handle_media_done(&mut self, done: PipelineDone) {
        let Some(media) = self.state.media.as_mut() else {
            return;
        };
        let progress = media.on_pipeline_done(done);
        if let Some(number) = progress.added {
            trace!(part = number, "part reached the playback buffer");
        }
    }

    async fn request_parts(&mut self, count: usize, chunk_size: usize) -> Vec<(usize, PeerId)> {
        let Some(media) = self.state.media.as_ref() else {
            return Vec::new();
        };
        let picks = media.next_parts_to_download(count);
        for (part, peer) in &picks {
            if self
                .state
                .media
                .as_mut()
                .expect("media present")
                .mark_pending(*part)
                .is_err()
            {
                continue;
            }
            if peer != SOURCE {
                let request = self.state.message_to(
                    kind::MEDIA_REQUEST_PART,
                    peer.clone(),
                    json!(PartRequest {
                        part: *part,
                        chunk_size
                    }),
                );
                if let Err(e) = self.submit(request, None, None).await {
                    warn!(error = %e, "part request failed validation");
                }
            }
        }
        picks
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    fn touch(&mut self, remote: &PeerId) {
        if let Some(conn) = self.state.connections.get_mut(remote) {
            conn.last_activity = Instant::now();
        }
    }

    async fn on_channel_open(&mut self, remote: PeerId) {
        debug!(remote = %remote, "channel open");
        if remote != SIGNAL {
            let connected = Message::new(
                kind::CONNECTED,
                remote.clone(),
                self.state.id.clone(),
                0,
                Value::Null,
            );
            self.dispatch_local(connected).await;
        }

        // Resend everything that was waiting for this destination.
        let queue = std::mem::take(&mut self.state.queue);
        let (matching, rest): (Vec<_>, Vec<_>) =
            queue.into_iter().partition(|q| q.message.to == remote);
        self.state.queue = rest;
        let mut overflow = Vec::new();
        for queued in matching {
            self.process_message(queued, &mut overflow).await;
        }
        self.state.queue.append(&mut overflow);
    }

    async fn maintenance(&mut self) {
        // Expire, then re-route the survivors.
        let now = Instant::now();
        let queue = std::mem::take(&mut self.state.queue);
        let mut survivors = Vec::new();
        for queued in queue {
            if queued.deadline.is_some_and(|deadline| now >= deadline) {
                debug!(kind = %queued.message.kind, to = %queued.message.to, "queued message timed out");
                if let Some(notify) = queued.on_timeout {
                    let _ = notify.send(());
                }
                continue;
            }
            survivors.push(queued);
        }
        let mut fresh = Vec::new();
        for queued in survivors {
            self.process_message(queued, &mut fresh).await;
        }
        self.state.queue = fresh;

        // Close idle channels, purge closed ones.
        let mut idle = Vec::new();
        let mut closed = Vec::new();
        for (remote, conn) in &self.state.connections {
            if remote.as_str() == SIGNAL {
                continue;
            }
            match conn.state {
                ChannelState::Open
                    if conn.last_activity.elapsed() > self.state.config.inactivity_timeout =>
                {
                    idle.push(remote.clone());
                }
                ChannelState::Closed => closed.push(remote.clone()),
                _ => {}
            }
        }
        for remote in idle {
            debug!(remote = %remote, "closing idle channel");
            if let Some(conn) = self.state.connections.get(&remote) {
                conn.transport.close();
            }
        }
        for remote in closed {
            debug!(remote = %remote, "purging closed channel");
            self.state.connections.remove(&remote);
            if let Some(media) = self.state.media.as_mut() {
                media.remove_remote(&remote);
            }
        }
    }
}
