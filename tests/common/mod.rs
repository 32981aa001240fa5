//! Shared harness for the integration suites: an in-process network
//! (transport hub + rendezvous), spawn helpers, and a scripted peer
//! that speaks the wire protocol directly so tests can observe and
//! forge raw traffic.

// Each suite uses a different subset of the harness.
#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use swarmcast::messages::{kind, SessionDescriptor};
use swarmcast::peer::PeerBuilder;
use swarmcast::transport::{EventSender, TransportEvent, TransportPayload};
use swarmcast::{
    ChannelState, Extension, MemoryHub, MemorySignalServer, Message, PeerConfig, PeerHandle,
    PeerId, PeerTransport, SignalClient, TransportFactory,
};

/// One in-process network: a transport hub plus a rendezvous service.
pub struct Net {
    pub hub: MemoryHub,
    pub server: MemorySignalServer,
}

impl Net {
    pub fn new() -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
        Self {
            hub: MemoryHub::new(),
            server: MemorySignalServer::new(),
        }
    }

    /// Spawn a full peer with fast maintenance ticks.
    pub fn spawn_peer(&self, id: &str, extensions: Vec<Box<dyn Extension>>) -> PeerHandle {
        let mut builder = PeerBuilder::new(
            Arc::new(self.hub.factory()),
            Arc::new(self.server.connector(id)),
        )
        .with_config(fast_config());
        for extension in extensions {
            builder = builder.with_extension(extension);
        }
        builder.spawn()
    }
}

pub fn fast_config() -> PeerConfig {
    PeerConfig {
        queue_timeout: Duration::from_millis(50),
        ..PeerConfig::default()
    }
}

/// Poll `probe` until it holds or the suite-level deadline expires.
pub async fn wait_until<Fut>(mut probe: impl FnMut() -> Fut) -> bool
where
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..250 {
        if probe().await {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    false
}

/// Block until the peer has its rendezvous-assigned identity.
pub async fn wait_for_identity(handle: &PeerHandle, id: &str) {
    let ok = wait_until(|| {
        let handle = handle.clone();
        let id = id.to_string();
        async move { handle.snapshot().await.id == id }
    })
    .await;
    assert!(ok, "peer never received identity {id}");
}

/// Block until two full peers share an open channel.
pub async fn wait_for_channel(a: &PeerHandle, b_id: &str) {
    let ok = wait_until(|| {
        let a = a.clone();
        let b_id = b_id.to_string();
        async move {
            a.snapshot()
                .await
                .connection(&b_id)
                .is_some_and(|c| c.state == ChannelState::Open)
        }
    })
    .await;
    assert!(ok, "channel to {b_id} never opened");
}

/// A test-driven node speaking the wire protocol by hand: it holds a
/// bare rendezvous client and raw transport endpoints, so tests can
/// send forged messages and observe exactly what arrives.
pub struct ScriptedPeer {
    pub id: PeerId,
    events_rx: mpsc::UnboundedReceiver<TransportEvent>,
    events_tx: EventSender,
    signal: SignalClient,
    hub: MemoryHub,
    transports: std::collections::HashMap<PeerId, Box<dyn PeerTransport>>,
    inbound: VecDeque<(PeerId, Message)>,
    open: HashSet<PeerId>,
}

impl ScriptedPeer {
    pub fn connect(net: &Net, id: &str) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let signal = {
            use swarmcast::RendezvousConnector;
            net.server.connector(id).connect(events_tx.clone())
        };
        Self {
            id: id.to_string(),
            events_rx,
            events_tx,
            signal,
            hub: net.hub.clone(),
            transports: std::collections::HashMap::new(),
            inbound: VecDeque::new(),
            open: HashSet::new(),
        }
    }

    /// A handshake-ready message with explicit trail fields.
    pub fn message(
        &self,
        message_kind: &str,
        from: &str,
        to: &str,
        ttl: u32,
        data: serde_json::Value,
    ) -> Message {
        Message::new(message_kind, from, to, ttl, data)
    }

    pub async fn send_via_signal(&self, message: &Message) {
        self.signal
            .send(message)
            .await
            .expect("scripted signal send");
    }

    pub async fn send_to(&self, remote: &str, message: &Message) {
        self.transports
            .get(remote)
            .expect("no transport to remote")
            .send(message)
            .await
            .expect("scripted transport send");
    }

    /// Establish a real channel with a full peer by driving our side
    /// of the handshake through the rendezvous.
    pub async fn establish_with(&mut self, target: &str) {
        self.request_session(target).await;
        self.complete_session(target).await;
    }

    /// First half of the handshake: solicit an offer. Several scripted
    /// peers must all request before any of them answers, or the
    /// target's offers stop falling back to the rendezvous once its
    /// first channel opens.
    pub async fn request_session(&mut self, target: &str) {
        let id = self.id.clone();
        let request = self.message(kind::REQUEST_PEER, &id, target, 3, serde_json::Value::Null);
        self.send_via_signal(&request).await;
    }

    /// Second half: take the offer, answer it, wait for the channel.
    pub async fn complete_session(&mut self, target: &str) {
        let (_, offer) = self.recv_kind(kind::OFFER).await;
        let descriptor: SessionDescriptor = offer.data_as().expect("offer descriptor");

        let transport =
            self.hub
                .factory()
                .create(&self.id, &target.to_string(), self.events_tx.clone());
        let answer = transport
            .create_answer(&descriptor.sdp)
            .await
            .expect("answer");
        self.transports.insert(target.to_string(), transport);

        let id = self.id.clone();
        let reply = self.message(
            kind::ANSWER,
            &id,
            target,
            3,
            serde_json::json!(SessionDescriptor { sdp: answer }),
        );
        self.send_via_signal(&reply).await;
        self.wait_open(target).await;
    }

    pub async fn wait_open(&mut self, remote: &str) {
        if self.open.contains(remote) {
            return;
        }
        let deadline = Duration::from_secs(5);
        timeout(deadline, async {
            loop {
                self.pump_one().await;
                if self.open.contains(remote) {
                    return;
                }
            }
        })
        .await
        .expect("channel never opened");
    }

    /// Next inbound message of the given kind, buffering the rest.
    pub async fn recv_kind(&mut self, want: &str) -> (PeerId, Message) {
        if let Some(pos) = self.inbound.iter().position(|(_, m)| m.kind == want) {
            return self.inbound.remove(pos).expect("position valid");
        }
        timeout(Duration::from_secs(5), async {
            loop {
                self.pump_one().await;
                if let Some(pos) = self.inbound.iter().position(|(_, m)| m.kind == want) {
                    return self.inbound.remove(pos).expect("position valid");
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("no {want} message arrived"))
    }

    /// True when a message of this kind arrives within `window`;
    /// buffers everything else.
    pub async fn sees_kind_within(&mut self, want: &str, window: Duration) -> bool {
        if self.inbound.iter().any(|(_, m)| m.kind == want) {
            return true;
        }
        timeout(window, async {
            loop {
                self.pump_one().await;
                if self.inbound.iter().any(|(_, m)| m.kind == want) {
                    return;
                }
            }
        })
        .await
        .is_ok()
    }

    async fn pump_one(&mut self) {
        match self.events_rx.recv().await {
            Some(TransportEvent { remote, payload }) => match payload {
                TransportPayload::Inbound(message) => self.inbound.push_back((remote, message)),
                TransportPayload::State(ChannelState::Open) => {
                    self.open.insert(remote);
                }
                TransportPayload::State(_) => {
                    self.open.remove(&remote);
                }
                TransportPayload::Keepalive => {}
            },
            None => panic!("scripted peer event stream ended"),
        }
    }
}
