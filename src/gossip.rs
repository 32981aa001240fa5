//! # Gossip Engine
//!
//! Maintains a bounded random sample of the network (the view) and
//! periodically shuffles slices of it with a random neighbor. The
//! engine runs on its own task so view computation never blocks the
//! router; the two sides talk exclusively through channels:
//!
//! - the peer task forwards `first-view` and `gossip:*` control
//!   messages in;
//! - the engine emits outbound [`Message`] records, and
//!   `gossip:view-update` snapshots that replace the peer task's
//!   cached view and heavy-admission cap.
//!
//! The engine also aggregates download bandwidth samples into the
//! node's own descriptor; the mean feeds the admission cap:
//! `ceil(ln(|view| + 1))`, scaled by `self_bw / view_bw` when both
//! sides advertise bandwidth.

use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::messages::{
    kind, DescriptorPatch, FirstView, Message, NodeDescriptor, ViewExchange,
    ViewUpdatePayload, DEFAULT_TTL,
};
use crate::util::{mean, shallow_sort, shuffled};

/// Upper bound on the number of descriptors kept in the view.
pub const DEFAULT_VIEW_SIZE: usize = 20;

/// Descriptors sent per shuffle exchange.
pub const DEFAULT_SHUFFLE_SIZE: usize = 8;

/// Cadence of shuffle rounds.
pub const DEFAULT_GOSSIP_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct GossipConfig {
    pub view_size: usize,
    pub shuffle_size: usize,
    pub interval: Duration,
    /// Hop budget stamped on outbound exchange messages.
    pub ttl: u32,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            view_size: DEFAULT_VIEW_SIZE,
            shuffle_size: DEFAULT_SHUFFLE_SIZE,
            interval: DEFAULT_GOSSIP_INTERVAL,
            ttl: DEFAULT_TTL,
        }
    }
}

enum Command {
    Deliver(Message),
    Snapshot(oneshot::Sender<Vec<NodeDescriptor>>),
    Quit,
}

/// Cheap handle to the gossip task.
#[derive(Clone)]
pub struct GossipHandle {
    cmd_tx: mpsc::Sender<Command>,
}

impl GossipHandle {
    /// Spawn the engine. Returns the handle and the stream of messages
    /// the engine emits toward the peer task.
    pub fn spawn(config: GossipConfig) -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let actor = GossipActor {
            config,
            self_descriptor: NodeDescriptor::new(""),
            view: Vec::new(),
            bandwidths: Vec::new(),
            out_tx,
        };
        tokio::spawn(actor.run(cmd_rx));
        (Self { cmd_tx }, out_rx)
    }

    /// Hand a gossip control message to the engine.
    pub async fn deliver(&self, message: Message) {
        if self.cmd_tx.send(Command::Deliver(message)).await.is_err() {
            warn!("gossip task is gone, dropping message");
        }
    }

    pub async fn snapshot(&self) -> Vec<NodeDescriptor> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Snapshot(tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }
}

struct GossipActor {
    config: GossipConfig,
    self_descriptor: NodeDescriptor,
    view: Vec<NodeDescriptor>,
    bandwidths: Vec<f64>,
    out_tx: mpsc::UnboundedSender<Message>,
}

impl GossipActor {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.tick().await; // first tick fires immediately; skip it
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Deliver(message)) => self.handle_message(message),
                    Some(Command::Snapshot(reply)) => {
                        let _ = reply.send(self.view.clone());
                    }
                    Some(Command::Quit) | None => {
                        debug!("gossip task quitting");
                        break;
                    }
                },
                _ = ticker.tick() => self.shuffle_round(),
            }
        }
    }

    fn handle_message(&mut self, message: Message) {
        match message.kind.as_str() {
            kind::FIRST_VIEW => match message.data_as::<FirstView>() {
                Ok(first) => {
                    debug!(id = %first.id, seeded = first.view.len(), "adopting rendezvous identity");
                    self.self_descriptor.id = first.id;
                    self.merge(first.view);
                }
                Err(e) => warn!(error = %e, "bad first-view payload"),
            },
            kind::GOSSIP_REQUEST_EXCHANGE => match message.data_as::<ViewExchange>() {
                Ok(exchange) => {
                    let reply = self.reply(
                        &message,
                        kind::GOSSIP_ANSWER_REQUEST,
                        serde_json::to_value(ViewExchange { view: self.slice() })
                            .expect("view serializes"),
                    );
                    let _ = self.out_tx.send(reply);
                    self.merge(exchange.view);
                }
                Err(e) => warn!(error = %e, "bad exchange payload"),
            },
            kind::GOSSIP_ANSWER_REQUEST => match message.data_as::<ViewExchange>() {
                Ok(exchange) => self.merge(exchange.view),
                Err(e) => warn!(error = %e, "bad exchange payload"),
            },
            kind::GOSSIP_DESCRIPTOR_UPDATE => match message.data_as::<DescriptorPatch>() {
                Ok(patch) => {
                    apply_patch(&mut self.self_descriptor, &patch.path, patch.value);
                    self.publish();
                }
                Err(e) => warn!(error = %e, "bad descriptor patch"),
            },
            kind::GOSSIP_BANDWIDTH => match message.data.as_f64() {
                Some(sample) => {
                    self.bandwidths.push(sample);
                    let bandwidth = mean(&self.bandwidths);
                    apply_patch(
                        &mut self.self_descriptor,
                        &["media".to_string(), "bandwidth".to_string()],
                        Value::from(bandwidth),
                    );
                    self.publish();
                }
                None => warn!("bandwidth sample is not a number"),
            },
            other => trace!(kind = %other, "gossip task ignoring message"),
        }
    }

    /// One shuffle: age the view, pick a random neighbor, offer it a
    /// slice.
    fn shuffle_round(&mut self) {
        if self.self_descriptor.id.is_empty() || self.view.is_empty() {
            return;
        }
        for descriptor in &mut self.view {
            descriptor.age = descriptor.age.saturating_add(1);
        }
        let target = shuffled(&self.view)[0].id.clone();
        let request = Message::new(
            kind::GOSSIP_REQUEST_EXCHANGE,
            self.self_descriptor.id.clone(),
            target,
            self.config.ttl,
            serde_json::to_value(ViewExchange { view: self.slice() }).expect("view serializes"),
        );
        let _ = self.out_tx.send(request);
        self.publish();
    }

    /// The slice offered in an exchange: a random sample of the view
    /// plus a fresh self-descriptor.
    fn slice(&self) -> Vec<NodeDescriptor> {
        let mut slice = shuffled(&self.view);
        slice.truncate(self.config.shuffle_size.saturating_sub(1));
        let mut own = self.self_descriptor.clone();
        own.age = 0;
        slice.push(own);
        slice
    }

    /// Fold incoming descriptors into the view: drop self, keep the
    /// younger copy of duplicates, bound by view size preferring young
    /// entries.
    fn merge(&mut self, incoming: Vec<NodeDescriptor>) {
        for descriptor in incoming {
            if descriptor.id.is_empty() || descriptor.id == self.self_descriptor.id {
                continue;
            }
            match self.view.iter_mut().find(|d| d.id == descriptor.id) {
                Some(known) => {
                    if descriptor.age < known.age {
                        *known = descriptor;
                    }
                }
                None => self.view.push(descriptor),
            }
        }
        if self.view.len() > self.config.view_size {
            self.view = shallow_sort(|a: &NodeDescriptor, b: &NodeDescriptor| a.age < b.age, &self.view);
            self.view.truncate(self.config.view_size);
        }
        self.publish();
    }

    /// Heavy-admission cap derived from view size and relative
    /// bandwidth.
    fn max_connections(&self) -> usize {
        let base = ((self.view.len() + 1) as f64).ln().ceil();
        let neighbor_bw: Vec<f64> = self.view.iter().filter_map(|d| d.bandwidth()).collect();
        let value = if neighbor_bw.is_empty() || self.bandwidths.is_empty() {
            base
        } else {
            base * mean(&self.bandwidths) / mean(&neighbor_bw)
        };
        value.ceil().max(0.0) as usize
    }

    /// Snapshot the view back across the channel boundary.
    fn publish(&self) {
        let update = Message::new(
            kind::GOSSIP_VIEW_UPDATE,
            self.self_descriptor.id.clone(),
            self.self_descriptor.id.clone(),
            0,
            serde_json::to_value(ViewUpdatePayload {
                view: self.view.clone(),
                max_connections: self.max_connections(),
            })
            .expect("view serializes"),
        );
        let _ = self.out_tx.send(update);
    }

    fn reply(&self, original: &Message, kind: &str, data: Value) -> Message {
        let mut reply = Message::new(
            kind,
            self.self_descriptor.id.clone(),
            original.from.clone(),
            self.config.ttl,
            data,
        );
        reply.route = original.forward_by.clone();
        reply
    }
}

/// Apply a path-addressed patch to a descriptor, creating intermediate
/// objects as needed.
fn apply_patch(descriptor: &mut NodeDescriptor, path: &[String], value: Value) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };
    let mut root = serde_json::to_value(&*descriptor).expect("descriptor serializes");
    {
        let mut cursor = &mut root;
        for key in parents {
            if !cursor.is_object() {
                *cursor = Value::Object(Default::default());
            }
            cursor = cursor
                .as_object_mut()
                .expect("cursor is an object")
                .entry(key.clone())
                .or_insert(Value::Null);
        }
        if !cursor.is_object() {
            *cursor = Value::Object(Default::default());
        }
        cursor
            .as_object_mut()
            .expect("cursor is an object")
            .insert(last.clone(), value);
    }
    match serde_json::from_value(root) {
        Ok(updated) => *descriptor = updated,
        Err(e) => warn!(error = %e, "descriptor patch produced an invalid descriptor"),
    }
}
