//! # Extensions
//!
//! The router works without any extension; optional behaviors plug in
//! through capability interfaces feature-tested at runtime:
//!
//! - [`HeavyPolicy`] marks bulk message kinds that must pass the
//!   weight-admission gate before using a connection;
//! - [`GossipExtension`] spawns the view-maintenance task and wires
//!   its channels into the router;
//! - [`MediaExtension`] installs the segment manager and the handlers
//!   for the media message family.
//!
//! The registrar is [`PeerBuilder::with_extension`]: each extension
//! receives the peer under construction and installs handlers, state,
//! and policies on it.
//!
//! [`PeerBuilder::with_extension`]: crate::peer::PeerBuilder::with_extension

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use serde_json::json;
use tracing::{debug, warn};

use crate::gossip::{GossipConfig, GossipHandle};
use crate::media::{CompletedPart, MediaManager, PlaybackSink};
use crate::messages::{kind, HavePayload, Message, PartPayload, PartRequest};
use crate::peer::{PeerSetup, PeerState};

/// Marks messages that carry bulk payloads and must be admitted onto a
/// heavy connection before they are sent to a peer.
pub trait HeavyPolicy: Send + Sync {
    fn is_heavy(&self, message: &Message) -> bool;
}

/// A mixin installed on the peer at build time.
pub trait Extension: Send {
    fn install(self: Box<Self>, setup: &mut PeerSetup<'_>);
}

// ============================================================================
// Gossip
// ============================================================================

/// Installs the gossip view-maintenance task.
pub struct GossipExtension {
    pub config: GossipConfig,
}

impl Default for GossipExtension {
    fn default() -> Self {
        Self {
            config: GossipConfig::default(),
        }
    }
}

impl Extension for GossipExtension {
    fn install(self: Box<Self>, setup: &mut PeerSetup<'_>) {
        let (handle, out) = GossipHandle::spawn(self.config);
        setup.install_gossip(handle, out);
    }
}

// ============================================================================
// Media
// ============================================================================

struct MediaHeavyPolicy;

impl HeavyPolicy for MediaHeavyPolicy {
    fn is_heavy(&self, message: &Message) -> bool {
        message.kind == kind::MEDIA_PART
    }
}

/// Installs the segment manager, the media message handlers, and the
/// heavy policy admitting bulk part transfers.
pub struct MediaExtension {
    pub sink: Box<dyn PlaybackSink>,
}

impl MediaExtension {
    pub fn new(sink: Box<dyn PlaybackSink>) -> Self {
        Self { sink }
    }
}

impl Extension for MediaExtension {
    fn install(self: Box<Self>, setup: &mut PeerSetup<'_>) {
        setup.install_media(MediaManager::new(self.sink));
        setup.set_heavy_policy(Arc::new(MediaHeavyPolicy));

        setup.on(kind::MEDIA_REQUEST_INDEX, |state, message| {
            let Some(index) = state.media().and_then(|m| m.index()).cloned() else {
                debug!(from = %message.from, "index requested before we have one");
                return;
            };
            let reply = state.respond_to(message, kind::MEDIA_INDEX, json!(index));
            state.emit(reply);
        });

        setup.on(kind::MEDIA_INDEX, |state, message| {
            let Some(media) = state.media_mut() else {
                return;
            };
            if media.index().is_some() {
                return;
            }
            match message.data_as() {
                Ok(index) => {
                    if let Err(e) = media.set_metadata(index) {
                        warn!(error = %e, "rejecting segment index");
                    }
                }
                Err(e) => warn!(error = %e, from = %message.from, "malformed segment index"),
            }
        });

        setup.on(kind::MEDIA_REQUEST_PART, |state, message| {
            let Ok(request) = message.data_as::<PartRequest>() else {
                warn!(from = %message.from, "malformed part request");
                return;
            };
            let chunks = match state.media() {
                Some(media) if media.peer_has_part(request.part) => {
                    media.chunked_part(request.chunk_size, request.part)
                }
                _ => {
                    debug!(part = request.part, from = %message.from, "part requested but not held");
                    return;
                }
            };
            let Ok(chunks) = chunks else {
                return;
            };
            let total = chunks.len();
            let replies: Vec<Message> = chunks
                .iter()
                .enumerate()
                .map(|(c, chunk)| {
                    let number = if total == 1 {
                        request.part.to_string()
                    } else {
                        format!("{}:{}:{}", request.part, c, total)
                    };
                    state.respond_to(
                        message,
                        kind::MEDIA_PART,
                        json!(PartPayload {
                            number,
                            bytes: B64.encode(chunk),
                        }),
                    )
                })
                .collect();
            for reply in replies {
                state.emit(reply);
            }
        });

        setup.on(kind::MEDIA_PART, |state, message| {
            let Ok(payload) = message.data_as::<PartPayload>() else {
                warn!(from = %message.from, "malformed part payload");
                return;
            };
            let Ok(bytes) = B64.decode(&payload.bytes) else {
                warn!(from = %message.from, number = %payload.number, "part bytes are not base64");
                return;
            };
            let result = match state.media_mut() {
                Some(media) => media.append(&payload.number, bytes),
                None => return,
            };
            match result {
                Ok(Some(completed)) => advertise_completed(state, completed),
                Ok(None) => {}
                Err(e) => warn!(error = %e, from = %message.from, "rejecting part delivery"),
            }
        });

        setup.on(kind::MEDIA_HAVE, |state, message| {
            let Ok(have) = message.data_as::<HavePayload>() else {
                warn!(from = %message.from, "malformed availability advertisement");
                return;
            };
            if let Some(media) = state.media_mut() {
                media.update_remote(message.from.clone(), have.parts);
            }
        });

        // A fresh neighbor learns what we hold, and we solicit the
        // segment index when we have none yet.
        setup.on(kind::CONNECTED, |state, message| {
            let remote = message.from.clone();
            let Some(media) = state.media() else {
                return;
            };
            let parts = media.available_parts();
            let needs_index = media.index().is_none();
            if !parts.is_empty() {
                let have = state.message_to(kind::MEDIA_HAVE, remote.clone(), json!(HavePayload { parts }));
                state.emit(have);
            }
            if needs_index {
                let request =
                    state.message_to(kind::MEDIA_REQUEST_INDEX, remote, serde_json::Value::Null);
                state.emit(request);
            }
        });
    }
}

/// After a part finishes reassembly: sample the download bandwidth
/// into gossip, refresh our descriptor, and advertise the new part to
/// open neighbors.
pub(crate) fn advertise_completed(state: &mut PeerState, completed: CompletedPart) {
    let id = state.id().clone();
    if id.is_empty() {
        return;
    }

    if let Some(elapsed) = completed.elapsed {
        let secs = elapsed.as_secs_f64();
        if secs > 0.0 {
            let sample = completed.len as f64 / secs;
            state.emit(Message::new(
                kind::GOSSIP_BANDWIDTH,
                id.clone(),
                id.clone(),
                0,
                json!(sample),
            ));
        }
    }

    let parts = match state.media() {
        Some(media) => media.available_parts(),
        None => return,
    };
    state.emit(Message::new(
        kind::GOSSIP_DESCRIPTOR_UPDATE,
        id.clone(),
        id.clone(),
        0,
        json!({"path": ["media", "parts"], "value": parts}),
    ));

    for neighbor in state.open_neighbors() {
        let have = state.message_to(
            kind::MEDIA_HAVE,
            neighbor,
            json!(HavePayload {
                parts: parts.clone()
            }),
        );
        state.emit(have);
    }
}
