//! # Swarmcast - Peer-to-Peer Media Distribution Overlay
//!
//! Swarmcast is the core of a cooperative media swarm: a mesh of
//! end-user nodes that fetch, store, and replay a segmented video file
//! together. Nodes keep a handful of datagram channels to other nodes,
//! bootstrap through a central rendezvous service, and exchange both
//! control traffic (session handshakes, gossip) and bulk media parts
//! peer to peer.
//!
//! ## Architecture
//!
//! The codebase uses the actor pattern for concurrent state: each
//! stateful engine has a cheap-to-clone handle and a private task that
//! owns all mutable state and processes commands sequentially.
//!
//! - The **peer task** owns the connection table, the buffered
//!   candidates of not-yet-existing sessions, and the outbound queue;
//!   it makes every routing decision.
//! - The **gossip task** owns the bounded random view of the network
//!   and derives the heavy-admission cap; it talks to the peer task
//!   only through channels.
//! - The **playback task** drains the ordered append chain one buffer
//!   at a time.
//!
//! Transports are capabilities: the overlay never touches a socket.
//! Production embeds supply a WebRTC-like [`transport::PeerTransport`]
//! and a [`signal::RendezvousChannel`]; in-memory doubles of both ship
//! here for tests and demos.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `peer` | Router: connection table, queue, handshakes, maintenance |
//! | `gossip` | Bounded random view, shuffle exchange, admission cap |
//! | `media` | Segment index, part reassembly, ordered playback appends |
//! | `messages` | Wire records and typed payloads |
//! | `transport` | Peer channel capabilities + in-memory double |
//! | `signal` | Rendezvous client, framing, keepalive |
//! | `origin` | Byte-range fetch from the origin HTTP server |
//! | `extensions` | Registrar for the gossip and media mixins |
//! | `emitter` | Per-kind handler bus |
//! | `util` | Structural match, shuffle, mean, stable sort |

pub mod emitter;
pub mod errors;
pub mod extensions;
pub mod gossip;
pub mod media;
pub mod messages;
pub mod origin;
pub mod peer;
pub mod signal;
pub mod transport;
pub mod util;

pub use errors::SwarmError;
pub use extensions::{Extension, GossipExtension, HeavyPolicy, MediaExtension};
pub use gossip::{GossipConfig, GossipHandle};
pub use media::{
    ByteRange, Cluster, MediaManager, MemorySink, PartStatus, PlaybackSink, SegmentIndex,
    DEFAULT_CHUNK_SIZE,
};
pub use messages::{kind, Message, NodeDescriptor, PeerId, ANY_PEER, DEFAULT_TTL, SIGNAL, SOURCE};
pub use origin::OriginClient;
pub use peer::{
    ConnectionWeight, PeerBuilder, PeerConfig, PeerHandle, PeerSnapshot, Weight,
};
pub use signal::{MemorySignalServer, RendezvousChannel, RendezvousConnector, SignalClient};
pub use transport::{ChannelState, MemoryHub, PeerTransport, TransportFactory};
