//! # Media Manager
//!
//! Owns the segment index of the distributed file, the per-part
//! reassembly state, and the ordered append pipeline feeding the
//! playback sink.
//!
//! ## Part lifecycle
//!
//! | Status | Meaning |
//! |--------|---------|
//! | `Needed` | Not yet requested from anyone |
//! | `Pending` | Requested; chunks may be arriving |
//! | `Available` | Fully reassembled in memory |
//! | `Added` | Appended to the playback buffer |
//!
//! Transitions are strictly forward; an `append` against a part that
//! is not pending fails with [`SwarmError::UnexpectedPart`].
//!
//! ## Append ordering
//!
//! The playback buffer accepts one append at a time. The manager keeps
//! an explicit chain of pending jobs and submits the next only after
//! the previous completed. The file head must reach the buffer before
//! any numbered part, so part buffers are parked aside until the head
//! has been scheduled; parts can finish reassembly in any order
//! without racing it. Content digests, when the index carries them,
//! are verified off the hot path and a mismatch is logged, never
//! fatal.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::errors::SwarmError;
use crate::messages::{PeerId, SOURCE};
use crate::util::shuffled;

/// Chunk payload ceiling, sized for datagram transports with headroom
/// for framing overhead.
pub const DEFAULT_CHUNK_SIZE: usize = 12 * 1024;

/// Segment index produced by the container demuxer. Immutable once
/// set.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SegmentIndex {
    pub total_size: u64,
    pub duration: f64,
    pub codec: String,
    pub clusters: Vec<Cluster>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Cluster {
    pub offset: u64,
    pub timecode: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartStatus {
    Needed,
    Pending,
    Available,
    Added,
}

struct Part {
    status: PartStatus,
    buffer: Option<Bytes>,
    chunks: Vec<Option<Vec<u8>>>,
    expected_chunks: Option<usize>,
    requested_at: Option<Instant>,
}

impl Part {
    fn new() -> Self {
        Self {
            status: PartStatus::Needed,
            buffer: None,
            chunks: Vec::new(),
            expected_chunks: None,
            requested_at: None,
        }
    }
}

/// Inclusive byte range within the media file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ByteRange {
    pub lo: u64,
    pub hi: u64,
}

impl ByteRange {
    /// The `Range` header value for an origin fetch.
    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.lo, self.hi)
    }
}

/// A part that just finished reassembly; carries what the caller needs
/// to advertise it and to sample download bandwidth.
#[derive(Clone, Copy, Debug)]
pub struct CompletedPart {
    pub number: usize,
    pub len: usize,
    pub elapsed: Option<Duration>,
}

/// Progress reported when a pipeline job completes.
#[derive(Clone, Copy, Debug, Default)]
pub struct MediaProgress {
    /// Part whose buffer just reached the playback sink.
    pub added: Option<usize>,
    /// End-of-stream was signalled to the sink.
    pub finished: bool,
}

// ============================================================================
// Playback pipeline
// ============================================================================

/// The sink consuming decoded segments, supplied by the embedding
/// harness.
#[async_trait]
pub trait PlaybackSink: Send + 'static {
    async fn open(&mut self, codec: &str) -> Result<()>;
    async fn append(&mut self, bytes: Bytes) -> Result<()>;
    async fn end_of_stream(&mut self) -> Result<()>;
}

#[derive(Debug)]
enum PipelineJob {
    Open(String),
    Append { part: Option<usize>, bytes: Bytes },
    EndOfStream,
}

/// Completion of one pipeline job, reported back to the owning task.
#[derive(Debug)]
pub enum PipelineDone {
    Opened,
    Appended(Option<usize>),
    Ended,
}

fn spawn_pipeline(
    mut sink: Box<dyn PlaybackSink>,
) -> (
    mpsc::UnboundedSender<PipelineJob>,
    mpsc::UnboundedReceiver<PipelineDone>,
) {
    let (job_tx, mut job_rx) = mpsc::unbounded_channel::<PipelineJob>();
    let (done_tx, done_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Some(job) = job_rx.recv().await {
            let done = match job {
                PipelineJob::Open(codec) => {
                    if let Err(e) = sink.open(&codec).await {
                        warn!(error = %e, "playback source failed to open");
                    }
                    PipelineDone::Opened
                }
                PipelineJob::Append { part, bytes } => {
                    if let Err(e) = sink.append(bytes).await {
                        warn!(part = ?part, error = %e, "playback append failed");
                    }
                    PipelineDone::Appended(part)
                }
                PipelineJob::EndOfStream => {
                    if let Err(e) = sink.end_of_stream().await {
                        warn!(error = %e, "end-of-stream signal failed");
                    }
                    PipelineDone::Ended
                }
            };
            if done_tx.send(done).is_err() {
                break;
            }
        }
    });

    (job_tx, done_rx)
}

// ============================================================================
// Manager
// ============================================================================

pub struct MediaManager {
    index: Option<SegmentIndex>,
    parts: Vec<Part>,
    remote: HashMap<PeerId, HashSet<usize>>,
    chain: VecDeque<PipelineJob>,
    /// Part buffers held back until the head has been scheduled.
    deferred: VecDeque<PipelineJob>,
    head_submitted: bool,
    in_flight: bool,
    job_tx: mpsc::UnboundedSender<PipelineJob>,
    done_rx: Option<mpsc::UnboundedReceiver<PipelineDone>>,
    eos_queued: bool,
}

impl MediaManager {
    pub fn new(sink: Box<dyn PlaybackSink>) -> Self {
        let (job_tx, done_rx) = spawn_pipeline(sink);
        Self {
            index: None,
            parts: Vec::new(),
            remote: HashMap::new(),
            chain: VecDeque::new(),
            deferred: VecDeque::new(),
            head_submitted: false,
            in_flight: false,
            job_tx,
            done_rx: Some(done_rx),
            eos_queued: false,
        }
    }

    /// The pipeline completion stream; taken once by the owning task.
    pub fn take_done_events(&mut self) -> Option<mpsc::UnboundedReceiver<PipelineDone>> {
        self.done_rx.take()
    }

    pub fn index(&self) -> Option<&SegmentIndex> {
        self.index.as_ref()
    }

    /// Adopt the segment index and open the playback source for its
    /// codec. One part slot per cluster, all needed.
    pub fn set_metadata(&mut self, index: SegmentIndex) -> Result<()> {
        if self.index.is_some() {
            anyhow::bail!("segment index already set");
        }
        self.parts = index.clusters.iter().map(|_| Part::new()).collect();
        self.submit(PipelineJob::Open(index.codec.clone()));
        self.index = Some(index);
        Ok(())
    }

    /// Byte range of cluster `i`, up to the next cluster or the end of
    /// the file.
    pub fn range_of_part(&self, i: usize) -> Result<ByteRange> {
        let index = self
            .index
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("no segment index"))?;
        let cluster = index
            .clusters
            .get(i)
            .ok_or_else(|| anyhow::anyhow!("no cluster {i}"))?;
        let hi = match index.clusters.get(i + 1) {
            Some(next) => next.offset - 1,
            None => index.total_size - 1,
        };
        Ok(ByteRange {
            lo: cluster.offset,
            hi,
        })
    }

    /// Byte range of the file head: everything before the first
    /// cluster.
    pub fn range_of_head(&self) -> Result<ByteRange> {
        let index = self
            .index
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("no segment index"))?;
        let first = index
            .clusters
            .first()
            .ok_or_else(|| anyhow::anyhow!("empty segment index"))?;
        Ok(ByteRange {
            lo: 0,
            hi: first.offset - 1,
        })
    }

    /// Schedule the head bytes as the first buffer in the append
    /// chain and release any part buffers parked behind it.
    pub fn append_head(&mut self, bytes: Vec<u8>) {
        self.head_submitted = true;
        self.chain.push_front(PipelineJob::Append {
            part: None,
            bytes: Bytes::from(bytes),
        });
        while let Some(job) = self.deferred.pop_front() {
            self.chain.push_back(job);
        }
        self.pump();
    }

    /// Mark a needed part as requested.
    pub fn mark_pending(&mut self, number: usize) -> Result<(), SwarmError> {
        let part = self.part_mut(number)?;
        if part.status != PartStatus::Needed {
            return Err(SwarmError::UnexpectedPart {
                number,
                status: part.status,
            });
        }
        part.status = PartStatus::Pending;
        part.requested_at = Some(Instant::now());
        Ok(())
    }

    /// Accept incoming bytes for a part. `number` is `"p"` for a whole
    /// part or `"p:c:n"` for chunk `c` of `n`. When the part completes
    /// it moves to available and its buffer enters the append chain;
    /// returns the completion record in that case.
    pub fn append(
        &mut self,
        number: &str,
        bytes: Vec<u8>,
    ) -> Result<Option<CompletedPart>, SwarmError> {
        let (p, chunk) = parse_part_number(number).ok_or(SwarmError::InvalidMessage("number"))?;
        let part = self.part_mut(p)?;
        if part.status != PartStatus::Pending {
            return Err(SwarmError::UnexpectedPart {
                number: p,
                status: part.status,
            });
        }

        let buffer = match chunk {
            None => Bytes::from(bytes),
            Some((c, n)) => {
                match part.expected_chunks {
                    None => {
                        part.expected_chunks = Some(n);
                        part.chunks = (0..n).map(|_| None).collect();
                    }
                    Some(expected) if expected != n => {
                        return Err(SwarmError::InvalidMessage("number"));
                    }
                    Some(_) => {}
                }
                if c >= n {
                    return Err(SwarmError::InvalidMessage("number"));
                }
                part.chunks[c] = Some(bytes);
                if part.chunks.iter().any(Option::is_none) {
                    return Ok(None);
                }
                let mut whole = Vec::new();
                for slot in part.chunks.drain(..) {
                    whole.extend_from_slice(&slot.expect("all chunks present"));
                }
                Bytes::from(whole)
            }
        };

        Ok(Some(self.complete_part(p, buffer)))
    }

    fn complete_part(&mut self, number: usize, buffer: Bytes) -> CompletedPart {
        let elapsed = {
            let part = &mut self.parts[number];
            part.status = PartStatus::Available;
            part.buffer = Some(buffer.clone());
            part.requested_at.map(|t| t.elapsed())
        };

        if let Some(expected) = self
            .index
            .as_ref()
            .and_then(|i| i.clusters[number].sha256.clone())
        {
            verify_digest(number, expected, buffer.clone());
        }

        let job = PipelineJob::Append {
            part: Some(number),
            bytes: buffer.clone(),
        };
        if self.head_submitted {
            self.submit(job);
        } else {
            self.deferred.push_back(job);
        }

        CompletedPart {
            number,
            len: buffer.len(),
            elapsed,
        }
    }

    /// Advance the append chain after a pipeline job completed.
    pub fn on_pipeline_done(&mut self, done: PipelineDone) -> MediaProgress {
        self.in_flight = false;
        let mut progress = MediaProgress::default();
        match done {
            PipelineDone::Opened => {}
            PipelineDone::Appended(Some(number)) => {
                self.parts[number].status = PartStatus::Added;
                progress.added = Some(number);
                let all_added = !self.parts.is_empty()
                    && self.parts.iter().all(|p| p.status == PartStatus::Added);
                if all_added && !self.eos_queued {
                    self.eos_queued = true;
                    self.chain.push_back(PipelineJob::EndOfStream);
                }
            }
            PipelineDone::Appended(None) => {}
            PipelineDone::Ended => {
                debug!("playback source reached end of stream");
                progress.finished = true;
            }
        }
        self.pump();
        progress
    }

    /// The first `k` needed parts in index order, each paired with a
    /// random peer advertising it, or the origin sentinel when nobody
    /// does.
    pub fn next_parts_to_download(&self, k: usize) -> Vec<(usize, PeerId)> {
        let peers: Vec<PeerId> = self.remote.keys().cloned().collect();
        self.parts
            .iter()
            .enumerate()
            .filter(|(_, part)| part.status == PartStatus::Needed)
            .take(k)
            .map(|(number, _)| {
                let pick = shuffled(&peers)
                    .into_iter()
                    .find(|peer| self.remote_has_part(peer, number));
                (number, pick.unwrap_or_else(|| SOURCE.to_string()))
            })
            .collect()
    }

    /// Split an assembled part into transport-sized chunks.
    pub fn chunked_part(&self, chunk_size: usize, number: usize) -> Result<Vec<Bytes>, SwarmError> {
        let part = self.part_ref(number)?;
        let buffer = match (&part.status, &part.buffer) {
            (PartStatus::Available | PartStatus::Added, Some(buffer)) => buffer,
            _ => {
                return Err(SwarmError::UnexpectedPart {
                    number,
                    status: part.status,
                });
            }
        };
        let chunk_size = chunk_size.max(1);
        let mut chunks = Vec::with_capacity(buffer.len().div_ceil(chunk_size));
        let mut offset = 0;
        while offset < buffer.len() {
            let end = (offset + chunk_size).min(buffer.len());
            chunks.push(buffer.slice(offset..end));
            offset = end;
        }
        Ok(chunks)
    }

    pub fn peer_has_part(&self, number: usize) -> bool {
        self.parts
            .get(number)
            .is_some_and(|p| matches!(p.status, PartStatus::Available | PartStatus::Added))
    }

    pub fn remote_has_part(&self, remote: &PeerId, number: usize) -> bool {
        self.remote
            .get(remote)
            .is_some_and(|parts| parts.contains(&number))
    }

    /// Replace what a remote advertises.
    pub fn update_remote(&mut self, remote: PeerId, parts: Vec<usize>) {
        self.remote.insert(remote, parts.into_iter().collect());
    }

    /// Fold part advertisements out of gossip descriptors.
    pub fn update_remote_from_view(&mut self, view: &[crate::messages::NodeDescriptor]) {
        for descriptor in view {
            if let Some(parts) = descriptor.parts() {
                self.update_remote(descriptor.id.clone(), parts);
            }
        }
    }

    pub fn remove_remote(&mut self, remote: &PeerId) {
        self.remote.remove(remote);
    }

    /// Advertised availability per remote, sorted for stable output.
    pub fn remote_availability(&self) -> Vec<(PeerId, Vec<usize>)> {
        let mut entries: Vec<(PeerId, Vec<usize>)> = self
            .remote
            .iter()
            .map(|(remote, parts)| {
                let mut parts: Vec<usize> = parts.iter().copied().collect();
                parts.sort_unstable();
                (remote.clone(), parts)
            })
            .collect();
        entries.sort();
        entries
    }

    /// Parts this node can serve.
    pub fn available_parts(&self) -> Vec<usize> {
        self.parts
            .iter()
            .enumerate()
            .filter(|(_, p)| matches!(p.status, PartStatus::Available | PartStatus::Added))
            .map(|(n, _)| n)
            .collect()
    }

    pub fn part_statuses(&self) -> Vec<PartStatus> {
        self.parts.iter().map(|p| p.status).collect()
    }

    fn part_ref(&self, number: usize) -> Result<&Part, SwarmError> {
        self.parts
            .get(number)
            .ok_or(SwarmError::InvalidMessage("number"))
    }

    fn part_mut(&mut self, number: usize) -> Result<&mut Part, SwarmError> {
        self.parts
            .get_mut(number)
            .ok_or(SwarmError::InvalidMessage("number"))
    }

    fn submit(&mut self, job: PipelineJob) {
        self.chain.push_back(job);
        self.pump();
    }

    fn pump(&mut self) {
        if self.in_flight {
            return;
        }
        if let Some(job) = self.chain.pop_front() {
            self.in_flight = true;
            let _ = self.job_tx.send(job);
        }
    }
}

fn parse_part_number(s: &str) -> Option<(usize, Option<(usize, usize)>)> {
    let mut fields = s.split(':');
    let p = fields.next()?.parse().ok()?;
    match fields.next() {
        None => Some((p, None)),
        Some(c) => {
            let c = c.parse().ok()?;
            let n: usize = fields.next()?.parse().ok()?;
            if fields.next().is_some() || n == 0 {
                return None;
            }
            Some((p, Some((c, n))))
        }
    }
}

fn verify_digest(number: usize, expected: String, buffer: Bytes) {
    tokio::spawn(async move {
        let computed = hex::encode(Sha256::digest(&buffer));
        if !computed.eq_ignore_ascii_case(&expected) {
            warn!(
                error = %SwarmError::DigestMismatch(number),
                expected = %expected,
                computed = %computed,
                "keeping part despite digest mismatch"
            );
        }
    });
}

// ============================================================================
// Recording sink
// ============================================================================

/// Playback sink that records everything it is fed. Tests and demos.
#[derive(Clone, Default)]
pub struct MemorySink {
    state: Arc<Mutex<SinkState>>,
}

#[derive(Default)]
struct SinkState {
    codec: Option<String>,
    appended: Vec<Bytes>,
    ended: bool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn codec(&self) -> Option<String> {
        self.state.lock().expect("sink lock").codec.clone()
    }

    pub fn appended(&self) -> Vec<Bytes> {
        self.state.lock().expect("sink lock").appended.clone()
    }

    pub fn ended(&self) -> bool {
        self.state.lock().expect("sink lock").ended
    }
}

#[async_trait]
impl PlaybackSink for MemorySink {
    async fn open(&mut self, codec: &str) -> Result<()> {
        self.state.lock().expect("sink lock").codec = Some(codec.to_string());
        Ok(())
    }

    async fn append(&mut self, bytes: Bytes) -> Result<()> {
        self.state.lock().expect("sink lock").appended.push(bytes);
        Ok(())
    }

    async fn end_of_stream(&mut self) -> Result<()> {
        self.state.lock().expect("sink lock").ended = true;
        Ok(())
    }
}
