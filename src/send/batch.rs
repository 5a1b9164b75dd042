//! Per-artifact outcome bookkeeping for outbound sends.
//!
//! One [`Batch`] tracks the messages cut from one artifact. Worker tasks
//! report each message as a successful or failed [`ByteRange`]; once every
//! declared message has reported, the batch moves from the tracker's active
//! set to its completed queue, exactly once. The owner of the tracker then
//! drains that queue on the host thread and calls [`Batch::finalize`].
//!
//! ```text
//!  begin_batch ─► active ──record_*/set_message_count──► complete ─► queue
//!                   │                                                 │
//!                   └─ cancel ─► (rollback, dropped)       finalize ◄─┘
//! ```
//!
//! Finalization outcomes:
//!
//! | reported                   | result                                    |
//! |----------------------------|-------------------------------------------|
//! | no messages                | original to success, no provenance        |
//! | only successes             | original to success, one `Send` event     |
//! | only failures              | original penalized, to failure            |
//! | both                       | merged children per outcome, original removed |

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::mpsc;

use super::range::{merge_ranges, ByteRange};
use crate::codec::AttributeMap;
use crate::error::{FlowError, Result};
use crate::host::{ArtifactId, FlowHost, Outcome, ProvenanceEvent};

/// Tracker-issued batch handle.
pub type BatchId = u64;

/// Attribute carrying the last failure cause on failure outputs.
pub const FAILURE_CAUSE_ATTRIBUTE: &str = "flow.failure.cause";

/// A child artifact produced by splitting a partially-sent artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SplitChild {
    pub artifact: ArtifactId,
    pub range: ByteRange,
    pub message_count: usize,
}

/// How a batch was finalized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BatchOutcome {
    /// The artifact produced no messages; forwarded unchanged to success.
    Empty,
    /// Every message was delivered.
    Sent { messages: usize },
    /// Every message failed.
    Failed { messages: usize, cause: String },
    /// Some messages were delivered, some not.
    Split {
        success: Vec<SplitChild>,
        failure: Vec<SplitChild>,
    },
}

/// Result of finalizing one batch, handed back to the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchNotification {
    pub batch: BatchId,
    pub artifact: ArtifactId,
    pub outcome: BatchOutcome,
}

#[derive(Debug)]
struct BatchState {
    declared_message_count: i64,
    successful: Vec<ByteRange>,
    failed: Vec<ByteRange>,
    last_failure_cause: Option<String>,
    cancelled: bool,
    enqueued: bool,
    finalized: bool,
    completed_at: Option<Instant>,
}

impl BatchState {
    fn is_complete(&self) -> bool {
        self.declared_message_count >= 0
            && (self.successful.len() + self.failed.len()) as i64 >= self.declared_message_count
    }
}

struct Registry {
    next_id: AtomicU64,
    active: Mutex<HashMap<BatchId, Arc<Batch>>>,
    completed: mpsc::UnboundedSender<Arc<Batch>>,
}

impl Registry {
    fn active(&self) -> MutexGuard<'_, HashMap<BatchId, Arc<Batch>>> {
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Outcome record for the messages of one artifact.
pub struct Batch {
    id: BatchId,
    artifact: ArtifactId,
    transit_uri: String,
    started_at: Instant,
    state: Mutex<BatchState>,
    registry: Arc<Registry>,
}

impl Batch {
    /// Get the batch handle.
    #[inline]
    pub fn id(&self) -> BatchId {
        self.id
    }

    /// Get the artifact being sent.
    #[inline]
    pub fn artifact(&self) -> ArtifactId {
        self.artifact
    }

    /// Get the transit URI recorded in provenance.
    #[inline]
    pub fn transit_uri(&self) -> &str {
        &self.transit_uri
    }

    /// Declared message count, or -1 while splitting is still in progress.
    pub fn declared_message_count(&self) -> i64 {
        self.state().declared_message_count
    }

    /// Ranges reported as delivered.
    pub fn successful_ranges(&self) -> Vec<ByteRange> {
        self.state().successful.clone()
    }

    /// Ranges reported as failed.
    pub fn failed_ranges(&self) -> Vec<ByteRange> {
        self.state().failed.clone()
    }

    /// The most recently reported failure cause.
    pub fn last_failure_cause(&self) -> Option<String> {
        self.state().last_failure_cause.clone()
    }

    /// Check if every declared message has reported.
    pub fn is_complete(&self) -> bool {
        self.state().enqueued
    }

    /// Check if the batch was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.state().cancelled
    }

    /// Record the total number of messages once splitting is done.
    pub fn set_message_count(&self, count: usize) {
        let mut state = self.state();
        if state.cancelled || state.enqueued {
            return;
        }
        state.declared_message_count = count as i64;
        self.complete_if_done(&mut state);
    }

    /// Record one delivered message.
    pub fn record_success(&self, range: ByteRange) {
        let mut state = self.state();
        if state.cancelled || state.enqueued {
            return;
        }
        state.successful.push(range);
        self.complete_if_done(&mut state);
    }

    /// Record one failed message. Only the latest cause is kept.
    pub fn record_failure(&self, range: ByteRange, cause: impl Into<String>) {
        let mut state = self.state();
        if state.cancelled || state.enqueued {
            return;
        }
        state.failed.push(range);
        state.last_failure_cause = Some(cause.into());
        self.complete_if_done(&mut state);
    }

    /// Abandon the batch, discarding recorded ranges.
    ///
    /// Returns `true` if the host must roll the artifact back. A batch that
    /// already completed is left alone and finalized normally.
    pub fn cancel(&self) -> bool {
        let mut state = self.state();
        if state.enqueued || state.cancelled {
            return false;
        }
        state.cancelled = true;
        state.successful.clear();
        state.failed.clear();
        state.last_failure_cause = None;
        self.registry.active().remove(&self.id);
        true
    }

    /// Route the artifact according to the reported outcomes.
    ///
    /// Must be called from the host thread, once the batch came out of the
    /// completed queue.
    ///
    /// # Errors
    ///
    /// `Host` if the batch is not complete or was already finalized, or any
    /// error the host returns.
    pub fn finalize<H: FlowHost + ?Sized>(&self, host: &H) -> Result<BatchNotification> {
        let (successful, failed, cause, elapsed) = {
            let mut state = self.state();
            if !state.enqueued {
                return Err(FlowError::Host(format!("batch {} is not complete", self.id)));
            }
            if state.finalized {
                return Err(FlowError::Host(format!("batch {} already finalized", self.id)));
            }
            state.finalized = true;
            let completed_at = state.completed_at.unwrap_or_else(Instant::now);
            (
                std::mem::take(&mut state.successful),
                std::mem::take(&mut state.failed),
                state.last_failure_cause.take(),
                completed_at.duration_since(self.started_at),
            )
        };

        let outcome = match (successful.is_empty(), failed.is_empty()) {
            (true, true) => {
                host.commit(self.artifact, Outcome::Success, &AttributeMap::new())?;
                tracing::debug!(
                    "Artifact {} produced no messages, forwarded unchanged",
                    self.artifact
                );
                BatchOutcome::Empty
            }
            (false, true) => {
                host.commit(self.artifact, Outcome::Success, &AttributeMap::new())?;
                self.report_sent(host, self.artifact, successful.len(), elapsed);
                tracing::info!(
                    "Sent {} messages of artifact {} to {} in {:?}",
                    successful.len(),
                    self.artifact,
                    self.transit_uri,
                    elapsed
                );
                BatchOutcome::Sent {
                    messages: successful.len(),
                }
            }
            (true, false) => {
                let cause = cause.unwrap_or_default();
                host.penalize(self.artifact)?;
                host.commit(self.artifact, Outcome::Failure, &failure_attributes(&cause))?;
                tracing::error!(
                    "All {} messages of artifact {} failed: {}",
                    failed.len(),
                    self.artifact,
                    cause
                );
                BatchOutcome::Failed {
                    messages: failed.len(),
                    cause,
                }
            }
            (false, false) => {
                let cause = cause.unwrap_or_default();
                let success = self.split(host, &successful, |host, child, merged| {
                    host.commit(child, Outcome::Success, &AttributeMap::new())?;
                    self.report_sent(host, child, merged, elapsed);
                    Ok(())
                })?;
                let failure = self.split(host, &failed, |host, child, _| {
                    host.penalize(child)?;
                    host.commit(child, Outcome::Failure, &failure_attributes(&cause))
                })?;
                host.remove(self.artifact)?;
                tracing::warn!(
                    "Artifact {} partially sent: {} of {} messages failed ({}), split into {} artifacts",
                    self.artifact,
                    failed.len(),
                    successful.len() + failed.len(),
                    cause,
                    success.len() + failure.len()
                );
                BatchOutcome::Split { success, failure }
            }
        };

        Ok(BatchNotification {
            batch: self.id,
            artifact: self.artifact,
            outcome,
        })
    }

    fn split<H, F>(&self, host: &H, ranges: &[ByteRange], mut route: F) -> Result<Vec<SplitChild>>
    where
        H: FlowHost + ?Sized,
        F: FnMut(&H, ArtifactId, usize) -> Result<()>,
    {
        merge_ranges(ranges)
            .into_iter()
            .map(|merged| {
                let child =
                    host.split_byte_range(self.artifact, merged.range.start, merged.range.end)?;
                route(host, child, merged.message_count)?;
                Ok(SplitChild {
                    artifact: child,
                    range: merged.range,
                    message_count: merged.message_count,
                })
            })
            .collect()
    }

    fn report_sent<H: FlowHost + ?Sized>(
        &self,
        host: &H,
        artifact: ArtifactId,
        messages: usize,
        elapsed: Duration,
    ) {
        host.report(ProvenanceEvent::Send {
            artifact,
            transit_uri: self.transit_uri.clone(),
            details: format!("Sent {} messages", messages),
            duration: elapsed,
        });
    }

    /// Move to the completed queue on the first transition to complete.
    fn complete_if_done(&self, state: &mut BatchState) {
        if !state.is_complete() {
            return;
        }
        state.enqueued = true;
        state.completed_at = Some(Instant::now());

        let batch = self.registry.active().remove(&self.id);
        if let Some(batch) = batch {
            if self.registry.completed.send(batch).is_err() {
                tracing::debug!("Batch {} completed after its tracker was dropped", self.id);
            }
        }
    }

    fn state(&self) -> MutexGuard<'_, BatchState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for Batch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Batch")
            .field("id", &self.id)
            .field("artifact", &self.artifact)
            .field("state", &*self.state())
            .finish()
    }
}

fn failure_attributes(cause: &str) -> AttributeMap {
    let mut attributes = AttributeMap::new();
    attributes.insert(FAILURE_CAUSE_ATTRIBUTE.to_string(), cause.to_string());
    attributes
}

/// Registry of active batches plus the queue of completed ones.
pub struct BatchTracker {
    registry: Arc<Registry>,
    completed: mpsc::UnboundedReceiver<Arc<Batch>>,
}

impl BatchTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            registry: Arc::new(Registry {
                next_id: AtomicU64::new(1),
                active: Mutex::new(HashMap::new()),
                completed: tx,
            }),
            completed: rx,
        }
    }

    /// Start tracking the messages of `artifact`.
    pub fn begin_batch(&self, artifact: ArtifactId, transit_uri: impl Into<String>) -> Arc<Batch> {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        let batch = Arc::new(Batch {
            id,
            artifact,
            transit_uri: transit_uri.into(),
            started_at: Instant::now(),
            state: Mutex::new(BatchState {
                declared_message_count: -1,
                successful: Vec::new(),
                failed: Vec::new(),
                last_failure_cause: None,
                cancelled: false,
                enqueued: false,
                finalized: false,
                completed_at: None,
            }),
            registry: self.registry.clone(),
        });
        self.registry.active().insert(id, batch.clone());
        batch
    }

    /// Look up an active batch.
    pub fn get(&self, id: BatchId) -> Option<Arc<Batch>> {
        self.registry.active().get(&id).cloned()
    }

    /// Snapshot of the batches still waiting for outcomes.
    pub fn active(&self) -> Vec<Arc<Batch>> {
        self.registry.active().values().cloned().collect()
    }

    /// Number of batches still waiting for outcomes.
    pub fn active_count(&self) -> usize {
        self.registry.active().len()
    }

    /// Take the next completed batch without waiting.
    pub fn try_next_completed(&mut self) -> Option<Arc<Batch>> {
        self.completed.try_recv().ok()
    }

    /// Wait for the next completed batch.
    pub async fn next_completed(&mut self) -> Option<Arc<Batch>> {
        self.completed.recv().await
    }
}

impl Default for BatchTracker {
    fn default() -> Self {
        Self::new()
    }
}
