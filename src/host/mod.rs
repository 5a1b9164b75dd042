//! The pipeline host seam.
//!
//! flowwire never owns artifact storage. Everything it produces or consumes
//! goes through a [`FlowHost`]: creating artifacts for received content,
//! splitting a partially-sent artifact into byte ranges, routing to success
//! or failure, and recording provenance.
//!
//! Host calls are made only from the thread that drives the server or
//! sender (`poll_sessions`, `poll_completed`, `cancel`, `shutdown`), never
//! from worker tasks. Implementations must still be `Send + Sync` because
//! the lifecycle objects that hold them are.

mod memory;

use std::time::Duration;

use crate::codec::AttributeMap;
use crate::error::Result;
use crate::runtime::block_until;

pub use memory::{CommittedArtifact, MemoryHost};

/// Host-issued artifact handle.
pub type ArtifactId = u64;

/// Routing decision for a committed artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// Delivered or received successfully.
    Success,
    /// Could not be delivered.
    Failure,
}

/// Lineage record reported to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvenanceEvent {
    /// Artifact content was sent to a remote peer.
    Send {
        artifact: ArtifactId,
        transit_uri: String,
        details: String,
        duration: Duration,
    },
    /// Artifact content was received from a remote peer.
    Receive {
        artifact: ArtifactId,
        transit_uri: String,
    },
}

/// Artifact/session operations the engine relies on.
pub trait FlowHost: Send + Sync + 'static {
    /// Whether the host can accept new artifacts right now.
    fn is_ready(&self) -> bool {
        true
    }

    /// Create an empty artifact.
    fn create_artifact(&self) -> Result<ArtifactId>;

    /// Append content to an artifact.
    fn write_bytes(&self, artifact: ArtifactId, bytes: &[u8]) -> Result<()>;

    /// Create a child holding `[start, end)` of the parent's content and
    /// inheriting its attributes.
    fn split_byte_range(&self, artifact: ArtifactId, start: u64, end: u64) -> Result<ArtifactId>;

    /// Mark an artifact to be retried later.
    fn penalize(&self, artifact: ArtifactId) -> Result<()>;

    /// Add `attributes` to the artifact and route it to `outcome`.
    fn commit(&self, artifact: ArtifactId, outcome: Outcome, attributes: &AttributeMap) -> Result<()>;

    /// Drop an artifact.
    fn remove(&self, artifact: ArtifactId) -> Result<()>;

    /// Return an artifact to its input untouched.
    fn rollback(&self, artifact: ArtifactId) -> Result<()>;

    /// Record a provenance event.
    fn report(&self, event: ProvenanceEvent);
}

/// Wait, with short sleeps, until the host reports ready.
///
/// Returns `false` if `timeout` elapsed first.
pub fn wait_until_ready<H: FlowHost + ?Sized>(host: &H, interval: Duration, timeout: Duration) -> bool {
    block_until(interval, timeout, || host.is_ready())
}
