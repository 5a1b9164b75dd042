//! In-memory [`FlowHost`] for tests, demos and embedding without a pipeline.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use bytes::Bytes;

use super::{ArtifactId, FlowHost, Outcome, ProvenanceEvent};
use crate::codec::AttributeMap;
use crate::error::{FlowError, Result};

#[derive(Debug, Clone, Default)]
struct Stored {
    content: Vec<u8>,
    attributes: AttributeMap,
    penalized: bool,
}

/// An artifact routed by [`FlowHost::commit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedArtifact {
    /// Artifact handle.
    pub id: ArtifactId,
    /// Where it was routed.
    pub outcome: Outcome,
    /// Final content.
    pub content: Bytes,
    /// Final attributes.
    pub attributes: AttributeMap,
    /// Whether it was penalized before commit.
    pub penalized: bool,
}

#[derive(Default)]
struct State {
    next_id: ArtifactId,
    live: HashMap<ArtifactId, Stored>,
    committed: Vec<CommittedArtifact>,
    removed: Vec<ArtifactId>,
    rolled_back: Vec<ArtifactId>,
    provenance: Vec<ProvenanceEvent>,
}

/// Host keeping every artifact in memory.
pub struct MemoryHost {
    state: Mutex<State>,
    ready: AtomicBool,
}

impl MemoryHost {
    /// Create an empty, ready host.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                next_id: 1,
                ..State::default()
            }),
            ready: AtomicBool::new(true),
        }
    }

    /// Add an artifact with content and attributes; returns its handle.
    pub fn insert(&self, content: impl Into<Vec<u8>>, attributes: AttributeMap) -> ArtifactId {
        let mut state = self.state();
        let id = state.next_id;
        state.next_id += 1;
        state.live.insert(
            id,
            Stored {
                content: content.into(),
                attributes,
                penalized: false,
            },
        );
        id
    }

    /// Toggle readiness.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }

    /// Content of an artifact that is not yet committed.
    pub fn content(&self, id: ArtifactId) -> Option<Bytes> {
        self.state()
            .live
            .get(&id)
            .map(|s| Bytes::copy_from_slice(&s.content))
    }

    /// Attributes of an artifact that is not yet committed.
    pub fn attributes(&self, id: ArtifactId) -> Option<AttributeMap> {
        self.state().live.get(&id).map(|s| s.attributes.clone())
    }

    /// Every committed artifact, in commit order.
    pub fn committed(&self) -> Vec<CommittedArtifact> {
        self.state().committed.clone()
    }

    /// Committed artifacts routed to `outcome`.
    pub fn committed_to(&self, outcome: Outcome) -> Vec<CommittedArtifact> {
        self.state()
            .committed
            .iter()
            .filter(|c| c.outcome == outcome)
            .cloned()
            .collect()
    }

    /// Handles of removed artifacts.
    pub fn removed(&self) -> Vec<ArtifactId> {
        self.state().removed.clone()
    }

    /// Handles of rolled-back artifacts.
    pub fn rolled_back(&self) -> Vec<ArtifactId> {
        self.state().rolled_back.clone()
    }

    /// Every reported provenance event.
    pub fn provenance(&self) -> Vec<ProvenanceEvent> {
        self.state().provenance.clone()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for MemoryHost {
    fn default() -> Self {
        Self::new()
    }
}

fn unknown(id: ArtifactId) -> FlowError {
    FlowError::Host(format!("unknown artifact {}", id))
}

impl FlowHost for MemoryHost {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    fn create_artifact(&self) -> Result<ArtifactId> {
        Ok(self.insert(Vec::new(), AttributeMap::new()))
    }

    fn write_bytes(&self, artifact: ArtifactId, bytes: &[u8]) -> Result<()> {
        let mut state = self.state();
        let stored = state.live.get_mut(&artifact).ok_or_else(|| unknown(artifact))?;
        stored.content.extend_from_slice(bytes);
        Ok(())
    }

    fn split_byte_range(&self, artifact: ArtifactId, start: u64, end: u64) -> Result<ArtifactId> {
        let mut state = self.state();
        let parent = state.live.get(&artifact).ok_or_else(|| unknown(artifact))?;
        let len = parent.content.len() as u64;
        if start > end || end > len {
            return Err(FlowError::Host(format!(
                "range [{}, {}) outside artifact {} of {} bytes",
                start, end, artifact, len
            )));
        }
        let child = Stored {
            content: parent.content[start as usize..end as usize].to_vec(),
            attributes: parent.attributes.clone(),
            penalized: false,
        };
        let id = state.next_id;
        state.next_id += 1;
        state.live.insert(id, child);
        Ok(id)
    }

    fn penalize(&self, artifact: ArtifactId) -> Result<()> {
        let mut state = self.state();
        state.live.get_mut(&artifact).ok_or_else(|| unknown(artifact))?.penalized = true;
        Ok(())
    }

    fn commit(&self, artifact: ArtifactId, outcome: Outcome, attributes: &AttributeMap) -> Result<()> {
        let mut state = self.state();
        let mut stored = state.live.remove(&artifact).ok_or_else(|| unknown(artifact))?;
        stored
            .attributes
            .extend(attributes.iter().map(|(k, v)| (k.clone(), v.clone())));
        state.committed.push(CommittedArtifact {
            id: artifact,
            outcome,
            content: Bytes::from(stored.content),
            attributes: stored.attributes,
            penalized: stored.penalized,
        });
        Ok(())
    }

    fn remove(&self, artifact: ArtifactId) -> Result<()> {
        let mut state = self.state();
        state.live.remove(&artifact).ok_or_else(|| unknown(artifact))?;
        state.removed.push(artifact);
        Ok(())
    }

    fn rollback(&self, artifact: ArtifactId) -> Result<()> {
        let mut state = self.state();
        if !state.live.contains_key(&artifact) {
            return Err(unknown(artifact));
        }
        state.rolled_back.push(artifact);
        Ok(())
    }

    fn report(&self, event: ProvenanceEvent) {
        self.state().provenance.push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(pairs: &[(&str, &str)]) -> AttributeMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_create_write_commit() {
        let host = MemoryHost::new();
        let id = host.create_artifact().unwrap();
        host.write_bytes(id, b"hello ").unwrap();
        host.write_bytes(id, b"world").unwrap();
        host.commit(id, Outcome::Success, &attrs(&[("a", "1")])).unwrap();

        let committed = host.committed();
        assert_eq!(committed.len(), 1);
        assert_eq!(&committed[0].content[..], b"hello world");
        assert_eq!(committed[0].attributes, attrs(&[("a", "1")]));
        assert!(host.content(id).is_none());
    }

    #[test]
    fn test_split_inherits_attributes() {
        let host = MemoryHost::new();
        let parent = host.insert(b"0123456789".to_vec(), attrs(&[("filename", "f")]));

        let child = host.split_byte_range(parent, 2, 5).unwrap();

        assert_eq!(&host.content(child).unwrap()[..], b"234");
        assert_eq!(host.attributes(child).unwrap(), attrs(&[("filename", "f")]));
        assert!(host.split_byte_range(parent, 5, 11).is_err());
    }

    #[test]
    fn test_penalize_remove_rollback() {
        let host = MemoryHost::new();
        let a = host.insert(b"a".to_vec(), AttributeMap::new());
        let b = host.insert(b"b".to_vec(), AttributeMap::new());

        host.penalize(a).unwrap();
        host.commit(a, Outcome::Failure, &AttributeMap::new()).unwrap();
        host.rollback(b).unwrap();
        host.remove(b).unwrap();

        assert!(host.committed_to(Outcome::Failure)[0].penalized);
        assert_eq!(host.rolled_back(), vec![b]);
        assert_eq!(host.removed(), vec![b]);
        assert!(host.remove(b).is_err());
    }
}
