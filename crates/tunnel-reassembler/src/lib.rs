//! Fragment Reassembler (spec §4.3): tracks fragments across the wire and
//! reassembles them in strict sequence order.
//!
//! State is a map from group id to fragment group, a parallel map from
//! sequence number to group id, and a `next_expected_sequence` counter, all
//! serialised by a single mutex. Groups age out after [`DEFAULT_GROUP_TTL`]
//! and the group count is capped at [`DEFAULT_MAX_GROUPS`]; both limits are
//! enforced with an expiry sweep attempted before giving up.

pub mod error;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub use error::{Error, Result};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Default cap on concurrently tracked fragment groups.
pub const DEFAULT_MAX_GROUPS: usize = 100;
/// Default cap on a single group's advertised `original_size`.
pub const DEFAULT_MAX_GROUP_BYTES: u64 = 10 * 1024 * 1024;
/// Default age after which an incomplete group is swept away.
pub const DEFAULT_GROUP_TTL: Duration = Duration::from_secs(30);
/// Default interval of the background sweep task.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(10);

struct FragmentGroup {
    original_size: u64,
    total: u32,
    sequence_number: i64,
    fragments: Vec<Option<Vec<u8>>>,
    received_count: u32,
    created_at: Instant,
    reassembled: bool,
}

impl FragmentGroup {
    fn is_complete(&self) -> bool {
        self.received_count == self.total
    }
}

#[derive(Default)]
struct Inner {
    groups: HashMap<String, FragmentGroup>,
    by_sequence: HashMap<i64, String>,
    next_expected_sequence: i64,
}

/// Tracks in-flight fragment groups and reassembles them once complete, in
/// strict ascending sequence-number order.
pub struct FragmentReassembler {
    inner: Mutex<Inner>,
    max_groups: usize,
    max_group_bytes: u64,
    group_ttl: Duration,
}

impl Default for FragmentReassembler {
    fn default() -> Self {
        Self::new()
    }
}

impl FragmentReassembler {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_GROUPS, DEFAULT_MAX_GROUP_BYTES, DEFAULT_GROUP_TTL)
    }

    pub fn with_limits(max_groups: usize, max_group_bytes: u64, group_ttl: Duration) -> Self {
        FragmentReassembler {
            inner: Mutex::new(Inner::default()),
            max_groups,
            max_group_bytes,
            group_ttl,
        }
    }

    /// Records one fragment of a group. Duplicate fragments at an
    /// already-filled index are a no-op success (spec §4.3 edge cases).
    #[allow(clippy::too_many_arguments)]
    pub async fn add_fragment(
        &self,
        group_id: &str,
        original_size: u64,
        fragment_size: u64,
        index: u32,
        total: u32,
        sequence_number: i64,
        data: Vec<u8>,
    ) -> Result<()> {
        if original_size > self.max_group_bytes {
            return Err(Error::GroupSizeTooLarge);
        }
        if total == 0 || index >= total {
            return Err(Error::IndexOutOfRange);
        }
        if data.len() as u64 != fragment_size {
            return Err(Error::FragmentSizeMismatch);
        }

        let mut inner = self.inner.lock().await;

        if !inner.groups.contains_key(group_id) {
            if inner.groups.len() >= self.max_groups {
                self.sweep_locked(&mut inner);
            }
            if inner.groups.len() >= self.max_groups {
                return Err(Error::TooManyGroups);
            }
            inner.groups.insert(
                group_id.to_owned(),
                FragmentGroup {
                    original_size,
                    total,
                    sequence_number,
                    fragments: vec![None; total as usize],
                    received_count: 0,
                    created_at: Instant::now(),
                    reassembled: false,
                },
            );
            inner.by_sequence.insert(sequence_number, group_id.to_owned());
        }

        let group = inner.groups.get_mut(group_id).expect("just inserted or present");
        if group.original_size != original_size
            || group.total != total
            || group.sequence_number != sequence_number
        {
            return Err(Error::GroupMismatch);
        }

        let slot = &mut group.fragments[index as usize];
        if slot.is_none() {
            *slot = Some(data);
            group.received_count += 1;
        }
        Ok(())
    }

    /// If the group at `next_expected_sequence` is fully received and has
    /// not yet been reassembled, advances the counter and returns its id.
    /// Otherwise returns `None` without advancing — callers must wait.
    pub async fn next_complete_group(&self) -> Option<String> {
        let mut inner = self.inner.lock().await;
        let seq = inner.next_expected_sequence;
        let group_id = inner.by_sequence.get(&seq)?.clone();
        let group = inner.groups.get(&group_id)?;
        if group.is_complete() && !group.reassembled {
            inner.next_expected_sequence += 1;
            Some(group_id)
        } else {
            None
        }
    }

    /// Concatenates a complete group's fragments in index order. Returns
    /// `Ok(None)` if the group is unknown or was already reassembled.
    pub async fn reassemble(&self, group_id: &str) -> Result<Option<Vec<u8>>> {
        let mut inner = self.inner.lock().await;
        let Some(group) = inner.groups.get_mut(group_id) else {
            return Ok(None);
        };
        if group.reassembled {
            return Ok(None);
        }

        let mut buf = Vec::with_capacity(group.original_size as usize);
        for slot in &group.fragments {
            let Some(bytes) = slot else {
                return Err(Error::ReassembledSizeMismatch);
            };
            buf.extend_from_slice(bytes);
        }
        if buf.len() as u64 != group.original_size {
            return Err(Error::ReassembledSizeMismatch);
        }
        group.reassembled = true;
        Ok(Some(buf))
    }

    /// Drops a group's state. Callers do this once they've consumed the
    /// reassembled bytes.
    pub async fn remove(&self, group_id: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(group) = inner.groups.remove(group_id) {
            inner.by_sequence.remove(&group.sequence_number);
        }
    }

    /// Removes groups older than the configured TTL. Returns how many were
    /// swept.
    pub async fn sweep_expired(&self) -> usize {
        let mut inner = self.inner.lock().await;
        self.sweep_locked(&mut inner)
    }

    fn sweep_locked(&self, inner: &mut Inner) -> usize {
        let ttl = self.group_ttl;
        let expired: Vec<String> = inner
            .groups
            .iter()
            .filter(|(_, g)| g.created_at.elapsed() > ttl)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            if let Some(group) = inner.groups.remove(id) {
                inner.by_sequence.remove(&group.sequence_number);
            }
        }
        if !expired.is_empty() {
            tracing::debug!(count = expired.len(), "swept expired fragment groups");
        }
        expired.len()
    }

    #[cfg(test)]
    async fn group_count(&self) -> usize {
        self.inner.lock().await.groups.len()
    }
}

/// Spawns a background task that sweeps expired groups every
/// [`DEFAULT_SWEEP_INTERVAL`]. The handle is owned by the caller; dropping it
/// does not stop the task, abort it explicitly if needed.
pub fn spawn_sweeper(reassembler: Arc<FragmentReassembler>) -> JoinHandle<()> {
    spawn_sweeper_with_interval(reassembler, DEFAULT_SWEEP_INTERVAL)
}

pub fn spawn_sweeper_with_interval(
    reassembler: Arc<FragmentReassembler>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            reassembler.sweep_expired().await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tunnel_wire::fragment::split;

    async fn feed_all(r: &FragmentReassembler, data: &[u8], sequence_number: i64) -> String {
        let frags = split(data, sequence_number, 0);
        let group_id = frags[0].fragment_group_id.clone();
        for f in &frags {
            let bytes = base64::Engine::decode(
                &base64::engine::general_purpose::STANDARD,
                &f.data,
            )
            .unwrap();
            r.add_fragment(
                &f.fragment_group_id,
                f.original_size,
                f.fragment_size,
                f.fragment_index,
                f.total_fragments,
                f.sequence_number,
                bytes,
            )
            .await
            .unwrap();
        }
        group_id
    }

    #[tokio::test]
    async fn single_fragment_group_reassembles_immediately() {
        let r = FragmentReassembler::new();
        let data = b"hello tunnel".to_vec();
        let group_id = feed_all(&r, &data, 0).await;

        let ready = r.next_complete_group().await.unwrap();
        assert_eq!(ready, group_id);
        let out = r.reassemble(&group_id).await.unwrap().unwrap();
        assert_eq!(out, data);
        r.remove(&group_id).await;
        assert_eq!(r.group_count().await, 0);
    }

    #[tokio::test]
    async fn multi_fragment_group_reassembles_in_order() {
        let r = FragmentReassembler::new();
        let data: Vec<u8> = (0..25 * 1024).map(|i| (i % 251) as u8).collect();
        let group_id = feed_all(&r, &data, 0).await;

        let ready = r.next_complete_group().await.unwrap();
        let out = r.reassemble(&ready).await.unwrap().unwrap();
        assert_eq!(out, data);
        assert_eq!(group_id, ready);
    }

    #[tokio::test]
    async fn reassemble_is_idempotent_after_first_success() {
        let r = FragmentReassembler::new();
        let data = b"once only".to_vec();
        let group_id = feed_all(&r, &data, 0).await;
        r.next_complete_group().await.unwrap();

        assert!(r.reassemble(&group_id).await.unwrap().is_some());
        assert!(r.reassemble(&group_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn next_complete_group_enforces_strict_ordering() {
        let r = FragmentReassembler::new();
        let second = feed_all(&r, b"second", 1).await;
        // Sequence 0 hasn't arrived yet, so sequence 1's group must wait.
        assert!(r.next_complete_group().await.is_none());

        let first = feed_all(&r, b"first", 0).await;
        let ready = r.next_complete_group().await.unwrap();
        assert_eq!(ready, first);
        let ready2 = r.next_complete_group().await.unwrap();
        assert_eq!(ready2, second);
    }

    #[tokio::test]
    async fn duplicate_fragment_at_same_index_is_a_no_op() {
        let r = FragmentReassembler::new();
        r.add_fragment("g1", 4, 4, 0, 1, 0, vec![1, 2, 3, 4]).await.unwrap();
        r.add_fragment("g1", 4, 4, 0, 1, 0, vec![1, 2, 3, 4]).await.unwrap();
        let ready = r.next_complete_group().await.unwrap();
        assert_eq!(ready, "g1");
    }

    #[tokio::test]
    async fn mismatched_metadata_on_known_group_is_rejected() {
        let r = FragmentReassembler::new();
        r.add_fragment("g1", 8, 4, 0, 2, 0, vec![0; 4]).await.unwrap();
        let err = r.add_fragment("g1", 9, 4, 1, 2, 0, vec![0; 4]).await.unwrap_err();
        assert_eq!(err, Error::GroupMismatch);
    }

    #[tokio::test]
    async fn index_out_of_range_is_rejected() {
        let r = FragmentReassembler::new();
        let err = r.add_fragment("g1", 4, 4, 5, 2, 0, vec![0; 4]).await.unwrap_err();
        assert_eq!(err, Error::IndexOutOfRange);
    }

    #[tokio::test]
    async fn fragment_size_mismatch_is_rejected() {
        let r = FragmentReassembler::new();
        let err = r.add_fragment("g1", 4, 4, 0, 1, 0, vec![0; 3]).await.unwrap_err();
        assert_eq!(err, Error::FragmentSizeMismatch);
    }

    #[tokio::test]
    async fn group_size_too_large_is_rejected() {
        let r = FragmentReassembler::new();
        let err = r
            .add_fragment("g1", DEFAULT_MAX_GROUP_BYTES + 1, 4, 0, 1, 0, vec![0; 4])
            .await
            .unwrap_err();
        assert_eq!(err, Error::GroupSizeTooLarge);
    }

    #[tokio::test]
    async fn too_many_groups_after_failed_sweep() {
        let r = FragmentReassembler::with_limits(2, DEFAULT_MAX_GROUP_BYTES, Duration::from_secs(30));
        r.add_fragment("g1", 4, 4, 0, 2, 0, vec![0; 4]).await.unwrap();
        r.add_fragment("g2", 4, 4, 0, 2, 1, vec![0; 4]).await.unwrap();
        let err = r.add_fragment("g3", 4, 4, 0, 2, 2, vec![0; 4]).await.unwrap_err();
        assert_eq!(err, Error::TooManyGroups);
    }

    #[tokio::test]
    async fn expiry_sweep_makes_room_for_new_groups() {
        let r = FragmentReassembler::with_limits(1, DEFAULT_MAX_GROUP_BYTES, Duration::from_millis(10));
        r.add_fragment("g1", 4, 4, 0, 2, 0, vec![0; 4]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        r.add_fragment("g2", 4, 4, 0, 2, 1, vec![0; 4]).await.unwrap();
        assert_eq!(r.group_count().await, 1);
    }
}
