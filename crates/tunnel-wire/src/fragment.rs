//! Fragment Codec (spec §4.2): pure functions that split a byte range into
//! numbered fragments sharing a group id and sequence number. Stateless —
//! reassembly lives in `tunnel-reassembler`.

use base64::Engine;
use uuid::Uuid;

use crate::types::FragmentResponse;

/// Below this size a payload is sent as a single fragment.
pub const FRAGMENT_THRESHOLD: usize = 8 * 1024;
/// No fragment (other than a merged tail) exceeds this size.
pub const MAX_FRAGMENT_SIZE: usize = 10 * 1024;
/// A trailing fragment smaller than this is merged into the penultimate one.
pub const MIN_FRAGMENT_SIZE: usize = 1024;

/// Computes the byte-length of each fragment a payload of `original_size`
/// would be split into, applying the tail-merge rule (spec §4.2, boundary
/// cases in §8).
pub fn plan_fragment_sizes(original_size: usize) -> Vec<usize> {
    if original_size <= FRAGMENT_THRESHOLD {
        return vec![original_size];
    }

    let mut total = original_size.div_ceil(MAX_FRAGMENT_SIZE).max(1);
    let mut tail = original_size - (total - 1) * MAX_FRAGMENT_SIZE;
    if tail < MIN_FRAGMENT_SIZE && total > 1 {
        total -= 1;
        tail = original_size - (total - 1) * MAX_FRAGMENT_SIZE;
    }

    let mut sizes = vec![MAX_FRAGMENT_SIZE; total - 1];
    sizes.push(tail);
    sizes
}

/// Splits `data` into an ordered slice of [`FragmentResponse`] records that
/// all share a freshly generated group id and the given `sequence_number`.
pub fn split(data: &[u8], sequence_number: i64, timestamp: i64) -> Vec<FragmentResponse> {
    let sizes = plan_fragment_sizes(data.len());
    let total_fragments = sizes.len() as u32;
    let group_id = Uuid::new_v4().to_string();
    let original_size = data.len() as u64;

    let mut fragments = Vec::with_capacity(sizes.len());
    let mut offset = 0usize;
    for (index, size) in sizes.into_iter().enumerate() {
        let chunk = &data[offset..offset + size];
        offset += size;
        fragments.push(FragmentResponse {
            fragment_group_id: group_id.clone(),
            original_size,
            fragment_size: size as u64,
            fragment_index: index as u32,
            total_fragments,
            sequence_number,
            data: base64::engine::general_purpose::STANDARD.encode(chunk),
            timestamp,
            success: None,
            timeout: None,
        });
    }
    fragments
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn joined(fragments: &[FragmentResponse]) -> Vec<u8> {
        let mut by_index: Vec<&FragmentResponse> = fragments.iter().collect();
        by_index.sort_by_key(|f| f.fragment_index);
        let mut out = Vec::new();
        for f in by_index {
            out.extend(
                base64::engine::general_purpose::STANDARD
                    .decode(&f.data)
                    .unwrap(),
            );
        }
        out
    }

    #[test]
    fn payload_at_threshold_is_one_fragment() {
        let data = payload(FRAGMENT_THRESHOLD);
        let frags = split(&data, 7, 0);
        assert_eq!(frags.len(), 1);
        assert_eq!(frags[0].total_fragments, 1);
        assert_eq!(frags[0].fragment_size, FRAGMENT_THRESHOLD as u64);
    }

    #[test]
    fn payload_one_byte_over_threshold_is_still_one_fragment() {
        let data = payload(FRAGMENT_THRESHOLD + 1);
        let frags = split(&data, 7, 0);
        assert_eq!(frags.len(), 1);
        assert_eq!(frags[0].fragment_size, (FRAGMENT_THRESHOLD + 1) as u64);
    }

    #[test]
    fn twenty_five_kib_splits_into_three_fragments_no_merge() {
        let data = payload(25 * 1024);
        let frags = split(&data, 11, 0);
        assert_eq!(frags.len(), 3);
        assert_eq!(frags[0].fragment_size, MAX_FRAGMENT_SIZE as u64);
        assert_eq!(frags[1].fragment_size, MAX_FRAGMENT_SIZE as u64);
        assert_eq!(frags[2].fragment_size, (25 * 1024 - 2 * MAX_FRAGMENT_SIZE) as u64);
        assert_eq!(joined(&frags), data);
        for f in &frags {
            assert_eq!(f.sequence_number, 11);
            assert_eq!(f.fragment_group_id, frags[0].fragment_group_id);
        }
    }

    #[test]
    fn tail_merge_when_trailing_fragment_too_small() {
        let data = payload(20 * 1024 + 512);
        let frags = split(&data, 3, 0);
        assert_eq!(frags.len(), 2);
        assert_eq!(frags[0].fragment_size, MAX_FRAGMENT_SIZE as u64);
        assert_eq!(frags[1].fragment_size, (MAX_FRAGMENT_SIZE + 512) as u64);
        assert_eq!(joined(&frags), data);
    }

    #[test]
    fn indices_are_dense_and_group_id_is_shared() {
        let data = payload(100 * 1024);
        let frags = split(&data, 1, 0);
        let mut indices: Vec<u32> = frags.iter().map(|f| f.fragment_index).collect();
        indices.sort_unstable();
        let expected: Vec<u32> = (0..frags.len() as u32).collect();
        assert_eq!(indices, expected);
        assert!(frags.iter().all(|f| f.fragment_group_id == frags[0].fragment_group_id));
    }

    #[test]
    fn small_payload_round_trips_exactly() {
        let data = payload(4 * 1024);
        let frags = split(&data, 7, 0);
        assert_eq!(joined(&frags), data);
    }
}
