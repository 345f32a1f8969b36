//! Striping codec: round-robin byte distribution and XOR parity.
//!
//! A logical byte stream of length L maps onto N fragments of
//! F = ⌈L/(N−1)⌉ bytes each. Data fragments 0 … N−2 take bytes
//! round-robin (`fragment[i % (N−1)][i / (N−1)] = B[i]`), positions past
//! the end of the stream stay zero, and fragment N−1 is the XOR of all
//! data fragments. Because XOR is associative, any single missing fragment
//! (data or parity) equals the XOR of the other N−1, which is the whole
//! fault-tolerance story of the store.

/// Fragment length for a logical stream of `data_len` bytes striped over
/// `nodes` fragments (one of which is parity).
pub fn fragment_len(data_len: u64, nodes: usize) -> u64 {
    data_len.div_ceil(nodes as u64 - 1)
}

/// XOR `src` into `acc`. Both slices must have equal length.
pub fn xor_into(acc: &mut [u8], src: &[u8]) {
    debug_assert_eq!(acc.len(), src.len());
    for (a, b) in acc.iter_mut().zip(src) {
        *a ^= *b;
    }
}

/// Stripe `data` into `nodes` fragments: N−1 data fragments followed by
/// the parity fragment, each `fragment_len(data.len(), nodes)` bytes.
pub fn encode(data: &[u8], nodes: usize) -> Vec<Vec<u8>> {
    assert!(nodes >= 3, "striping requires at least three fragments");
    let width = nodes - 1;
    let frag_len = fragment_len(data.len() as u64, nodes) as usize;
    let mut fragments = vec![vec![0u8; frag_len]; nodes];
    for (i, byte) in data.iter().enumerate() {
        fragments[i % width][i / width] = *byte;
    }
    let (data_fragments, parity) = fragments.split_at_mut(width);
    for fragment in data_fragments {
        xor_into(&mut parity[0], fragment);
    }
    fragments
}

/// Rebuild one missing fragment as the XOR of the `present` N−1 fragments.
/// Works for any missing index, parity included.
pub fn rebuild<'a>(present: impl IntoIterator<Item = &'a [u8]>, frag_len: usize) -> Vec<u8> {
    let mut rebuilt = vec![0u8; frag_len];
    for fragment in present {
        xor_into(&mut rebuilt, fragment);
    }
    rebuilt
}

/// Decode the logical byte range starting at `start` into `out`, reading
/// from the round-robin mapping. The final fragment is parity and is never
/// consulted. Positions past a fragment's end decode as zero, matching the
/// padded layout.
pub fn decode_range(fragments: &[Vec<u8>], start: u64, out: &mut [u8]) {
    let width = (fragments.len() - 1) as u64;
    for (i, slot) in out.iter_mut().enumerate() {
        let pos = start + i as u64;
        let fragment = &fragments[(pos % width) as usize];
        *slot = fragment.get((pos / width) as usize).copied().unwrap_or(0);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// Deterministic non-trivial byte pattern.
    fn pattern(len: usize, mut seed: u64) -> Vec<u8> {
        (0..len)
            .map(|_| {
                seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                (seed >> 33) as u8
            })
            .collect()
    }

    const LENGTHS: &[usize] = &[0, 1, 2, 5, 9, 17, 4096, 4099, 1 << 20];

    #[test]
    fn literal_three_node_layout() {
        // "ABCDEFGHI" over three nodes: even positions, odd positions, parity.
        let fragments = encode(b"ABCDEFGHI", 3);
        assert_eq!(fragments[0], b"ACEGI");
        assert_eq!(fragments[1], b"BDFH\0");
        let parity: Vec<u8> = fragments[0]
            .iter()
            .zip(&fragments[1])
            .map(|(a, b)| a ^ b)
            .collect();
        assert_eq!(fragments[2], parity);
    }

    #[test]
    fn round_trip_from_any_surviving_subset() {
        for nodes in 3..=10 {
            for &len in LENGTHS {
                let data = pattern(len, (nodes * 31 + len) as u64);
                let fragments = encode(&data, nodes);
                let frag_len = fragment_len(len as u64, nodes) as usize;
                for missing in 0..nodes {
                    let rebuilt = rebuild(
                        fragments
                            .iter()
                            .enumerate()
                            .filter(|(i, _)| *i != missing)
                            .map(|(_, f)| f.as_slice()),
                        frag_len,
                    );
                    let mut survivors = fragments.clone();
                    survivors[missing] = rebuilt;
                    let mut decoded = vec![0u8; len];
                    decode_range(&survivors, 0, &mut decoded);
                    assert_eq!(decoded, data, "nodes={nodes} len={len} missing={missing}");
                }
            }
        }
    }

    #[test]
    fn parity_of_all_fragments_is_zero() {
        for nodes in 3..=10 {
            for &len in LENGTHS {
                let data = pattern(len, len as u64 + 7);
                let fragments = encode(&data, nodes);
                let frag_len = fragment_len(len as u64, nodes) as usize;
                let mut acc = vec![0u8; frag_len];
                for fragment in &fragments {
                    xor_into(&mut acc, fragment);
                }
                assert!(acc.iter().all(|b| *b == 0), "nodes={nodes} len={len}");
            }
        }
    }

    #[test]
    fn rebuild_matches_dropped_fragment() {
        for nodes in 3..=10 {
            let data = pattern(100_003, nodes as u64);
            let fragments = encode(&data, nodes);
            let frag_len = fragments[0].len();
            for missing in 0..nodes {
                let rebuilt = rebuild(
                    fragments
                        .iter()
                        .enumerate()
                        .filter(|(i, _)| *i != missing)
                        .map(|(_, f)| f.as_slice()),
                    frag_len,
                );
                assert_eq!(rebuilt, fragments[missing], "nodes={nodes} missing={missing}");
            }
        }
    }

    #[test]
    fn partial_range_decoding() {
        let data = pattern(10_000, 42);
        let fragments = encode(&data, 4);
        let mut out = vec![0u8; 100];
        decode_range(&fragments, 5_000, &mut out);
        assert_eq!(out, &data[5_000..5_100]);
    }

    #[test]
    fn empty_stream_has_empty_fragments() {
        let fragments = encode(b"", 5);
        assert_eq!(fragments.len(), 5);
        assert!(fragments.iter().all(|f| f.is_empty()));
        assert_eq!(fragment_len(0, 5), 0);
    }
}
