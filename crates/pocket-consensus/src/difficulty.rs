// DIFFICULTY
// Compact targets, chain work and the per-mode retarget rule.
//
// SAFETY INVARIANTS:
// 1. A compact value with the sign bit set, a zero mantissa or a target
//    above 2^256 decodes to `None` and is never accepted
// 2. Retargeting is a pure function of the same-mode ancestors, so every
//    node derives the same expected bits for a given parent
// 3. The expected target never exceeds the mode's limit

use num_bigint::BigUint;

use pocket_core::{ConsensusMode, ConsensusParams, Hash256};

/// Decode compact `bits` into a 256-bit target.
pub fn target_from_compact(bits: u32) -> Option<BigUint> {
    let size = bits >> 24;
    let word = bits & 0x007f_ffff;
    if word == 0 || bits & 0x0080_0000 != 0 {
        return None;
    }
    let target = if size <= 3 {
        BigUint::from(word >> (8 * (3 - size)))
    } else {
        BigUint::from(word) << (8 * (size - 3) as usize)
    };
    if target.bits() > 256 || target == BigUint::from(0u32) {
        return None;
    }
    Some(target)
}

/// Encode a target in compact form, rounding the mantissa down.
pub fn compact_from_target(target: &BigUint) -> u32 {
    if *target == BigUint::from(0u32) {
        return 0;
    }
    let bytes = target.to_bytes_be();
    let mut size = bytes.len() as u32;
    let mut mantissa: u32 = if size <= 3 {
        let mut word = 0u32;
        for b in &bytes {
            word = (word << 8) | *b as u32;
        }
        word << (8 * (3 - size))
    } else {
        ((bytes[0] as u32) << 16) | ((bytes[1] as u32) << 8) | bytes[2] as u32
    };
    // keep the sign bit clear
    if mantissa & 0x0080_0000 != 0 {
        mantissa >>= 8;
        size += 1;
    }
    mantissa | (size << 24)
}

/// Block hashes and kernels compare as little-endian 256-bit integers.
pub fn hash_to_uint(hash: &Hash256) -> BigUint {
    BigUint::from_bytes_le(hash.as_bytes())
}

/// Expected number of hashes to meet `bits`: 2^256 / (target + 1).
pub fn block_proof(bits: u32) -> BigUint {
    match target_from_compact(bits) {
        Some(target) => (BigUint::from(1u32) << 256usize) / (target + 1u32),
        None => BigUint::from(0u32),
    }
}

pub fn limit_bits(params: &ConsensusParams, mode: ConsensusMode) -> u32 {
    match mode {
        ConsensusMode::ProofOfWork => params.pow_limit_bits,
        ConsensusMode::ProofOfStake => params.pos_limit_bits,
    }
}

/// **Expected bits for the next block of `mode`**
///
/// `recent` holds `(time, bits)` of the most recent same-mode ancestors,
/// newest first. With fewer than `retarget_window` of them, or on a network
/// without retargeting, the mode's limit applies. Otherwise the average
/// target of the window is scaled by actual over expected timespan, the
/// ratio clamped to [1/4, 4].
pub fn next_bits(params: &ConsensusParams, mode: ConsensusMode, recent: &[(u32, u32)]) -> u32 {
    let limit_bits = limit_bits(params, mode);
    let window = params.retarget_window as usize;
    if params.pow_no_retargeting || window < 2 || recent.len() < window {
        return limit_bits;
    }
    let Some(limit) = target_from_compact(limit_bits) else {
        return limit_bits;
    };

    let window_blocks = &recent[..window];
    let mut sum = BigUint::from(0u32);
    for (_, bits) in window_blocks {
        match target_from_compact(*bits) {
            Some(target) => sum += target,
            None => return limit_bits,
        }
    }
    let average = sum / window as u64;

    let newest = window_blocks[0].0 as i64;
    let oldest = window_blocks[window - 1].0 as i64;
    let expected = (window as i64 - 1) * params.target_spacing_secs as i64;
    let actual = (newest - oldest).clamp(expected / 4, expected * 4).max(1);

    let mut target = average * actual as u64 / expected.max(1) as u64;
    if target > limit {
        target = limit;
    }
    compact_from_target(&target)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_compact_values() {
        let target = target_from_compact(0x1d00_ffff).unwrap();
        assert_eq!(target, BigUint::from(0xffffu32) << 208usize);
        assert_eq!(compact_from_target(&target), 0x1d00_ffff);

        let regtest = target_from_compact(0x207f_ffff).unwrap();
        assert_eq!(compact_from_target(&regtest), 0x207f_ffff);
    }

    #[test]
    fn test_invalid_compact_rejected() {
        assert!(target_from_compact(0).is_none());
        assert!(target_from_compact(0x0180_0001).is_none());
        assert!(target_from_compact(0x2200_ffff).is_none());
    }

    #[test]
    fn test_mantissa_sign_bit_shifts_size() {
        let target = BigUint::from(0x80u32);
        assert_eq!(compact_from_target(&target), 0x0200_8000);
        assert_eq!(target_from_compact(0x0200_8000), Some(target));
    }

    #[test]
    fn test_harder_target_has_more_work() {
        assert!(block_proof(0x1d00_ffff) > block_proof(0x207f_ffff));
        assert_eq!(block_proof(0x207f_ffff), BigUint::from(2u32));
    }

    #[test]
    fn test_retarget_clamps_and_caps() {
        let params = ConsensusParams {
            pow_limit_bits: 0x1e0f_ffff,
            ..ConsensusParams::default()
        };
        let window = params.retarget_window as u32;
        let start_bits = 0x1d00_ffff;

        // blocks twice as fast as the spacing: target halves
        let fast: Vec<(u32, u32)> = (0..window)
            .map(|i| (10_000 - i * params.target_spacing_secs / 2, start_bits))
            .collect();
        let next = target_from_compact(next_bits(&params, ConsensusMode::ProofOfWork, &fast)).unwrap();
        let start = target_from_compact(start_bits).unwrap();
        assert!(next < start);

        // all in the same second: clamped to a quarter
        let burst: Vec<(u32, u32)> = (0..window).map(|_| (10_000, start_bits)).collect();
        let next = target_from_compact(next_bits(&params, ConsensusMode::ProofOfWork, &burst)).unwrap();
        assert!(next >= start.clone() / 4u32 - 1u32 && next <= start / 4u32);

        // very slow blocks never exceed the limit
        let slow: Vec<(u32, u32)> = (0..window)
            .map(|i| (10_000_000 - i * 100_000, params.pow_limit_bits))
            .collect();
        assert_eq!(next_bits(&params, ConsensusMode::ProofOfWork, &slow), params.pow_limit_bits);
    }

    #[test]
    fn test_short_history_uses_limit() {
        let params = ConsensusParams {
            pow_no_retargeting: false,
            ..ConsensusParams::regtest()
        };
        assert_eq!(
            next_bits(&params, ConsensusMode::ProofOfStake, &[(1, 0x1d00_ffff)]),
            params.pos_limit_bits
        );
    }
}
