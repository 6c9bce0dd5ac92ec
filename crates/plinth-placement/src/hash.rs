// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Rucket Authors

//! Hash functions for rendezvous placement.
//!
//! The hash must be:
//! - Deterministic across processes and restarts (fixed SipHash keys)
//! - Uniform, so that draws are unbiased
//! - Fast, since every placement decision hashes every candidate node

use std::hash::{Hash, Hasher};

use siphasher::sip::SipHasher13;

/// Fixed key shared by every node so that all of them rank alike.
const PLACEMENT_HASH_KEY: (u64, u64) = (0x0706_0504_0302_0100, 0x0f0e_0d0c_0b0a_0908);

/// Hashes an object key to a 64-bit seed.
#[inline]
#[must_use]
pub fn key_hash(key: &str) -> u64 {
    let mut hasher = SipHasher13::new_with_keys(PLACEMENT_HASH_KEY.0, PLACEMENT_HASH_KEY.1);
    key.hash(&mut hasher);
    hasher.finish()
}

/// Hashes a key seed together with a node id.
#[inline]
#[must_use]
pub fn node_hash(seed: u64, node_id: &str) -> u64 {
    let mut hasher = SipHasher13::new_with_keys(PLACEMENT_HASH_KEY.0, PLACEMENT_HASH_KEY.1);
    seed.hash(&mut hasher);
    node_id.hash(&mut hasher);
    hasher.finish()
}

/// Straw2 draw of `node_id` for the key whose seed is `seed`.
///
/// Each node draws `weight / -ln(u)` with `u` uniform in (0, 1) derived from
/// the hash; the longest straws win. Adding or removing a node only moves
/// the keys that node wins or loses.
#[must_use]
pub fn straw2_draw(seed: u64, node_id: &str, weight: f64) -> f64 {
    if weight <= 0.0 {
        return f64::NEG_INFINITY;
    }
    // Top 53 bits, centered in their bucket, so u is never 0 or 1.
    let bits = node_hash(seed, node_id) >> 11;
    let u = (bits as f64 + 0.5) / (1u64 << 53) as f64;
    weight * (-u.ln()).recip()
}
