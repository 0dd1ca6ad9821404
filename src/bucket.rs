use log::trace;
use sha1::{Digest, Sha1};

use crate::util::scale_fraction_to_u64_range;

const BUCKET_PREFIX_LEN: usize = 8;
const POSITION_DROPPED_BITS: u32 = 11;
const POSITION_SCALE: f64 = 9_007_199_254_740_992.0; // 2^53

/// Maps an identity value onto the full `u64` range.
///
/// The bucket is the first eight bytes of the SHA-1 digest of the identity's UTF-8 bytes, read as
/// a big-endian unsigned integer. Both the digest and the byte order are part of the rollout
/// contract: changing either would move identities between buckets and flip their results.
pub fn bucket(identity: &str) -> u64 {
    let digest = Sha1::digest(identity.as_bytes());
    let mut prefix = [0u8; BUCKET_PREFIX_LEN];
    prefix.copy_from_slice(&digest[..BUCKET_PREFIX_LEN]);
    u64::from_be_bytes(prefix)
}

/// The identity's bucket normalized into `[0, 1)`.
///
/// Only the top 53 bits of the bucket are kept, so the division is exact and never reaches 1.0.
/// Rollout decisions go through [in_rollout], which compares all 64 bits as integers.
pub fn position(identity: &str) -> f64 {
    normalize(bucket(identity))
}

fn normalize(bucket: u64) -> f64 {
    (bucket >> POSITION_DROPPED_BITS) as f64 / POSITION_SCALE
}

/// The exclusive upper bound, in bucket space, of the identities selected by a rollout of
/// `fraction`. Ranges from 0 (nobody) to 2^64 (everybody).
pub fn threshold(fraction: f64) -> u128 {
    scale_fraction_to_u64_range(fraction)
}

/// Returns true if `identity` falls inside a rollout covering `fraction` of all identities.
pub fn in_rollout(identity: &str, fraction: f64) -> bool {
    let bucket = bucket(identity);
    let threshold = threshold(fraction);
    trace!(
        "identity {:?} has bucket {:#018x}, rollout threshold is {:#x}",
        identity,
        bucket,
        threshold
    );
    u128::from(bucket) < threshold
}
