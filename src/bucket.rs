//! Deterministic bucketing of identities.
//!
//! Every gateway instance must place the same `(key, identity)` pair in the same bucket, whatever
//! language it is written in, so the hash below is fixed and must not change: concatenate
//! `key`, [`SEPARATOR`] and `identity`, fold the UTF-8 bytes with `hash = hash * 31 + byte` in
//! wrapping 32-bit signed arithmetic, then take `|hash| % 100`.

/// Number of buckets. Bucket values are in `0..BUCKETS`.
pub const BUCKETS: u32 = 100;

/// Placed between key and identity so that `("ab", "c")` and `("a", "bc")` hash differently.
pub const SEPARATOR: &str = ":";

/// Map `identity` into a bucket in `0..100` for the given `key`.
pub fn bucket(key: &str, identity: &str) -> u32 {
    let hash = [key, SEPARATOR, identity]
        .iter()
        .flat_map(|part| part.bytes())
        .fold(0i32, |hash, byte| {
            hash.wrapping_mul(31).wrapping_add(i32::from(byte))
        });

    // `unsigned_abs` keeps i32::MIN well-defined (2^31) where `abs` would overflow.
    hash.unsigned_abs() % BUCKETS
}

/// Return `true` if `identity` falls within `percentage` for `key`.
///
/// `percentage` is clamped to `[0, 100]`. `0` admits nobody and `100` admits everybody; in
/// between, bucket values `0..=percentage` pass.
pub fn within_percentage(key: &str, identity: &str, percentage: f64) -> bool {
    if percentage.is_nan() || percentage <= 0.0 {
        return false;
    }
    if percentage >= 100.0 {
        return true;
    }
    f64::from(bucket(key, identity)) <= percentage
}
