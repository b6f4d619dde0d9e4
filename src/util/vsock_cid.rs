//! Deterministic `vsock_cid` derivation from an instance id (spec I4, P6).
//!
//! The value is never negotiated with the backend — it is a pure function
//! of the id so that restore (which re-derives configuration rather than
//! storing it twice) always reconstructs the same cid.

/// hash(id[:8]) * 37-mixing, modulo 2^32-6, plus 3 — lands in `[3, 2^32-4]`,
/// the range reserved values (0, 1, 2) excluded from.
pub fn derive_vsock_cid(instance_id: &str) -> u32 {
    let prefix: &str = &instance_id[..instance_id.len().min(8)];

    let mut hash: u64 = 0;
    for byte in prefix.as_bytes() {
        hash = hash.wrapping_mul(37).wrapping_add(*byte as u64);
    }

    const MODULUS: u64 = (u32::MAX as u64) - 5;
    ((hash % MODULUS) + 3) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_deterministic() {
        assert_eq!(derive_vsock_cid("abc123xyz"), derive_vsock_cid("abc123xyz"));
    }

    #[test]
    fn is_in_range() {
        for id in ["a", "abcdefgh", "abcdefghij", "", "z9z9z9z9z9z9"] {
            let cid = derive_vsock_cid(id);
            assert!(cid >= 3, "cid {cid} below reserved range for id {id:?}");
            assert!(
                cid as u64 <= (u32::MAX as u64) - 4,
                "cid {cid} above modulus ceiling for id {id:?}"
            );
        }
    }

    proptest::proptest! {
        #[test]
        fn always_deterministic_and_in_range(id in "[a-zA-Z0-9]{0,32}") {
            let a = derive_vsock_cid(&id);
            let b = derive_vsock_cid(&id);
            proptest::prop_assert_eq!(a, b);
            proptest::prop_assert!(a >= 3);
            proptest::prop_assert!(a as u64 <= (u32::MAX as u64) - 4);
        }
    }
}
