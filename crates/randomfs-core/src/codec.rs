//! XOR block codec.
//!
//! `stored = payload ^ mask_1 ^ ... ^ mask_n`. XOR is its own inverse, so
//! decoding runs the same fold with the stored block in place of the payload.

/// Fold `src` into `dst` byte by byte.
///
/// # Panics
/// Panics if the two slices differ in length.
pub fn xor_into(dst: &mut [u8], src: &[u8]) {
    assert_eq!(
        dst.len(),
        src.len(),
        "xor operands must have equal length"
    );
    for (d, s) in dst.iter_mut().zip(src) {
        *d ^= *s;
    }
}

/// Combine a payload block with its masks into a stored block.
///
/// # Panics
/// Panics if any mask length differs from the payload length.
pub fn encode<M: AsRef<[u8]>>(payload: &[u8], masks: &[M]) -> Vec<u8> {
    let mut out = payload.to_vec();
    for mask in masks {
        xor_into(&mut out, mask.as_ref());
    }
    out
}

/// Recover a payload block from a stored block and the masks used to encode it.
///
/// # Panics
/// Panics if any mask length differs from the stored block length.
pub fn decode<M: AsRef<[u8]>>(stored: &[u8], masks: &[M]) -> Vec<u8> {
    encode(stored, masks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn block_and_masks() -> impl Strategy<Value = (Vec<u8>, Vec<Vec<u8>>)> {
        (1usize..2048).prop_flat_map(|len| {
            (
                prop::collection::vec(any::<u8>(), len),
                prop::collection::vec(prop::collection::vec(any::<u8>(), len), 0..4),
            )
        })
    }

    #[test]
    fn no_masks_is_identity() {
        let empty: [&[u8]; 0] = [];
        assert_eq!(encode(b"plain", &empty), b"plain".to_vec());
    }

    #[test]
    fn single_mask_changes_bytes() {
        let stored = encode(b"HelloWorld", &[[0xffu8; 10]]);
        assert_ne!(stored, b"HelloWorld".to_vec());
        assert_eq!(decode(&stored, &[[0xffu8; 10]]), b"HelloWorld".to_vec());
    }

    #[test]
    #[should_panic(expected = "equal length")]
    fn length_mismatch_panics() {
        encode(b"four", &[b"three".as_slice()]);
    }

    proptest! {
        #[test]
        fn prop_decode_inverts_encode((payload, masks) in block_and_masks()) {
            let stored = encode(&payload, &masks);
            prop_assert_eq!(decode(&stored, &masks), payload);
        }

        #[test]
        fn prop_mask_order_is_irrelevant((payload, masks) in block_and_masks()) {
            let mut reversed = masks.clone();
            reversed.reverse();
            prop_assert_eq!(encode(&payload, &masks), encode(&payload, &reversed));
        }
    }
}
