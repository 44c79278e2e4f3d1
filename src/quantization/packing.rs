//! INT4 nibble packing.
//!
//! Layout matches ONNX INT4 storage: element `2i` in the low nibble of byte
//! `i`, element `2i + 1` in the high nibble. An odd trailing element gets a
//! zero high nibble.

/// Pack signed 4-bit values (`[-8, 7]`, one per `i8`) two per byte.
pub fn pack_int4(values: &[i8]) -> Vec<u8> {
    values
        .chunks(2)
        .map(|pair| {
            let lo = pair[0] as u8 & 0x0F;
            let hi = pair.get(1).map_or(0, |&v| v as u8 & 0x0F);
            (hi << 4) | lo
        })
        .collect()
}

/// Inverse of [`pack_int4`]: sign-extend `len` nibbles from `packed`.
pub fn unpack_int4(packed: &[u8], len: usize) -> Vec<i8> {
    (0..len)
        .map(|i| {
            let byte = packed.get(i / 2).copied().unwrap_or(0);
            let nibble = if i % 2 == 0 { byte & 0x0F } else { byte >> 4 };
            ((nibble << 4) as i8) >> 4
        })
        .collect()
}
