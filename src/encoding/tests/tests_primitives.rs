//! Tests for fixed-width primitive encoding: integers and byte arrays.

use crate::encoding::*;

// ------------------------------------------------------------------------------------------------
// Integers
// ------------------------------------------------------------------------------------------------

#[test]
fn roundtrip_u8() {
    let bytes = encode_to_vec(&0xABu8).unwrap();
    assert_eq!(bytes, [0xAB]);
    let (decoded, consumed) = decode_from_slice::<u8>(&bytes).unwrap();
    assert_eq!(decoded, 0xAB);
    assert_eq!(consumed, 1);
}

#[test]
fn u16_is_little_endian() {
    let bytes = encode_to_vec(&0x1234u16).unwrap();
    assert_eq!(bytes, [0x34, 0x12]);
    let (decoded, consumed) = decode_from_slice::<u16>(&bytes).unwrap();
    assert_eq!(decoded, 0x1234);
    assert_eq!(consumed, 2);
}

#[test]
fn u32_is_little_endian() {
    let bytes = encode_to_vec(&0xDEAD_BEEFu32).unwrap();
    assert_eq!(bytes, [0xEF, 0xBE, 0xAD, 0xDE]);
    let (decoded, _) = decode_from_slice::<u32>(&bytes).unwrap();
    assert_eq!(decoded, 0xDEAD_BEEF);
}

#[test]
fn u64_is_little_endian() {
    let val: u64 = 0x0102_0304_0506_0708;
    let bytes = encode_to_vec(&val).unwrap();
    assert_eq!(bytes, [0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]);
    let (decoded, consumed) = decode_from_slice::<u64>(&bytes).unwrap();
    assert_eq!(decoded, val);
    assert_eq!(consumed, 8);
}

#[test]
fn u64_extremes() {
    for val in [0u64, 1, u64::MAX - 1, u64::MAX] {
        let bytes = encode_to_vec(&val).unwrap();
        assert_eq!(decode_from_slice::<u64>(&bytes).unwrap().0, val);
    }
}

// ------------------------------------------------------------------------------------------------
// Truncated input
// ------------------------------------------------------------------------------------------------

#[test]
fn short_buffer_reports_needed_and_available() {
    let err = decode_from_slice::<u64>(&[1, 2, 3]).unwrap_err();
    match err {
        EncodingError::UnexpectedEof { needed, available } => {
            assert_eq!(needed, 8);
            assert_eq!(available, 3);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn empty_buffer_fails_for_every_width() {
    assert!(decode_from_slice::<u8>(&[]).is_err());
    assert!(decode_from_slice::<u16>(&[]).is_err());
    assert!(decode_from_slice::<u32>(&[]).is_err());
    assert!(decode_from_slice::<u64>(&[]).is_err());
}

// ------------------------------------------------------------------------------------------------
// Fixed arrays
// ------------------------------------------------------------------------------------------------

#[test]
fn fixed_array_has_no_length_prefix() {
    let arr = [9u8, 8, 7, 6];
    let bytes = encode_to_vec(&arr).unwrap();
    assert_eq!(bytes, arr);
    let (decoded, consumed) = decode_from_slice::<[u8; 4]>(&bytes).unwrap();
    assert_eq!(decoded, arr);
    assert_eq!(consumed, 4);
}

#[test]
fn len_to_u32_rejects_oversized_lengths() {
    assert_eq!(len_to_u32(17).unwrap(), 17);
    #[cfg(target_pointer_width = "64")]
    assert!(matches!(
        len_to_u32(u32::MAX as usize + 1),
        Err(EncodingError::LengthOverflow(_))
    ));
}
