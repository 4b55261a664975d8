//! Property tests for framing, checksums and masks

#[cfg(test)]
mod tests {
    use netmodem_core::protocol::{crc8, header, parse_header, BinaryType, LineEnding, PacketHeader};
    use netmodem_core::transform::ByteSet;
    use proptest::prelude::*;

    fn binary_type() -> impl Strategy<Value = BinaryType> {
        prop_oneof![
            Just(BinaryType::Normal),
            Just(BinaryType::Hex),
            Just(BinaryType::Dec),
            Just(BinaryType::NormalNoChk),
        ]
    }

    #[test]
    fn test_crc8_reference_values() {
        assert_eq!(crc8(&[]), 0);
        assert_eq!(crc8(b"123456789"), 0xA1);
    }

    proptest! {
        #[test]
        fn test_header_roundtrip(bin_type in binary_type(), channel in 0u32..10_000, len in 0usize..100_000, crc: u8) {
            let eol = LineEnding::default();
            let bytes = header(bin_type, channel, len, crc, &eol);
            let parsed = parse_header(&bytes, bin_type, &eol).unwrap();
            let expected_crc = bin_type.has_checksum().then_some(crc);
            prop_assert_eq!(parsed, PacketHeader { channel, len, crc: expected_crc });
        }

        #[test]
        fn test_crc8_deterministic(data in proptest::collection::vec(any::<u8>(), 0..256)) {
            prop_assert_eq!(crc8(&data), crc8(&data.clone()));
        }

        #[test]
        fn test_mask_idempotent(
            set in proptest::collection::vec(any::<u8>(), 0..8),
            data in proptest::collection::vec(any::<u8>(), 0..128),
        ) {
            let masks = ByteSet::from_bytes(&set);
            let mut once = data.clone();
            masks.mask_out(&mut once);
            let mut twice = once.clone();
            masks.mask_out(&mut twice);
            prop_assert_eq!(&once, &twice);
            prop_assert!(once.iter().all(|b| !masks.contains(*b)));
            let kept: Vec<u8> = data.iter().copied().filter(|b| !set.contains(b)).collect();
            prop_assert_eq!(once, kept);
        }
    }
}
