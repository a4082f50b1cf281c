//! CRC-16 over firmware container regions

use crate::error::{QatError, Result};
use qat_chip::fwfmt::CRC_POLY;

/// CRC-16 (polynomial `0x1021`, initial value 0, MSB first), one byte at a
/// time.
pub fn crc16(data: &[u8]) -> u16 {
    let mut reg: u32 = 0;
    for &byte in data {
        reg ^= u32::from(byte) << 8;
        for _ in 0..8 {
            reg = if reg & 0x8000 != 0 {
                (reg << 1) ^ CRC_POLY
            } else {
                reg << 1
            };
        }
        reg &= 0xffff;
    }
    #[allow(clippy::cast_possible_truncation)]
    let crc = reg as u16;
    crc
}

/// Compare the checksum stored in a header against `data`.
///
/// # Errors
///
/// Returns `MalformedFirmware` naming `what` on mismatch.
pub fn verify(what: &str, stored: u32, data: &[u8]) -> Result<()> {
    let computed = crc16(data);
    if u32::from(computed) == stored {
        Ok(())
    } else {
        Err(QatError::malformed(format!(
            "{what}: checksum {stored:#06x} does not match computed {computed:#06x}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn check_value() {
        assert_eq!(crc16(b"123456789"), 0x31c3);
        assert_eq!(crc16(&[]), 0);
    }

    #[test]
    fn verify_reports_mismatch() {
        assert!(verify("hdr", 0x31c3, b"123456789").is_ok());
        assert!(matches!(
            verify("hdr", 0x31c4, b"123456789").unwrap_err(),
            QatError::MalformedFirmware { .. }
        ));
    }

    proptest! {
        #[test]
        fn single_byte_change_is_detected(
            data in proptest::collection::vec(any::<u8>(), 1..256),
            idx in any::<prop::sample::Index>(),
            flip in 1u8..=255,
        ) {
            let i = idx.index(data.len());
            let mut bad = data.clone();
            bad[i] ^= flip;
            prop_assert_ne!(crc16(&data), crc16(&bad));
        }
    }
}
