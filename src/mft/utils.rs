use chrono::{DateTime, Utc};
use encoding_rs::UTF_16LE;
use uuid::Uuid;

// 100ns intervals between 1601-01-01 and the Unix epoch
const FILETIME_UNIX_EPOCH: u64 = 116_444_736_000_000_000;

/// Converts a Windows FILETIME. Zero, the "never set" value, maps to `None`.
pub fn filetime_to_datetime(filetime: u64) -> Option<DateTime<Utc>> {
    if filetime == 0 {
        return None;
    }
    let since_epoch = filetime as i128 - FILETIME_UNIX_EPOCH as i128;
    let seconds = since_epoch.div_euclid(10_000_000) as i64;
    let nanoseconds = (since_epoch.rem_euclid(10_000_000) * 100) as u32;
    DateTime::from_timestamp(seconds, nanoseconds)
}

/// Decodes UTF-16LE on-disk names, replacing unpaired surrogates.
pub fn decode_utf16le(bytes: &[u8]) -> String {
    let (text, _) = UTF_16LE.decode_without_bom_handling(bytes);
    text.into_owned()
}

/// Reads a GUID in its mixed-endian Windows layout.
pub fn read_guid(bytes: &[u8]) -> Option<Uuid> {
    let raw: [u8; 16] = bytes.get(..16)?.try_into().ok()?;
    Some(Uuid::from_bytes_le(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filetime_conversion() {
        let dt = filetime_to_datetime(FILETIME_UNIX_EPOCH + 10_000_000).unwrap();
        assert_eq!(dt.timestamp(), 1);
        assert!(filetime_to_datetime(0).is_none());
        // dates before 1970 are still representable
        assert!(filetime_to_datetime(1).unwrap().timestamp() < 0);
    }

    #[test]
    fn utf16_names() {
        let bytes: Vec<u8> = "$MFT".encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
        assert_eq!(decode_utf16le(&bytes), "$MFT");
    }

    #[test]
    fn guid_layout() {
        let bytes = [
            0x6b, 0x87, 0x08, 0x38, 0x76, 0xc1, 0x48, 0x4e, 0xb7, 0xae, 0x04, 0x04, 0x6e, 0x6c, 0xc7, 0x52,
        ];
        let guid = read_guid(&bytes).unwrap();
        assert_eq!(guid.to_string(), "3808876b-c176-4e48-b7ae-04046e6cc752");
    }
}
