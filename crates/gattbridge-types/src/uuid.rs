//! Bluetooth UUID constants and parsing.
//!
//! Callers hand UUIDs over as strings. Besides the canonical 128-bit form,
//! the 16-bit and 32-bit short forms assigned by the Bluetooth SIG are
//! accepted and expanded onto the Bluetooth base UUID.

use uuid::{Uuid, uuid};

use crate::error::{ParseError, ParseResult};

/// Bluetooth base UUID that short-form identifiers are expanded onto.
pub const BLUETOOTH_BASE_UUID: Uuid = uuid!("00000000-0000-1000-8000-00805f9b34fb");

// --- Standard descriptors ---

/// Client Characteristic Configuration Descriptor (CCCD).
pub const CLIENT_CHARACTERISTIC_CONFIG: Uuid = uuid!("00002902-0000-1000-8000-00805f9b34fb");

/// CCCD value enabling notifications.
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];

/// CCCD value enabling indications.
pub const ENABLE_INDICATION_VALUE: [u8; 2] = [0x02, 0x00];

const BASE_BITS: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;

/// Expand a 16-bit SIG-assigned identifier.
#[must_use]
pub const fn from_short(short: u16) -> Uuid {
    from_short32(short as u32)
}

/// Expand a 32-bit SIG-assigned identifier.
#[must_use]
pub const fn from_short32(short: u32) -> Uuid {
    Uuid::from_u128(BASE_BITS | ((short as u128) << 96))
}

/// Return the 16-bit short form if `uuid` lives on the base UUID.
#[must_use]
pub fn to_short(uuid: &Uuid) -> Option<u16> {
    let bits = uuid.as_u128();
    let short = bits >> 96;
    if bits & !(0xFFFF_FFFF << 96) == BASE_BITS && short <= u128::from(u16::MAX) {
        Some(short as u16)
    } else {
        None
    }
}

/// Parse a UUID string.
///
/// Accepts `"180d"`, `"0000180d"` and `"0000180d-0000-1000-8000-00805f9b34fb"`
/// (case-insensitive, surrounding whitespace ignored).
///
/// # Examples
///
/// ```
/// use gattbridge_types::uuid::{from_short, parse_uuid};
///
/// assert_eq!(parse_uuid("180D").unwrap(), from_short(0x180d));
/// assert!(parse_uuid("not-a-uuid").is_err());
/// ```
pub fn parse_uuid(input: &str) -> ParseResult<Uuid> {
    let trimmed = input.trim();
    let is_hex = !trimmed.is_empty() && trimmed.bytes().all(|b| b.is_ascii_hexdigit());

    match trimmed.len() {
        4 if is_hex => u16::from_str_radix(trimmed, 16)
            .map(from_short)
            .map_err(|_| ParseError::InvalidUuid(input.to_string())),
        8 if is_hex => u32::from_str_radix(trimmed, 16)
            .map(from_short32)
            .map_err(|_| ParseError::InvalidUuid(input.to_string())),
        _ => Uuid::parse_str(trimmed).map_err(|_| ParseError::InvalidUuid(input.to_string())),
    }
}

/// Parse an optional filter string; empty or whitespace-only means "no filter".
pub fn parse_filter(input: Option<&str>) -> ParseResult<Option<Uuid>> {
    match input.map(str::trim) {
        None | Some("") => Ok(None),
        Some(s) => parse_uuid(s).map(Some),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_cccd_uuid() {
        assert_eq!(
            CLIENT_CHARACTERISTIC_CONFIG.to_string(),
            "00002902-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(from_short(0x2902), CLIENT_CHARACTERISTIC_CONFIG);
    }

    #[test]
    fn test_short_forms() {
        let full = uuid!("0000180d-0000-1000-8000-00805f9b34fb");
        assert_eq!(parse_uuid("180d").unwrap(), full);
        assert_eq!(parse_uuid("180D").unwrap(), full);
        assert_eq!(parse_uuid("0000180d").unwrap(), full);
        assert_eq!(parse_uuid(" 180d ").unwrap(), full);
        assert_eq!(to_short(&full), Some(0x180d));
    }

    #[test]
    fn test_full_uuid() {
        let parsed = parse_uuid("6E400001-B5A3-F393-E0A9-E50E24DCCA9E").unwrap();
        assert_eq!(parsed.to_string(), "6e400001-b5a3-f393-e0a9-e50e24dcca9e");
        assert_eq!(to_short(&parsed), None);
    }

    #[test]
    fn test_invalid_uuids() {
        for input in ["", "   ", "xyz1", "+abc", "12345", "6e400001-b5a3-f393"] {
            assert_eq!(
                parse_uuid(input),
                Err(ParseError::InvalidUuid(input.to_string())),
                "{input:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_parse_filter() {
        assert_eq!(parse_filter(None).unwrap(), None);
        assert_eq!(parse_filter(Some("")).unwrap(), None);
        assert_eq!(parse_filter(Some("  ")).unwrap(), None);
        assert_eq!(parse_filter(Some("180f")).unwrap(), Some(from_short(0x180f)));
        assert!(parse_filter(Some("zz")).is_err());
    }

    proptest! {
        #[test]
        fn prop_short_form_expands_onto_base(short in any::<u16>()) {
            let text = format!("{short:04x}");
            let parsed = parse_uuid(&text).unwrap();
            prop_assert_eq!(parsed, from_short(short));
            prop_assert_eq!(to_short(&parsed), Some(short));
            prop_assert!(parsed.to_string().ends_with("-0000-1000-8000-00805f9b34fb"));
        }

        #[test]
        fn prop_full_uuid_parses_back(bits in any::<u128>()) {
            let uuid = Uuid::from_u128(bits);
            prop_assert_eq!(parse_uuid(&uuid.to_string()).unwrap(), uuid);
        }
    }
}
