//! Byte-level transforms used at the radio boundary
//!
//! Everything here is a pure function: UUID normalisation, the application
//! frame envelope (`FEFD <len> <payload> FCFB`), the forgiving UTF-8-like
//! byte/string transcoding the peripheral firmware speaks, and MAC address
//! endian formatting for advertising metadata.

use thiserror::Error;

/// Bluetooth base UUID suffix appended to 16/32-bit short forms
pub const BASE_UUID_SUFFIX: &str = "-0000-1000-8000-00805F9B34FB";

/// Frame header marker
pub const FRAME_HEADER: &str = "FEFD";

/// Frame trailer marker
pub const FRAME_TRAILER: &str = "FCFB";

/// Largest payload the two-digit length field can describe
pub const MAX_FRAME_PAYLOAD: usize = 0xFF;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("Hex payload has odd length ({0} characters)")]
    OddLength(usize),
    #[error("Invalid hex character {ch:?} at position {position}")]
    InvalidHex { ch: char, position: usize },
    #[error("Payload too large for frame: {len} bytes (max 255)")]
    PayloadTooLarge { len: usize },
    #[error("Truncated multi-byte sequence at offset {offset}")]
    TruncatedSequence { offset: usize },
}

// ============================================================================
// UUIDS
// ============================================================================

/// Expand a short-form UUID to the 128-bit Bluetooth base form, upper-cased.
///
/// 4 hex digits become `0000XXXX-0000-1000-8000-00805F9B34FB`, 8 hex digits
/// become `XXXXXXXX-0000-1000-8000-00805F9B34FB`. Anything else is only
/// upper-cased.
pub fn normalize_uuid(input: &str) -> String {
    let upper = input.to_ascii_uppercase();
    let is_hex = !upper.is_empty() && upper.chars().all(|c| c.is_ascii_hexdigit());

    match upper.len() {
        4 if is_hex => format!("0000{}{}", upper, BASE_UUID_SUFFIX),
        8 if is_hex => format!("{}{}", upper, BASE_UUID_SUFFIX),
        _ => upper,
    }
}

// ============================================================================
// HEX HELPERS
// ============================================================================

/// Left-pad `text` with `0` up to `width` characters. Longer input is returned unchanged.
pub fn pad_zero(text: &str, width: usize) -> String {
    format!("{:0>width$}", text, width = width)
}

/// Byte length of a hex string (half its character count, rounded down) as
/// at least two upper-case hex digits.
pub fn hex_byte_length(hex: &str) -> String {
    pad_zero(&format!("{:X}", hex.len() / 2), 2)
}

/// Upper-case hex rendering of raw bytes
pub fn bytes_to_hex(bytes: &[u8]) -> String {
    hex::encode_upper(bytes)
}

/// Decode a hex string (either case) to bytes
pub fn hex_to_bytes(hex_str: &str) -> Result<Vec<u8>, CodecError> {
    validate_hex(hex_str)?;
    hex::decode(hex_str).map_err(|e| match e {
        hex::FromHexError::InvalidHexCharacter { c, index } => CodecError::InvalidHex {
            ch: c,
            position: index,
        },
        _ => CodecError::OddLength(hex_str.len()),
    })
}

fn validate_hex(hex_str: &str) -> Result<(), CodecError> {
    if let Some((position, ch)) = hex_str.chars().enumerate().find(|(_, c)| !c.is_ascii_hexdigit()) {
        return Err(CodecError::InvalidHex { ch, position });
    }
    if hex_str.len() % 2 != 0 {
        return Err(CodecError::OddLength(hex_str.len()));
    }
    Ok(())
}

// ============================================================================
// FRAMING
// ============================================================================

/// Wrap a hex payload in the application envelope.
///
/// `0A` becomes `FEFD010AFCFB`. The payload is copied verbatim between the
/// length field and the trailer.
pub fn frame(payload: &str) -> Result<String, CodecError> {
    validate_hex(payload)?;

    let len = payload.len() / 2;
    if len > MAX_FRAME_PAYLOAD {
        return Err(CodecError::PayloadTooLarge { len });
    }

    let mut out = String::with_capacity(FRAME_HEADER.len() + 2 + payload.len() + FRAME_TRAILER.len());
    out.push_str(FRAME_HEADER);
    out.push_str(&hex_byte_length(payload));
    out.push_str(payload);
    out.push_str(FRAME_TRAILER);
    Ok(out)
}

// ============================================================================
// TEXT TRANSCODING
// ============================================================================

/// Number of leading one bits of a lead byte, when that run is terminated by
/// a zero inside the byte (`1^k 0 ...`).
fn lead_ones(byte: u8) -> Option<usize> {
    let ones = byte.leading_ones() as usize;
    if ones < 8 {
        Some(ones)
    } else {
        None
    }
}

/// Decode a UTF-8-like byte sequence without validation.
///
/// Lead bytes `110xxxxx`, `1110xxxx` and `11110xxx` start 2, 3 and 4 byte
/// sequences; each following byte contributes its low six bits whatever its
/// high bits are. Other bytes map to the character with the same code. A
/// sequence that would run past the end of the buffer is not decoded: its
/// bytes are copied through one by one. Code points that are not Unicode
/// scalar values become U+FFFD.
pub fn bytes_to_text(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        match decode_sequence(bytes, i) {
            Some((ch, width)) => {
                out.push(ch);
                i += width;
            }
            None => {
                out.push(char::from(bytes[i]));
                i += 1;
            }
        }
    }

    out
}

/// Same decoding as [`bytes_to_text`], but a sequence cut off by the end of
/// the buffer is an error.
pub fn bytes_to_text_strict(bytes: &[u8]) -> Result<String, CodecError> {
    let mut out = String::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if let Some(k) = lead_ones(bytes[i]).filter(|k| (2..=4).contains(k)) {
            if i + k > bytes.len() {
                return Err(CodecError::TruncatedSequence { offset: i });
            }
        }
        match decode_sequence(bytes, i) {
            Some((ch, width)) => {
                out.push(ch);
                i += width;
            }
            None => {
                out.push(char::from(bytes[i]));
                i += 1;
            }
        }
    }

    Ok(out)
}

/// Decode the multi-byte sequence starting at `start`, if there is one.
fn decode_sequence(bytes: &[u8], start: usize) -> Option<(char, usize)> {
    let k = lead_ones(bytes[start]).filter(|k| (2..=4).contains(k))?;
    if start + k > bytes.len() {
        return None;
    }

    // Bits left after the `1^k 0` prefix
    let lead_bits = 7 - k as u32;
    let mut code = u32::from(bytes[start]) & ((1 << lead_bits) - 1);
    for byte in &bytes[start + 1..start + k] {
        code = (code << 6) | u32::from(byte & 0x3F);
    }

    Some((char::from_u32(code).unwrap_or(char::REPLACEMENT_CHARACTER), k))
}

/// Encode text with the same 1-4 byte layout [`bytes_to_text`] reads.
pub fn text_to_bytes(text: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(text.len());

    for ch in text.chars() {
        let c = ch as u32;
        if c >= 0x1_0000 {
            bytes.push((((c >> 18) & 0x07) | 0xF0) as u8);
            bytes.push((((c >> 12) & 0x3F) | 0x80) as u8);
            bytes.push((((c >> 6) & 0x3F) | 0x80) as u8);
            bytes.push(((c & 0x3F) | 0x80) as u8);
        } else if c >= 0x800 {
            bytes.push((((c >> 12) & 0x0F) | 0xE0) as u8);
            bytes.push((((c >> 6) & 0x3F) | 0x80) as u8);
            bytes.push(((c & 0x3F) | 0x80) as u8);
        } else if c >= 0x80 {
            bytes.push((((c >> 6) & 0x1F) | 0xC0) as u8);
            bytes.push(((c & 0x3F) | 0x80) as u8);
        } else {
            bytes.push(c as u8);
        }
    }

    bytes
}

// ============================================================================
// MAC ADDRESSES
// ============================================================================

/// Reverse the octet order of a hex string and join octets with `:`.
///
/// `80EACA000001` becomes `01:00:00:CA:EA:80`. A dangling leading nibble on
/// odd-length input is dropped.
pub fn swap_endian_colonized(hex_str: &str) -> String {
    let chars: Vec<char> = hex_str.chars().collect();
    let skip = chars.len() % 2;

    chars[skip..]
        .chunks(2)
        .rev()
        .map(|octet| octet.iter().collect::<String>())
        .collect::<Vec<_>>()
        .join(":")
        .to_uppercase()
}

/// Extract a readable MAC from the raw manufacturer address some platforms
/// put in advertising data (e.g. `<80eaca 000001>`).
pub fn mac_from_advertising(raw: &str) -> Option<String> {
    let cleaned: String = raw.chars().filter(|c| !matches!(c, '<' | '>' | ' ')).collect();
    if cleaned.is_empty() {
        return None;
    }
    Some(swap_endian_colonized(&cleaned))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_normalize_short_uuids() {
        assert_eq!(normalize_uuid("ffe1"), "0000FFE1-0000-1000-8000-00805F9B34FB");
        assert_eq!(normalize_uuid("0000ffe0"), "0000FFE0-0000-1000-8000-00805F9B34FB");
    }

    #[test]
    fn test_normalize_full_uuid_only_uppercases() {
        let full = "6e400001-b5a3-f393-e0a9-e50e24dcca9e";
        assert_eq!(normalize_uuid(full), "6E400001-B5A3-F393-E0A9-E50E24DCCA9E");
    }

    #[test]
    fn test_normalize_non_hex_short_input() {
        assert_eq!(normalize_uuid("zz12"), "ZZ12");
        assert_eq!(normalize_uuid(""), "");
    }

    #[test]
    fn test_frame_single_byte() {
        assert_eq!(frame("0A").unwrap(), "FEFD010AFCFB");
    }

    #[test]
    fn test_frame_empty_payload() {
        assert_eq!(frame("").unwrap(), "FEFD00FCFB");
    }

    #[test]
    fn test_frame_rejects_odd_length() {
        assert_eq!(frame("ABC"), Err(CodecError::OddLength(3)));
    }

    #[test]
    fn test_frame_rejects_non_hex() {
        assert_eq!(frame("0G"), Err(CodecError::InvalidHex { ch: 'G', position: 1 }));
    }

    #[test]
    fn test_frame_rejects_overflow() {
        let payload = "00".repeat(256);
        assert_eq!(frame(&payload), Err(CodecError::PayloadTooLarge { len: 256 }));
        assert!(frame(&"00".repeat(255)).is_ok());
    }

    #[test]
    fn test_hex_byte_length() {
        assert_eq!(hex_byte_length("0A0B0C"), "03");
        assert_eq!(hex_byte_length("ABC"), "01");
        assert_eq!(hex_byte_length(&"00".repeat(300)), "12C");
    }

    #[test]
    fn test_pad_zero() {
        assert_eq!(pad_zero("a", 2), "0a");
        assert_eq!(pad_zero("abc", 2), "abc");
        assert_eq!(pad_zero("", 4), "0000");
    }

    #[test]
    fn test_swap_endian_colonized() {
        assert_eq!(swap_endian_colonized("80EACA000001"), "01:00:00:CA:EA:80");
        assert_eq!(swap_endian_colonized("80eaca000001"), "01:00:00:CA:EA:80");
        assert_eq!(swap_endian_colonized(""), "");
        assert_eq!(swap_endian_colonized("ABC"), "BC");
    }

    #[test]
    fn test_mac_from_advertising() {
        assert_eq!(
            mac_from_advertising("<010000 caea80>").as_deref(),
            Some("80:EA:CA:00:00:01")
        );
        assert_eq!(mac_from_advertising("<>"), None);
        assert_eq!(mac_from_advertising(""), None);
    }

    #[test]
    fn test_bytes_to_text_multibyte() {
        // "é" = C3 A9, "中" = E4 B8 AD, "😀" = F0 9F 98 80
        assert_eq!(bytes_to_text(&[0xC3, 0xA9]), "é");
        assert_eq!(bytes_to_text(&[0xE4, 0xB8, 0xAD]), "中");
        assert_eq!(bytes_to_text(&[0xF0, 0x9F, 0x98, 0x80]), "😀");
        assert_eq!(bytes_to_text(&[0x48, 0xC3, 0xA9, 0x21]), "Hé!");
    }

    #[test]
    fn test_bytes_to_text_passes_through_non_lead_bytes() {
        // Stray continuation byte and 0xFF are copied as single character codes
        assert_eq!(bytes_to_text(&[0x80]), "\u{80}");
        assert_eq!(bytes_to_text(&[0xFF]), "\u{FF}");
    }

    #[test]
    fn test_bytes_to_text_does_not_validate_continuations() {
        // 0x41 is not a continuation byte; its low six bits are used anyway
        assert_eq!(bytes_to_text(&[0xC2, 0x41]), "\u{81}");
    }

    #[test]
    fn test_bytes_to_text_truncated_tail() {
        assert_eq!(bytes_to_text(&[0x41, 0xE4, 0xB8]), "A\u{E4}\u{B8}");
        assert_eq!(
            bytes_to_text_strict(&[0x41, 0xE4, 0xB8]),
            Err(CodecError::TruncatedSequence { offset: 1 })
        );
    }

    #[test]
    fn test_bytes_to_text_surrogate_becomes_replacement() {
        // ED A0 80 encodes U+D800
        assert_eq!(bytes_to_text(&[0xED, 0xA0, 0x80]), "\u{FFFD}");
    }

    #[test]
    fn test_text_to_bytes_matches_utf8() {
        let text = "Hé中😀";
        assert_eq!(text_to_bytes(text), text.as_bytes());
    }

    #[test]
    fn test_hex_helpers() {
        assert_eq!(bytes_to_hex(&[0x0a, 0xff]), "0AFF");
        assert_eq!(hex_to_bytes("0aFF").unwrap(), vec![0x0A, 0xFF]);
        assert!(matches!(hex_to_bytes("0"), Err(CodecError::OddLength(1))));
        assert!(matches!(hex_to_bytes("zz"), Err(CodecError::InvalidHex { .. })));
    }

    proptest! {
        #[test]
        fn prop_short_uuids_expand_to_canonical(short in "[0-9a-fA-F]{4}|[0-9a-fA-F]{8}") {
            let full = normalize_uuid(&short);
            prop_assert_eq!(full.len(), 36);
            prop_assert!(full.ends_with(BASE_UUID_SUFFIX));
        }

        #[test]
        fn prop_full_uuid_is_idempotent(uuid in "[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}") {
            let once = normalize_uuid(&uuid);
            prop_assert_eq!(&once, &uuid.to_uppercase());
            prop_assert_eq!(normalize_uuid(&once), once.clone());
        }

        #[test]
        fn prop_frame_length_field(payload in proptest::collection::vec(any::<u8>(), 0..=255)) {
            let framed = frame(&bytes_to_hex(&payload)).unwrap();
            prop_assert!(framed.starts_with(FRAME_HEADER));
            prop_assert!(framed.ends_with(FRAME_TRAILER));
            let len = usize::from_str_radix(&framed[4..6], 16).unwrap();
            prop_assert_eq!(len, payload.len());
        }

        #[test]
        fn prop_ascii_passes_through(bytes in proptest::collection::vec(0u8..0x80, 0..64)) {
            let text = bytes_to_text(&bytes);
            let expected: String = bytes.iter().map(|b| char::from(*b)).collect();
            prop_assert_eq!(text, expected);
        }

        #[test]
        fn prop_text_round_trips(text in "\\PC{0,32}") {
            prop_assert_eq!(bytes_to_text(&text_to_bytes(&text)), text);
        }
    }
}
