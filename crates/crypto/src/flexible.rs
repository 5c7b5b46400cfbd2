//! Decoding of IV and tag fields in whatever shape the metadata store returns.
//!
//! Order: raw bytes, JSON array text, comma-separated decimals, base64.
//! Input matching none of them decodes to an empty vector, which later fails
//! the IV length check instead of panicking here.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use chatvault_core::StoredBytes;

/// Decode a stored byte field. `None` decodes to an empty vector.
pub fn decode_stored_bytes(value: Option<&StoredBytes>) -> Vec<u8> {
    match value {
        None => Vec::new(),
        Some(StoredBytes::Array(bytes) | StoredBytes::Buffer { data: bytes }) => bytes.clone(),
        Some(StoredBytes::Text(text)) => decode_flexible_text(text),
    }
}

/// Decode a textual byte field.
pub fn decode_flexible_text(text: &str) -> Vec<u8> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    if trimmed.starts_with('[')
        && let Ok(bytes) = serde_json::from_str::<Vec<u8>>(trimmed)
    {
        return bytes;
    }
    if trimmed.contains(',')
        && let Some(bytes) = parse_decimal_list(trimmed)
    {
        return bytes;
    }
    B64.decode(trimmed).unwrap_or_default()
}

/// Encode bytes the way current writers store them.
pub fn encode_stored_bytes(bytes: &[u8]) -> StoredBytes {
    StoredBytes::Text(B64.encode(bytes))
}

fn parse_decimal_list(text: &str) -> Option<Vec<u8>> {
    text.split(',')
        .map(|part| part.trim().parse::<u8>().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_array_and_buffer_pass_through() {
        assert_eq!(
            decode_stored_bytes(Some(&StoredBytes::Array(vec![1, 2, 3]))),
            vec![1, 2, 3]
        );
        assert_eq!(
            decode_stored_bytes(Some(&StoredBytes::Buffer { data: vec![4, 5] })),
            vec![4, 5]
        );
    }

    #[test]
    fn buffer_object_deserializes_from_store_json() {
        let stored: StoredBytes =
            serde_json::from_str(r#"{"type":"Buffer","data":[10,20,30]}"#).unwrap();
        assert_eq!(decode_stored_bytes(Some(&stored)), vec![10, 20, 30]);
    }

    #[test]
    fn json_array_text() {
        assert_eq!(decode_flexible_text("[0, 255, 16]"), vec![0, 255, 16]);
    }

    #[test]
    fn csv_text() {
        assert_eq!(decode_flexible_text("7,8, 9"), vec![7, 8, 9]);
    }

    #[test]
    fn base64_text() {
        assert_eq!(decode_flexible_text("AQID"), vec![1, 2, 3]);
        let encoded = encode_stored_bytes(&[200, 201]);
        assert_eq!(decode_stored_bytes(Some(&encoded)), vec![200, 201]);
    }

    #[test]
    fn garbage_falls_back_to_empty() {
        assert!(decode_flexible_text("%%% not bytes").is_empty());
        assert!(decode_flexible_text("1,2,300").is_empty());
        assert!(decode_flexible_text("   ").is_empty());
        assert!(decode_stored_bytes(None).is_empty());
    }
}
