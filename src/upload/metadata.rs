//! `Upload-Metadata` header codec
//!
//! Comma-separated `key base64(value)` pairs. A key may also appear alone,
//! which stands for an empty value.

use super::record::ClientMetadata;
use super::UploadError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;

/// Decode an `Upload-Metadata` header.
///
/// Any malformed entry rejects the whole header.
pub fn decode(header: &str) -> Result<ClientMetadata, UploadError> {
    let mut metadata = ClientMetadata::new();
    if header.trim().is_empty() {
        return Ok(metadata);
    }

    for entry in header.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            return Err(UploadError::BadRequest(
                "Upload-Metadata contains an empty entry".into(),
            ));
        }

        let (key, encoded) = match entry.rsplit_once(' ') {
            Some((key, value)) => (key.trim(), value.trim()),
            None => (entry, ""),
        };
        if key.is_empty() {
            return Err(UploadError::BadRequest(format!(
                "Upload-Metadata entry '{}' has no key",
                entry
            )));
        }

        let raw = STANDARD.decode(encoded).map_err(|e| {
            UploadError::BadRequest(format!("Upload-Metadata value for '{}': {}", key, e))
        })?;
        let value = String::from_utf8(raw).map_err(|_| {
            UploadError::BadRequest(format!(
                "Upload-Metadata value for '{}' is not valid UTF-8",
                key
            ))
        })?;

        metadata.insert(key, value);
    }

    Ok(metadata)
}

/// Encode metadata for the `Upload-Metadata` response header
pub fn encode(metadata: &ClientMetadata) -> String {
    metadata
        .iter()
        .map(|(k, v)| {
            if v.is_empty() {
                k.to_string()
            } else {
                format!("{} {}", k, STANDARD.encode(v.as_bytes()))
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_filename_and_type() {
        let metadata = decode("filename d29ybGRfZG9taW5hdGlvbl9wbGFuLnBkZg==,filetype YXBwbGljYXRpb24vcGRm").unwrap();
        assert_eq!(metadata.get("filename"), Some("world_domination_plan.pdf"));
        assert_eq!(metadata.get("filetype"), Some("application/pdf"));
    }

    #[test]
    fn test_decode_trims_whitespace() {
        let metadata = decode("  name   Zm9v , type YmFy ").unwrap();
        assert_eq!(metadata.get("name"), Some("foo"));
        assert_eq!(metadata.get("type"), Some("bar"));
    }

    #[test]
    fn test_decode_splits_on_last_space() {
        let metadata = decode("my key Zm9v").unwrap();
        assert_eq!(metadata.get("my key"), Some("foo"));
    }

    #[test]
    fn test_decode_key_without_value() {
        let metadata = decode("is_confidential").unwrap();
        assert_eq!(metadata.get("is_confidential"), Some(""));
    }

    #[test]
    fn test_decode_empty_header() {
        assert!(decode("").unwrap().is_empty());
    }

    #[test]
    fn test_decode_rejects_bad_base64() {
        let result = decode("filename Zm9v,filetype !!!");
        assert!(matches!(result, Err(UploadError::BadRequest(_))));
    }

    #[test]
    fn test_decode_rejects_invalid_utf8() {
        // 0xff 0xfe
        let result = decode("name //4=");
        assert!(matches!(result, Err(UploadError::BadRequest(_))));
    }

    #[test]
    fn test_decode_rejects_empty_entry() {
        assert!(decode("name Zm9v,,type YmFy").is_err());
    }

    #[test]
    fn test_encode_all_keys_in_order() {
        let metadata: ClientMetadata = [("filename", "a.txt"), ("filetype", "text/plain"), ("flag", "")]
            .into_iter()
            .collect();
        assert_eq!(
            encode(&metadata),
            "filename YS50eHQ=,filetype dGV4dC9wbGFpbg==,flag"
        );
    }
}
