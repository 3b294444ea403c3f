//! UUID validation and canonicalisation for partition volume IDs.
//!
//! VFAT uses an 8-hex-digit "volume ID" (optionally written with a dash
//! after the fourth digit); every other filesystem here uses an
//! RFC-4122 UUID.

use super::FsKind;
use anyhow::{bail, Result};

/// Validate `input` against the UUID convention for `fs`, returning the
/// canonical form (`"ABCD-1234"` for VFAT, lowercase hyphenated for
/// everything else). An empty string is accepted and returned as-is —
/// callers generate one instead.
pub fn validate_uuid(fs: FsKind, input: &str) -> Result<String> {
    if input.is_empty() {
        return Ok(String::new());
    }
    if fs.is_vfat() {
        canonicalize_vfat(input)
    } else {
        uuid::Uuid::parse_str(input)
            .map(|u| u.hyphenated().to_string())
            .map_err(|e| anyhow::anyhow!("invalid UUID {input:?} for {fs}: {e}"))
    }
}

/// Canonicalise an already-validated UUID. Equivalent to
/// [`validate_uuid`] but named for call sites that already know the
/// input is well-formed and just want the normalised spelling.
pub fn canonicalize_uuid(fs: FsKind, input: &str) -> Result<String> {
    validate_uuid(fs, input)
}

/// Validate `input` if non-empty, otherwise generate a fresh UUID in
/// the convention `fs` expects.
pub fn validate_or_generate_uuid(fs: FsKind, input: &str) -> Result<String> {
    if !input.is_empty() {
        return validate_uuid(fs, input);
    }
    if fs.is_vfat() {
        let bytes: [u8; 4] = uuid::Uuid::new_v4().into_bytes()[0..4].try_into().unwrap();
        let hex: String = bytes.iter().map(|b| format!("{b:02X}")).collect();
        Ok(canonicalize_vfat(&hex).expect("freshly generated hex is well-formed"))
    } else {
        Ok(uuid::Uuid::new_v4().hyphenated().to_string())
    }
}

fn canonicalize_vfat(input: &str) -> Result<String> {
    let digits: String = input.chars().filter(|c| *c != '-').collect();
    if digits.len() != 8 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        bail!("invalid VFAT volume ID {input:?}: expected 8 hex digits");
    }
    // A dash is only valid right after the fourth digit.
    if let Some(pos) = input.find('-') {
        if pos != 4 || input.len() != 9 {
            bail!("invalid VFAT volume ID {input:?}: dash must follow the fourth digit");
        }
    }
    let digits = digits.to_ascii_uppercase();
    Ok(format!("{}-{}", &digits[0..4], &digits[4..8]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vfat_canonicalisation() {
        for input in ["ABCD1234", "ABCD-1234", "abcd1234", "abcd-1234"] {
            assert_eq!(validate_uuid(FsKind::Vfat, input).unwrap(), "ABCD-1234");
        }
    }

    #[test]
    fn test_vfat_rejects_garbage() {
        for bad in ["ABCD123", "ABCDEFGH", "AB-CD1234", "ABCD-123"] {
            assert!(validate_uuid(FsKind::Vfat, bad).is_err(), "expected {bad} to be rejected");
        }
    }

    #[test]
    fn test_rfc4122_roundtrip() {
        let input = "4f3f6a1e-2b7a-4e3d-9c9c-9a9a9a9a9a9a";
        assert_eq!(validate_uuid(FsKind::Ext4, input).unwrap(), input);
    }

    #[test]
    fn test_rfc4122_rejects_garbage() {
        assert!(validate_uuid(FsKind::Btrfs, "not-a-uuid").is_err());
    }

    #[test]
    fn test_empty_passthrough() {
        assert_eq!(validate_uuid(FsKind::Xfs, "").unwrap(), "");
    }
}
