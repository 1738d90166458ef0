//! Content fingerprinting
//!
//! A fingerprint is the SHA-256 of a document's normalized text, or of its
//! raw bytes when no text was extracted. The `t:` / `b:` prefixes keep the two
//! spaces apart so a text hash can never equal a byte hash.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Lowercase, collapse every run of Unicode whitespace to one space, trim
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .map(|word| word.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Fingerprint of extracted text (whitespace and case insensitive)
pub fn fingerprint_text(text: &str) -> String {
    let digest = Sha256::digest(normalize_text(text).as_bytes());
    format!("t:{:x}", digest)
}

/// Fingerprint of raw bytes (image-only documents)
pub fn fingerprint_bytes(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    format!("b:{:x}", digest)
}

/// The ordering inputs of a duplicate-group member
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalCandidate {
    pub id: Uuid,
    /// Higher is better: native text > OCR text > image only
    pub fidelity: i64,
    pub extracted_at: DateTime<Utc>,
}

/// Pick the canonical member of a duplicate group
///
/// Highest fidelity wins, then the earliest extraction, then the smallest id,
/// so the choice is a pure function of the group's contents.
pub fn choose_canonical(members: &[CanonicalCandidate]) -> Option<Uuid> {
    members
        .iter()
        .min_by(|a, b| {
            b.fidelity
                .cmp(&a.fidelity)
                .then(a.extracted_at.cmp(&b.extracted_at))
                .then(a.id.cmp(&b.id))
        })
        .map(|c| c.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_normalization_ignores_case_and_whitespace() {
        assert_eq!(normalize_text("  Hello\tWORLD\n\n again "), "hello world again");
        assert_eq!(
            fingerprint_text("Invoice  #42\r\nDue: Friday"),
            fingerprint_text("invoice #42 due: friday")
        );
        assert_ne!(fingerprint_text("invoice 42"), fingerprint_text("invoice 43"));
    }

    #[test]
    fn test_unicode_whitespace_is_collapsed() {
        assert_eq!(normalize_text("a\u{00A0}b\u{2003}c"), "a b c");
    }

    #[test]
    fn test_text_and_byte_fingerprints_never_collide() {
        let text = fingerprint_text("abc");
        let bytes = fingerprint_bytes(b"abc");
        assert!(text.starts_with("t:"));
        assert!(bytes.starts_with("b:"));
        // Same digest over the same bytes: only the prefix tells them apart
        assert_eq!(text[2..], bytes[2..]);
        assert_ne!(text, bytes);
        assert_eq!(text.len(), 66);
    }

    #[test]
    fn test_canonical_prefers_fidelity_then_age_then_id() {
        let early = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        let a = Uuid::from_u128(1);
        let b = Uuid::from_u128(2);
        let c = Uuid::from_u128(3);

        let members = vec![
            CanonicalCandidate { id: c, fidelity: 1, extracted_at: early },
            CanonicalCandidate { id: b, fidelity: 2, extracted_at: late },
            CanonicalCandidate { id: a, fidelity: 2, extracted_at: late },
        ];
        assert_eq!(choose_canonical(&members), Some(a));

        let mut reversed = members.clone();
        reversed.reverse();
        assert_eq!(choose_canonical(&reversed), Some(a));

        let same_fidelity = vec![
            CanonicalCandidate { id: a, fidelity: 2, extracted_at: late },
            CanonicalCandidate { id: b, fidelity: 2, extracted_at: early },
        ];
        assert_eq!(choose_canonical(&same_fidelity), Some(b));
        assert_eq!(choose_canonical(&[]), None);
    }
}
