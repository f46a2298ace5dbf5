//! Stable content hashing used for change suppression: memory block values,
//! project descriptions, and uploaded documentation files are only written
//! out when their hash differs from the last persisted one.

use ring::digest;

/// SHA-256 of the input, hex-encoded lowercase.
pub fn content_hash(value: &str) -> String {
    let d = digest::digest(&digest::SHA256, value.as_bytes());
    hex(d.as_ref())
}

/// SHA-256 of raw bytes (file uploads), hex-encoded lowercase.
pub fn content_hash_bytes(value: &[u8]) -> String {
    hex(digest::digest(&digest::SHA256, value).as_ref())
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic() {
        assert_eq!(content_hash("hello"), content_hash("hello"));
        assert_ne!(content_hash("hello"), content_hash("hello "));
    }

    #[test]
    fn hash_known_vector() {
        // SHA-256 of the empty string.
        assert_eq!(
            content_hash(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn bytes_and_str_agree() {
        assert_eq!(content_hash("abc"), content_hash_bytes(b"abc"));
    }
}
