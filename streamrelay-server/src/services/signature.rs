//! HMAC verification of inbound push deliveries.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

const PREFIX: &str = "sha256=";

fn mac_for(secret: &str, message_id: &str, timestamp: &str, body: &[u8]) -> Option<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(message_id.as_bytes());
    mac.update(timestamp.as_bytes());
    mac.update(body);
    Some(mac)
}

/// Checks `signature` (`sha256=<hex>`) against
/// `HMAC-SHA256(secret, message_id || timestamp || body)` in constant time.
pub fn verify(secret: &str, message_id: &str, timestamp: &str, body: &[u8], signature: &str) -> bool {
    let provided = signature.trim();
    let hex_part = provided.strip_prefix(PREFIX).unwrap_or(provided);
    let Ok(expected) = hex::decode(hex_part) else {
        return false;
    };

    mac_for(secret, message_id, timestamp, body)
        .is_some_and(|mac| mac.verify_slice(&expected).is_ok())
}

/// Produces the signature header value for a delivery.
pub fn sign(secret: &str, message_id: &str, timestamp: &str, body: &[u8]) -> String {
    let digest = mac_for(secret, message_id, timestamp, body)
        .map(|mac| hex::encode(mac.finalize().into_bytes()))
        .unwrap_or_default();
    format!("{PREFIX}{digest}")
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "s3cr3t";

    #[test]
    fn accepts_matching_signature() {
        let signature = sign(SECRET, "msg-1", "2024-05-01T10:00:00Z", b"{}");
        assert!(signature.starts_with("sha256="));
        assert!(verify(SECRET, "msg-1", "2024-05-01T10:00:00Z", b"{}", &signature));
    }

    #[test]
    fn rejects_tampering_with_any_signed_part() {
        let signature = sign(SECRET, "msg-1", "2024-05-01T10:00:00Z", b"{}");
        assert!(!verify(SECRET, "msg-2", "2024-05-01T10:00:00Z", b"{}", &signature));
        assert!(!verify(SECRET, "msg-1", "2024-05-01T10:00:01Z", b"{}", &signature));
        assert!(!verify(SECRET, "msg-1", "2024-05-01T10:00:00Z", b"[]", &signature));
        assert!(!verify("other", "msg-1", "2024-05-01T10:00:00Z", b"{}", &signature));
    }

    #[test]
    fn rejects_malformed_signature() {
        assert!(!verify(SECRET, "msg-1", "ts", b"{}", "sha256=not-hex"));
        assert!(!verify(SECRET, "msg-1", "ts", b"{}", ""));
    }
}
