use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

const PREFIX: &str = "sha256=";

/// Hex HMAC-SHA256 of `body`, in the form gateways send it.
pub fn sign(secret: &str, body: &[u8]) -> String {
    // HMAC accepts keys of any length.
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(body);
    format!("{PREFIX}{}", hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time check of a hex signature, with or without the `sha256=` prefix.
/// No configured secret means nothing verifies.
pub fn verify(secret: Option<&str>, body: &[u8], signature: &str) -> bool {
    let Some(secret) = secret.filter(|s| !s.is_empty()) else {
        return false;
    };
    let signature = signature.trim();
    let hex_sig = signature.strip_prefix(PREFIX).unwrap_or(signature);
    let Ok(expected) = hex::decode(hex_sig) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_own_signature_with_and_without_prefix() {
        let body = br#"{"fCnt":1}"#;
        let sig = sign("s3cret", body);
        assert!(sig.starts_with("sha256="));
        assert!(verify(Some("s3cret"), body, &sig));
        assert!(verify(Some("s3cret"), body, &sig["sha256=".len()..]));
        assert!(verify(Some("s3cret"), body, &sig.to_uppercase().replace("SHA256=", "")));
    }

    #[test]
    fn rejects_tampering_and_missing_secret() {
        let body = b"payload";
        let sig = sign("s3cret", body);
        assert!(!verify(Some("s3cret"), b"payload!", &sig));
        assert!(!verify(Some("other"), body, &sig));
        assert!(!verify(None, body, &sig));
        assert!(!verify(Some(""), body, &sign("", body)));
        assert!(!verify(Some("s3cret"), body, "not-hex"));
        assert!(!verify(Some("s3cret"), body, ""));
    }
}
