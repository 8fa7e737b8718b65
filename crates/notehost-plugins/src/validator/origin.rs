//! Origin trust: trusted hosts or an ed25519 archive signature

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::cache::ArtifactOrigin;

/// Entry holding the base64 signature over the archive digest
pub const SIGNATURE_ENTRY: &str = "META-INF/notehost.sig";

/// Digest a signer signs: SHA-256 over `name:sha256hex\n` lines of every
/// file entry except the signature, sorted by name
pub fn archive_digest(entries: &mut [(String, String)]) -> [u8; 32] {
    entries.sort();
    let mut hasher = Sha256::new();
    for (name, sha) in entries.iter() {
        hasher.update(name.as_bytes());
        hasher.update(b":");
        hasher.update(sha.as_bytes());
        hasher.update(b"\n");
    }
    hasher.finalize().into()
}

fn host_is_trusted(url: &str, trusted_hosts: &[String]) -> bool {
    let Ok(parsed) = url::Url::parse(url) else {
        return false;
    };
    let Some(host) = parsed.host_str() else {
        return false;
    };
    let host = host.to_ascii_lowercase();
    trusted_hosts.iter().any(|trusted| {
        let trusted = trusted.to_ascii_lowercase();
        host == trusted || host.ends_with(&format!(".{}", trusted))
    })
}

pub(crate) fn decode_key(key_b64: &str) -> Option<VerifyingKey> {
    let bytes = BASE64_STANDARD.decode(key_b64.trim()).ok()?;
    let array: [u8; ed25519_dalek::PUBLIC_KEY_LENGTH] = bytes.try_into().ok()?;
    VerifyingKey::from_bytes(&array).ok()
}

/// Returns `Err(reason)` when the artifact's origin is not trusted
pub(crate) fn check_origin(
    origin: &ArtifactOrigin,
    trusted_hosts: &[String],
    trusted_keys: &[String],
    signature: Option<&[u8]>,
    digest: &[u8; 32],
) -> Result<(), String> {
    let url = match origin {
        ArtifactOrigin::Local => return Ok(()),
        ArtifactOrigin::Remote { url } => url,
    };
    if host_is_trusted(url, trusted_hosts) {
        return Ok(());
    }

    let Some(raw) = signature else {
        return Err(format!(
            "'{}' is not a trusted host and the archive is unsigned",
            url
        ));
    };
    let text = std::str::from_utf8(raw).map_err(|_| "archive signature is not text".to_string())?;
    let sig_bytes = BASE64_STANDARD
        .decode(text.trim())
        .map_err(|e| format!("archive signature is not valid base64: {}", e))?;
    let signature = Signature::from_slice(&sig_bytes)
        .map_err(|e| format!("archive signature is malformed: {}", e))?;

    let mut usable_keys = 0;
    for key_b64 in trusted_keys {
        let Some(key) = decode_key(key_b64) else {
            warn!("Skipping unusable trusted key");
            continue;
        };
        usable_keys += 1;
        if key.verify(digest, &signature).is_ok() {
            return Ok(());
        }
    }

    if usable_keys == 0 {
        Err("archive is signed but no trusted keys are configured".to_string())
    } else {
        Err("archive signature does not verify against any trusted key".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};

    fn keypair() -> (SigningKey, String) {
        let signing = SigningKey::from_bytes(&[7u8; 32]);
        let public = BASE64_STANDARD.encode(signing.verifying_key().as_bytes());
        (signing, public)
    }

    fn remote(url: &str) -> ArtifactOrigin {
        ArtifactOrigin::Remote { url: url.to_string() }
    }

    #[test]
    fn test_local_origin_always_trusted() {
        assert!(check_origin(&ArtifactOrigin::Local, &[], &[], None, &[0; 32]).is_ok());
    }

    #[test]
    fn test_trusted_host_and_subdomain() {
        let hosts = vec!["plugins.notehost.dev".to_string()];
        let digest = [0; 32];
        assert!(check_origin(&remote("https://plugins.notehost.dev/a.zip"), &hosts, &[], None, &digest).is_ok());
        assert!(check_origin(&remote("https://cdn.plugins.notehost.dev/a.zip"), &hosts, &[], None, &digest).is_ok());
        assert!(check_origin(&remote("https://evilplugins.notehost.dev/a.zip"), &hosts, &[], None, &digest).is_err());
    }

    #[test]
    fn test_unsigned_untrusted_rejected() {
        let err = check_origin(&remote("https://elsewhere.example/a.zip"), &[], &[], None, &[0; 32]).unwrap_err();
        assert!(err.contains("unsigned"));
    }

    #[test]
    fn test_valid_signature_accepted() {
        let (signing, public) = keypair();
        let mut entries = vec![
            ("plugin.toml".to_string(), "ab".repeat(32)),
            ("main.wasm".to_string(), "cd".repeat(32)),
        ];
        let digest = archive_digest(&mut entries);
        let sig = BASE64_STANDARD.encode(signing.sign(&digest).to_bytes());

        let result = check_origin(
            &remote("https://elsewhere.example/a.zip"),
            &[],
            &[public],
            Some(sig.as_bytes()),
            &digest,
        );
        assert!(result.is_ok());
    }

    #[test]
    fn test_signature_over_other_content_rejected() {
        let (signing, public) = keypair();
        let sig = BASE64_STANDARD.encode(signing.sign(&[1u8; 32]).to_bytes());
        let result = check_origin(
            &remote("https://elsewhere.example/a.zip"),
            &[],
            &[public],
            Some(sig.as_bytes()),
            &[2u8; 32],
        );
        assert!(result.unwrap_err().contains("does not verify"));
    }

    #[test]
    fn test_digest_is_order_independent() {
        let mut a = vec![("b".to_string(), "2".to_string()), ("a".to_string(), "1".to_string())];
        let mut b = vec![("a".to_string(), "1".to_string()), ("b".to_string(), "2".to_string())];
        assert_eq!(archive_digest(&mut a), archive_digest(&mut b));
    }
}
