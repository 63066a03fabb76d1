//! PKCE S256 challenge generation and verification
//!
//! Implements the `S256` method of RFC 7636 for both sides of the flow: the
//! login client generates a verifier/challenge pair, and the authorization
//! server recomputes the challenge when the code is exchanged.
//!
//! # References
//!
//! - RFC 7636 <https://www.rfc-editor.org/rfc/rfc7636>

use base64::Engine as _;
use sha2::{Digest, Sha256};

use crate::auth::discovery::AuthorizationServerMetadata;
use crate::error::FlowError;

/// The only challenge method this crate sends or accepts.
pub const S256: &str = "S256";

/// A PKCE S256 challenge pair.
///
/// # Examples
///
/// ```
/// use gatehouse::auth::pkce;
///
/// let pair = pkce::generate();
/// assert_eq!(pair.verifier.len(), 43);
/// assert!(pkce::verify(&pair.verifier, &pair.challenge));
/// ```
#[derive(Debug, Clone)]
pub struct PkceChallenge {
    /// 32 random bytes, base64url without padding (43 characters).
    pub verifier: String,

    /// base64url(SHA-256(verifier)), sent with the authorization request.
    pub challenge: String,
}

/// Generates a fresh verifier and its S256 challenge.
pub fn generate() -> PkceChallenge {
    use rand::RngCore as _;

    let mut random_bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut random_bytes);
    let verifier = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(random_bytes);
    let challenge = challenge_for(&verifier);

    PkceChallenge {
        verifier,
        challenge,
    }
}

/// Computes the S256 challenge for `verifier` (RFC 7636 section 4.2).
pub fn challenge_for(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest.as_slice())
}

/// Returns `true` when `verifier` hashes to `challenge`.
///
/// Verifiers outside the RFC 7636 length bounds (43..=128) never match.
pub fn verify(verifier: &str, challenge: &str) -> bool {
    if !(43..=128).contains(&verifier.len()) {
        return false;
    }
    let computed = challenge_for(verifier);
    constant_time_eq(computed.as_bytes(), challenge.as_bytes())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Checks that an authorization server can accept S256 challenges.
///
/// Servers that omit `code_challenge_methods_supported` are tolerated with a
/// warning, since several OIDC providers accept PKCE without advertising it.
///
/// # Errors
///
/// Returns [`FlowError::Discovery`] when the server lists methods and
/// `S256` is not among them.
pub fn verify_s256_support(metadata: &AuthorizationServerMetadata) -> Result<(), FlowError> {
    match &metadata.code_challenge_methods_supported {
        None => {
            tracing::warn!(
                issuer = %metadata.issuer,
                "Authorization server does not advertise PKCE methods, sending S256 anyway"
            );
            Ok(())
        }
        Some(methods) if methods.iter().any(|m| m == S256) => Ok(()),
        Some(methods) => Err(FlowError::Discovery(format!(
            "authorization server does not support PKCE S256 (supported: {})",
            methods.join(", ")
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_metadata(methods: Option<Vec<String>>) -> AuthorizationServerMetadata {
        AuthorizationServerMetadata {
            issuer: "https://auth.example.com".to_string(),
            authorization_endpoint: "https://auth.example.com/authorize".to_string(),
            token_endpoint: "https://auth.example.com/token".to_string(),
            code_challenge_methods_supported: methods,
            ..Default::default()
        }
    }

    #[test]
    fn test_s256_known_answer_rfc7636_appendix_b() {
        assert_eq!(
            challenge_for("dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk"),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[test]
    fn test_generate_produces_unique_verifiers() {
        let a = generate();
        let b = generate();
        assert_ne!(a.verifier, b.verifier);
        assert!(!a.verifier.contains('='));
        assert!(!a.challenge.contains('+') && !a.challenge.contains('/'));
    }

    #[test]
    fn test_verify_rejects_wrong_verifier() {
        let pair = generate();
        let other = generate();
        assert!(!verify(&other.verifier, &pair.challenge));
    }

    #[test]
    fn test_verify_rejects_short_verifier() {
        let short = "abc";
        assert!(!verify(short, &challenge_for(short)));
    }

    #[test]
    fn test_verify_s256_support_accepts_when_present() {
        let metadata = make_metadata(Some(vec!["plain".to_string(), "S256".to_string()]));
        assert!(verify_s256_support(&metadata).is_ok());
    }

    #[test]
    fn test_verify_s256_support_tolerates_missing_list() {
        assert!(verify_s256_support(&make_metadata(None)).is_ok());
    }

    #[test]
    fn test_verify_s256_support_rejects_plain_only() {
        let metadata = make_metadata(Some(vec!["plain".to_string()]));
        assert!(matches!(
            verify_s256_support(&metadata),
            Err(FlowError::Discovery(_))
        ));
    }
}
