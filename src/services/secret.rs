//! Secret codec
//!
//! Random secrets, their SHA-256 digests, constant-time comparison, and the
//! text forms that travel in cookies.
//!
//! Token formats:
//! - session: `{session_id}.{base64url(secret)}`
//! - remember-me: `{lookup}.{base64url(secret)}.{base64url(user_uuid)}`
//!
//! Only digests are stored. The plaintext secret exists in the issued token
//! and nowhere else.

use anyhow::{anyhow, Result};
use data_encoding::BASE64URL_NOPAD;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Random bytes behind a remember-me lookup
pub const LOOKUP_BYTES: usize = 15;
/// Random bytes behind a session id (22 base64url characters)
pub const SESSION_ID_BYTES: usize = 16;
/// Random bytes behind every secret
pub const SECRET_BYTES: usize = 24;

/// Fill `n` bytes from the operating system CSPRNG
pub fn generate_secret(n: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; n];
    getrandom::fill(&mut buf).map_err(|e| anyhow!("Secure random source failed: {}", e))?;
    Ok(buf)
}

/// Random identifier in transport form
pub fn generate_id(n: usize) -> Result<String> {
    Ok(encode(&generate_secret(n)?))
}

pub fn hash_secret(secret: &[u8]) -> Vec<u8> {
    Sha256::digest(secret).to_vec()
}

/// Compare two byte strings in time independent of their contents.
///
/// Slices of different length compare unequal after a dummy comparison of
/// the same cost.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() == b.len() {
        a.ct_eq(b).into()
    } else {
        let _ = a.ct_eq(a);
        false
    }
}

pub fn encode(bytes: &[u8]) -> String {
    BASE64URL_NOPAD.encode(bytes)
}

pub fn decode(text: &str) -> Option<Vec<u8>> {
    BASE64URL_NOPAD.decode(text.as_bytes()).ok()
}

/// A parsed session token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionToken {
    pub session_id: String,
    pub secret: Vec<u8>,
}

impl SessionToken {
    /// Parse `id.secret`. Anything else is malformed and yields `None`.
    pub fn parse(token: &str) -> Option<Self> {
        let mut parts = token.split('.');
        let (id, secret) = (parts.next()?, parts.next()?);
        if parts.next().is_some() || id.is_empty() || secret.is_empty() {
            return None;
        }
        Some(Self {
            session_id: id.to_string(),
            secret: decode(secret)?,
        })
    }

    pub fn format(session_id: &str, secret: &[u8]) -> String {
        format!("{}.{}", session_id, encode(secret))
    }
}

/// A parsed remember-me token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RememberToken {
    pub lookup: String,
    pub secret: Vec<u8>,
    pub user_uuid: String,
}

impl RememberToken {
    /// Parse `lookup.secret.uuid`. Anything else is malformed and yields `None`.
    pub fn parse(token: &str) -> Option<Self> {
        let mut parts = token.split('.');
        let (lookup, secret, uuid) = (parts.next()?, parts.next()?, parts.next()?);
        if parts.next().is_some() || lookup.is_empty() || secret.is_empty() || uuid.is_empty() {
            return None;
        }
        let user_uuid = String::from_utf8(decode(uuid)?).ok()?;
        Some(Self {
            lookup: lookup.to_string(),
            secret: decode(secret)?,
            user_uuid,
        })
    }

    pub fn format(lookup: &str, secret: &[u8], user_uuid: &str) -> String {
        format!("{}.{}.{}", lookup, encode(secret), encode(user_uuid.as_bytes()))
    }
}

/// HMAC-SHA256 signer for cookie values.
///
/// Signed form is `{value}.{base64url(mac)}`.
#[derive(Clone)]
pub struct CookieSigner {
    mac: HmacSha256,
}

impl std::fmt::Debug for CookieSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CookieSigner([REDACTED])")
    }
}

impl CookieSigner {
    pub fn new(key: &[u8]) -> Result<Self> {
        let mac = HmacSha256::new_from_slice(key).map_err(|e| anyhow!("Invalid cookie key: {}", e))?;
        Ok(Self { mac })
    }

    /// Signer keyed with fresh random bytes. Cookies do not survive a restart.
    pub fn random() -> Result<Self> {
        Self::new(&generate_secret(32)?)
    }

    pub fn sign(&self, value: &str) -> String {
        let mut mac = self.mac.clone();
        mac.update(value.as_bytes());
        format!("{}.{}", value, encode(&mac.finalize().into_bytes()))
    }

    /// Return the original value if the signature checks out
    pub fn verify<'a>(&self, signed: &'a str) -> Option<&'a str> {
        let (value, signature) = signed.rsplit_once('.')?;
        let signature = decode(signature)?;

        let mut mac = self.mac.clone();
        mac.update(value.as_bytes());
        mac.verify_slice(&signature).ok()?;
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_generate_secret_lengths() {
        assert_eq!(generate_secret(SECRET_BYTES).unwrap().len(), 24);
        assert_eq!(generate_id(SESSION_ID_BYTES).unwrap().len(), 22);
        assert_eq!(generate_id(LOOKUP_BYTES).unwrap().len(), 20);
        assert_ne!(generate_secret(SECRET_BYTES).unwrap(), generate_secret(SECRET_BYTES).unwrap());
    }

    #[test]
    fn test_hash_secret_is_sha256() {
        let digest = hash_secret(b"abc");
        assert_eq!(digest.len(), 32);
        assert_eq!(digest[..4], [0xba, 0x78, 0x16, 0xbf]);
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"same", b"same"));
        assert!(!constant_time_eq(b"same", b"sama"));
        assert!(!constant_time_eq(b"short", b"longer"));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn test_session_token_rejects_malformed() {
        assert!(SessionToken::parse("").is_none());
        assert!(SessionToken::parse("onlyid").is_none());
        assert!(SessionToken::parse("a.b.c").is_none());
        assert!(SessionToken::parse(".secret").is_none());
        assert!(SessionToken::parse("id.").is_none());
        assert!(SessionToken::parse("id.not base64!").is_none());
    }

    #[test]
    fn test_remember_token_rejects_malformed() {
        let uuid = encode(b"u-1");
        assert!(RememberToken::parse("lookup.c2VjcmV0").is_none());
        assert!(RememberToken::parse(&format!("lookup.c2VjcmV0.{}.extra", uuid)).is_none());
        assert!(RememberToken::parse(&format!(".c2VjcmV0.{}", uuid)).is_none());
        assert!(RememberToken::parse("lookup.c2VjcmV0.***").is_none());
        // uuid segment must be UTF-8
        assert!(RememberToken::parse(&format!("lookup.c2VjcmV0.{}", encode(&[0xff, 0xfe]))).is_none());
    }

    #[test]
    fn test_remember_token_format() {
        let token = RememberToken::format("look", b"secret", "u-1");
        let parsed = RememberToken::parse(&token).unwrap();
        assert_eq!(parsed.lookup, "look");
        assert_eq!(parsed.secret, b"secret");
        assert_eq!(parsed.user_uuid, "u-1");
    }

    #[test]
    fn test_cookie_signer() {
        let signer = CookieSigner::new(b"test-secret-key-that-is-long-enough").unwrap();
        let signed = signer.sign("abc.def");

        assert_eq!(signer.verify(&signed), Some("abc.def"));

        let (value, _) = signed.rsplit_once('.').unwrap();
        assert!(signer.verify(&format!("{}.{}", value, encode(&[0; 32]))).is_none());
        assert!(signer.verify("abc.def").is_none());
        assert!(signer.verify("unsigned").is_none());

        let other = CookieSigner::new(b"another-secret-key-that-is-long-enough").unwrap();
        assert!(other.verify(&signed).is_none());
    }

    proptest! {
        #[test]
        fn session_token_roundtrip(id in "[A-Za-z0-9_-]{1,32}", secret in proptest::collection::vec(any::<u8>(), 1..64)) {
            let token = SessionToken::format(&id, &secret);
            let parsed = SessionToken::parse(&token).unwrap();
            prop_assert_eq!(parsed.session_id, id);
            prop_assert_eq!(parsed.secret, secret);
        }

        #[test]
        fn decode_never_panics(text in ".*") {
            let _ = decode(&text);
            let _ = SessionToken::parse(&text);
            let _ = RememberToken::parse(&text);
        }

        #[test]
        fn any_single_byte_flip_breaks_equality(bytes in proptest::collection::vec(any::<u8>(), 1..64), index in any::<usize>()) {
            let mut flipped = bytes.clone();
            let i = index % flipped.len();
            flipped[i] ^= 0x01;
            prop_assert!(!constant_time_eq(&hash_secret(&bytes), &hash_secret(&flipped)));
            prop_assert!(constant_time_eq(&hash_secret(&bytes), &hash_secret(&bytes)));
        }
    }
}
