//! HMAC message signing.
//!
//! The signature is a lowercase hex digest over the ordered concatenation of
//! the signed parts. A `Signer` is immutable after construction; every call
//! clones the pre-keyed MAC, so one instance can be shared across threads.

use hmac::{Hmac, Mac};
use sha2::{Sha256, Sha384, Sha512};
use std::fmt;

use crate::types::{Error, Result};

#[derive(Clone)]
enum KeyedMac {
    Sha256(Hmac<Sha256>),
    Sha384(Hmac<Sha384>),
    Sha512(Hmac<Sha512>),
}

fn digest_parts<M: Mac + Clone>(mac: &M, parts: &[&[u8]]) -> Vec<u8> {
    let mut mac = mac.clone();
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().to_vec()
}

fn verify_parts<M: Mac + Clone>(mac: &M, parts: &[&[u8]], expected: &[u8]) -> bool {
    let mut mac = mac.clone();
    for part in parts {
        mac.update(part);
    }
    mac.verify_slice(expected).is_ok()
}

/// Computes and checks message signatures.
#[derive(Clone)]
pub struct Signer {
    scheme: String,
    mac: Option<KeyedMac>,
}

impl Signer {
    /// Build a signer for `scheme` (e.g. `hmac-sha256`). An empty key yields a
    /// signer that produces empty signatures and accepts anything.
    pub fn new(scheme: &str, key: &[u8]) -> Result<Self> {
        if key.is_empty() {
            return Ok(Self::disabled());
        }

        let invalid = |e: hmac::digest::InvalidLength| Error::signature(format!("invalid key: {}", e));
        let mac = match scheme {
            "hmac-sha256" => KeyedMac::Sha256(Hmac::<Sha256>::new_from_slice(key).map_err(invalid)?),
            "hmac-sha384" => KeyedMac::Sha384(Hmac::<Sha384>::new_from_slice(key).map_err(invalid)?),
            "hmac-sha512" => KeyedMac::Sha512(Hmac::<Sha512>::new_from_slice(key).map_err(invalid)?),
            other => {
                return Err(Error::signature(format!(
                    "unsupported signature scheme: {}",
                    other
                )))
            }
        };

        Ok(Self {
            scheme: scheme.to_string(),
            mac: Some(mac),
        })
    }

    /// A signer that never signs.
    pub fn disabled() -> Self {
        Self {
            scheme: String::new(),
            mac: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.mac.is_some()
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Hex signature over `parts`. Empty when signing is disabled.
    pub fn sign(&self, parts: &[&[u8]]) -> String {
        let digest = match &self.mac {
            None => return String::new(),
            Some(KeyedMac::Sha256(mac)) => digest_parts(mac, parts),
            Some(KeyedMac::Sha384(mac)) => digest_parts(mac, parts),
            Some(KeyedMac::Sha512(mac)) => digest_parts(mac, parts),
        };
        hex::encode(digest)
    }

    /// Constant-time check of `signature` against `parts`.
    pub fn verify(&self, signature: &[u8], parts: &[&[u8]]) -> Result<()> {
        let Some(mac) = &self.mac else {
            return Ok(());
        };

        let expected = hex::decode(signature)
            .map_err(|e| Error::signature(format!("signature is not hex: {}", e)))?;
        let valid = match mac {
            KeyedMac::Sha256(mac) => verify_parts(mac, parts, &expected),
            KeyedMac::Sha384(mac) => verify_parts(mac, parts, &expected),
            KeyedMac::Sha512(mac) => verify_parts(mac, parts, &expected),
        };

        if valid {
            Ok(())
        } else {
            Err(Error::signature("signature mismatch"))
        }
    }
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signer")
            .field("scheme", &self.scheme)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}
