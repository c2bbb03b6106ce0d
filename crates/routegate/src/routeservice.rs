use std::time::{SystemTime, UNIX_EPOCH};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use http::HeaderName;
use router_core::prelude::*;
use serde::{Deserialize, Serialize};

pub const FORWARDED_URL: HeaderName = HeaderName::from_static("x-cf-forwarded-url");
pub const SIGNATURE: HeaderName = HeaderName::from_static("x-cf-proxy-signature");
pub const METADATA: HeaderName = HeaderName::from_static("x-cf-proxy-metadata");

#[derive(Clone)]
pub struct KeyringConfig {
	/// Newest key first; the first key encrypts, any key may decrypt.
	pub keys: Vec<[u8; 32]>,
	pub signature_timeout: Duration,
}

impl Debug for KeyringConfig {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("KeyringConfig")
			.field("keys", &self.keys.len())
			.field("signature_timeout", &self.signature_timeout)
			.finish()
	}
}

#[derive(thiserror::Error, Debug)]
pub enum SignatureError {
	#[error("route service signature expired")]
	Expired,
	#[error("route service signature invalid")]
	Invalid,
}

#[derive(Serialize, Deserialize)]
struct SignaturePayload {
	forwarded_url: String,
	expiration_time: u64,
}

#[derive(Serialize, Deserialize)]
struct SignatureMetadata {
	nonce: String,
	key_id: usize,
}

/// The decrypted return-leg envelope.
#[derive(Debug)]
pub struct ForwardedSignature {
	pub forwarded_url: String,
}

/// Signed-detour keyring. Two keys are live during rotation: the newest
/// encrypts outbound envelopes, either may decrypt arrivals.
pub struct Keyring {
	ciphers: Vec<Aes256Gcm>,
	timeout: Duration,
}

impl Keyring {
	pub fn new(cfg: &KeyringConfig) -> anyhow::Result<Keyring> {
		anyhow::ensure!(!cfg.keys.is_empty(), "at least one route service key is required");
		let ciphers = cfg
			.keys
			.iter()
			.map(|k| Aes256Gcm::new_from_slice(k).map_err(|e| anyhow::anyhow!("bad key: {e}")))
			.collect::<anyhow::Result<Vec<_>>>()?;
		Ok(Keyring {
			ciphers,
			timeout: cfg.signature_timeout,
		})
	}

	pub fn timeout(&self) -> Duration {
		self.timeout
	}

	/// Produces the (signature, metadata) header values for an outbound detour.
	pub fn sign(&self, forwarded_url: &str, now: SystemTime) -> anyhow::Result<(String, String)> {
		let expiration_time = (now + self.timeout)
			.duration_since(UNIX_EPOCH)
			.context("clock before epoch")?
			.as_secs();
		let payload = serde_json::to_vec(&SignaturePayload {
			forwarded_url: forwarded_url.to_string(),
			expiration_time,
		})?;
		let nonce_bytes: [u8; 12] = rand::random();
		let nonce = Nonce::from_slice(&nonce_bytes);
		let ciphertext = self.ciphers[0]
			.encrypt(nonce, payload.as_slice())
			.map_err(|_| anyhow::anyhow!("envelope encryption failed"))?;
		let metadata = serde_json::to_vec(&SignatureMetadata {
			nonce: URL_SAFE_NO_PAD.encode(nonce_bytes),
			key_id: 0,
		})?;
		Ok((
			URL_SAFE_NO_PAD.encode(ciphertext),
			URL_SAFE_NO_PAD.encode(metadata),
		))
	}

	/// Decrypts and validates a return-leg envelope.
	pub fn verify(
		&self,
		signature: &str,
		metadata: &str,
		now: SystemTime,
	) -> Result<ForwardedSignature, SignatureError> {
		let metadata_raw = URL_SAFE_NO_PAD
			.decode(metadata)
			.map_err(|_| SignatureError::Invalid)?;
		let metadata: SignatureMetadata =
			serde_json::from_slice(&metadata_raw).map_err(|_| SignatureError::Invalid)?;
		let nonce_raw = URL_SAFE_NO_PAD
			.decode(&metadata.nonce)
			.map_err(|_| SignatureError::Invalid)?;
		if nonce_raw.len() != 12 {
			return Err(SignatureError::Invalid);
		}
		let nonce = Nonce::from_slice(&nonce_raw);
		let ciphertext = URL_SAFE_NO_PAD
			.decode(signature)
			.map_err(|_| SignatureError::Invalid)?;

		// The named key first, then the rest of the ring for rotation.
		let named = self.ciphers.get(metadata.key_id);
		let rest = self
			.ciphers
			.iter()
			.enumerate()
			.filter(|(i, _)| *i != metadata.key_id)
			.map(|(_, c)| c);
		let plaintext = named
			.into_iter()
			.chain(rest)
			.find_map(|c| c.decrypt(nonce, ciphertext.as_slice()).ok())
			.ok_or(SignatureError::Invalid)?;

		let payload: SignaturePayload =
			serde_json::from_slice(&plaintext).map_err(|_| SignatureError::Invalid)?;
		let now_secs = now
			.duration_since(UNIX_EPOCH)
			.map_err(|_| SignatureError::Invalid)?
			.as_secs();
		if payload.expiration_time <= now_secs {
			return Err(SignatureError::Expired);
		}
		Ok(ForwardedSignature {
			forwarded_url: payload.forwarded_url,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn keyring(keys: Vec<[u8; 32]>) -> Keyring {
		Keyring::new(&KeyringConfig {
			keys,
			signature_timeout: Duration::from_secs(60),
		})
		.unwrap()
	}

	#[test]
	fn sign_verify_round_trip() {
		let kr = keyring(vec![[7u8; 32]]);
		let now = SystemTime::now();
		let (sig, md) = kr.sign("https://app.example.com/some/path?q=1", now).unwrap();
		let fwd = kr.verify(&sig, &md, now).unwrap();
		assert_eq!(fwd.forwarded_url, "https://app.example.com/some/path?q=1");
	}

	#[test]
	fn expired_signature_rejected() {
		let kr = keyring(vec![[7u8; 32]]);
		let now = SystemTime::now();
		let (sig, md) = kr.sign("https://app.example.com/", now).unwrap();
		let later = now + Duration::from_secs(61);
		assert!(matches!(kr.verify(&sig, &md, later), Err(SignatureError::Expired)));
	}

	#[test]
	fn rotation_decrypts_with_retired_key() {
		let old = keyring(vec![[1u8; 32]]);
		let now = SystemTime::now();
		let (sig, md) = old.sign("https://app.example.com/", now).unwrap();

		// After rotation the new key encrypts but the old one still verifies.
		let rotated = keyring(vec![[2u8; 32], [1u8; 32]]);
		let fwd = rotated.verify(&sig, &md, now).unwrap();
		assert_eq!(fwd.forwarded_url, "https://app.example.com/");

		// A ring without the old key cannot.
		let fresh = keyring(vec![[2u8; 32]]);
		assert!(matches!(fresh.verify(&sig, &md, now), Err(SignatureError::Invalid)));
	}

	#[test]
	fn tampered_signature_rejected() {
		let kr = keyring(vec![[7u8; 32]]);
		let now = SystemTime::now();
		let (sig, md) = kr.sign("https://app.example.com/", now).unwrap();
		let mut bytes = URL_SAFE_NO_PAD.decode(&sig).unwrap();
		bytes[0] ^= 0xff;
		let tampered = URL_SAFE_NO_PAD.encode(bytes);
		assert!(matches!(kr.verify(&tampered, &md, now), Err(SignatureError::Invalid)));
	}
}
