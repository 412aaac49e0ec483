#![forbid(unsafe_code)]

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use thiserror::Error;
use tracing::warn;

/// Length in bytes of the symmetric key.
pub const KEY_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum CodecError {
	#[error("no encryption key configured")]
	NoKey,

	#[error("malformed ciphertext (expected nonce:cipher, base64)")]
	Malformed,

	#[error("encryption failed")]
	Encrypt,

	#[error("decryption failed")]
	Decrypt,
}

/// At-rest message codec: XChaCha20-Poly1305, wire format
/// `base64(nonce):base64(ciphertext)`.
///
/// Failure policy is configurable. Fail-open returns the input string
/// unchanged on any codec error, trading confidentiality for
/// availability; fail-closed surfaces the error so the caller rejects
/// the message. The policy applies identically to both directions.
pub struct MessageCodec {
	cipher: Option<XChaCha20Poly1305>,
	fail_open: bool,
}

impl MessageCodec {
	pub fn new(key: Option<[u8; KEY_LEN]>, fail_open: bool) -> Self {
		let cipher = key.map(|k| XChaCha20Poly1305::new(Key::from_slice(&k)));
		Self { cipher, fail_open }
	}

	/// Codec that passes everything through untouched. Used when no key
	/// is configured.
	pub fn plaintext() -> Self {
		Self {
			cipher: None,
			fail_open: true,
		}
	}

	pub fn fail_open(&self) -> bool {
		self.fail_open
	}

	pub fn encrypt(&self, plaintext: &str) -> Result<String, CodecError> {
		match self.try_encrypt(plaintext) {
			Ok(out) => Ok(out),
			Err(err) if self.fail_open => {
				warn!(error = %err, "codec: encrypt failed, storing plaintext (fail-open)");
				metrics::counter!("sala_server_codec_failures_total").increment(1);
				Ok(plaintext.to_string())
			}
			Err(err) => {
				metrics::counter!("sala_server_codec_failures_total").increment(1);
				Err(err)
			}
		}
	}

	pub fn decrypt(&self, stored: &str) -> Result<String, CodecError> {
		match self.try_decrypt(stored) {
			Ok(out) => Ok(out),
			Err(err) if self.fail_open => {
				warn!(error = %err, "codec: decrypt failed, returning stored value (fail-open)");
				metrics::counter!("sala_server_codec_failures_total").increment(1);
				Ok(stored.to_string())
			}
			Err(err) => {
				metrics::counter!("sala_server_codec_failures_total").increment(1);
				Err(err)
			}
		}
	}

	fn try_encrypt(&self, plaintext: &str) -> Result<String, CodecError> {
		let Some(cipher) = self.cipher.as_ref() else {
			return Err(CodecError::NoKey);
		};

		let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
		let ciphertext = cipher.encrypt(&nonce, plaintext.as_bytes()).map_err(|_| CodecError::Encrypt)?;

		Ok(format!("{}:{}", BASE64.encode(nonce), BASE64.encode(ciphertext)))
	}

	fn try_decrypt(&self, stored: &str) -> Result<String, CodecError> {
		let Some(cipher) = self.cipher.as_ref() else {
			return Err(CodecError::NoKey);
		};

		let (nonce_b64, cipher_b64) = stored.split_once(':').ok_or(CodecError::Malformed)?;

		let nonce_bytes = BASE64.decode(nonce_b64).map_err(|_| CodecError::Malformed)?;
		let cipher_bytes = BASE64.decode(cipher_b64).map_err(|_| CodecError::Malformed)?;

		if nonce_bytes.len() != 24 {
			return Err(CodecError::Malformed);
		}
		let nonce = XNonce::from_slice(&nonce_bytes);
		let plaintext = cipher.decrypt(nonce, cipher_bytes.as_slice()).map_err(|_| CodecError::Decrypt)?;

		String::from_utf8(plaintext).map_err(|_| CodecError::Decrypt)
	}
}

/// Decode a base64-encoded 32-byte key from configuration.
pub fn parse_key_base64(s: &str) -> Result<[u8; KEY_LEN], CodecError> {
	let bytes = BASE64.decode(s.trim()).map_err(|_| CodecError::Malformed)?;
	<[u8; KEY_LEN]>::try_from(bytes.as_slice()).map_err(|_| CodecError::Malformed)
}
