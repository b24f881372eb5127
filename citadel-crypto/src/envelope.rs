//! Envelope format (v1)
//!
//! Byte layout (big-endian lengths), Base64-encoded on the wire:
//!
//!   version[1] || keyIdLen[4] || keyId[keyIdLen] || dekBlockLen[4]
//!   || dekBlock[dekBlockLen] || dataIv[12] || ct+tag[..]
//!
//! dekBlock = dekIv[12] || encDek (encDek = AES-256-GCM(dek) under the
//! caller-supplied 32-byte key, tag appended).
//!
//! The DEK is 32 random bytes, fresh on every encrypt, and never retained
//! past the call that produced it.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use crate::aead::{aead_open, aead_seal, random_bytes, random_nonce};
use crate::error::{CryptoError, CryptoValidationError, MalformedEnvelopeError};
use crate::hkdf;

pub const PROTOCOL_VERSION: u8 = 1;

/// Fixed prefix mixed into every purpose-derived KEK's HKDF `info`.
pub const CONST_PREFIX: &[u8] = b"citadel-vault-kek-v1|";

pub const PURPOSE_SECRET_STORAGE: &str = "secret-storage";
pub const PURPOSE_TRANSIT: &str = "transit";
pub const PURPOSE_DYNAMIC_CREDENTIALS: &str = "dynamic-credentials";

pub const DEFAULT_KEY_ID: &str = "vault-master-v1";

const IV_BYTES: usize = 12;
const HEADER_LEN_MIN: usize = 1 + 4; // version + keyIdLen
const LEN_FIELD_MIN: usize = 12;
const LEN_FIELD_MAX: usize = 1000;

/// Borrowed view of a parsed envelope's fields.
struct EnvelopeParts<'a> {
    key_id: &'a str,
    dek_iv: &'a [u8],
    enc_dek: &'a [u8],
    data_iv: &'a [u8],
    ct_and_tag: &'a [u8],
}

fn decode_envelope(raw: &[u8]) -> Result<EnvelopeParts<'_>, MalformedEnvelopeError> {
    if raw.len() < HEADER_LEN_MIN {
        return Err(MalformedEnvelopeError::new("envelope shorter than header"));
    }
    let version = raw[0];
    if version != PROTOCOL_VERSION {
        return Err(MalformedEnvelopeError::new(format!(
            "unsupported envelope version {version}"
        )));
    }

    let mut pos = 1;
    let key_id_len = u32::from_be_bytes(raw[pos..pos + 4].try_into().unwrap()) as usize;
    pos += 4;
    if key_id_len == 0 || key_id_len > LEN_FIELD_MAX {
        return Err(MalformedEnvelopeError::new("keyId length out of bounds"));
    }
    if raw.len() < pos + key_id_len {
        return Err(MalformedEnvelopeError::new("envelope truncated in keyId"));
    }
    let key_id = std::str::from_utf8(&raw[pos..pos + key_id_len])
        .map_err(|_| MalformedEnvelopeError::new("keyId is not valid UTF-8"))?;
    pos += key_id_len;

    if raw.len() < pos + 4 {
        return Err(MalformedEnvelopeError::new("envelope truncated before dekBlockLen"));
    }
    let dek_block_len = u32::from_be_bytes(raw[pos..pos + 4].try_into().unwrap()) as usize;
    pos += 4;
    if !(LEN_FIELD_MIN..=LEN_FIELD_MAX).contains(&dek_block_len) {
        return Err(MalformedEnvelopeError::new("dekBlock length out of bounds"));
    }
    if raw.len() < pos + dek_block_len {
        return Err(MalformedEnvelopeError::new("envelope truncated in dekBlock"));
    }
    if dek_block_len < IV_BYTES {
        return Err(MalformedEnvelopeError::new("dekBlock shorter than its IV"));
    }
    let dek_iv = &raw[pos..pos + IV_BYTES];
    let enc_dek = &raw[pos + IV_BYTES..pos + dek_block_len];
    pos += dek_block_len;

    if raw.len() < pos + IV_BYTES {
        return Err(MalformedEnvelopeError::new("envelope truncated before dataIv"));
    }
    let data_iv = &raw[pos..pos + IV_BYTES];
    pos += IV_BYTES;

    let ct_and_tag = &raw[pos..];

    Ok(EnvelopeParts {
        key_id,
        dek_iv,
        enc_dek,
        data_iv,
        ct_and_tag,
    })
}

fn encode_envelope(key_id: &str, dek_iv: &[u8; 12], enc_dek: &[u8], data_iv: &[u8; 12], ct_and_tag: &[u8]) -> Vec<u8> {
    let key_id_bytes = key_id.as_bytes();
    let dek_block_len = IV_BYTES + enc_dek.len();

    let mut out = Vec::with_capacity(
        1 + 4 + key_id_bytes.len() + 4 + dek_block_len + IV_BYTES + ct_and_tag.len(),
    );
    out.push(PROTOCOL_VERSION);
    out.extend_from_slice(&(key_id_bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(key_id_bytes);
    out.extend_from_slice(&(dek_block_len as u32).to_be_bytes());
    out.extend_from_slice(dek_iv);
    out.extend_from_slice(enc_dek);
    out.extend_from_slice(data_iv);
    out.extend_from_slice(ct_and_tag);
    out
}

/// Named random-string charsets recognised by `generate_random_string`.
fn charset_alphabet(name: &str) -> Vec<u8> {
    match name {
        "alphanumeric" => (b'0'..=b'9').chain(b'A'..=b'Z').chain(b'a'..=b'z').collect(),
        "alpha" => (b'A'..=b'Z').chain(b'a'..=b'z').collect(),
        "numeric" => (b'0'..=b'9').collect(),
        "hex" => (b'0'..=b'9').chain(b'a'..=b'f').collect(),
        "ascii-printable" => (33u8..=126).collect(),
        other => other.as_bytes().to_vec(),
    }
}

/// Draws a single index in `[0, alphabet_len)` via rejection sampling so
/// the distribution stays uniform regardless of `alphabet_len`.
fn uniform_index(alphabet_len: usize) -> Result<usize, CryptoError> {
    let bound = (256 / alphabet_len) * alphabet_len;
    loop {
        let b = random_bytes(1)?[0] as usize;
        if b < bound {
            return Ok(b % alphabet_len);
        }
    }
}

/// Envelope-encryption service: KEK derivation, DEK wrap/unwrap, rewrap,
/// random-string generation, and hashing. Holds the process-wide master
/// key; KEKs are derived on demand and never cached.
pub struct CryptoService {
    master_key: Vec<u8>,
}

impl Drop for CryptoService {
    fn drop(&mut self) {
        self.master_key.zeroize();
    }
}

impl CryptoService {
    /// Constructs the service and runs the startup self-test. The master
    /// key must be at least 32 bytes; this is a fatal startup condition if
    /// violated, matching the contract that the service must refuse to
    /// start rather than run with a weak key.
    pub fn new(master_key: Vec<u8>) -> Result<Self, CryptoError> {
        if master_key.len() < 32 {
            return Err(CryptoValidationError::new(
                "master key must be at least 32 bytes",
            )
            .into());
        }
        let svc = CryptoService { master_key };
        svc.self_test()?;
        Ok(svc)
    }

    fn self_test(&self) -> Result<(), CryptoError> {
        let probe = b"vault-encryption-test";
        let envelope = self.encrypt(probe)?;
        let recovered = self.decrypt(&envelope)?;
        if recovered != probe {
            return Err(CryptoValidationError::new(
                "startup self-test round trip mismatch",
            )
            .into());
        }
        Ok(())
    }

    /// KEK_p = HKDF(ikm = master, salt = none, info = CONST_PREFIX || p, L = 32).
    pub fn derive_kek(&self, purpose: &str) -> Result<[u8; 32], CryptoError> {
        let mut info = Vec::with_capacity(CONST_PREFIX.len() + purpose.len());
        info.extend_from_slice(CONST_PREFIX);
        info.extend_from_slice(purpose.as_bytes());
        let okm = hkdf::derive(None, &self.master_key, &info, 32)?;
        let mut out = [0u8; 32];
        out.copy_from_slice(&okm);
        Ok(out)
    }

    /// Wraps with KEK_secret-storage under the fixed default key id.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String, CryptoError> {
        let kek = self.derive_kek(PURPOSE_SECRET_STORAGE)?;
        self.encrypt_with_key(plaintext, DEFAULT_KEY_ID, &kek)
    }

    /// Wraps `plaintext` with the given 32-byte key, embedding `key_id`.
    pub fn encrypt_with_key(&self, plaintext: &[u8], key_id: &str, key: &[u8; 32]) -> Result<String, CryptoError> {
        let dek_vec = random_bytes(32)?;
        let mut dek = [0u8; 32];
        dek.copy_from_slice(&dek_vec);

        let dek_iv = random_nonce()?;
        let enc_dek = aead_seal(key, &dek_iv, &dek, b"")?;

        let data_iv = random_nonce()?;
        let ct_and_tag = aead_seal(&dek, &data_iv, plaintext, b"")?;
        dek.zeroize();

        let raw = encode_envelope(key_id, &dek_iv, &enc_dek, &data_iv, &ct_and_tag);
        Ok(BASE64.encode(raw))
    }

    /// Inverse of `encrypt`.
    pub fn decrypt(&self, envelope: &str) -> Result<Vec<u8>, CryptoError> {
        let kek = self.derive_kek(PURPOSE_SECRET_STORAGE)?;
        self.decrypt_with_key(envelope, &kek)
    }

    /// Inverse of `encrypt_with_key`.
    pub fn decrypt_with_key(&self, envelope: &str, key: &[u8; 32]) -> Result<Vec<u8>, CryptoError> {
        let raw = BASE64
            .decode(envelope)
            .map_err(|e| MalformedEnvelopeError::new(format!("not valid base64: {e}")))?;
        let parts = decode_envelope(&raw)?;

        let dek_iv: [u8; 12] = parts
            .dek_iv
            .try_into()
            .map_err(|_| MalformedEnvelopeError::new("dekIv is not 12 bytes"))?;
        let dek = aead_open(key, &dek_iv, parts.enc_dek, b"")?;
        let mut dek: [u8; 32] = dek
            .try_into()
            .map_err(|_| MalformedEnvelopeError::new("unwrapped DEK is not 32 bytes"))?;

        let data_iv: [u8; 12] = parts
            .data_iv
            .try_into()
            .map_err(|_| MalformedEnvelopeError::new("dataIv is not 12 bytes"))?;
        let result = aead_open(&dek, &data_iv, parts.ct_and_tag, b"");
        dek.zeroize();
        result
    }

    /// Decrypts under `old_key` then re-encrypts under `new_key` /
    /// `new_key_id`. The plaintext never leaves the local stack.
    pub fn rewrap(
        &self,
        envelope: &str,
        old_key: &[u8; 32],
        new_key: &[u8; 32],
        new_key_id: &str,
    ) -> Result<String, CryptoError> {
        let plaintext = self.decrypt_with_key(envelope, old_key)?;
        self.encrypt_with_key(&plaintext, new_key_id, new_key)
    }

    /// Parses the header only; must not touch the DEK or ciphertext.
    pub fn extract_key_id(envelope: &str) -> Result<String, CryptoError> {
        let raw = BASE64
            .decode(envelope)
            .map_err(|e| MalformedEnvelopeError::new(format!("not valid base64: {e}")))?;
        let parts = decode_envelope(&raw)?;
        Ok(parts.key_id.to_string())
    }

    /// 32 bytes from a cryptographic RNG.
    pub fn generate_data_key() -> Result<[u8; 32], CryptoError> {
        let v = random_bytes(32)?;
        let mut out = [0u8; 32];
        out.copy_from_slice(&v);
        Ok(out)
    }

    /// Returns (base64 plaintext DEK, envelope of that plaintext under
    /// KEK_secret-storage).
    pub fn generate_and_wrap_data_key(&self) -> Result<(String, String), CryptoError> {
        let dek = Self::generate_data_key()?;
        let plaintext_b64 = BASE64.encode(dek);
        let envelope = self.encrypt(&dek)?;
        Ok((plaintext_b64, envelope))
    }

    /// Uniform draw from a named or literal charset via a CSPRNG.
    pub fn generate_random_string(length: usize, charset: &str) -> Result<String, CryptoError> {
        if length == 0 {
            return Err(
                CryptoValidationError::new("generateRandomString length must be >= 1").into(),
            );
        }
        let alphabet = charset_alphabet(charset);
        if alphabet.is_empty() {
            return Err(CryptoValidationError::new("charset alphabet is empty").into());
        }
        let mut out = String::with_capacity(length);
        for _ in 0..length {
            let idx = uniform_index(alphabet.len())?;
            out.push(alphabet[idx] as char);
        }
        Ok(out)
    }

    /// Hex-encoded SHA-256 of `s`.
    pub fn hash(s: &str) -> String {
        let digest = Sha256::digest(s.as_bytes());
        hex::encode(digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> CryptoService {
        CryptoService::new(vec![0x42u8; 32]).unwrap()
    }

    #[test]
    fn encrypt_decrypt_with_key_roundtrip() {
        let svc = service();
        let key = [7u8; 32];
        let ct = svc.encrypt_with_key(b"hello", "k1", &key).unwrap();
        let pt = svc.decrypt_with_key(&ct, &key).unwrap();
        assert_eq!(pt, b"hello");
        assert_eq!(CryptoService::extract_key_id(&ct).unwrap(), "k1");
    }

    #[test]
    fn fresh_dek_each_call() {
        let svc = service();
        let key = [7u8; 32];
        let a = svc.encrypt_with_key(b"same", "k1", &key).unwrap();
        let b = svc.encrypt_with_key(b"same", "k1", &key).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_key_fails_with_auth_error() {
        let svc = service();
        let ct = svc.encrypt_with_key(b"data", "k1", &[1u8; 32]).unwrap();
        let err = svc.decrypt_with_key(&ct, &[2u8; 32]).unwrap_err();
        assert!(matches!(err, CryptoError::Auth(_)));
    }

    #[test]
    fn malformed_base64_is_malformed_envelope() {
        let svc = service();
        let err = svc.decrypt_with_key("not base64 !!!", &[1u8; 32]).unwrap_err();
        assert!(matches!(err, CryptoError::Malformed(_)));
    }

    #[test]
    fn bad_version_byte_is_malformed_envelope() {
        let svc = service();
        let key = [1u8; 32];
        let ct = svc.encrypt_with_key(b"data", "k1", &key).unwrap();
        let mut raw = BASE64.decode(&ct).unwrap();
        raw[0] = 0xFF;
        let tampered = BASE64.encode(raw);
        let err = svc.decrypt_with_key(&tampered, &key).unwrap_err();
        assert!(matches!(err, CryptoError::Malformed(_)));
    }

    #[test]
    fn rewrap_changes_key_id_and_invalidates_old_key() {
        let svc = service();
        let k1 = [1u8; 32];
        let k2 = [2u8; 32];
        let ct = svc.encrypt_with_key(b"secret-value", "k1", &k1).unwrap();
        let rewrapped = svc.rewrap(&ct, &k1, &k2, "k2").unwrap();

        assert_eq!(CryptoService::extract_key_id(&rewrapped).unwrap(), "k2");
        assert_eq!(svc.decrypt_with_key(&rewrapped, &k2).unwrap(), b"secret-value");
        assert!(svc.decrypt_with_key(&rewrapped, &k1).is_err());
    }

    #[test]
    fn startup_self_test_runs_on_construction() {
        // CryptoService::new already ran it; a too-short key must fail fast.
        assert!(CryptoService::new(vec![0u8; 16]).is_err());
    }

    #[test]
    fn generate_random_string_respects_charsets() {
        let numeric = CryptoService::generate_random_string(16, "numeric").unwrap();
        assert!(numeric.chars().all(|c| c.is_ascii_digit()));

        let hexs = CryptoService::generate_random_string(16, "hex").unwrap();
        assert!(hexs.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));

        let literal = CryptoService::generate_random_string(5, "xyz").unwrap();
        assert!(literal.chars().all(|c| "xyz".contains(c)));
    }

    #[test]
    fn generate_random_string_rejects_zero_length() {
        assert!(CryptoService::generate_random_string(0, "alphanumeric").is_err());
    }

    #[test]
    fn hash_is_hex_sha256() {
        let h = CryptoService::hash("abc");
        assert_eq!(
            h,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn generate_and_wrap_data_key_recovers_plaintext() {
        let svc = service();
        let (plaintext_b64, envelope) = svc.generate_and_wrap_data_key().unwrap();
        let recovered = svc.decrypt(&envelope).unwrap();
        assert_eq!(BASE64.encode(&recovered), plaintext_b64);
        assert_eq!(recovered.len(), 32);
    }
}
