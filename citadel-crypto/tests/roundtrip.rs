use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use citadel_crypto::envelope::CryptoService;
use citadel_crypto::error::CryptoError;

fn service() -> CryptoService {
    CryptoService::new(vec![0x5Au8; 32]).unwrap()
}

#[test]
fn roundtrip_basic() {
    let svc = service();
    let key = [9u8; 32];
    let plaintext = b"hello secrets vault";
    let ct = svc.encrypt_with_key(plaintext, "k1", &key).unwrap();
    let pt = svc.decrypt_with_key(&ct, &key).unwrap();
    assert_eq!(&pt, plaintext);
}

#[test]
fn roundtrip_empty_plaintext() {
    let svc = service();
    let key = [9u8; 32];
    let ct = svc.encrypt_with_key(b"", "k1", &key).unwrap();
    let pt = svc.decrypt_with_key(&ct, &key).unwrap();
    assert_eq!(pt, b"");
}

#[test]
fn roundtrip_large_plaintext() {
    let svc = service();
    let key = [9u8; 32];
    let plaintext = vec![0xABu8; 65536];
    let ct = svc.encrypt_with_key(&plaintext, "k1", &key).unwrap();
    let pt = svc.decrypt_with_key(&ct, &key).unwrap();
    assert_eq!(pt, plaintext);
}

#[test]
fn wrong_key_fails() {
    let svc = service();
    let ct = svc.encrypt_with_key(b"data", "k1", &[1u8; 32]).unwrap();
    let result = svc.decrypt_with_key(&ct, &[2u8; 32]);
    assert!(matches!(result, Err(CryptoError::Auth(_))));
}

#[test]
fn tamper_ciphertext_fails() {
    let svc = service();
    let key = [9u8; 32];
    let ct = svc.encrypt_with_key(b"data", "k1", &key).unwrap();
    let mut raw = BASE64.decode(&ct).unwrap();
    let last = raw.len() - 1;
    raw[last] ^= 0x01;
    let tampered = BASE64.encode(raw);
    assert!(matches!(
        svc.decrypt_with_key(&tampered, &key),
        Err(CryptoError::Auth(_))
    ));
}

#[test]
fn tamper_dek_block_fails() {
    let svc = service();
    let key = [9u8; 32];
    let ct = svc.encrypt_with_key(b"data", "k1", &key).unwrap();
    let mut raw = BASE64.decode(&ct).unwrap();
    // version(1) + keyIdLen(4) + keyId("k1", 2) + dekBlockLen(4) = offset 11,
    // the first byte of dekIv inside the dekBlock.
    raw[11] ^= 0x01;
    let tampered = BASE64.encode(raw);
    assert!(matches!(
        svc.decrypt_with_key(&tampered, &key),
        Err(CryptoError::Auth(_))
    ));
}

#[test]
fn truncated_envelope_fails() {
    let svc = service();
    let key = [9u8; 32];
    let ct = svc.encrypt_with_key(b"data", "k1", &key).unwrap();
    let raw = BASE64.decode(&ct).unwrap();
    let truncated = BASE64.encode(&raw[..raw.len() / 2]);
    assert!(matches!(
        svc.decrypt_with_key(&truncated, &key),
        Err(CryptoError::Malformed(_))
    ));
    assert!(matches!(
        svc.decrypt_with_key("", &key),
        Err(CryptoError::Malformed(_))
    ));
}

#[test]
fn extract_key_id_matches_embedded_id() {
    let svc = service();
    let key = [9u8; 32];
    for id in ["vault-master-v1", "transit-keys:v1", "short"] {
        let ct = svc.encrypt_with_key(b"data", id, &key).unwrap();
        assert_eq!(CryptoService::extract_key_id(&ct).unwrap(), id);
    }
}

#[test]
fn rewrap_roundtrip_across_keys() {
    let svc = service();
    let k1 = [1u8; 32];
    let k2 = [2u8; 32];
    let original = svc.encrypt_with_key(b"rotate me", "v1", &k1).unwrap();
    let rewrapped = svc.rewrap(&original, &k1, &k2, "v2").unwrap();

    assert_eq!(
        svc.decrypt_with_key(&rewrapped, &k2).unwrap(),
        svc.decrypt_with_key(&original, &k1).unwrap()
    );
    assert_eq!(CryptoService::extract_key_id(&rewrapped).unwrap(), "v2");
    assert!(svc.decrypt_with_key(&rewrapped, &k1).is_err());
}

#[test]
fn key_serialization_roundtrip_via_master_key() {
    let master = vec![0x77u8; 40];
    let svc = CryptoService::new(master).unwrap();
    let plaintext = b"key management roundtrip";

    let ct = svc.encrypt(plaintext).unwrap();
    let pt = svc.decrypt(&ct).unwrap();
    assert_eq!(&pt, plaintext);
}
