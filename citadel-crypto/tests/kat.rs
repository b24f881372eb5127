//! Known Answer / envelope-only tests (v1 byte layout)

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use citadel_crypto::envelope::{CryptoService, DEFAULT_KEY_ID, PROTOCOL_VERSION};
use citadel_crypto::hkdf;

fn service() -> CryptoService {
    CryptoService::new(vec![0x11u8; 32]).unwrap()
}

#[test]
fn test_default_key_id() {
    let svc = service();
    let ct = svc.encrypt(b"hello").unwrap();
    assert_eq!(CryptoService::extract_key_id(&ct).unwrap(), DEFAULT_KEY_ID);
}

#[test]
fn test_protocol_version_is_one() {
    assert_eq!(PROTOCOL_VERSION, 1);
}

#[test]
fn test_self_consistency() {
    let svc = service();
    for i in 0..10 {
        let plaintext = format!("msg {i}").into_bytes();
        let ct = svc.encrypt(&plaintext).unwrap();
        let pt = svc.decrypt(&ct).unwrap();
        assert_eq!(pt, plaintext);
    }
}

#[test]
fn test_rejects_invalid_version_byte() {
    let svc = service();
    let ct = svc.encrypt(b"test").unwrap();
    let mut raw = BASE64.decode(&ct).unwrap();
    raw[0] = 0x99;
    let tampered = BASE64.encode(raw);
    assert!(svc.decrypt(&tampered).is_err());
}

#[test]
fn test_hkdf_determinism_feeds_same_kek() {
    let svc1 = service();
    let svc2 = service();
    assert_eq!(
        svc1.derive_kek("secret-storage").unwrap(),
        svc2.derive_kek("secret-storage").unwrap()
    );
}

#[test]
fn test_hkdf_boundary_rejections() {
    let prk = hkdf::extract(None, b"ikm");
    assert!(hkdf::expand(&prk, b"info", 0).is_err());
    assert!(hkdf::expand(&prk, b"info", 255 * 32 + 1).is_err());
}
