use mtsender_crypto::{AUTH_KEY_LEN, AuthKey, random_i64};

fn key(fill: u8) -> AuthKey {
    AuthKey::from_bytes([fill; AUTH_KEY_LEN])
}

#[test]
fn key_id_is_stable_for_same_bytes() {
    assert_eq!(key(7).key_id(), key(7).key_id());
    assert_ne!(key(7).key_id(), key(8).key_id());
}

#[test]
fn equality_follows_key_id() {
    assert_eq!(key(1), key(1));
    assert_ne!(key(1), key(2));
}

#[test]
fn from_slice_round_trips_bytes() {
    let original = key(42);
    let restored = AuthKey::from_slice(original.as_bytes()).unwrap();
    assert_eq!(restored.to_bytes(), original.to_bytes());
    assert_eq!(restored.key_id_u64(), original.key_id_u64());
}

#[test]
fn from_slice_rejects_wrong_length() {
    let err = AuthKey::from_slice(&[0u8; 100]).unwrap_err();
    assert_eq!(err.got, 100);
    assert!(err.to_string().contains("256"));
}

#[test]
fn debug_does_not_print_key_bytes() {
    let s = format!("{:?}", key(0xAB));
    assert!(s.starts_with("AuthKey(id=0x"));
    assert!(s.len() < 40, "raw key bytes must not leak into logs: {s}");
}

#[test]
fn random_ids_differ() {
    let a = random_i64().unwrap();
    let b = random_i64().unwrap();
    assert_ne!(a, b);
}
