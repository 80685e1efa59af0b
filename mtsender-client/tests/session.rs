use std::sync::Arc;

use mtsender_client::{
    AuthKey, BinaryFileBackend, DcTarget, InMemoryBackend, Session, SessionBackend, SessionError,
    SessionRecord, default_dc_addresses,
};

fn key() -> AuthKey {
    AuthKey::from_bytes([3u8; 256])
}

#[test]
fn fresh_session_reports_missing_fields() {
    let session = Session::in_memory();
    assert!(matches!(session.dc(), Err(SessionError::Missing(_))));
    assert!(matches!(session.auth_key(), Err(SessionError::Missing(_))));
    assert_eq!(session.time_offset().unwrap(), 0);
}

#[test]
fn set_dc_swaps_the_whole_target() {
    let session = Session::in_memory();
    session.set_auth_key(Some(key())).unwrap();
    session.set_dc(2, "149.154.167.51", 443).unwrap();
    session.set_dc(4, "149.154.167.91", 80).unwrap();

    assert_eq!(session.dc().unwrap(), DcTarget::new(4, "149.154.167.91", 80));
    assert_eq!(session.dc_id().unwrap(), 4);
    assert_eq!(session.port().unwrap(), 80);
    assert_eq!(session.auth_key().unwrap(), key());
}

#[test]
fn concurrent_set_dc_never_mixes_targets() {
    let session = Arc::new(Session::in_memory());
    session.set_dc(1, "a", 1).unwrap();
    let writers: Vec<_> = (0..4)
        .map(|i| {
            let session = Arc::clone(&session);
            std::thread::spawn(move || {
                for _ in 0..200 {
                    session.set_dc(i, format!("addr-{i}"), i as u16).unwrap();
                }
            })
        })
        .collect();
    for _ in 0..500 {
        let dc = session.dc().unwrap();
        if dc.id != 1 {
            assert_eq!(dc.address, format!("addr-{}", dc.id));
            assert_eq!(dc.port, dc.id as u16);
        }
    }
    for w in writers {
        w.join().unwrap();
    }
}

#[test]
fn file_backend_persists_across_loads() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.session");

    let session = Session::load(Arc::new(BinaryFileBackend::new(&path))).unwrap();
    session.set_dc(5, "91.108.56.130", 443).unwrap();
    session.set_auth_key(Some(key())).unwrap();
    session.set_time_offset(-3).unwrap();
    session.save().unwrap();

    let reloaded = Session::load(Arc::new(BinaryFileBackend::new(&path))).unwrap();
    assert_eq!(reloaded.snapshot().unwrap(), session.snapshot().unwrap());
    assert_eq!(reloaded.backend_name(), "binary-file");
}

#[test]
fn missing_file_loads_as_empty() {
    let dir = tempfile::tempdir().unwrap();
    let backend = BinaryFileBackend::new(dir.path().join("none.session"));
    assert_eq!(backend.load().unwrap(), None);
}

#[test]
fn delete_clears_storage_and_memory() {
    let backend = Arc::new(InMemoryBackend::with_record(SessionRecord {
        dc:          Some(DcTarget::new(2, "149.154.167.51", 443)),
        auth_key:    Some(key()),
        time_offset: 7,
    }));
    let session = Session::load(backend.clone()).unwrap();
    assert_eq!(session.time_offset().unwrap(), 7);

    session.delete().unwrap();
    assert_eq!(backend.load().unwrap(), None);
    assert_eq!(session.snapshot().unwrap(), SessionRecord::default());
}

#[test]
fn default_table_covers_five_datacenters() {
    let table = default_dc_addresses();
    assert_eq!(table.len(), 5);
    assert!(table.values().all(|dc| dc.port == 443));
    assert_eq!(table[&2].address, "149.154.167.51");
}
