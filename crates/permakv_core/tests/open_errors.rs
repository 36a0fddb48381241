//! Open-time validation: config combinations, path and size failures,
//! engine and layout mismatches.

use permakv_core::engines::cmap;
use permakv_core::{Config, Db, Error, Pool, MAX_POOL, MIN_POOL};
use std::sync::Arc;
use tempfile::tempdir;

#[test]
fn nonexistent_path_fails_with_wrong_path() {
    let config = Config::new()
        .put_path("/no/such/directory/anywhere/pool")
        .put_size(5 * MIN_POOL)
        .put_force_create(true);
    assert!(matches!(
        Db::open("cmap", config).unwrap_err(),
        Error::WrongPath { .. }
    ));
}

#[test]
fn missing_file_without_force_create_fails_with_wrong_path() {
    let dir = tempdir().unwrap();
    let config = Config::new()
        .put_path(dir.path().join("absent.pool").to_string_lossy())
        .put_size(5 * MIN_POOL);
    assert!(matches!(
        Db::open("cmap", config).unwrap_err(),
        Error::WrongPath { .. }
    ));
}

#[test]
fn huge_size_fails_with_wrong_size() {
    let dir = tempdir().unwrap();
    let config = Config::new()
        .put_path(dir.path().join("huge.pool").to_string_lossy())
        .put_size(i64::MAX as u64)
        .put_force_create(true);
    assert!(matches!(
        Db::open("cmap", config).unwrap_err(),
        Error::WrongSize { .. }
    ));
    // The rejected create must not leave a file behind.
    assert!(!dir.path().join("huge.pool").exists());
}

#[test]
fn tiny_size_fails_with_wrong_size() {
    let dir = tempdir().unwrap();
    let config = Config::new()
        .put_path(dir.path().join("tiny.pool").to_string_lossy())
        .put_size(MIN_POOL - 1)
        .put_force_create(true);
    assert!(matches!(
        Db::open("cmap", config).unwrap_err(),
        Error::WrongSize { .. }
    ));
}

#[test]
fn size_beyond_maximum_fails_with_wrong_size() {
    let dir = tempdir().unwrap();
    let config = Config::new()
        .put_path(dir.path().join("max.pool").to_string_lossy())
        .put_size(MAX_POOL + 1)
        .put_force_create(true);
    assert!(matches!(
        Db::open("cmap", config).unwrap_err(),
        Error::WrongSize { .. }
    ));
}

#[test]
fn missing_size_fails_with_invalid_argument() {
    let dir = tempdir().unwrap();
    let config = Config::new()
        .put_path(dir.path().join("nosize.pool").to_string_lossy())
        .put_force_create(true);
    assert!(matches!(
        Db::open("cmap", config).unwrap_err(),
        Error::InvalidArgument { .. }
    ));
}

#[test]
fn negative_size_fails_with_config_type_error() {
    let dir = tempdir().unwrap();
    let config = Config::new()
        .put_path(dir.path().join("neg.pool").to_string_lossy())
        .put_int64("size", -1)
        .put_force_create(true);
    assert!(matches!(
        Db::open("cmap", config).unwrap_err(),
        Error::ConfigTypeError { .. }
    ));
}

#[test]
fn path_and_oid_together_fail_with_invalid_argument() {
    let dir = tempdir().unwrap();
    let pool = Arc::new(Pool::create(&dir.path().join("oid.pool"), cmap::LAYOUT, MIN_POOL).unwrap());

    let config = Config::new()
        .put_path(dir.path().join("other.pool").to_string_lossy())
        .put_oid(pool)
        .put_size(5 * MIN_POOL)
        .put_force_create(true);
    assert!(matches!(
        Db::open("cmap", config).unwrap_err(),
        Error::InvalidArgument { .. }
    ));
}

#[test]
fn neither_path_nor_oid_fails_with_invalid_argument() {
    let config = Config::new().put_size(5 * MIN_POOL).put_force_create(true);
    assert!(matches!(
        Db::open("cmap", config).unwrap_err(),
        Error::InvalidArgument { .. }
    ));
}

#[test]
fn oid_open_attaches_to_supplied_pool() {
    let dir = tempdir().unwrap();
    let pool = Arc::new(Pool::create(&dir.path().join("oid.pool"), cmap::LAYOUT, MIN_POOL).unwrap());

    let db = Db::open("cmap", Config::new().put_oid(Arc::clone(&pool))).unwrap();
    db.put(b"k", b"v").unwrap();
    assert_eq!(db.get_copy(b"k").unwrap(), b"v");
}

#[test]
fn oid_with_foreign_layout_fails_with_wrong_engine_name() {
    let dir = tempdir().unwrap();
    let pool = Arc::new(Pool::create(&dir.path().join("oid.pool"), cmap::LAYOUT, MIN_POOL).unwrap());

    assert!(matches!(
        Db::open("stree", Config::new().put_oid(pool)).unwrap_err(),
        Error::WrongEngineName { .. }
    ));
}

#[test]
fn unknown_engine_name_is_rejected() {
    let config = Config::new().put_path("/tmp/whatever.pool");
    assert!(matches!(
        Db::open("btree9000", config).unwrap_err(),
        Error::WrongEngineName { .. }
    ));
}

#[test]
fn reopening_with_a_different_engine_is_fatal() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("store.pool");
    {
        let config = Config::new()
            .put_path(path.to_string_lossy())
            .put_size(MIN_POOL)
            .put_force_create(true);
        Db::open("radix", config).unwrap();
    }
    let config = Config::new().put_path(path.to_string_lossy());
    assert!(matches!(
        Db::open("stree", config).unwrap_err(),
        Error::WrongEngineName { .. }
    ));
}

#[test]
fn comparator_on_unordered_engine_is_rejected() {
    use permakv_core::LexicographicComparator;

    let dir = tempdir().unwrap();
    let config = Config::new()
        .put_path(dir.path().join("cmap.pool").to_string_lossy())
        .put_size(MIN_POOL)
        .put_force_create(true)
        .put_comparator(Arc::new(LexicographicComparator));
    assert!(matches!(
        Db::open("cmap", config).unwrap_err(),
        Error::InvalidArgument { .. }
    ));
}

#[test]
fn comparator_on_radix_is_rejected() {
    use permakv_core::LexicographicComparator;

    let dir = tempdir().unwrap();
    let config = Config::new()
        .put_path(dir.path().join("radix.pool").to_string_lossy())
        .put_size(MIN_POOL)
        .put_force_create(true)
        .put_comparator(Arc::new(LexicographicComparator));
    assert!(matches!(
        Db::open("radix", config).unwrap_err(),
        Error::InvalidArgument { .. }
    ));
}

#[test]
fn garbage_file_fails_with_wrong_path() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("garbage.pool");
    std::fs::write(&path, b"this is not a pool").unwrap();

    let config = Config::new().put_path(path.to_string_lossy());
    assert!(matches!(
        Db::open("cmap", config).unwrap_err(),
        Error::WrongPath { .. }
    ));
}
