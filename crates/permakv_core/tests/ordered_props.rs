//! Property tests over the ordered engines: whatever keys go in, the
//! engines agree with a model `BTreeMap` on membership, order and range
//! counts.

use permakv_core::{Config, Db, MIN_POOL};
use proptest::collection::{btree_map, vec};
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::ops::ControlFlow;
use tempfile::tempdir;

const ORDERED_ENGINES: [&str; 3] = ["stree", "csmap", "radix"];

fn open_db(engine: &str, dir: &std::path::Path) -> Db {
    let config = Config::new()
        .put_path(dir.join(format!("{engine}.pool")).to_string_lossy())
        .put_size(MIN_POOL)
        .put_force_create(true);
    Db::open(engine, config).unwrap()
}

fn key_strategy() -> impl Strategy<Value = Vec<u8>> {
    vec(prop_oneof![Just(b'a'), Just(b'b'), Just(b'c'), Just(b'z')], 0..6)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn engines_match_model_after_puts_and_removes(
        entries in btree_map(key_strategy(), vec(any::<u8>(), 0..12), 0..40),
        removals in vec(key_strategy(), 0..20),
        probe in key_strategy(),
    ) {
        for engine in ORDERED_ENGINES {
            let dir = tempdir().unwrap();
            let db = open_db(engine, dir.path());

            let mut model: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
            for (key, value) in &entries {
                db.put(key, value).unwrap();
                model.insert(key.clone(), value.clone());
            }
            for key in &removals {
                let removed = db.remove(key).unwrap();
                prop_assert_eq!(removed, model.remove(key).is_some(), "{}", engine);
            }

            prop_assert_eq!(db.count_all().unwrap(), model.len(), "{}", engine);

            let mut scanned = Vec::new();
            db.get_all(|k, v| {
                scanned.push((k.to_vec(), v.to_vec()));
                ControlFlow::Continue(())
            }).unwrap();
            let expected: Vec<_> =
                model.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            prop_assert_eq!(&scanned, &expected, "{}", engine);

            let below = model.range(..probe.clone()).count();
            let above = model.range(..=probe.clone()).count();
            let above = model.len() - above;
            prop_assert_eq!(db.count_below(&probe).unwrap(), below, "{}", engine);
            prop_assert_eq!(db.count_above(&probe).unwrap(), above, "{}", engine);
            prop_assert_eq!(
                db.exists(&probe).unwrap(),
                model.contains_key(&probe),
                "{}", engine
            );
        }
    }
}
