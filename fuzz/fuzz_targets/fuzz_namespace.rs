//! Fuzz target for namespace splitting.

#![no_main]

use libfuzzer_sys::fuzz_target;
use oplog_replicator::store::Namespace;

fuzz_target!(|data: &str| {
    if let Some(ns) = Namespace::parse(data) {
        assert!(!ns.database.is_empty());
        assert!(!ns.collection.is_empty());
        assert!(!ns.database.contains('.'));
        assert_eq!(ns.to_string(), data);
    }
});
