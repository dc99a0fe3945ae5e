//! Fuzz target for change-log entry parsing.
//!
//! Arbitrary bytes are decoded as BSON; whatever decodes must parse or be
//! rejected without panicking, and must never map to more than one write.

#![no_main]

use bson::Document;
use libfuzzer_sys::fuzz_target;
use oplog_replicator::change_log::ChangeEvent;
use oplog_replicator::codec::IdentityCodec;

fuzz_target!(|data: &[u8]| {
    let raw = match Document::from_reader(data) {
        Ok(doc) => doc,
        Err(_) => return,
    };

    let event = match ChangeEvent::from_document(raw) {
        Ok(event) => event,
        Err(_) => return,
    };

    let _ = event.split_namespace();
    let _ = event.to_json();
    let _ = event.to_write(&IdentityCodec);
});
