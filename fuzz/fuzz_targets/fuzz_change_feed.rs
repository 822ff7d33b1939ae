//! Fuzz target for decoding change feed entries and document bodies.
//!
//! Arbitrary JSON from the server must decode or fail cleanly, never panic.

#![no_main]

use libfuzzer_sys::fuzz_target;
use replicant::document::{DocId, Document, Sequence};
use serde_json::Value;

fuzz_target!(|data: &[u8]| {
    let Ok(value) = serde_json::from_slice::<Value>(data) else {
        return;
    };

    if let Some(seq) = value.get("seq") {
        let _ = Sequence::from_json(seq);
    }
    if let Some(id) = value.get("id").and_then(Value::as_str) {
        if let Some(doc_id) = DocId::parse(id) {
            assert_eq!(doc_id.to_string(), id);
        }
    }
    if let Some(doc) = value.get("doc") {
        let _ = Document::from_value(doc.clone());
    }
});
