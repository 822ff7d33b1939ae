//! Fuzz target for change feed sequence parsing and ordering.
//!
//! This tests that sequence parsing never panics on arbitrary input
//! and that ordering stays a total order.

#![no_main]

use libfuzzer_sys::fuzz_target;
use replicant::document::Sequence;
use std::cmp::Ordering;

fuzz_target!(|data: (&str, &str)| {
    let (a, b) = data;

    // Should never panic
    let (Some(sa), Some(sb)) = (Sequence::parse(a), Sequence::parse(b)) else {
        return;
    };

    // Antisymmetry
    assert_eq!(sa.cmp(&sb), sb.cmp(&sa).reverse());

    // The integer dominates
    if sa.number() != sb.number() {
        assert_eq!(sa.cmp(&sb), sa.number().cmp(&sb.number()));
    }

    // Reflexivity
    assert_eq!(sa.cmp(&sa), Ordering::Equal);
    assert_eq!(sa.token(), a);
});
