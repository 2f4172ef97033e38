//! Fuzz target for channel event decoding.
//!
//! Arbitrary bytes must decode or fail with an error, never panic. Anything
//! that decodes must re-encode and decode again.

#![no_main]

use cohort_engine::types::CohortEvent;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(event) = CohortEvent::decode(data) {
        let _ = event.partition_key();
        let encoded = event.encode().expect("decoded event re-encodes");
        CohortEvent::decode(&encoded).expect("re-encoded event decodes");
    }
});
