//! Fuzz target for paging continuation tokens.
//!
//! Parsing client-supplied tokens must never panic, and any token that
//! parses must encode back to something that parses to the same position.

#![no_main]

use cohort_engine::federation::ContinuationToken;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &str| {
    if let Ok(token) = ContinuationToken::parse(data) {
        let reparsed = ContinuationToken::parse(&token.encode()).expect("encoded token parses");
        assert_eq!(reparsed, token);
    }
});
