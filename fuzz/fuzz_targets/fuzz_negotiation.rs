//! Fuzz target for receive-pack negotiation parsing.

#![no_main]

use gittp_git::{split_negotiation, ReceivePackNegotiation};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(Some(negotiation)) = ReceivePackNegotiation::parse(data) {
        assert_eq!(negotiation.old_ref.len(), 40);
        assert_eq!(negotiation.new_ref.len(), 40);
        assert!(!negotiation.branch.is_empty());
        assert!(!negotiation.capabilities.iter().any(String::is_empty));
    }

    if let Ok((_, rest)) = split_negotiation(data) {
        assert!(rest.len() <= data.len());
    }
});
