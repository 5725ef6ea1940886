//! Fuzz target for pkt-line decoding.
//!
//! The streaming reader and the slice decoder must agree, and neither may
//! panic on arbitrary input.

#![no_main]

use gittp_git::{decode, PktLineReader};
use libfuzzer_sys::fuzz_target;
use std::io::Cursor;

fuzz_target!(|data: &[u8]| {
    let mut reader = PktLineReader::new(Cursor::new(data));
    let mut rest = data;

    // Bounded so crafted input cannot loop for long.
    for _ in 0..100 {
        let streamed = reader.read();
        if rest.is_empty() {
            assert!(matches!(streamed, Ok(None)));
            break;
        }

        match (decode(rest), streamed) {
            (Ok((pkt, tail)), Ok(Some(streamed))) => {
                assert_eq!(pkt, streamed);
                // "0004" carries an empty payload, which re-encodes as a flush.
                if let Some(payload) = pkt.data().filter(|p| !p.is_empty()) {
                    let encoded = gittp_git::encode(payload).unwrap();
                    let framed = &rest[..rest.len() - tail.len()];
                    // Length headers decode in either case.
                    assert!(encoded[..4].eq_ignore_ascii_case(&framed[..4]));
                    assert_eq!(encoded[4..], framed[4..]);
                }
                rest = tail;
            }
            (Err(_), Err(_)) => break,
            (decoded, streamed) => panic!("decoders disagree: {decoded:?} vs {streamed:?}"),
        }
    }
});
