//! Fuzz target for smart HTTP request classification.

#![no_main]

use arbitrary::Arbitrary;
use gittp_git::ServiceRequest;
use libfuzzer_sys::fuzz_target;
use std::path::Path;

#[derive(Debug, Arbitrary)]
struct Input<'a> {
    get: bool,
    uri: &'a str,
    body: &'a [u8],
}

fuzz_target!(|input: Input<'_>| {
    let method = if input.get { "GET" } else { "POST" };
    let root = Path::new("/srv/repositories");

    if let Ok(request) = ServiceRequest::classify(method, input.uri, input.body, root) {
        assert!(!request.repo_name.is_empty());
        assert!(request.full_repo_path.starts_with(root));
        assert!(!request.repo_name.split('/').any(|seg| seg == ".."));
        if request.should_run_hooks {
            assert!(request.service.is_receive_pack());
            assert!(!request.is_advertisement);
        }
    }
});
