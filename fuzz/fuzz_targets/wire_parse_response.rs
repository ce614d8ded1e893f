#![no_main]

use libfuzzer_sys::fuzz_target;

use wirestash::wire::parse_response;

// Parsing arbitrary artifact bytes may fail but must never panic.
fuzz_target!(|data: &[u8]| {
    let _ = parse_response(data);
});
