#![no_main]

use libfuzzer_sys::fuzz_target;

use wirestash::rewrite::{HeaderRewriter, KeepHeaders, StripHeaders, SubstituteHeaders};

// Rewriters are total: any head byte sequence in, some byte sequence out.
fuzz_target!(|data: &[u8]| {
    let strip = StripHeaders::new(["Set-Cookie", "X-[^:]*"]).unwrap();
    let keep = KeepHeaders::new(["Content-Type", "Date"]).unwrap();
    let substitute = SubstituteHeaders::from_pairs([r"(Date:\s+.+)", "Date: TODAY"]).unwrap();

    let head = data.to_vec();
    let head = strip.rewrite(head);
    let head = keep.rewrite(head);
    let _ = substitute.rewrite(head);
});
