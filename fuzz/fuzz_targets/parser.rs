#![no_main]

use libfuzzer_sys::fuzz_target;
use std::path::Path;

fuzz_target!(|data: &[u8]| {
    // Bound input size so the harness itself stays cheap.
    if data.len() > 64 * 1024 {
        return;
    }
    let src = String::from_utf8_lossy(data);
    let (_file, _diags) = openscad_syntax::parse_source(Path::new("fuzz.scad"), &src);
});
