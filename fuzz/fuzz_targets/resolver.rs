#![no_main]

use libfuzzer_sys::fuzz_target;
use std::path::Path;

fuzz_target!(|data: &[u8]| {
    if data.len() > 32 * 1024 {
        return;
    }
    let src = String::from_utf8_lossy(data);
    let (mut file, parse_diags) = openscad_syntax::parse_source(Path::new("fuzz.scad"), &src);
    if openscad_syntax::file_diagnostics_have_errors(&parse_diags) {
        return;
    }

    // Exercise resolution on inputs that parse cleanly, twice: it must be
    // idempotent as well as panic-free.
    let _ = openscad_syntax::resolve(&mut file);
    let _ = openscad_syntax::resolve(&mut file);
});
