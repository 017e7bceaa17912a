use std::fs;
use std::path::PathBuf;

use openscad_syntax::lex_file;

fn manifest_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
}

fn bless_enabled() -> bool {
    std::env::var("SCAD_BLESS").is_ok_and(|v| v == "1" || v.eq_ignore_ascii_case("true"))
}

#[test]
fn token_stream_matches_golden() {
    let fixture = manifest_dir().join("tests/fixtures/simple.scad");
    let golden_path = manifest_dir().join("tests/fixtures/simple.tokens.txt");

    let file = lex_file(&fixture).expect("lex fixture");
    assert!(
        file.diagnostics.is_empty(),
        "unexpected diagnostics: {:?}",
        file.diagnostics
    );

    let mut actual = String::new();
    for token in &file.tokens {
        actual.push_str(&format!(
            "{} {}:{}..{}:{} {:?}\n",
            token.kind,
            token.span.start.line,
            token.span.start.column,
            token.span.end.line,
            token.span.end.column,
            token.text
        ));
    }

    if bless_enabled() {
        fs::write(&golden_path, &actual).expect("write blessed golden");
        return;
    }

    let expected = fs::read_to_string(&golden_path).expect("read golden");
    assert_eq!(
        actual.trim_end(),
        expected.trim_end(),
        "token dump differs from golden (re-run with SCAD_BLESS=1 to update)"
    );
}

#[test]
fn lexed_files_serialize_for_host_consumption() {
    let fixture = manifest_dir().join("tests/fixtures/simple.scad");
    let file = lex_file(&fixture).expect("lex fixture");
    let value = serde_json::to_value(&file).expect("serialize");
    assert_eq!(value["tokens"][0]["kind"], "keyword");
    assert_eq!(value["tokens"][0]["text"], "include");
    assert_eq!(value["tokens"][0]["span"]["start"]["line"], 1);
}

#[test]
fn diagnostics_serialize_with_code_and_severity() {
    let (_, diags) = openscad_syntax::lex("s = \"oops\n;");
    assert_eq!(diags.len(), 1);
    let value = serde_json::to_value(&diags[0]).expect("serialize");
    assert_eq!(value["code"], "E1002");
    assert_eq!(value["severity"], "Error");
    assert_eq!(value["span"]["start"]["column"], 5);
}
