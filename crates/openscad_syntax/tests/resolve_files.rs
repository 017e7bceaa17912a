use std::fs;

use openscad_syntax::{
    file_diagnostics_have_errors, parse_file, parse_target, resolve_with_deps, Dependency,
    ScadError,
};
use tempfile::tempdir;

#[test]
fn include_graph_resolves_across_files() {
    let dir = tempdir().expect("tempdir");
    let lib_path = dir.path().join("lib.scad");
    fs::write(&lib_path, "module widget(w = 1) cube(w);\nbase = 4;\n").expect("write lib");
    let main_path = dir.path().join("main.scad");
    fs::write(&main_path, "include <lib.scad>\nwidget(w = base);\n").expect("write main");

    let (lib, lib_diags) = parse_file(&lib_path).expect("parse lib");
    assert!(!file_diagnostics_have_errors(&lib_diags), "{lib_diags:?}");

    let (mut main, mut diags) = parse_file(&main_path).expect("parse main");
    let deps = [Dependency {
        reference: "lib.scad".to_string(),
        file: &lib,
    }];
    diags.extend(resolve_with_deps(&mut main, &deps));
    assert!(!file_diagnostics_have_errors(&diags), "{diags:?}");
}

#[test]
fn unresolved_dependency_leaves_diagnostics_not_failures() {
    let dir = tempdir().expect("tempdir");
    let main_path = dir.path().join("main.scad");
    fs::write(&main_path, "include <missing.scad>\nwidget(1);\n").expect("write main");

    // Without the dependency AST the call is unresolved, but the parse and
    // the tree both survive.
    let (mut main, diags) = parse_file(&main_path).expect("parse main");
    assert!(!file_diagnostics_have_errors(&diags), "{diags:?}");
    let diags = resolve_with_deps(&mut main, &[]);
    assert!(diags.iter().any(|d| d.diagnostic.code == "W2000"));
    assert_eq!(main.statements.len(), 2);
}

#[test]
fn directory_targets_expand_to_every_scad_file() {
    let dir = tempdir().expect("tempdir");
    fs::write(dir.path().join("a.scad"), "a = 1;\n").expect("write a");
    fs::write(dir.path().join("b.scad"), "b = 2;\n").expect("write b");
    fs::write(dir.path().join("notes.txt"), "not source\n").expect("write notes");

    let target = dir.path().to_str().expect("utf-8 path");
    let parsed = parse_target(target).expect("parse directory");
    assert_eq!(parsed.len(), 2);
    for (file, diags) in &parsed {
        assert!(diags.is_empty(), "{diags:?}");
        assert_eq!(file.statements.len(), 1);
    }
}

#[test]
fn missing_target_is_an_invalid_path_error() {
    let err = parse_target("does/not/exist.scad").expect_err("should fail");
    assert!(matches!(err, ScadError::InvalidPath(_)));
}
