pub mod cst;
pub mod diagnostics;
pub mod lexer;
pub mod resolver;
pub mod surface;
pub mod syntax;

pub use cst::{CstBundle, CstFile, CstToken};
pub use diagnostics::{
    diagnostics_have_errors, file_diagnostics_have_errors, render_diagnostic, render_diagnostics,
    Diagnostic, DiagnosticLabel, DiagnosticSeverity, FileDiagnostic, Position, Span,
};
pub use lexer::{filter_tokens, lex, Token, TokenKind};
pub use resolver::{resolve, resolve_with_deps, Dependency};
pub use surface::{parse_source, SourceFile};

use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum ScadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid path: {0}")]
    InvalidPath(String),
}

/// Lex one file into its full-fidelity token record.
pub fn lex_file(path: &Path) -> Result<CstFile, ScadError> {
    let content = fs::read_to_string(path)?;
    let (tokens, diagnostics) = lex(&content);
    Ok(CstFile {
        path: path.display().to_string(),
        tokens,
        diagnostics,
    })
}

/// Lex a file, a directory, or a `dir/...` recursive target.
pub fn lex_target(target: &str) -> Result<CstBundle, ScadError> {
    let mut files = Vec::new();
    for path in expand_target(target)? {
        files.push(lex_file(&path)?);
    }
    Ok(CstBundle { files })
}

/// Read and parse one file. Grammar problems come back as diagnostics, not
/// as an `Err`.
pub fn parse_file(path: &Path) -> Result<(SourceFile, Vec<FileDiagnostic>), ScadError> {
    let content = fs::read_to_string(path)?;
    Ok(parse_source(path, &content))
}

pub fn parse_target(target: &str) -> Result<Vec<(SourceFile, Vec<FileDiagnostic>)>, ScadError> {
    let mut files = Vec::new();
    for path in expand_target(target)? {
        files.push(parse_file(&path)?);
    }
    Ok(files)
}

fn expand_target(target: &str) -> Result<Vec<PathBuf>, ScadError> {
    let mut paths = Vec::new();
    let (base, recursive) = match target.strip_suffix("/...") {
        Some(base) => (if base.is_empty() { "." } else { base }, true),
        None => (target, false),
    };

    let Some(path) = resolve_target_path(base) else {
        return Err(ScadError::InvalidPath(target.to_string()));
    };

    if path.is_file() {
        return Ok(vec![path]);
    }

    if path.is_dir() {
        if recursive {
            collect_files(&path, &mut paths)?;
        } else {
            for entry in fs::read_dir(path)? {
                let entry = entry?;
                let entry_path = entry.path();
                if entry_path.is_file() && is_scad_file(&entry_path) {
                    paths.push(entry_path);
                }
            }
        }
    }

    paths.sort();
    if paths.is_empty() {
        return Err(ScadError::InvalidPath(target.to_string()));
    }

    Ok(paths)
}

fn resolve_target_path(target: &str) -> Option<PathBuf> {
    let target_path = Path::new(target);
    if target_path.is_absolute() {
        return target_path.exists().then(|| target_path.to_path_buf());
    }

    if target_path.exists() {
        return Some(target_path.to_path_buf());
    }

    // Also try relative to the enclosing workspace, so targets work from any
    // member directory.
    let Ok(mut dir) = std::env::current_dir() else {
        return None;
    };

    loop {
        if dir.join("Cargo.toml").exists() {
            let candidate = dir.join(target);
            if candidate.exists() {
                return Some(candidate);
            }
        }

        let Some(parent) = dir.parent() else {
            break;
        };
        dir = parent.to_path_buf();
    }

    None
}

fn collect_files(dir: &Path, paths: &mut Vec<PathBuf>) -> Result<(), ScadError> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let entry_path = entry.path();
        if entry_path.is_dir() {
            collect_files(&entry_path, paths)?;
            continue;
        }
        if is_scad_file(&entry_path) {
            paths.push(entry_path);
        }
    }
    Ok(())
}

fn is_scad_file(path: &Path) -> bool {
    path.extension().and_then(|ext| ext.to_str()) == Some("scad")
}
