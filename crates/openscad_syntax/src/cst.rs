use serde::Serialize;

use crate::diagnostics::{Diagnostic, Span};

/// Raw lexeme record. Unlike the parser's token stream this keeps whitespace
/// and comments, so spans reconstruct the file exactly.
#[derive(Debug, Clone, Serialize)]
pub struct CstToken {
    pub kind: String,
    pub text: String,
    pub span: Span,
}

#[derive(Debug, Serialize)]
pub struct CstFile {
    pub path: String,
    pub tokens: Vec<CstToken>,
    pub diagnostics: Vec<Diagnostic>,
}

#[derive(Debug, Serialize)]
pub struct CstBundle {
    pub files: Vec<CstFile>,
}
