use serde::Serialize;

use crate::cst::CstToken;
use crate::diagnostics::{Diagnostic, DiagnosticLabel, DiagnosticSeverity, Position, Span};
use crate::syntax;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TokenKind {
    Keyword,
    Ident,
    Number,
    Str,
    FileRef,
    Symbol,
}

#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub span: Span,
}

struct Cursor {
    chars: Vec<char>,
    index: usize,
    line: usize,
    column: usize,
}

impl Cursor {
    fn new(content: &str) -> Self {
        Self {
            chars: content.chars().collect(),
            index: 0,
            line: 1,
            column: 1,
        }
    }

    fn position(&self) -> Position {
        Position {
            offset: self.index,
            line: self.line,
            column: self.column,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.index).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.index + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let ch = self.chars.get(self.index).copied()?;
        self.index += 1;
        if ch == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(ch)
    }

    fn text_from(&self, start: &Position) -> String {
        self.chars[start.offset..self.index].iter().collect()
    }

    fn span_from(&self, start: Position) -> Span {
        Span {
            start,
            end: self.position(),
        }
    }
}

pub fn lex(content: &str) -> (Vec<CstToken>, Vec<Diagnostic>) {
    let mut tokens = Vec::new();
    let mut diagnostics = Vec::new();
    let mut cursor = Cursor::new(content);
    // `<...>` is a file reference only directly after `include`/`use`;
    // everywhere else `<` is the comparison operator.
    let mut expect_path = false;

    while let Some(ch) = cursor.peek() {
        let start = cursor.position();

        if ch.is_whitespace() {
            while cursor.peek().is_some_and(char::is_whitespace) {
                cursor.bump();
            }
            push_token(&mut tokens, &cursor, start, "whitespace");
            continue;
        }

        if ch == '/' && cursor.peek_at(1) == Some('/') {
            while cursor.peek().is_some_and(|c| c != '\n') {
                cursor.bump();
            }
            push_token(&mut tokens, &cursor, start, "comment");
            continue;
        }

        if ch == '/' && cursor.peek_at(1) == Some('*') {
            cursor.bump();
            cursor.bump();
            let mut closed = false;
            while let Some(c) = cursor.bump() {
                if c == '*' && cursor.peek() == Some('/') {
                    cursor.bump();
                    closed = true;
                    break;
                }
            }
            push_token(&mut tokens, &cursor, start, "comment");
            if !closed {
                diagnostics.push(unterminated(
                    "E1001",
                    "unterminated block comment",
                    "comment started here",
                    start,
                    cursor.span_from(start),
                ));
            }
            continue;
        }

        if ch == '"' || ch == '\'' {
            let quote = ch;
            cursor.bump();
            let mut closed = false;
            while let Some(c) = cursor.peek() {
                if c == '\n' {
                    break;
                }
                cursor.bump();
                if c == quote {
                    closed = true;
                    break;
                }
            }
            push_token(&mut tokens, &cursor, start, "string");
            expect_path = false;
            if !closed {
                diagnostics.push(unterminated(
                    "E1002",
                    "unterminated string literal",
                    "string literal started here",
                    start,
                    cursor.span_from(start),
                ));
            }
            continue;
        }

        if ch == '<' && expect_path {
            cursor.bump();
            let mut closed = false;
            while let Some(c) = cursor.peek() {
                if c == '\n' {
                    break;
                }
                cursor.bump();
                if c == '>' {
                    closed = true;
                    break;
                }
            }
            push_token(&mut tokens, &cursor, start, "fileref");
            expect_path = false;
            if !closed {
                diagnostics.push(unterminated(
                    "E1003",
                    "unterminated file reference",
                    "file reference started here",
                    start,
                    cursor.span_from(start),
                ));
            }
            continue;
        }

        if ch.is_ascii_digit() || (ch == '.' && cursor.peek_at(1).is_some_and(|c| c.is_ascii_digit()))
        {
            lex_number(&mut cursor);
            push_token(&mut tokens, &cursor, start, "number");
            expect_path = false;
            continue;
        }

        if ch == '$' || ch.is_ascii_alphabetic() || ch == '_' {
            cursor.bump();
            while cursor
                .peek()
                .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_')
            {
                cursor.bump();
            }
            let text = cursor.text_from(&start);
            let kind = if syntax::KEYWORDS.contains(&text.as_str()) {
                "keyword"
            } else {
                "ident"
            };
            expect_path = kind == "keyword" && (text == "include" || text == "use");
            tokens.push(CstToken {
                kind: kind.to_string(),
                text,
                span: cursor.span_from(start),
            });
            continue;
        }

        if let Some(symbol) = match_symbol(&cursor) {
            for _ in 0..symbol.chars().count() {
                cursor.bump();
            }
            tokens.push(CstToken {
                kind: "symbol".to_string(),
                text: symbol,
                span: cursor.span_from(start),
            });
            expect_path = false;
            continue;
        }

        cursor.bump();
        diagnostics.push(Diagnostic {
            code: "E1000".to_string(),
            severity: DiagnosticSeverity::Error,
            message: format!("unexpected character '{ch}'"),
            span: cursor.span_from(start),
            labels: Vec::new(),
        });
        push_token(&mut tokens, &cursor, start, "unknown");
    }

    (tokens, diagnostics)
}

fn lex_number(cursor: &mut Cursor) {
    while cursor.peek().is_some_and(|c| c.is_ascii_digit()) {
        cursor.bump();
    }
    if cursor.peek() == Some('.') {
        cursor.bump();
        while cursor.peek().is_some_and(|c| c.is_ascii_digit()) {
            cursor.bump();
        }
    }
    if cursor.peek().is_some_and(|c| c == 'e' || c == 'E') {
        let after_sign = match cursor.peek_at(1) {
            Some('+') | Some('-') => 2,
            _ => 1,
        };
        if cursor.peek_at(after_sign).is_some_and(|c| c.is_ascii_digit()) {
            for _ in 0..=after_sign {
                cursor.bump();
            }
            while cursor.peek().is_some_and(|c| c.is_ascii_digit()) {
                cursor.bump();
            }
        }
    }
}

fn match_symbol(cursor: &Cursor) -> Option<String> {
    if let (Some(a), Some(b)) = (cursor.peek(), cursor.peek_at(1)) {
        for (needle, symbol) in syntax::SYMBOLS_2 {
            if a == needle[0] && b == needle[1] {
                return Some((*symbol).to_string());
            }
        }
    }
    let ch = cursor.peek()?;
    if syntax::SYMBOLS_1.contains(&ch) {
        return Some(ch.to_string());
    }
    None
}

fn push_token(tokens: &mut Vec<CstToken>, cursor: &Cursor, start: Position, kind: &str) {
    tokens.push(CstToken {
        kind: kind.to_string(),
        text: cursor.text_from(&start),
        span: cursor.span_from(start),
    });
}

fn unterminated(
    code: &str,
    message: &str,
    label: &str,
    start: Position,
    span: Span,
) -> Diagnostic {
    Diagnostic {
        code: code.to_string(),
        severity: DiagnosticSeverity::Error,
        message: message.to_string(),
        span,
        labels: vec![DiagnosticLabel {
            message: label.to_string(),
            span: Span { start, end: start },
        }],
    }
}

/// Drop whitespace, comments and unrecognized characters, keeping only the
/// tokens the parser consumes.
pub fn filter_tokens(tokens: &[CstToken]) -> Vec<Token> {
    let mut filtered = Vec::new();
    for token in tokens {
        let kind = match token.kind.as_str() {
            "keyword" => TokenKind::Keyword,
            "ident" => TokenKind::Ident,
            "number" => TokenKind::Number,
            "string" => TokenKind::Str,
            "fileref" => TokenKind::FileRef,
            "symbol" => TokenKind::Symbol,
            _ => continue,
        };
        filtered.push(Token {
            kind,
            text: token.text.clone(),
            span: token.span,
        });
    }
    filtered
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds_and_texts(source: &str) -> Vec<(String, String)> {
        let (tokens, _) = lex(source);
        tokens
            .into_iter()
            .filter(|t| t.kind != "whitespace")
            .map(|t| (t.kind, t.text))
            .collect()
    }

    fn diag_codes(source: &str) -> Vec<String> {
        let (_, diags) = lex(source);
        let mut codes: Vec<String> = diags.into_iter().map(|d| d.code).collect();
        codes.sort();
        codes
    }

    #[test]
    fn lex_keywords_before_identifiers() {
        let tokens = kinds_and_texts("module formula for");
        assert_eq!(
            tokens,
            vec![
                ("keyword".to_string(), "module".to_string()),
                ("ident".to_string(), "formula".to_string()),
                ("keyword".to_string(), "for".to_string()),
            ]
        );
    }

    #[test]
    fn lex_dollar_identifiers() {
        let tokens = kinds_and_texts("$fn = 36;");
        assert_eq!(tokens[0], ("ident".to_string(), "$fn".to_string()));
    }

    #[test]
    fn lex_numbers() {
        let tokens = kinds_and_texts("1 2.5 .5 3e8 1.2e-3");
        let texts: Vec<&str> = tokens.iter().map(|(_, t)| t.as_str()).collect();
        assert_eq!(texts, vec!["1", "2.5", ".5", "3e8", "1.2e-3"]);
        assert!(tokens.iter().all(|(k, _)| k == "number"));
    }

    #[test]
    fn lex_number_then_range_colon() {
        // `[0:2]` must not lex `0:` as part of the number.
        let tokens = kinds_and_texts("[0:2]");
        let texts: Vec<&str> = tokens.iter().map(|(_, t)| t.as_str()).collect();
        assert_eq!(texts, vec!["[", "0", ":", "2", "]"]);
    }

    #[test]
    fn lex_comments_are_hidden_from_parser() {
        let (tokens, diags) = lex("a = 1; // trailing\n/* block\ncomment */ b = 2;");
        assert!(diags.is_empty(), "unexpected diagnostics: {diags:?}");
        assert_eq!(tokens.iter().filter(|t| t.kind == "comment").count(), 2);
        let filtered = filter_tokens(&tokens);
        assert!(filtered.iter().all(|t| t.kind != TokenKind::Symbol || t.text != "/"));
        assert_eq!(filtered.len(), 8);
    }

    #[test]
    fn lex_unterminated_block_comment() {
        assert_eq!(diag_codes("x = 1; /* oops"), vec!["E1001".to_string()]);
    }

    #[test]
    fn lex_unterminated_string() {
        assert_eq!(diag_codes("s = \"oops\n;"), vec!["E1002".to_string()]);
    }

    #[test]
    fn lex_strings_have_no_escape_processing() {
        // The backslash is an ordinary character; the next quote closes.
        let tokens = kinds_and_texts(r#""a\" "b""#);
        assert_eq!(tokens[0], ("string".to_string(), "\"a\\\"".to_string()));
        assert_eq!(tokens[1], ("string".to_string(), "\"b\"".to_string()));
    }

    #[test]
    fn lex_file_reference_only_after_include_or_use() {
        let tokens = kinds_and_texts("include <lib/base.scad>\nx = a < b;");
        assert!(tokens
            .iter()
            .any(|(k, t)| k == "fileref" && t == "<lib/base.scad>"));
        assert!(tokens.iter().any(|(k, t)| k == "symbol" && t == "<"));
    }

    #[test]
    fn lex_file_reference_allows_comment_between() {
        let tokens = kinds_and_texts("use /* inline */ <utils.scad>");
        assert!(tokens
            .iter()
            .any(|(k, t)| k == "fileref" && t == "<utils.scad>"));
    }

    #[test]
    fn lex_unknown_character_recovers() {
        let (tokens, diags) = lex("x = 1; @ y = 2;");
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].code, "E1000");
        // The bad character is kept in the CST but filtered for the parser.
        assert!(tokens.iter().any(|t| t.kind == "unknown"));
        let filtered = filter_tokens(&tokens);
        assert_eq!(filtered.len(), 8);
    }

    #[test]
    fn lex_two_char_symbols_win_over_one_char() {
        let tokens = kinds_and_texts("a <= b == c");
        let texts: Vec<&str> = tokens.iter().map(|(_, t)| t.as_str()).collect();
        assert_eq!(texts, vec!["a", "<=", "b", "==", "c"]);
    }

    #[test]
    fn lex_spans_track_lines_and_columns() {
        let (tokens, _) = lex("a = 1;\n  b = 2;");
        let b = tokens.iter().find(|t| t.text == "b").expect("token b");
        assert_eq!(b.span.start.line, 2);
        assert_eq!(b.span.start.column, 3);
        assert_eq!(b.span.start.offset, 9);
        assert_eq!(b.span.end.column, 4);
    }
}
