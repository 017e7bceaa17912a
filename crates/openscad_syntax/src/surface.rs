use std::path::Path;

use crate::diagnostics::{Diagnostic, DiagnosticSeverity, FileDiagnostic, Span};
use crate::lexer::{filter_tokens, lex, Token, TokenKind};

#[derive(Debug, Clone)]
pub struct SpannedName {
    pub name: String,
    pub span: Span,
}

/// Index into [`SourceFile::bindings`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindingId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    /// Resolved to a declaring site in the binding arena.
    Site(BindingId),
    /// A reference-language builtin (`cube`, `cos`, `$fn`, the `for`/`let`/
    /// `each` pseudo-modules, ...).
    Builtin,
    /// No declaring site found in any enclosing scope.
    Unresolved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingKind {
    Variable,
    Parameter,
    Module,
    Function,
}

/// A declaring site recorded by resolution. References point here via
/// [`Binding::Site`]; storing indices instead of node pointers keeps the tree
/// acyclic and lets module/function names resolve before their definition is
/// visited.
#[derive(Debug, Clone)]
pub struct BindingSite {
    pub name: String,
    pub span: Span,
    pub kind: BindingKind,
    /// Path of the defining file for sites imported from a dependency AST;
    /// `None` for sites declared in this file.
    pub source: Option<String>,
}

/// A name use-site. `binding` is `None` until resolution runs, then always
/// `Some`.
#[derive(Debug, Clone)]
pub struct NameRef {
    pub name: String,
    pub span: Span,
    pub binding: Option<Binding>,
}

/// A name declaration-site (assignment target, parameter, `let`/`for`
/// binding).
#[derive(Debug, Clone)]
pub struct VarDef {
    pub name: String,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct Param {
    pub def: VarDef,
    pub default: Option<Expr>,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct LetBinding {
    pub def: VarDef,
    pub value: Expr,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct Argument {
    pub name: Option<NameRef>,
    pub value: Expr,
    pub span: Span,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModifierSet {
    /// `!`
    pub highlight: bool,
    /// `#`
    pub debug: bool,
    /// `%`
    pub background: bool,
    /// `*`
    pub disable: bool,
}

#[derive(Debug, Clone)]
pub enum Statement {
    Empty {
        span: Span,
    },
    Block {
        body: Vec<Statement>,
        span: Span,
    },
    Include {
        path: SpannedName,
        span: Span,
    },
    Use {
        path: SpannedName,
        span: Span,
    },
    Assignment {
        target: VarDef,
        value: Expr,
        span: Span,
    },
    ModuleDef {
        name: SpannedName,
        params: Vec<Param>,
        body: Box<Statement>,
        span: Span,
    },
    FunctionDef {
        name: SpannedName,
        params: Vec<Param>,
        body: Expr,
        span: Span,
    },
    Inst(Instantiation),
}

#[derive(Debug, Clone)]
pub struct Instantiation {
    pub modifiers: ModifierSet,
    pub kind: InstKind,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub enum InstKind {
    Single { call: ModuleCall, child: Child },
    Echo { args: Vec<Argument> },
    Assert { condition: Box<Expr>, message: Option<Box<Expr>> },
    IfElse(IfElse),
}

#[derive(Debug, Clone)]
pub struct ModuleCall {
    pub name: NameRef,
    pub args: Vec<Argument>,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct IfElse {
    pub condition: Expr,
    pub then_branch: Child,
    pub else_branch: Option<Child>,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub enum Child {
    Empty { span: Span },
    Block { body: Vec<Statement>, span: Span },
    Inst(Box<Instantiation>),
}

#[derive(Debug, Clone)]
pub enum Literal {
    Bool { value: bool, span: Span },
    Undef { span: Span },
    Number { text: String, span: Span },
    Str { value: String, span: Span },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Plus,
    Negate,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Exponent,
}

#[derive(Debug, Clone)]
pub enum Expr {
    /// Placeholder kept where an expression failed to parse, so the rest of
    /// the tree survives for tooling.
    Missing {
        span: Span,
    },
    Literal(Literal),
    Variable(NameRef),
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
        span: Span,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
        span: Span,
    },
    Ternary {
        condition: Box<Expr>,
        then_expr: Box<Expr>,
        else_expr: Box<Expr>,
        span: Span,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Argument>,
        span: Span,
    },
    Index {
        base: Box<Expr>,
        index: Box<Expr>,
        span: Span,
    },
    Member {
        base: Box<Expr>,
        member: SpannedName,
        span: Span,
    },
    Vector {
        elements: Vec<Element>,
        span: Span,
    },
    Range {
        start: Box<Expr>,
        step: Option<Box<Expr>>,
        end: Box<Expr>,
        span: Span,
    },
    Let {
        bindings: Vec<LetBinding>,
        body: Box<Element>,
        span: Span,
    },
    Assert {
        args: Vec<Argument>,
        body: Option<Box<Expr>>,
        span: Span,
    },
    Echo {
        args: Vec<Argument>,
        body: Option<Box<Expr>>,
        span: Span,
    },
    Function {
        params: Vec<Param>,
        body: Box<Expr>,
        span: Span,
    },
}

/// A bracketed list slot: a plain expression, or one comprehension clause.
#[derive(Debug, Clone)]
pub enum Element {
    Expr(Expr),
    Comp(Comp),
}

#[derive(Debug, Clone)]
pub enum Comp {
    For {
        bindings: Vec<LetBinding>,
        /// `Some` only for the C-style form `for (init; cond; step)`.
        cond: Option<Box<Expr>>,
        step: Vec<LetBinding>,
        inner: Box<Element>,
        span: Span,
    },
    Each {
        inner: Box<Element>,
        span: Span,
    },
    If {
        condition: Box<Expr>,
        then_inner: Box<Element>,
        else_inner: Option<Box<Element>>,
        span: Span,
    },
}

#[derive(Debug)]
pub struct SourceFile {
    pub path: String,
    pub statements: Vec<Statement>,
    /// Declaring sites, filled by the resolver; empty after a bare parse.
    pub bindings: Vec<BindingSite>,
}

pub fn parse_source(path: &Path, content: &str) -> (SourceFile, Vec<FileDiagnostic>) {
    let (cst_tokens, lex_diags) = lex(content);
    let tokens = filter_tokens(&cst_tokens);
    let path_text = path.display().to_string();
    let mut parser = Parser::new(tokens, &path_text);
    let statements = parser.parse_file();
    let mut diagnostics: Vec<FileDiagnostic> = lex_diags
        .into_iter()
        .map(|diagnostic| FileDiagnostic {
            path: path_text.clone(),
            diagnostic,
        })
        .collect();
    diagnostics.append(&mut parser.diagnostics);
    let file = SourceFile {
        path: path_text,
        statements,
        bindings: Vec::new(),
    };
    (file, diagnostics)
}

const MAX_DEPTH: usize = 200;

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    diagnostics: Vec<FileDiagnostic>,
    path: String,
    depth: usize,
    depth_reported: bool,
}

impl Parser {
    fn new(tokens: Vec<Token>, path: &str) -> Self {
        Self {
            tokens,
            pos: 0,
            diagnostics: Vec::new(),
            path: path.to_string(),
            depth: 0,
            depth_reported: false,
        }
    }

    fn parse_file(&mut self) -> Vec<Statement> {
        let mut statements = Vec::new();
        while self.pos < self.tokens.len() {
            let before = self.pos;
            match self.parse_statement() {
                Some(statement) => statements.push(statement),
                None => self.recover_statement(),
            }
            if self.pos == before {
                self.pos += 1;
            }
        }
        statements
    }

    // ── Statements ─────────────────────────────────────────────────────

    fn parse_statement(&mut self) -> Option<Statement> {
        if !self.enter_recursion() {
            return None;
        }
        let result = self.parse_statement_inner();
        self.leave_recursion();
        result
    }

    fn parse_statement_inner(&mut self) -> Option<Statement> {
        if self.consume_symbol(";") {
            return Some(Statement::Empty {
                span: self.previous_span(),
            });
        }
        if self.consume_symbol("{") {
            let start = self.previous_span();
            let body = self.parse_block_body();
            let end = self
                .expect_symbol("}", "expected '}' to close block")
                .unwrap_or_else(|| self.previous_span());
            return Some(Statement::Block {
                body,
                span: start.merge(end),
            });
        }
        if self.match_keyword("include") {
            return Some(self.parse_file_directive(true));
        }
        if self.match_keyword("use") {
            return Some(self.parse_file_directive(false));
        }
        if self.match_keyword("module") {
            return Some(self.parse_module_def());
        }
        if self.match_keyword("function") {
            return Some(self.parse_function_def());
        }
        if self.peek_assignment_head() {
            return Some(self.parse_assignment());
        }
        if self.starts_instantiation() {
            return self.parse_instantiation().map(Statement::Inst);
        }
        let span = self.peek_span().unwrap_or_else(|| self.previous_span());
        self.emit_error("E1502", "expected a statement", span);
        None
    }

    fn parse_block_body(&mut self) -> Vec<Statement> {
        let mut body = Vec::new();
        while !self.check_symbol("}") && self.pos < self.tokens.len() {
            let before = self.pos;
            match self.parse_statement() {
                Some(statement) => body.push(statement),
                None => self.recover_statement(),
            }
            if self.pos == before {
                self.pos += 1;
            }
        }
        body
    }

    fn parse_file_directive(&mut self, is_include: bool) -> Statement {
        let start = self.previous_span();
        let path = match self.consume_fileref() {
            Some((text, span)) => SpannedName {
                name: strip_angle_brackets(&text),
                span,
            },
            None => {
                let span = self.peek_span().unwrap_or_else(|| self.previous_span());
                self.emit_error("E1505", "expected a '<file>' reference", span);
                SpannedName {
                    name: String::new(),
                    span,
                }
            }
        };
        let span = start.merge(self.previous_span());
        if is_include {
            Statement::Include { path, span }
        } else {
            Statement::Use { path, span }
        }
    }

    fn parse_module_def(&mut self) -> Statement {
        let start = self.previous_span();
        let name = self.consume_ident().unwrap_or_else(|| {
            let span = self.peek_span().unwrap_or_else(|| self.previous_span());
            self.emit_error("E1504", "expected module name", span);
            SpannedName {
                name: String::new(),
                span,
            }
        });
        self.expect_symbol("(", "expected '(' after module name");
        let params = self.parse_parameters();
        self.expect_symbol(")", "expected ')' to close parameter list");
        let body = match self.parse_statement() {
            Some(statement) => statement,
            None => {
                self.recover_statement();
                Statement::Empty {
                    span: self.previous_span(),
                }
            }
        };
        let span = start.merge(statement_span(&body));
        Statement::ModuleDef {
            name,
            params,
            body: Box::new(body),
            span,
        }
    }

    fn parse_function_def(&mut self) -> Statement {
        let start = self.previous_span();
        let name = self.consume_ident().unwrap_or_else(|| {
            let span = self.peek_span().unwrap_or_else(|| self.previous_span());
            self.emit_error("E1504", "expected function name", span);
            SpannedName {
                name: String::new(),
                span,
            }
        });
        self.expect_symbol("(", "expected '(' after function name");
        let params = self.parse_parameters();
        self.expect_symbol(")", "expected ')' to close parameter list");
        self.expect_symbol("=", "expected '=' before function body");
        let body = self.parse_expr_or_missing();
        self.expect_symbol(";", "expected ';' after function definition");
        let span = start.merge(self.previous_span());
        Statement::FunctionDef {
            name,
            params,
            body,
            span,
        }
    }

    fn peek_assignment_head(&self) -> bool {
        matches!(
            self.tokens.get(self.pos).map(|token| token.kind),
            Some(TokenKind::Ident)
        ) && self.peek_at_symbol(1, "=")
    }

    fn parse_assignment(&mut self) -> Statement {
        // Guarded by peek_assignment_head, so both consumes succeed.
        let name = self.consume_ident().unwrap_or_else(|| SpannedName {
            name: String::new(),
            span: self.previous_span(),
        });
        self.consume_symbol("=");
        let value = self.parse_expr_or_missing();
        self.expect_symbol(";", "expected ';' after assignment");
        let span = name.span.merge(self.previous_span());
        Statement::Assignment {
            target: VarDef {
                name: name.name,
                span: name.span,
            },
            value,
            span,
        }
    }

    fn starts_instantiation(&self) -> bool {
        match self.tokens.get(self.pos) {
            Some(token) => match token.kind {
                TokenKind::Ident => true,
                TokenKind::Keyword => matches!(
                    token.text.as_str(),
                    "if" | "for" | "let" | "each" | "echo" | "assert"
                ),
                TokenKind::Symbol => matches!(token.text.as_str(), "!" | "#" | "%" | "*"),
                _ => false,
            },
            None => false,
        }
    }

    fn parse_instantiation(&mut self) -> Option<Instantiation> {
        let start = self.peek_span().unwrap_or_else(|| self.previous_span());
        let mut modifiers = ModifierSet::default();
        loop {
            if self.consume_symbol("!") {
                modifiers.highlight = true;
            } else if self.consume_symbol("#") {
                modifiers.debug = true;
            } else if self.consume_symbol("%") {
                modifiers.background = true;
            } else if self.consume_symbol("*") {
                modifiers.disable = true;
            } else {
                break;
            }
        }
        if self.match_keyword("if") {
            let if_else = self.parse_if_else();
            let span = start.merge(if_else.span);
            return Some(Instantiation {
                modifiers,
                kind: InstKind::IfElse(if_else),
                span,
            });
        }
        if self.match_keyword("echo") {
            self.expect_symbol("(", "expected '(' after 'echo'");
            let args = self.parse_arguments();
            self.expect_symbol(")", "expected ')' to close argument list");
            self.expect_symbol(";", "expected ';' after echo");
            let span = start.merge(self.previous_span());
            return Some(Instantiation {
                modifiers,
                kind: InstKind::Echo { args },
                span,
            });
        }
        if self.match_keyword("assert") {
            return Some(self.parse_assert_statement(modifiers, start));
        }
        let name = match self.consume_module_name() {
            Some(name) => name,
            None => {
                let span = self.peek_span().unwrap_or_else(|| self.previous_span());
                self.emit_error("E1504", "expected module name", span);
                return None;
            }
        };
        self.expect_symbol("(", "expected '(' after module name");
        let args = self.parse_arguments();
        self.expect_symbol(")", "expected ')' to close argument list");
        let call_span = name.span.merge(self.previous_span());
        let child = self.parse_child();
        let span = start.merge(child_span(&child));
        Some(Instantiation {
            modifiers,
            kind: InstKind::Single {
                call: ModuleCall {
                    name: NameRef {
                        name: name.name,
                        span: name.span,
                        binding: None,
                    },
                    args,
                    span: call_span,
                },
                child,
            },
            span,
        })
    }

    fn parse_assert_statement(&mut self, modifiers: ModifierSet, start: Span) -> Instantiation {
        self.expect_symbol("(", "expected '(' after 'assert'");
        let args = self.parse_arguments();
        self.expect_symbol(")", "expected ')' to close argument list");
        self.expect_symbol(";", "expected ';' after assert");
        let span = start.merge(self.previous_span());
        let mut condition = None;
        let mut message = None;
        for arg in args {
            match arg.name.as_ref().map(|name| name.name.as_str()) {
                Some("condition") => condition = Some(arg.value),
                Some("message") => message = Some(arg.value),
                Some(_) => {}
                None if condition.is_none() => condition = Some(arg.value),
                None if message.is_none() => message = Some(arg.value),
                None => {}
            }
        }
        let condition = condition.unwrap_or_else(|| {
            self.emit_error("E1506", "assert requires a condition", span);
            Expr::Missing { span }
        });
        Instantiation {
            modifiers,
            kind: InstKind::Assert {
                condition: Box::new(condition),
                message: message.map(Box::new),
            },
            span,
        }
    }

    fn parse_if_else(&mut self) -> IfElse {
        let start = self.previous_span();
        self.expect_symbol("(", "expected '(' after 'if'");
        let condition = self.parse_expr_or_missing();
        self.expect_symbol(")", "expected ')' after condition");
        let then_branch = self.parse_child();
        let else_branch = if self.match_keyword("else") {
            Some(self.parse_child())
        } else {
            None
        };
        let end = else_branch
            .as_ref()
            .map(child_span)
            .unwrap_or_else(|| child_span(&then_branch));
        IfElse {
            condition,
            then_branch,
            else_branch,
            span: start.merge(end),
        }
    }

    fn parse_child(&mut self) -> Child {
        if self.consume_symbol(";") {
            return Child::Empty {
                span: self.previous_span(),
            };
        }
        if self.consume_symbol("{") {
            let start = self.previous_span();
            let body = self.parse_block_body();
            let end = self
                .expect_symbol("}", "expected '}' to close block")
                .unwrap_or_else(|| self.previous_span());
            return Child::Block {
                body,
                span: start.merge(end),
            };
        }
        if self.starts_instantiation() {
            if let Some(inst) = self.parse_instantiation() {
                return Child::Inst(Box::new(inst));
            }
            return Child::Empty {
                span: self.previous_span(),
            };
        }
        let span = self.peek_span().unwrap_or_else(|| self.previous_span());
        self.emit_error("E1507", "expected ';', a block, or a module instantiation", span);
        Child::Empty { span }
    }

    // ── Parameters, arguments, bindings ────────────────────────────────

    fn parse_parameters(&mut self) -> Vec<Param> {
        let mut params = Vec::new();
        if self.check_symbol(")") {
            return params;
        }
        loop {
            let name = match self.consume_ident() {
                Some(name) => name,
                None => {
                    let span = self.peek_span().unwrap_or_else(|| self.previous_span());
                    self.emit_error("E1504", "expected parameter name", span);
                    break;
                }
            };
            let default = if self.consume_symbol("=") {
                Some(self.parse_expr_or_missing())
            } else {
                None
            };
            let end = default
                .as_ref()
                .map(expr_span)
                .unwrap_or(name.span);
            params.push(Param {
                def: VarDef {
                    name: name.name,
                    span: name.span,
                },
                default,
                span: name.span.merge(end),
            });
            if !self.consume_symbol(",") {
                break;
            }
            if self.check_symbol(")") {
                break;
            }
        }
        params
    }

    fn parse_arguments(&mut self) -> Vec<Argument> {
        let mut args = Vec::new();
        if self.check_symbol(")") {
            return args;
        }
        loop {
            match self.parse_argument() {
                Some(arg) => args.push(arg),
                None => break,
            }
            if !self.consume_symbol(",") {
                break;
            }
            if self.check_symbol(")") {
                break;
            }
        }
        args
    }

    fn parse_argument(&mut self) -> Option<Argument> {
        let checkpoint = self.pos;
        if let Some(name) = self.consume_ident() {
            if self.consume_symbol("=") {
                let value = self.parse_expr_or_missing();
                let span = name.span.merge(expr_span(&value));
                return Some(Argument {
                    name: Some(NameRef {
                        name: name.name,
                        span: name.span,
                        binding: None,
                    }),
                    value,
                    span,
                });
            }
            self.pos = checkpoint;
        }
        let value = self.parse_expr()?;
        let span = expr_span(&value);
        Some(Argument {
            name: None,
            value,
            span,
        })
    }

    /// `name = expr` lists for `let` heads and comprehension `for` clauses.
    /// Each binding is a fresh declaring site, visible to the bindings after
    /// it.
    fn parse_binding_list(&mut self) -> Vec<LetBinding> {
        let mut bindings = Vec::new();
        if self.check_symbol(")") || self.check_symbol(";") {
            return bindings;
        }
        loop {
            let name = match self.consume_ident() {
                Some(name) => name,
                None => {
                    let span = self.peek_span().unwrap_or_else(|| self.previous_span());
                    self.emit_error("E1509", "expected binding name", span);
                    break;
                }
            };
            self.expect_symbol("=", "expected '=' in binding");
            let value = self.parse_expr_or_missing();
            let span = name.span.merge(expr_span(&value));
            bindings.push(LetBinding {
                def: VarDef {
                    name: name.name,
                    span: name.span,
                },
                value,
                span,
            });
            if !self.consume_symbol(",") {
                break;
            }
            if self.check_symbol(")") || self.check_symbol(";") {
                break;
            }
        }
        bindings
    }

    // ── Expressions ────────────────────────────────────────────────────

    fn parse_expr_or_missing(&mut self) -> Expr {
        self.parse_expr().unwrap_or_else(|| self.missing_expr())
    }

    fn missing_expr(&self) -> Expr {
        Expr::Missing {
            span: self.peek_span().unwrap_or_else(|| self.previous_span()),
        }
    }

    fn parse_expr(&mut self) -> Option<Expr> {
        if !self.enter_recursion() {
            return None;
        }
        let result = self.parse_expr_inner();
        self.leave_recursion();
        result
    }

    fn parse_expr_inner(&mut self) -> Option<Expr> {
        if self.check_keyword("function") {
            return Some(self.parse_function_literal());
        }
        if self.check_keyword("let") {
            return Some(self.parse_let_expr(false));
        }
        if self.check_keyword("assert") {
            return Some(self.parse_assert_echo_expr(true));
        }
        if self.check_keyword("echo") {
            return Some(self.parse_assert_echo_expr(false));
        }
        self.parse_ternary()
    }

    fn parse_function_literal(&mut self) -> Expr {
        self.match_keyword("function");
        let start = self.previous_span();
        self.expect_symbol("(", "expected '(' after 'function'");
        let params = self.parse_parameters();
        self.expect_symbol(")", "expected ')' to close parameter list");
        let body = self.parse_expr_or_missing();
        let span = start.merge(expr_span(&body));
        Expr::Function {
            params,
            body: Box::new(body),
            span,
        }
    }

    fn parse_let_expr(&mut self, in_comprehension: bool) -> Expr {
        self.match_keyword("let");
        let start = self.previous_span();
        self.expect_symbol("(", "expected '(' after 'let'");
        let bindings = self.parse_binding_list();
        self.expect_symbol(")", "expected ')' to close binding list");
        let body = if in_comprehension {
            self.parse_comp_inner()
        } else {
            Element::Expr(self.parse_expr_or_missing())
        };
        let span = start.merge(element_span(&body));
        Expr::Let {
            bindings,
            body: Box::new(body),
            span,
        }
    }

    fn parse_assert_echo_expr(&mut self, is_assert: bool) -> Expr {
        self.pos += 1; // keyword, checked by caller
        let start = self.previous_span();
        self.expect_symbol("(", "expected '(' to open argument list");
        let args = self.parse_arguments();
        self.expect_symbol(")", "expected ')' to close argument list");
        let body = if self.starts_expression() {
            Some(Box::new(self.parse_expr_or_missing()))
        } else {
            None
        };
        let end = body
            .as_deref()
            .map(expr_span)
            .unwrap_or_else(|| self.previous_span());
        let span = start.merge(end);
        if is_assert {
            Expr::Assert { args, body, span }
        } else {
            Expr::Echo { args, body, span }
        }
    }

    fn starts_expression(&self) -> bool {
        match self.tokens.get(self.pos) {
            Some(token) => match token.kind {
                TokenKind::Ident | TokenKind::Number | TokenKind::Str => true,
                TokenKind::Keyword => matches!(
                    token.text.as_str(),
                    "let" | "assert" | "echo" | "function"
                ),
                TokenKind::Symbol => matches!(token.text.as_str(), "(" | "[" | "+" | "-" | "!"),
                _ => false,
            },
            None => false,
        }
    }

    fn parse_ternary(&mut self) -> Option<Expr> {
        let condition = self.parse_binary_level(0)?;
        if !self.consume_symbol("?") {
            return Some(condition);
        }
        let then_expr = self.parse_expr_or_missing();
        self.expect_symbol(":", "expected ':' in conditional expression");
        let else_expr = self.parse_expr_or_missing();
        let span = expr_span(&condition).merge(expr_span(&else_expr));
        Some(Expr::Ternary {
            condition: Box::new(condition),
            then_expr: Box::new(then_expr),
            else_expr: Box::new(else_expr),
            span,
        })
    }

    /// Left-associative binary levels, loosest first.
    const BINARY_LEVELS: &'static [&'static [(&'static str, BinaryOp)]] = &[
        &[("||", BinaryOp::Or)],
        &[("&&", BinaryOp::And)],
        &[("==", BinaryOp::Equal), ("!=", BinaryOp::NotEqual)],
        &[
            ("<", BinaryOp::Less),
            ("<=", BinaryOp::LessEqual),
            (">", BinaryOp::Greater),
            (">=", BinaryOp::GreaterEqual),
        ],
        &[("+", BinaryOp::Add), ("-", BinaryOp::Subtract)],
        &[
            ("*", BinaryOp::Multiply),
            ("/", BinaryOp::Divide),
            ("%", BinaryOp::Modulo),
        ],
    ];

    fn parse_binary_level(&mut self, level: usize) -> Option<Expr> {
        let Some(ops) = Self::BINARY_LEVELS.get(level) else {
            return self.parse_unary();
        };
        let mut lhs = self.parse_binary_level(level + 1)?;
        loop {
            let op = match self.peek_symbol_text() {
                Some(text) => match ops.iter().find(|(symbol, _)| *symbol == text) {
                    Some((_, op)) => *op,
                    None => break,
                },
                None => break,
            };
            self.pos += 1;
            let rhs = self
                .parse_binary_level(level + 1)
                .unwrap_or_else(|| self.missing_expr());
            let span = expr_span(&lhs).merge(expr_span(&rhs));
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                span,
            };
        }
        Some(lhs)
    }

    fn parse_unary(&mut self) -> Option<Expr> {
        let op = match self.peek_symbol_text() {
            Some(text) => match text.as_str() {
                "+" => Some(UnaryOp::Plus),
                "-" => Some(UnaryOp::Negate),
                "!" => Some(UnaryOp::Not),
                _ => None,
            },
            None => None,
        };
        if let Some(op) = op {
            self.pos += 1;
            let start = self.previous_span();
            let operand = self.parse_unary().unwrap_or_else(|| self.missing_expr());
            let span = start.merge(expr_span(&operand));
            return Some(Expr::Unary {
                op,
                operand: Box::new(operand),
                span,
            });
        }
        self.parse_exponent()
    }

    fn parse_exponent(&mut self) -> Option<Expr> {
        let lhs = self.parse_postfix()?;
        if !self.consume_symbol("^") {
            return Some(lhs);
        }
        // Right-associative: the right side re-enters unary, so `2^-3` and
        // `2^3^2 == 2^(3^2)` both parse.
        let rhs = self.parse_unary().unwrap_or_else(|| self.missing_expr());
        let span = expr_span(&lhs).merge(expr_span(&rhs));
        Some(Expr::Binary {
            op: BinaryOp::Exponent,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
            span,
        })
    }

    fn parse_postfix(&mut self) -> Option<Expr> {
        let mut expr = self.parse_primary()?;
        loop {
            if self.consume_symbol("(") {
                let args = self.parse_arguments();
                let end = self
                    .expect_symbol(")", "expected ')' to close argument list")
                    .unwrap_or_else(|| self.previous_span());
                let span = expr_span(&expr).merge(end);
                expr = Expr::Call {
                    callee: Box::new(expr),
                    args,
                    span,
                };
                continue;
            }
            if self.consume_symbol("[") {
                let index = self.parse_expr_or_missing();
                let end = self
                    .expect_symbol("]", "expected ']' after index")
                    .unwrap_or_else(|| self.previous_span());
                let span = expr_span(&expr).merge(end);
                expr = Expr::Index {
                    base: Box::new(expr),
                    index: Box::new(index),
                    span,
                };
                continue;
            }
            if self.check_symbol(".") && self.peek_at_kind(1) == Some(TokenKind::Ident) {
                self.consume_symbol(".");
                let member = match self.consume_ident() {
                    Some(member) => member,
                    None => break,
                };
                let span = expr_span(&expr).merge(member.span);
                expr = Expr::Member {
                    base: Box::new(expr),
                    member,
                    span,
                };
                continue;
            }
            break;
        }
        Some(expr)
    }

    fn parse_primary(&mut self) -> Option<Expr> {
        if let Some((text, span)) = self.consume_number() {
            return Some(Expr::Literal(Literal::Number { text, span }));
        }
        if let Some((text, span)) = self.consume_string() {
            return Some(Expr::Literal(Literal::Str {
                value: strip_quotes(&text),
                span,
            }));
        }
        if let Some(name) = self.consume_ident() {
            return Some(match name.name.as_str() {
                "true" => Expr::Literal(Literal::Bool {
                    value: true,
                    span: name.span,
                }),
                "false" => Expr::Literal(Literal::Bool {
                    value: false,
                    span: name.span,
                }),
                "undef" => Expr::Literal(Literal::Undef { span: name.span }),
                _ => Expr::Variable(NameRef {
                    name: name.name,
                    span: name.span,
                    binding: None,
                }),
            });
        }
        if self.consume_symbol("(") {
            let inner = self.parse_expr_or_missing();
            self.expect_symbol(")", "expected ')' to close group");
            return Some(inner);
        }
        if self.check_symbol("[") {
            return Some(self.parse_vector_or_range());
        }
        let span = self.peek_span().unwrap_or_else(|| self.previous_span());
        self.emit_error("E1503", "expected an expression", span);
        None
    }

    /// `[` has three readings: vector, range, comprehension. The first
    /// element decides: a following `:` commits to a range, `,` or `]` to a
    /// vector.
    fn parse_vector_or_range(&mut self) -> Expr {
        self.consume_symbol("[");
        let start = self.previous_span();
        if self.consume_symbol("]") {
            return Expr::Vector {
                elements: Vec::new(),
                span: start.merge(self.previous_span()),
            };
        }
        let first = match self.parse_element() {
            Some(element) => element,
            None => {
                self.expect_symbol("]", "expected ']' to close list");
                return Expr::Vector {
                    elements: Vec::new(),
                    span: start.merge(self.previous_span()),
                };
            }
        };
        if let Element::Expr(first_expr) = &first {
            if self.consume_symbol(":") {
                let first_expr = first_expr.clone();
                let second = self.parse_expr_or_missing();
                let (step, end_expr) = if self.consume_symbol(":") {
                    (Some(second), self.parse_expr_or_missing())
                } else {
                    (None, second)
                };
                let close = self
                    .expect_symbol("]", "expected ']' to close range")
                    .unwrap_or_else(|| self.previous_span());
                return Expr::Range {
                    start: Box::new(first_expr),
                    step: step.map(Box::new),
                    end: Box::new(end_expr),
                    span: start.merge(close),
                };
            }
        }
        let mut elements = vec![first];
        while self.consume_symbol(",") {
            if self.check_symbol("]") {
                break;
            }
            match self.parse_element() {
                Some(element) => elements.push(element),
                None => break,
            }
        }
        let close = self
            .expect_symbol("]", "expected ']' to close list")
            .unwrap_or_else(|| self.previous_span());
        let span = start.merge(close);
        let comp_count = elements
            .iter()
            .filter(|element| matches!(element, Element::Comp(_)))
            .count();
        if comp_count > 0 && elements.len() > 1 {
            self.emit_error(
                "E1508",
                "a comprehension must be the only element of its list",
                span,
            );
        }
        Expr::Vector { elements, span }
    }

    fn parse_element(&mut self) -> Option<Element> {
        if self.check_keyword("for") || self.check_keyword("each") || self.check_keyword("if") {
            return self.parse_comprehension().map(Element::Comp);
        }
        if self.check_keyword("let") {
            return Some(Element::Expr(self.parse_let_expr(true)));
        }
        self.parse_expr().map(Element::Expr)
    }

    fn parse_comprehension(&mut self) -> Option<Comp> {
        if self.match_keyword("for") {
            let start = self.previous_span();
            self.expect_symbol("(", "expected '(' after 'for'");
            let bindings = self.parse_binding_list();
            let (cond, step) = if self.consume_symbol(";") {
                let cond = self.parse_expr_or_missing();
                self.expect_symbol(";", "expected ';' before the step assignments");
                let step = self.parse_binding_list();
                (Some(Box::new(cond)), step)
            } else {
                (None, Vec::new())
            };
            self.expect_symbol(")", "expected ')' to close 'for' head");
            let inner = self.parse_comp_inner();
            let span = start.merge(element_span(&inner));
            return Some(Comp::For {
                bindings,
                cond,
                step,
                inner: Box::new(inner),
                span,
            });
        }
        if self.match_keyword("each") {
            let start = self.previous_span();
            let inner = self.parse_comp_inner();
            let span = start.merge(element_span(&inner));
            return Some(Comp::Each {
                inner: Box::new(inner),
                span,
            });
        }
        if self.match_keyword("if") {
            let start = self.previous_span();
            self.expect_symbol("(", "expected '(' after 'if'");
            let condition = self.parse_expr_or_missing();
            self.expect_symbol(")", "expected ')' after condition");
            let then_inner = self.parse_comp_inner();
            let else_inner = if self.match_keyword("else") {
                Some(Box::new(self.parse_comp_inner()))
            } else {
                None
            };
            let end = else_inner
                .as_deref()
                .map(element_span)
                .unwrap_or_else(|| element_span(&then_inner));
            return Some(Comp::If {
                condition: Box::new(condition),
                then_inner: Box::new(then_inner),
                else_inner,
                span: start.merge(end),
            });
        }
        None
    }

    fn parse_comp_inner(&mut self) -> Element {
        if self.check_keyword("for")
            || self.check_keyword("each")
            || self.check_keyword("if")
            || self.check_keyword("let")
        {
            if let Some(element) = self.parse_element() {
                return element;
            }
            return Element::Expr(self.missing_expr());
        }
        if self.check_symbol("(")
            && matches!(
                self.peek_at_keyword(1),
                Some("for") | Some("each") | Some("if") | Some("let")
            )
        {
            self.consume_symbol("(");
            let inner = self.parse_comp_inner();
            self.expect_symbol(")", "expected ')' to close comprehension group");
            return inner;
        }
        Element::Expr(self.parse_expr_or_missing())
    }

    // ── Token helpers ──────────────────────────────────────────────────

    fn enter_recursion(&mut self) -> bool {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            if !self.depth_reported {
                self.depth_reported = true;
                let span = self.peek_span().unwrap_or_else(|| self.previous_span());
                self.emit_error("E1510", "nesting too deep", span);
            }
            return false;
        }
        true
    }

    fn leave_recursion(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    fn peek_symbol_text(&self) -> Option<String> {
        let token = self.tokens.get(self.pos)?;
        if token.kind != TokenKind::Symbol {
            return None;
        }
        Some(token.text.clone())
    }

    fn check_symbol(&self, symbol: &str) -> bool {
        matches!(
            self.tokens.get(self.pos),
            Some(token) if token.kind == TokenKind::Symbol && token.text == symbol
        )
    }

    fn consume_symbol(&mut self, symbol: &str) -> bool {
        if self.check_symbol(symbol) {
            self.pos += 1;
            return true;
        }
        false
    }

    fn expect_symbol(&mut self, symbol: &str, message: &str) -> Option<Span> {
        if self.consume_symbol(symbol) {
            return Some(self.previous_span());
        }
        let span = self.peek_span().unwrap_or_else(|| self.previous_span());
        self.emit_error("E1501", message, span);
        None
    }

    fn check_keyword(&self, keyword: &str) -> bool {
        matches!(
            self.tokens.get(self.pos),
            Some(token) if token.kind == TokenKind::Keyword && token.text == keyword
        )
    }

    fn match_keyword(&mut self, keyword: &str) -> bool {
        if self.check_keyword(keyword) {
            self.pos += 1;
            return true;
        }
        false
    }

    fn consume_ident(&mut self) -> Option<SpannedName> {
        let token = self.tokens.get(self.pos)?;
        if token.kind != TokenKind::Ident {
            return None;
        }
        let name = SpannedName {
            name: token.text.clone(),
            span: token.span,
        };
        self.pos += 1;
        Some(name)
    }

    /// Module-call position also admits the binder keywords, which double as
    /// pseudo-module names.
    fn consume_module_name(&mut self) -> Option<SpannedName> {
        let token = self.tokens.get(self.pos)?;
        let ok = token.kind == TokenKind::Ident
            || (token.kind == TokenKind::Keyword
                && matches!(token.text.as_str(), "for" | "let" | "each"));
        if !ok {
            return None;
        }
        let name = SpannedName {
            name: token.text.clone(),
            span: token.span,
        };
        self.pos += 1;
        Some(name)
    }

    fn consume_number(&mut self) -> Option<(String, Span)> {
        let token = self.tokens.get(self.pos)?;
        if token.kind != TokenKind::Number {
            return None;
        }
        let result = (token.text.clone(), token.span);
        self.pos += 1;
        Some(result)
    }

    fn consume_string(&mut self) -> Option<(String, Span)> {
        let token = self.tokens.get(self.pos)?;
        if token.kind != TokenKind::Str {
            return None;
        }
        let result = (token.text.clone(), token.span);
        self.pos += 1;
        Some(result)
    }

    fn consume_fileref(&mut self) -> Option<(String, Span)> {
        let token = self.tokens.get(self.pos)?;
        if token.kind != TokenKind::FileRef {
            return None;
        }
        let result = (token.text.clone(), token.span);
        self.pos += 1;
        Some(result)
    }

    fn peek_at_symbol(&self, offset: usize, symbol: &str) -> bool {
        matches!(
            self.tokens.get(self.pos + offset),
            Some(token) if token.kind == TokenKind::Symbol && token.text == symbol
        )
    }

    fn peek_at_kind(&self, offset: usize) -> Option<TokenKind> {
        self.tokens.get(self.pos + offset).map(|token| token.kind)
    }

    fn peek_at_keyword(&self, offset: usize) -> Option<&str> {
        let token = self.tokens.get(self.pos + offset)?;
        if token.kind != TokenKind::Keyword {
            return None;
        }
        Some(token.text.as_str())
    }

    fn previous_span(&self) -> Span {
        if self.pos == 0 {
            return empty_span();
        }
        self.tokens[self.pos - 1].span
    }

    fn peek_span(&self) -> Option<Span> {
        self.tokens.get(self.pos).map(|token| token.span)
    }

    fn emit_error(&mut self, code: &str, message: &str, span: Span) {
        self.diagnostics.push(FileDiagnostic {
            path: self.path.clone(),
            diagnostic: Diagnostic {
                code: code.to_string(),
                severity: DiagnosticSeverity::Error,
                message: message.to_string(),
                span,
                labels: Vec::new(),
            },
        });
    }

    /// Skip to the next statement boundary: past the next `;` at this brace
    /// depth, or up to (not past) the `}` that closes the enclosing block.
    fn recover_statement(&mut self) {
        let mut depth = 0usize;
        while let Some(token) = self.tokens.get(self.pos) {
            if token.kind == TokenKind::Symbol {
                match token.text.as_str() {
                    ";" if depth == 0 => {
                        self.pos += 1;
                        return;
                    }
                    "{" => depth += 1,
                    "}" => {
                        if depth == 0 {
                            return;
                        }
                        depth -= 1;
                    }
                    _ => {}
                }
            }
            self.pos += 1;
        }
    }
}

fn strip_quotes(text: &str) -> String {
    let mut chars = text.chars();
    let Some(quote) = chars.next() else {
        return String::new();
    };
    let rest: String = chars.collect();
    match rest.strip_suffix(quote) {
        Some(inner) => inner.to_string(),
        None => rest,
    }
}

fn strip_angle_brackets(text: &str) -> String {
    text.trim_start_matches('<')
        .trim_end_matches('>')
        .to_string()
}

fn empty_span() -> Span {
    use crate::diagnostics::Position;
    let zero = Position {
        offset: 0,
        line: 1,
        column: 1,
    };
    Span {
        start: zero,
        end: zero,
    }
}

pub fn statement_span(statement: &Statement) -> Span {
    match statement {
        Statement::Empty { span }
        | Statement::Block { span, .. }
        | Statement::Include { span, .. }
        | Statement::Use { span, .. }
        | Statement::Assignment { span, .. }
        | Statement::ModuleDef { span, .. }
        | Statement::FunctionDef { span, .. } => *span,
        Statement::Inst(inst) => inst.span,
    }
}

pub fn child_span(child: &Child) -> Span {
    match child {
        Child::Empty { span } | Child::Block { span, .. } => *span,
        Child::Inst(inst) => inst.span,
    }
}

pub fn expr_span(expr: &Expr) -> Span {
    match expr {
        Expr::Missing { span }
        | Expr::Unary { span, .. }
        | Expr::Binary { span, .. }
        | Expr::Ternary { span, .. }
        | Expr::Call { span, .. }
        | Expr::Index { span, .. }
        | Expr::Member { span, .. }
        | Expr::Vector { span, .. }
        | Expr::Range { span, .. }
        | Expr::Let { span, .. }
        | Expr::Assert { span, .. }
        | Expr::Echo { span, .. }
        | Expr::Function { span, .. } => *span,
        Expr::Variable(name) => name.span,
        Expr::Literal(literal) => literal_span(literal),
    }
}

pub fn literal_span(literal: &Literal) -> Span {
    match literal {
        Literal::Bool { span, .. }
        | Literal::Undef { span }
        | Literal::Number { span, .. }
        | Literal::Str { span, .. } => *span,
    }
}

pub fn element_span(element: &Element) -> Span {
    match element {
        Element::Expr(expr) => expr_span(expr),
        Element::Comp(comp) => comp_span(comp),
    }
}

pub fn comp_span(comp: &Comp) -> Span {
    match comp {
        Comp::For { span, .. } | Comp::Each { span, .. } | Comp::If { span, .. } => *span,
    }
}
