use std::collections::HashMap;

use crate::diagnostics::{Diagnostic, DiagnosticSeverity, FileDiagnostic, Span};
use crate::surface::{
    Argument, Binding, BindingId, BindingKind, BindingSite, Child, Comp, Element, Expr,
    InstKind, Instantiation, LetBinding, NameRef, Param, SourceFile, Statement,
};
use crate::syntax;

/// An already-parsed file pulled in by `include`/`use`. `reference` is the
/// path text as written between the angle brackets in the depending file.
pub struct Dependency<'a> {
    pub reference: String,
    pub file: &'a SourceFile,
}

pub fn resolve(file: &mut SourceFile) -> Vec<FileDiagnostic> {
    resolve_with_deps(file, &[])
}

/// Walk the tree and point every name use at its declaring site. Re-running
/// is safe: the binding arena and every binding field are rebuilt from
/// scratch, so a second pass reproduces the first exactly.
pub fn resolve_with_deps(file: &mut SourceFile, deps: &[Dependency]) -> Vec<FileDiagnostic> {
    let mut resolver = Resolver::new(&file.path);
    resolver.push_scope();
    resolver.import_dependencies(&file.statements, deps);
    let mut statements = std::mem::take(&mut file.statements);
    resolver.resolve_statements(&mut statements);
    resolver.pop_scope();
    file.statements = statements;
    file.bindings = resolver.bindings;
    resolver.diagnostics
}

#[derive(Default)]
struct Scope {
    vars: HashMap<String, BindingId>,
    functions: HashMap<String, BindingId>,
    modules: HashMap<String, BindingId>,
}

struct Resolver {
    path: String,
    bindings: Vec<BindingSite>,
    scopes: Vec<Scope>,
    /// Parameter sites per module/function definition site, for binding
    /// named arguments at call sites.
    def_params: HashMap<u32, Vec<(String, BindingId)>>,
    diagnostics: Vec<FileDiagnostic>,
}

impl Resolver {
    fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
            bindings: Vec::new(),
            scopes: Vec::new(),
            def_params: HashMap::new(),
            diagnostics: Vec::new(),
        }
    }

    // ── Scopes and the binding arena ───────────────────────────────────

    fn push_scope(&mut self) {
        self.scopes.push(Scope::default());
    }

    fn pop_scope(&mut self) {
        self.scopes.pop();
    }

    fn alloc_site(
        &mut self,
        name: &str,
        span: Span,
        kind: BindingKind,
        source: Option<String>,
    ) -> BindingId {
        let id = BindingId(self.bindings.len() as u32);
        self.bindings.push(BindingSite {
            name: name.to_string(),
            span,
            kind,
            source,
        });
        id
    }

    fn define_var(&mut self, name: &str, id: BindingId) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.vars.insert(name.to_string(), id);
        }
    }

    fn define_function(&mut self, name: &str, id: BindingId) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.functions.insert(name.to_string(), id);
        }
    }

    fn define_module(&mut self, name: &str, id: BindingId) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.modules.insert(name.to_string(), id);
        }
    }

    fn lookup_var(&self, name: &str) -> Option<BindingId> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.vars.get(name).copied())
    }

    fn lookup_function(&self, name: &str) -> Option<BindingId> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.functions.get(name).copied())
    }

    fn lookup_module(&self, name: &str) -> Option<BindingId> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.modules.get(name).copied())
    }

    // ── Dependencies ───────────────────────────────────────────────────

    /// Seed file scope from dependency ASTs. `include` exports modules,
    /// functions and top-level assignments; `use` exports only modules and
    /// functions.
    fn import_dependencies(&mut self, statements: &[Statement], deps: &[Dependency]) {
        for statement in statements {
            let (path, is_include) = match statement {
                Statement::Include { path, .. } => (path, true),
                Statement::Use { path, .. } => (path, false),
                _ => continue,
            };
            let Some(dep) = deps.iter().find(|dep| dep.reference == path.name) else {
                continue;
            };
            let source = dep.file.path.clone();
            for dep_statement in &dep.file.statements {
                match dep_statement {
                    Statement::ModuleDef { name, params, .. } => {
                        let id = self.hoist_def(
                            &name.name,
                            name.span,
                            params,
                            BindingKind::Module,
                            Some(source.clone()),
                        );
                        self.define_module(&name.name, id);
                    }
                    Statement::FunctionDef { name, params, .. } => {
                        let id = self.hoist_def(
                            &name.name,
                            name.span,
                            params,
                            BindingKind::Function,
                            Some(source.clone()),
                        );
                        self.define_function(&name.name, id);
                    }
                    Statement::Assignment { target, .. } if is_include => {
                        let id = self.alloc_site(
                            &target.name,
                            target.span,
                            BindingKind::Variable,
                            Some(source.clone()),
                        );
                        self.define_var(&target.name, id);
                    }
                    _ => {}
                }
            }
        }
    }

    fn hoist_def(
        &mut self,
        name: &str,
        span: Span,
        params: &[Param],
        kind: BindingKind,
        source: Option<String>,
    ) -> BindingId {
        let id = self.alloc_site(name, span, kind, source.clone());
        let param_sites: Vec<(String, BindingId)> = params
            .iter()
            .map(|param| {
                let pid = self.alloc_site(
                    &param.def.name,
                    param.def.span,
                    BindingKind::Parameter,
                    source.clone(),
                );
                (param.def.name.clone(), pid)
            })
            .collect();
        self.def_params.insert(id.0, param_sites);
        id
    }

    // ── Statements ─────────────────────────────────────────────────────

    /// Module/function definitions are visible through their whole enclosing
    /// scope, so each scope is resolved in two passes: register the
    /// definitions first, then walk everything in source order.
    fn resolve_statements(&mut self, statements: &mut [Statement]) {
        let mut hoisted: Vec<Option<BindingId>> = Vec::with_capacity(statements.len());
        for statement in statements.iter() {
            hoisted.push(match statement {
                Statement::ModuleDef { name, params, .. } => {
                    let id = self.hoist_def(&name.name, name.span, params, BindingKind::Module, None);
                    self.define_module(&name.name, id);
                    Some(id)
                }
                Statement::FunctionDef { name, params, .. } => {
                    let id =
                        self.hoist_def(&name.name, name.span, params, BindingKind::Function, None);
                    self.define_function(&name.name, id);
                    Some(id)
                }
                _ => None,
            });
        }
        for (statement, hoist) in statements.iter_mut().zip(hoisted) {
            self.resolve_statement(statement, hoist);
        }
    }

    fn resolve_statement(&mut self, statement: &mut Statement, hoist: Option<BindingId>) {
        match statement {
            Statement::Empty { .. } | Statement::Include { .. } | Statement::Use { .. } => {}
            Statement::Block { body, .. } => {
                self.push_scope();
                self.resolve_statements(body);
                self.pop_scope();
            }
            Statement::Assignment { target, value, .. } => {
                // The value sees only earlier bindings; the target becomes
                // visible to the statements after it.
                self.resolve_expr(value);
                let id = self.alloc_site(&target.name, target.span, BindingKind::Variable, None);
                self.define_var(&target.name, id);
            }
            Statement::ModuleDef {
                name, params, body, ..
            } => {
                let id = match hoist {
                    Some(id) => id,
                    None => {
                        let id =
                            self.hoist_def(&name.name, name.span, params, BindingKind::Module, None);
                        self.define_module(&name.name, id);
                        id
                    }
                };
                self.push_scope();
                self.bind_params(id, params);
                self.resolve_statement(body, None);
                self.pop_scope();
            }
            Statement::FunctionDef {
                name, params, body, ..
            } => {
                let id = match hoist {
                    Some(id) => id,
                    None => {
                        let id = self.hoist_def(
                            &name.name,
                            name.span,
                            params,
                            BindingKind::Function,
                            None,
                        );
                        self.define_function(&name.name, id);
                        id
                    }
                };
                self.push_scope();
                self.bind_params(id, params);
                self.resolve_expr(body);
                self.pop_scope();
            }
            Statement::Inst(inst) => self.resolve_instantiation(inst),
        }
    }

    /// Parameter defaults see the enclosing scope plus the parameters
    /// declared before them in the same list.
    fn bind_params(&mut self, def_id: BindingId, params: &mut [Param]) {
        let sites = self.def_params.get(&def_id.0).cloned().unwrap_or_default();
        for (index, param) in params.iter_mut().enumerate() {
            if let Some(default) = &mut param.default {
                self.resolve_expr(default);
            }
            if let Some((name, pid)) = sites.get(index) {
                let pid = *pid;
                self.define_var(name, pid);
            }
        }
    }

    fn resolve_instantiation(&mut self, inst: &mut Instantiation) {
        match &mut inst.kind {
            InstKind::IfElse(if_else) => {
                self.resolve_expr(&mut if_else.condition);
                self.resolve_child(&mut if_else.then_branch);
                if let Some(else_branch) = &mut if_else.else_branch {
                    self.resolve_child(else_branch);
                }
            }
            InstKind::Echo { args } => {
                self.bind_named_args(args, Binding::Builtin);
            }
            InstKind::Assert { condition, message } => {
                self.resolve_expr(condition);
                if let Some(message) = message {
                    self.resolve_expr(message);
                }
            }
            InstKind::Single { call, child } => {
                let name = call.name.name.clone();
                let binding = self.resolve_module_name(&name, call.name.span);
                call.name.binding = Some(binding);
                if syntax::BINDER_MODULES.contains(&name.as_str()) {
                    // The named arguments of `for`/`let` are declarations
                    // scoped to the child statement, not values passed on.
                    self.push_scope();
                    for arg in &mut call.args {
                        self.resolve_expr(&mut arg.value);
                        if let Some(name_ref) = &mut arg.name {
                            let id = self.alloc_site(
                                &name_ref.name,
                                name_ref.span,
                                BindingKind::Variable,
                                None,
                            );
                            self.define_var(&name_ref.name, id);
                            name_ref.binding = Some(Binding::Site(id));
                        }
                    }
                    self.resolve_child(child);
                    self.pop_scope();
                } else {
                    self.bind_named_args(&mut call.args, binding);
                    self.resolve_child(child);
                }
            }
        }
    }

    fn resolve_module_name(&mut self, name: &str, span: Span) -> Binding {
        // The pseudo-modules need no lookup.
        if matches!(name, "for" | "let" | "each") {
            return Binding::Builtin;
        }
        if let Some(id) = self.lookup_module(name) {
            return Binding::Site(id);
        }
        if syntax::BUILTIN_MODULES.contains(&name) {
            return Binding::Builtin;
        }
        self.emit(
            "W2000",
            DiagnosticSeverity::Warning,
            format!("unknown module '{name}'"),
            span,
        );
        Binding::Unresolved
    }

    fn resolve_child(&mut self, child: &mut Child) {
        match child {
            Child::Empty { .. } => {}
            Child::Block { body, .. } => {
                self.push_scope();
                self.resolve_statements(body);
                self.pop_scope();
            }
            Child::Inst(inst) => self.resolve_instantiation(inst),
        }
    }

    // ── Expressions ────────────────────────────────────────────────────

    fn resolve_expr(&mut self, expr: &mut Expr) {
        match expr {
            Expr::Missing { .. } | Expr::Literal(_) => {}
            Expr::Variable(name_ref) => self.resolve_var_ref(name_ref),
            Expr::Unary { operand, .. } => self.resolve_expr(operand),
            Expr::Binary { lhs, rhs, .. } => {
                self.resolve_expr(lhs);
                self.resolve_expr(rhs);
            }
            Expr::Ternary {
                condition,
                then_expr,
                else_expr,
                ..
            } => {
                self.resolve_expr(condition);
                self.resolve_expr(then_expr);
                self.resolve_expr(else_expr);
            }
            Expr::Call { callee, args, .. } => {
                let callee_binding = match callee.as_mut() {
                    Expr::Variable(name_ref) => {
                        let binding = self.resolve_callee(name_ref);
                        name_ref.binding = Some(binding);
                        binding
                    }
                    other => {
                        self.resolve_expr(other);
                        Binding::Unresolved
                    }
                };
                self.bind_named_args(args, callee_binding);
            }
            Expr::Index { base, index, .. } => {
                self.resolve_expr(base);
                self.resolve_expr(index);
            }
            Expr::Member { base, .. } => self.resolve_expr(base),
            Expr::Vector { elements, .. } => {
                for element in elements {
                    self.resolve_element(element);
                }
            }
            Expr::Range {
                start, step, end, ..
            } => {
                self.resolve_expr(start);
                if let Some(step) = step {
                    self.resolve_expr(step);
                }
                self.resolve_expr(end);
            }
            Expr::Let { bindings, body, .. } => {
                self.push_scope();
                self.resolve_bindings(bindings);
                self.resolve_element(body);
                self.pop_scope();
            }
            Expr::Assert { args, body, .. } | Expr::Echo { args, body, .. } => {
                self.bind_named_args(args, Binding::Builtin);
                if let Some(body) = body {
                    self.resolve_expr(body);
                }
            }
            Expr::Function { params, body, .. } => {
                self.push_scope();
                self.bind_function_literal_params(params);
                self.resolve_expr(body);
                self.pop_scope();
            }
        }
    }

    fn bind_function_literal_params(&mut self, params: &mut [Param]) {
        for param in params.iter_mut() {
            if let Some(default) = &mut param.default {
                self.resolve_expr(default);
            }
            let id = self.alloc_site(
                &param.def.name,
                param.def.span,
                BindingKind::Parameter,
                None,
            );
            self.define_var(&param.def.name, id);
        }
    }

    /// Each binding's value sees the bindings before it; the new name joins
    /// the scope afterwards.
    fn resolve_bindings(&mut self, bindings: &mut [LetBinding]) {
        for binding in bindings.iter_mut() {
            self.resolve_expr(&mut binding.value);
            let id = self.alloc_site(
                &binding.def.name,
                binding.def.span,
                BindingKind::Variable,
                None,
            );
            self.define_var(&binding.def.name, id);
        }
    }

    fn resolve_element(&mut self, element: &mut Element) {
        match element {
            Element::Expr(expr) => self.resolve_expr(expr),
            Element::Comp(comp) => self.resolve_comp(comp),
        }
    }

    fn resolve_comp(&mut self, comp: &mut Comp) {
        match comp {
            Comp::For {
                bindings,
                cond,
                step,
                inner,
                ..
            } => {
                self.push_scope();
                self.resolve_bindings(bindings);
                if let Some(cond) = cond {
                    self.resolve_expr(cond);
                }
                // The step assignments of the C-style form re-bind the loop
                // variables inside the same scope.
                self.resolve_bindings(step);
                self.resolve_element(inner);
                self.pop_scope();
            }
            Comp::Each { inner, .. } => self.resolve_element(inner),
            Comp::If {
                condition,
                then_inner,
                else_inner,
                ..
            } => {
                self.resolve_expr(condition);
                self.resolve_element(then_inner);
                if let Some(else_inner) = else_inner {
                    self.resolve_element(else_inner);
                }
            }
        }
    }

    fn resolve_var_ref(&mut self, name_ref: &mut NameRef) {
        if let Some(id) = self.lookup_var(&name_ref.name) {
            name_ref.binding = Some(Binding::Site(id));
            return;
        }
        // Special variables are dynamically scoped; without a lexical
        // binding they refer to the host-provided value.
        if name_ref.name.starts_with('$') {
            name_ref.binding = Some(Binding::Builtin);
            return;
        }
        if syntax::BUILTIN_CONSTANTS.contains(&name_ref.name.as_str()) {
            name_ref.binding = Some(Binding::Builtin);
            return;
        }
        name_ref.binding = Some(Binding::Unresolved);
        self.emit(
            "E2000",
            DiagnosticSeverity::Error,
            format!("unknown variable '{}'", name_ref.name),
            name_ref.span,
        );
    }

    /// Call targets look through the function namespace first, then through
    /// variables holding function values, then the builtin functions.
    fn resolve_callee(&mut self, name_ref: &NameRef) -> Binding {
        if let Some(id) = self.lookup_function(&name_ref.name) {
            return Binding::Site(id);
        }
        if let Some(id) = self.lookup_var(&name_ref.name) {
            return Binding::Site(id);
        }
        if syntax::BUILTIN_FUNCTIONS.contains(&name_ref.name.as_str()) {
            return Binding::Builtin;
        }
        if name_ref.name.starts_with('$') {
            return Binding::Builtin;
        }
        self.emit(
            "E2001",
            DiagnosticSeverity::Error,
            format!("unknown function '{}'", name_ref.name),
            name_ref.span,
        );
        Binding::Unresolved
    }

    fn bind_named_args(&mut self, args: &mut [Argument], callee: Binding) {
        let params = match callee {
            Binding::Site(id) => self.def_params.get(&id.0).cloned(),
            _ => None,
        };
        for arg in args.iter_mut() {
            self.resolve_expr(&mut arg.value);
            let Some(name_ref) = &mut arg.name else {
                continue;
            };
            if name_ref.name.starts_with('$') {
                name_ref.binding = Some(Binding::Builtin);
                continue;
            }
            match (&params, callee) {
                (Some(params), _) => match params.iter().find(|(name, _)| *name == name_ref.name) {
                    Some((_, pid)) => name_ref.binding = Some(Binding::Site(*pid)),
                    None => {
                        name_ref.binding = Some(Binding::Unresolved);
                        let message =
                            format!("no parameter named '{}' on the target", name_ref.name);
                        let span = name_ref.span;
                        self.emit("W2001", DiagnosticSeverity::Warning, message, span);
                    }
                },
                (None, Binding::Builtin) => name_ref.binding = Some(Binding::Builtin),
                (None, _) => name_ref.binding = Some(Binding::Unresolved),
            }
        }
    }

    fn emit(&mut self, code: &str, severity: DiagnosticSeverity, message: String, span: Span) {
        self.diagnostics.push(FileDiagnostic {
            path: self.path.clone(),
            diagnostic: Diagnostic {
                code: code.to_string(),
                severity,
                message,
                span,
                labels: Vec::new(),
            },
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::file_diagnostics_have_errors;
    use crate::surface::parse_source;
    use std::path::Path;

    fn parse_and_resolve(source: &str) -> (SourceFile, Vec<FileDiagnostic>) {
        let (mut file, parse_diags) = parse_source(Path::new("test.scad"), source);
        assert!(
            parse_diags.is_empty(),
            "unexpected parse diagnostics: {parse_diags:?}"
        );
        let diags = resolve(&mut file);
        (file, diags)
    }

    fn assignment_value(file: &SourceFile, index: usize) -> &Expr {
        match &file.statements[index] {
            Statement::Assignment { value, .. } => value,
            other => panic!("expected assignment, got {other:?}"),
        }
    }

    fn binding_of(expr: &Expr) -> Binding {
        match expr {
            Expr::Variable(name_ref) => name_ref.binding.expect("reference was not resolved"),
            other => panic!("expected variable reference, got {other:?}"),
        }
    }

    #[test]
    fn sequential_visibility_within_a_block() {
        let (file, diags) = parse_and_resolve("{ x = 1; y = x + 1; }");
        assert!(diags.is_empty(), "unexpected diagnostics: {diags:?}");
        let Statement::Block { body, .. } = &file.statements[0] else {
            panic!("expected block");
        };
        let Statement::Assignment { value, .. } = &body[1] else {
            panic!("expected assignment");
        };
        let Expr::Binary { lhs, .. } = value else {
            panic!("expected addition");
        };
        match binding_of(lhs) {
            Binding::Site(id) => {
                let site = &file.bindings[id.0 as usize];
                assert_eq!(site.name, "x");
                assert_eq!(site.kind, BindingKind::Variable);
                assert_eq!(site.span.start.line, 1);
                assert_eq!(site.span.start.column, 3);
            }
            other => panic!("expected resolved site, got {other:?}"),
        }
    }

    #[test]
    fn forward_variable_reference_is_unresolved() {
        let (file, diags) = parse_and_resolve("{ y = x + 1; x = 1; }");
        assert!(
            diags.iter().any(|d| d.diagnostic.code == "E2000"),
            "expected E2000, got {diags:?}"
        );
        let Statement::Block { body, .. } = &file.statements[0] else {
            panic!("expected block");
        };
        let Statement::Assignment { value, .. } = &body[0] else {
            panic!("expected assignment");
        };
        let Expr::Binary { lhs, .. } = value else {
            panic!("expected addition");
        };
        assert_eq!(binding_of(lhs), Binding::Unresolved);
    }

    #[test]
    fn module_definitions_hoist_within_their_scope() {
        let (file, diags) = parse_and_resolve("module a() { b(); } module b() { cube(1); }");
        assert!(
            !diags.iter().any(|d| d.diagnostic.code == "W2000"),
            "forward call should resolve, got {diags:?}"
        );
        let Statement::ModuleDef { body, .. } = &file.statements[0] else {
            panic!("expected module definition");
        };
        let Statement::Block { body, .. } = body.as_ref() else {
            panic!("expected block body");
        };
        let Statement::Inst(Instantiation {
            kind: InstKind::Single { call, .. },
            ..
        }) = &body[0]
        else {
            panic!("expected instantiation");
        };
        match call.name.binding {
            Some(Binding::Site(id)) => {
                assert_eq!(file.bindings[id.0 as usize].name, "b");
                assert_eq!(file.bindings[id.0 as usize].kind, BindingKind::Module);
            }
            other => panic!("expected resolved module, got {other:?}"),
        }
    }

    #[test]
    fn let_bindings_are_sequential_and_scoped() {
        let (file, diags) = parse_and_resolve("v = let (a = 1, b = a + 1) a + b;\nw = a;");
        // `a` leaks nowhere: the second statement cannot see it.
        assert!(
            diags.iter().any(|d| d.diagnostic.code == "E2000"),
            "expected E2000 for the escaped reference, got {diags:?}"
        );
        let Expr::Let { bindings, body, .. } = assignment_value(&file, 0) else {
            panic!("expected let");
        };
        let Expr::Binary { lhs, .. } = &bindings[1].value else {
            panic!("expected addition in second binding");
        };
        let Binding::Site(id) = binding_of(lhs) else {
            panic!("expected site for 'a'");
        };
        assert_eq!(file.bindings[id.0 as usize].name, "a");
        let Element::Expr(Expr::Binary { lhs, rhs, .. }) = body.as_ref() else {
            panic!("expected addition body");
        };
        assert!(matches!(binding_of(lhs), Binding::Site(_)));
        assert!(matches!(binding_of(rhs), Binding::Site(_)));
    }

    #[test]
    fn for_statement_binds_its_loop_variable_in_the_child() {
        let (file, diags) = parse_and_resolve("for (i = [0:5]) cube(i);");
        assert!(diags.is_empty(), "unexpected diagnostics: {diags:?}");
        let Statement::Inst(Instantiation {
            kind: InstKind::Single { call, child },
            ..
        }) = &file.statements[0]
        else {
            panic!("expected instantiation");
        };
        assert_eq!(call.name.binding, Some(Binding::Builtin));
        let Child::Inst(inner) = child else {
            panic!("expected nested instantiation");
        };
        let InstKind::Single { call: cube, .. } = &inner.kind else {
            panic!("expected call");
        };
        assert_eq!(cube.name.binding, Some(Binding::Builtin));
        match &cube.args[0].value {
            Expr::Variable(name_ref) => {
                assert!(matches!(name_ref.binding, Some(Binding::Site(_))));
            }
            other => panic!("expected variable argument, got {other:?}"),
        }
    }

    #[test]
    fn comprehension_loop_variable_is_bound_inside_only() {
        let (file, diags) = parse_and_resolve("x = [for (i = [0:2]) i * i];\ny = i;");
        assert!(
            diags.iter().any(|d| d.diagnostic.code == "E2000"),
            "expected the escaped 'i' to be unresolved, got {diags:?}"
        );
        let Expr::Vector { elements, .. } = assignment_value(&file, 0) else {
            panic!("expected vector");
        };
        let Element::Comp(Comp::For { inner, .. }) = &elements[0] else {
            panic!("expected for clause");
        };
        let Element::Expr(Expr::Binary { lhs, .. }) = inner.as_ref() else {
            panic!("expected multiplication");
        };
        assert!(matches!(binding_of(lhs), Binding::Site(_)));
    }

    #[test]
    fn c_style_step_rebinds_in_loop_scope() {
        let (file, diags) = parse_and_resolve("x = [for (i = 0; i < 9; i = i + 1) i];");
        assert!(diags.is_empty(), "unexpected diagnostics: {diags:?}");
        let Expr::Vector { elements, .. } = assignment_value(&file, 0) else {
            panic!("expected vector");
        };
        let Element::Comp(Comp::For { cond, step, .. }) = &elements[0] else {
            panic!("expected for clause");
        };
        let Expr::Binary { lhs, .. } = cond.as_deref().expect("condition") else {
            panic!("expected comparison");
        };
        assert!(matches!(binding_of(lhs), Binding::Site(_)));
        let Expr::Binary { lhs, .. } = &step[0].value else {
            panic!("expected addition in step");
        };
        // The step's right-hand `i` sees the init binding.
        assert!(matches!(binding_of(lhs), Binding::Site(_)));
    }

    #[test]
    fn redefinition_resolves_to_the_previous_site() {
        let (file, diags) = parse_and_resolve("x = 1; x = x + 2;");
        assert!(diags.is_empty(), "unexpected diagnostics: {diags:?}");
        let Expr::Binary { lhs, .. } = assignment_value(&file, 1) else {
            panic!("expected addition");
        };
        let Binding::Site(id) = binding_of(lhs) else {
            panic!("expected site");
        };
        // The first assignment's site, not the one being defined.
        assert_eq!(id.0, 0);
        assert_eq!(file.bindings.len(), 2);
    }

    #[test]
    fn local_module_shadows_the_builtin() {
        let (file, diags) = parse_and_resolve("module cube(s) {} cube(1);");
        assert!(diags.is_empty(), "unexpected diagnostics: {diags:?}");
        let Statement::Inst(Instantiation {
            kind: InstKind::Single { call, .. },
            ..
        }) = &file.statements[1]
        else {
            panic!("expected instantiation");
        };
        assert!(matches!(call.name.binding, Some(Binding::Site(_))));
    }

    #[test]
    fn unknown_module_is_a_warning_not_an_error() {
        let (file, diags) = parse_and_resolve("wobble(1);");
        assert!(diags.iter().any(|d| d.diagnostic.code == "W2000"));
        assert!(!file_diagnostics_have_errors(&diags));
        let Statement::Inst(Instantiation {
            kind: InstKind::Single { call, .. },
            ..
        }) = &file.statements[0]
        else {
            panic!("expected instantiation");
        };
        assert_eq!(call.name.binding, Some(Binding::Unresolved));
    }

    #[test]
    fn special_variables_fall_back_to_builtin() {
        let (_, diags) = parse_and_resolve("x = $fn; cube($fn = 12);");
        assert!(diags.is_empty(), "unexpected diagnostics: {diags:?}");
        let (file, diags) = parse_and_resolve("$fs = 2; y = $fs;");
        assert!(diags.is_empty(), "unexpected diagnostics: {diags:?}");
        assert!(matches!(
            binding_of(assignment_value(&file, 1)),
            Binding::Site(_)
        ));
    }

    #[test]
    fn named_arguments_bind_to_the_callee_parameters() {
        let (file, diags) = parse_and_resolve("module m(a) cube(a); m(a = 1);");
        assert!(diags.is_empty(), "unexpected diagnostics: {diags:?}");
        let Statement::Inst(Instantiation {
            kind: InstKind::Single { call, .. },
            ..
        }) = &file.statements[1]
        else {
            panic!("expected instantiation");
        };
        let name_ref = call.args[0].name.as_ref().expect("named argument");
        let Some(Binding::Site(id)) = name_ref.binding else {
            panic!("expected parameter site, got {:?}", name_ref.binding);
        };
        assert_eq!(file.bindings[id.0 as usize].kind, BindingKind::Parameter);
        assert_eq!(file.bindings[id.0 as usize].name, "a");
    }

    #[test]
    fn unknown_named_argument_is_a_warning() {
        let (_, diags) = parse_and_resolve("module m(a) cube(a); m(b = 1);");
        assert!(diags.iter().any(|d| d.diagnostic.code == "W2001"));
        assert!(!file_diagnostics_have_errors(&diags));
    }

    #[test]
    fn parameter_defaults_see_earlier_parameters_only() {
        let (_, diags) = parse_and_resolve("module m(a, b = a + 1) cube(b); m(1);");
        assert!(diags.is_empty(), "unexpected diagnostics: {diags:?}");
        let (_, diags) = parse_and_resolve("module m(a = b, b = 1) cube(a); m();");
        assert!(
            diags.iter().any(|d| d.diagnostic.code == "E2000"),
            "a default must not see later parameters, got {diags:?}"
        );
    }

    #[test]
    fn builtin_and_unknown_functions() {
        let (_, diags) = parse_and_resolve("x = cos(1) + len([1, 2]);");
        assert!(diags.is_empty(), "unexpected diagnostics: {diags:?}");
        let (_, diags) = parse_and_resolve("x = frob(1);");
        assert!(diags.iter().any(|d| d.diagnostic.code == "E2001"));
    }

    #[test]
    fn function_values_in_variables_are_callable() {
        let (_, diags) = parse_and_resolve("f = function (x) x * 2; y = f(3);");
        assert!(diags.is_empty(), "unexpected diagnostics: {diags:?}");
    }

    #[test]
    fn resolution_is_idempotent() {
        let source = "\
module ring(n = 6, r = 10) {
    for (i = [0:n - 1]) rotate([0, 0, i * 360 / n]) translate([r, 0, 0]) children();
}
function squares(n) = [for (i = [0:n]) i * i];
s = squares(4);
ring(n = 4) cube(1);
";
        let (mut file, parse_diags) = parse_source(Path::new("test.scad"), source);
        assert!(parse_diags.is_empty(), "{parse_diags:?}");
        let first_diags = resolve(&mut file);
        let first = format!("{file:?}");
        let second_diags = resolve(&mut file);
        let second = format!("{file:?}");
        assert_eq!(first, second);
        assert_eq!(first_diags.len(), second_diags.len());
    }

    #[test]
    fn include_exports_variables_but_use_does_not() {
        let (lib, lib_diags) = parse_source(
            Path::new("lib.scad"),
            "module widget(w) cube(w);\nfunction twice(x) = x * 2;\nbase = 4;\n",
        );
        assert!(lib_diags.is_empty());

        let source = "include <lib.scad>\nwidget(base);\nx = twice(base);\n";
        let (mut file, diags) = parse_source(Path::new("main.scad"), source);
        assert!(diags.is_empty());
        let deps = [Dependency {
            reference: "lib.scad".to_string(),
            file: &lib,
        }];
        let diags = resolve_with_deps(&mut file, &deps);
        assert!(diags.is_empty(), "include should export all: {diags:?}");

        let source = "use <lib.scad>\nwidget(1);\nx = base;\n";
        let (mut file, diags) = parse_source(Path::new("main.scad"), source);
        assert!(diags.is_empty());
        let deps = [Dependency {
            reference: "lib.scad".to_string(),
            file: &lib,
        }];
        let diags = resolve_with_deps(&mut file, &deps);
        assert!(
            diags.iter().any(|d| d.diagnostic.code == "E2000"),
            "use must hide top-level variables, got {diags:?}"
        );
        assert!(
            !diags.iter().any(|d| d.diagnostic.code == "W2000"),
            "use must still export modules, got {diags:?}"
        );
    }

    #[test]
    fn imported_sites_remember_their_source_file() {
        let (lib, _) = parse_source(Path::new("lib.scad"), "module widget(w) cube(w);\n");
        let (mut file, _) = parse_source(Path::new("main.scad"), "use <lib.scad>\nwidget(2);\n");
        let deps = [Dependency {
            reference: "lib.scad".to_string(),
            file: &lib,
        }];
        let diags = resolve_with_deps(&mut file, &deps);
        assert!(diags.is_empty(), "unexpected diagnostics: {diags:?}");
        let Statement::Inst(Instantiation {
            kind: InstKind::Single { call, .. },
            ..
        }) = &file.statements[1]
        else {
            panic!("expected instantiation");
        };
        let Some(Binding::Site(id)) = call.name.binding else {
            panic!("expected resolved module");
        };
        assert_eq!(
            file.bindings[id.0 as usize].source.as_deref(),
            Some("lib.scad")
        );
    }
}
