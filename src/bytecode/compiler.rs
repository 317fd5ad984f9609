//! Bytecode compiler: transforms AST into bytecode.
//!
//! Single pass, no intermediate representation. Static errors do not abort
//! compilation; they accumulate as [`Trap`]s and are reported together once
//! the whole program has been walked.

use std::rc::Rc;

use crate::ast::expr::{AstPattern, BinaryOp, Expr, ExprKind, UnaryOp};
use crate::ast::stmt::{ClassDecl, FunctionDecl, MatchArm, MethodDecl, Program, Stmt, StmtKind};
use crate::bytecode::chunk::{Constant, Function, FunctionKind};
use crate::bytecode::instruction::{OpCode, UpvalueInfo};
use crate::error::{SyntaxError, Trap};
use crate::pattern::{CompiledPattern, Pattern};
use crate::span::Span;

/// Maximum locals per function, imposed by upvalue index width.
const MAX_LOCALS: usize = 256;
/// Maximum parameters per function, imposed by the CALL operand width.
const MAX_PARAMS: usize = 255;

/// Compile a program into its top-level function.
///
/// `script` names the compilation unit in errors and stack traces.
pub fn compile(script: &str, program: &Program) -> Result<Rc<Function>, SyntaxError> {
    let mut compiler = Compiler::new(script);
    let function = compiler.run(program);
    if compiler.traps.is_empty() {
        Ok(Rc::new(function))
    } else {
        Err(SyntaxError::new(script, compiler.traps))
    }
}

/// The bytecode compiler.
struct Compiler {
    /// Current function being compiled
    current: FunctionCompiler,
    /// Stack of enclosing function compilers (for nested functions)
    enclosing: Vec<FunctionCompiler>,
    /// Current class being compiled (if any)
    current_class: Option<ClassContext>,
    /// Every static error found so far, in discovery order
    traps: Vec<Trap>,
}

/// Context for compiling a single function.
struct FunctionCompiler {
    /// The function being compiled
    function: Function,
    /// Local variables in current scope
    locals: Vec<Local>,
    /// Upvalues captured by this function
    upvalues: Vec<UpvalueInfo>,
    /// Current scope depth (0 = function top level)
    scope_depth: u32,
    /// Enclosing loops, innermost last
    loops: Vec<LoopContext>,
}

/// A local variable in a scope.
#[derive(Debug, Clone)]
struct Local {
    /// Variable name
    name: Rc<str>,
    /// Scope depth where defined; u32::MAX while uninitialized
    depth: u32,
    /// Whether captured by a closure
    is_captured: bool,
}

/// Context for an enclosing loop, for break and continue.
struct LoopContext {
    /// Bytecode offset continue jumps back to
    start: usize,
    /// Number of locals live when the loop began
    local_count: usize,
    /// Offsets of break jumps to patch at loop end
    break_jumps: Vec<usize>,
}

/// Context for class compilation.
#[derive(Debug, Clone)]
struct ClassContext {
    /// Whether this class has a superclass
    has_superclass: bool,
}

impl Compiler {
    fn new(script: &str) -> Self {
        Self {
            current: FunctionCompiler::new(format!("<{script}>"), FunctionKind::Script),
            enclosing: Vec::new(),
            current_class: None,
            traps: Vec::new(),
        }
    }

    fn run(&mut self, program: &Program) -> Function {
        for stmt in &program.statements {
            self.compile_statement(stmt);
        }

        // Implicit return null at end of script
        self.emit_op(OpCode::Null, 0);
        self.emit_op(OpCode::Return, 0);

        self.current.function.upvalue_count = self.current.upvalues.len();
        self.current.function.clone()
    }

    /// Record a static error and keep compiling.
    fn trap(&mut self, message: impl Into<String>, span: Span) {
        self.traps.push(Trap::new(message, span));
    }

    // ===== Statements =====

    fn compile_statement(&mut self, stmt: &Stmt) {
        let line = stmt.span.line;

        match &stmt.kind {
            StmtKind::Expression(expr) => {
                self.compile_expression(expr);
                self.emit_op(OpCode::Pop, line);
            }

            StmtKind::Var {
                pattern,
                initializer,
            } => {
                self.compile_var(pattern, initializer.as_ref(), stmt.span);
            }

            StmtKind::Block(statements) => {
                self.begin_scope();
                for stmt in statements {
                    self.compile_statement(stmt);
                }
                self.end_scope(line);
            }

            StmtKind::If {
                condition,
                then_branch,
                else_branch,
            } => {
                self.compile_expression(condition);

                let then_jump = self.emit_jump(OpCode::JumpIfFalse, line);
                self.emit_op(OpCode::Pop, line); // Pop condition

                self.compile_statement(then_branch);

                if let Some(else_stmt) = else_branch {
                    let else_jump = self.emit_jump(OpCode::Jump, line);
                    self.patch_jump(then_jump);
                    self.emit_op(OpCode::Pop, line); // Pop condition

                    self.compile_statement(else_stmt);
                    self.patch_jump(else_jump);
                } else {
                    self.patch_jump(then_jump);
                    self.emit_op(OpCode::Pop, line); // Pop condition
                }
            }

            StmtKind::While { condition, body } => {
                let loop_start = self.current_offset();
                self.begin_loop(loop_start);

                self.compile_expression(condition);
                let exit_jump = self.emit_jump(OpCode::JumpIfFalse, line);
                self.emit_op(OpCode::Pop, line);

                self.compile_statement(body);

                self.emit_loop(loop_start, line);
                self.patch_jump(exit_jump);
                self.emit_op(OpCode::Pop, line);
                self.end_loop();
            }

            StmtKind::ForEach {
                pattern,
                iterable,
                body,
            } => {
                self.compile_foreach(pattern, iterable, body, stmt.span);
            }

            StmtKind::Break => {
                if self.current.loops.is_empty() {
                    self.trap("Cannot use 'break' outside of a loop", stmt.span);
                    return;
                }
                self.emit_loop_unwind(line);
                let jump = self.emit_jump(OpCode::Jump, line);
                if let Some(ctx) = self.current.loops.last_mut() {
                    ctx.break_jumps.push(jump);
                }
            }

            StmtKind::Continue => {
                if self.current.loops.is_empty() {
                    self.trap("Cannot use 'continue' outside of a loop", stmt.span);
                    return;
                }
                self.emit_loop_unwind(line);
                let start = self.current.loops.last().map(|ctx| ctx.start).unwrap_or(0);
                self.emit_loop(start, line);
            }

            StmtKind::Return(expr) => {
                match self.current.function.kind {
                    FunctionKind::Script => {
                        self.trap("Cannot return from top-level code", stmt.span);
                        return;
                    }
                    FunctionKind::StaticInitializer => {
                        self.trap("Cannot return from a static initializer", stmt.span);
                        return;
                    }
                    FunctionKind::Initializer => {
                        if expr.is_some() {
                            self.trap(
                                "Cannot return a value from an initializer",
                                stmt.span,
                            );
                            return;
                        }
                        // init returns this
                        self.emit_op(OpCode::GetLocal, line);
                        self.emit_u16(0, line);
                        self.emit_op(OpCode::Return, line);
                        return;
                    }
                    _ => {}
                }
                if let Some(e) = expr {
                    self.compile_expression(e);
                } else {
                    self.emit_op(OpCode::Null, line);
                }
                self.emit_op(OpCode::Return, line);
            }

            StmtKind::Assert {
                condition,
                message,
                text,
            } => {
                self.compile_expression(condition);
                let over = self.emit_jump(OpCode::JumpIfTrue, line);
                self.emit_op(OpCode::Pop, line);
                if let Some(message) = message {
                    self.compile_expression(message);
                } else {
                    let idx =
                        self.add_constant(Constant::string(format!("Assertion failed: {text}")));
                    self.emit_op(OpCode::Constant, line);
                    self.emit_u16(idx, line);
                }
                self.emit_op(OpCode::Assert, line);
                self.patch_jump(over);
                self.emit_op(OpCode::Pop, line);
            }

            StmtKind::Match { target, arms } => {
                self.compile_match(target, arms, stmt.span);
            }

            StmtKind::Function(decl) => {
                self.compile_function_decl(decl);
            }

            StmtKind::Class(decl) => {
                self.compile_class_decl(decl);
            }
        }
    }

    /// Compile a variable declaration, destructuring included.
    fn compile_var(&mut self, pattern: &AstPattern, initializer: Option<&Expr>, span: Span) {
        let line = span.line;

        // Fast paths: plain names and wildcards need no pattern machinery.
        match pattern {
            AstPattern::Variable(name) => {
                if self.current.scope_depth > 0 {
                    self.declare_local(name, span);
                    if let Some(init) = initializer {
                        self.compile_expression(init);
                    } else {
                        self.emit_op(OpCode::Null, line);
                    }
                    self.mark_initialized(1);
                } else {
                    if let Some(init) = initializer {
                        self.compile_expression(init);
                    } else {
                        self.emit_op(OpCode::Null, line);
                    }
                    let name_idx = self.identifier_constant(name);
                    self.emit_op(OpCode::DefineGlobal, line);
                    self.emit_u16(name_idx, line);
                }
                return;
            }
            AstPattern::Wildcard => {
                if let Some(init) = initializer {
                    self.compile_expression(init);
                    self.emit_op(OpCode::Pop, line);
                }
                return;
            }
            _ => {}
        }

        let Some(init) = initializer else {
            self.trap("Destructuring declaration requires an initializer", span);
            return;
        };

        let lowered = self.lower_pattern(pattern, span);

        if self.current.scope_depth > 0 {
            // Placeholders first, uninitialized, so the initializer cannot
            // read the names it is about to bind.
            let base_slot = self.current.locals.len() as u16;
            for name in &lowered.bindings {
                self.declare_local(name, span);
                self.emit_op(OpCode::Null, line);
            }

            self.compile_expression(init);
            self.emit_pattern_constants(&lowered.constants, line);
            self.mark_initialized(lowered.bindings.len());

            let pat_idx = self.pattern_constant(lowered);
            self.emit_op(OpCode::MatchLocal, line);
            self.emit_u16(pat_idx, line);
            self.emit_u16(base_slot, line);
        } else {
            self.compile_expression(init);
            self.emit_pattern_constants(&lowered.constants, line);
            let pat_idx = self.pattern_constant(lowered);
            self.emit_op(OpCode::MatchGlobal, line);
            self.emit_u16(pat_idx, line);
        }

        // Declarations are irrefutable: a failed match is a runtime fault.
        let ok = self.emit_jump(OpCode::JumpIfTrue, line);
        self.emit_op(OpCode::Pop, line); // bool
        self.emit_op(OpCode::PatternFail, line);
        self.patch_jump(ok);
        self.emit_op(OpCode::Pop, line); // bool
        self.emit_op(OpCode::Pop, line); // target
    }

    fn compile_foreach(&mut self, pattern: &AstPattern, iterable: &Expr, body: &Stmt, span: Span) {
        let line = span.line;

        self.begin_scope();

        // The iterator lives in a hidden local for the whole loop.
        self.compile_expression(iterable);
        self.emit_op(OpCode::GetIterator, line);
        self.declare_local("<iter>", span);
        self.mark_initialized(1);
        let iter_slot = self.current.locals.len() as u16 - 1;

        let loop_start = self.current_offset();
        self.begin_loop(loop_start);

        // IterNext reads the iterator in place and pushes the next element,
        // or jumps past the loop when exhausted.
        self.emit_op(OpCode::GetLocal, line);
        self.emit_u16(iter_slot, line);
        let exit_jump = self.emit_jump(OpCode::IterNext, line);

        self.begin_scope();
        self.declare_local("<element>", span);
        self.mark_initialized(1);
        let element_slot = self.current.locals.len() as u16 - 1;

        let lowered = self.lower_pattern(pattern, span);
        let base_slot = self.current.locals.len() as u16;
        for name in &lowered.bindings {
            self.declare_local(name, span);
            self.emit_op(OpCode::Null, line);
        }
        self.mark_initialized(lowered.bindings.len());

        self.emit_op(OpCode::GetLocal, line);
        self.emit_u16(element_slot, line);
        self.emit_pattern_constants(&lowered.constants, line);
        let pat_idx = self.pattern_constant(lowered);
        self.emit_op(OpCode::MatchLocal, line);
        self.emit_u16(pat_idx, line);
        self.emit_u16(base_slot, line);

        // An element that does not fit the pattern is skipped.
        let skip = self.emit_jump(OpCode::JumpIfFalse, line);
        self.emit_op(OpCode::Pop, line); // bool
        self.emit_op(OpCode::Pop, line); // element copy

        self.compile_statement(body);

        let join = self.emit_jump(OpCode::Jump, line);
        self.patch_jump(skip);
        self.emit_op(OpCode::Pop, line); // bool
        self.emit_op(OpCode::Pop, line); // element copy
        self.patch_jump(join);

        self.end_scope(line);
        self.emit_loop(loop_start, line);

        self.patch_jump(exit_jump);
        self.end_loop();
        self.end_scope(line);
    }

    fn compile_match(&mut self, target: &Expr, arms: &[MatchArm], span: Span) {
        let line = span.line;

        self.begin_scope();
        self.compile_expression(target);
        self.declare_local("<match>", span);
        self.mark_initialized(1);
        let target_slot = self.current.locals.len() as u16 - 1;

        let mut end_jumps = Vec::new();

        for arm in arms {
            let line = arm.span.line;
            self.begin_scope();

            let lowered = self.lower_pattern(&arm.pattern, arm.span);
            let base_slot = self.current.locals.len() as u16;
            for name in &lowered.bindings {
                self.declare_local(name, arm.span);
                self.emit_op(OpCode::Null, line);
            }
            self.mark_initialized(lowered.bindings.len());

            self.emit_op(OpCode::GetLocal, line);
            self.emit_u16(target_slot, line);
            self.emit_pattern_constants(&lowered.constants, line);
            let pat_idx = self.pattern_constant(lowered);
            self.emit_op(OpCode::MatchLocal, line);
            self.emit_u16(pat_idx, line);
            self.emit_u16(base_slot, line);

            let match_fail = self.emit_jump(OpCode::JumpIfFalse, line);
            self.emit_op(OpCode::Pop, line); // bool
            self.emit_op(OpCode::Pop, line); // target copy

            let guard_fail = arm.guard.as_ref().map(|guard| {
                self.compile_expression(guard);
                let jump = self.emit_jump(OpCode::JumpIfFalse, line);
                self.emit_op(OpCode::Pop, line);
                jump
            });

            for stmt in &arm.body {
                self.compile_statement(stmt);
            }

            self.emit_scope_cleanup(line);
            end_jumps.push(self.emit_jump(OpCode::Jump, line));

            // Failure paths rejoin below with the arm's bindings still on
            // the stack, then discard them and fall through to the next arm.
            if let Some(guard_fail) = guard_fail {
                self.patch_jump(guard_fail);
                self.emit_op(OpCode::Pop, line); // guard value
                let skip = self.emit_jump(OpCode::Jump, line);
                self.patch_jump(match_fail);
                self.emit_op(OpCode::Pop, line); // bool
                self.emit_op(OpCode::Pop, line); // target copy
                self.patch_jump(skip);
            } else {
                self.patch_jump(match_fail);
                self.emit_op(OpCode::Pop, line); // bool
                self.emit_op(OpCode::Pop, line); // target copy
            }
            self.emit_scope_cleanup(line);
            self.discard_scope();
        }

        for jump in end_jumps {
            self.patch_jump(jump);
        }
        self.end_scope(line);
    }

    // ===== Expressions =====

    fn compile_expression(&mut self, expr: &Expr) {
        let line = expr.span.line;

        match &expr.kind {
            ExprKind::Number(n) => {
                let idx = self.add_constant(Constant::Number(*n));
                self.emit_op(OpCode::Constant, line);
                self.emit_u16(idx, line);
            }

            ExprKind::Str(s) => {
                let idx = self.add_constant(Constant::string(s));
                self.emit_op(OpCode::Constant, line);
                self.emit_u16(idx, line);
            }

            ExprKind::Keyword(k) => {
                let idx = self.add_constant(Constant::Keyword(Rc::from(k.as_str())));
                self.emit_op(OpCode::Constant, line);
                self.emit_u16(idx, line);
            }

            ExprKind::Bool(b) => {
                if *b {
                    self.emit_op(OpCode::True, line);
                } else {
                    self.emit_op(OpCode::False, line);
                }
            }

            ExprKind::Null => {
                self.emit_op(OpCode::Null, line);
            }

            ExprKind::Variable(name) => {
                self.compile_variable_get(name, expr.span);
            }

            ExprKind::Binary {
                left,
                operator,
                right,
            } => {
                self.compile_expression(left);
                self.compile_expression(right);
                self.emit_binary_op(*operator, line);
            }

            ExprKind::Unary { operator, operand } => {
                self.compile_expression(operand);
                match operator {
                    UnaryOp::Negate => self.emit_op(OpCode::Negate, line),
                    UnaryOp::Not => self.emit_op(OpCode::Not, line),
                }
            }

            ExprKind::Grouping(inner) => {
                self.compile_expression(inner);
            }

            ExprKind::LogicalAnd { left, right } => {
                self.compile_expression(left);
                // Short-circuit: if left is falsey it is the result
                let jump = self.emit_jump(OpCode::JumpIfFalse, line);
                self.emit_op(OpCode::Pop, line);
                self.compile_expression(right);
                self.patch_jump(jump);
            }

            ExprKind::LogicalOr { left, right } => {
                self.compile_expression(left);
                // Short-circuit: if left is truthy it is the result
                let jump = self.emit_jump(OpCode::JumpIfTrue, line);
                self.emit_op(OpCode::Pop, line);
                self.compile_expression(right);
                self.patch_jump(jump);
            }

            ExprKind::Assign { target, value } => match &target.kind {
                ExprKind::Variable(name) => {
                    self.compile_expression(value);
                    self.compile_variable_set(name, expr.span);
                }
                ExprKind::Member { object, name } => {
                    self.compile_expression(object);
                    self.compile_expression(value);
                    let name_idx = self.identifier_constant(name);
                    self.emit_op(OpCode::SetProperty, line);
                    self.emit_u16(name_idx, line);
                }
                ExprKind::Index { object, index } => {
                    self.compile_expression(object);
                    self.compile_expression(index);
                    self.compile_expression(value);
                    self.emit_op(OpCode::IndexSet, line);
                }
                _ => {
                    self.trap("Invalid assignment target", target.span);
                }
            },

            ExprKind::CompoundAssign {
                target,
                operator,
                value,
            } => {
                self.compile_in_place_update(target, line, |compiler| {
                    compiler.compile_expression(value);
                    compiler.emit_binary_op(*operator, line);
                });
            }

            ExprKind::Increment {
                target,
                delta,
                prefix,
            } => {
                let delta_idx = self.add_constant(Constant::Number(*delta));
                self.compile_in_place_update(target, line, |compiler| {
                    compiler.emit_op(OpCode::Constant, line);
                    compiler.emit_u16(delta_idx, line);
                    compiler.emit_op(OpCode::Add, line);
                });
                if !prefix {
                    // Postfix yields the old value: undo the delta on the
                    // copy left on the stack.
                    self.emit_op(OpCode::Constant, line);
                    self.emit_u16(delta_idx, line);
                    self.emit_op(OpCode::Subtract, line);
                }
            }

            ExprKind::Call { callee, arguments } => {
                self.compile_expression(callee);
                if arguments.len() > MAX_PARAMS {
                    self.trap("Cannot have more than 255 arguments", expr.span);
                }
                for arg in arguments {
                    self.compile_expression(arg);
                }
                self.emit_op(OpCode::Call, line);
                self.emit_byte(arguments.len() as u8, line);
            }

            ExprKind::Lambda {
                params,
                varargs,
                body,
            } => {
                self.compile_function_body(
                    "<lambda>",
                    FunctionKind::Lambda,
                    params,
                    *varargs,
                    body,
                    expr.span,
                );
            }

            ExprKind::Member { object, name } => {
                self.compile_expression(object);
                let name_idx = self.identifier_constant(name);
                self.emit_op(OpCode::GetProperty, line);
                self.emit_u16(name_idx, line);
            }

            ExprKind::Index { object, index } => {
                self.compile_expression(object);
                self.compile_expression(index);
                self.emit_op(OpCode::Index, line);
            }

            ExprKind::This => {
                if self.resolve_local("this").is_none()
                    && self.resolve_upvalue_name("this").is_none()
                {
                    self.trap("Cannot use 'this' outside of a method", expr.span);
                    return;
                }
                self.compile_variable_get("this", expr.span);
            }

            ExprKind::Super { method } => {
                match &self.current_class {
                    None => {
                        self.trap("Cannot use 'super' outside of a class", expr.span);
                        return;
                    }
                    Some(ctx) if !ctx.has_superclass => {
                        self.trap(
                            "Cannot use 'super' in a class without a superclass",
                            expr.span,
                        );
                        return;
                    }
                    _ => {}
                }
                // Static bodies have no receiver to dispatch on.
                if self.resolve_local("this").is_none()
                    && self.resolve_upvalue_name("this").is_none()
                {
                    self.trap("Cannot use 'super' outside of a method", expr.span);
                    return;
                }
                // Receiver, then the statically captured superclass.
                self.compile_variable_get("this", expr.span);
                self.compile_variable_get("super", expr.span);
                let name_idx = self.identifier_constant(method);
                self.emit_op(OpCode::GetSuper, line);
                self.emit_u16(name_idx, line);
            }

            ExprKind::List(elements) => {
                for elem in elements {
                    self.compile_expression(elem);
                }
                self.emit_op(OpCode::BuildList, line);
                self.emit_u16(elements.len() as u16, line);
            }

            ExprKind::Map(pairs) => {
                for (key, value) in pairs {
                    self.compile_expression(key);
                    self.compile_expression(value);
                }
                self.emit_op(OpCode::BuildMap, line);
                self.emit_u16(pairs.len() as u16, line);
            }
        }
    }

    fn emit_binary_op(&mut self, operator: BinaryOp, line: u32) {
        let op = match operator {
            BinaryOp::Add => OpCode::Add,
            BinaryOp::Subtract => OpCode::Subtract,
            BinaryOp::Multiply => OpCode::Multiply,
            BinaryOp::Divide => OpCode::Divide,
            BinaryOp::Modulo => OpCode::Modulo,
            BinaryOp::Equal => OpCode::Equal,
            BinaryOp::NotEqual => OpCode::NotEqual,
            BinaryOp::Less => OpCode::Less,
            BinaryOp::LessEqual => OpCode::LessEqual,
            BinaryOp::Greater => OpCode::Greater,
            BinaryOp::GreaterEqual => OpCode::GreaterEqual,
        };
        self.emit_op(op, line);
    }

    /// Compile a read-modify-write on a storage location, evaluating the
    /// location's sub-expressions exactly once. `modify` receives the old
    /// value on top of the stack and must leave the new value there.
    fn compile_in_place_update(
        &mut self,
        target: &Expr,
        line: u32,
        modify: impl FnOnce(&mut Compiler),
    ) {
        match &target.kind {
            ExprKind::Variable(name) => {
                self.compile_variable_get(name, target.span);
                modify(self);
                self.compile_variable_set(name, target.span);
            }
            ExprKind::Member { object, name } => {
                self.compile_expression(object);
                self.emit_op(OpCode::Dup, line);
                let name_idx = self.identifier_constant(name);
                self.emit_op(OpCode::GetProperty, line);
                self.emit_u16(name_idx, line);
                modify(self);
                self.emit_op(OpCode::SetProperty, line);
                self.emit_u16(name_idx, line);
            }
            ExprKind::Index { object, index } => {
                self.compile_expression(object);
                self.compile_expression(index);
                self.emit_op(OpCode::Dup2, line);
                self.emit_op(OpCode::Index, line);
                modify(self);
                self.emit_op(OpCode::IndexSet, line);
            }
            _ => {
                self.trap("Invalid assignment target", target.span);
            }
        }
    }

    // ===== Variables =====

    fn compile_variable_get(&mut self, name: &str, span: Span) {
        let line = span.line;

        if let Some((slot, initialized)) = self.resolve_local(name) {
            if !initialized {
                self.trap(
                    format!("Cannot read variable '{name}' in its own initializer"),
                    span,
                );
                return;
            }
            self.emit_op(OpCode::GetLocal, line);
            self.emit_u16(slot as u16, line);
            return;
        }

        if let Some(idx) = self.resolve_upvalue_name(name) {
            self.emit_op(OpCode::GetUpvalue, line);
            self.emit_byte(idx, line);
            return;
        }

        let name_idx = self.identifier_constant(name);
        self.emit_op(OpCode::GetGlobal, line);
        self.emit_u16(name_idx, line);
    }

    fn compile_variable_set(&mut self, name: &str, span: Span) {
        let line = span.line;

        if let Some((slot, initialized)) = self.resolve_local(name) {
            if !initialized {
                self.trap(
                    format!("Cannot read variable '{name}' in its own initializer"),
                    span,
                );
                return;
            }
            self.emit_op(OpCode::SetLocal, line);
            self.emit_u16(slot as u16, line);
            return;
        }

        if let Some(idx) = self.resolve_upvalue_name(name) {
            self.emit_op(OpCode::SetUpvalue, line);
            self.emit_byte(idx, line);
            return;
        }

        let name_idx = self.identifier_constant(name);
        self.emit_op(OpCode::SetGlobal, line);
        self.emit_u16(name_idx, line);
    }

    // ===== Patterns =====

    fn lower_pattern(&mut self, ast: &AstPattern, span: Span) -> LoweredPattern {
        let mut lowered = LoweredPattern {
            pattern: Pattern::Wildcard,
            bindings: Vec::new(),
            constants: Vec::new(),
        };
        lowered.pattern = self.lower_pattern_node(ast, &mut lowered, span);
        lowered
    }

    fn lower_pattern_node(
        &mut self,
        ast: &AstPattern,
        out: &mut LoweredPattern,
        span: Span,
    ) -> Pattern {
        match ast {
            AstPattern::Wildcard => Pattern::Wildcard,
            AstPattern::Variable(name) => Pattern::ValueBinding(self.pattern_binding(name, out, span)),
            AstPattern::Binding(name, sub) => {
                let id = self.pattern_binding(name, out, span);
                let sub = self.lower_pattern_node(sub, out, span);
                Pattern::SubPatternBinding(id, Box::new(sub))
            }
            AstPattern::Constant(expr) => {
                out.constants.push(expr.clone());
                Pattern::Value(out.constants.len() - 1)
            }
            AstPattern::List(elements, tail) => {
                let elements = elements
                    .iter()
                    .map(|e| self.lower_pattern_node(e, out, span))
                    .collect();
                let tail = tail
                    .as_ref()
                    .map(|name| self.pattern_binding(name, out, span));
                Pattern::List(elements, tail)
            }
            AstPattern::Map(entries) => {
                let entries = entries
                    .iter()
                    .map(|(key, sub)| {
                        out.constants.push(key.clone());
                        let key_id = out.constants.len() - 1;
                        (key_id, self.lower_pattern_node(sub, out, span))
                    })
                    .collect();
                Pattern::Map(entries)
            }
        }
    }

    /// Assign an id to a pattern variable, in first-appearance order.
    fn pattern_binding(&mut self, name: &str, out: &mut LoweredPattern, span: Span) -> usize {
        if out.bindings.iter().any(|n| &**n == name) {
            self.trap(format!("Duplicate variable '{name}' in pattern"), span);
        }
        out.bindings.push(Rc::from(name));
        out.bindings.len() - 1
    }

    /// Compile the pattern's interpolated constants and collect them into a
    /// list the match instruction pops.
    fn emit_pattern_constants(&mut self, constants: &[Expr], line: u32) {
        for expr in constants {
            self.compile_expression(expr);
        }
        self.emit_op(OpCode::BuildList, line);
        self.emit_u16(constants.len() as u16, line);
    }

    fn pattern_constant(&mut self, lowered: LoweredPattern) -> u16 {
        let compiled = CompiledPattern::new(
            lowered.pattern,
            lowered.bindings,
            lowered.constants.len(),
        );
        self.add_constant(Constant::Pattern(Rc::new(compiled)))
    }

    // ===== Functions & classes =====

    fn compile_function_decl(&mut self, decl: &FunctionDecl) {
        let line = decl.span.line;

        // Declared before the body so the function can call itself.
        if self.current.scope_depth > 0 {
            self.declare_local(&decl.name, decl.span);
            self.mark_initialized(1);
        }

        self.compile_function_body(
            &decl.name,
            FunctionKind::Function,
            &decl.params,
            decl.varargs,
            &decl.body,
            decl.span,
        );

        if self.current.scope_depth == 0 {
            let name_idx = self.identifier_constant(&decl.name);
            self.emit_op(OpCode::DefineGlobal, line);
            self.emit_u16(name_idx, line);
        }
    }

    fn compile_function_body(
        &mut self,
        name: &str,
        kind: FunctionKind,
        params: &[String],
        varargs: bool,
        body: &[Stmt],
        span: Span,
    ) {
        let line = span.line;

        if params.len() > MAX_PARAMS {
            self.trap("Cannot have more than 255 parameters", span);
        }

        self.begin_function(name, kind, span);
        self.current.function.varargs = varargs;
        self.current.function.params = params.iter().map(|p| Rc::from(p.as_str())).collect();

        for param in params {
            self.declare_local(param, span);
            self.mark_initialized(1);
        }

        for stmt in body {
            self.compile_statement(stmt);
        }

        // Implicit return
        if kind == FunctionKind::Initializer {
            self.emit_op(OpCode::GetLocal, line);
            self.emit_u16(0, line);
        } else {
            self.emit_op(OpCode::Null, line);
        }
        self.emit_op(OpCode::Return, line);

        let (function, upvalues) = self.end_function();

        let func_idx = self.add_constant(Constant::Function(Rc::new(function)));
        self.emit_op(OpCode::Closure, line);
        self.emit_u16(func_idx, line);
        for upvalue in &upvalues {
            self.emit_byte(u8::from(upvalue.is_local), line);
            self.emit_byte(upvalue.index, line);
        }
    }

    fn compile_class_decl(&mut self, decl: &ClassDecl) {
        let line = decl.span.line;
        let has_superclass = decl.superclass.is_some();

        if self.current.scope_depth > 0 {
            self.declare_local(&decl.name, decl.span);
            self.mark_initialized(1);
        }

        let name_idx = self.identifier_constant(&decl.name);
        self.emit_op(OpCode::Class, line);
        self.emit_u16(name_idx, line);

        if self.current.scope_depth == 0 {
            self.emit_op(OpCode::DefineGlobal, line);
            self.emit_u16(name_idx, line);
        }

        let old_class = self
            .current_class
            .replace(ClassContext { has_superclass });

        if let Some(superclass) = &decl.superclass {
            if matches!(&superclass.kind, ExprKind::Variable(name) if *name == decl.name) {
                self.trap("A class cannot inherit from itself", superclass.span);
            }
            // The superclass is captured in a scoped "super" local so method
            // bodies can close over it.
            self.begin_scope();
            self.compile_expression(superclass);
            self.declare_local("super", decl.span);
            self.mark_initialized(1);

            self.compile_variable_get(&decl.name, decl.span);
            self.emit_op(OpCode::Inherit, line);
        }

        // Class back on the stack for method definition.
        self.compile_variable_get(&decl.name, decl.span);

        for method in &decl.methods {
            self.compile_method(method, false);
        }
        for method in &decl.static_methods {
            self.compile_method(method, true);
        }

        if !decl.static_init.is_empty() {
            // Class-body statements run once, immediately, as a closure so
            // they can reference the finished class.
            self.compile_function_body(
                &format!("{}.<static>", decl.name),
                FunctionKind::StaticInitializer,
                &[],
                false,
                &decl.static_init,
                decl.span,
            );
            self.emit_op(OpCode::Call, line);
            self.emit_byte(0, line);
            self.emit_op(OpCode::Pop, line);
        }

        self.emit_op(OpCode::Pop, line); // class

        if has_superclass {
            self.end_scope(line);
        }

        self.current_class = old_class;
    }

    fn compile_method(&mut self, method: &MethodDecl, is_static: bool) {
        let line = method.span.line;
        let kind = if is_static {
            FunctionKind::StaticMethod
        } else if method.name == "init" {
            FunctionKind::Initializer
        } else {
            FunctionKind::Method
        };

        self.compile_function_body(
            &method.name,
            kind,
            &method.params,
            method.varargs,
            &method.body,
            method.span,
        );

        let name_idx = self.identifier_constant(&method.name);
        if is_static {
            self.emit_op(OpCode::StaticMethod, line);
        } else {
            self.emit_op(OpCode::Method, line);
        }
        self.emit_u16(name_idx, line);
    }

    fn begin_function(&mut self, name: &str, kind: FunctionKind, span: Span) {
        let mut function = Function::new(name, kind);
        function.line = span.line;
        let new_compiler = FunctionCompiler {
            function,
            locals: Vec::new(),
            upvalues: Vec::new(),
            scope_depth: 1,
            loops: Vec::new(),
        };
        let old_compiler = std::mem::replace(&mut self.current, new_compiler);
        self.enclosing.push(old_compiler);

        // Slot 0 holds the receiver in methods and is otherwise reserved.
        let slot_zero = match kind {
            FunctionKind::Method | FunctionKind::Initializer => "this",
            _ => "",
        };
        self.current.locals.push(Local {
            name: Rc::from(slot_zero),
            depth: 0,
            is_captured: false,
        });
    }

    fn end_function(&mut self) -> (Function, Vec<UpvalueInfo>) {
        self.current.function.upvalue_count = self.current.upvalues.len();
        let upvalues = std::mem::take(&mut self.current.upvalues);
        let function = self.current.function.clone();

        if let Some(enclosing) = self.enclosing.pop() {
            self.current = enclosing;
        }

        (function, upvalues)
    }

    // ===== Scope management =====

    fn begin_scope(&mut self) {
        self.current.scope_depth += 1;
    }

    fn end_scope(&mut self, line: u32) {
        self.emit_scope_cleanup(line);
        self.discard_scope();
    }

    /// Emit the pops for the innermost scope without forgetting its locals.
    fn emit_scope_cleanup(&mut self, line: u32) {
        let depth = self.current.scope_depth;
        let captured: Vec<bool> = self
            .current
            .locals
            .iter()
            .rev()
            .take_while(|local| local.depth >= depth && local.depth != u32::MAX)
            .map(|local| local.is_captured)
            .collect();
        for is_captured in captured {
            if is_captured {
                self.emit_op(OpCode::CloseUpvalue, line);
            } else {
                self.emit_op(OpCode::Pop, line);
            }
        }
    }

    /// Forget the innermost scope's locals without emitting anything.
    fn discard_scope(&mut self) {
        self.current.scope_depth -= 1;
        while let Some(local) = self.current.locals.last() {
            if local.depth <= self.current.scope_depth {
                break;
            }
            self.current.locals.pop();
        }
    }

    fn declare_local(&mut self, name: &str, span: Span) {
        for local in self.current.locals.iter().rev() {
            if local.depth != u32::MAX && local.depth < self.current.scope_depth {
                break;
            }
            if &*local.name == name {
                self.trap(
                    format!("Variable '{name}' already declared in this scope"),
                    span,
                );
                return;
            }
        }

        if self.current.locals.len() >= MAX_LOCALS {
            self.trap("Too many local variables in function", span);
            return;
        }

        self.current.locals.push(Local {
            name: Rc::from(name),
            depth: u32::MAX, // Not yet initialized
            is_captured: false,
        });
    }

    /// Mark the last `count` declared locals as initialized.
    fn mark_initialized(&mut self, count: usize) {
        let depth = self.current.scope_depth;
        let len = self.current.locals.len();
        for local in &mut self.current.locals[len.saturating_sub(count)..] {
            local.depth = depth;
        }
    }

    fn resolve_local(&self, name: &str) -> Option<(usize, bool)> {
        for (i, local) in self.current.locals.iter().enumerate().rev() {
            if &*local.name == name && !local.name.is_empty() {
                return Some((i, local.depth != u32::MAX));
            }
        }
        None
    }

    /// Resolve a name as an upvalue of the current function, capturing it
    /// transitively through every enclosing function in between.
    fn resolve_upvalue_name(&mut self, name: &str) -> Option<u8> {
        let level = self.enclosing.len();
        self.resolve_upvalue_at(level, name)
    }

    fn resolve_upvalue_at(&mut self, level: usize, name: &str) -> Option<u8> {
        if level == 0 {
            return None;
        }
        let parent = level - 1;

        let found = self
            .frame(parent)
            .locals
            .iter()
            .enumerate()
            .rev()
            .find(|(_, local)| &*local.name == name && !local.name.is_empty())
            .map(|(i, _)| i);
        if let Some(slot) = found {
            self.frame_mut(parent).locals[slot].is_captured = true;
            return Some(self.add_upvalue_at(level, slot as u8, true));
        }

        if let Some(idx) = self.resolve_upvalue_at(parent, name) {
            return Some(self.add_upvalue_at(level, idx, false));
        }

        None
    }

    fn add_upvalue_at(&mut self, level: usize, index: u8, is_local: bool) -> u8 {
        let frame = self.frame_mut(level);
        for (i, upvalue) in frame.upvalues.iter().enumerate() {
            if upvalue.index == index && upvalue.is_local == is_local {
                return i as u8;
            }
        }

        let count = frame.upvalues.len();
        if count >= MAX_LOCALS {
            self.trap("Too many captured variables in function", Span::default());
            return 0;
        }
        frame.upvalues.push(UpvalueInfo::new(is_local, index));
        count as u8
    }

    fn frame(&self, level: usize) -> &FunctionCompiler {
        if level == self.enclosing.len() {
            &self.current
        } else {
            &self.enclosing[level]
        }
    }

    fn frame_mut(&mut self, level: usize) -> &mut FunctionCompiler {
        if level == self.enclosing.len() {
            &mut self.current
        } else {
            &mut self.enclosing[level]
        }
    }

    // ===== Loops =====

    fn begin_loop(&mut self, start: usize) {
        let local_count = self.current.locals.len();
        self.current.loops.push(LoopContext {
            start,
            local_count,
            break_jumps: Vec::new(),
        });
    }

    fn end_loop(&mut self) {
        if let Some(ctx) = self.current.loops.pop() {
            for jump in ctx.break_jumps {
                self.patch_jump(jump);
            }
        }
    }

    /// Emit pops for locals declared inside the innermost loop, for break
    /// and continue. Compile-time local state is untouched; control flow
    /// that stays in the loop still needs those slots.
    fn emit_loop_unwind(&mut self, line: u32) {
        let Some(ctx) = self.current.loops.last() else {
            return;
        };
        let captured: Vec<bool> = self.current.locals[ctx.local_count..]
            .iter()
            .rev()
            .map(|local| local.is_captured)
            .collect();
        for is_captured in captured {
            if is_captured {
                self.emit_op(OpCode::CloseUpvalue, line);
            } else {
                self.emit_op(OpCode::Pop, line);
            }
        }
    }

    // ===== Bytecode emission =====

    fn emit_op(&mut self, op: OpCode, line: u32) {
        self.current.function.chunk.write_op(op, line);
    }

    fn emit_byte(&mut self, byte: u8, line: u32) {
        self.current.function.chunk.write_byte(byte, line);
    }

    fn emit_u16(&mut self, value: u16, line: u32) {
        self.current.function.chunk.write_u16(value, line);
    }

    fn emit_jump(&mut self, op: OpCode, line: u32) -> usize {
        self.emit_op(op, line);
        let offset = self.current.function.chunk.current_offset();
        self.emit_u16(0xFFFF, line); // Placeholder
        offset
    }

    fn patch_jump(&mut self, offset: usize) {
        let distance = self.current.function.chunk.current_offset() - offset - 2;
        if distance > u16::MAX as usize {
            self.trap("Too much code to jump over", Span::default());
            return;
        }
        self.current.function.chunk.patch_jump(offset);
    }

    fn emit_loop(&mut self, loop_start: usize, line: u32) {
        self.emit_op(OpCode::Loop, line);
        let offset = self.current.function.chunk.current_offset() + 2 - loop_start;
        if offset > u16::MAX as usize {
            self.trap("Loop body too large", Span::line(line));
        }
        self.emit_u16(offset as u16, line);
    }

    fn current_offset(&self) -> usize {
        self.current.function.chunk.current_offset()
    }

    fn add_constant(&mut self, constant: Constant) -> u16 {
        self.current.function.chunk.add_constant(constant)
    }

    fn identifier_constant(&mut self, name: &str) -> u16 {
        self.add_constant(Constant::string(name))
    }
}

impl FunctionCompiler {
    fn new(name: impl AsRef<str>, kind: FunctionKind) -> Self {
        let mut compiler = Self {
            function: Function::new(name, kind),
            locals: Vec::new(),
            upvalues: Vec::new(),
            scope_depth: 0,
            loops: Vec::new(),
        };
        // Slot 0 is reserved at the top level too; host re-entry relies on
        // every frame owning its base slot.
        compiler.locals.push(Local {
            name: Rc::from(""),
            depth: 0,
            is_captured: false,
        });
        compiler
    }
}

/// A pattern mid-lowering: the tree plus its binding names and the constant
/// expressions it interpolates, both in discovery order.
struct LoweredPattern {
    pattern: Pattern,
    bindings: Vec<Rc<str>>,
    constants: Vec<Expr>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::expr::Expr;
    use crate::ast::stmt::Stmt;
    use pretty_assertions::assert_eq;

    fn compile_program(statements: Vec<Stmt>) -> Result<Rc<Function>, SyntaxError> {
        compile("test.sk", &Program::new(statements))
    }

    fn ops_of(function: &Function) -> Vec<OpCode> {
        let chunk = &function.chunk;
        let mut ops = Vec::new();
        let mut offset = 0;
        while offset < chunk.code.len() {
            let op = OpCode::from_u8(chunk.code[offset]).expect("valid opcode");
            ops.push(op);
            offset += 1 + op.operand_size();
            if op == OpCode::Closure {
                let func_idx = chunk.read_u16(offset - 2) as usize;
                if let Constant::Function(f) = &chunk.constants[func_idx] {
                    offset += 2 * f.upvalue_count;
                }
            }
        }
        ops
    }

    #[test]
    fn test_compile_arithmetic_expression() {
        let function = compile_program(vec![Stmt::expr(Expr::binary(
            Expr::number(1.0),
            BinaryOp::Add,
            Expr::number(2.0),
        ))])
        .unwrap();

        assert_eq!(
            ops_of(&function),
            vec![
                OpCode::Constant,
                OpCode::Constant,
                OpCode::Add,
                OpCode::Pop,
                OpCode::Null,
                OpCode::Return,
            ]
        );
    }

    #[test]
    fn test_global_var_defines_name() {
        let function = compile_program(vec![Stmt::var("x", Expr::number(42.0))]).unwrap();
        assert_eq!(
            ops_of(&function),
            vec![
                OpCode::Constant,
                OpCode::DefineGlobal,
                OpCode::Null,
                OpCode::Return,
            ]
        );
    }

    #[test]
    fn test_local_read_in_own_initializer_is_trapped() {
        let result = compile_program(vec![Stmt::block(vec![Stmt::var("x", Expr::var("x"))])]);
        let err = result.unwrap_err();
        assert_eq!(err.traps.len(), 1);
        assert!(err.traps[0].message.contains("its own initializer"));
    }

    #[test]
    fn test_errors_are_batched_not_first_wins() {
        let result = compile_program(vec![
            Stmt::new(StmtKind::Break, Span::line(1)),
            Stmt::new(StmtKind::Continue, Span::line(2)),
            Stmt::expr(Expr::this().at(3)),
        ]);
        let err = result.unwrap_err();
        assert_eq!(err.traps.len(), 3);
        assert!(err.traps[0].message.contains("break"));
        assert!(err.traps[1].message.contains("continue"));
        assert!(err.traps[2].message.contains("this"));
    }

    #[test]
    fn test_duplicate_local_is_trapped() {
        let result = compile_program(vec![Stmt::block(vec![
            Stmt::var("x", Expr::number(1.0)),
            Stmt::var("x", Expr::number(2.0)),
        ])]);
        let err = result.unwrap_err();
        assert!(err.traps[0].message.contains("already declared"));
    }

    #[test]
    fn test_return_at_top_level_is_trapped() {
        let result = compile_program(vec![Stmt::ret(Some(Expr::number(1.0)))]);
        assert!(result.is_err());
    }

    #[test]
    fn test_too_many_parameters_is_trapped() {
        let params: Vec<String> = (0..256).map(|i| format!("p{i}")).collect();
        let param_refs: Vec<&str> = params.iter().map(String::as_str).collect();
        let result = compile_program(vec![Stmt::func("big", param_refs, vec![])]);
        let err = result.unwrap_err();
        assert!(err.traps[0].message.contains("255 parameters"));
    }

    #[test]
    fn test_lambda_captures_local_as_upvalue() {
        // { var a = 1; var f = \ -> { return a; }; }
        let result = compile_program(vec![Stmt::block(vec![
            Stmt::var("a", Expr::number(1.0)),
            Stmt::var(
                "f",
                Expr::lambda(vec![], vec![Stmt::ret(Some(Expr::var("a")))]),
            ),
        ])])
        .unwrap();

        let lambda = result
            .chunk
            .constants
            .iter()
            .find_map(|c| match c {
                Constant::Function(f) => Some(f.clone()),
                _ => None,
            })
            .expect("lambda constant");
        assert_eq!(lambda.upvalue_count, 1);
        assert_eq!(ops_of(&lambda)[0], OpCode::GetUpvalue);
    }

    #[test]
    fn test_destructuring_var_emits_match() {
        // var [a, b] = [1, 2];
        let pattern = AstPattern::List(
            vec![
                AstPattern::Variable("a".into()),
                AstPattern::Variable("b".into()),
            ],
            None,
        );
        let function = compile_program(vec![Stmt::block(vec![Stmt::var_pattern(
            pattern,
            Expr::list(vec![Expr::number(1.0), Expr::number(2.0)]),
        )])])
        .unwrap();

        let ops = ops_of(&function);
        assert!(ops.contains(&OpCode::MatchLocal));
        assert!(ops.contains(&OpCode::PatternFail));
    }

    #[test]
    fn test_pattern_bindings_in_first_appearance_order() {
        // var [a = [b : c], d] = ...;
        let pattern = AstPattern::List(
            vec![
                AstPattern::Binding(
                    "a".into(),
                    Box::new(AstPattern::List(
                        vec![AstPattern::Variable("b".into())],
                        Some("c".into()),
                    )),
                ),
                AstPattern::Variable("d".into()),
            ],
            None,
        );
        let function = compile_program(vec![Stmt::block(vec![Stmt::var_pattern(
            pattern,
            Expr::list(vec![]),
        )])])
        .unwrap();

        let compiled = function
            .chunk
            .constants
            .iter()
            .find_map(|c| match c {
                Constant::Pattern(p) => Some(p.clone()),
                _ => None,
            })
            .expect("pattern constant");
        let names: Vec<&str> = compiled.bindings.iter().map(|n| &**n).collect();
        assert_eq!(names, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_duplicate_pattern_variable_is_trapped() {
        let pattern = AstPattern::List(
            vec![
                AstPattern::Variable("x".into()),
                AstPattern::Variable("x".into()),
            ],
            None,
        );
        let result = compile_program(vec![Stmt::var_pattern(pattern, Expr::list(vec![]))]);
        let err = result.unwrap_err();
        assert!(err.traps[0].message.contains("Duplicate variable"));
    }

    #[test]
    fn test_while_loop_shape() {
        let function = compile_program(vec![Stmt::while_(
            Expr::bool(true),
            Stmt::block(vec![Stmt::expr(Expr::number(1.0))]),
        )])
        .unwrap();

        let ops = ops_of(&function);
        assert!(ops.contains(&OpCode::Loop));
        assert!(ops.contains(&OpCode::JumpIfFalse));
    }

    #[test]
    fn test_foreach_emits_iterator_protocol() {
        let function = compile_program(vec![Stmt::foreach(
            AstPattern::Variable("x".into()),
            Expr::list(vec![Expr::number(1.0)]),
            Stmt::block(vec![]),
        )])
        .unwrap();

        let ops = ops_of(&function);
        assert!(ops.contains(&OpCode::GetIterator));
        assert!(ops.contains(&OpCode::IterNext));
        assert!(ops.contains(&OpCode::MatchLocal));
    }

    #[test]
    fn test_break_jump_overflow_is_trapped_not_panicking() {
        // A break at the top of a loop body too large for a u16 jump.
        let mut body = vec![Stmt::new(StmtKind::Break, Span::line(1))];
        for _ in 0..33000 {
            body.push(Stmt::expr(Expr::null()));
        }
        let result = compile_program(vec![Stmt::while_(Expr::bool(true), Stmt::block(body))]);
        let err = result.unwrap_err();
        assert!(err
            .traps
            .iter()
            .any(|t| t.message.contains("Too much code to jump over")));
    }

    #[test]
    fn test_postfix_increment_restores_old_value() {
        let function =
            compile_program(vec![Stmt::expr(Expr::incr(Expr::var("x"), 1.0, false))]).unwrap();
        let ops = ops_of(&function);
        // new value stored, then the delta subtracted back off the result
        assert_eq!(
            &ops[..6],
            &[
                OpCode::GetGlobal,
                OpCode::Constant,
                OpCode::Add,
                OpCode::SetGlobal,
                OpCode::Constant,
                OpCode::Subtract,
            ]
        );
    }
}
