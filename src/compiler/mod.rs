//! Lowers stack-machine function bodies to register bytecode.
//!
//! Pipeline per function: translate, build the control-flow graph, drop
//! dead local stores, coalesce registers, optionally charge gas per block,
//! then flatten and serialize. The same module always yields the same bytes.

use std::sync::Arc;

use crate::ast::{FuncType, Module, Span};
use crate::bytecode::Opcode;

pub mod cfg;
pub mod gas;
pub mod liveness;
pub mod regalloc;
pub mod serialize;
pub mod translate;

pub use gas::{GasPolicy, SimpleGasPolicy, TableGasPolicy};

/// Single-assignment value number. `0` means "no value".
pub type ValueId = u32;

// ── IR ──────────────────────────────────────────────────────────────

/// One register-form instruction.
///
/// Jump instructions keep their targets in `immediates` as instruction
/// indices until serialization relocates them to byte offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instr {
    pub target: ValueId,
    pub op: Opcode,
    pub immediates: Vec<i64>,
    pub operands: Vec<ValueId>,
}

impl Instr {
    pub fn new(target: ValueId, op: Opcode, immediates: Vec<i64>, operands: Vec<ValueId>) -> Self {
        Instr { target, op, immediates, operands }
    }

    /// Value consumed by a terminator as the condition, if any.
    pub fn condition(&self) -> ValueId {
        match self.op {
            Opcode::JmpIf | Opcode::JmpEither | Opcode::JmpTable => self.operands.first().copied().unwrap_or(0),
            _ => 0,
        }
    }

    /// Value carried across a jump into the yielded register, if any.
    pub fn yielded(&self) -> ValueId {
        match self.op {
            Opcode::Jmp => self.operands.first().copied().unwrap_or(0),
            Opcode::JmpIf | Opcode::JmpEither | Opcode::JmpTable => {
                self.operands.get(1).copied().unwrap_or(0)
            }
            _ => 0,
        }
    }
}

impl std::fmt::Display for Instr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.target != 0 {
            write!(f, "%{} = ", self.target)?;
        }
        write!(f, "{}", self.op)?;
        for imm in &self.immediates {
            write!(f, " {imm}")?;
        }
        for v in &self.operands {
            write!(f, " %{v}")?;
        }
        Ok(())
    }
}

// ── Errors ──────────────────────────────────────────────────────────

/// A malformed function body. Compilation of the function stops at the
/// first one and no bytecode is produced.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompileError {
    #[error("operand stack underflow at `{op}` (instruction {at})")]
    StackUnderflow { op: String, at: usize },
    #[error("unknown operator `{name}` (instruction {at})")]
    UnknownOperator { name: String, at: usize },
    #[error("`{op}` expects {expected} immediate(s), found {found}")]
    MissingImmediate { op: String, expected: usize, found: usize },
    #[error("operand stack holds {actual} value(s) at end of region, expected {expected}")]
    InconsistentStack { expected: usize, actual: usize },
    #[error("unbalanced control: {reason}")]
    UnbalancedControl { reason: &'static str },
    #[error("`else` without a matching `if`")]
    ElseWithoutIf,
    #[error("`if` without `else` cannot produce a value")]
    IfWithoutElseYields,
    #[error("branch depth {depth} exceeds the {open} open region(s)")]
    LabelOutOfRange { depth: i64, open: usize },
    #[error("{kind} index {index} is out of range")]
    IndexOutOfRange { kind: &'static str, index: i64 },
    #[error("jump target {target} is outside the {len}-instruction body")]
    InvalidJumpTarget { target: i64, len: usize },
    #[error("block {block} has no terminator")]
    UndefinedTerminator { block: usize },
    #[error("value %{value} is used but has no register")]
    RegisterMissing { value: ValueId },
    #[error("gas cost of block {block} overflows")]
    GasOverflow { block: usize },
}

impl CompileError {
    pub fn code(&self) -> &'static str {
        match self {
            CompileError::StackUnderflow { .. } => "RW-C001",
            CompileError::UnknownOperator { .. } => "RW-C002",
            CompileError::MissingImmediate { .. } => "RW-C003",
            CompileError::InconsistentStack { .. } => "RW-C004",
            CompileError::UnbalancedControl { .. } => "RW-C005",
            CompileError::ElseWithoutIf => "RW-C006",
            CompileError::IfWithoutElseYields => "RW-C007",
            CompileError::LabelOutOfRange { .. } => "RW-C008",
            CompileError::IndexOutOfRange { .. } => "RW-C009",
            CompileError::InvalidJumpTarget { .. } => "RW-C010",
            CompileError::UndefinedTerminator { .. } => "RW-C011",
            CompileError::RegisterMissing { .. } => "RW-C012",
            CompileError::GasOverflow { .. } => "RW-C013",
        }
    }
}

/// A compile error tied to the function that raised it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("in function {function}{}: {error}", display_name(.name))]
pub struct ModuleError {
    pub function: u32,
    pub name: Option<String>,
    pub span: Span,
    #[source]
    pub error: CompileError,
}

fn display_name(name: &Option<String>) -> String {
    name.as_deref().map(|n| format!(" `{n}`")).unwrap_or_default()
}

// ── Options ─────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct CompileOptions {
    /// When set, every basic block is prefixed with an `add_gas` charge.
    pub gas_policy: Option<Arc<dyn GasPolicy>>,
    pub dead_store_elimination: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        CompileOptions { gas_policy: None, dead_store_elimination: true }
    }
}

impl CompileOptions {
    pub fn with_gas(mut self, policy: impl GasPolicy + 'static) -> Self {
        self.gas_policy = Some(Arc::new(policy));
        self
    }
}

impl std::fmt::Debug for CompileOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompileOptions")
            .field("gas_policy", &self.gas_policy.as_ref().map(|_| "<policy>"))
            .field("dead_store_elimination", &self.dead_store_elimination)
            .finish()
    }
}

// ── Output ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledFunction {
    pub code: Vec<u8>,
    pub num_regs: u32,
    pub num_params: u32,
    /// Declared locals, not counting parameters.
    pub num_locals: u32,
    pub returns_value: bool,
    pub type_index: u32,
    /// Position in `Module::imports` for import stubs.
    pub import: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CompiledModule {
    /// Indexed by the module's function index space.
    pub functions: Vec<CompiledFunction>,
}

/// Lookup tables shared by every function of a module during translation.
#[derive(Debug, Clone)]
pub struct ModuleContext<'m> {
    pub types: &'m [FuncType],
    /// Type index per function in the combined index space.
    pub func_types: Vec<u32>,
    pub num_globals: usize,
}

impl<'m> ModuleContext<'m> {
    pub fn new(module: &'m Module) -> Self {
        let func_types = module
            .imported_functions()
            .map(|(_, t)| t)
            .chain(module.functions.iter().map(|f| f.type_index))
            .collect();
        ModuleContext { types: &module.types, func_types, num_globals: module.num_globals() }
    }

    pub fn signature(&self, func_index: u32) -> Option<&'m FuncType> {
        self.func_types
            .get(func_index as usize)
            .and_then(|t| self.types.get(*t as usize))
    }
}

// ── Driver ──────────────────────────────────────────────────────────

/// Runs every pass except serialization and returns the final flat list
/// together with the register count.
pub fn lower_function(
    ctx: &ModuleContext<'_>,
    func: &crate::ast::Function,
    opts: &CompileOptions,
) -> Result<(Vec<Instr>, u32), CompileError> {
    let sig = ctx
        .types
        .get(func.type_index as usize)
        .ok_or(CompileError::IndexOutOfRange { kind: "type", index: func.type_index as i64 })?;
    let num_locals = sig.params.len() + func.locals.len();

    let code = translate::translate(ctx, sig, num_locals, &func.body)?;
    let mut graph = cfg::Cfg::build(&code)?;
    if opts.dead_store_elimination {
        liveness::eliminate_dead_stores(&mut graph, num_locals);
    }
    let alloc = regalloc::allocate(&mut graph)?;
    if let Some(policy) = &opts.gas_policy {
        gas::instrument(&mut graph, policy.as_ref())?;
    }
    Ok((graph.flatten()?, alloc.registers))
}

pub fn compile_function(
    ctx: &ModuleContext<'_>,
    func: &crate::ast::Function,
    opts: &CompileOptions,
) -> Result<CompiledFunction, CompileError> {
    let (code, num_regs) = lower_function(ctx, func, opts)?;
    let sig = ctx.types.get(func.type_index as usize);
    Ok(CompiledFunction {
        code: serialize::serialize(&code)?,
        num_regs,
        num_params: sig.map_or(0, |s| s.params.len()) as u32,
        num_locals: func.locals.len() as u32,
        returns_value: sig.is_some_and(|s| s.returns_value()),
        type_index: func.type_index,
        import: None,
    })
}

/// Bytecode for an imported function: hand control to the host, then
/// return whatever it produced.
fn import_stub(import_id: u32, type_index: u32, sig: Option<&FuncType>) -> Result<CompiledFunction, CompileError> {
    let returns_value = sig.is_some_and(|s| s.returns_value());
    let ret = if returns_value {
        Instr::new(0, Opcode::ReturnValue, vec![], vec![1])
    } else {
        Instr::new(0, Opcode::ReturnVoid, vec![], vec![])
    };
    let code = vec![Instr::new(1, Opcode::InvokeImport, vec![import_id as i64], vec![]), ret];
    Ok(CompiledFunction {
        code: serialize::serialize(&code)?,
        num_regs: 2,
        num_params: sig.map_or(0, |s| s.params.len()) as u32,
        num_locals: 0,
        returns_value,
        type_index,
        import: Some(import_id),
    })
}

pub fn compile_module(module: &Module, opts: &CompileOptions) -> Result<CompiledModule, ModuleError> {
    let ctx = ModuleContext::new(module);
    let mut functions = Vec::with_capacity(module.num_functions());

    let mut func_index = 0u32;
    for (import_id, imp) in module.imports.iter().enumerate() {
        let crate::ast::ImportKind::Function { type_index } = imp.kind else {
            continue;
        };
        let stub = import_stub(import_id as u32, type_index, module.types.get(type_index as usize))
            .map_err(|error| ModuleError {
                function: func_index,
                name: Some(format!("{}.{}", imp.module, imp.field)),
                span: Span::UNKNOWN,
                error,
            })?;
        functions.push(stub);
        func_index += 1;
    }

    for func in &module.functions {
        let compiled = compile_function(&ctx, func, opts).map_err(|error| ModuleError {
            function: func_index,
            name: func.name.clone(),
            span: func.span,
            error,
        })?;
        functions.push(compiled);
        func_index += 1;
    }

    Ok(CompiledModule { functions })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Function, SourceInstr, ValueType};

    fn add_module() -> Module {
        let mut m = Module::default();
        let t = m.intern_type(FuncType::new(vec![ValueType::I32, ValueType::I32], vec![ValueType::I32]));
        m.functions.push(Function {
            name: Some("add".into()),
            type_index: t,
            locals: vec![],
            body: vec![
                SourceInstr::new("local.get", &[0]),
                SourceInstr::new("local.get", &[1]),
                SourceInstr::new("i32.add", &[]),
            ],
            span: Span::UNKNOWN,
        });
        m
    }

    #[test]
    fn compile_is_deterministic() {
        let m = add_module();
        let a = compile_module(&m, &CompileOptions::default()).unwrap();
        let b = compile_module(&m, &CompileOptions::default()).unwrap();
        assert_eq!(a, b);
        let f = &a.functions[0];
        assert_eq!(f.num_params, 2);
        assert!(f.returns_value);
        assert!(f.num_regs >= 3);
    }

    #[test]
    fn error_names_the_function() {
        let mut m = add_module();
        m.functions[0].body.push(SourceInstr::new("i32.add", &[]));
        let err = compile_module(&m, &CompileOptions::default()).unwrap_err();
        assert_eq!(err.function, 0);
        assert!(matches!(err.error, CompileError::StackUnderflow { .. }));
        assert!(err.to_string().contains("`add`"), "{err}");
    }

    #[test]
    fn imports_compile_to_stubs() {
        let mut m = add_module();
        m.imports.push(crate::ast::Import {
            module: "env".into(),
            field: "sum".into(),
            kind: crate::ast::ImportKind::Function { type_index: 0 },
        });
        let out = compile_module(&m, &CompileOptions::default()).unwrap();
        assert_eq!(out.functions.len(), 2);
        assert_eq!(out.functions[0].import, Some(0));
        let listing = crate::bytecode::disassemble(&out.functions[0].code).unwrap();
        assert_eq!(listing[0].op, Opcode::InvokeImport);
        assert_eq!(listing[1].op, Opcode::ReturnValue);
    }

    #[test]
    fn gas_option_inserts_charges() {
        let m = add_module();
        let opts = CompileOptions::default().with_gas(SimpleGasPolicy::default());
        let ctx = ModuleContext::new(&m);
        let (code, _) = lower_function(&ctx, &m.functions[0], &opts).unwrap();
        assert_eq!(code[0].op, Opcode::AddGas);
        assert_eq!(code[0].immediates, vec![4]);
    }
}
