//! Register bytecode interpreter.
//!
//! A [`VirtualMachine`] owns one instantiated module: the compiled function
//! table, globals, linear memory, the indirect-call table and the call
//! stack. Execution is driven from outside through a small state machine:
//!
//! ```text
//! Ready --ignite--> Running --step--> AwaitingHostCall --run_host_call--> Running
//!                      |                                                     |
//!                      +------------------- step --------------------> Exited
//! ```
//!
//! `step` runs until the code reaches a host import, the outermost frame
//! returns, or a trap fires. Host functions never run inside `step`.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::ast::{Export, ExportKind, FuncType, InitExpr, Module, ValueType};
use crate::bytecode::{Cursor, Opcode, OutOfBounds, Shape};
use crate::compiler::{self, CompileOptions, CompiledFunction, ModuleError};
use crate::trace::{TraceMask, TraceSink};

mod host;
mod ops;
pub mod snapshot;

#[cfg(feature = "cranelift")]
pub(crate) mod jit_cranelift;

pub use host::{HostContext, HostFunction, HostImports, ImportResolver, NoImports};
pub use snapshot::Snapshot;

/// Linear memory page size in bytes.
pub const PAGE_SIZE: usize = 65536;

/// Hard ceiling on linear memory, in pages (4 GiB).
pub const MAX_PAGES: u32 = 65536;

// ── Errors ──────────────────────────────────────────────────────────

/// A fatal runtime condition. The call that raised it produces no value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Trap {
    #[error("unreachable executed")]
    Unreachable,
    #[error("integer division by zero")]
    DivisionByZero,
    #[error("integer overflow")]
    IntegerOverflow,
    #[error("invalid conversion to integer")]
    InvalidConversion,
    #[error("out of bounds memory access: {width} byte(s) at {address}")]
    MemoryOutOfBounds { address: u64, width: u32 },
    #[error("table index {index} is out of bounds (table size {size})")]
    TableOutOfBounds { index: u32, size: usize },
    #[error("table element {index} is uninitialized")]
    UninitializedElement { index: u32 },
    #[error("function {function} does not match signature {type_index}")]
    SignatureMismatch { type_index: u32, function: u32 },
    #[error("value slot budget of {limit} exceeded")]
    ValueSlotsExceeded { limit: usize },
    #[error("call stack exhausted at depth {depth}")]
    CallStackExhausted { depth: usize },
    #[error("gas limit of {limit} exceeded")]
    GasLimitExceeded { limit: u64 },
    #[error("step limit of {limit} exceeded")]
    StepLimitExceeded { limit: u64 },
    #[error("cannot resolve import {module}.{field}")]
    UnresolvedImport { module: String, field: String },
    #[error("host function failed: {message}")]
    HostFailure { message: String },
    #[error("bytecode: {0}")]
    BytecodeOutOfBounds(#[from] OutOfBounds),
    #[error("unknown opcode 0x{byte:02x} at offset {offset}")]
    UnknownOpcode { offset: usize, byte: u8 },
    #[error("{kind} index {index} is out of range")]
    BadIndex { kind: &'static str, index: u64 },
}

impl Trap {
    pub fn code(&self) -> &'static str {
        match self {
            Trap::Unreachable => "RW-T001",
            Trap::DivisionByZero => "RW-T002",
            Trap::IntegerOverflow => "RW-T003",
            Trap::InvalidConversion => "RW-T004",
            Trap::MemoryOutOfBounds { .. } => "RW-T005",
            Trap::TableOutOfBounds { .. } => "RW-T006",
            Trap::UninitializedElement { .. } => "RW-T007",
            Trap::SignatureMismatch { .. } => "RW-T008",
            Trap::ValueSlotsExceeded { .. } => "RW-T009",
            Trap::CallStackExhausted { .. } => "RW-T010",
            Trap::GasLimitExceeded { .. } => "RW-T011",
            Trap::StepLimitExceeded { .. } => "RW-T012",
            Trap::UnresolvedImport { .. } => "RW-T013",
            Trap::HostFailure { .. } => "RW-T014",
            Trap::BytecodeOutOfBounds(_) => "RW-T015",
            Trap::UnknownOpcode { .. } => "RW-T016",
            Trap::BadIndex { .. } => "RW-T017",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum VmError {
    #[error(transparent)]
    Load(#[from] ModuleError),
    #[error("trap: {0}")]
    Trap(#[from] Trap),
    #[error("vm is {actual}, expected {expected}")]
    InvalidState { expected: State, actual: State },
    #[error("no function with index {index}")]
    UnknownFunction { index: u32 },
    #[error("no exported function named `{name}`")]
    UnknownExport { name: String },
    #[error("expected {expected} argument(s), got {found}")]
    ArgumentCount { expected: usize, found: usize },
    #[error("bad snapshot: {0}")]
    Snapshot(String),
    #[error("unresolved import {module}.{field}")]
    UnresolvedImport { module: String, field: String },
    #[error("{kind} segment {index} does not fit")]
    SegmentOutOfRange { kind: &'static str, index: usize },
    #[error("initializer of global {global} refers to an undefined global")]
    InvalidInitializer { global: usize },
    #[error("memory of {pages} page(s) exceeds the limit of {max}")]
    MemoryLimit { pages: u32, max: u32 },
}

impl VmError {
    pub fn code(&self) -> &'static str {
        match self {
            VmError::Load(e) => e.error.code(),
            VmError::Trap(t) => t.code(),
            VmError::InvalidState { .. } => "RW-V001",
            VmError::UnknownFunction { .. } => "RW-V002",
            VmError::UnknownExport { .. } => "RW-V003",
            VmError::ArgumentCount { .. } => "RW-V004",
            VmError::Snapshot(_) => "RW-V005",
            VmError::UnresolvedImport { .. } => "RW-V006",
            VmError::SegmentOutOfRange { .. } => "RW-V007",
            VmError::InvalidInitializer { .. } => "RW-V008",
            VmError::MemoryLimit { .. } => "RW-V009",
        }
    }
}

// ── Configuration ───────────────────────────────────────────────────

/// Runtime limits and switches. A limit of `0` means unlimited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub gas_limit: u64,
    pub max_steps: u64,
    pub max_call_stack_depth: usize,
    /// Registers plus locals across every live frame.
    pub max_value_slots: usize,
    pub max_memory_pages: u32,
    /// Memory size for modules that declare none.
    pub default_memory_pages: u32,
    /// Table size for modules that declare none.
    pub default_table_size: u32,
    pub enable_jit: bool,
    pub trace_mask: TraceMask,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            gas_limit: 0,
            max_steps: 0,
            max_call_stack_depth: 512,
            max_value_slots: 0,
            max_memory_pages: MAX_PAGES,
            default_memory_pages: 0,
            default_table_size: 0,
            enable_jit: false,
            trace_mask: TraceMask::ALL,
        }
    }
}

// ── State ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum State {
    Ready,
    Running,
    AwaitingHostCall,
    Exited,
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            State::Ready => "ready",
            State::Running => "running",
            State::AwaitingHostCall => "awaiting a host call",
            State::Exited => "exited",
        })
    }
}

/// The import a suspended VM is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingHostCall {
    pub import: u32,
    /// Register of the import frame that receives the result.
    pub target: u32,
}

/// Where the last trap fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrapSite {
    pub function: u32,
    /// Byte offset of the faulting instruction.
    pub offset: usize,
}

// ── Code table and frames ───────────────────────────────────────────

/// One entry of the function table. Immutable after instantiation.
pub struct FunctionCode {
    pub code: Arc<[u8]>,
    pub num_regs: u32,
    pub num_params: u32,
    pub num_locals: u32,
    pub returns_value: bool,
    pub type_index: u32,
    pub import: Option<u32>,
    #[cfg(feature = "cranelift")]
    native: Option<jit_cranelift::JitFunction>,
}

impl FunctionCode {
    fn new(f: CompiledFunction, enable_jit: bool) -> Self {
        #[cfg(feature = "cranelift")]
        let native = if enable_jit && f.import.is_none() {
            jit_cranelift::compile(&f.code, f.num_params as usize, f.returns_value)
        } else {
            None
        };
        #[cfg(not(feature = "cranelift"))]
        let _ = enable_jit;

        FunctionCode {
            code: Arc::from(f.code),
            num_regs: f.num_regs,
            num_params: f.num_params,
            num_locals: f.num_locals,
            returns_value: f.returns_value,
            type_index: f.type_index,
            import: f.import,
            #[cfg(feature = "cranelift")]
            native,
        }
    }

    /// Registers plus locals one activation needs.
    pub fn value_slots(&self) -> usize {
        (self.num_regs + self.num_params + self.num_locals) as usize
    }

    pub fn is_native(&self) -> bool {
        #[cfg(feature = "cranelift")]
        return self.native.is_some();
        #[cfg(not(feature = "cranelift"))]
        return false;
    }
}

/// One activation. Its registers and locals belong to it alone.
#[derive(Debug, Clone)]
pub struct Frame {
    pub function_id: u32,
    pub(crate) code: Arc<[u8]>,
    pub regs: Vec<i64>,
    /// Parameters followed by declared locals.
    pub locals: Vec<i64>,
    pub ip: usize,
    /// Caller register that receives this frame's callee result.
    pub return_reg: u32,
}

/// What the instruction just executed asks of the driver loop.
enum Flow {
    Next,
    Call { func: u32, args: Vec<i64> },
    Return(Option<i64>),
    Host(PendingHostCall),
}

enum Halt {
    Host(PendingHostCall),
    Exited(Option<i64>),
}

#[inline(always)]
fn get(regs: &[i64], r: u32) -> Result<i64, Trap> {
    regs.get(r as usize)
        .copied()
        .ok_or(Trap::BadIndex { kind: "register", index: r as u64 })
}

#[inline(always)]
fn put(regs: &mut [i64], r: u32, v: i64) -> Result<(), Trap> {
    let slot = regs
        .get_mut(r as usize)
        .ok_or(Trap::BadIndex { kind: "register", index: r as u64 })?;
    *slot = v;
    Ok(())
}

fn charge(used: u64, delta: u64, limit: u64) -> Result<u64, Trap> {
    let total = used.checked_add(delta).ok_or(Trap::GasLimitExceeded { limit })?;
    if limit != 0 && total > limit {
        return Err(Trap::GasLimitExceeded { limit });
    }
    Ok(total)
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        return s.to_string();
    }
    payload
        .downcast_ref::<String>()
        .cloned()
        .unwrap_or_else(|| "host function panicked".to_string())
}

/// Canonical slot form of a constant initializer.
fn normalize(ty: ValueType, v: i64) -> i64 {
    match ty {
        ValueType::I32 => v as i32 as i64,
        ValueType::F32 => v as u32 as i64,
        ValueType::I64 | ValueType::F64 => v,
    }
}

fn eval_offset(init: InitExpr, globals: &[i64]) -> Option<usize> {
    match init {
        InitExpr::Const(v) => Some(v as u32 as usize),
        InitExpr::GlobalGet(g) => globals.get(g as usize).map(|v| *v as u32 as usize),
    }
}

// ── VM ──────────────────────────────────────────────────────────────

pub struct VirtualMachine {
    config: Config,
    types: Vec<FuncType>,
    functions: Vec<FunctionCode>,
    /// (module, field) per entry of `Module::imports`.
    imports: Vec<(String, String)>,
    host_funcs: Vec<Option<HostFunction>>,
    resolver: Box<dyn ImportResolver>,
    exports: Vec<Export>,
    table: Vec<Option<u32>>,
    globals: Vec<i64>,
    memory: Vec<u8>,
    max_pages: u32,

    frames: Vec<Frame>,
    num_value_slots: usize,
    gas: u64,
    steps: u64,
    yielded: i64,
    state: State,
    pending: Option<PendingHostCall>,
    outcome: Option<Result<Option<i64>, Trap>>,
    trap_site: Option<TrapSite>,

    trace: Option<Box<dyn TraceSink>>,
    trace_mask: TraceMask,
}

impl VirtualMachine {
    pub fn new(module: &Module, resolver: impl ImportResolver + 'static, config: Config) -> Result<Self, VmError> {
        Self::with_options(module, resolver, config, &CompileOptions::default())
    }

    /// Compiles every function and instantiates the module.
    pub fn with_options(
        module: &Module,
        resolver: impl ImportResolver + 'static,
        config: Config,
        opts: &CompileOptions,
    ) -> Result<Self, VmError> {
        let compiled = compiler::compile_module(module, opts)?;
        let mut resolver: Box<dyn ImportResolver> = Box::new(resolver);

        let mut globals = Vec::with_capacity(module.num_globals());
        for (imp, ty) in module.imported_globals() {
            let v = resolver
                .resolve_global(&imp.module, &imp.field)
                .ok_or_else(|| VmError::UnresolvedImport { module: imp.module.clone(), field: imp.field.clone() })?;
            globals.push(normalize(ty, v));
        }
        for g in &module.globals {
            let v = match g.init {
                InitExpr::Const(v) => normalize(g.ty, v),
                InitExpr::GlobalGet(idx) => *globals
                    .get(idx as usize)
                    .ok_or(VmError::InvalidInitializer { global: globals.len() })?,
            };
            globals.push(v);
        }

        let limit = match config.max_memory_pages {
            0 => MAX_PAGES,
            n => n.min(MAX_PAGES),
        };
        let max_pages = module.memory.and_then(|m| m.maximum).map_or(limit, |m| m.min(limit));
        let initial = module.memory.map_or(config.default_memory_pages, |m| m.initial);
        if initial > max_pages {
            return Err(VmError::MemoryLimit { pages: initial, max: max_pages });
        }
        let mut memory = vec![0u8; initial as usize * PAGE_SIZE];
        for (index, seg) in module.data.iter().enumerate() {
            let dest = eval_offset(seg.offset, &globals)
                .and_then(|start| Some(start..start.checked_add(seg.bytes.len())?))
                .and_then(|range| memory.get_mut(range))
                .ok_or(VmError::SegmentOutOfRange { kind: "data", index })?;
            dest.copy_from_slice(&seg.bytes);
        }

        let table_size = module.table.map_or(config.default_table_size, |t| t.initial);
        let mut table = vec![None; table_size as usize];
        let num_functions = compiled.functions.len();
        for (index, seg) in module.elements.iter().enumerate() {
            let slots = eval_offset(seg.offset, &globals)
                .and_then(|start| Some(start..start.checked_add(seg.functions.len())?))
                .and_then(|range| table.get_mut(range))
                .ok_or(VmError::SegmentOutOfRange { kind: "element", index })?;
            for (slot, func) in slots.iter_mut().zip(&seg.functions) {
                if *func as usize >= num_functions {
                    return Err(VmError::SegmentOutOfRange { kind: "element", index });
                }
                *slot = Some(*func);
            }
        }

        let functions = compiled
            .functions
            .into_iter()
            .map(|f| FunctionCode::new(f, config.enable_jit))
            .collect();

        Ok(VirtualMachine {
            types: module.types.clone(),
            functions,
            imports: module.imports.iter().map(|i| (i.module.clone(), i.field.clone())).collect(),
            host_funcs: module.imports.iter().map(|_| None).collect(),
            resolver,
            exports: module.exports.clone(),
            table,
            globals,
            memory,
            max_pages,
            frames: Vec::new(),
            num_value_slots: 0,
            gas: 0,
            steps: 0,
            yielded: 0,
            state: State::Ready,
            pending: None,
            outcome: None,
            trap_site: None,
            trace: None,
            trace_mask: TraceMask::NONE,
            config,
        })
    }

    // ── Inspection ──────────────────────────────────────────────────

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn function(&self, index: u32) -> Option<&FunctionCode> {
        self.functions.get(index as usize)
    }

    pub fn num_functions(&self) -> usize {
        self.functions.len()
    }

    pub fn export_function(&self, name: &str) -> Option<u32> {
        self.find_export(name, ExportKind::Function)
    }

    pub fn export_global(&self, name: &str) -> Option<u32> {
        self.find_export(name, ExportKind::Global)
    }

    fn find_export(&self, name: &str, kind: ExportKind) -> Option<u32> {
        self.exports.iter().find(|e| e.name == name && e.kind == kind).map(|e| e.index)
    }

    pub fn memory(&self) -> &[u8] {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut [u8] {
        &mut self.memory
    }

    pub fn globals(&self) -> &[i64] {
        &self.globals
    }

    pub fn gas_used(&self) -> u64 {
        self.gas
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn call_stack_depth(&self) -> usize {
        self.frames.len()
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn value_slots(&self) -> usize {
        self.num_value_slots
    }

    pub fn pending_host_call(&self) -> Option<PendingHostCall> {
        self.pending
    }

    /// The result of the last run once the VM has exited.
    pub fn outcome(&self) -> Option<&Result<Option<i64>, Trap>> {
        self.outcome.as_ref()
    }

    pub fn trap_site(&self) -> Option<TrapSite> {
        self.trap_site
    }

    /// Installs a trace sink. Events outside `Config::trace_mask` are
    /// never delivered.
    pub fn set_trace(&mut self, sink: Box<dyn TraceSink>) {
        self.trace_mask = self.config.trace_mask & sink.mask();
        self.trace = Some(sink);
    }

    pub fn clear_trace(&mut self) -> Option<Box<dyn TraceSink>> {
        self.trace_mask = TraceMask::NONE;
        self.trace.take()
    }

    // ── Driving ─────────────────────────────────────────────────────

    /// Pushes the entry frame. Legal from `Ready`, or from `Exited` after
    /// a clean return.
    pub fn ignite(&mut self, func: u32, args: &[i64]) -> Result<(), VmError> {
        match self.state {
            State::Ready => {}
            State::Exited if self.frames.is_empty() => {}
            actual => return Err(VmError::InvalidState { expected: State::Ready, actual }),
        }
        let code = self.functions.get(func as usize).ok_or(VmError::UnknownFunction { index: func })?;
        if code.num_params as usize != args.len() {
            return Err(VmError::ArgumentCount { expected: code.num_params as usize, found: args.len() });
        }
        self.outcome = None;
        self.trap_site = None;
        self.yielded = 0;
        self.enter(func, args)?;
        self.state = State::Running;
        Ok(())
    }

    /// Runs until a host import, a top-level return or a trap.
    pub fn step(&mut self) -> Result<State, VmError> {
        if self.state != State::Running {
            return Err(VmError::InvalidState { expected: State::Running, actual: self.state });
        }
        match self.execute() {
            Ok(Halt::Host(call)) => {
                self.pending = Some(call);
                self.state = State::AwaitingHostCall;
            }
            Ok(Halt::Exited(value)) => {
                self.state = State::Exited;
                self.outcome = Some(Ok(value));
            }
            Err(trap) => self.fail(trap),
        }
        Ok(self.state)
    }

    /// Executes the import the VM is waiting on.
    pub fn run_host_call(&mut self) -> Result<State, VmError> {
        let call = match (self.state, self.pending) {
            (State::AwaitingHostCall, Some(call)) => call,
            (actual, _) => return Err(VmError::InvalidState { expected: State::AwaitingHostCall, actual }),
        };
        self.pending = None;
        match self.invoke_host(call) {
            Ok(()) => self.state = State::Running,
            Err(trap) => self.fail(trap),
        }
        Ok(self.state)
    }

    /// Ignites `func` and drives it to completion, servicing host calls.
    pub fn run(&mut self, func: u32, args: &[i64]) -> Result<Option<i64>, VmError> {
        self.ignite(func, args)?;
        loop {
            match self.state {
                State::Running => self.step()?,
                State::AwaitingHostCall => self.run_host_call()?,
                State::Ready | State::Exited => break,
            };
        }
        match self.outcome.clone() {
            Some(Ok(value)) => Ok(value),
            Some(Err(trap)) => Err(VmError::Trap(trap)),
            None => Err(VmError::InvalidState { expected: State::Exited, actual: self.state }),
        }
    }

    /// Runs an exported function by name.
    pub fn invoke(&mut self, name: &str, args: &[i64]) -> Result<Option<i64>, VmError> {
        let func = self
            .export_function(name)
            .ok_or_else(|| VmError::UnknownExport { name: name.to_string() })?;
        self.run(func, args)
    }

    /// Drops every frame and the run's counters. Memory and globals keep
    /// their contents.
    pub fn reset(&mut self) {
        self.frames.clear();
        self.num_value_slots = 0;
        self.gas = 0;
        self.steps = 0;
        self.yielded = 0;
        self.pending = None;
        self.outcome = None;
        self.trap_site = None;
        self.state = State::Ready;
    }

    fn fail(&mut self, trap: Trap) {
        self.trap_site = self.frames.last().map(|f| TrapSite { function: f.function_id, offset: f.ip });
        self.state = State::Exited;
        self.outcome = Some(Err(trap));
    }

    // ── Frames ──────────────────────────────────────────────────────

    fn enter(&mut self, func: u32, args: &[i64]) -> Result<(), Trap> {
        let code = self
            .functions
            .get(func as usize)
            .ok_or(Trap::BadIndex { kind: "function", index: func as u64 })?;
        let depth_limit = self.config.max_call_stack_depth;
        if depth_limit != 0 && self.frames.len() >= depth_limit {
            return Err(Trap::CallStackExhausted { depth: self.frames.len() });
        }
        let slots = code.value_slots();
        let slot_limit = self.config.max_value_slots;
        if slot_limit != 0 && self.num_value_slots + slots > slot_limit {
            return Err(Trap::ValueSlotsExceeded { limit: slot_limit });
        }
        if args.len() != code.num_params as usize {
            return Err(Trap::SignatureMismatch { type_index: code.type_index, function: func });
        }

        let mut locals = vec![0; (code.num_params + code.num_locals) as usize];
        locals[..args.len()].copy_from_slice(args);
        self.num_value_slots += slots;
        self.frames.push(Frame {
            function_id: func,
            code: Arc::clone(&code.code),
            regs: vec![0; code.num_regs as usize],
            locals,
            ip: 0,
            return_reg: 0,
        });
        if self.trace_mask.contains(TraceMask::CALL) {
            if let Some(sink) = self.trace.as_mut() {
                sink.call_enter(func, self.frames.len());
            }
        }
        Ok(())
    }

    /// Pops the current frame. True when it was the outermost one.
    fn leave(&mut self, value: Option<i64>) -> Result<bool, Trap> {
        let Some(frame) = self.frames.pop() else {
            return Ok(true);
        };
        if self.trace_mask.contains(TraceMask::CALL) {
            if let Some(sink) = self.trace.as_mut() {
                sink.call_exit(frame.function_id, self.frames.len() + 1);
            }
        }
        self.num_value_slots -= frame.regs.len() + frame.locals.len();
        let Some(caller) = self.frames.last_mut() else {
            return Ok(true);
        };
        match value {
            Some(v) if caller.return_reg != 0 => put(&mut caller.regs, caller.return_reg, v)?,
            _ => {}
        }
        Ok(false)
    }

    // ── Execution ───────────────────────────────────────────────────

    fn execute(&mut self) -> Result<Halt, Trap> {
        loop {
            let flow = match self.native_entry()? {
                Some(value) => Flow::Return(Some(value)),
                None => self.dispatch()?,
            };
            match flow {
                Flow::Next => {}
                Flow::Call { func, args } => self.enter(func, &args)?,
                Flow::Return(value) => {
                    if self.leave(value)? {
                        return Ok(Halt::Exited(value));
                    }
                }
                Flow::Host(call) => return Ok(Halt::Host(call)),
            }
        }
    }

    /// Runs a natively compiled function in place of its bytecode when
    /// the current frame has just been entered.
    #[cfg(feature = "cranelift")]
    fn native_entry(&mut self) -> Result<Option<i64>, Trap> {
        if self.trace.is_some() && self.trace_mask.contains(TraceMask::OPCODE) {
            return Ok(None);
        }
        let Some(frame) = self.frames.last() else {
            return Ok(None);
        };
        if frame.ip != 0 {
            return Ok(None);
        }
        let Some(native) = self.functions.get(frame.function_id as usize).and_then(|f| f.native.as_ref()) else {
            return Ok(None);
        };
        if self.config.max_steps != 0 && self.steps >= self.config.max_steps {
            return Err(Trap::StepLimitExceeded { limit: self.config.max_steps });
        }
        self.steps += 1;
        if native.static_gas > 0 {
            self.gas = charge(self.gas, native.static_gas, self.config.gas_limit)?;
            if self.trace_mask.contains(TraceMask::GAS) {
                if let Some(sink) = self.trace.as_mut() {
                    sink.gas(native.static_gas, self.gas);
                }
            }
        }
        let value = jit_cranelift::call(native, &frame.locals).ok_or(Trap::BadIndex {
            kind: "native argument",
            index: frame.locals.len() as u64,
        })?;
        Ok(Some(value))
    }

    #[cfg(not(feature = "cranelift"))]
    fn native_entry(&mut self) -> Result<Option<i64>, Trap> {
        Ok(None)
    }

    /// Executes one instruction of the current frame.
    fn dispatch(&mut self) -> Result<Flow, Trap> {
        if self.config.max_steps != 0 && self.steps >= self.config.max_steps {
            return Err(Trap::StepLimitExceeded { limit: self.config.max_steps });
        }
        self.steps += 1;

        let frame = self
            .frames
            .last_mut()
            .ok_or(Trap::BadIndex { kind: "frame", index: 0 })?;
        let pc = frame.ip;
        let mut cur = Cursor::at(&frame.code, pc);
        let target = cur.read_u32()?;
        let byte = cur.read_u8()?;
        let op = Opcode::from_u8(byte).ok_or(Trap::UnknownOpcode { offset: pc + 4, byte })?;
        if self.trace_mask.contains(TraceMask::OPCODE) {
            if let Some(sink) = self.trace.as_mut() {
                sink.instr(frame.function_id, pc, op);
            }
        }

        let regs = &mut frame.regs;
        let flow = match op {
            Opcode::Nop => Flow::Next,
            Opcode::Unreachable => return Err(Trap::Unreachable),
            Opcode::Select => {
                let a = get(regs, cur.read_u32()?)?;
                let b = get(regs, cur.read_u32()?)?;
                let c = get(regs, cur.read_u32()?)?;
                put(regs, target, if c as i32 != 0 { a } else { b })?;
                Flow::Next
            }
            Opcode::I32Const => {
                put(regs, target, cur.read_u32()? as i32 as i64)?;
                Flow::Next
            }
            Opcode::F32Const => {
                put(regs, target, cur.read_u32()? as i64)?;
                Flow::Next
            }
            Opcode::I64Const | Opcode::F64Const => {
                put(regs, target, cur.read_u64()? as i64)?;
                Flow::Next
            }

            Opcode::MemorySize => {
                put(regs, target, (self.memory.len() / PAGE_SIZE) as i64)?;
                Flow::Next
            }
            Opcode::MemoryGrow => {
                let delta = get(regs, cur.read_u32()?)? as u32;
                let current = (self.memory.len() / PAGE_SIZE) as u32;
                let result = match current.checked_add(delta) {
                    Some(pages) if pages <= self.max_pages => {
                        self.memory.resize(pages as usize * PAGE_SIZE, 0);
                        current as i64
                    }
                    _ => -1,
                };
                put(regs, target, result)?;
                Flow::Next
            }

            Opcode::LocalGet => {
                let idx = cur.read_u32()?;
                let v = frame
                    .locals
                    .get(idx as usize)
                    .copied()
                    .ok_or(Trap::BadIndex { kind: "local", index: idx as u64 })?;
                put(regs, target, v)?;
                Flow::Next
            }
            Opcode::LocalSet => {
                let idx = cur.read_u32()?;
                let v = get(regs, cur.read_u32()?)?;
                let slot = frame
                    .locals
                    .get_mut(idx as usize)
                    .ok_or(Trap::BadIndex { kind: "local", index: idx as u64 })?;
                *slot = v;
                Flow::Next
            }
            Opcode::GlobalGet => {
                let idx = cur.read_u32()?;
                let v = self
                    .globals
                    .get(idx as usize)
                    .copied()
                    .ok_or(Trap::BadIndex { kind: "global", index: idx as u64 })?;
                put(regs, target, v)?;
                Flow::Next
            }
            Opcode::GlobalSet => {
                let idx = cur.read_u32()?;
                let v = get(regs, cur.read_u32()?)?;
                let slot = self
                    .globals
                    .get_mut(idx as usize)
                    .ok_or(Trap::BadIndex { kind: "global", index: idx as u64 })?;
                *slot = v;
                Flow::Next
            }

            Opcode::Jmp => {
                let dest = cur.read_index()?;
                self.yielded = get(regs, cur.read_u32()?)?;
                cur.seek(dest)?;
                Flow::Next
            }
            Opcode::JmpIf => {
                let dest = cur.read_index()?;
                let cond = get(regs, cur.read_u32()?)?;
                let yield_reg = cur.read_u32()?;
                if cond as i32 != 0 {
                    self.yielded = get(regs, yield_reg)?;
                    cur.seek(dest)?;
                }
                Flow::Next
            }
            Opcode::JmpEither => {
                let taken = cur.read_index()?;
                let fallthrough = cur.read_index()?;
                let cond = get(regs, cur.read_u32()?)?;
                self.yielded = get(regs, cur.read_u32()?)?;
                cur.seek(if cond as i32 != 0 { taken } else { fallthrough })?;
                Flow::Next
            }
            Opcode::JmpTable => {
                let count = cur.read_index()?;
                let targets_at = cur.pos();
                let mut tail = Cursor::at(&frame.code, targets_at + (count + 1) * 4);
                let selector = get(regs, tail.read_u32()?)? as u32 as usize;
                self.yielded = get(regs, tail.read_u32()?)?;
                let slot = selector.min(count);
                let dest = Cursor::at(&frame.code, targets_at + slot * 4).read_index()?;
                cur.seek(dest)?;
                Flow::Next
            }
            Opcode::ReturnValue => Flow::Return(Some(get(regs, cur.read_u32()?)?)),
            Opcode::ReturnVoid => Flow::Return(None),

            Opcode::Call => {
                let func = cur.read_u32()?;
                let argc = cur.read_index()?;
                let mut args = Vec::with_capacity(argc);
                for _ in 0..argc {
                    args.push(get(regs, cur.read_u32()?)?);
                }
                frame.return_reg = target;
                Flow::Call { func, args }
            }
            Opcode::CallIndirect => {
                let type_index = cur.read_u32()?;
                let argc = cur.read_index()?;
                let mut args = Vec::with_capacity(argc);
                for _ in 0..argc {
                    args.push(get(regs, cur.read_u32()?)?);
                }
                let index = get(regs, cur.read_u32()?)? as u32;
                let func = match self.table.get(index as usize) {
                    None => return Err(Trap::TableOutOfBounds { index, size: self.table.len() }),
                    Some(None) => return Err(Trap::UninitializedElement { index }),
                    Some(Some(f)) => *f,
                };
                let expected = self.types.get(type_index as usize);
                let actual = self
                    .functions
                    .get(func as usize)
                    .and_then(|code| self.types.get(code.type_index as usize));
                if expected.is_none() || expected != actual {
                    return Err(Trap::SignatureMismatch { type_index, function: func });
                }
                frame.return_reg = target;
                Flow::Call { func, args }
            }
            Opcode::InvokeImport => Flow::Host(PendingHostCall { import: cur.read_u32()?, target }),

            Opcode::Phi => {
                put(regs, target, self.yielded)?;
                Flow::Next
            }
            Opcode::AddGas => {
                let delta = cur.read_u64()?;
                self.gas = charge(self.gas, delta, self.config.gas_limit)?;
                if self.trace_mask.contains(TraceMask::GAS) {
                    if let Some(sink) = self.trace.as_mut() {
                        sink.gas(delta, self.gas);
                    }
                }
                Flow::Next
            }

            _ => {
                let unknown = Trap::UnknownOpcode { offset: pc + 4, byte };
                match op.shape() {
                    Shape::Binary => {
                        let a = get(regs, cur.read_u32()?)?;
                        let b = get(regs, cur.read_u32()?)?;
                        put(regs, target, ops::binary(op, a, b).ok_or(unknown)??)?;
                    }
                    Shape::Unary => {
                        let a = get(regs, cur.read_u32()?)?;
                        put(regs, target, ops::unary(op, a).ok_or(unknown)??)?;
                    }
                    Shape::Load => {
                        let _align = cur.read_u32()?;
                        let offset = cur.read_u32()?;
                        let base = get(regs, cur.read_u32()?)?;
                        put(regs, target, ops::load(&self.memory, op, base, offset)?)?;
                    }
                    Shape::Store => {
                        let _align = cur.read_u32()?;
                        let offset = cur.read_u32()?;
                        let base = get(regs, cur.read_u32()?)?;
                        let value = get(regs, cur.read_u32()?)?;
                        ops::store(&mut self.memory, op, base, offset, value)?;
                    }
                    _ => return Err(unknown),
                }
                Flow::Next
            }
        };
        frame.ip = cur.pos();
        Ok(flow)
    }

    fn invoke_host(&mut self, call: PendingHostCall) -> Result<(), Trap> {
        let id = call.import as usize;
        let (module, field) = self
            .imports
            .get(id)
            .ok_or(Trap::BadIndex { kind: "import", index: id as u64 })?;
        if self.trace_mask.contains(TraceMask::HOST) {
            if let Some(sink) = self.trace.as_mut() {
                sink.host_call(call.import, module, field);
            }
        }
        let slot = self
            .host_funcs
            .get_mut(id)
            .ok_or(Trap::BadIndex { kind: "import", index: id as u64 })?;
        if slot.is_none() {
            *slot = self.resolver.resolve_func(module, field);
        }
        let func = slot
            .as_mut()
            .ok_or_else(|| Trap::UnresolvedImport { module: module.clone(), field: field.clone() })?;

        let frame = self
            .frames
            .last_mut()
            .ok_or(Trap::BadIndex { kind: "frame", index: 0 })?;
        let mut ctx = HostContext {
            args: &frame.locals,
            memory: &mut self.memory,
            globals: &mut self.globals,
            gas_used: self.gas,
        };
        let value = match panic::catch_unwind(AssertUnwindSafe(|| func(&mut ctx))) {
            Ok(result) => result?,
            Err(payload) => return Err(Trap::HostFailure { message: panic_message(payload) }),
        };
        if call.target != 0 {
            put(&mut frame.regs, call.target, value)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for VirtualMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualMachine")
            .field("state", &self.state)
            .field("functions", &self.functions.len())
            .field("frames", &self.frames.len())
            .field("memory_pages", &(self.memory.len() / PAGE_SIZE))
            .field("gas", &self.gas)
            .finish()
    }
}
