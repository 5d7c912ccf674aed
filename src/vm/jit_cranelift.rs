//! Cranelift acceleration for straight-line integer functions.
//!
//! A function qualifies when its bytecode is a single block of integer
//! constants, parameter reads, wrapping integer arithmetic and one final
//! `return`. Such code cannot trap except on gas, so its whole `add_gas`
//! total is charged up front and the native body takes over from the
//! interpreter at frame entry.

use std::collections::HashMap;

use cranelift_codegen::Context;
use cranelift_codegen::ir::types::{I32, I64};
use cranelift_codegen::ir::{AbiParam, InstBuilder, Value};
use cranelift_codegen::settings::{self, Configurable};
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{Linkage, Module, default_libcall_names};

use crate::bytecode::disasm::{DecodedInstr, disassemble};
use crate::bytecode::Opcode;

const MAX_PARAMS: usize = 8;

/// Check that a decoded body uses only operations the native path covers.
pub(crate) fn is_jit_eligible(body: &[DecodedInstr], num_params: usize, returns_value: bool) -> bool {
    if !returns_value || num_params > MAX_PARAMS {
        return false;
    }
    let Some((last, rest)) = body.split_last() else {
        return false;
    };
    if last.op != Opcode::ReturnValue {
        return false;
    }
    rest.iter().all(|ins| match ins.op {
        Opcode::Nop | Opcode::AddGas | Opcode::I32Const | Opcode::I64Const => true,
        Opcode::LocalGet => ins.operands.first().is_some_and(|i| (*i as usize) < num_params),
        op => int_binary(op).is_some(),
    })
}

#[derive(Clone, Copy)]
enum IntOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
}

/// The operation and whether it works on 32-bit values.
fn int_binary(op: Opcode) -> Option<(IntOp, bool)> {
    Some(match op {
        Opcode::I32Add => (IntOp::Add, true),
        Opcode::I32Sub => (IntOp::Sub, true),
        Opcode::I32Mul => (IntOp::Mul, true),
        Opcode::I32And => (IntOp::And, true),
        Opcode::I32Or => (IntOp::Or, true),
        Opcode::I32Xor => (IntOp::Xor, true),
        Opcode::I64Add => (IntOp::Add, false),
        Opcode::I64Sub => (IntOp::Sub, false),
        Opcode::I64Mul => (IntOp::Mul, false),
        Opcode::I64And => (IntOp::And, false),
        Opcode::I64Or => (IntOp::Or, false),
        Opcode::I64Xor => (IntOp::Xor, false),
        _ => return None,
    })
}

/// Compiled Cranelift function that can be called repeatedly.
pub(crate) struct JitFunction {
    _module: JITModule,
    func_ptr: *const u8,
    param_count: usize,
    /// Sum of the body's `add_gas` charges.
    pub(crate) static_gas: u64,
}

// The function pointer is safe to call from any thread (it's immutable code).
unsafe impl Send for JitFunction {}

impl std::fmt::Debug for JitFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JitFunction")
            .field("param_count", &self.param_count)
            .field("static_gas", &self.static_gas)
            .finish()
    }
}

/// Compile a function body into native code. `None` when it does not
/// qualify or Cranelift rejects it.
pub(crate) fn compile(code: &[u8], num_params: usize, returns_value: bool) -> Option<JitFunction> {
    let body = disassemble(code).ok()?;
    if !is_jit_eligible(&body, num_params, returns_value) {
        return None;
    }

    let mut flag_builder = settings::builder();
    flag_builder.set("opt_level", "speed").ok()?;
    let isa_builder = cranelift_native::builder().ok()?;
    let isa = isa_builder.finish(settings::Flags::new(flag_builder)).ok()?;

    let builder = JITBuilder::with_isa(isa, default_libcall_names());
    let mut module = JITModule::new(builder);

    // Every slot is a 64-bit word: (i64, i64, ...) -> i64
    let mut sig = module.make_signature();
    for _ in 0..num_params {
        sig.params.push(AbiParam::new(I64));
    }
    sig.returns.push(AbiParam::new(I64));

    let func_id = module.declare_function("jit_func", Linkage::Local, &sig).ok()?;

    let mut ctx = Context::new();
    ctx.func.signature = sig;

    let mut fn_builder_ctx = FunctionBuilderContext::new();
    let mut builder = FunctionBuilder::new(&mut ctx.func, &mut fn_builder_ctx);

    let entry_block = builder.create_block();
    builder.append_block_params_for_function_params(entry_block);
    builder.switch_to_block(entry_block);
    builder.seal_block(entry_block);
    let params = builder.block_params(entry_block).to_vec();

    let mut regs: HashMap<u32, Value> = HashMap::new();
    let mut static_gas = 0u64;

    for ins in &body {
        match ins.op {
            Opcode::Nop => {}
            Opcode::AddGas => {
                static_gas = static_gas.checked_add(*ins.operands.first()?)?;
            }
            Opcode::I32Const => {
                let v = *ins.operands.first()? as u32 as i32 as i64;
                regs.insert(ins.target, builder.ins().iconst(I64, v));
            }
            Opcode::I64Const => {
                let v = *ins.operands.first()? as i64;
                regs.insert(ins.target, builder.ins().iconst(I64, v));
            }
            Opcode::LocalGet => {
                let p = *params.get(*ins.operands.first()? as usize)?;
                regs.insert(ins.target, p);
            }
            Opcode::ReturnValue => {
                let r = *ins.operands.first()? as u32;
                let v = match regs.get(&r) {
                    Some(v) => *v,
                    None => builder.ins().iconst(I64, 0),
                };
                builder.ins().return_(&[v]);
            }
            op => {
                let (kind, narrow) = int_binary(op)?;
                let mut operand = |i: usize| -> Option<Value> {
                    let r = *ins.operands.get(i)? as u32;
                    Some(match regs.get(&r) {
                        Some(v) => *v,
                        None => builder.ins().iconst(I64, 0),
                    })
                };
                let a = operand(0)?;
                let b = operand(1)?;
                let wide = match kind {
                    IntOp::Add => builder.ins().iadd(a, b),
                    IntOp::Sub => builder.ins().isub(a, b),
                    IntOp::Mul => builder.ins().imul(a, b),
                    IntOp::And => builder.ins().band(a, b),
                    IntOp::Or => builder.ins().bor(a, b),
                    IntOp::Xor => builder.ins().bxor(a, b),
                };
                // i32 results live sign-extended in their slot.
                let result = if narrow {
                    let low = builder.ins().ireduce(I32, wide);
                    builder.ins().sextend(I64, low)
                } else {
                    wide
                };
                regs.insert(ins.target, result);
            }
        }
    }

    builder.finalize();

    module.define_function(func_id, &mut ctx).ok()?;
    module.finalize_definitions().ok()?;

    let func_ptr = module.get_finalized_function(func_id);

    Some(JitFunction { _module: module, func_ptr, param_count: num_params, static_gas })
}

/// Call a compiled function. Extra trailing slots (declared locals) are
/// ignored.
pub(crate) fn call(func: &JitFunction, args: &[i64]) -> Option<i64> {
    let args = args.get(..func.param_count)?;
    Some(match args.len() {
        0 => {
            let f: extern "C" fn() -> i64 = unsafe { std::mem::transmute(func.func_ptr) };
            f()
        }
        1 => {
            let f: extern "C" fn(i64) -> i64 = unsafe { std::mem::transmute(func.func_ptr) };
            f(args[0])
        }
        2 => {
            let f: extern "C" fn(i64, i64) -> i64 = unsafe { std::mem::transmute(func.func_ptr) };
            f(args[0], args[1])
        }
        3 => {
            let f: extern "C" fn(i64, i64, i64) -> i64 = unsafe { std::mem::transmute(func.func_ptr) };
            f(args[0], args[1], args[2])
        }
        4 => {
            let f: extern "C" fn(i64, i64, i64, i64) -> i64 = unsafe { std::mem::transmute(func.func_ptr) };
            f(args[0], args[1], args[2], args[3])
        }
        5 => {
            let f: extern "C" fn(i64, i64, i64, i64, i64) -> i64 = unsafe { std::mem::transmute(func.func_ptr) };
            f(args[0], args[1], args[2], args[3], args[4])
        }
        6 => {
            let f: extern "C" fn(i64, i64, i64, i64, i64, i64) -> i64 = unsafe { std::mem::transmute(func.func_ptr) };
            f(args[0], args[1], args[2], args[3], args[4], args[5])
        }
        7 => {
            let f: extern "C" fn(i64, i64, i64, i64, i64, i64, i64) -> i64 =
                unsafe { std::mem::transmute(func.func_ptr) };
            f(args[0], args[1], args[2], args[3], args[4], args[5], args[6])
        }
        8 => {
            let f: extern "C" fn(i64, i64, i64, i64, i64, i64, i64, i64) -> i64 =
                unsafe { std::mem::transmute(func.func_ptr) };
            f(args[0], args[1], args[2], args[3], args[4], args[5], args[6], args[7])
        }
        _ => return None,
    })
}
