//! Stack code to register form.
//!
//! A simulated operand stack holds value ids instead of values. Structured
//! control (`block`, `loop`, `if`, `else`, `end`) opens and closes
//! [`Location`]s that remember where branches land and whether a value has
//! to survive the region boundary. Apart from the jumps an `if` needs, the
//! only code it emits is the back-edge `jmp` at a loop's `end`. Values
//! crossing a merge point travel through the single yielded register and are
//! picked up by a `phi` at the merge.

use crate::ast::{FuncType, SourceInstr};
use crate::bytecode::{Opcode, Shape, canonical_name};

use super::{CompileError, Instr, ModuleContext, ValueId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RegionKind {
    Function,
    Block,
    Loop,
    If,
    Else,
}

/// A jump immediate waiting for its region's end position.
#[derive(Debug, Clone, Copy)]
struct Fixup {
    code_pos: usize,
    slot: usize,
}

/// One open structured region.
#[derive(Debug, Clone)]
struct Location {
    kind: RegionKind,
    /// Loop head for loops, the `jmp_if` for ifs, entry position otherwise.
    code_pos: usize,
    stack_depth: usize,
    yields: bool,
    fixups: Vec<Fixup>,
    /// Set after an unconditional transfer; the rest of the region is
    /// stack-polymorphic dead code.
    unreachable: bool,
}

struct Translator<'a, 'm> {
    ctx: &'a ModuleContext<'m>,
    returns_value: bool,
    num_locals: usize,
    code: Vec<Instr>,
    stack: Vec<ValueId>,
    locations: Vec<Location>,
    next_value: ValueId,
}

/// Translates one function body into a flat register-form instruction list.
///
/// The list always ends in a return. Jump immediates are instruction indices.
pub fn translate(
    ctx: &ModuleContext<'_>,
    sig: &FuncType,
    num_locals: usize,
    body: &[SourceInstr],
) -> Result<Vec<Instr>, CompileError> {
    let mut t = Translator {
        ctx,
        returns_value: sig.returns_value(),
        num_locals,
        code: Vec::with_capacity(body.len() + 1),
        stack: Vec::new(),
        locations: Vec::new(),
        next_value: 1,
    };
    t.open(RegionKind::Function, sig.returns_value());

    for (at, ins) in body.iter().enumerate() {
        if t.locations.is_empty() {
            return Err(CompileError::UnbalancedControl { reason: "instruction after the function's final `end`" });
        }
        t.instr(at, ins)?;
    }
    match t.locations.len() {
        0 => {}
        1 => t.end()?,
        _ => return Err(CompileError::UnbalancedControl { reason: "region left open at end of body" }),
    }
    Ok(t.code)
}

fn imm(ins: &SourceInstr, n: usize) -> Result<i64, CompileError> {
    ins.immediates.get(n).copied().ok_or_else(|| CompileError::MissingImmediate {
        op: ins.op.clone(),
        expected: n + 1,
        found: ins.immediates.len(),
    })
}

fn is_internal(op: Opcode) -> bool {
    op.is_terminator()
        || matches!(
            op,
            Opcode::Call | Opcode::CallIndirect | Opcode::InvokeImport | Opcode::Phi | Opcode::AddGas
        )
}

impl Translator<'_, '_> {
    fn fresh(&mut self) -> ValueId {
        let v = self.next_value;
        self.next_value += 1;
        v
    }

    fn emit(&mut self, ins: Instr) -> usize {
        self.code.push(ins);
        self.code.len() - 1
    }

    fn current(&mut self) -> Result<&mut Location, CompileError> {
        self.locations
            .last_mut()
            .ok_or(CompileError::UnbalancedControl { reason: "no open region" })
    }

    fn floor(&self) -> (usize, bool) {
        self.locations
            .last()
            .map_or((0, false), |l| (l.stack_depth, l.unreachable))
    }

    fn pop(&mut self, op: &str, at: usize) -> Result<ValueId, CompileError> {
        let (floor, unreachable) = self.floor();
        if self.stack.len() > floor {
            if let Some(v) = self.stack.pop() {
                return Ok(v);
            }
        }
        if unreachable {
            return Ok(0);
        }
        Err(CompileError::StackUnderflow { op: op.to_string(), at })
    }

    fn pop_n(&mut self, n: usize, op: &str, at: usize) -> Result<Vec<ValueId>, CompileError> {
        let mut vals = Vec::with_capacity(n);
        for _ in 0..n {
            vals.push(self.pop(op, at)?);
        }
        vals.reverse();
        Ok(vals)
    }

    fn peek(&self, op: &str, at: usize) -> Result<ValueId, CompileError> {
        let (floor, unreachable) = self.floor();
        match self.stack.last() {
            Some(v) if self.stack.len() > floor => Ok(*v),
            _ if unreachable => Ok(0),
            _ => Err(CompileError::StackUnderflow { op: op.to_string(), at }),
        }
    }

    fn open(&mut self, kind: RegionKind, yields: bool) {
        self.locations.push(Location {
            kind,
            code_pos: self.code.len(),
            stack_depth: self.stack.len(),
            yields,
            fixups: Vec::new(),
            unreachable: false,
        });
    }

    fn mark_unreachable(&mut self) -> Result<(), CompileError> {
        let loc = self.current()?;
        loc.unreachable = true;
        let depth = loc.stack_depth;
        self.stack.truncate(depth);
        Ok(())
    }

    fn resolve(&mut self, fixups: &[Fixup], target: usize) {
        for f in fixups {
            if let Some(slot) = self.code.get_mut(f.code_pos).and_then(|i| i.immediates.get_mut(f.slot)) {
                *slot = target as i64;
            }
        }
    }

    fn local_index(&self, ins: &SourceInstr) -> Result<i64, CompileError> {
        let idx = imm(ins, 0)?;
        if idx < 0 || idx as usize >= self.num_locals {
            return Err(CompileError::IndexOutOfRange { kind: "local", index: idx });
        }
        Ok(idx)
    }

    fn global_index(&self, ins: &SourceInstr) -> Result<i64, CompileError> {
        let idx = imm(ins, 0)?;
        if idx < 0 || idx as usize >= self.ctx.num_globals {
            return Err(CompileError::IndexOutOfRange { kind: "global", index: idx });
        }
        Ok(idx)
    }

    /// Position of the location a branch of `depth` refers to.
    fn label(&self, depth: i64) -> Result<usize, CompileError> {
        let open = self.locations.len();
        usize::try_from(depth)
            .ok()
            .and_then(|d| open.checked_sub(d + 1))
            .ok_or(CompileError::LabelOutOfRange { depth, open })
    }

    /// Jump immediate for a branch to `loc_idx`, registering a fixup when
    /// the destination isn't known yet.
    fn branch_target(&mut self, loc_idx: usize, code_pos: usize, slot: usize) -> i64 {
        let loc = &mut self.locations[loc_idx];
        if loc.kind == RegionKind::Loop {
            loc.code_pos as i64
        } else {
            loc.fixups.push(Fixup { code_pos, slot });
            -1
        }
    }

    fn carries_value(&self, loc_idx: usize) -> bool {
        let loc = &self.locations[loc_idx];
        loc.kind != RegionKind::Loop && loc.yields
    }

    fn instr(&mut self, at: usize, ins: &SourceInstr) -> Result<(), CompileError> {
        let name = canonical_name(&ins.op);
        match name {
            "block" => self.open(RegionKind::Block, ins.yields()),
            "loop" => self.open(RegionKind::Loop, ins.yields()),
            "if" => {
                let cond = self.pop(name, at)?;
                let pos = self.code.len();
                self.emit(Instr::new(0, Opcode::JmpIf, vec![pos as i64 + 2], vec![cond, 0]));
                self.emit(Instr::new(0, Opcode::Jmp, vec![-1], vec![0]));
                self.open(RegionKind::If, ins.yields());
                self.current()?.code_pos = pos;
            }
            "else" => self.else_branch(at)?,
            "end" => self.end()?,
            "br" => {
                let idx = self.label(imm(ins, 0)?)?;
                let yielded = if self.carries_value(idx) { self.peek(name, at)? } else { 0 };
                let pos = self.code.len();
                let target = self.branch_target(idx, pos, 0);
                self.emit(Instr::new(0, Opcode::Jmp, vec![target], vec![yielded]));
                self.mark_unreachable()?;
            }
            "br_if" => {
                let idx = self.label(imm(ins, 0)?)?;
                let cond = self.pop(name, at)?;
                let yielded = if self.carries_value(idx) { self.peek(name, at)? } else { 0 };
                let pos = self.code.len();
                let target = self.branch_target(idx, pos, 0);
                self.emit(Instr::new(0, Opcode::JmpIf, vec![target], vec![cond, yielded]));
            }
            "br_table" => {
                if ins.immediates.is_empty() {
                    return Err(CompileError::MissingImmediate { op: ins.op.clone(), expected: 1, found: 0 });
                }
                let labels = ins
                    .immediates
                    .iter()
                    .map(|d| self.label(*d))
                    .collect::<Result<Vec<_>, _>>()?;
                let cond = self.pop(name, at)?;
                let yielded = if labels.iter().any(|l| self.carries_value(*l)) {
                    self.peek(name, at)?
                } else {
                    0
                };
                let pos = self.code.len();
                let targets = labels
                    .iter()
                    .enumerate()
                    .map(|(slot, l)| self.branch_target(*l, pos, slot))
                    .collect();
                self.emit(Instr::new(0, Opcode::JmpTable, targets, vec![cond, yielded]));
                self.mark_unreachable()?;
            }
            "return" => {
                self.emit_return(name, at)?;
                self.mark_unreachable()?;
            }
            "drop" => {
                self.pop(name, at)?;
            }
            "nop" => {}
            "local.tee" => {
                let idx = self.local_index(ins)?;
                let v = self.pop(name, at)?;
                self.emit(Instr::new(0, Opcode::LocalSet, vec![idx], vec![v]));
                self.stack.push(v);
            }
            "call" => {
                let func = imm(ins, 0)?;
                let sig = u32::try_from(func)
                    .ok()
                    .and_then(|f| self.ctx.signature(f))
                    .ok_or(CompileError::IndexOutOfRange { kind: "function", index: func })?;
                let args = self.pop_n(sig.params.len(), name, at)?;
                let target = if sig.returns_value() { self.fresh() } else { 0 };
                self.emit(Instr::new(target, Opcode::Call, vec![func], args));
                if target != 0 {
                    self.stack.push(target);
                }
            }
            "call_indirect" => {
                let ty = imm(ins, 0)?;
                let sig = usize::try_from(ty)
                    .ok()
                    .and_then(|t| self.ctx.types.get(t))
                    .ok_or(CompileError::IndexOutOfRange { kind: "type", index: ty })?;
                let index = self.pop(name, at)?;
                let mut operands = self.pop_n(sig.params.len(), name, at)?;
                operands.push(index);
                let target = if sig.returns_value() { self.fresh() } else { 0 };
                self.emit(Instr::new(target, Opcode::CallIndirect, vec![ty], operands));
                if target != 0 {
                    self.stack.push(target);
                }
            }
            _ => {
                let op = Opcode::from_name(name)
                    .filter(|op| !is_internal(*op))
                    .ok_or_else(|| CompileError::UnknownOperator { name: ins.op.clone(), at })?;
                self.simple(op, ins, at)?;
            }
        }
        Ok(())
    }

    /// Operators whose stack effect follows from their shape alone.
    fn simple(&mut self, op: Opcode, ins: &SourceInstr, at: usize) -> Result<(), CompileError> {
        let (arity, produces, num_imm) = match op.shape() {
            Shape::None => (0, op == Opcode::MemorySize, 0),
            Shape::Const32 | Shape::Const64 => (0, true, 1),
            Shape::Unary => (1, true, 0),
            Shape::Binary => (2, true, 0),
            Shape::Select => (3, true, 0),
            Shape::Load => (1, true, 2),
            Shape::Store => (2, false, 2),
            Shape::Index => (0, true, 1),
            Shape::IndexReg => (1, false, 1),
            _ => return Err(CompileError::UnknownOperator { name: ins.op.clone(), at }),
        };

        let immediates = match op {
            Opcode::LocalGet | Opcode::LocalSet => vec![self.local_index(ins)?],
            Opcode::GlobalGet | Opcode::GlobalSet => vec![self.global_index(ins)?],
            _ => (0..num_imm).map(|n| imm(ins, n)).collect::<Result<Vec<_>, _>>()?,
        };
        let operands = self.pop_n(arity, &ins.op, at)?;
        let target = if produces { self.fresh() } else { 0 };
        self.emit(Instr::new(target, op, immediates, operands));
        if produces {
            self.stack.push(target);
        }
        if op == Opcode::Unreachable {
            self.mark_unreachable()?;
        }
        Ok(())
    }

    fn emit_return(&mut self, op: &str, at: usize) -> Result<(), CompileError> {
        if self.returns_value {
            let v = self.peek(op, at)?;
            self.emit(Instr::new(0, Opcode::ReturnValue, vec![], vec![v]));
        } else {
            self.emit(Instr::new(0, Opcode::ReturnVoid, vec![], vec![]));
        }
        Ok(())
    }

    fn check_depth(&self, loc: &Location) -> Result<(), CompileError> {
        let expected = loc.stack_depth + usize::from(loc.yields);
        if !loc.unreachable && self.stack.len() != expected {
            return Err(CompileError::InconsistentStack { expected, actual: self.stack.len() });
        }
        Ok(())
    }

    fn else_branch(&mut self, at: usize) -> Result<(), CompileError> {
        let Some(loc) = self.locations.last().filter(|l| l.kind == RegionKind::If).cloned() else {
            return Err(CompileError::ElseWithoutIf);
        };
        self.check_depth(&loc)?;

        let mut fixups = Vec::new();
        if !loc.unreachable {
            let yielded = if loc.yields { self.pop("else", at)? } else { 0 };
            let pos = self.emit(Instr::new(0, Opcode::Jmp, vec![-1], vec![yielded]));
            fixups.push(Fixup { code_pos: pos, slot: 0 });
        }
        let else_start = self.code.len();
        self.resolve(&[Fixup { code_pos: loc.code_pos + 1, slot: 0 }], else_start);

        self.stack.truncate(loc.stack_depth);
        let cur = self.current()?;
        cur.kind = RegionKind::Else;
        cur.unreachable = false;
        cur.fixups.extend(fixups);
        Ok(())
    }

    fn end(&mut self) -> Result<(), CompileError> {
        let Some(mut loc) = self.locations.pop() else {
            return Err(CompileError::UnbalancedControl { reason: "`end` without an open region" });
        };
        self.check_depth(&loc)?;

        let result = match loc.kind {
            RegionKind::Loop => {
                if !loc.unreachable {
                    self.emit(Instr::new(0, Opcode::Jmp, vec![loc.code_pos as i64], vec![0]));
                }
                // Nothing branches to a loop's end, so whatever follows in
                // the enclosing region is dead.
                self.stack.truncate(loc.stack_depth);
                return self.mark_unreachable();
            }
            RegionKind::If | RegionKind::Block | RegionKind::Else | RegionKind::Function => {
                if loc.kind == RegionKind::If {
                    if loc.yields {
                        return Err(CompileError::IfWithoutElseYields);
                    }
                    loc.fixups.push(Fixup { code_pos: loc.code_pos + 1, slot: 0 });
                }
                if loc.yields && !loc.fixups.is_empty() {
                    if !loc.unreachable {
                        let v = self.pop("end", 0)?;
                        let next = self.code.len() + 1;
                        let pos = self.emit(Instr::new(0, Opcode::Jmp, vec![next as i64], vec![v]));
                        debug_assert_eq!(pos + 1, next);
                    }
                    let merge = self.code.len();
                    self.resolve(&loc.fixups, merge);
                    let phi = self.fresh();
                    self.emit(Instr::new(phi, Opcode::Phi, vec![], vec![]));
                    Some(phi)
                } else {
                    let merge = self.code.len();
                    self.resolve(&loc.fixups, merge);
                    if loc.yields { self.stack.last().copied().filter(|_| !loc.unreachable) } else { None }
                }
            }
        };

        self.stack.truncate(loc.stack_depth);
        if loc.yields {
            self.stack.push(result.unwrap_or(0));
        }
        if loc.kind == RegionKind::Function {
            self.emit_return("end", 0)?;
        }
        Ok(())
    }
}
