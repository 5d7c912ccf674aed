use std::collections::BTreeSet;

use crate::bytecode::Opcode;

use super::{CompileError, Instr, ValueId};

pub type BlockId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminator {
    /// Only legal while the graph is being built.
    Undefined,
    Unconditional,
    /// `targets[0]` when the condition is non-zero, `targets[1]` otherwise.
    Either,
    /// `targets[..n]` indexed by the condition, `targets[n]` is the default.
    Table,
    Return,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicBlock {
    /// Non-control instructions only.
    pub body: Vec<Instr>,
    pub kind: Terminator,
    pub targets: Vec<BlockId>,
    pub condition: ValueId,
    pub yielded: ValueId,
}

impl BasicBlock {
    fn empty() -> Self {
        BasicBlock {
            body: Vec::new(),
            kind: Terminator::Undefined,
            targets: Vec::new(),
            condition: 0,
            yielded: 0,
        }
    }

    /// Values read by the terminator.
    pub fn terminator_uses(&self) -> impl Iterator<Item = ValueId> {
        [self.condition, self.yielded].into_iter().filter(|v| *v != 0)
    }
}

/// Control-flow graph of one function. Block 0 is the entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cfg {
    pub blocks: Vec<BasicBlock>,
}

impl Cfg {
    /// Splits a flat instruction list into basic blocks.
    ///
    /// Leaders are index 0, every jump target, and every instruction that
    /// follows a terminator. A block that falls into the next leader gets an
    /// unconditional edge; the last block returns if it falls off the end.
    pub fn build(code: &[Instr]) -> Result<Cfg, CompileError> {
        let len = code.len();
        if len == 0 {
            let mut only = BasicBlock::empty();
            only.kind = Terminator::Return;
            return Ok(Cfg { blocks: vec![only] });
        }

        let index = |target: i64| -> Result<usize, CompileError> {
            usize::try_from(target)
                .ok()
                .filter(|t| *t < len)
                .ok_or(CompileError::InvalidJumpTarget { target, len })
        };

        let mut leaders = BTreeSet::from([0usize]);
        for (i, ins) in code.iter().enumerate() {
            if ins.op.is_jump() {
                for t in &ins.immediates {
                    leaders.insert(index(*t)?);
                }
            }
            if ins.op == Opcode::JmpIf {
                leaders.insert(index(i as i64 + 1)?);
            } else if ins.op.is_terminator() && i + 1 < len {
                leaders.insert(i + 1);
            }
        }

        let mut label = vec![None; len];
        for (id, pos) in leaders.iter().enumerate() {
            label[*pos] = Some(id);
        }
        let block_of = |target: i64| -> Result<BlockId, CompileError> {
            index(target).and_then(|t| label[t].ok_or(CompileError::InvalidJumpTarget { target, len }))
        };

        let mut blocks = vec![BasicBlock::empty(); leaders.len()];
        let mut cur = 0;
        for (i, ins) in code.iter().enumerate() {
            if let Some(next) = label[i].filter(|b| *b != cur) {
                if blocks[cur].kind == Terminator::Undefined {
                    blocks[cur].kind = Terminator::Unconditional;
                    blocks[cur].targets = vec![next];
                }
                cur = next;
            }

            let operand = |n: usize| ins.operands.get(n).copied().unwrap_or(0);
            let blk = &mut blocks[cur];
            match ins.op {
                Opcode::Jmp => {
                    blk.kind = Terminator::Unconditional;
                    blk.targets = vec![block_of(ins.immediates.first().copied().unwrap_or(-1))?];
                    blk.yielded = operand(0);
                }
                Opcode::JmpIf => {
                    blk.kind = Terminator::Either;
                    blk.targets = vec![
                        block_of(ins.immediates.first().copied().unwrap_or(-1))?,
                        block_of(i as i64 + 1)?,
                    ];
                    blk.condition = operand(0);
                    blk.yielded = operand(1);
                }
                Opcode::JmpEither | Opcode::JmpTable => {
                    blk.kind = if ins.op == Opcode::JmpEither { Terminator::Either } else { Terminator::Table };
                    blk.targets = ins.immediates.iter().map(|t| block_of(*t)).collect::<Result<_, _>>()?;
                    blk.condition = operand(0);
                    blk.yielded = operand(1);
                }
                Opcode::ReturnValue => {
                    blk.kind = Terminator::Return;
                    blk.yielded = operand(0);
                }
                Opcode::ReturnVoid => blk.kind = Terminator::Return,
                _ => blk.body.push(ins.clone()),
            }
        }

        if let Some(last) = blocks.last_mut() {
            if last.kind == Terminator::Undefined {
                last.kind = Terminator::Return;
            }
        }
        if let Some(block) = blocks.iter().position(|b| b.kind == Terminator::Undefined) {
            return Err(CompileError::UndefinedTerminator { block });
        }
        Ok(Cfg { blocks })
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn successors(&self, block: BlockId) -> &[BlockId] {
        self.blocks.get(block).map_or(&[], |b| b.targets.as_slice())
    }

    pub fn predecessors(&self) -> Vec<Vec<BlockId>> {
        let mut preds = vec![Vec::new(); self.blocks.len()];
        for (b, blk) in self.blocks.iter().enumerate() {
            for s in &blk.targets {
                if let Some(p) = preds.get_mut(*s) {
                    if !p.contains(&b) {
                        p.push(b);
                    }
                }
            }
        }
        preds
    }

    /// Lays the blocks out again in order, turning block ids back into
    /// instruction indices. Every block ends in an explicit terminator.
    pub fn flatten(&self) -> Result<Vec<Instr>, CompileError> {
        let mut starts = Vec::with_capacity(self.blocks.len());
        let mut pos = 0usize;
        for b in &self.blocks {
            starts.push(pos as i64);
            pos += b.body.len() + 1;
        }
        let start_of = |b: BlockId| starts.get(b).copied().ok_or(CompileError::InvalidJumpTarget { target: b as i64, len: starts.len() });

        let mut out = Vec::with_capacity(pos);
        for (id, b) in self.blocks.iter().enumerate() {
            out.extend(b.body.iter().cloned());
            let targets = b.targets.iter().map(|t| start_of(*t)).collect::<Result<Vec<_>, _>>()?;
            let term = match b.kind {
                Terminator::Unconditional => Instr::new(0, Opcode::Jmp, targets, vec![b.yielded]),
                Terminator::Either => Instr::new(0, Opcode::JmpEither, targets, vec![b.condition, b.yielded]),
                Terminator::Table => Instr::new(0, Opcode::JmpTable, targets, vec![b.condition, b.yielded]),
                Terminator::Return if b.yielded != 0 => Instr::new(0, Opcode::ReturnValue, vec![], vec![b.yielded]),
                Terminator::Return => Instr::new(0, Opcode::ReturnVoid, vec![], vec![]),
                Terminator::Undefined => return Err(CompileError::UndefinedTerminator { block: id }),
            };
            out.push(term);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ins(target: ValueId, op: Opcode, imm: &[i64], operands: &[ValueId]) -> Instr {
        Instr::new(target, op, imm.to_vec(), operands.to_vec())
    }

    /// if (%1) { %2 = 10 } else { %3 = 20 }; phi
    fn diamond() -> Vec<Instr> {
        vec![
            ins(1, Opcode::LocalGet, &[0], &[]),
            ins(0, Opcode::JmpIf, &[3], &[1, 0]),
            ins(0, Opcode::Jmp, &[5], &[0]),
            ins(2, Opcode::I32Const, &[10], &[]),
            ins(0, Opcode::Jmp, &[7], &[2]),
            ins(3, Opcode::I32Const, &[20], &[]),
            ins(0, Opcode::Jmp, &[7], &[3]),
            ins(4, Opcode::Phi, &[], &[]),
            ins(0, Opcode::ReturnValue, &[], &[4]),
        ]
    }

    #[test]
    fn diamond_blocks_and_edges() {
        let cfg = Cfg::build(&diamond()).unwrap();
        assert_eq!(cfg.len(), 5);
        assert_eq!(cfg.blocks[0].kind, Terminator::Either);
        assert_eq!(cfg.blocks[0].targets, vec![2, 1]);
        assert_eq!(cfg.blocks[0].condition, 1);
        assert_eq!(cfg.blocks[1].targets, vec![3]);
        assert_eq!(cfg.blocks[2].yielded, 2);
        assert_eq!(cfg.blocks[3].yielded, 3);
        assert_eq!(cfg.blocks[4].kind, Terminator::Return);
        assert_eq!(cfg.blocks[4].yielded, 4);
        assert_eq!(cfg.predecessors()[4], vec![2, 3]);
    }

    #[test]
    fn every_block_is_terminated_and_in_range() {
        let cfg = Cfg::build(&diamond()).unwrap();
        for b in &cfg.blocks {
            assert_ne!(b.kind, Terminator::Undefined);
            assert!(b.targets.iter().all(|t| *t < cfg.len()));
        }
    }

    #[test]
    fn fallthrough_into_label_gets_an_edge() {
        let code = vec![
            ins(1, Opcode::I32Const, &[1], &[]),
            ins(2, Opcode::I32Const, &[2], &[]),
            ins(0, Opcode::JmpIf, &[1], &[1, 0]),
            ins(0, Opcode::ReturnVoid, &[], &[]),
        ];
        let cfg = Cfg::build(&code).unwrap();
        assert_eq!(cfg.len(), 3);
        assert_eq!(cfg.blocks[0].kind, Terminator::Unconditional);
        assert_eq!(cfg.blocks[0].targets, vec![1]);
        assert_eq!(cfg.blocks[1].targets, vec![1, 2]);
    }

    #[test]
    fn falling_off_the_end_returns() {
        let code = vec![ins(1, Opcode::I32Const, &[1], &[])];
        let cfg = Cfg::build(&code).unwrap();
        assert_eq!(cfg.blocks[0].kind, Terminator::Return);
        assert_eq!(Cfg::build(&[]).unwrap().blocks[0].kind, Terminator::Return);
    }

    #[test]
    fn out_of_range_target_is_rejected() {
        let code = vec![ins(0, Opcode::Jmp, &[9], &[0])];
        assert_eq!(Cfg::build(&code), Err(CompileError::InvalidJumpTarget { target: 9, len: 1 }));
        let code = vec![ins(0, Opcode::JmpIf, &[0], &[0, 0])];
        assert!(Cfg::build(&code).is_err());
    }

    #[test]
    fn flatten_then_rebuild_keeps_the_graph() {
        let cfg = Cfg::build(&diamond()).unwrap();
        let flat = cfg.flatten().unwrap();
        assert_eq!(flat[1].op, Opcode::JmpEither);
        assert_eq!(flat[1].immediates, vec![3, 2]);
        let again = Cfg::build(&flat).unwrap();
        assert_eq!(again, cfg);
    }

    #[test]
    fn table_targets_translate_to_blocks() {
        let code = vec![
            ins(1, Opcode::LocalGet, &[0], &[]),
            ins(0, Opcode::JmpTable, &[2, 3, 2], &[1, 0]),
            ins(0, Opcode::ReturnVoid, &[], &[]),
            ins(0, Opcode::ReturnVoid, &[], &[]),
        ];
        let cfg = Cfg::build(&code).unwrap();
        assert_eq!(cfg.blocks[0].kind, Terminator::Table);
        assert_eq!(cfg.blocks[0].targets, vec![1, 2, 1]);
    }
}
