//! Backward liveness over a [`Cfg`].
//!
//! The same fixpoint runs over two slot spaces: local-variable slots (to
//! find stores nobody reads) and SSA values (to drive register coalescing).

use std::collections::HashMap;

use crate::bytecode::Opcode;

use super::ValueId;
use super::cfg::{BasicBlock, Cfg};

// ── BitSet ──────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BitSet {
    bits: Vec<u64>,
    len: usize,
}

impl BitSet {
    pub fn new_empty(len: usize) -> Self {
        BitSet { bits: vec![0; len.div_ceil(64)], len }
    }

    pub fn get(&self, idx: usize) -> bool {
        idx < self.len && (self.bits[idx / 64] >> (idx % 64)) & 1 == 1
    }

    pub fn set(&mut self, idx: usize) {
        if idx < self.len {
            self.bits[idx / 64] |= 1_u64 << (idx % 64);
        }
    }

    pub fn clear(&mut self, idx: usize) {
        if idx < self.len {
            self.bits[idx / 64] &= !(1_u64 << (idx % 64));
        }
    }

    pub fn union_with(&mut self, other: &Self) {
        for (a, b) in self.bits.iter_mut().zip(&other.bits) {
            *a |= *b;
        }
    }

    pub fn subtract_with(&mut self, other: &Self) {
        for (a, b) in self.bits.iter_mut().zip(&other.bits) {
            *a &= !*b;
        }
    }

    pub fn count(&self) -> usize {
        self.bits.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).filter(|i| self.get(*i))
    }
}

// ── Slot spaces ─────────────────────────────────────────────────────

/// What a liveness run tracks: which slots an instruction reads and writes.
pub trait SlotSpace {
    fn width(&self) -> usize;
    fn reads(&self, ins: &super::Instr, out: &mut Vec<usize>);
    fn write(&self, ins: &super::Instr) -> Option<usize>;
    fn terminator_reads(&self, blk: &BasicBlock, out: &mut Vec<usize>);
}

/// Local-variable slots: parameters followed by declared locals.
pub struct LocalSlots {
    pub num_locals: usize,
}

impl SlotSpace for LocalSlots {
    fn width(&self) -> usize {
        self.num_locals
    }

    fn reads(&self, ins: &super::Instr, out: &mut Vec<usize>) {
        if ins.op == Opcode::LocalGet {
            if let Some(idx) = ins.immediates.first() {
                out.push(*idx as usize);
            }
        }
    }

    fn write(&self, ins: &super::Instr) -> Option<usize> {
        match ins.op {
            Opcode::LocalSet => ins.immediates.first().map(|i| *i as usize),
            _ => None,
        }
    }

    fn terminator_reads(&self, _blk: &BasicBlock, _out: &mut Vec<usize>) {}
}

/// SSA value ids. Id 0 is never tracked.
pub struct ValueSlots {
    pub num_values: usize,
}

impl ValueSlots {
    /// Sized to hold every id referenced anywhere in the graph.
    pub fn for_cfg(cfg: &Cfg) -> Self {
        let mut max = 0;
        for b in &cfg.blocks {
            for ins in &b.body {
                max = max.max(ins.target);
                max = ins.operands.iter().copied().fold(max, ValueId::max);
            }
            max = max.max(b.condition).max(b.yielded);
        }
        ValueSlots { num_values: max as usize + 1 }
    }
}

impl SlotSpace for ValueSlots {
    fn width(&self) -> usize {
        self.num_values
    }

    fn reads(&self, ins: &super::Instr, out: &mut Vec<usize>) {
        out.extend(ins.operands.iter().filter(|v| **v != 0).map(|v| *v as usize));
    }

    fn write(&self, ins: &super::Instr) -> Option<usize> {
        (ins.target != 0).then_some(ins.target as usize)
    }

    fn terminator_reads(&self, blk: &BasicBlock, out: &mut Vec<usize>) {
        out.extend(blk.terminator_uses().map(|v| v as usize));
    }
}

// ── Fixpoint ────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Liveness {
    pub live_in: Vec<BitSet>,
    pub live_out: Vec<BitSet>,
}

/// Upward-exposed uses and definitions per block.
pub fn use_def(cfg: &Cfg, space: &impl SlotSpace) -> (Vec<BitSet>, Vec<BitSet>) {
    let width = space.width();
    let mut uses = Vec::with_capacity(cfg.len());
    let mut defs = Vec::with_capacity(cfg.len());
    let mut reads = Vec::new();

    for blk in &cfg.blocks {
        let mut use_set = BitSet::new_empty(width);
        let mut def_set = BitSet::new_empty(width);
        for ins in &blk.body {
            reads.clear();
            space.reads(ins, &mut reads);
            for r in &reads {
                if !def_set.get(*r) {
                    use_set.set(*r);
                }
            }
            if let Some(w) = space.write(ins) {
                def_set.set(w);
            }
        }
        reads.clear();
        space.terminator_reads(blk, &mut reads);
        for r in &reads {
            if !def_set.get(*r) {
                use_set.set(*r);
            }
        }
        uses.push(use_set);
        defs.push(def_set);
    }
    (uses, defs)
}

impl Liveness {
    /// `live_in(B) = uses(B) ∪ (live_out(B) − defs(B))`, iterated until no
    /// set changes. Back edges are just revisited.
    pub fn compute(cfg: &Cfg, space: &impl SlotSpace) -> Liveness {
        let width = space.width();
        let (uses, defs) = use_def(cfg, space);
        let n = cfg.len();
        let mut live_in = vec![BitSet::new_empty(width); n];
        let mut live_out = vec![BitSet::new_empty(width); n];

        let mut changed = true;
        while changed {
            changed = false;
            for b in (0..n).rev() {
                let mut out = BitSet::new_empty(width);
                for s in cfg.successors(b) {
                    out.union_with(&live_in[*s]);
                }
                let mut in_set = out.clone();
                in_set.subtract_with(&defs[b]);
                in_set.union_with(&uses[b]);

                if out != live_out[b] {
                    live_out[b] = out;
                    changed = true;
                }
                if in_set != live_in[b] {
                    live_in[b] = in_set;
                    changed = true;
                }
            }
        }
        Liveness { live_in, live_out }
    }

    /// Number of distinct slots live on entry to any block.
    pub fn live_in_union(&self) -> usize {
        let Some(first) = self.live_in.first() else {
            return 0;
        };
        let mut all = first.clone();
        for s in &self.live_in[1..] {
            all.union_with(s);
        }
        all.count()
    }
}

// ── Dead local stores ───────────────────────────────────────────────

/// Stores whose slot is dead right after the store, as (block, index).
pub fn dead_local_stores(cfg: &Cfg, num_locals: usize) -> Vec<(usize, usize)> {
    let live = Liveness::compute(cfg, &LocalSlots { num_locals });
    let mut dead = Vec::new();
    for (b, blk) in cfg.blocks.iter().enumerate() {
        let mut now = live.live_out[b].clone();
        for (i, ins) in blk.body.iter().enumerate().rev() {
            let Some(slot) = ins.immediates.first().map(|s| *s as usize) else {
                continue;
            };
            match ins.op {
                Opcode::LocalSet => {
                    if !now.get(slot) {
                        dead.push((b, i));
                    }
                    now.clear(slot);
                }
                Opcode::LocalGet => now.set(slot),
                _ => {}
            }
        }
    }
    dead
}

/// Removes stores to locals that are never read afterwards, then every
/// side-effect-free producer left without a use. Repeats until stable and
/// returns the number of instructions removed.
pub fn eliminate_dead_stores(cfg: &mut Cfg, num_locals: usize) -> usize {
    let mut total = 0;
    loop {
        let stores = dead_local_stores(cfg, num_locals);
        if stores.is_empty() {
            return total;
        }
        total += remove_with_producers(cfg, &stores);
    }
}

fn remove_with_producers(cfg: &mut Cfg, seeds: &[(usize, usize)]) -> usize {
    let mut uses: HashMap<ValueId, usize> = HashMap::new();
    let mut producer: HashMap<ValueId, (usize, usize)> = HashMap::new();
    for (b, blk) in cfg.blocks.iter().enumerate() {
        for (i, ins) in blk.body.iter().enumerate() {
            if ins.target != 0 {
                producer.insert(ins.target, (b, i));
            }
            for v in ins.operands.iter().filter(|v| **v != 0) {
                *uses.entry(*v).or_default() += 1;
            }
        }
        for v in blk.terminator_uses() {
            *uses.entry(v).or_default() += 1;
        }
    }

    let mut removed: Vec<Vec<bool>> = cfg.blocks.iter().map(|b| vec![false; b.body.len()]).collect();
    let mut work: Vec<(usize, usize)> = seeds.to_vec();
    let mut count = 0;
    while let Some((b, i)) = work.pop() {
        if removed[b][i] {
            continue;
        }
        removed[b][i] = true;
        count += 1;
        for v in cfg.blocks[b].body[i].operands.iter().filter(|v| **v != 0) {
            let left = uses.entry(*v).or_default();
            *left = left.saturating_sub(1);
            if *left > 0 {
                continue;
            }
            if let Some(&(pb, pi)) = producer.get(v) {
                if cfg.blocks[pb].body[pi].op.is_pure() {
                    work.push((pb, pi));
                }
            }
        }
    }

    for (blk, gone) in cfg.blocks.iter_mut().zip(&removed) {
        let mut flags = gone.iter();
        blk.body.retain(|_| !flags.next().copied().unwrap_or(false));
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::Instr;
    use crate::compiler::cfg::Terminator;

    fn ins(target: ValueId, op: Opcode, imm: &[i64], operands: &[ValueId]) -> Instr {
        Instr::new(target, op, imm.to_vec(), operands.to_vec())
    }

    fn block(body: Vec<Instr>, kind: Terminator, targets: Vec<usize>, condition: ValueId, yielded: ValueId) -> BasicBlock {
        BasicBlock { body, kind, targets, condition, yielded }
    }

    #[test]
    fn bitset_ops() {
        let mut a = BitSet::new_empty(130);
        a.set(0);
        a.set(64);
        a.set(129);
        a.set(500);
        assert_eq!(a.count(), 3);
        assert_eq!(a.iter().collect::<Vec<_>>(), vec![0, 64, 129]);
        let mut b = BitSet::new_empty(130);
        b.set(64);
        a.subtract_with(&b);
        assert!(!a.get(64));
        b.union_with(&a);
        assert_eq!(b.count(), 3);
        b.clear(0);
        assert!(!b.get(0));
    }

    /// b0: %1 = const; %2 = const -> b1
    /// b1: %3 = add %1 %1; jmp_if %3 -> b1 | b2   (loop uses %1 every trip)
    /// b2: return %2
    fn loop_cfg() -> Cfg {
        Cfg {
            blocks: vec![
                block(
                    vec![ins(1, Opcode::I32Const, &[1], &[]), ins(2, Opcode::I32Const, &[2], &[])],
                    Terminator::Unconditional,
                    vec![1],
                    0,
                    0,
                ),
                block(vec![ins(3, Opcode::I32Add, &[], &[1, 1])], Terminator::Either, vec![1, 2], 3, 0),
                block(vec![], Terminator::Return, vec![], 0, 2),
            ],
        }
    }

    #[test]
    fn values_live_around_a_loop() {
        let cfg = loop_cfg();
        let live = Liveness::compute(&cfg, &ValueSlots::for_cfg(&cfg));
        assert_eq!(live.live_in[0].count(), 0);
        assert_eq!(live.live_in[1].iter().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(live.live_in[2].iter().collect::<Vec<_>>(), vec![2]);
        assert!(!live.live_out[1].get(3));
        assert_eq!(live.live_in_union(), 2);
    }

    #[test]
    fn live_in_implies_a_later_use() {
        // Soundness on the synthetic loop: every live-in value is read in
        // the block or live out of it without being redefined first.
        let cfg = loop_cfg();
        let space = ValueSlots::for_cfg(&cfg);
        let live = Liveness::compute(&cfg, &space);
        let (uses, defs) = use_def(&cfg, &space);
        for b in 0..cfg.len() {
            for v in live.live_in[b].iter() {
                assert!(uses[b].get(v) || (live.live_out[b].get(v) && !defs[b].get(v)), "block {b} value {v}");
            }
        }
    }

    #[test]
    fn overwritten_store_is_dead() {
        let mut cfg = Cfg {
            blocks: vec![block(
                vec![
                    ins(1, Opcode::I32Const, &[1], &[]),
                    ins(0, Opcode::LocalSet, &[0], &[1]),
                    ins(2, Opcode::I32Const, &[2], &[]),
                    ins(0, Opcode::LocalSet, &[0], &[2]),
                    ins(3, Opcode::LocalGet, &[0], &[]),
                ],
                Terminator::Return,
                vec![],
                0,
                3,
            )],
        };
        assert_eq!(dead_local_stores(&cfg, 1), vec![(0, 1)]);
        assert_eq!(eliminate_dead_stores(&mut cfg, 1), 2);
        let ops: Vec<_> = cfg.blocks[0].body.iter().map(|i| i.op).collect();
        assert_eq!(ops, vec![Opcode::I32Const, Opcode::LocalSet, Opcode::LocalGet]);
    }

    #[test]
    fn store_read_after_loop_back_edge_is_kept() {
        // b0: local.set 0 <- %1 ; b1: %2 = local.get 0 ; jmp_if %2 -> b1 | b2
        let mut cfg = Cfg {
            blocks: vec![
                block(
                    vec![ins(1, Opcode::I32Const, &[5], &[]), ins(0, Opcode::LocalSet, &[0], &[1])],
                    Terminator::Unconditional,
                    vec![1],
                    0,
                    0,
                ),
                block(vec![ins(2, Opcode::LocalGet, &[0], &[])], Terminator::Either, vec![1, 2], 2, 0),
                block(vec![], Terminator::Return, vec![], 0, 0),
            ],
        };
        assert!(dead_local_stores(&cfg, 1).is_empty());
        assert_eq!(eliminate_dead_stores(&mut cfg, 1), 0);
    }

    #[test]
    fn trapping_producer_survives() {
        let mut cfg = Cfg {
            blocks: vec![block(
                vec![
                    ins(1, Opcode::LocalGet, &[0], &[]),
                    ins(2, Opcode::I32Const, &[0], &[]),
                    ins(3, Opcode::I32DivS, &[], &[1, 2]),
                    ins(0, Opcode::LocalSet, &[1], &[3]),
                ],
                Terminator::Return,
                vec![],
                0,
                0,
            )],
        };
        eliminate_dead_stores(&mut cfg, 2);
        let ops: Vec<_> = cfg.blocks[0].body.iter().map(|i| i.op).collect();
        assert_eq!(ops, vec![Opcode::LocalGet, Opcode::I32Const, Opcode::I32DivS]);
    }

    #[test]
    fn shared_producer_is_kept_while_used() {
        // %1 feeds both a dead store and the return value.
        let mut cfg = Cfg {
            blocks: vec![block(
                vec![ins(1, Opcode::I32Const, &[7], &[]), ins(0, Opcode::LocalSet, &[0], &[1])],
                Terminator::Return,
                vec![],
                0,
                1,
            )],
        };
        assert_eq!(eliminate_dead_stores(&mut cfg, 1), 1);
        assert_eq!(cfg.blocks[0].body.len(), 1);
    }
}
