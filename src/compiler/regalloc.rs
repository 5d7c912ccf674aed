//! Coalesces SSA values into reusable registers.
//!
//! Two values may share a register when they are never live at the same
//! point. Interference comes from instruction-level liveness (block
//! live-out plus a backward scan); values are then colored greedily in
//! definition order, which for structured code never needs more registers
//! than the peak number of simultaneously live values. Register 0 stays
//! reserved for "no value".

use super::cfg::Cfg;
use super::liveness::{BitSet, Liveness, ValueSlots};
use super::{CompileError, ValueId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocStats {
    /// Registers the frame needs, including the reserved register 0.
    pub registers: u32,
    /// Most values live at any single program point.
    pub max_pressure: usize,
    /// Distinct values live on entry to some block.
    pub live_in_union: usize,
}

/// Value -> register table plus the numbers behind it.
#[derive(Debug, Clone)]
pub struct Allocation {
    pub mapping: Vec<Option<u32>>,
    pub interference: Vec<Vec<ValueId>>,
    pub stats: AllocStats,
}

pub fn allocate(cfg: &mut Cfg) -> Result<AllocStats, CompileError> {
    let alloc = plan(cfg);
    apply(cfg, &alloc.mapping)?;
    Ok(alloc.stats)
}

/// Computes the coloring without rewriting the graph.
pub fn plan(cfg: &Cfg) -> Allocation {
    let space = ValueSlots::for_cfg(cfg);
    let n = space.num_values;
    let live = Liveness::compute(cfg, &space);

    let mut interference: Vec<Vec<ValueId>> = vec![Vec::new(); n];
    let mut max_pressure = 0;
    for (b, blk) in cfg.blocks.iter().enumerate() {
        let mut now: BitSet = live.live_out[b].clone();
        for v in blk.terminator_uses() {
            now.set(v as usize);
        }
        max_pressure = max_pressure.max(now.count());
        for ins in blk.body.iter().rev() {
            if ins.target != 0 {
                let t = ins.target as usize;
                now.set(t);
                max_pressure = max_pressure.max(now.count());
                for v in now.iter().filter(|v| *v != t) {
                    interference[t].push(v as ValueId);
                    interference[v].push(t as ValueId);
                }
                now.clear(t);
            }
            for v in ins.operands.iter().filter(|v| **v != 0) {
                now.set(*v as usize);
            }
            max_pressure = max_pressure.max(now.count());
        }
    }

    // definitions first, in layout order; anything referenced but never
    // defined goes last
    let mut order: Vec<ValueId> = Vec::new();
    let mut seen = BitSet::new_empty(n);
    let mut visit = |v: ValueId, order: &mut Vec<ValueId>| {
        if v != 0 && !seen.get(v as usize) {
            seen.set(v as usize);
            order.push(v);
        }
    };
    for blk in &cfg.blocks {
        for ins in &blk.body {
            visit(ins.target, &mut order);
        }
    }
    for blk in &cfg.blocks {
        for ins in &blk.body {
            for v in &ins.operands {
                visit(*v, &mut order);
            }
        }
        for v in blk.terminator_uses() {
            visit(v, &mut order);
        }
    }

    let mut mapping: Vec<Option<u32>> = vec![None; n];
    if n > 0 {
        mapping[0] = Some(0);
    }
    let mut taken: Vec<bool> = Vec::new();
    let mut highest = 0u32;
    for v in order {
        taken.clear();
        for w in &interference[v as usize] {
            if let Some(r) = mapping[*w as usize] {
                let r = r as usize;
                if taken.len() <= r {
                    taken.resize(r + 1, false);
                }
                taken[r] = true;
            }
        }
        let reg = (1..).find(|r| !taken.get(*r as usize).copied().unwrap_or(false)).unwrap_or(1);
        mapping[v as usize] = Some(reg);
        highest = highest.max(reg);
    }

    Allocation {
        mapping,
        interference,
        stats: AllocStats {
            registers: highest + 1,
            max_pressure,
            live_in_union: live.live_in_union(),
        },
    }
}

/// Rewrites every value reference through `mapping`.
pub fn apply(cfg: &mut Cfg, mapping: &[Option<u32>]) -> Result<(), CompileError> {
    let reg = |v: ValueId| -> Result<ValueId, CompileError> {
        mapping
            .get(v as usize)
            .copied()
            .flatten()
            .ok_or(CompileError::RegisterMissing { value: v })
    };
    for blk in &mut cfg.blocks {
        for ins in &mut blk.body {
            ins.target = reg(ins.target)?;
            for v in &mut ins.operands {
                *v = reg(*v)?;
            }
        }
        blk.condition = reg(blk.condition)?;
        blk.yielded = reg(blk.yielded)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{FuncType, Module, SourceInstr, ValueType};
    use crate::compiler::{ModuleContext, translate};

    fn lower(params: usize, locals: usize, body: &[SourceInstr]) -> Cfg {
        let mut m = Module::default();
        let sig = FuncType::new(vec![ValueType::I32; params], vec![ValueType::I32]);
        m.types.push(sig.clone());
        let ctx = ModuleContext::new(&m);
        let code = translate::translate(&ctx, &sig, params + locals, body).unwrap();
        Cfg::build(&code).unwrap()
    }

    fn i(op: &str, imm: &[i64]) -> SourceInstr {
        SourceInstr::new(op, imm)
    }

    fn check_coloring(cfg: &Cfg) -> AllocStats {
        let alloc = plan(cfg);
        for (v, neighbours) in alloc.interference.iter().enumerate() {
            for w in neighbours {
                assert_ne!(alloc.mapping[v], alloc.mapping[*w as usize], "%{v} and %{w} interfere");
            }
        }
        assert!(
            alloc.stats.registers as usize <= alloc.stats.max_pressure + 1,
            "{:?}",
            alloc.stats
        );
        alloc.stats
    }

    #[test]
    fn chain_reuses_registers() {
        // ((a + b) + a) + b: never more than three values alive
        let cfg = lower(2, 0, &[
            i("local.get", &[0]),
            i("local.get", &[1]),
            i("i32.add", &[]),
            i("local.get", &[0]),
            i("i32.add", &[]),
            i("local.get", &[1]),
            i("i32.add", &[]),
        ]);
        let stats = check_coloring(&cfg);
        assert_eq!(stats.max_pressure, 2);
        assert_eq!(stats.registers, 3);
    }

    #[test]
    fn apply_rewrites_in_place() {
        let mut cfg = lower(2, 0, &[i("local.get", &[0]), i("local.get", &[1]), i("i32.sub", &[])]);
        let stats = allocate(&mut cfg).unwrap();
        let body = &cfg.blocks[0].body;
        assert_ne!(body[0].target, body[1].target);
        assert_eq!(body[2].operands, vec![body[0].target, body[1].target]);
        assert_eq!(cfg.blocks[0].yielded, body[2].target);
        assert!(body.iter().all(|i| i.target < stats.registers));
    }

    #[test]
    fn missing_mapping_is_an_error() {
        let mut cfg = lower(1, 0, &[i("local.get", &[0])]);
        let err = apply(&mut cfg, &[Some(0)]).unwrap_err();
        assert_eq!(err, CompileError::RegisterMissing { value: 1 });
    }

    #[test]
    fn values_across_a_merge_do_not_collide() {
        let cfg = lower(1, 0, &[
            i("local.get", &[0]),
            i("local.get", &[0]),
            i("if", &[]).with_result(ValueType::I32),
            i("i32.const", &[1]),
            i("else", &[]),
            i("i32.const", &[2]),
            i("end", &[]),
            i("i32.add", &[]),
        ]);
        check_coloring(&cfg);
    }

    /// Random but well-formed bodies: every statement leaves the stack as
    /// it found it.
    fn statement(rng: &mut fastrand::Rng, depth: u32, out: &mut Vec<SourceInstr>) {
        let local = |rng: &mut fastrand::Rng| rng.i64(0..4);
        let kinds = if depth > 2 { 3 } else { 7 };
        match rng.u32(0..kinds) {
            0 => {
                out.push(i("local.get", &[local(rng)]));
                out.push(i("local.get", &[local(rng)]));
                out.push(i("i32.add", &[]));
                out.push(i("local.set", &[local(rng)]));
            }
            1 => {
                out.push(i("i32.const", &[rng.i64(-5..5)]));
                out.push(i("local.set", &[local(rng)]));
            }
            2 => {
                for _ in 0..3 {
                    out.push(i("local.get", &[local(rng)]));
                }
                out.push(i("i32.mul", &[]));
                out.push(i("i32.xor", &[]));
                out.push(i("local.set", &[local(rng)]));
            }
            3 => {
                out.push(i("local.get", &[local(rng)]));
                out.push(i("if", &[]));
                statement(rng, depth + 1, out);
                out.push(i("else", &[]));
                statement(rng, depth + 1, out);
                out.push(i("end", &[]));
            }
            4 => {
                out.push(i("block", &[]));
                out.push(i("local.get", &[local(rng)]));
                out.push(i("br_if", &[0]));
                statement(rng, depth + 1, out);
                out.push(i("end", &[]));
            }
            5 => {
                out.push(i("local.get", &[local(rng)]));
                out.push(i("block", &[]));
                out.push(i("loop", &[]));
                statement(rng, depth + 1, out);
                out.push(i("local.get", &[local(rng)]));
                out.push(i("br_if", &[1]));
                out.push(i("end", &[]));
                out.push(i("end", &[]));
                out.push(i("local.set", &[local(rng)]));
            }
            _ => {
                out.push(i("local.get", &[local(rng)]));
                out.push(i("local.get", &[local(rng)]));
                out.push(i("if", &[]).with_result(ValueType::I32));
                out.push(i("i32.const", &[1]));
                out.push(i("else", &[]));
                out.push(i("local.get", &[local(rng)]));
                out.push(i("end", &[]));
                out.push(i("i32.sub", &[]));
                out.push(i("local.set", &[local(rng)]));
            }
        }
    }

    #[test]
    fn random_programs_respect_the_register_budget() {
        let mut rng = fastrand::Rng::with_seed(0x5eed);
        for _ in 0..200 {
            let mut body = Vec::new();
            for _ in 0..rng.usize(1..8) {
                statement(&mut rng, 0, &mut body);
            }
            body.push(i("local.get", &[0]));
            let mut cfg = lower(2, 2, &body);
            crate::compiler::liveness::eliminate_dead_stores(&mut cfg, 4);
            check_coloring(&cfg);
        }
    }

    #[test]
    fn random_programs_have_sound_liveness() {
        use crate::compiler::liveness::use_def;
        let mut rng = fastrand::Rng::with_seed(42);
        for _ in 0..100 {
            let mut body = Vec::new();
            for _ in 0..rng.usize(1..6) {
                statement(&mut rng, 0, &mut body);
            }
            body.push(i("local.get", &[1]));
            let cfg = lower(2, 2, &body);
            let space = ValueSlots::for_cfg(&cfg);
            let live = Liveness::compute(&cfg, &space);
            let (uses, defs) = use_def(&cfg, &space);
            for b in 0..cfg.len() {
                for v in live.live_in[b].iter() {
                    let via_succ = cfg.successors(b).iter().any(|s| live.live_in[*s].get(v));
                    assert!(uses[b].get(v) || (via_succ && !defs[b].get(v)), "block {b} %{v}");
                }
            }
        }
    }
}
