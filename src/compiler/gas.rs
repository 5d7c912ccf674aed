use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::bytecode::Opcode;

use super::cfg::Cfg;
use super::{CompileError, Instr};

/// Fixed charge added to every instrumented block.
pub const BLOCK_OVERHEAD: u64 = 1;

/// Maps an operator name to the gas it costs.
pub trait GasPolicy: Send + Sync {
    fn cost(&self, op: &str) -> u64;
}

/// The same cost for every operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimpleGasPolicy {
    pub per_instruction: u64,
}

impl Default for SimpleGasPolicy {
    fn default() -> Self {
        SimpleGasPolicy { per_instruction: 1 }
    }
}

impl GasPolicy for SimpleGasPolicy {
    fn cost(&self, _op: &str) -> u64 {
        self.per_instruction
    }
}

/// Per-operator costs with a fallback, loadable from a JSON object such as
/// `{"default": 1, "costs": {"i32.div_s": 8, "call": 20}}`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TableGasPolicy {
    #[serde(default)]
    pub default: u64,
    #[serde(default)]
    pub costs: HashMap<String, u64>,
}

impl TableGasPolicy {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

impl GasPolicy for TableGasPolicy {
    fn cost(&self, op: &str) -> u64 {
        self.costs.get(op).copied().unwrap_or(self.default)
    }
}

/// Prefixes every block with an `add_gas` charge for its body plus
/// [`BLOCK_OVERHEAD`]. Terminators are not charged.
pub fn instrument(cfg: &mut Cfg, policy: &dyn GasPolicy) -> Result<(), CompileError> {
    for (block, blk) in cfg.blocks.iter_mut().enumerate() {
        let total = blk
            .body
            .iter()
            .try_fold(BLOCK_OVERHEAD, |acc, ins| acc.checked_add(policy.cost(ins.op.name())))
            .ok_or(CompileError::GasOverflow { block })?;
        let total = i64::try_from(total).map_err(|_| CompileError::GasOverflow { block })?;
        blk.body.insert(0, Instr::new(0, Opcode::AddGas, vec![total], vec![]));
    }
    Ok(())
}
