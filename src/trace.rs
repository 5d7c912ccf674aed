//! Execution tracing.
//!
//! The VM only calls a sink for the event classes present in both the
//! sink's own [`TraceSink::mask`] and [`crate::vm::Config::trace_mask`].

use serde::{Deserialize, Serialize};

use crate::bytecode::Opcode;

/// A set of trace event classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TraceMask(u32);

impl TraceMask {
    pub const NONE: Self = Self(0);
    /// Each dispatched instruction.
    pub const OPCODE: Self = Self(1 << 0);
    /// Frame entry and exit.
    pub const CALL: Self = Self(1 << 1);
    /// Host import invocations.
    pub const HOST: Self = Self(1 << 2);
    /// `add_gas` charges.
    pub const GAS: Self = Self(1 << 3);
    pub const ALL: Self = Self(0b1111);

    pub const fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    pub const fn bits(self) -> u32 {
        self.0
    }
}

impl Default for TraceMask {
    fn default() -> Self {
        TraceMask::ALL
    }
}

impl std::ops::BitOr for TraceMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for TraceMask {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl std::ops::BitAnd for TraceMask {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

/// Receives VM events. Every method has an empty default.
pub trait TraceSink {
    fn mask(&self) -> TraceMask {
        TraceMask::NONE
    }

    /// Before an instruction executes. `pc` is its byte offset.
    fn instr(&mut self, _func: u32, _pc: usize, _op: Opcode) {}

    /// After a frame is pushed. `depth` counts the new frame.
    fn call_enter(&mut self, _func: u32, _depth: usize) {}

    /// Before a frame is popped.
    fn call_exit(&mut self, _func: u32, _depth: usize) {}

    fn host_call(&mut self, _import: u32, _module: &str, _field: &str) {}

    /// `total` is the gas consumed so far, including `charged`.
    fn gas(&mut self, _charged: u64, _total: u64) {}
}

/// Prints one line per event on stderr. Used by `--trace`.
#[derive(Debug, Clone, Copy)]
pub struct StderrTrace {
    pub mask: TraceMask,
}

impl Default for StderrTrace {
    fn default() -> Self {
        StderrTrace { mask: TraceMask::CALL | TraceMask::HOST | TraceMask::GAS }
    }
}

impl TraceSink for StderrTrace {
    fn mask(&self) -> TraceMask {
        self.mask
    }

    fn instr(&mut self, func: u32, pc: usize, op: Opcode) {
        eprintln!("[trace] f{func} {pc:04x} {op}");
    }

    fn call_enter(&mut self, func: u32, depth: usize) {
        eprintln!("[trace] {:indent$}-> f{func}", "", indent = depth.saturating_sub(1) * 2);
    }

    fn call_exit(&mut self, func: u32, depth: usize) {
        eprintln!("[trace] {:indent$}<- f{func}", "", indent = depth.saturating_sub(1) * 2);
    }

    fn host_call(&mut self, import: u32, module: &str, field: &str) {
        eprintln!("[trace] host #{import} {module}.{field}");
    }

    fn gas(&mut self, charged: u64, total: u64) {
        eprintln!("[trace] gas +{charged} = {total}");
    }
}

/// Keeps every event in memory. Handy in tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordingTrace {
    pub events: Vec<TraceEvent>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEvent {
    Instr { func: u32, pc: usize, op: Opcode },
    Enter { func: u32, depth: usize },
    Exit { func: u32, depth: usize },
    Host { import: u32 },
    Gas { charged: u64, total: u64 },
}

impl TraceSink for RecordingTrace {
    fn mask(&self) -> TraceMask {
        TraceMask::ALL
    }

    fn instr(&mut self, func: u32, pc: usize, op: Opcode) {
        self.events.push(TraceEvent::Instr { func, pc, op });
    }

    fn call_enter(&mut self, func: u32, depth: usize) {
        self.events.push(TraceEvent::Enter { func, depth });
    }

    fn call_exit(&mut self, func: u32, depth: usize) {
        self.events.push(TraceEvent::Exit { func, depth });
    }

    fn host_call(&mut self, import: u32, _module: &str, _field: &str) {
        self.events.push(TraceEvent::Host { import });
    }

    fn gas(&mut self, charged: u64, total: u64) {
        self.events.push(TraceEvent::Gas { charged, total });
    }
}

/// Lets a caller keep a handle on a sink after giving it to the VM.
impl<T: TraceSink> TraceSink for std::rc::Rc<std::cell::RefCell<T>> {
    fn mask(&self) -> TraceMask {
        self.borrow().mask()
    }

    fn instr(&mut self, func: u32, pc: usize, op: Opcode) {
        self.borrow_mut().instr(func, pc, op);
    }

    fn call_enter(&mut self, func: u32, depth: usize) {
        self.borrow_mut().call_enter(func, depth);
    }

    fn call_exit(&mut self, func: u32, depth: usize) {
        self.borrow_mut().call_exit(func, depth);
    }

    fn host_call(&mut self, import: u32, module: &str, field: &str) {
        self.borrow_mut().host_call(import, module, field);
    }

    fn gas(&mut self, charged: u64, total: u64) {
        self.borrow_mut().gas(charged, total);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_algebra() {
        let m = TraceMask::CALL | TraceMask::GAS;
        assert!(m.contains(TraceMask::CALL));
        assert!(!m.contains(TraceMask::HOST));
        assert_eq!((m & TraceMask::GAS), TraceMask::GAS);
        assert!(TraceMask::ALL.contains(m));
        assert_eq!(TraceMask::NONE.bits(), 0);
    }

    #[test]
    fn mask_serializes_as_bits() {
        let json = serde_json::to_string(&(TraceMask::OPCODE | TraceMask::HOST)).unwrap();
        assert_eq!(json, "5");
        let back: TraceMask = serde_json::from_str(&json).unwrap();
        assert!(back.contains(TraceMask::HOST));
    }
}
