//! Capturing and restoring a paused VM.
//!
//! A [`Snapshot`] is two byte blobs: the machine state as JSON and a raw
//! copy of linear memory. Code is never captured; restoring re-links each
//! frame against the function table of the VM it is restored into, so a
//! snapshot only fits a VM built from the same module.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{Frame, PAGE_SIZE, PendingHostCall, State, VirtualMachine, VmError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub state: Vec<u8>,
    pub memory: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct FrameState {
    function_id: u32,
    regs: Vec<i64>,
    locals: Vec<i64>,
    ip: usize,
    return_reg: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct MachineState {
    frames: Vec<FrameState>,
    /// Index of the executing frame, -1 with an empty stack.
    current_frame: i64,
    globals: Vec<i64>,
    num_value_slots: usize,
    gas: u64,
    steps: u64,
    yielded: i64,
    pending: Option<PendingHostCall>,
    state: State,
}

fn bad(message: impl Into<String>) -> VmError {
    VmError::Snapshot(message.into())
}

impl VirtualMachine {
    /// Captures a VM that is ready, running or waiting on a host call.
    pub fn snapshot(&self) -> Result<Snapshot, VmError> {
        if self.state == State::Exited {
            return Err(VmError::InvalidState { expected: State::Running, actual: self.state });
        }
        let machine = MachineState {
            frames: self
                .frames
                .iter()
                .map(|f| FrameState {
                    function_id: f.function_id,
                    regs: f.regs.clone(),
                    locals: f.locals.clone(),
                    ip: f.ip,
                    return_reg: f.return_reg,
                })
                .collect(),
            current_frame: self.frames.len() as i64 - 1,
            globals: self.globals.clone(),
            num_value_slots: self.num_value_slots,
            gas: self.gas,
            steps: self.steps,
            yielded: self.yielded,
            pending: self.pending,
            state: self.state,
        };
        let state = serde_json::to_vec(&machine).map_err(|e| bad(e.to_string()))?;
        Ok(Snapshot { state, memory: self.memory.clone() })
    }

    /// Replaces this VM's execution state with a snapshot. Nothing changes
    /// when the snapshot does not fit.
    pub fn restore(&mut self, snapshot: &Snapshot) -> Result<(), VmError> {
        let machine: MachineState = serde_json::from_slice(&snapshot.state).map_err(|e| bad(e.to_string()))?;

        if machine.current_frame != machine.frames.len() as i64 - 1 {
            return Err(bad(format!(
                "current frame {} does not match {} frame(s)",
                machine.current_frame,
                machine.frames.len()
            )));
        }
        if machine.globals.len() != self.globals.len() {
            return Err(bad(format!("expected {} globals, found {}", self.globals.len(), machine.globals.len())));
        }
        if snapshot.memory.len() % PAGE_SIZE != 0 {
            return Err(bad("memory is not a whole number of pages"));
        }
        let pages = (snapshot.memory.len() / PAGE_SIZE) as u32;
        if pages > self.max_pages {
            return Err(VmError::MemoryLimit { pages, max: self.max_pages });
        }
        match (machine.state, machine.pending, machine.frames.is_empty()) {
            (State::Exited, ..) => return Err(bad("cannot restore an exited machine")),
            (State::Ready, None, true) => {}
            (State::Running, None, false) | (State::AwaitingHostCall, Some(_), false) => {}
            (state, ..) => return Err(bad(format!("inconsistent {state} state"))),
        }

        let depth_limit = self.config.max_call_stack_depth;
        if depth_limit != 0 && machine.frames.len() > depth_limit {
            return Err(bad(format!("{} frames exceed the call depth limit of {depth_limit}", machine.frames.len())));
        }

        let mut frames = Vec::with_capacity(machine.frames.len());
        let mut slots = 0;
        for f in machine.frames {
            let code = self
                .functions
                .get(f.function_id as usize)
                .ok_or_else(|| bad(format!("unknown function {}", f.function_id)))?;
            if f.regs.len() != code.num_regs as usize {
                return Err(bad(format!("function {} has {} registers", f.function_id, code.num_regs)));
            }
            if f.locals.len() != (code.num_params + code.num_locals) as usize {
                return Err(bad(format!("function {} has the wrong number of locals", f.function_id)));
            }
            if f.ip >= code.code.len() {
                return Err(bad(format!("ip {} is outside function {}", f.ip, f.function_id)));
            }
            slots += code.value_slots();
            frames.push(Frame {
                function_id: f.function_id,
                code: Arc::clone(&code.code),
                regs: f.regs,
                locals: f.locals,
                ip: f.ip,
                return_reg: f.return_reg,
            });
        }
        let slot_limit = self.config.max_value_slots;
        if slot_limit != 0 && slots > slot_limit {
            return Err(bad(format!("{slots} value slots exceed the limit of {slot_limit}")));
        }
        if slots != machine.num_value_slots {
            return Err(bad(format!("value slot count {} should be {slots}", machine.num_value_slots)));
        }

        self.frames = frames;
        self.globals = machine.globals;
        self.memory = snapshot.memory.clone();
        self.num_value_slots = slots;
        self.gas = machine.gas;
        self.steps = machine.steps;
        self.yielded = machine.yielded;
        self.pending = machine.pending;
        self.state = machine.state;
        self.outcome = None;
        self.trap_site = None;
        Ok(())
    }
}
