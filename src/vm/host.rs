use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use super::{PAGE_SIZE, Trap};

/// A host function. It sees the arguments of the import call through
/// [`HostContext`] and returns one 64-bit word (ignored for void imports).
pub type HostFunction = Box<dyn FnMut(&mut HostContext<'_>) -> Result<i64, Trap>>;

/// Supplies the host side of a module's imports.
///
/// Functions are resolved lazily, the first time the import is invoked.
/// Globals are resolved once when the module is instantiated.
pub trait ImportResolver {
    fn resolve_func(&mut self, module: &str, field: &str) -> Option<HostFunction>;
    fn resolve_global(&mut self, module: &str, field: &str) -> Option<i64>;
}

/// Resolves nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoImports;

impl ImportResolver for NoImports {
    fn resolve_func(&mut self, _module: &str, _field: &str) -> Option<HostFunction> {
        None
    }

    fn resolve_global(&mut self, _module: &str, _field: &str) -> Option<i64> {
        None
    }
}

type SharedHostFn = Rc<RefCell<dyn FnMut(&mut HostContext<'_>) -> Result<i64, Trap>>>;

/// A table of named host functions and globals.
///
/// Every import of the same `module.field` is served by the one registered
/// function, so any state it captures is shared between them.
#[derive(Default)]
pub struct HostImports {
    funcs: HashMap<(String, String), SharedHostFn>,
    globals: HashMap<(String, String), i64>,
}

impl HostImports {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn func(
        mut self,
        module: &str,
        field: &str,
        f: impl FnMut(&mut HostContext<'_>) -> Result<i64, Trap> + 'static,
    ) -> Self {
        let shared: SharedHostFn = Rc::new(RefCell::new(f));
        self.funcs.insert((module.to_string(), field.to_string()), shared);
        self
    }

    pub fn global(mut self, module: &str, field: &str, value: i64) -> Self {
        self.globals.insert((module.to_string(), field.to_string()), value);
        self
    }
}

impl ImportResolver for HostImports {
    fn resolve_func(&mut self, module: &str, field: &str) -> Option<HostFunction> {
        let shared = Rc::clone(self.funcs.get(&(module.to_string(), field.to_string()))?);
        Some(Box::new(move |ctx: &mut HostContext<'_>| {
            let mut f = shared.try_borrow_mut().map_err(|_| Trap::HostFailure {
                message: "host function re-entered".to_string(),
            })?;
            (&mut *f)(ctx)
        }))
    }

    fn resolve_global(&mut self, module: &str, field: &str) -> Option<i64> {
        self.globals.get(&(module.to_string(), field.to_string())).copied()
    }
}

impl std::fmt::Debug for HostImports {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.funcs.keys().map(|(m, n)| format!("{m}.{n}")).collect();
        names.sort();
        f.debug_struct("HostImports").field("funcs", &names).field("globals", &self.globals).finish()
    }
}

/// What a host function may touch while it runs.
pub struct HostContext<'a> {
    /// The import frame's locals; the arguments come first.
    pub(crate) args: &'a [i64],
    pub(crate) memory: &'a mut Vec<u8>,
    pub(crate) globals: &'a mut [i64],
    pub(crate) gas_used: u64,
}

impl<'a> HostContext<'a> {
    pub fn args(&self) -> &[i64] {
        self.args
    }

    pub fn arg(&self, index: usize) -> Result<i64, Trap> {
        self.args
            .get(index)
            .copied()
            .ok_or(Trap::BadIndex { kind: "argument", index: index as u64 })
    }

    /// The argument truncated to i32.
    pub fn arg_i32(&self, index: usize) -> Result<i32, Trap> {
        self.arg(index).map(|v| v as i32)
    }

    pub fn memory(&self) -> &[u8] {
        &self.memory[..]
    }

    pub fn memory_mut(&mut self) -> &mut [u8] {
        &mut self.memory[..]
    }

    pub fn memory_pages(&self) -> u32 {
        (self.memory.len() / PAGE_SIZE) as u32
    }

    pub fn read(&self, address: u32, len: u32) -> Result<&[u8], Trap> {
        let start = address as usize;
        start
            .checked_add(len as usize)
            .and_then(|end| self.memory.get(start..end))
            .ok_or(Trap::MemoryOutOfBounds { address: address as u64, width: len })
    }

    pub fn write(&mut self, address: u32, bytes: &[u8]) -> Result<(), Trap> {
        let start = address as usize;
        let dest = start
            .checked_add(bytes.len())
            .and_then(|end| self.memory.get_mut(start..end))
            .ok_or(Trap::MemoryOutOfBounds { address: address as u64, width: bytes.len() as u32 })?;
        dest.copy_from_slice(bytes);
        Ok(())
    }

    pub fn global(&self, index: usize) -> Result<i64, Trap> {
        self.globals
            .get(index)
            .copied()
            .ok_or(Trap::BadIndex { kind: "global", index: index as u64 })
    }

    pub fn set_global(&mut self, index: usize, value: i64) -> Result<(), Trap> {
        let slot = self
            .globals
            .get_mut(index)
            .ok_or(Trap::BadIndex { kind: "global", index: index as u64 })?;
        *slot = value;
        Ok(())
    }

    pub fn gas_used(&self) -> u64 {
        self.gas_used
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_lookup_shares_one_function() {
        let mut calls = 0;
        let mut imports = HostImports::new()
            .func("env", "tick", move |_| {
                calls += 1;
                Ok(calls)
            })
            .global("env", "g", 9);
        let mut first = imports.resolve_func("env", "tick").unwrap();
        let mut second = imports.resolve_func("env", "tick").unwrap();
        assert!(imports.resolve_func("env", "tock").is_none());

        let (mut memory, mut globals) = (Vec::new(), Vec::new());
        let mut ctx = HostContext { args: &[], memory: &mut memory, globals: &mut globals, gas_used: 0 };
        assert_eq!(first(&mut ctx), Ok(1));
        assert_eq!(second(&mut ctx), Ok(2));
        assert_eq!(first(&mut ctx), Ok(3));
        assert_eq!(imports.resolve_global("env", "g"), Some(9));
        assert_eq!(imports.resolve_global("env", "g"), Some(9));
    }

    #[test]
    fn context_bounds_checks_memory() {
        let mut memory = vec![0u8; 8];
        let mut globals = vec![5];
        let args = [3, 4];
        let mut ctx = HostContext { args: &args, memory: &mut memory, globals: &mut globals, gas_used: 0 };
        assert_eq!(ctx.arg(1), Ok(4));
        assert!(ctx.arg(2).is_err());
        ctx.write(6, &[1, 2]).unwrap();
        assert_eq!(ctx.read(6, 2).unwrap(), &[1, 2]);
        assert_eq!(ctx.write(7, &[1, 2]), Err(Trap::MemoryOutOfBounds { address: 7, width: 2 }));
        ctx.set_global(0, 6).unwrap();
        assert_eq!(ctx.global(0), Ok(6));
    }
}
