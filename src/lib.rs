//! regwasm lowers WebAssembly-style stack code to register bytecode and
//! runs it.
//!
//! ```text
//! listing --lexer/parser--> ast::Module --compiler--> bytecode --vm--> result
//! ```

pub mod ast;
pub mod bytecode;
pub mod compiler;
pub mod diagnostic;
pub mod lexer;
pub mod parser;
pub mod trace;
pub mod vm;

pub use ast::Module;
pub use compiler::{CompileOptions, GasPolicy, SimpleGasPolicy, TableGasPolicy};
pub use vm::{Config, HostImports, NoImports, State, Trap, VirtualMachine, VmError};
