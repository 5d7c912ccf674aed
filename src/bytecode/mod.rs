//! Register bytecode shared by the compiler and the interpreter.
//!
//! Every instruction is laid out as
//!
//! ```text
//! [target: u32 LE][opcode: u8][operands by Shape, LE]
//! ```
//!
//! Jump targets are absolute byte offsets into the function's code.

use std::collections::HashMap;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

pub mod cursor;
pub mod disasm;

pub use cursor::{Cursor, OutOfBounds};
pub use disasm::{DecodeError, DecodedInstr, disassemble};

/// Bytes in the fixed instruction header (target + opcode).
pub const HEADER_LEN: usize = 5;

/// Operand layout that follows the header. Widths are fixed per shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    /// No operands.
    None,
    /// One u32 immediate.
    Const32,
    /// One u64 immediate.
    Const64,
    /// One register.
    Unary,
    /// Two registers.
    Binary,
    /// Three registers: a, b, condition.
    Select,
    /// align, offset, base register.
    Load,
    /// align, offset, base register, value register.
    Store,
    /// Local or global index.
    Index,
    /// Local or global index, value register.
    IndexReg,
    /// target, yield register.
    Jmp,
    /// target, condition, yield register.
    JmpIf,
    /// taken target, fallthrough target, condition, yield register.
    JmpEither,
    /// count, `count` targets, default target, condition, yield register.
    JmpTable,
    /// function id, argument count, argument registers.
    Call,
    /// type id, argument count, argument registers, table-index register.
    CallIndirect,
    /// import id.
    Import,
    /// u64 gas amount.
    Gas,
}

macro_rules! opcodes {
    ($($variant:ident = $name:literal, $shape:ident;)*) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[repr(u8)]
        pub enum Opcode {
            $($variant),*
        }

        impl Opcode {
            pub const ALL: &'static [Opcode] = &[$(Opcode::$variant),*];

            pub fn name(self) -> &'static str {
                match self {
                    $(Opcode::$variant => $name),*
                }
            }

            pub fn shape(self) -> Shape {
                match self {
                    $(Opcode::$variant => Shape::$shape),*
                }
            }
        }
    };
}

opcodes! {
    Nop = "nop", None;
    Unreachable = "unreachable", None;
    Select = "select", Select;

    I32Const = "i32.const", Const32;
    I64Const = "i64.const", Const64;
    F32Const = "f32.const", Const32;
    F64Const = "f64.const", Const64;

    I32Add = "i32.add", Binary;
    I32Sub = "i32.sub", Binary;
    I32Mul = "i32.mul", Binary;
    I32DivS = "i32.div_s", Binary;
    I32DivU = "i32.div_u", Binary;
    I32RemS = "i32.rem_s", Binary;
    I32RemU = "i32.rem_u", Binary;
    I32And = "i32.and", Binary;
    I32Or = "i32.or", Binary;
    I32Xor = "i32.xor", Binary;
    I32Shl = "i32.shl", Binary;
    I32ShrS = "i32.shr_s", Binary;
    I32ShrU = "i32.shr_u", Binary;
    I32Rotl = "i32.rotl", Binary;
    I32Rotr = "i32.rotr", Binary;
    I32Clz = "i32.clz", Unary;
    I32Ctz = "i32.ctz", Unary;
    I32Popcnt = "i32.popcnt", Unary;
    I32Eqz = "i32.eqz", Unary;
    I32Eq = "i32.eq", Binary;
    I32Ne = "i32.ne", Binary;
    I32LtS = "i32.lt_s", Binary;
    I32LtU = "i32.lt_u", Binary;
    I32LeS = "i32.le_s", Binary;
    I32LeU = "i32.le_u", Binary;
    I32GtS = "i32.gt_s", Binary;
    I32GtU = "i32.gt_u", Binary;
    I32GeS = "i32.ge_s", Binary;
    I32GeU = "i32.ge_u", Binary;

    I64Add = "i64.add", Binary;
    I64Sub = "i64.sub", Binary;
    I64Mul = "i64.mul", Binary;
    I64DivS = "i64.div_s", Binary;
    I64DivU = "i64.div_u", Binary;
    I64RemS = "i64.rem_s", Binary;
    I64RemU = "i64.rem_u", Binary;
    I64And = "i64.and", Binary;
    I64Or = "i64.or", Binary;
    I64Xor = "i64.xor", Binary;
    I64Shl = "i64.shl", Binary;
    I64ShrS = "i64.shr_s", Binary;
    I64ShrU = "i64.shr_u", Binary;
    I64Rotl = "i64.rotl", Binary;
    I64Rotr = "i64.rotr", Binary;
    I64Clz = "i64.clz", Unary;
    I64Ctz = "i64.ctz", Unary;
    I64Popcnt = "i64.popcnt", Unary;
    I64Eqz = "i64.eqz", Unary;
    I64Eq = "i64.eq", Binary;
    I64Ne = "i64.ne", Binary;
    I64LtS = "i64.lt_s", Binary;
    I64LtU = "i64.lt_u", Binary;
    I64LeS = "i64.le_s", Binary;
    I64LeU = "i64.le_u", Binary;
    I64GtS = "i64.gt_s", Binary;
    I64GtU = "i64.gt_u", Binary;
    I64GeS = "i64.ge_s", Binary;
    I64GeU = "i64.ge_u", Binary;

    F32Add = "f32.add", Binary;
    F32Sub = "f32.sub", Binary;
    F32Mul = "f32.mul", Binary;
    F32Div = "f32.div", Binary;
    F32Min = "f32.min", Binary;
    F32Max = "f32.max", Binary;
    F32Copysign = "f32.copysign", Binary;
    F32Abs = "f32.abs", Unary;
    F32Neg = "f32.neg", Unary;
    F32Sqrt = "f32.sqrt", Unary;
    F32Ceil = "f32.ceil", Unary;
    F32Floor = "f32.floor", Unary;
    F32Trunc = "f32.trunc", Unary;
    F32Nearest = "f32.nearest", Unary;
    F32Eq = "f32.eq", Binary;
    F32Ne = "f32.ne", Binary;
    F32Lt = "f32.lt", Binary;
    F32Le = "f32.le", Binary;
    F32Gt = "f32.gt", Binary;
    F32Ge = "f32.ge", Binary;

    F64Add = "f64.add", Binary;
    F64Sub = "f64.sub", Binary;
    F64Mul = "f64.mul", Binary;
    F64Div = "f64.div", Binary;
    F64Min = "f64.min", Binary;
    F64Max = "f64.max", Binary;
    F64Copysign = "f64.copysign", Binary;
    F64Abs = "f64.abs", Unary;
    F64Neg = "f64.neg", Unary;
    F64Sqrt = "f64.sqrt", Unary;
    F64Ceil = "f64.ceil", Unary;
    F64Floor = "f64.floor", Unary;
    F64Trunc = "f64.trunc", Unary;
    F64Nearest = "f64.nearest", Unary;
    F64Eq = "f64.eq", Binary;
    F64Ne = "f64.ne", Binary;
    F64Lt = "f64.lt", Binary;
    F64Le = "f64.le", Binary;
    F64Gt = "f64.gt", Binary;
    F64Ge = "f64.ge", Binary;

    I32WrapI64 = "i32.wrap_i64", Unary;
    I32TruncF32S = "i32.trunc_f32_s", Unary;
    I32TruncF32U = "i32.trunc_f32_u", Unary;
    I32TruncF64S = "i32.trunc_f64_s", Unary;
    I32TruncF64U = "i32.trunc_f64_u", Unary;
    I64ExtendI32S = "i64.extend_i32_s", Unary;
    I64ExtendI32U = "i64.extend_i32_u", Unary;
    I64TruncF32S = "i64.trunc_f32_s", Unary;
    I64TruncF32U = "i64.trunc_f32_u", Unary;
    I64TruncF64S = "i64.trunc_f64_s", Unary;
    I64TruncF64U = "i64.trunc_f64_u", Unary;
    F32ConvertI32S = "f32.convert_i32_s", Unary;
    F32ConvertI32U = "f32.convert_i32_u", Unary;
    F32ConvertI64S = "f32.convert_i64_s", Unary;
    F32ConvertI64U = "f32.convert_i64_u", Unary;
    F32DemoteF64 = "f32.demote_f64", Unary;
    F64ConvertI32S = "f64.convert_i32_s", Unary;
    F64ConvertI32U = "f64.convert_i32_u", Unary;
    F64ConvertI64S = "f64.convert_i64_s", Unary;
    F64ConvertI64U = "f64.convert_i64_u", Unary;
    F64PromoteF32 = "f64.promote_f32", Unary;
    I32ReinterpretF32 = "i32.reinterpret_f32", Unary;
    I64ReinterpretF64 = "i64.reinterpret_f64", Unary;
    F32ReinterpretI32 = "f32.reinterpret_i32", Unary;
    F64ReinterpretI64 = "f64.reinterpret_i64", Unary;

    I32Load = "i32.load", Load;
    I64Load = "i64.load", Load;
    F32Load = "f32.load", Load;
    F64Load = "f64.load", Load;
    I32Load8S = "i32.load8_s", Load;
    I32Load8U = "i32.load8_u", Load;
    I32Load16S = "i32.load16_s", Load;
    I32Load16U = "i32.load16_u", Load;
    I64Load8S = "i64.load8_s", Load;
    I64Load8U = "i64.load8_u", Load;
    I64Load16S = "i64.load16_s", Load;
    I64Load16U = "i64.load16_u", Load;
    I64Load32S = "i64.load32_s", Load;
    I64Load32U = "i64.load32_u", Load;
    I32Store = "i32.store", Store;
    I64Store = "i64.store", Store;
    F32Store = "f32.store", Store;
    F64Store = "f64.store", Store;
    I32Store8 = "i32.store8", Store;
    I32Store16 = "i32.store16", Store;
    I64Store8 = "i64.store8", Store;
    I64Store16 = "i64.store16", Store;
    I64Store32 = "i64.store32", Store;
    MemorySize = "memory.size", None;
    MemoryGrow = "memory.grow", Unary;

    LocalGet = "local.get", Index;
    LocalSet = "local.set", IndexReg;
    GlobalGet = "global.get", Index;
    GlobalSet = "global.set", IndexReg;

    Jmp = "jmp", Jmp;
    JmpIf = "jmp_if", JmpIf;
    JmpEither = "jmp_either", JmpEither;
    JmpTable = "jmp_table", JmpTable;
    ReturnValue = "return_value", Unary;
    ReturnVoid = "return_void", None;
    Call = "call", Call;
    CallIndirect = "call_indirect", CallIndirect;
    InvokeImport = "invoke_import", Import;
    Phi = "phi", None;
    AddGas = "add_gas", Gas;
}

/// Pre-standard operator spellings still produced by older disassemblers.
const ALIASES: &[(&str, &str)] = &[
    ("get_local", "local.get"),
    ("set_local", "local.set"),
    ("tee_local", "local.tee"),
    ("get_global", "global.get"),
    ("set_global", "global.set"),
    ("current_memory", "memory.size"),
    ("grow_memory", "memory.grow"),
    ("i32.wrap/i64", "i32.wrap_i64"),
    ("i64.extend_s/i32", "i64.extend_i32_s"),
    ("i64.extend_u/i32", "i64.extend_i32_u"),
    ("f64.promote/f32", "f64.promote_f32"),
    ("f32.demote/f64", "f32.demote_f64"),
];

/// Maps an alias to its canonical spelling; other names pass through.
pub fn canonical_name(name: &str) -> &str {
    ALIASES
        .iter()
        .find(|(alias, _)| *alias == name)
        .map(|(_, canon)| *canon)
        .unwrap_or(name)
}

fn name_table() -> &'static HashMap<&'static str, Opcode> {
    static TABLE: OnceLock<HashMap<&'static str, Opcode>> = OnceLock::new();
    TABLE.get_or_init(|| Opcode::ALL.iter().map(|op| (op.name(), *op)).collect())
}

impl Opcode {
    pub fn from_u8(byte: u8) -> Option<Opcode> {
        Opcode::ALL.get(byte as usize).copied()
    }

    pub fn from_name(name: &str) -> Option<Opcode> {
        name_table().get(canonical_name(name)).copied()
    }

    pub fn is_jump(self) -> bool {
        matches!(self, Opcode::Jmp | Opcode::JmpIf | Opcode::JmpEither | Opcode::JmpTable)
    }

    /// Instructions that end a basic block.
    pub fn is_terminator(self) -> bool {
        self.is_jump() || matches!(self, Opcode::ReturnValue | Opcode::ReturnVoid)
    }

    /// Operations that can raise a trap besides bytecode corruption.
    pub fn may_trap(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            Unreachable
                | I32DivS | I32DivU | I32RemS | I32RemU
                | I64DivS | I64DivU | I64RemS | I64RemU
                | I32TruncF32S | I32TruncF32U | I32TruncF64S | I32TruncF64U
                | I64TruncF32S | I64TruncF32U | I64TruncF64S | I64TruncF64U
        ) || matches!(self.shape(), Shape::Load | Shape::Store)
    }

    /// True when dropping an unused result cannot change observable behavior.
    pub fn is_pure(self) -> bool {
        if self.may_trap() || self.is_terminator() {
            return false;
        }
        match self.shape() {
            Shape::Const32 | Shape::Const64 | Shape::Unary | Shape::Binary | Shape::Select => {
                self != Opcode::MemoryGrow
            }
            Shape::Index => true,
            Shape::None => matches!(self, Opcode::Phi | Opcode::MemorySize | Opcode::Nop),
            _ => false,
        }
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discriminants_match_table_order() {
        for (i, op) in Opcode::ALL.iter().enumerate() {
            assert_eq!(*op as u8 as usize, i, "{op}");
            assert_eq!(Opcode::from_u8(i as u8), Some(*op));
        }
        assert!(Opcode::ALL.len() < 256);
        assert_eq!(Opcode::from_u8(255), None);
    }

    #[test]
    fn names_are_unique() {
        assert_eq!(name_table().len(), Opcode::ALL.len());
    }

    #[test]
    fn from_name_accepts_aliases() {
        assert_eq!(Opcode::from_name("get_local"), Some(Opcode::LocalGet));
        assert_eq!(Opcode::from_name("grow_memory"), Some(Opcode::MemoryGrow));
        assert_eq!(Opcode::from_name("i32.add"), Some(Opcode::I32Add));
        assert_eq!(Opcode::from_name("i32.frobnicate"), None);
        assert_eq!(canonical_name("tee_local"), "local.tee");
    }

    #[test]
    fn purity_classes() {
        assert!(Opcode::I32Add.is_pure());
        assert!(Opcode::LocalGet.is_pure());
        assert!(Opcode::Phi.is_pure());
        assert!(!Opcode::I32DivS.is_pure());
        assert!(!Opcode::I32Load.is_pure());
        assert!(!Opcode::Call.is_pure());
        assert!(!Opcode::MemoryGrow.is_pure());
        assert!(!Opcode::LocalSet.is_pure());
        assert!(!Opcode::GlobalSet.is_pure());
        assert!(!Opcode::JmpIf.is_pure());
    }

    #[test]
    fn terminators() {
        assert!(Opcode::JmpIf.is_terminator());
        assert!(Opcode::ReturnVoid.is_terminator());
        assert!(!Opcode::Call.is_terminator());
        assert!(!Opcode::Phi.is_terminator());
    }
}
