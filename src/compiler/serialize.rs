//! Encodes a flat instruction list into bytecode.
//!
//! Jump targets are written as instruction indices on the first pass and
//! patched to byte offsets once every instruction has a position.

use crate::bytecode::Shape;

use super::{CompileError, Instr};

struct Writer {
    buf: Vec<u8>,
    /// (byte position of the field, target instruction index)
    relocs: Vec<(usize, i64)>,
}

impl Writer {
    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn reloc(&mut self, target: i64) {
        self.relocs.push((self.buf.len(), target));
        self.u32(0);
    }
}

fn field<T: Copy>(ins: &Instr, items: &[T], n: usize) -> Result<T, CompileError> {
    items.get(n).copied().ok_or_else(|| CompileError::MissingImmediate {
        op: ins.op.name().to_string(),
        expected: n + 1,
        found: items.len(),
    })
}

pub fn serialize(code: &[Instr]) -> Result<Vec<u8>, CompileError> {
    let mut w = Writer { buf: Vec::with_capacity(code.len() * 12), relocs: Vec::new() };
    let mut offsets = Vec::with_capacity(code.len());

    for ins in code {
        offsets.push(w.buf.len());
        w.u32(ins.target);
        w.u8(ins.op as u8);

        let imm = |n| field(ins, &ins.immediates, n);
        let reg = |n| field(ins, &ins.operands, n);
        match ins.op.shape() {
            Shape::None => {}
            Shape::Const32 => w.u32(imm(0)? as u32),
            Shape::Const64 | Shape::Gas => w.u64(imm(0)? as u64),
            Shape::Unary => w.u32(reg(0)?),
            Shape::Binary => {
                w.u32(reg(0)?);
                w.u32(reg(1)?);
            }
            Shape::Select => {
                for n in 0..3 {
                    w.u32(reg(n)?);
                }
            }
            Shape::Load | Shape::Store => {
                w.u32(imm(0)? as u32);
                w.u32(imm(1)? as u32);
                w.u32(reg(0)?);
                if ins.op.shape() == Shape::Store {
                    w.u32(reg(1)?);
                }
            }
            Shape::Index | Shape::Import => w.u32(imm(0)? as u32),
            Shape::IndexReg => {
                w.u32(imm(0)? as u32);
                w.u32(reg(0)?);
            }
            Shape::Jmp => {
                w.reloc(imm(0)?);
                w.u32(reg(0)?);
            }
            Shape::JmpIf => {
                w.reloc(imm(0)?);
                w.u32(reg(0)?);
                w.u32(reg(1)?);
            }
            Shape::JmpEither => {
                w.reloc(imm(0)?);
                w.reloc(imm(1)?);
                w.u32(reg(0)?);
                w.u32(reg(1)?);
            }
            Shape::JmpTable => {
                let count = ins.immediates.len().checked_sub(1).ok_or(CompileError::MissingImmediate {
                    op: ins.op.name().to_string(),
                    expected: 1,
                    found: 0,
                })?;
                w.u32(count as u32);
                for t in &ins.immediates {
                    w.reloc(*t);
                }
                w.u32(reg(0)?);
                w.u32(reg(1)?);
            }
            Shape::Call => {
                w.u32(imm(0)? as u32);
                w.u32(ins.operands.len() as u32);
                for v in &ins.operands {
                    w.u32(*v);
                }
            }
            Shape::CallIndirect => {
                w.u32(imm(0)? as u32);
                let Some((table_index, args)) = ins.operands.split_last() else {
                    return Err(CompileError::MissingImmediate {
                        op: ins.op.name().to_string(),
                        expected: 1,
                        found: 0,
                    });
                };
                w.u32(args.len() as u32);
                for v in args {
                    w.u32(*v);
                }
                w.u32(*table_index);
            }
        }
    }

    for (pos, target) in &w.relocs {
        let offset = usize::try_from(*target)
            .ok()
            .and_then(|t| offsets.get(t))
            .ok_or(CompileError::InvalidJumpTarget { target: *target, len: code.len() })?;
        w.buf[*pos..*pos + 4].copy_from_slice(&(*offset as u32).to_le_bytes());
    }
    Ok(w.buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{HEADER_LEN, Opcode, disassemble};

    fn ins(target: u32, op: Opcode, imm: &[i64], operands: &[u32]) -> Instr {
        Instr::new(target, op, imm.to_vec(), operands.to_vec())
    }

    #[test]
    fn header_layout_is_little_endian() {
        let bytes = serialize(&[ins(0x0102_0304, Opcode::I32Add, &[], &[5, 6])]).unwrap();
        assert_eq!(&bytes[..HEADER_LEN], &[4, 3, 2, 1, Opcode::I32Add as u8]);
        assert_eq!(&bytes[HEADER_LEN..], &[5, 0, 0, 0, 6, 0, 0, 0]);
    }

    #[test]
    fn forward_jump_is_relocated_to_a_byte_offset() {
        let code = vec![
            ins(0, Opcode::Jmp, &[2], &[0]),
            ins(1, Opcode::I64Const, &[-1], &[]),
            ins(0, Opcode::ReturnVoid, &[], &[]),
        ];
        let bytes = serialize(&code).unwrap();
        let listing = disassemble(&bytes).unwrap();
        // jmp is 13 bytes, i64.const 13 bytes
        assert_eq!(listing[2].offset, 26);
        assert_eq!(listing[0].operands, vec![26, 0]);
        assert_eq!(listing[1].operands, vec![u64::MAX]);
    }

    #[test]
    fn table_count_excludes_default() {
        let code = vec![
            ins(0, Opcode::JmpTable, &[1, 1, 1], &[7, 0]),
            ins(0, Opcode::ReturnVoid, &[], &[]),
        ];
        let bytes = serialize(&code).unwrap();
        let listing = disassemble(&bytes).unwrap();
        let ret = listing[1].offset as u64;
        assert_eq!(listing[0].operands, vec![2, ret, ret, ret, 7, 0]);
    }

    #[test]
    fn call_indirect_puts_table_index_last() {
        let bytes = serialize(&[ins(3, Opcode::CallIndirect, &[0], &[1, 2, 9])]).unwrap();
        let listing = disassemble(&bytes).unwrap();
        assert_eq!(listing[0].operands, vec![0, 2, 1, 2, 9]);
    }

    #[test]
    fn serialization_is_deterministic() {
        let code = vec![
            ins(1, Opcode::LocalGet, &[0], &[]),
            ins(0, Opcode::JmpEither, &[2, 3], &[1, 0]),
            ins(0, Opcode::ReturnValue, &[], &[1]),
            ins(0, Opcode::ReturnVoid, &[], &[]),
        ];
        assert_eq!(serialize(&code).unwrap(), serialize(&code).unwrap());
    }

    #[test]
    fn dangling_target_is_rejected() {
        let err = serialize(&[ins(0, Opcode::Jmp, &[4], &[0])]).unwrap_err();
        assert_eq!(err, CompileError::InvalidJumpTarget { target: 4, len: 1 });
    }

    #[test]
    fn missing_operand_is_rejected() {
        let err = serialize(&[ins(1, Opcode::I32Add, &[], &[1])]).unwrap_err();
        assert!(matches!(err, CompileError::MissingImmediate { .. }));
    }
}
