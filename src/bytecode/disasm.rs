use super::{Cursor, HEADER_LEN, Opcode, OutOfBounds, Shape};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error(transparent)]
    OutOfBounds(#[from] OutOfBounds),
    #[error("unknown opcode 0x{byte:02x} at offset {offset}")]
    UnknownOpcode { offset: usize, byte: u8 },
}

/// One instruction decoded back from serialized code.
///
/// `operands` holds the raw operand fields in wire order, widened to u64.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedInstr {
    pub offset: usize,
    pub target: u32,
    pub op: Opcode,
    pub operands: Vec<u64>,
}

impl DecodedInstr {
    /// Byte offsets this instruction may jump to.
    pub fn jump_targets(&self) -> Vec<u64> {
        let ops = &self.operands;
        match self.op.shape() {
            Shape::Jmp | Shape::JmpIf => ops.first().copied().into_iter().collect(),
            Shape::JmpEither => ops.iter().take(2).copied().collect(),
            Shape::JmpTable => {
                let n = ops.first().copied().unwrap_or(0) as usize;
                ops.iter().skip(1).take(n + 1).copied().collect()
            }
            _ => Vec::new(),
        }
    }
}

/// Decodes the instruction at the cursor's position.
pub fn decode_one(cur: &mut Cursor<'_>) -> Result<DecodedInstr, DecodeError> {
    let offset = cur.pos();
    let target = cur.read_u32()?;
    let byte = cur.read_u8()?;
    let op = Opcode::from_u8(byte).ok_or(DecodeError::UnknownOpcode { offset: offset + 4, byte })?;

    fn words(cur: &mut Cursor<'_>, out: &mut Vec<u64>, n: usize) -> Result<(), OutOfBounds> {
        for _ in 0..n {
            out.push(cur.read_u32()? as u64);
        }
        Ok(())
    }

    let mut operands = Vec::new();
    let ops = &mut operands;
    match op.shape() {
        Shape::None => {}
        Shape::Const32 | Shape::Unary | Shape::Index | Shape::Import => words(cur, ops, 1)?,
        Shape::Binary | Shape::IndexReg | Shape::Jmp => words(cur, ops, 2)?,
        Shape::Select | Shape::Load | Shape::JmpIf => words(cur, ops, 3)?,
        Shape::Store | Shape::JmpEither => words(cur, ops, 4)?,
        Shape::Const64 | Shape::Gas => ops.push(cur.read_u64()?),
        Shape::JmpTable => {
            let n = cur.read_u32()?;
            ops.push(n as u64);
            words(cur, ops, n as usize + 3)?;
        }
        Shape::Call | Shape::CallIndirect => {
            words(cur, ops, 1)?;
            let argc = cur.read_u32()?;
            ops.push(argc as u64);
            let extra = usize::from(op.shape() == Shape::CallIndirect);
            words(cur, ops, argc as usize + extra)?;
        }
    }
    debug_assert!(cur.pos() >= offset + HEADER_LEN);
    Ok(DecodedInstr { offset, target, op, operands })
}

/// Decodes a whole function body.
pub fn disassemble(code: &[u8]) -> Result<Vec<DecodedInstr>, DecodeError> {
    let mut cur = Cursor::new(code);
    let mut out = Vec::new();
    while !cur.is_at_end() {
        out.push(decode_one(&mut cur)?);
    }
    Ok(out)
}

impl std::fmt::Display for DecodedInstr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04x}  ", self.offset)?;
        if self.target != 0 {
            write!(f, "r{} = ", self.target)?;
        }
        write!(f, "{}", self.op)?;
        for v in &self.operands {
            write!(f, " {v}")?;
        }
        Ok(())
    }
}
