//! Pure operator semantics over 64-bit register slots.
//!
//! i32 values live sign-extended in their slot. f32 values are stored as
//! their bit pattern in the low 32 bits, f64 values as their full bit
//! pattern.

use crate::bytecode::Opcode;

use super::Trap;

// ── Slot conversions ────────────────────────────────────────────────

#[inline(always)]
pub(crate) fn from_i32(v: i32) -> i64 {
    v as i64
}

#[inline(always)]
fn f32v(v: i64) -> f32 {
    f32::from_bits(v as u32)
}

#[inline(always)]
fn from_f32(v: f32) -> i64 {
    v.to_bits() as i64
}

#[inline(always)]
fn f64v(v: i64) -> f64 {
    f64::from_bits(v as u64)
}

#[inline(always)]
fn from_f64(v: f64) -> i64 {
    v.to_bits() as i64
}

#[inline(always)]
fn flag(b: bool) -> i64 {
    b as i64
}

// NaN-propagating min/max that order -0 below +0.
macro_rules! float_min_max {
    ($min:ident, $max:ident, $t:ty) => {
        fn $min(a: $t, b: $t) -> $t {
            if a.is_nan() || b.is_nan() {
                <$t>::NAN
            } else if a == b {
                if a.is_sign_negative() { a } else { b }
            } else {
                a.min(b)
            }
        }

        fn $max(a: $t, b: $t) -> $t {
            if a.is_nan() || b.is_nan() {
                <$t>::NAN
            } else if a == b {
                if a.is_sign_positive() { a } else { b }
            } else {
                a.max(b)
            }
        }
    };
}

float_min_max!(min32, max32, f32);
float_min_max!(min64, max64, f64);

/// Truncates toward zero and checks the result fits `[min, max)`.
fn truncate(v: f64, min: f64, max: f64) -> Result<f64, Trap> {
    if v.is_nan() {
        return Err(Trap::InvalidConversion);
    }
    let t = v.trunc();
    if t < min || t >= max {
        return Err(Trap::IntegerOverflow);
    }
    Ok(t)
}

const I32_RANGE: (f64, f64) = (-2147483648.0, 2147483648.0);
const U32_RANGE: (f64, f64) = (0.0, 4294967296.0);
const I64_RANGE: (f64, f64) = (-9223372036854775808.0, 9223372036854775808.0);
const U64_RANGE: (f64, f64) = (0.0, 18446744073709551616.0);

// ── Binary operators ────────────────────────────────────────────────

/// `None` when `op` is not a two-register numeric operator.
pub(crate) fn binary(op: Opcode, a: i64, b: i64) -> Option<Result<i64, Trap>> {
    use Opcode::*;
    let (x, y) = (a as i32, b as i32);
    let (ux, uy) = (a as u32, b as u32);
    let (ua, ub) = (a as u64, b as u64);
    let (p, q) = (f32v(a), f32v(b));
    let (r, s) = (f64v(a), f64v(b));

    let v = match op {
        I32Add => from_i32(x.wrapping_add(y)),
        I32Sub => from_i32(x.wrapping_sub(y)),
        I32Mul => from_i32(x.wrapping_mul(y)),
        I32DivS => {
            if y == 0 {
                return Some(Err(Trap::DivisionByZero));
            }
            if x == i32::MIN && y == -1 {
                return Some(Err(Trap::IntegerOverflow));
            }
            from_i32(x / y)
        }
        I32DivU => match ux.checked_div(uy) {
            Some(v) => from_i32(v as i32),
            None => return Some(Err(Trap::DivisionByZero)),
        },
        I32RemS => {
            if y == 0 {
                return Some(Err(Trap::DivisionByZero));
            }
            from_i32(x.wrapping_rem(y))
        }
        I32RemU => match ux.checked_rem(uy) {
            Some(v) => from_i32(v as i32),
            None => return Some(Err(Trap::DivisionByZero)),
        },
        I32And => from_i32(x & y),
        I32Or => from_i32(x | y),
        I32Xor => from_i32(x ^ y),
        I32Shl => from_i32(x.wrapping_shl(uy)),
        I32ShrS => from_i32(x.wrapping_shr(uy)),
        I32ShrU => from_i32(ux.wrapping_shr(uy) as i32),
        I32Rotl => from_i32(ux.rotate_left(uy % 32) as i32),
        I32Rotr => from_i32(ux.rotate_right(uy % 32) as i32),
        I32Eq => flag(x == y),
        I32Ne => flag(x != y),
        I32LtS => flag(x < y),
        I32LtU => flag(ux < uy),
        I32LeS => flag(x <= y),
        I32LeU => flag(ux <= uy),
        I32GtS => flag(x > y),
        I32GtU => flag(ux > uy),
        I32GeS => flag(x >= y),
        I32GeU => flag(ux >= uy),

        I64Add => a.wrapping_add(b),
        I64Sub => a.wrapping_sub(b),
        I64Mul => a.wrapping_mul(b),
        I64DivS => {
            if b == 0 {
                return Some(Err(Trap::DivisionByZero));
            }
            if a == i64::MIN && b == -1 {
                return Some(Err(Trap::IntegerOverflow));
            }
            a / b
        }
        I64DivU => match ua.checked_div(ub) {
            Some(v) => v as i64,
            None => return Some(Err(Trap::DivisionByZero)),
        },
        I64RemS => {
            if b == 0 {
                return Some(Err(Trap::DivisionByZero));
            }
            a.wrapping_rem(b)
        }
        I64RemU => match ua.checked_rem(ub) {
            Some(v) => v as i64,
            None => return Some(Err(Trap::DivisionByZero)),
        },
        I64And => a & b,
        I64Or => a | b,
        I64Xor => a ^ b,
        I64Shl => a.wrapping_shl(ub as u32),
        I64ShrS => a.wrapping_shr(ub as u32),
        I64ShrU => ua.wrapping_shr(ub as u32) as i64,
        I64Rotl => ua.rotate_left((ub % 64) as u32) as i64,
        I64Rotr => ua.rotate_right((ub % 64) as u32) as i64,
        I64Eq => flag(a == b),
        I64Ne => flag(a != b),
        I64LtS => flag(a < b),
        I64LtU => flag(ua < ub),
        I64LeS => flag(a <= b),
        I64LeU => flag(ua <= ub),
        I64GtS => flag(a > b),
        I64GtU => flag(ua > ub),
        I64GeS => flag(a >= b),
        I64GeU => flag(ua >= ub),

        F32Add => from_f32(p + q),
        F32Sub => from_f32(p - q),
        F32Mul => from_f32(p * q),
        F32Div => from_f32(p / q),
        F32Min => from_f32(min32(p, q)),
        F32Max => from_f32(max32(p, q)),
        F32Copysign => from_f32(p.copysign(q)),
        F32Eq => flag(p == q),
        F32Ne => flag(p != q),
        F32Lt => flag(p < q),
        F32Le => flag(p <= q),
        F32Gt => flag(p > q),
        F32Ge => flag(p >= q),

        F64Add => from_f64(r + s),
        F64Sub => from_f64(r - s),
        F64Mul => from_f64(r * s),
        F64Div => from_f64(r / s),
        F64Min => from_f64(min64(r, s)),
        F64Max => from_f64(max64(r, s)),
        F64Copysign => from_f64(r.copysign(s)),
        F64Eq => flag(r == s),
        F64Ne => flag(r != s),
        F64Lt => flag(r < s),
        F64Le => flag(r <= s),
        F64Gt => flag(r > s),
        F64Ge => flag(r >= s),

        _ => return None,
    };
    Some(Ok(v))
}

// ── Unary operators ─────────────────────────────────────────────────

/// `None` when `op` is not a one-register numeric operator.
pub(crate) fn unary(op: Opcode, a: i64) -> Option<Result<i64, Trap>> {
    use Opcode::*;
    let x = a as i32;
    let ux = a as u32;
    let ua = a as u64;
    let p = f32v(a);
    let r = f64v(a);

    let trunc = |v: f64, range: (f64, f64)| truncate(v, range.0, range.1);
    let v = match op {
        I32Clz => from_i32(ux.leading_zeros() as i32),
        I32Ctz => from_i32(ux.trailing_zeros() as i32),
        I32Popcnt => from_i32(ux.count_ones() as i32),
        I32Eqz => flag(x == 0),
        I64Clz => ua.leading_zeros() as i64,
        I64Ctz => ua.trailing_zeros() as i64,
        I64Popcnt => ua.count_ones() as i64,
        I64Eqz => flag(a == 0),

        F32Abs => from_f32(p.abs()),
        F32Neg => from_f32(-p),
        F32Sqrt => from_f32(p.sqrt()),
        F32Ceil => from_f32(p.ceil()),
        F32Floor => from_f32(p.floor()),
        F32Trunc => from_f32(p.trunc()),
        F32Nearest => from_f32(p.round_ties_even()),
        F64Abs => from_f64(r.abs()),
        F64Neg => from_f64(-r),
        F64Sqrt => from_f64(r.sqrt()),
        F64Ceil => from_f64(r.ceil()),
        F64Floor => from_f64(r.floor()),
        F64Trunc => from_f64(r.trunc()),
        F64Nearest => from_f64(r.round_ties_even()),

        I32WrapI64 => from_i32(x),
        I32TruncF32S => match trunc(p as f64, I32_RANGE) {
            Ok(t) => from_i32(t as i32),
            Err(e) => return Some(Err(e)),
        },
        I32TruncF32U => match trunc(p as f64, U32_RANGE) {
            Ok(t) => from_i32(t as u32 as i32),
            Err(e) => return Some(Err(e)),
        },
        I32TruncF64S => match trunc(r, I32_RANGE) {
            Ok(t) => from_i32(t as i32),
            Err(e) => return Some(Err(e)),
        },
        I32TruncF64U => match trunc(r, U32_RANGE) {
            Ok(t) => from_i32(t as u32 as i32),
            Err(e) => return Some(Err(e)),
        },
        I64ExtendI32S => x as i64,
        I64ExtendI32U => ux as i64,
        I64TruncF32S => match trunc(p as f64, I64_RANGE) {
            Ok(t) => t as i64,
            Err(e) => return Some(Err(e)),
        },
        I64TruncF32U => match trunc(p as f64, U64_RANGE) {
            Ok(t) => t as u64 as i64,
            Err(e) => return Some(Err(e)),
        },
        I64TruncF64S => match trunc(r, I64_RANGE) {
            Ok(t) => t as i64,
            Err(e) => return Some(Err(e)),
        },
        I64TruncF64U => match trunc(r, U64_RANGE) {
            Ok(t) => t as u64 as i64,
            Err(e) => return Some(Err(e)),
        },
        F32ConvertI32S => from_f32(x as f32),
        F32ConvertI32U => from_f32(ux as f32),
        F32ConvertI64S => from_f32(a as f32),
        F32ConvertI64U => from_f32(ua as f32),
        F32DemoteF64 => from_f32(r as f32),
        F64ConvertI32S => from_f64(x as f64),
        F64ConvertI32U => from_f64(ux as f64),
        F64ConvertI64S => from_f64(a as f64),
        F64ConvertI64U => from_f64(ua as f64),
        F64PromoteF32 => from_f64(p as f64),
        I32ReinterpretF32 => from_i32(ux as i32),
        I64ReinterpretF64 => a,
        F32ReinterpretI32 => ux as i64,
        F64ReinterpretI64 => a,

        _ => return None,
    };
    Some(Ok(v))
}

// ── Linear memory ───────────────────────────────────────────────────

/// Bytes moved by a load or store.
pub(crate) fn access_width(op: Opcode) -> Option<u32> {
    use Opcode::*;
    Some(match op {
        I32Load8S | I32Load8U | I64Load8S | I64Load8U | I32Store8 | I64Store8 => 1,
        I32Load16S | I32Load16U | I64Load16S | I64Load16U | I32Store16 | I64Store16 => 2,
        I32Load | F32Load | I64Load32S | I64Load32U | I32Store | F32Store | I64Store32 => 4,
        I64Load | F64Load | I64Store | F64Store => 8,
        _ => return None,
    })
}

/// Byte range of an access at `base + offset`, where `base` is an i32
/// address.
fn effective(memory_len: usize, base: i64, offset: u32, width: u32) -> Result<std::ops::Range<usize>, Trap> {
    let address = (base as u32) as u64 + offset as u64;
    let end = address + width as u64;
    if end > memory_len as u64 {
        return Err(Trap::MemoryOutOfBounds { address, width });
    }
    Ok(address as usize..end as usize)
}

pub(crate) fn load(memory: &[u8], op: Opcode, base: i64, offset: u32) -> Result<i64, Trap> {
    use Opcode::*;
    let width = access_width(op).ok_or(Trap::BadIndex { kind: "load", index: op as u64 })?;
    let range = effective(memory.len(), base, offset, width)?;
    let mut buf = [0u8; 8];
    buf[..width as usize].copy_from_slice(&memory[range]);
    let raw = u64::from_le_bytes(buf);
    Ok(match op {
        I32Load | I64Load32S => raw as u32 as i32 as i64,
        I32Load8S | I64Load8S => raw as u8 as i8 as i64,
        I32Load16S | I64Load16S => raw as u16 as i16 as i64,
        _ => raw as i64,
    })
}

pub(crate) fn store(memory: &mut [u8], op: Opcode, base: i64, offset: u32, value: i64) -> Result<(), Trap> {
    let width = access_width(op).ok_or(Trap::BadIndex { kind: "store", index: op as u64 })?;
    let range = effective(memory.len(), base, offset, width)?;
    memory[range].copy_from_slice(&value.to_le_bytes()[..width as usize]);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use Opcode::*;

    fn bin(op: Opcode, a: i64, b: i64) -> Result<i64, Trap> {
        binary(op, a, b).unwrap()
    }

    fn un(op: Opcode, a: i64) -> Result<i64, Trap> {
        unary(op, a).unwrap()
    }

    #[test]
    fn i32_arithmetic_wraps_and_sign_extends() {
        assert_eq!(bin(I32Add, 3, 4), Ok(7));
        assert_eq!(bin(I32Add, i32::MAX as i64, 1), Ok(i32::MIN as i64));
        assert_eq!(bin(I32Sub, 0, 1), Ok(-1));
        assert_eq!(bin(I32ShrU, -1, 28), Ok(15));
        assert_eq!(bin(I32Shl, 1, 33), Ok(2));
        assert_eq!(bin(I32Rotl, 0x8000_0000u32 as i32 as i64, 1), Ok(1));
        assert_eq!(bin(I32LtU, -1, 1), Ok(0));
        assert_eq!(bin(I32LtS, -1, 1), Ok(1));
    }

    #[test]
    fn division_traps() {
        assert_eq!(bin(I32DivS, 7, 0), Err(Trap::DivisionByZero));
        assert_eq!(bin(I32DivU, 7, 0), Err(Trap::DivisionByZero));
        assert_eq!(bin(I32RemS, 7, 0), Err(Trap::DivisionByZero));
        assert_eq!(bin(I64RemU, 7, 0), Err(Trap::DivisionByZero));
        assert_eq!(bin(I32DivS, i32::MIN as i64, -1), Err(Trap::IntegerOverflow));
        assert_eq!(bin(I64DivS, i64::MIN, -1), Err(Trap::IntegerOverflow));
        assert_eq!(bin(I32RemS, i32::MIN as i64, -1), Ok(0));
        assert_eq!(bin(I32DivS, -7, 2), Ok(-3));
        assert_eq!(bin(I32DivU, -1, 2), Ok(i32::MAX as i64));
    }

    #[test]
    fn float_semantics() {
        let f = |v: f64| from_f64(v);
        assert_eq!(bin(F64Add, f(1.5), f(2.25)), Ok(f(3.75)));
        assert!(f64v(bin(F64Min, f(1.0), f(f64::NAN)).unwrap()).is_nan());
        assert!(f64v(bin(F64Min, f(0.0), f(-0.0)).unwrap()).is_sign_negative());
        assert!(f64v(bin(F64Max, f(-0.0), f(0.0)).unwrap()).is_sign_positive());
        assert_eq!(un(F64Nearest, f(2.5)), Ok(f(2.0)));
        assert_eq!(un(F64Nearest, f(3.5)), Ok(f(4.0)));
        assert_eq!(bin(F32Lt, from_f32(1.0), from_f32(2.0)), Ok(1));
        assert_eq!(bin(F32Eq, from_f32(f32::NAN), from_f32(f32::NAN)), Ok(0));
    }

    #[test]
    fn truncation_checks_range() {
        assert_eq!(un(I32TruncF64S, from_f64(-3.9)), Ok(-3));
        assert_eq!(un(I32TruncF64U, from_f64(-0.5)), Ok(0));
        assert_eq!(un(I32TruncF64S, from_f64(f64::NAN)), Err(Trap::InvalidConversion));
        assert_eq!(un(I32TruncF64S, from_f64(2147483648.0)), Err(Trap::IntegerOverflow));
        assert_eq!(un(I32TruncF64S, from_f64(-2147483648.0)), Ok(i32::MIN as i64));
        assert_eq!(un(I64TruncF32U, from_f32(-1.0)), Err(Trap::IntegerOverflow));
        assert_eq!(un(I32TruncF32U, from_f32(4294967040.0)), Ok(-256));
    }

    #[test]
    fn conversions_and_reinterprets() {
        assert_eq!(un(I64ExtendI32U, -1), Ok(0xffff_ffff));
        assert_eq!(un(I64ExtendI32S, -1), Ok(-1));
        assert_eq!(un(I32WrapI64, 0x1_0000_0005), Ok(5));
        assert_eq!(un(F32ReinterpretI32, -1), Ok(0xffff_ffff));
        assert_eq!(un(I32ReinterpretF32, from_f32(-0.0)), Ok(i32::MIN as i64));
        assert_eq!(un(F64ConvertI32U, -1), Ok(from_f64(4294967295.0)));
        assert_eq!(un(I32Eqz, 0), Ok(1));
        assert_eq!(un(I64Popcnt, -1), Ok(64));
    }

    #[test]
    fn non_numeric_ops_are_rejected() {
        assert!(binary(LocalGet, 0, 0).is_none());
        assert!(unary(ReturnValue, 0).is_none());
    }

    #[test]
    fn memory_access_is_bounds_checked() {
        let mut mem = vec![0u8; 16];
        store(&mut mem, I32Store, 0, 12, -2).unwrap();
        assert_eq!(load(&mem, I32Load, 12, 0), Ok(-2));
        assert_eq!(load(&mem, I32Load8U, 12, 0), Ok(0xfe));
        assert_eq!(load(&mem, I32Load8S, 12, 0), Ok(-2));
        assert_eq!(load(&mem, I64Load32U, 4, 8), Ok(0xffff_fffe));
        assert_eq!(load(&mem, I32Load, 13, 0), Err(Trap::MemoryOutOfBounds { address: 13, width: 4 }));
        // the base is an unsigned i32 address
        assert_eq!(
            store(&mut mem, I64Store, -1, 0, 0),
            Err(Trap::MemoryOutOfBounds { address: 0xffff_ffff, width: 8 })
        );
    }
}
