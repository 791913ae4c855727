use std::fmt;
use std::ops::{BitAnd, BitOr, BitXor, Not};

/// The abstract machine is written once and instantiated per cell width.
/// A cell is the machine word: every stack slot, heap slot, code unit and
/// virtual address is exactly one cell. Arithmetic and addressing are
/// unsigned; comparisons, shifts, multiplication and division reinterpret
/// the bits through [`Cell::Signed`].
pub trait Cell:
    Copy
    + Eq
    + Ord
    + fmt::Debug
    + fmt::Display
    + fmt::LowerHex
    + BitAnd<Output = Self>
    + BitOr<Output = Self>
    + BitXor<Output = Self>
    + Not<Output = Self>
    + 'static
{
    /// Two's-complement twin of the cell, same width.
    type Signed: Copy + Eq + Ord + fmt::Debug + fmt::Display;

    /// Width of a cell in bytes (2, 4 or 8).
    const BYTES: usize;
    /// Width of a cell in bits.
    const BITS: u32;

    const ZERO: Self;
    const ONE: Self;
    const MAX: Self;
    /// `BYTES` as a cell value; the stride of every stack and code access.
    const STEP: Self;
    /// `BYTES - 1` as a cell value; the misalignment bits of an address.
    const ALIGN_MASK: Self;

    fn from_usize(v: usize) -> Self;
    fn to_usize(self) -> usize;
    fn from_u32(v: u32) -> Self;
    fn to_u64(self) -> u64;
    /// Truncating two's-complement conversion; `from_i64(-1)` is all ones.
    fn from_i64(v: i64) -> Self;

    fn as_signed(self) -> Self::Signed;
    fn from_signed(v: Self::Signed) -> Self;

    /// Decode one cell from little-endian bytes. `bytes` must hold at least
    /// `BYTES` bytes.
    fn from_le_slice(bytes: &[u8]) -> Self;

    fn wrapping_add(self, rhs: Self) -> Self;
    fn wrapping_sub(self, rhs: Self) -> Self;
    fn wrapping_mul(self, rhs: Self) -> Self;
    fn wrapping_neg(self) -> Self;

    /// Logical shifts; the count is taken modulo the cell width.
    fn shl(self, count: u32) -> Self;
    fn shr(self, count: u32) -> Self;
    /// Arithmetic right shift, count modulo the cell width.
    fn ashr(self, count: u32) -> Self;

    /// Signed less-than on the raw bits.
    fn slt(self, rhs: Self) -> bool {
        self.as_signed() < rhs.as_signed()
    }

    /// Floored signed division: quotient rounds toward negative infinity and
    /// the remainder takes the sign of the divisor. The divisor must be
    /// nonzero.
    fn divmod_floored(self, divisor: Self) -> (Self, Self);

    /// The highest cell-aligned virtual address.
    fn highest_aligned() -> Self {
        Self::from_i64((Self::MAX.to_u64() / Self::BYTES as u64 * Self::BYTES as u64) as i64)
    }
}

macro_rules! impl_cell {
    ($unsigned:ty, $signed:ty) => {
        impl Cell for $unsigned {
            type Signed = $signed;

            const BYTES: usize = std::mem::size_of::<$unsigned>();
            const BITS: u32 = <$unsigned>::BITS;

            const ZERO: Self = 0;
            const ONE: Self = 1;
            const MAX: Self = <$unsigned>::MAX;
            const STEP: Self = std::mem::size_of::<$unsigned>() as $unsigned;
            const ALIGN_MASK: Self = std::mem::size_of::<$unsigned>() as $unsigned - 1;

            fn from_usize(v: usize) -> Self {
                v as $unsigned
            }

            fn to_usize(self) -> usize {
                self as usize
            }

            fn from_u32(v: u32) -> Self {
                v as $unsigned
            }

            fn to_u64(self) -> u64 {
                self as u64
            }

            fn from_i64(v: i64) -> Self {
                v as $unsigned
            }

            fn as_signed(self) -> $signed {
                self as $signed
            }

            fn from_signed(v: $signed) -> Self {
                v as $unsigned
            }

            fn from_le_slice(bytes: &[u8]) -> Self {
                let mut raw = [0u8; Self::BYTES];
                raw.copy_from_slice(&bytes[..Self::BYTES]);
                <$unsigned>::from_le_bytes(raw)
            }

            fn wrapping_add(self, rhs: Self) -> Self {
                <$unsigned>::wrapping_add(self, rhs)
            }

            fn wrapping_sub(self, rhs: Self) -> Self {
                <$unsigned>::wrapping_sub(self, rhs)
            }

            fn wrapping_mul(self, rhs: Self) -> Self {
                <$unsigned>::wrapping_mul(self, rhs)
            }

            fn wrapping_neg(self) -> Self {
                <$unsigned>::wrapping_neg(self)
            }

            fn shl(self, count: u32) -> Self {
                self.wrapping_shl(count)
            }

            fn shr(self, count: u32) -> Self {
                self.wrapping_shr(count)
            }

            fn ashr(self, count: u32) -> Self {
                (self as $signed).wrapping_shr(count) as $unsigned
            }

            fn divmod_floored(self, divisor: Self) -> (Self, Self) {
                let a = self as $signed;
                let b = divisor as $signed;
                let mut q = a.wrapping_div(b);
                let mut r = a.wrapping_rem(b);
                if r != 0 && ((r < 0) != (b < 0)) {
                    q = q.wrapping_sub(1);
                    r = r.wrapping_add(b);
                }
                (q as $unsigned, r as $unsigned)
            }
        }
    };
}

impl_cell!(u16, i16);
impl_cell!(u32, i32);
impl_cell!(u64, i64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_and_mask() {
        assert_eq!(<u16 as Cell>::STEP, 2);
        assert_eq!(<u32 as Cell>::STEP, 4);
        assert_eq!(<u64 as Cell>::STEP, 8);
        assert_eq!(<u32 as Cell>::ALIGN_MASK, 3);
        assert_eq!(<u64 as Cell>::ALIGN_MASK, 7);
    }

    #[test]
    fn truncating_conversions() {
        assert_eq!(<u32 as Cell>::from_i64(-1), u32::MAX);
        assert_eq!(<u16 as Cell>::from_i64(-2), 0xFFFE);
        assert_eq!(<u64 as Cell>::from_i64(-1), u64::MAX);
        assert_eq!(<u32 as Cell>::from_le_slice(&[0x78, 0x56, 0x34, 0x12]), 0x1234_5678);
        assert_eq!(<u16 as Cell>::from_le_slice(&[0xCD, 0xAB]), 0xABCD);
    }

    #[test]
    fn highest_aligned_address() {
        assert_eq!(<u32 as Cell>::highest_aligned(), 0xFFFF_FFFC);
        assert_eq!(<u16 as Cell>::highest_aligned(), 0xFFFE);
        assert_eq!(<u64 as Cell>::highest_aligned(), u64::MAX - 7);
    }

    #[test]
    fn floored_division_rounds_down() {
        // (dividend, divisor, quotient, remainder)
        let cases: &[(i64, i64, i64, i64)] = &[
            (7, 2, 3, 1),
            (-7, 2, -4, 1),
            (7, -2, -4, -1),
            (-7, -2, 3, -1),
            (6, 3, 2, 0),
            (-6, 3, -2, 0),
            (1, 4, 0, 1),
            (-1, 4, -1, 3),
        ];
        for &(a, b, q, r) in cases {
            let (got_q, got_r) =
                <u32 as Cell>::from_i64(a).divmod_floored(<u32 as Cell>::from_i64(b));
            assert_eq!(got_q, <u32 as Cell>::from_i64(q), "{} / {}", a, b);
            assert_eq!(got_r, <u32 as Cell>::from_i64(r), "{} % {}", a, b);
        }
    }

    #[test]
    fn floored_division_invariant() {
        // a == q*b + r, r has the divisor's sign, |r| < |b|
        for a in -8i64..=8 {
            for b in -8i64..=8 {
                if b == 0 {
                    continue;
                }
                let (q, r) = <u32 as Cell>::from_i64(a).divmod_floored(<u32 as Cell>::from_i64(b));
                let q = q.as_signed() as i64;
                let r = r.as_signed() as i64;
                assert_eq!(a, q * b + r, "{} / {}", a, b);
                assert!(r == 0 || (r < 0) == (b < 0), "{} / {} -> r {}", a, b, r);
                assert!(r.abs() < b.abs());
            }
        }
    }

    #[test]
    fn arithmetic_shift_keeps_sign() {
        assert_eq!(<u32 as Cell>::from_i64(-16).ashr(2), <u32 as Cell>::from_i64(-4));
        assert_eq!(16u32.ashr(2), 4);
        assert_eq!(<u16 as Cell>::from_i64(-2).ashr(1), <u16 as Cell>::from_i64(-1));
    }
}
