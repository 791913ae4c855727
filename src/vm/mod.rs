//! The abstract machine itself: register file, stack discipline and the
//! instruction dispatch loop.
//!
//! The machine owns no buffers; code and data live in whatever the
//! [`MemoryManager`] maps, and the machine addresses them relative to the
//! `COD`/`DAT` bases handed out at [`Amx::install`] time. Every fault is a
//! returned [`AmxError`]; the run loop stops on the first one.

pub mod opcode;

mod error;

pub use error::AmxError;

use crate::definitions::Cell;
use crate::memory::{Backing, MemoryManager};
use opcode::Opcode;

/// Reserved callback index: fired before every instruction.
pub fn cbid_single_step<C: Cell>() -> C {
    C::MAX
}

/// Reserved callback index: fired by the BREAK instruction.
pub fn cbid_break<C: Cell>() -> C {
    C::MAX.wrapping_sub(C::ONE)
}

/// Receiver for every SYSREQ, BREAK and single-step event.
///
/// `stk` is the stack pointer at the moment of the event; `pri` is lent out
/// and written back to the PRI register afterwards. ALT, FRM, CIP, STP and
/// STK are snapshotted before the call and restored after it, so a callback
/// cannot disturb them (it may still write machine memory, or run a nested
/// [`Amx::call`]).
pub trait AmxCallback<C: Cell, M: MemoryManager<C>> {
    fn callback(
        &mut self,
        amx: &mut Amx<C, M>,
        index: C,
        stk: C,
        pri: &mut C,
    ) -> Result<(), AmxError>;
}

struct Installed {
    code_len: usize,
    data_len: usize,
}

/// One PAWN abstract machine instance.
pub struct Amx<C: Cell, M: MemoryManager<C>> {
    /// Address spaces; public so host callbacks can map scratch buffers into
    /// the data space while the machine runs.
    pub mem: M,
    pri: C,
    alt: C,
    frm: C,
    cip: C,
    stp: C,
    stk: C,
    hea: C,
    cod: C,
    dat: C,
    installed: Option<Installed>,
}

impl<C: Cell, M: MemoryManager<C>> Amx<C, M> {
    pub fn new(mem: M) -> Self {
        Self {
            mem,
            pri: C::ZERO,
            alt: C::ZERO,
            frm: C::ZERO,
            cip: C::ZERO,
            stp: C::ZERO,
            stk: C::ZERO,
            hea: C::ZERO,
            cod: C::ZERO,
            dat: C::ZERO,
            installed: None,
        }
    }

    pub fn pri(&self) -> C {
        self.pri
    }

    pub fn alt(&self) -> C {
        self.alt
    }

    pub fn frm(&self) -> C {
        self.frm
    }

    pub fn cip(&self) -> C {
        self.cip
    }

    pub fn stp(&self) -> C {
        self.stp
    }

    pub fn stk(&self) -> C {
        self.stk
    }

    pub fn hea(&self) -> C {
        self.hea
    }

    pub fn cod(&self) -> C {
        self.cod
    }

    pub fn dat(&self) -> C {
        self.dat
    }

    /// Map a code and a data image and seed the segment registers: STP and
    /// STK at the last data cell, HEA at `heap_offset` cells. A previously
    /// installed pair is unmapped first, so re-installing the same images
    /// lands on the same bases.
    pub fn install(
        &mut self,
        code: Vec<C>,
        data: Vec<C>,
        heap_offset: usize,
    ) -> Result<(), AmxError> {
        if data.is_empty() {
            return Err(AmxError::AccessViolation);
        }
        if let Some(prev) = self.installed.take() {
            let _ = self.mem.code().unmap(self.cod, prev.code_len);
            let _ = self.mem.data().unmap(self.dat, prev.data_len);
        }
        let code_len = code.len();
        let data_len = data.len();
        self.cod = self
            .mem
            .code()
            .map(code)
            .ok_or(AmxError::AccessViolationCode)?;
        self.dat = self.mem.data().map(data).ok_or(AmxError::AccessViolation)?;
        self.stp = C::from_usize((data_len - 1) * C::BYTES);
        self.stk = self.stp;
        self.hea = C::from_usize(heap_offset * C::BYTES);
        self.installed = Some(Installed { code_len, data_len });
        Ok(())
    }

    /// Resolve a data-segment virtual address.
    pub fn data_v2p(&mut self, va: C) -> Option<&mut C> {
        let addr = self.dat.wrapping_add(va);
        self.mem.data().translate(addr)
    }

    /// Resolve a code-segment virtual address.
    pub fn code_v2p(&mut self, va: C) -> Option<&mut C> {
        let addr = self.cod.wrapping_add(va);
        self.mem.code().translate(addr)
    }

    pub fn push(&mut self, v: C) -> Result<(), AmxError> {
        self.stk = self.stk.wrapping_sub(C::STEP);
        let stk = self.stk;
        *self.data_v2p(stk).ok_or(AmxError::AccessViolation)? = v;
        Ok(())
    }

    pub fn pop(&mut self) -> Result<C, AmxError> {
        let stk = self.stk;
        let v = *self.data_v2p(stk).ok_or(AmxError::AccessViolation)?;
        self.stk = self.stk.wrapping_add(C::STEP);
        Ok(v)
    }

    /// Run the routine at `target` until it returns to the sentinel frame.
    ///
    /// Arguments are pushed in the order given, followed by their total byte
    /// size; the routine's RETN discards them again. The returned cell is
    /// PRI at the moment of return. On error (including [`AmxError::Halt`])
    /// the registers stay as the fault left them and remain observable
    /// through the accessors.
    pub fn call<CB>(&mut self, target: C, args: &[C], cb: &mut CB) -> Result<C, AmxError>
    where
        CB: AmxCallback<C, M> + ?Sized,
    {
        let mut size = C::ZERO;
        for &arg in args {
            self.push(arg)?;
            size = size.wrapping_add(C::STEP);
        }
        self.push(size)?;
        self.run(target, cb)
    }

    /// The compiler plants a HALT at code address 0; pushing 0 as the return
    /// address makes the outermost RETN land on it, and the loop below stops
    /// as soon as CIP reaches that sentinel.
    fn run<CB>(&mut self, target: C, cb: &mut CB) -> Result<C, AmxError>
    where
        CB: AmxCallback<C, M> + ?Sized,
    {
        self.push(C::ZERO)?;
        self.cip = target;
        while self.cip != C::ZERO {
            self.fire_callback(cb, cbid_single_step())?;
            self.step(cb)?;
        }
        Ok(self.pri)
    }

    fn fire_callback<CB>(&mut self, cb: &mut CB, index: C) -> Result<(), AmxError>
    where
        CB: AmxCallback<C, M> + ?Sized,
    {
        let (alt, frm, cip, stp, stk) = (self.alt, self.frm, self.cip, self.stp, self.stk);
        let mut pri = self.pri;
        let result = cb.callback(self, index, stk, &mut pri);
        self.alt = alt;
        self.frm = frm;
        self.cip = cip;
        self.stp = stp;
        self.stk = stk;
        self.pri = pri;
        result
    }

    /// Fetch the code cell at CIP and advance.
    #[inline]
    fn fetch(&mut self) -> Result<C, AmxError> {
        let at = self.cip;
        self.cip = at.wrapping_add(C::STEP);
        self.code_v2p(at)
            .map(|c| *c)
            .ok_or(AmxError::AccessViolationCode)
    }

    #[inline]
    fn data_read(&mut self, va: C) -> Result<C, AmxError> {
        self.data_v2p(va).map(|c| *c).ok_or(AmxError::AccessViolation)
    }

    #[inline]
    fn data_write(&mut self, va: C, v: C) -> Result<(), AmxError> {
        *self.data_v2p(va).ok_or(AmxError::AccessViolation)? = v;
        Ok(())
    }

    /// Read a switch-table cell and advance the table cursor. The table
    /// lives in the code segment but faults as a data access.
    #[inline]
    fn table_next(&mut self, cursor: &mut C) -> Result<C, AmxError> {
        let at = *cursor;
        *cursor = at.wrapping_add(C::STEP);
        self.code_v2p(at)
            .map(|c| *c)
            .ok_or(AmxError::AccessViolation)
    }

    /// Apply a self-relative displacement: the operand is measured from the
    /// opcode's own address, and CIP is two cells past it by now.
    #[inline]
    fn jump_rel(&mut self, operand: C) {
        let two = C::STEP.wrapping_add(C::STEP);
        self.cip = self.cip.wrapping_sub(two).wrapping_add(operand);
    }

    /// Width mask and bit position for a sub-cell access of `width` bytes at
    /// `addr`; fails unless the bytes lie inside one cell.
    fn subcell(addr: C, width: u64) -> Result<(C, C, u32), AmxError> {
        if width != 1 && width != 2 && width != 4 {
            return Err(AmxError::InvalidOperand);
        }
        let base = addr & !C::ALIGN_MASK;
        let end = addr.wrapping_add(C::from_i64(width as i64 - 1));
        if end & !C::ALIGN_MASK != base {
            return Err(AmxError::InvalidOperand);
        }
        let shift = ((addr & C::ALIGN_MASK).to_u64() * 8) as u32;
        let mask = if width as u32 * 8 >= C::BITS {
            C::MAX
        } else {
            C::from_i64(((1u64 << (width * 8)) - 1) as i64)
        };
        Ok((base, mask, shift))
    }

    fn step<CB>(&mut self, cb: &mut CB) -> Result<(), AmxError>
    where
        CB: AmxCallback<C, M> + ?Sized,
    {
        let raw = self.fetch()?;
        let op = Opcode::from_cell(raw).ok_or(AmxError::InvalidInstruction)?;

        match op {
            Opcode::Nop => {}

            Opcode::LoadPri => {
                let at = self.fetch()?;
                self.pri = self.data_read(at)?;
            }
            Opcode::LoadAlt => {
                let at = self.fetch()?;
                self.alt = self.data_read(at)?;
            }
            Opcode::LoadSPri => {
                let at = self.frm.wrapping_add(self.fetch()?);
                self.pri = self.data_read(at)?;
            }
            Opcode::LoadSAlt => {
                let at = self.frm.wrapping_add(self.fetch()?);
                self.alt = self.data_read(at)?;
            }
            Opcode::LrefSPri => {
                let at = self.frm.wrapping_add(self.fetch()?);
                let indirect = self.data_read(at)?;
                self.pri = self.data_read(indirect)?;
            }
            Opcode::LrefSAlt => {
                let at = self.frm.wrapping_add(self.fetch()?);
                let indirect = self.data_read(at)?;
                self.alt = self.data_read(indirect)?;
            }
            Opcode::LoadI => {
                let at = self.pri;
                self.pri = self.data_read(at)?;
            }
            Opcode::LodbI => {
                let width = self.fetch()?.to_u64();
                let (base, mask, shift) = Self::subcell(self.pri, width)?;
                let cell = self.data_read(base)?;
                self.pri = cell.shr(shift) & mask;
            }

            Opcode::ConstPri => {
                self.pri = self.fetch()?;
            }
            Opcode::ConstAlt => {
                self.alt = self.fetch()?;
            }
            Opcode::AddrPri => {
                self.pri = self.frm.wrapping_add(self.fetch()?);
            }
            Opcode::AddrAlt => {
                self.alt = self.frm.wrapping_add(self.fetch()?);
            }

            Opcode::Stor => {
                let at = self.fetch()?;
                self.data_write(at, self.pri)?;
            }
            Opcode::StorS => {
                let at = self.frm.wrapping_add(self.fetch()?);
                self.data_write(at, self.pri)?;
            }
            Opcode::SrefS => {
                let at = self.frm.wrapping_add(self.fetch()?);
                let indirect = self.data_read(at)?;
                self.data_write(indirect, self.pri)?;
            }
            Opcode::StorI => {
                self.data_write(self.alt, self.pri)?;
            }
            Opcode::StrbI => {
                let width = self.fetch()?.to_u64();
                let (base, mask, shift) = Self::subcell(self.alt, width)?;
                let old = self.data_read(base)?;
                let merged = (old & !(mask.shl(shift))) | (self.pri & mask).shl(shift);
                self.data_write(base, merged)?;
            }

            Opcode::AlignPri => {
                // byte-reverse adjustment for cross-endian packed access
                let operand = self.fetch()?;
                if operand.to_u64() < C::BYTES as u64 {
                    self.pri = self.pri ^ C::STEP.wrapping_sub(operand);
                }
            }

            Opcode::Lctrl => {
                let reg = self.fetch()?.to_u64();
                self.pri = match reg {
                    0 => self.cod,
                    1 => self.dat,
                    2 => self.hea,
                    3 => self.stp,
                    4 => self.stk,
                    5 => self.frm,
                    6 => self.cip,
                    _ => return Err(AmxError::InvalidOperand),
                };
            }
            Opcode::Sctrl => {
                let reg = self.fetch()?.to_u64();
                match reg {
                    2 => self.hea = self.pri,
                    4 => self.stk = self.pri,
                    5 => self.frm = self.pri,
                    6 => self.cip = self.pri,
                    _ => return Err(AmxError::InvalidOperand),
                }
            }

            Opcode::Xchg => {
                std::mem::swap(&mut self.pri, &mut self.alt);
            }

            Opcode::PushPri => self.push(self.pri)?,
            Opcode::PushAlt => self.push(self.alt)?,
            Opcode::PushrPri => self.push(self.pri)?,
            Opcode::PopPri => self.pri = self.pop()?,
            Opcode::PopAlt => self.alt = self.pop()?,

            Opcode::Pick => {
                let at = self.stk.wrapping_add(self.fetch()?);
                self.pri = self.data_read(at)?;
            }
            Opcode::Stack => {
                let operand = self.fetch()?;
                self.stk = self.stk.wrapping_add(operand);
                self.alt = self.stk;
            }
            Opcode::Heap => {
                let operand = self.fetch()?;
                self.alt = self.hea;
                self.hea = self.hea.wrapping_add(operand);
            }

            Opcode::Proc => {
                self.push(self.frm)?;
                self.frm = self.stk;
            }
            Opcode::Ret => {
                self.frm = self.pop()?;
                self.cip = self.pop()?;
            }
            Opcode::Retn => {
                self.frm = self.pop()?;
                self.cip = self.pop()?;
                let arg_bytes = self.data_read(self.stk)?;
                self.stk = self.stk.wrapping_add(arg_bytes).wrapping_add(C::STEP);
            }
            Opcode::Call => {
                let operand = self.fetch()?;
                self.push(self.cip)?;
                self.jump_rel(operand);
            }

            Opcode::Jump => {
                let operand = self.fetch()?;
                self.jump_rel(operand);
            }
            Opcode::Jzer => {
                let operand = self.fetch()?;
                if self.pri == C::ZERO {
                    self.jump_rel(operand);
                }
            }
            Opcode::Jnz => {
                let operand = self.fetch()?;
                if self.pri != C::ZERO {
                    self.jump_rel(operand);
                }
            }

            Opcode::Shl => self.pri = self.pri.shl(self.alt.to_u64() as u32),
            Opcode::Shr => self.pri = self.pri.shr(self.alt.to_u64() as u32),
            Opcode::Sshr => self.pri = self.pri.ashr(self.alt.to_u64() as u32),
            Opcode::ShlCPri => {
                let operand = self.fetch()?;
                self.pri = self.pri.shl(operand.to_u64() as u32);
            }
            Opcode::ShlCAlt => {
                let operand = self.fetch()?;
                self.alt = self.alt.shl(operand.to_u64() as u32);
            }

            Opcode::Smul => self.pri = self.pri.wrapping_mul(self.alt),
            Opcode::Sdiv => {
                if self.pri == C::ZERO {
                    return Err(AmxError::DivisionWithZero);
                }
                let (quotient, remainder) = self.alt.divmod_floored(self.pri);
                self.pri = quotient;
                self.alt = remainder;
            }

            Opcode::Add => self.pri = self.pri.wrapping_add(self.alt),
            Opcode::Sub => self.pri = self.alt.wrapping_sub(self.pri),
            Opcode::And => self.pri = self.pri & self.alt,
            Opcode::Or => self.pri = self.pri | self.alt,
            Opcode::Xor => self.pri = self.pri ^ self.alt,
            Opcode::Not => {
                self.pri = if self.pri == C::ZERO { C::ONE } else { C::ZERO };
            }
            Opcode::Neg => self.pri = self.pri.wrapping_neg(),
            Opcode::Invert => self.pri = !self.pri,

            Opcode::Eq => self.pri = Self::flag(self.pri == self.alt),
            Opcode::Neq => self.pri = Self::flag(self.pri != self.alt),
            Opcode::Sless => self.pri = Self::flag(self.pri.slt(self.alt)),
            Opcode::Sleq => self.pri = Self::flag(!self.alt.slt(self.pri)),
            Opcode::Sgrtr => self.pri = Self::flag(self.alt.slt(self.pri)),
            Opcode::Sgeq => self.pri = Self::flag(!self.pri.slt(self.alt)),

            Opcode::IncPri => self.pri = self.pri.wrapping_add(C::ONE),
            Opcode::IncAlt => self.alt = self.alt.wrapping_add(C::ONE),
            Opcode::IncI => {
                let at = self.pri;
                let v = self.data_read(at)?;
                self.data_write(at, v.wrapping_add(C::ONE))?;
            }
            Opcode::DecPri => self.pri = self.pri.wrapping_sub(C::ONE),
            Opcode::DecAlt => self.alt = self.alt.wrapping_sub(C::ONE),
            Opcode::DecI => {
                let at = self.pri;
                let v = self.data_read(at)?;
                self.data_write(at, v.wrapping_sub(C::ONE))?;
            }

            Opcode::Movs => {
                let bytes = self.fetch()?.to_u64();
                let (src, dst) = (self.pri, self.alt);
                let mut off = 0u64;
                while off < bytes {
                    let delta = C::from_i64(off as i64);
                    let v = self.data_read(src.wrapping_add(delta))?;
                    self.data_write(dst.wrapping_add(delta), v)?;
                    off += C::BYTES as u64;
                }
            }
            Opcode::Cmps => {
                let bytes = self.fetch()?.to_u64();
                let (left, right) = (self.pri, self.alt);
                self.pri = C::ZERO;
                let mut off = 0u64;
                while self.pri == C::ZERO && off < bytes {
                    let delta = C::from_i64(off as i64);
                    let a = self.data_read(left.wrapping_add(delta))?;
                    let b = self.data_read(right.wrapping_add(delta))?;
                    self.pri = b.wrapping_sub(a);
                    off += C::BYTES as u64;
                }
            }
            Opcode::Fill => {
                let bytes = self.fetch()?.to_u64();
                let dst = self.alt;
                let mut off = 0u64;
                while off < bytes {
                    let delta = C::from_i64(off as i64);
                    self.data_write(dst.wrapping_add(delta), self.pri)?;
                    off += C::BYTES as u64;
                }
            }

            Opcode::Halt => {
                self.pri = self.fetch()?;
                return Err(AmxError::Halt);
            }
            Opcode::Bounds => {
                let operand = self.fetch()?;
                if self.pri > operand {
                    return Err(AmxError::Bounds);
                }
            }
            Opcode::Sysreq => {
                let index = self.fetch()?;
                self.fire_callback(cb, index)?;
            }

            Opcode::Switch => {
                let operand = self.fetch()?;
                let two = C::STEP.wrapping_add(C::STEP);
                let mut cursor = self.cip.wrapping_sub(two).wrapping_add(operand);
                let marker = self.table_next(&mut cursor)?;
                if marker.to_u64() != Opcode::Casetbl as u64 {
                    return Err(AmxError::InvalidOperand);
                }
                let mut records = self.table_next(&mut cursor)?;
                let default = self.table_next(&mut cursor)?;
                self.cip = cursor.wrapping_sub(C::STEP).wrapping_add(default);
                while records != C::ZERO {
                    let test = self.table_next(&mut cursor)?;
                    let target = self.table_next(&mut cursor)?;
                    if self.pri == test {
                        self.cip = cursor.wrapping_sub(C::STEP).wrapping_add(target);
                        break;
                    }
                    records = records.wrapping_sub(C::ONE);
                }
            }

            Opcode::SwapPri => {
                let top = self.data_read(self.stk)?;
                self.data_write(self.stk, self.pri)?;
                self.pri = top;
            }
            Opcode::SwapAlt => {
                let top = self.data_read(self.stk)?;
                self.data_write(self.stk, self.alt)?;
                self.alt = top;
            }

            Opcode::Break => {
                self.fire_callback(cb, cbid_break())?;
            }

            // only valid as a switch-table marker
            Opcode::Casetbl => return Err(AmxError::InvalidInstruction),
        }

        Ok(())
    }

    #[inline]
    fn flag(v: bool) -> C {
        if v {
            C::ONE
        } else {
            C::ZERO
        }
    }
}
