//! Virtual address spaces for the abstract machine.
//!
//! A [`Backing`] turns cell-aligned virtual addresses into references to
//! host-owned cells. The machine never touches a backing directly; it goes
//! through a [`MemoryManager`], which is either a [`Harvard`] pair (separate
//! code and data spaces) or a [`Neumann`] wrapper (one shared space).

mod contiguous;
mod paged;
mod partial;

pub use contiguous::ContiguousBacking;
pub use paged::PagedBacking;
pub use partial::PartialBacking;

use crate::definitions::Cell;

/// One strategy for mapping buffers of cells into a virtual address space.
///
/// Buffers are owned by the backing while mapped; `unmap` hands the buffer
/// back, which is how a host callback observes what the machine wrote into a
/// temporarily exposed cell. Unmapping an address that is not mapped returns
/// `None` and changes nothing.
pub trait Backing<C: Cell> {
    /// Resolve a virtual address to its cell, or `None` when the address is
    /// misaligned, unmapped, or past the end of its mapping.
    fn translate(&mut self, va: C) -> Option<&mut C>;

    /// Place a buffer into the address space and return its base address.
    /// Fails when no room is left for a buffer of this size.
    fn map(&mut self, buf: Vec<C>) -> Option<C>;

    /// Remove the mapping at `va` and return its buffer. `len` is the mapped
    /// length in cells.
    fn unmap(&mut self, va: C, len: usize) -> Option<Vec<C>>;
}

/// Pairs a code space with a data space.
pub trait MemoryManager<C: Cell> {
    type Code: Backing<C>;
    type Data: Backing<C>;

    fn code(&mut self) -> &mut Self::Code;
    fn data(&mut self) -> &mut Self::Data;
}

/// Separate code and data address spaces.
pub struct Harvard<CB, DB> {
    pub code: CB,
    pub data: DB,
}

impl<CB, DB> Harvard<CB, DB> {
    pub fn new(code: CB, data: DB) -> Self {
        Self { code, data }
    }
}

impl<C: Cell, CB: Backing<C>, DB: Backing<C>> MemoryManager<C> for Harvard<CB, DB> {
    type Code = CB;
    type Data = DB;

    fn code(&mut self) -> &mut CB {
        &mut self.code
    }

    fn data(&mut self) -> &mut DB {
        &mut self.data
    }
}

/// One address space serving both roles; code and data mappings share it.
pub struct Neumann<B> {
    pub backing: B,
}

impl<B> Neumann<B> {
    pub fn new(backing: B) -> Self {
        Self { backing }
    }
}

impl<C: Cell, B: Backing<C>> MemoryManager<C> for Neumann<B> {
    type Code = B;
    type Data = B;

    fn code(&mut self) -> &mut B {
        &mut self.backing
    }

    fn data(&mut self) -> &mut B {
        &mut self.backing
    }
}
