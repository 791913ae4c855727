//! An embeddable PAWN abstract machine (AMX).
//!
//! The crate has two halves that plug into each other: the interpreter
//! ([`vm::Amx`]), a register machine parameterized over its cell width and
//! its memory topology, and the module loader ([`loader::Loader`]), which
//! validates a compiled `.amx` container, binds the module's native imports
//! to host functions, and brings the machine up.
//!
//! ```no_run
//! use pawn_amx::loader::{Callbacks, Loader};
//! use pawn_amx::memory::{Neumann, PagedBacking};
//!
//! let bytes = std::fs::read("script.amx").unwrap();
//! let mut loader: Loader<u32, Neumann<PagedBacking<u32, 5>>, ()> =
//!     Loader::new(Neumann::new(PagedBacking::new()), ());
//! loader.init(&bytes, Callbacks::default()).unwrap();
//! if let Some(main) = loader.get_main() {
//!     let result = loader.call(main, &[]).unwrap();
//!     println!("{}", result as i32);
//! }
//! ```

pub mod definitions;
pub mod loader;
pub mod memory;
pub mod vm;

pub use definitions::Cell;
pub use loader::{Callbacks, LoadError, Loader, NativeDecl};
pub use memory::{Backing, ContiguousBacking, Harvard, MemoryManager, Neumann, PagedBacking, PartialBacking};
pub use vm::{Amx, AmxCallback, AmxError};

/// The machine the reference tooling targets: 32-bit cells in one shared
/// paged address space.
pub type Amx32 = Amx<u32, Neumann<PagedBacking<u32, 5>>>;
/// [`Amx32`] at 64-bit cells.
pub type Amx64 = Amx<u64, Neumann<PagedBacking<u64, 5>>>;
/// [`Amx32`] at 16-bit cells, with smaller pages to match the address space.
pub type Amx16 = Amx<u16, Neumann<PagedBacking<u16, 3>>>;
