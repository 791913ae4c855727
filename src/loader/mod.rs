//! Module loading: container validation, symbol tables, native binding and
//! the callback broker that connects the machine to the host.
//!
//! The loader owns the [`Amx`] it brings up. Host callbacks reach the
//! machine and the symbol tables through a [`HostCtx`], which doubles as the
//! [`AmxCallback`] broker so a native can itself re-enter [`Amx::call`].

pub mod format;

mod error;

pub use error::LoadError;

use std::collections::HashMap;

use log::{debug, info};

use crate::definitions::Cell;
use crate::memory::MemoryManager;
use crate::vm::{cbid_break, cbid_single_step, Amx, AmxCallback, AmxError};
use format::{flags, FileHeader};

/// A host function the bytecode may invoke by SYSREQ index. `argc` is the
/// argument count in cells, `argv` the data address of the first argument;
/// the value written through `pri` becomes the machine's PRI.
pub type NativeFn<C, M, U> =
    fn(&mut Amx<C, M>, &mut HostCtx<'_, C, M, U>, C, C, &mut C) -> Result<(), AmxError>;

/// Debug hook fired on single-step or BREAK events.
pub type HookFn<C, M, U> = fn(&mut Amx<C, M>, &mut HostCtx<'_, C, M, U>) -> Result<(), AmxError>;

/// One native registration: the name the module imports and the function
/// that answers it.
pub struct NativeDecl<C: Cell, M: MemoryManager<C>, U> {
    pub name: &'static str,
    pub callback: NativeFn<C, M, U>,
}

/// Everything the host registers at `init` time.
pub struct Callbacks<'a, C: Cell, M: MemoryManager<C>, U> {
    pub natives: &'a [NativeDecl<C, M, U>],
    pub on_single_step: Option<HookFn<C, M, U>>,
    pub on_break: Option<HookFn<C, M, U>>,
}

impl<C: Cell, M: MemoryManager<C>, U> Default for Callbacks<'_, C, M, U> {
    fn default() -> Self {
        Self {
            natives: &[],
            on_single_step: None,
            on_break: None,
        }
    }
}

/// The module's exported names: publics, pubvars and the entry point.
pub struct Symbols<C: Cell> {
    publics: HashMap<String, C>,
    pubvars: HashMap<String, C>,
    main: Option<C>,
}

impl<C: Cell> Symbols<C> {
    fn new() -> Self {
        Self {
            publics: HashMap::new(),
            pubvars: HashMap::new(),
            main: None,
        }
    }

    /// Code address of an exported function.
    pub fn get_public(&self, name: &str) -> Option<C> {
        self.publics.get(name).copied()
    }

    /// Data address of an exported global.
    pub fn get_pubvar(&self, name: &str) -> Option<C> {
        self.pubvars.get(name).copied()
    }

    /// Code address of `main`, when the module has one.
    pub fn get_main(&self) -> Option<C> {
        self.main
    }
}

/// View handed to natives and hooks while the machine runs: symbol lookup,
/// the user payload, and (as the [`AmxCallback`] impl) the broker itself,
/// so nested calls keep working.
pub struct HostCtx<'l, C: Cell, M: MemoryManager<C>, U> {
    symbols: &'l Symbols<C>,
    natives: &'l [NativeFn<C, M, U>],
    on_single_step: Option<HookFn<C, M, U>>,
    on_break: Option<HookFn<C, M, U>>,
    pub user: &'l mut U,
}

impl<C: Cell, M: MemoryManager<C>, U> HostCtx<'_, C, M, U> {
    pub fn get_public(&self, name: &str) -> Option<C> {
        self.symbols.get_public(name)
    }

    pub fn get_pubvar(&self, name: &str) -> Option<C> {
        self.symbols.get_pubvar(name)
    }

    pub fn get_main(&self) -> Option<C> {
        self.symbols.get_main()
    }
}

impl<C: Cell, M: MemoryManager<C>, U> AmxCallback<C, M> for HostCtx<'_, C, M, U> {
    fn callback(
        &mut self,
        amx: &mut Amx<C, M>,
        index: C,
        stk: C,
        pri: &mut C,
    ) -> Result<(), AmxError> {
        if index == cbid_single_step::<C>() {
            return match self.on_single_step {
                Some(hook) => hook(amx, self),
                None => Ok(()),
            };
        }
        if index == cbid_break::<C>() {
            return match self.on_break {
                Some(hook) => hook(amx, self),
                None => Ok(()),
            };
        }
        // reference-faithful guard: only indexes strictly beyond the table
        // are rejected here; the boundary index fails the lookup below
        if index.to_u64() > self.natives.len() as u64 {
            return Err(AmxError::InvalidOperand);
        }
        let native = *self
            .natives
            .get(index.to_usize())
            .ok_or(AmxError::InvalidOperand)?;
        let arg_bytes = *amx.data_v2p(stk).ok_or(AmxError::AccessViolation)?;
        let argc = C::from_usize(arg_bytes.to_usize() / C::BYTES);
        native(amx, self, argc, stk.wrapping_add(C::STEP), pri)
    }
}

/// Loads one AMX module and owns the machine that runs it.
pub struct Loader<C: Cell, M: MemoryManager<C>, U> {
    pub amx: Amx<C, M>,
    symbols: Symbols<C>,
    natives: Vec<NativeFn<C, M, U>>,
    on_single_step: Option<HookFn<C, M, U>>,
    on_break: Option<HookFn<C, M, U>>,
    user: U,
}

impl<C: Cell, M: MemoryManager<C>, U> Loader<C, M, U> {
    pub fn new(mem: M, user: U) -> Self {
        Self {
            amx: Amx::new(mem),
            symbols: Symbols::new(),
            natives: Vec::new(),
            on_single_step: None,
            on_break: None,
            user,
        }
    }

    pub fn get_public(&self, name: &str) -> Option<C> {
        self.symbols.get_public(name)
    }

    pub fn get_pubvar(&self, name: &str) -> Option<C> {
        self.symbols.get_pubvar(name)
    }

    pub fn get_main(&self) -> Option<C> {
        self.symbols.get_main()
    }

    pub fn user(&mut self) -> &mut U {
        &mut self.user
    }

    /// Validate the module, bind its natives against `callbacks`, and bring
    /// the machine up. Repeating `init` on the same module resets the symbol
    /// tables and remaps the images, yielding the same bases again.
    pub fn init(&mut self, buf: &[u8], callbacks: Callbacks<'_, C, M, U>) -> Result<(), LoadError> {
        self.on_single_step = callbacks.on_single_step;
        self.on_break = callbacks.on_break;
        self.symbols = Symbols::new();
        self.natives.clear();

        let header = FileHeader::parse(buf)?;
        if header.magic != format::expected_magic::<C>() {
            return Err(if format::is_known_magic(header.magic) {
                LoadError::WrongCellSize
            } else {
                LoadError::InvalidFile
            });
        }
        if header.size as usize > buf.len() {
            return Err(LoadError::InvalidFile);
        }
        if header.file_version != format::FILE_VERSION {
            return Err(LoadError::UnsupportedFileVersion);
        }
        if header.amx_version > format::VERSION {
            return Err(LoadError::UnsupportedAmxVersion);
        }
        if header.flags & (flags::OVERLAY | flags::NOCHECKS | flags::SLEEP) != 0 {
            return Err(LoadError::FeatureNotSupported);
        }
        if header.defsize < format::MIN_DEFSIZE {
            return Err(LoadError::InvalidFile);
        }
        if header.stp < header.hea {
            return Err(LoadError::InvalidFile);
        }

        let code: Vec<C> = format::read_cells(buf, header.cod, header.dat)?;
        let mut data: Vec<C> = format::read_cells(buf, header.dat, header.hea)?;

        // furnish the heap and stack region between HEA and STP
        let extra_bytes = (header.stp - header.hea) as usize + C::BYTES - 1;
        let data_oldsize = data.len();
        data.resize(data_oldsize + extra_bytes / C::BYTES, C::ZERO);

        self.symbols.main = if header.cip == u32::MAX {
            None
        } else {
            Some(C::from_u32(header.cip))
        };

        format::each_record(buf, header.publics, header.natives, header.defsize, |r| {
            let name = format::read_name(buf, r.name_offset)?;
            self.symbols.publics.insert(name, C::from_u32(r.address));
            Ok(())
        })?;

        // natives are bound in file order; their position is the SYSREQ index
        format::each_record(buf, header.natives, header.libraries, header.defsize, |r| {
            let name = format::read_name(buf, r.name_offset)?;
            let decl = callbacks
                .natives
                .iter()
                .find(|d| d.name == name)
                .ok_or(LoadError::NativeNotResolved)?;
            debug!("native {:?} bound at index {}", decl.name, self.natives.len());
            self.natives.push(decl.callback);
            Ok(())
        })?;

        if header.libraries != header.pubvars {
            return Err(LoadError::FeatureNotSupported);
        }

        format::each_record(buf, header.pubvars, header.tags, header.defsize, |r| {
            let name = format::read_name(buf, r.name_offset)?;
            self.symbols.pubvars.insert(name, C::from_u32(r.address));
            Ok(())
        })?;

        let (code_cells, data_cells) = (code.len(), data.len());
        self.amx
            .install(code, data, data_oldsize)
            .map_err(|_| LoadError::Unknown)?;

        info!(
            "module loaded: {} code cells, {} data cells (heap base {}), {} publics, {} natives, {} pubvars",
            code_cells,
            data_cells,
            data_oldsize,
            self.symbols.publics.len(),
            self.natives.len(),
            self.symbols.pubvars.len()
        );
        Ok(())
    }

    /// Run an exported routine with the loader's natives and hooks brokered
    /// in. The machine is borrowed for the duration; natives see the rest of
    /// the loader through their [`HostCtx`].
    pub fn call(&mut self, target: C, args: &[C]) -> Result<C, AmxError> {
        let Loader {
            amx,
            symbols,
            natives,
            on_single_step,
            on_break,
            user,
        } = self;
        let mut ctx = HostCtx {
            symbols: &*symbols,
            natives: natives.as_slice(),
            on_single_step: *on_single_step,
            on_break: *on_break,
            user,
        };
        amx.call(target, args, &mut ctx)
    }
}
