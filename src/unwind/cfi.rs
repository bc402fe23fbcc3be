//! Native unwinding from call frame information.
//!
//! Every library in the [`SharedLibrarySnapshot`] contributes the
//! `.eh_frame_hdr` and `.eh_frame` of its file on disk to a framehop
//! unwinder, so native frames built without a frame record (libc, code
//! compiled with `-fomit-frame-pointer`) are stepped through their CFI rows.
//! Addresses outside every known module fall back to the frame-pointer rule.
//!
//! Tables are loaded and swapped outside signal context. A walk takes a read
//! guard with the same bounded spin the index uses and the shared rule cache
//! with `try_lock`; when either is busy the walk uses the plain
//! [`FramePointerUnwinder`] instead of waiting.

use super::context::RegisterContext;
use super::memory::StackReader;
use super::native::{
    FramePointerCursor, FramePointerUnwinder, GenericUnwinder, MAX_GENERIC_STEPS, StepResult,
    UnwindCursor,
};
use crate::elf::{ElfImage, UnwindSections};
use crate::index::try_read_spin;
use crate::libraries::{LibraryDescriptor, SharedLibrarySnapshot};
use framehop::{ExplicitModuleSectionInfo, FrameAddress, Module, Unwinder};
use log::{debug, info};
use std::ffi::OsStr;
use std::ops::Range;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, TryLockError};

#[cfg(target_arch = "x86_64")]
mod arch {
    use crate::unwind::context::RegisterContext;
    pub use framehop::x86_64::{
        CacheX86_64 as Cache, UnwindRegsX86_64 as Regs, UnwinderX86_64 as ArchUnwinder,
    };

    pub fn regs(context: &RegisterContext) -> Regs {
        Regs::new(context.ip as u64, context.sp as u64, context.fp as u64)
    }

    pub fn frame_pointer(regs: &Regs) -> u64 {
        regs.bp()
    }
}

#[cfg(target_arch = "aarch64")]
mod arch {
    use crate::unwind::context::RegisterContext;
    pub use framehop::aarch64::{
        CacheAarch64 as Cache, UnwindRegsAarch64 as Regs, UnwinderAarch64 as ArchUnwinder,
    };

    pub fn regs(context: &RegisterContext) -> Regs {
        Regs::new(context.lr as u64, context.sp as u64, context.fp as u64)
    }

    pub fn frame_pointer(regs: &Regs) -> u64 {
        regs.fp()
    }
}

type NativeUnwinder = arch::ArchUnwinder<Vec<u8>>;

/// A framehop module over section copies owned by the module.
pub type CfiModule = Module<Vec<u8>>;

/// Build a module for code mapped at `avma_range` with load bias `bias`.
pub fn cfi_module(
    name: String,
    avma_range: Range<u64>,
    bias: u64,
    sections: UnwindSections,
) -> CfiModule {
    let info = ExplicitModuleSectionInfo {
        base_svma: 0,
        text_svma: sections.text,
        eh_frame_svma: sections.eh_frame.as_ref().map(|s| s.range()),
        eh_frame: sections.eh_frame.map(|s| s.data),
        eh_frame_hdr_svma: sections.eh_frame_hdr.as_ref().map(|s| s.range()),
        eh_frame_hdr: sections.eh_frame_hdr.map(|s| s.data),
        ..Default::default()
    };
    Module::new(name, avma_range, bias, info)
}

/// File backing a loaded library. The main executable reports no name.
fn library_path(library: &LibraryDescriptor) -> PathBuf {
    if library.name().is_empty() {
        PathBuf::from("/proc/self/exe")
    } else {
        PathBuf::from(OsStr::from_bytes(library.name().to_bytes()))
    }
}

/// Read the CFI for `library` from its file, keyed by the start of its code.
/// `None` for libraries without a file (the vDSO) or without `.eh_frame`.
fn load_library_module(library: &LibraryDescriptor) -> Option<(u64, CfiModule)> {
    let start = library.executable_ranges().map(|r| r.start).min()?;
    let end = library.executable_ranges().map(|r| r.end).max()?;

    let path = library_path(library);
    let sections = match ElfImage::open(&path).and_then(|image| image.unwind_sections()) {
        Ok(sections) => sections,
        Err(e) => {
            debug!("No CFI for {}: {e}", library.display_name());
            return None;
        }
    };
    if !sections.has_cfi() {
        debug!("{} has no .eh_frame", library.display_name());
        return None;
    }

    let module = cfi_module(
        library.display_name(),
        start as u64..end as u64,
        library.base() as u64,
        sections,
    );
    Some((start as u64, module))
}

struct LoadedLibrary {
    library: Arc<LibraryDescriptor>,
    /// Start of the module registered for it, if it had CFI
    module_start: Option<u64>,
}

/// CFI for the libraries of one process, kept in step with a
/// [`SharedLibrarySnapshot`] by [`sync`](Self::sync).
pub struct CfiTables {
    unwinder: RwLock<NativeUnwinder>,
    cache: Mutex<arch::Cache>,
    loaded: Mutex<Vec<LoadedLibrary>>,
}

impl CfiTables {
    pub fn new() -> Self {
        Self {
            unwinder: RwLock::new(NativeUnwinder::new()),
            cache: Mutex::new(arch::Cache::new()),
            loaded: Mutex::new(Vec::new()),
        }
    }

    /// Add CFI for libraries new to `libraries` and drop it for the ones that
    /// left. Files are read before the write lock is taken. Returns how many
    /// modules were added.
    ///
    /// Never call from a signal handler.
    pub fn sync(&self, libraries: &[Arc<LibraryDescriptor>]) -> usize {
        let mut loaded = self.loaded.lock().unwrap_or_else(PoisonError::into_inner);

        let (kept, gone): (Vec<_>, Vec<_>) = std::mem::take(&mut *loaded)
            .into_iter()
            .partition(|entry| libraries.iter().any(|l| l.same_identity(&entry.library)));
        *loaded = kept;

        let mut fresh = Vec::new();
        for library in libraries {
            if loaded.iter().any(|entry| entry.library.same_identity(library)) {
                continue;
            }
            let loaded_module = load_library_module(library);
            loaded.push(LoadedLibrary {
                library: Arc::clone(library),
                module_start: loaded_module.as_ref().map(|(start, _)| *start),
            });
            fresh.extend(loaded_module.map(|(_, module)| module));
        }

        let added = fresh.len();
        let removed = gone.iter().filter(|entry| entry.module_start.is_some()).count();
        if added == 0 && removed == 0 {
            return 0;
        }

        {
            let mut unwinder = self.unwinder.write().unwrap_or_else(PoisonError::into_inner);
            for start in gone.iter().filter_map(|entry| entry.module_start) {
                unwinder.remove_module(start);
            }
            for module in fresh {
                unwinder.add_module(module);
            }
        }

        info!("CFI tables updated: {added} modules added, {removed} removed");
        added
    }

    /// Register CFI for code the loader does not know about. Modules added
    /// here are left alone by [`sync`](Self::sync).
    pub fn add_module(&self, module: CfiModule) {
        self.unwinder
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .add_module(module);
    }

    /// Libraries seen by the last sync, with or without CFI.
    pub fn library_count(&self) -> usize {
        self.loaded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Libraries whose CFI is currently loaded.
    pub fn module_count(&self) -> usize {
        self.loaded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|entry| entry.module_start.is_some())
            .count()
    }

    fn try_acquire(
        &self,
    ) -> Option<(RwLockReadGuard<'_, NativeUnwinder>, MutexGuard<'_, arch::Cache>)> {
        let unwinder = try_read_spin(&self.unwinder)?;
        let cache = match self.cache.try_lock() {
            Ok(cache) => cache,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return None,
        };
        Some((unwinder, cache))
    }
}

impl Default for CfiTables {
    fn default() -> Self {
        Self::new()
    }
}

pub struct CfiUnwinder<'a, R> {
    tables: &'a CfiTables,
    reader: &'a R,
    fallback: FramePointerUnwinder<'a, R>,
}

impl<'a, R: StackReader> CfiUnwinder<'a, R> {
    pub fn new(tables: &'a CfiTables, reader: &'a R) -> Self {
        Self {
            tables,
            reader,
            fallback: FramePointerUnwinder::new(reader),
        }
    }

    pub fn with_libraries(mut self, libraries: &'a SharedLibrarySnapshot) -> Self {
        self.fallback = self.fallback.with_libraries(libraries);
        self
    }
}

impl<'a, R: StackReader> GenericUnwinder for CfiUnwinder<'a, R> {
    type Cursor = NativeCursor<'a, R>;

    fn init(&self, context: &RegisterContext) -> Result<Self::Cursor, i32> {
        if context.ip == 0 {
            return Err(-libc::EINVAL);
        }

        let Some((unwinder, cache)) = self.tables.try_acquire() else {
            return self.fallback.init(context).map(NativeCursor::FramePointer);
        };

        Ok(NativeCursor::Cfi(CfiCursor {
            unwinder,
            cache,
            reader: self.reader,
            regs: arch::regs(context),
            address: FrameAddress::InstructionPointer(context.ip as u64),
            ip: context.ip,
            steps: 0,
        }))
    }

    fn module_base(&self, ip: usize) -> Option<usize> {
        self.fallback.module_base(ip)
    }
}

pub struct CfiCursor<'a, R> {
    unwinder: RwLockReadGuard<'a, NativeUnwinder>,
    cache: MutexGuard<'a, arch::Cache>,
    reader: &'a R,
    regs: arch::Regs,
    address: FrameAddress,
    ip: usize,
    steps: usize,
}

impl<R: StackReader> UnwindCursor for CfiCursor<'_, R> {
    fn ip(&self) -> usize {
        self.ip
    }

    fn frame_pointer(&self) -> usize {
        arch::frame_pointer(&self.regs) as usize
    }

    fn step(&mut self) -> StepResult {
        if self.steps >= MAX_GENERIC_STEPS {
            return StepResult::Failed(-libc::ELOOP);
        }

        let reader = self.reader;
        let mut read = |addr: u64| {
            reader
                .read_word(addr as usize)
                .map(|word| word as u64)
                .ok_or(())
        };

        match self
            .unwinder
            .unwind_frame(self.address, &mut self.regs, &mut self.cache, &mut read)
        {
            Ok(Some(return_address)) => match FrameAddress::from_return_address(return_address) {
                Some(address) => {
                    self.address = address;
                    self.ip = return_address as usize;
                    self.steps += 1;
                    StepResult::Stepped
                }
                None => StepResult::Finished,
            },
            Ok(None) => StepResult::Finished,
            Err(_) => StepResult::Failed(-libc::EINVAL),
        }
    }
}

/// Cursor of a [`CfiUnwinder`]: CFI when the tables were free, frame
/// pointers otherwise.
pub enum NativeCursor<'a, R> {
    Cfi(CfiCursor<'a, R>),
    FramePointer(FramePointerCursor<'a, R>),
}

impl<R: StackReader> NativeCursor<'_, R> {
    pub fn is_cfi(&self) -> bool {
        matches!(self, NativeCursor::Cfi(_))
    }
}

impl<R: StackReader> UnwindCursor for NativeCursor<'_, R> {
    fn ip(&self) -> usize {
        match self {
            NativeCursor::Cfi(cursor) => cursor.ip(),
            NativeCursor::FramePointer(cursor) => cursor.ip(),
        }
    }

    fn frame_pointer(&self) -> usize {
        match self {
            NativeCursor::Cfi(cursor) => cursor.frame_pointer(),
            NativeCursor::FramePointer(cursor) => cursor.frame_pointer(),
        }
    }

    fn step(&mut self) -> StepResult {
        match self {
            NativeCursor::Cfi(cursor) => cursor.step(),
            NativeCursor::FramePointer(cursor) => cursor.step(),
        }
    }
}
