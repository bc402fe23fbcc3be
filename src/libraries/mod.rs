//! Stable snapshot of loaded shared libraries.
//!
//! Generic unwinders enumerate program headers through `dl_iterate_phdr`,
//! whose records point into loader memory that a concurrent `dlclose` may
//! free. The snapshot deep-copies every record on refresh and serves
//! enumeration from its own copy instead.

pub mod descriptor;

pub use descriptor::LibraryDescriptor;

use crate::index::try_read_spin;
use log::debug;
use std::ffi::c_void;
use std::ops::Range;
use std::os::raw::c_int;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use libc::dl_phdr_info;

/// Callback shape accepted by `dl_iterate_phdr`.
pub type PhdrCallback =
    Option<unsafe extern "C" fn(info: *mut dl_phdr_info, size: usize, data: *mut c_void) -> c_int>;

/// Where library lists and change counts come from.
pub trait PhdrSource: Send + Sync {
    /// Monotonic count of load and unload events.
    fn generation(&self) -> u64;

    fn enumerate(&self) -> Vec<LibraryDescriptor>;
}

/// The process's own dynamic loader.
#[derive(Debug, Default)]
pub struct Loader {
    counter: Option<Arc<AtomicU64>>,
}

impl Loader {
    /// Use the loader's own `dlpi_adds + dlpi_subs` as the generation.
    pub fn new() -> Self {
        Self { counter: None }
    }

    /// Use an externally maintained counter, e.g. bumped by a `dlopen` wrapper.
    pub fn with_counter(counter: Arc<AtomicU64>) -> Self {
        Self {
            counter: Some(counter),
        }
    }
}

impl PhdrSource for Loader {
    fn generation(&self) -> u64 {
        match &self.counter {
            Some(counter) => counter.load(Ordering::Acquire),
            None => loader_generation(),
        }
    }

    fn enumerate(&self) -> Vec<LibraryDescriptor> {
        unsafe extern "C" fn collect(
            info: *mut dl_phdr_info,
            _size: usize,
            data: *mut c_void,
        ) -> c_int {
            // SAFETY: data is the Vec passed below; info is valid for this call
            let libraries = unsafe { &mut *(data as *mut Vec<LibraryDescriptor>) };
            if let Some(info) = unsafe { info.as_ref() } {
                libraries.push(unsafe { LibraryDescriptor::from_raw(info) });
            }
            0
        }

        let mut libraries: Vec<LibraryDescriptor> = Vec::new();
        // SAFETY: the callback only touches the Vec we pass in
        unsafe {
            libc::dl_iterate_phdr(Some(collect), &mut libraries as *mut _ as *mut c_void);
        }
        libraries
    }
}

fn loader_generation() -> u64 {
    unsafe extern "C" fn first(info: *mut dl_phdr_info, size: usize, data: *mut c_void) -> c_int {
        let counts_present =
            size >= std::mem::offset_of!(dl_phdr_info, dlpi_subs) + size_of::<u64>();
        // SAFETY: data is the u64 passed below
        let out = unsafe { &mut *(data as *mut u64) };
        if let Some(info) = unsafe { info.as_ref() }
            && counts_present
        {
            *out = (info.dlpi_adds as u64).wrapping_add(info.dlpi_subs as u64);
        }
        1
    }

    let mut generation = 0u64;
    // SAFETY: the callback writes only the u64 we pass in
    unsafe {
        libc::dl_iterate_phdr(Some(first), &mut generation as *mut u64 as *mut c_void);
    }
    generation
}

pub struct SharedLibrarySnapshot {
    libraries: RwLock<Vec<Arc<LibraryDescriptor>>>,
    source: Box<dyn PhdrSource>,
    last_seen: AtomicU64,
    refreshing: Mutex<()>,
}

impl SharedLibrarySnapshot {
    /// Empty snapshot over the process loader. Call [`refresh`](Self::refresh)
    /// before use.
    pub fn new() -> Self {
        Self::with_source(Box::new(Loader::new()))
    }

    pub fn with_source(source: Box<dyn PhdrSource>) -> Self {
        Self {
            libraries: RwLock::new(Vec::new()),
            source,
            last_seen: AtomicU64::new(u64::MAX),
            refreshing: Mutex::new(()),
        }
    }

    /// Rebuild if the loader generation moved. Returns whether it did.
    ///
    /// Never call from a signal handler.
    pub fn refresh(&self) -> bool {
        let _refreshing = self.refreshing.lock().unwrap_or_else(PoisonError::into_inner);

        let generation = self.source.generation();
        if generation == self.last_seen.load(Ordering::Acquire) {
            return false;
        }

        let fresh = self.source.enumerate();

        let previous = self
            .libraries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        // Unchanged libraries keep their existing copy
        let mut reused = 0usize;
        let next: Vec<Arc<LibraryDescriptor>> = fresh
            .into_iter()
            .map(|descriptor| {
                match previous.iter().find(|old| old.same_identity(&descriptor)) {
                    Some(old) => {
                        reused += 1;
                        Arc::clone(old)
                    }
                    None => Arc::new(descriptor),
                }
            })
            .collect();

        debug!(
            "Library snapshot generation {}: {} libraries ({} new, {} gone)",
            generation,
            next.len(),
            next.len() - reused,
            previous.len().saturating_sub(reused)
        );

        let replaced = {
            let mut current = self.libraries.write().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *current, next)
        };
        drop(replaced);

        self.last_seen.store(generation, Ordering::Release);
        true
    }

    /// Generation of the current snapshot, `None` before the first refresh.
    pub fn generation(&self) -> Option<u64> {
        let seen = self.last_seen.load(Ordering::Acquire);
        (seen != u64::MAX).then_some(seen)
    }

    pub fn len(&self) -> usize {
        self.libraries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Owned handles to the current descriptors.
    pub fn libraries(&self) -> Vec<Arc<LibraryDescriptor>> {
        self.libraries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Visit descriptors until `f` returns `false`. Signal-safe; a contended
    /// snapshot is visited as empty.
    pub fn for_each_library(&self, mut f: impl FnMut(&LibraryDescriptor) -> bool) {
        let Some(libraries) = try_read_spin(&self.libraries) else {
            return;
        };
        for library in libraries.iter() {
            if !f(library) {
                break;
            }
        }
    }

    /// Load bias of the library with a segment covering `addr`. Signal-safe.
    pub fn module_base(&self, addr: usize) -> Option<usize> {
        let mut base = None;
        self.for_each_library(|library| {
            if library.contains(addr) {
                base = Some(library.base());
                return false;
            }
            true
        });
        base
    }

    /// Executable segments of every library in the snapshot.
    pub fn executable_ranges(&self) -> Vec<Range<usize>> {
        let mut ranges = Vec::new();
        for library in self.libraries() {
            ranges.extend(library.executable_ranges());
        }
        ranges.sort_by_key(|range| range.start);
        ranges
    }

    /// `dl_iterate_phdr` over the snapshot. Stops at the first non-zero
    /// callback result and returns it.
    ///
    /// # Safety
    /// `callback` must be safe to call with a record borrowed from the
    /// snapshot and the given `data`.
    pub unsafe fn iterate_phdr_with(&self, callback: PhdrCallback, data: *mut c_void) -> c_int {
        let Some(callback) = callback else {
            return 0;
        };

        let mut rc = 0;
        self.for_each_library(|library| {
            let mut info = library.as_phdr_info();
            // SAFETY: info borrows from the descriptor, which the read guard
            // keeps alive for the duration of the call
            rc = unsafe { callback(&mut info, size_of::<dl_phdr_info>(), data) };
            rc == 0
        });
        rc
    }
}

impl Default for SharedLibrarySnapshot {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot served by [`iterate_phdr`].
static PHDR_HOOK: AtomicPtr<SharedLibrarySnapshot> = AtomicPtr::new(ptr::null_mut());

/// Drop-in replacement for `dl_iterate_phdr` for generic unwinders that let
/// the enumeration function be overridden. Serves the snapshot installed by
/// [`PhdrHookGuard`] and enumerates nothing when none is.
///
/// # Safety
/// Same contract as `dl_iterate_phdr`.
pub unsafe extern "C" fn iterate_phdr(callback: PhdrCallback, data: *mut c_void) -> c_int {
    let snapshot = PHDR_HOOK.load(Ordering::Acquire);
    // SAFETY: the guard that installed the pointer holds a strong reference
    match unsafe { snapshot.as_ref() } {
        Some(snapshot) => unsafe { snapshot.iterate_phdr_with(callback, data) },
        None => 0,
    }
}

/// Installs a snapshot behind [`iterate_phdr`] for as long as it lives.
///
/// Users of `iterate_phdr` must be quiesced before the guard is dropped.
pub struct PhdrHookGuard {
    snapshot: Arc<SharedLibrarySnapshot>,
}

impl PhdrHookGuard {
    /// Returns `None` if another snapshot is already installed.
    pub fn install(snapshot: Arc<SharedLibrarySnapshot>) -> Option<Self> {
        let raw = Arc::as_ptr(&snapshot) as *mut SharedLibrarySnapshot;
        PHDR_HOOK
            .compare_exchange(ptr::null_mut(), raw, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        Some(Self { snapshot })
    }

    pub fn snapshot(&self) -> &Arc<SharedLibrarySnapshot> {
        &self.snapshot
    }
}

impl Drop for PhdrHookGuard {
    fn drop(&mut self) {
        let raw = Arc::as_ptr(&self.snapshot) as *mut SharedLibrarySnapshot;
        let _ =
            PHDR_HOOK.compare_exchange(raw, ptr::null_mut(), Ordering::AcqRel, Ordering::Acquire);
    }
}
