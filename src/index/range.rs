//! Value types stored in the code range index.

use crate::error::{Error, Result};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

/// Runtime identity of a compiled method (function handle from the JIT)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodId(pub u64);

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "method:{:#x}", self.0)
    }
}

/// Runtime identity of a loaded module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(pub u64);

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "module:{:#x}", self.0)
    }
}

/// What owns an address found in the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeOwner {
    /// Fine-grained hit on a JIT-compiled method
    Method(MethodId),
    /// Coarse hit inside a precompiled module's code segment
    Module(ModuleId),
}

impl CodeOwner {
    pub fn method(self) -> Option<MethodId> {
        match self {
            CodeOwner::Method(method) => Some(method),
            CodeOwner::Module(_) => None,
        }
    }
}

/// A contiguous block of JIT code attributed to one method. `end` is exclusive
/// and always above `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeRange {
    start: usize,
    end: usize,
    method: MethodId,
}

impl CodeRange {
    pub fn new(start: usize, end: usize, method: MethodId) -> Result<Self> {
        if start >= end {
            return Err(Error::InvalidRange { start, end });
        }
        Ok(Self { start, end, method })
    }

    /// Range of `size` bytes starting at `start`.
    pub fn with_size(start: usize, size: usize, method: MethodId) -> Result<Self> {
        let end = start
            .checked_add(size)
            .ok_or(Error::InvalidRange { start, end: start })?;
        Self::new(start, end, method)
    }

    /// Bypasses validation so the index's own guards can be exercised.
    #[cfg(test)]
    pub(crate) fn new_unchecked(start: usize, end: usize, method: MethodId) -> Self {
        Self { start, end, method }
    }

    #[inline]
    pub fn start(&self) -> usize {
        self.start
    }

    #[inline]
    pub fn end(&self) -> usize {
        self.end
    }

    #[inline]
    pub fn method(&self) -> MethodId {
        self.method
    }

    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}

/// Executable segment of a precompiled module.
///
/// Removal only sets the tombstone; the entry stays allocated for as long as
/// the index lives, so a reader holding it can always check the flag.
#[derive(Debug)]
pub struct ModuleCodeRange {
    start: usize,
    end: usize,
    module: ModuleId,
    removed: AtomicBool,
}

impl ModuleCodeRange {
    pub fn new(start: usize, end: usize, module: ModuleId) -> Result<Self> {
        if start >= end {
            return Err(Error::InvalidRange { start, end });
        }
        Ok(Self {
            start,
            end,
            module,
            removed: AtomicBool::new(false),
        })
    }

    #[inline]
    pub fn start(&self) -> usize {
        self.start
    }

    #[inline]
    pub fn end(&self) -> usize {
        self.end
    }

    #[inline]
    pub fn module(&self) -> ModuleId {
        self.module
    }

    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end
    }

    #[inline]
    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_removed(&self) {
        self.removed.store(true, Ordering::Release);
    }
}

/// Index of the last range with `start <= addr` in a slice sorted by start.
#[inline]
pub(crate) fn last_starting_at_or_before<T>(
    sorted: &[T],
    addr: usize,
    start_of: impl Fn(&T) -> usize,
) -> Option<usize> {
    let idx = sorted.partition_point(|item| start_of(item) <= addr);
    idx.checked_sub(1)
}
