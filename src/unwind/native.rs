//! Generic (native) unwinding.
//!
//! The hybrid walker drives any unwinder behind [`GenericUnwinder`]; the
//! bundled one follows the frame-pointer chain, which is what the native
//! side of this crate is built with.

use super::context::RegisterContext;
use super::memory::StackReader;
use crate::libraries::SharedLibrarySnapshot;

/// Upper bound on generic steps, in case a chain loops.
pub(crate) const MAX_GENERIC_STEPS: usize = 1024;

/// A caller's frame record sits strictly above its callee's. A record that
/// links to itself or below is corrupt.
#[inline]
pub(crate) fn caller_frame_advances(fp: usize, caller_fp: usize) -> bool {
    caller_fp > fp
}

/// Outcome of advancing a cursor one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
    Stepped,
    /// No caller frame
    Finished,
    /// Negative errno-style code
    Failed(i32),
}

impl StepResult {
    /// Positive for a step, zero at the end, negative on failure.
    pub fn code(self) -> i32 {
        match self {
            StepResult::Stepped => 1,
            StepResult::Finished => 0,
            StepResult::Failed(code) => code,
        }
    }
}

pub trait UnwindCursor {
    fn ip(&self) -> usize;

    fn frame_pointer(&self) -> usize;

    fn step(&mut self) -> StepResult;
}

/// Must be async-signal-safe in every method.
pub trait GenericUnwinder {
    type Cursor: UnwindCursor;

    /// Position a cursor on the frame described by `context`.
    fn init(&self, context: &RegisterContext) -> Result<Self::Cursor, i32>;

    /// Load bias of the library containing `ip`, if known.
    fn module_base(&self, ip: usize) -> Option<usize>;
}

pub struct FramePointerUnwinder<'a, R> {
    reader: &'a R,
    libraries: Option<&'a SharedLibrarySnapshot>,
}

impl<'a, R: StackReader> FramePointerUnwinder<'a, R> {
    pub fn new(reader: &'a R) -> Self {
        Self {
            reader,
            libraries: None,
        }
    }

    pub fn with_libraries(mut self, libraries: &'a SharedLibrarySnapshot) -> Self {
        self.libraries = Some(libraries);
        self
    }
}

impl<'a, R: StackReader> GenericUnwinder for FramePointerUnwinder<'a, R> {
    type Cursor = FramePointerCursor<'a, R>;

    fn init(&self, context: &RegisterContext) -> Result<Self::Cursor, i32> {
        if context.ip == 0 {
            return Err(-libc::EINVAL);
        }
        Ok(FramePointerCursor {
            reader: self.reader,
            ip: context.ip,
            fp: context.fp,
            steps: 0,
        })
    }

    fn module_base(&self, ip: usize) -> Option<usize> {
        self.libraries?.module_base(ip)
    }
}

pub struct FramePointerCursor<'a, R> {
    reader: &'a R,
    ip: usize,
    fp: usize,
    steps: usize,
}

impl<R: StackReader> UnwindCursor for FramePointerCursor<'_, R> {
    fn ip(&self) -> usize {
        self.ip
    }

    fn frame_pointer(&self) -> usize {
        self.fp
    }

    fn step(&mut self) -> StepResult {
        if self.fp == 0 {
            return StepResult::Finished;
        }
        if self.steps >= MAX_GENERIC_STEPS {
            return StepResult::Failed(-libc::ELOOP);
        }

        // [fp] holds the caller's frame pointer, [fp + word] the return address
        let Some(caller_fp) = self.reader.read_word(self.fp) else {
            return StepResult::Failed(-libc::EFAULT);
        };
        let Some(return_address) = self
            .fp
            .checked_add(size_of::<usize>())
            .and_then(|addr| self.reader.read_word(addr))
        else {
            return StepResult::Failed(-libc::EFAULT);
        };

        if return_address == 0 {
            return StepResult::Finished;
        }
        // A zero caller fp ends native chains, so it finishes on the next step
        if caller_fp != 0 && !caller_frame_advances(self.fp, caller_fp) {
            return StepResult::Failed(-libc::EINVAL);
        }

        self.ip = return_address;
        self.fp = caller_fp;
        self.steps += 1;
        StepResult::Stepped
    }
}
