//! Stack walk across the native/managed boundary.
//!
//! The walk starts with the generic unwinder and follows it until the first
//! instruction pointer that the [`CodeRangeIndex`] claims. Managed code is not
//! described by unwind tables, so from there on the walker follows the frame
//! pointer chain itself, reading the saved frame pointer and return address at
//! the offsets recorded in the [`UnwindMetadataRegistry`].
//!
//! A walk never allocates, never blocks and never returns an error: any
//! failure ends it with the frames collected so far, and the reason is left in
//! the diagnostics log.

use super::context::RegisterContext;
use super::memory::StackReader;
use super::native::{GenericUnwinder, StepResult, UnwindCursor, caller_frame_advances};
use crate::diagnostics::{UnwindDiagnosticsLog, UnwindEvent};
use crate::index::{CodeOwner, CodeRangeIndex};
use crate::metadata::{DEFAULT_SAVED_FP_OFFSET, DEFAULT_SAVED_LR_OFFSET, UnwindMetadataRegistry};

/// Code never lives in the first 64KB.
const MIN_CODE_ADDRESS: usize = 0x10000;

#[cfg(target_arch = "aarch64")]
const USER_SPACE_LIMIT: usize = 0x0000_ffff_ffff_ffff;
#[cfg(not(target_arch = "aarch64"))]
const USER_SPACE_LIMIT: usize = 0x0000_7fff_ffff_ffff;

/// Return addresses below this are accepted as native code even when no
/// library claims them.
const NATIVE_HEURISTIC_LIMIT: usize = 0x7f00_0000_0000;

/// Init flag recorded when the walk starts from an interrupted context.
pub const INIT_SIGNAL_FRAME: u32 = 1;

/// Tag OR'ed into the frame pointer of a rejected step: the chain went down.
const INVALID_FP_DIRECTION: usize = 0x1;
/// Tag OR'ed into the frame pointer of a rejected step: bad return address.
const INVALID_RETURN_ADDRESS: usize = 0x2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Zero-length output buffer
    EmptyBuffer,
    /// No context given and none could be captured
    ContextUnavailable,
    GenericInitFailed,
    /// The native stack ended before any managed frame
    NoManagedFrame,
    GenericUnwindFailed,
    /// A manual step produced an implausible frame
    StepInvalid,
    ReadFailed,
    BufferFull,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::EmptyBuffer => "empty-buffer",
            StopReason::ContextUnavailable => "context-unavailable",
            StopReason::GenericInitFailed => "generic-init-failed",
            StopReason::NoManagedFrame => "no-managed-frame",
            StopReason::GenericUnwindFailed => "generic-unwind-failed",
            StopReason::StepInvalid => "step-invalid",
            StopReason::ReadFailed => "read-failed",
            StopReason::BufferFull => "buffer-full",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalkResult {
    pub frames: usize,
    pub stop: StopReason,
}

impl WalkResult {
    fn stopped(frames: usize, stop: StopReason) -> Self {
        Self { frames, stop }
    }
}

pub struct HybridStackWalker<'a, U, R> {
    index: &'a CodeRangeIndex,
    registry: &'a UnwindMetadataRegistry,
    unwinder: &'a U,
    reader: &'a R,
}

#[inline]
fn record(
    log: Option<&UnwindDiagnosticsLog>,
    event: UnwindEvent,
    value: usize,
    aux: usize,
    result: i32,
) {
    if let Some(log) = log {
        log.append(event, value, aux, result);
    }
}

impl<'a, U, R> HybridStackWalker<'a, U, R>
where
    U: GenericUnwinder,
    R: StackReader,
{
    pub fn new(
        index: &'a CodeRangeIndex,
        registry: &'a UnwindMetadataRegistry,
        unwinder: &'a U,
        reader: &'a R,
    ) -> Self {
        Self {
            index,
            registry,
            unwinder,
            reader,
        }
    }

    /// Walk from `context` (or from here when `None`) into `out`.
    ///
    /// `out[0]` is the first managed instruction pointer; native frames below
    /// it are skipped. Returns how many entries were written.
    #[inline(always)]
    pub fn walk(
        &self,
        context: Option<&RegisterContext>,
        out: &mut [usize],
        log: Option<&UnwindDiagnosticsLog>,
    ) -> WalkResult {
        if out.is_empty() {
            return WalkResult::stopped(0, StopReason::EmptyBuffer);
        }

        let (context, flags) = match context {
            Some(context) => (*context, INIT_SIGNAL_FRAME),
            None => match RegisterContext::capture() {
                Some(context) => (context, 0),
                None => {
                    record(log, UnwindEvent::GetContextFailed, 0, 0, -libc::ENOTSUP);
                    return WalkResult::stopped(0, StopReason::ContextUnavailable);
                }
            },
        };
        if let Some(log) = log {
            log.set_init_flags(flags);
        }

        let result = self.walk_from(&context, out, log);
        record(log, UnwindEvent::Finish, 0, 0, result.frames as i32);
        result
    }

    fn walk_from(
        &self,
        context: &RegisterContext,
        out: &mut [usize],
        log: Option<&UnwindDiagnosticsLog>,
    ) -> WalkResult {
        let mut cursor = match self.unwinder.init(context) {
            Ok(cursor) => cursor,
            Err(code) => {
                record(log, UnwindEvent::InitFailed, context.ip, 0, code);
                return WalkResult::stopped(0, StopReason::GenericInitFailed);
            }
        };

        // Generic phase: skip native frames until managed code shows up
        let ip = loop {
            let ip = cursor.ip();
            if ip == 0 {
                record(log, UnwindEvent::GetIpFailed, 0, 0, -libc::EINVAL);
                return WalkResult::stopped(0, StopReason::GenericUnwindFailed);
            }

            if self.index.is_managed(ip) {
                record(log, UnwindEvent::ManagedFrame, ip, cursor.frame_pointer(), 0);
                break ip;
            }

            let base = self.unwinder.module_base(ip).unwrap_or(0);
            record(log, UnwindEvent::NativeFrame, ip, base, 0);

            let step = cursor.step();
            record(log, UnwindEvent::StepResult, ip, 0, step.code());
            match step {
                StepResult::Stepped => {}
                StepResult::Finished => {
                    return WalkResult::stopped(0, StopReason::NoManagedFrame);
                }
                StepResult::Failed(_) => {
                    return WalkResult::stopped(0, StopReason::GenericUnwindFailed);
                }
            }
        };

        out[0] = ip;
        self.walk_manual(ip, cursor.frame_pointer(), out, log)
    }

    /// Manual phase. `out[0]` already holds `ip`.
    fn walk_manual(
        &self,
        mut ip: usize,
        mut fp: usize,
        out: &mut [usize],
        log: Option<&UnwindDiagnosticsLog>,
    ) -> WalkResult {
        let mut frames = 1;

        while frames < out.len() {
            match self.index.lookup(ip) {
                Some(CodeOwner::Method(method)) => {
                    record(log, UnwindEvent::ManagedViaJitCache, ip, method.0 as usize, 0)
                }
                Some(CodeOwner::Module(module)) => {
                    record(log, UnwindEvent::ManagedViaModule, ip, module.0 as usize, 0)
                }
                None => {}
            }

            let (fp_offset, lr_offset) = match self.registry.find(ip) {
                Some(metadata) => (metadata.fp_offset(), metadata.lr_offset()),
                None => {
                    record(log, UnwindEvent::MetadataMiss, ip, fp, 0);
                    (DEFAULT_SAVED_FP_OFFSET, DEFAULT_SAVED_LR_OFFSET)
                }
            };

            let Some(caller_fp) = self.read_at(fp, fp_offset) else {
                record(log, UnwindEvent::ManualFramePointerReadFailed, ip, fp, -libc::EFAULT);
                return WalkResult::stopped(frames, StopReason::ReadFailed);
            };
            let Some(return_address) = self.read_at(fp, lr_offset) else {
                record(log, UnwindEvent::ManualFramePointerReadFailed, ip, fp, -libc::EFAULT);
                return WalkResult::stopped(frames, StopReason::ReadFailed);
            };

            if !caller_frame_advances(fp, caller_fp) {
                record(
                    log,
                    UnwindEvent::ManualFramePointerInvalidReturn,
                    return_address,
                    fp | INVALID_FP_DIRECTION,
                    0,
                );
                return WalkResult::stopped(frames, StopReason::StepInvalid);
            }

            if !self.is_valid_return_address(return_address) {
                record(
                    log,
                    UnwindEvent::ManualFramePointerInvalidReturn,
                    return_address,
                    fp | INVALID_RETURN_ADDRESS,
                    0,
                );
                return WalkResult::stopped(frames, StopReason::StepInvalid);
            }

            record(log, UnwindEvent::ManualFramePointerSuccess, return_address, fp, 0);
            out[frames] = return_address;
            frames += 1;
            fp = caller_fp;
            ip = return_address;
        }

        record(log, UnwindEvent::BufferFull, ip, fp, frames as i32);
        WalkResult::stopped(frames, StopReason::BufferFull)
    }

    #[inline]
    fn read_at(&self, fp: usize, offset: i32) -> Option<usize> {
        let addr = fp.checked_add_signed(offset as isize)?;
        self.reader.read_word(addr)
    }

    /// Plausibility check for a return address read off the stack.
    pub fn is_valid_return_address(&self, address: usize) -> bool {
        if address == 0 {
            return false;
        }

        if cfg!(target_arch = "aarch64") && address & 0x3 != 0 {
            return false;
        }

        if !(MIN_CODE_ADDRESS..USER_SPACE_LIMIT).contains(&address) {
            return false;
        }

        self.index.is_managed(address)
            || self.unwinder.module_base(address).is_some()
            || address < NATIVE_HEURISTIC_LIMIT
    }
}
