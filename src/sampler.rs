//! Timer-driven self-sampling through SIGPROF.
//!
//! `ITIMER_PROF` delivers SIGPROF to whichever thread is burning CPU. The
//! handler reads the interrupted registers from its `ucontext`, walks the
//! stack through the engine and folds the result into a fixed-size callsite
//! table. Nothing on that path allocates or locks.

use crate::diagnostics::{UnwindDiagnosticsLog, UnwindTraceEntry};
use crate::engine::UnwindEngine;
use crate::error::{Error, Result};
use crate::unwind::{RegisterContext, StopReason};
use log::{debug, info, warn};
use nix::sys::signal::{
    SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal, pthread_sigmask, sigaction,
};
use std::ffi::c_void;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Distinct stacks the table can hold
pub const CALLSITE_CAPACITY: usize = 4096;

/// Frames kept per sample
pub const MAX_SAMPLE_DEPTH: usize = 64;

pub const MAX_FREQUENCY_HZ: u32 = 10_000;

static IN_SIGNAL_HANDLER: AtomicBool = AtomicBool::new(false);

/// State of the running sampler, if any. Only the signal handler reads it.
static ACTIVE: AtomicPtr<SamplerShared> = AtomicPtr::new(ptr::null_mut());

struct Callsite {
    hash: AtomicU64,
    samples: AtomicU64,
    depth: AtomicUsize,
    frames: [AtomicUsize; MAX_SAMPLE_DEPTH],
}

impl Callsite {
    fn new() -> Self {
        Self {
            hash: AtomicU64::new(0),
            samples: AtomicU64::new(0),
            depth: AtomicUsize::new(0),
            frames: std::array::from_fn(|_| AtomicUsize::new(0)),
        }
    }
}

struct SamplerShared {
    engine: Arc<UnwindEngine>,
    depth: usize,
    callsites: Box<[Callsite]>,
    samples: AtomicU64,
    unattributed: AtomicU64,
    dropped: AtomicU64,
    walks: AtomicU64,
    last_walk: UnwindDiagnosticsLog,
    last_stop: AtomicUsize,
}

/// FNV-1a over the frames. Never zero, zero marks an empty slot.
fn stack_hash(frames: &[usize]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for &frame in frames {
        hash ^= frame as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    if hash == 0 { 1 } else { hash }
}

impl SamplerShared {
    fn find_or_create(&self, hash: u64, frames: &[usize]) -> Option<&Callsite> {
        let mut idx = (hash as usize) % self.callsites.len();

        for _ in 0..self.callsites.len() {
            let entry = &self.callsites[idx];
            let stored = entry.hash.load(Ordering::Acquire);

            if stored == hash {
                return Some(entry);
            }

            if stored == 0 {
                if entry
                    .hash
                    .compare_exchange(0, hash, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    for (slot, &frame) in entry.frames.iter().zip(frames) {
                        slot.store(frame, Ordering::Relaxed);
                    }
                    entry.depth.store(frames.len(), Ordering::Release);
                    return Some(entry);
                }

                // Lost the race; the winner may have stored our hash
                if entry.hash.load(Ordering::Acquire) == hash {
                    return Some(entry);
                }
            }

            idx = (idx + 1) % self.callsites.len();
        }

        None
    }

    fn sample(&self, ucontext: *mut c_void) {
        // SAFETY: the kernel passes a ucontext_t to SA_SIGINFO handlers
        let context = unsafe { RegisterContext::from_ucontext(ucontext) };

        let mut frames = [0usize; MAX_SAMPLE_DEPTH];
        self.last_walk
            .reset(self.walks.fetch_add(1, Ordering::Relaxed));
        let result = self.engine.walk(
            context.as_ref(),
            &mut frames[..self.depth],
            Some(&self.last_walk),
        );

        self.samples.fetch_add(1, Ordering::Relaxed);
        self.last_stop.store(result.stop as usize, Ordering::Relaxed);

        if result.frames == 0 {
            self.unattributed.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let stack = &frames[..result.frames];
        match self.find_or_create(stack_hash(stack), stack) {
            Some(callsite) => {
                callsite.samples.fetch_add(1, Ordering::Relaxed);
            }
            None => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

extern "C" fn handle_sigprof(
    _sig: libc::c_int,
    _info: *mut libc::siginfo_t,
    ucontext: *mut c_void,
) {
    // One sample at a time across all threads
    if IN_SIGNAL_HANDLER.swap(true, Ordering::SeqCst) {
        return;
    }

    let shared = ACTIVE.load(Ordering::SeqCst);
    // SAFETY: stop() clears ACTIVE and waits for this flag before freeing
    if let Some(shared) = unsafe { shared.as_ref() } {
        shared.sample(ucontext);
    }

    IN_SIGNAL_HANDLER.store(false, Ordering::SeqCst);
}

/// One aggregated stack.
#[derive(Debug, Clone)]
pub struct CallsiteSample {
    pub frames: Vec<usize>,
    pub samples: u64,
}

/// What a sampling session collected.
#[derive(Debug, Clone, Default)]
pub struct SamplerReport {
    pub samples: u64,
    /// Samples whose walk found no managed frame
    pub unattributed: u64,
    /// Samples lost to a full callsite table
    pub dropped: u64,
    /// Most frequent first
    pub callsites: Vec<CallsiteSample>,
    pub last_walk: Vec<UnwindTraceEntry>,
    pub last_walk_overflowed: bool,
    pub last_stop: Option<StopReason>,
}

pub struct SignalSampler {
    shared: *mut SamplerShared,
    previous: SigAction,
}

fn set_timer(interval: Duration) -> Result<()> {
    let tv = libc::timeval {
        tv_sec: interval.as_secs() as libc::time_t,
        tv_usec: interval.subsec_micros() as libc::suseconds_t,
    };
    let timer = libc::itimerval {
        it_interval: tv,
        it_value: tv,
    };

    // SAFETY: plain syscall with a valid struct
    if unsafe { libc::setitimer(libc::ITIMER_PROF, &timer, ptr::null_mut()) } != 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

/// Spawn a thread that never receives `SIGPROF`.
///
/// The signal is blocked on the calling thread while spawning, so the new
/// thread starts with it masked and no sample can land on it before its first
/// instruction. Background threads that take write locks use this; a sample
/// interrupting them would find those locks held.
pub(crate) fn spawn_unsampled<F, T>(name: &str, f: F) -> std::io::Result<JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let mut profiling = SigSet::empty();
    profiling.add(Signal::SIGPROF);
    let mut previous = SigSet::empty();
    pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&profiling), Some(&mut previous))?;

    let spawned = thread::Builder::new().name(name.to_string()).spawn(f);

    if let Err(errno) = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&previous), None) {
        warn!("Failed to restore signal mask after spawning {name}: {errno}");
    }
    spawned
}

const STOP_REASONS: [StopReason; 8] = [
    StopReason::EmptyBuffer,
    StopReason::ContextUnavailable,
    StopReason::GenericInitFailed,
    StopReason::NoManagedFrame,
    StopReason::GenericUnwindFailed,
    StopReason::StepInvalid,
    StopReason::ReadFailed,
    StopReason::BufferFull,
];

impl SignalSampler {
    /// Install the SIGPROF handler and start the profiling timer.
    ///
    /// Only one sampler can run per process.
    pub fn start(engine: Arc<UnwindEngine>, frequency_hz: u32) -> Result<Self> {
        if frequency_hz == 0 || frequency_hz > MAX_FREQUENCY_HZ {
            return Err(Error::InvalidArgument(format!(
                "sampling frequency must be between 1 and {MAX_FREQUENCY_HZ} Hz, got {frequency_hz}"
            )));
        }

        let depth = engine.config().max_stack_depth.min(MAX_SAMPLE_DEPTH);
        let last_walk = engine.diagnostics_log();
        let shared = Box::into_raw(Box::new(SamplerShared {
            engine,
            depth,
            callsites: (0..CALLSITE_CAPACITY).map(|_| Callsite::new()).collect(),
            samples: AtomicU64::new(0),
            unattributed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            walks: AtomicU64::new(0),
            last_walk,
            last_stop: AtomicUsize::new(usize::MAX),
        }));

        if ACTIVE
            .compare_exchange(ptr::null_mut(), shared, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            // SAFETY: never published
            drop(unsafe { Box::from_raw(shared) });
            return Err(Error::Sampler("a sampler is already running".to_string()));
        }

        let action = SigAction::new(
            SigHandler::SigAction(handle_sigprof),
            SaFlags::SA_SIGINFO | SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        // SAFETY: the handler only touches atomics and the published state
        let previous = match unsafe { sigaction(Signal::SIGPROF, &action) } {
            Ok(previous) => previous,
            Err(errno) => {
                ACTIVE.store(ptr::null_mut(), Ordering::SeqCst);
                // SAFETY: the handler was never installed
                drop(unsafe { Box::from_raw(shared) });
                return Err(Error::Signal(errno));
            }
        };

        let sampler = Self { shared, previous };
        // Drop tears the handler down if the timer cannot start
        set_timer(Duration::from_micros(1_000_000 / u64::from(frequency_hz)))?;

        info!("Sampling at {frequency_hz} Hz, {depth} frames per stack");
        Ok(sampler)
    }

    /// Samples taken so far.
    pub fn samples(&self) -> u64 {
        // SAFETY: shared lives until stop/drop
        unsafe { &*self.shared }.samples.load(Ordering::Relaxed)
    }

    /// Stop sampling and collect what was recorded.
    pub fn stop(mut self) -> SamplerReport {
        self.teardown();
        // SAFETY: teardown guarantees no handler can still observe the state
        let shared = unsafe { Box::from_raw(self.shared) };
        self.shared = ptr::null_mut();
        Self::report(&shared)
    }

    fn teardown(&mut self) {
        if let Err(e) = set_timer(Duration::ZERO) {
            warn!("Failed to disable profiling timer: {e}");
        }

        // A SIGPROF already in flight would terminate the process under the
        // default disposition, so that one becomes ignore
        let ignore;
        let restore = if matches!(self.previous.handler(), SigHandler::SigDfl) {
            ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
            &ignore
        } else {
            &self.previous
        };

        // SAFETY: restoring a disposition that was valid before start
        if let Err(errno) = unsafe { sigaction(Signal::SIGPROF, restore) } {
            warn!("Failed to restore SIGPROF disposition: {errno}");
        }

        ACTIVE.store(ptr::null_mut(), Ordering::SeqCst);
        while IN_SIGNAL_HANDLER.load(Ordering::SeqCst) {
            std::thread::yield_now();
        }
        debug!("Sampler stopped");
    }

    fn report(shared: &SamplerShared) -> SamplerReport {
        let mut callsites: Vec<CallsiteSample> = shared
            .callsites
            .iter()
            .filter(|c| c.hash.load(Ordering::Acquire) != 0)
            .map(|c| {
                let depth = c.depth.load(Ordering::Acquire).min(MAX_SAMPLE_DEPTH);
                CallsiteSample {
                    frames: c.frames[..depth]
                        .iter()
                        .map(|f| f.load(Ordering::Relaxed))
                        .collect(),
                    samples: c.samples.load(Ordering::Relaxed),
                }
            })
            .collect();
        callsites.sort_by(|a, b| b.samples.cmp(&a.samples));

        SamplerReport {
            samples: shared.samples.load(Ordering::Relaxed),
            unattributed: shared.unattributed.load(Ordering::Relaxed),
            dropped: shared.dropped.load(Ordering::Relaxed),
            callsites,
            last_walk: shared.last_walk.entries(),
            last_walk_overflowed: shared.last_walk.has_overflow(),
            last_stop: STOP_REASONS
                .get(shared.last_stop.load(Ordering::Relaxed))
                .copied(),
        }
    }
}

impl Drop for SignalSampler {
    fn drop(&mut self) {
        if self.shared.is_null() {
            return;
        }
        self.teardown();
        // SAFETY: teardown guarantees no handler can still observe the state
        drop(unsafe { Box::from_raw(self.shared) });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    #[test]
    fn test_stack_hash_never_zero_and_order_sensitive() {
        assert_ne!(stack_hash(&[]), 0);
        assert_ne!(stack_hash(&[1, 2]), stack_hash(&[2, 1]));
    }

    #[test]
    fn test_stop_reason_table_matches_discriminants() {
        for (i, reason) in STOP_REASONS.iter().enumerate() {
            assert_eq!(*reason as usize, i);
        }
    }

    #[test]
    fn test_spawn_unsampled_masks_only_the_child() {
        let blocked_here = || {
            let mut current = SigSet::empty();
            pthread_sigmask(SigmaskHow::SIG_BLOCK, None, Some(&mut current)).unwrap();
            current.contains(Signal::SIGPROF)
        };

        let before = blocked_here();
        let child = spawn_unsampled("unsampled-test", blocked_here).unwrap();
        assert!(child.join().unwrap());
        assert_eq!(blocked_here(), before);
    }

    #[test]
    fn test_rejects_bad_frequency() {
        let engine = Arc::new(UnwindEngine::new(EngineConfig::default()).unwrap());
        assert!(matches!(
            SignalSampler::start(Arc::clone(&engine), 0),
            Err(Error::InvalidArgument(_))
        ));
        assert!(SignalSampler::start(engine, MAX_FREQUENCY_HZ + 1).is_err());
    }

    #[test]
    fn test_callsite_table_aggregates() {
        let engine = Arc::new(UnwindEngine::new(EngineConfig::default()).unwrap());
        let shared = SamplerShared {
            engine,
            depth: 8,
            callsites: (0..4).map(|_| Callsite::new()).collect(),
            samples: AtomicU64::new(0),
            unattributed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            walks: AtomicU64::new(0),
            last_walk: UnwindDiagnosticsLog::new(4),
            last_stop: AtomicUsize::new(usize::MAX),
        };

        let a = [0x1000usize, 0x2000];
        let first = shared.find_or_create(stack_hash(&a), &a).unwrap() as *const Callsite;
        let again = shared.find_or_create(stack_hash(&a), &a).unwrap() as *const Callsite;
        assert_eq!(first, again);

        for i in 0..3usize {
            let stack = [i + 10];
            assert!(shared.find_or_create(stack_hash(&stack), &stack).is_some());
        }
        let overflow = [99usize];
        assert!(shared.find_or_create(stack_hash(&overflow), &overflow).is_none());

        let report = SignalSampler::report(&shared);
        assert_eq!(report.callsites.len(), 4);
        assert!(report.callsites.iter().any(|c| c.frames == a));
        assert_eq!(report.last_stop, None);
    }
}
