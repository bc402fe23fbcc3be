//! Concurrent index of managed code address ranges.
//!
//! Two tiers answer "is this address managed code, and whose":
//!
//! - **Tier 1** holds fine-grained JIT ranges. The address space is cut into
//!   pages of `1 << page_shift` bytes; every page owns a sorted vector of
//!   ranges behind its own reader/writer lock.
//! - **Tier 2** holds coarse executable segments of precompiled modules in one
//!   sorted list, searched only when Tier 1 misses.
//!
//! Lookups may run inside a profiling signal handler. They never allocate and
//! never block: locks are taken with a bounded `try_read` spin, and a lock that
//! stays contended is reported as a miss.
//!
//! Mutations never run on the caller's thread. They are pushed onto a
//! lock-free [`WorkQueue`] and applied by one background worker, which is the
//! only thread that ever holds a shard's write lock. A mutator interrupted by
//! the profiling signal therefore never holds a lock its own handler needs.

pub mod queue;
pub mod range;

pub use queue::WorkQueue;
pub use range::{CodeOwner, CodeRange, MethodId, ModuleCodeRange, ModuleId};

use crate::config::EngineConfig;
use crate::error::Result;
use crate::sampler::spawn_unsampled;
use log::{debug, info, warn};
use range::last_starting_at_or_before;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, TryLockError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Attempts made on a contended lock before a lookup gives up.
const READ_SPIN_LIMIT: u32 = 64;

/// Resolves the exact method range behind an address that only matched a
/// precompiled module. Implemented by the runtime integration.
pub trait MethodResolver {
    fn method_range(&self, addr: usize) -> Option<CodeRange>;
}

impl<F> MethodResolver for F
where
    F: Fn(usize) -> Option<CodeRange>,
{
    fn method_range(&self, addr: usize) -> Option<CodeRange> {
        self(addr)
    }
}

type ModulePredicate = Box<dyn Fn(&ModuleCodeRange) -> bool + Send>;

enum IndexWork {
    Ranges(Vec<CodeRange>),
    Modules(Vec<ModuleCodeRange>),
    RemoveModules(ModulePredicate),
}

#[derive(Default)]
struct PageShard {
    /// Sorted by start address
    ranges: RwLock<Vec<CodeRange>>,
}

struct IndexState {
    page_shift: u32,
    pages: RwLock<HashMap<u64, PageShard>>,
    modules: RwLock<Vec<Arc<ModuleCodeRange>>>,
    queue: WorkQueue<IndexWork>,
    enqueued: AtomicU64,
    applied: AtomicU64,
    range_count: AtomicUsize,
    stop: AtomicBool,
}

pub struct CodeRangeIndex {
    state: Arc<IndexState>,
    worker: Option<JoinHandle<()>>,
}

/// Bounded, non-blocking read acquisition.
#[inline]
pub(crate) fn try_read_spin<T>(lock: &RwLock<T>) -> Option<RwLockReadGuard<'_, T>> {
    for _ in 0..READ_SPIN_LIMIT {
        match lock.try_read() {
            Ok(guard) => return Some(guard),
            Err(TryLockError::Poisoned(poisoned)) => return Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => std::hint::spin_loop(),
        }
    }
    None
}

impl CodeRangeIndex {
    /// Create the index and start its background worker.
    pub fn new(config: &EngineConfig) -> Result<Self> {
        config.validate()?;

        let state = Arc::new(IndexState {
            page_shift: config.page_shift,
            pages: RwLock::new(HashMap::new()),
            modules: RwLock::new(Vec::new()),
            queue: WorkQueue::new(),
            enqueued: AtomicU64::new(0),
            applied: AtomicU64::new(0),
            range_count: AtomicUsize::new(0),
            stop: AtomicBool::new(false),
        });

        let idle_wait = config.worker_idle_wait;
        let worker_state = Arc::clone(&state);
        let worker = spawn_unsampled("code-range-index", move || {
            run_worker(worker_state, idle_wait)
        })?;

        info!(
            "Code range index started ({} KB pages)",
            (1u64 << config.page_shift) / 1024
        );

        Ok(Self {
            state,
            worker: Some(worker),
        })
    }

    /// Owner of `addr`, or `None`. Signal-safe.
    #[inline]
    pub fn lookup(&self, addr: usize) -> Option<CodeOwner> {
        if let Some(method) = self.state.find_method(addr) {
            return Some(CodeOwner::Method(method));
        }
        self.state
            .with_module_at(addr, |module| module.module())
            .map(CodeOwner::Module)
    }

    /// Signal-safe.
    #[inline]
    pub fn is_managed(&self, addr: usize) -> bool {
        self.lookup(addr).is_some()
    }

    /// Live Tier 2 entry covering `addr`.
    pub fn module_range_at(&self, addr: usize) -> Option<Arc<ModuleCodeRange>> {
        self.state.with_module_at(addr, Arc::clone)
    }

    /// Method owning `addr`, promoting a Tier 2 hit into Tier 1.
    ///
    /// Not signal-safe: promotion allocates a work item.
    pub fn resolve(&self, addr: usize, resolver: &dyn MethodResolver) -> Option<MethodId> {
        if let Some(method) = self.state.find_method(addr) {
            return Some(method);
        }

        self.state.with_module_at(addr, |_| ())?;

        let range = resolver.method_range(addr).filter(|r| r.contains(addr))?;
        debug!(
            "Promoting {} [{:#x}, {:#x}) from module tier",
            range.method(),
            range.start(),
            range.end()
        );
        self.register_ranges(vec![range]);
        Some(range.method())
    }

    /// Queue JIT ranges for insertion. Returns immediately.
    pub fn register_ranges(&self, ranges: Vec<CodeRange>) {
        if ranges.is_empty() {
            return;
        }
        self.enqueue(IndexWork::Ranges(ranges));
    }

    /// Queue precompiled module segments for insertion. Returns immediately.
    pub fn register_module_ranges(&self, ranges: Vec<ModuleCodeRange>) {
        if ranges.is_empty() {
            return;
        }
        self.enqueue(IndexWork::Modules(ranges));
    }

    /// Queue tombstoning of every module segment matching `predicate`.
    pub fn remove_module_ranges<F>(&self, predicate: F)
    where
        F: Fn(&ModuleCodeRange) -> bool + Send + 'static,
    {
        self.enqueue(IndexWork::RemoveModules(Box::new(predicate)));
    }

    pub fn remove_module(&self, module: ModuleId) {
        self.remove_module_ranges(move |range| range.module() == module);
    }

    /// Block until everything queued before this call has been applied.
    ///
    /// Must not be called from a signal handler.
    pub fn flush(&self) {
        let target = self.state.enqueued.load(Ordering::Acquire);
        while self.state.applied.load(Ordering::Acquire) < target {
            match &self.worker {
                Some(worker) if !worker.is_finished() => worker.thread().unpark(),
                _ => {
                    warn!(
                        "Code range worker is gone; {} items left unapplied",
                        self.pending_work()
                    );
                    return;
                }
            }
            thread::sleep(Duration::from_micros(200));
        }
    }

    pub fn pending_work(&self) -> u64 {
        let applied = self.state.applied.load(Ordering::Acquire);
        self.state
            .enqueued
            .load(Ordering::Acquire)
            .saturating_sub(applied)
    }

    pub fn page_count(&self) -> usize {
        self.state
            .pages
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// JIT ranges applied so far.
    pub fn range_count(&self) -> usize {
        self.state.range_count.load(Ordering::Relaxed)
    }

    /// Module segments applied so far, tombstoned ones included.
    pub fn module_count(&self) -> usize {
        self.state
            .modules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn page_shift(&self) -> u32 {
        self.state.page_shift
    }

    fn enqueue(&self, work: IndexWork) {
        self.state.enqueued.fetch_add(1, Ordering::AcqRel);
        self.state.queue.push(work);
        if let Some(worker) = &self.worker {
            worker.thread().unpark();
        }
    }
}

impl Drop for CodeRangeIndex {
    fn drop(&mut self) {
        self.state.stop.store(true, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            worker.thread().unpark();
            if worker.join().is_err() {
                warn!("Code range worker panicked");
            }
        }
    }
}

impl IndexState {
    #[inline]
    fn page_of(&self, addr: usize) -> u64 {
        (addr as u64) >> self.page_shift
    }

    fn find_method(&self, addr: usize) -> Option<MethodId> {
        let pages = try_read_spin(&self.pages)?;
        let shard = pages.get(&self.page_of(addr))?;
        let ranges = try_read_spin(&shard.ranges)?;
        let idx = last_starting_at_or_before(&ranges, addr, |r| r.start())?;
        let range = &ranges[idx];
        range.contains(addr).then(|| range.method())
    }

    fn with_module_at<R>(
        &self,
        addr: usize,
        f: impl FnOnce(&Arc<ModuleCodeRange>) -> R,
    ) -> Option<R> {
        let modules = try_read_spin(&self.modules)?;
        let idx = last_starting_at_or_before(&modules, addr, |m| m.start())?;
        // Live segments never overlap, so the closest live one is the only candidate.
        modules[..=idx]
            .iter()
            .rev()
            .find(|module| !module.is_removed())
            .filter(|module| module.contains(addr))
            .map(f)
    }

    fn drain(&self) {
        for work in self.queue.take_all() {
            self.apply(work);
            self.applied.fetch_add(1, Ordering::AcqRel);
        }
    }

    fn apply(&self, work: IndexWork) {
        match work {
            IndexWork::Ranges(ranges) => self.apply_ranges(ranges),
            IndexWork::Modules(modules) => self.apply_modules(modules),
            IndexWork::RemoveModules(predicate) => self.apply_removal(predicate),
        }
    }

    fn ensure_page(&self, page: u64) {
        {
            let pages = self.pages.read().unwrap_or_else(PoisonError::into_inner);
            if pages.contains_key(&page) {
                return;
            }
        }

        let mut pages = self.pages.write().unwrap_or_else(PoisonError::into_inner);
        pages.entry(page).or_default();
    }

    fn apply_ranges(&self, mut ranges: Vec<CodeRange>) {
        ranges.retain(|range| {
            let valid = range.start() < range.end();
            if !valid {
                warn!(
                    "Skipping empty or inverted code range [{:#x}, {:#x}) for {}",
                    range.start(),
                    range.end(),
                    range.method()
                );
            }
            valid
        });
        if ranges.is_empty() {
            return;
        }

        let span = |range: &CodeRange| {
            self.page_of(range.start())..=self.page_of(range.end() - 1)
        };

        let affected: BTreeSet<u64> = ranges.iter().flat_map(span).collect();
        for &page in &affected {
            self.ensure_page(page);
        }

        let pages = self.pages.read().unwrap_or_else(PoisonError::into_inner);
        for page in affected {
            let Some(shard) = pages.get(&page) else {
                continue;
            };

            let mut sorted = shard.ranges.write().unwrap_or_else(PoisonError::into_inner);
            for range in ranges.iter().filter(|r| span(*r).contains(&page)) {
                let pos = sorted.partition_point(|existing| existing.start() <= range.start());
                sorted.insert(pos, *range);
            }
        }

        self.range_count.fetch_add(ranges.len(), Ordering::Relaxed);
        debug!("Applied {} code ranges", ranges.len());
    }

    fn apply_modules(&self, modules: Vec<ModuleCodeRange>) {
        let count = modules.len();

        let mut next = self
            .modules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for module in modules {
            let pos = next.partition_point(|existing| existing.start() <= module.start());
            next.insert(pos, Arc::new(module));
        }

        let previous = {
            let mut current = self.modules.write().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *current, next)
        };
        drop(previous);

        debug!("Applied {count} module code ranges");
    }

    fn apply_removal(&self, predicate: ModulePredicate) {
        let modules = self.modules.read().unwrap_or_else(PoisonError::into_inner);
        let mut removed = 0usize;
        for module in modules.iter().filter(|m| !m.is_removed() && predicate(m)) {
            module.mark_removed();
            removed += 1;
        }
        debug!("Tombstoned {removed} module code ranges");
    }
}

fn run_worker(state: Arc<IndexState>, idle_wait: Duration) {
    debug!("Code range worker running");
    loop {
        // Read the flag before draining so nothing queued ahead of stop is lost.
        let stopping = state.stop.load(Ordering::Acquire);
        state.drain();
        if stopping {
            break;
        }
        thread::park_timeout(idle_wait);
    }
    debug!("Code range worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index() -> CodeRangeIndex {
        CodeRangeIndex::new(&EngineConfig::default()).unwrap()
    }

    fn range(start: usize, end: usize, method: u64) -> CodeRange {
        CodeRange::new(start, end, MethodId(method)).unwrap()
    }

    #[test]
    fn test_adjacent_ranges_scenario() {
        let index = index();
        index.register_ranges(vec![range(0x1000, 0x2000, 0xA), range(0x2000, 0x3000, 0xB)]);
        index.flush();

        assert_eq!(index.lookup(0x1500), Some(CodeOwner::Method(MethodId(0xA))));
        assert_eq!(index.lookup(0x2999), Some(CodeOwner::Method(MethodId(0xB))));
        assert_eq!(index.lookup(0x3000), None);
        assert_eq!(index.lookup(0x0fff), None);
    }

    #[test]
    fn test_empty_registration_is_noop() {
        let index = index();
        index.register_ranges(Vec::new());
        index.register_module_ranges(Vec::new());
        assert_eq!(index.pending_work(), 0);
        index.flush();
        assert_eq!(index.page_count(), 0);
    }

    #[test]
    fn test_range_spanning_pages() {
        let index = index();
        // Three 64KB pages
        index.register_ranges(vec![range(0x1_f000, 0x3_1000, 1)]);
        index.flush();

        assert_eq!(index.page_count(), 3);
        assert_eq!(index.range_count(), 1);
        for addr in [0x1_f000, 0x2_0000, 0x2_ffff, 0x3_0fff] {
            assert_eq!(index.lookup(addr), Some(CodeOwner::Method(MethodId(1))));
        }
        assert_eq!(index.lookup(0x3_1000), None);
    }

    #[test]
    fn test_out_of_order_registration_stays_sorted() {
        let index = index();
        index.register_ranges(vec![range(0x5000, 0x5100, 3)]);
        index.register_ranges(vec![range(0x1000, 0x1100, 1), range(0x3000, 0x3100, 2)]);
        index.flush();

        assert_eq!(index.lookup(0x1050), Some(CodeOwner::Method(MethodId(1))));
        assert_eq!(index.lookup(0x3050), Some(CodeOwner::Method(MethodId(2))));
        assert_eq!(index.lookup(0x5050), Some(CodeOwner::Method(MethodId(3))));
        assert_eq!(index.lookup(0x2000), None);
    }

    #[test]
    fn test_module_tier_fallback() {
        let index = index();
        index.register_module_ranges(vec![
            ModuleCodeRange::new(0x40_0000, 0x50_0000, ModuleId(9)).unwrap(),
        ]);
        index.register_ranges(vec![range(0x40_1000, 0x40_2000, 5)]);
        index.flush();

        // Tier 1 wins where both match
        assert_eq!(index.lookup(0x40_1800), Some(CodeOwner::Method(MethodId(5))));
        assert_eq!(index.lookup(0x48_0000), Some(CodeOwner::Module(ModuleId(9))));
        assert_eq!(index.lookup(0x50_0000), None);
    }

    #[test]
    fn test_remove_module_tombstones() {
        let index = index();
        index.register_module_ranges(vec![
            ModuleCodeRange::new(0x40_0000, 0x50_0000, ModuleId(1)).unwrap(),
            ModuleCodeRange::new(0x60_0000, 0x70_0000, ModuleId(2)).unwrap(),
        ]);
        index.flush();

        let held = index.module_range_at(0x45_0000).unwrap();
        index.remove_module(ModuleId(1));
        index.flush();

        assert!(held.is_removed());
        assert_eq!(index.lookup(0x45_0000), None);
        assert_eq!(index.lookup(0x65_0000), Some(CodeOwner::Module(ModuleId(2))));
        // Tombstoned entries stay in the list
        assert_eq!(index.module_count(), 2);
    }

    #[test]
    fn test_reloaded_module_over_tombstone() {
        let index = index();
        index.register_module_ranges(vec![
            ModuleCodeRange::new(0x40_0000, 0x50_0000, ModuleId(1)).unwrap(),
        ]);
        index.remove_module(ModuleId(1));
        index.register_module_ranges(vec![
            ModuleCodeRange::new(0x40_0000, 0x48_0000, ModuleId(2)).unwrap(),
        ]);
        index.flush();

        assert_eq!(index.lookup(0x41_0000), Some(CodeOwner::Module(ModuleId(2))));
        assert_eq!(index.lookup(0x49_0000), None);
    }

    #[test]
    fn test_resolve_promotes_module_hit() {
        let index = index();
        index.register_module_ranges(vec![
            ModuleCodeRange::new(0x40_0000, 0x50_0000, ModuleId(1)).unwrap(),
        ]);
        index.flush();

        let resolver = |addr: usize| {
            let start = addr & !0xfff;
            CodeRange::new(start, start + 0x100, MethodId(42)).ok()
        };

        assert_eq!(index.resolve(0x41_0010, &resolver), Some(MethodId(42)));
        index.flush();
        assert_eq!(index.lookup(0x41_0010), Some(CodeOwner::Method(MethodId(42))));
        // Only the resolved method was promoted
        assert_eq!(index.lookup(0x41_0200), Some(CodeOwner::Module(ModuleId(1))));
    }

    #[test]
    fn test_resolve_ignores_unmanaged_addresses() {
        let index = index();
        let resolver = |_addr: usize| CodeRange::new(0x1000, 0x2000, MethodId(1)).ok();
        assert_eq!(index.resolve(0x1500, &resolver), None);
        assert_eq!(index.pending_work(), 0);
    }

    #[test]
    fn test_resolve_rejects_range_not_covering_address() {
        let index = index();
        index.register_module_ranges(vec![
            ModuleCodeRange::new(0x40_0000, 0x50_0000, ModuleId(1)).unwrap(),
        ]);
        index.flush();

        let resolver = |_addr: usize| CodeRange::new(0x40_0000, 0x40_0010, MethodId(1)).ok();
        assert_eq!(index.resolve(0x42_0000, &resolver), None);
    }

    #[test]
    fn test_inverted_range_is_skipped() {
        let index = index();
        index.register_ranges(vec![
            CodeRange::new_unchecked(0, 0, MethodId(1)),
            CodeRange::new_unchecked(0x9000, 0x8000, MethodId(2)),
        ]);
        index.register_ranges(vec![range(0x1000, 0x2000, 3)]);
        index.flush();

        assert_eq!(index.pending_work(), 0);
        assert_eq!(index.range_count(), 1);
        assert_eq!(index.lookup(0x1500), Some(CodeOwner::Method(MethodId(3))));
        assert_eq!(index.lookup(0x8800), None);

        // The worker is still alive for later registrations
        index.register_ranges(vec![range(0x4000, 0x5000, 4)]);
        index.flush();
        assert_eq!(index.lookup(0x4800), Some(CodeOwner::Method(MethodId(4))));
    }

    #[test]
    fn test_worker_never_takes_profiling_signal() {
        let index = index();
        // Once work is applied the worker has named itself
        index.register_ranges(vec![range(0x1000, 0x2000, 1)]);
        index.flush();

        let sigprof_bit = 1u64 << (libc::SIGPROF - 1);
        let mut workers = 0;
        for task in std::fs::read_dir("/proc/self/task").unwrap().flatten() {
            let Ok(comm) = std::fs::read_to_string(task.path().join("comm")) else {
                continue;
            };
            // comm is truncated to 15 bytes
            if !comm.trim().starts_with("code-range-in") {
                continue;
            }
            let Ok(status) = std::fs::read_to_string(task.path().join("status")) else {
                continue;
            };
            let blocked = status
                .lines()
                .find_map(|line| line.strip_prefix("SigBlk:"))
                .map(|mask| u64::from_str_radix(mask.trim(), 16).unwrap())
                .unwrap();
            assert_ne!(blocked & sigprof_bit, 0, "SigBlk {blocked:#x}");
            workers += 1;
        }
        assert!(workers >= 1);
    }

    #[test]
    fn test_drop_applies_pending_work() {
        let index = index();
        index.register_ranges(vec![range(0x1000, 0x2000, 1)]);
        drop(index);
    }
}
