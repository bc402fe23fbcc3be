//! Owner of every structure a walk consults.
//!
//! Build one engine when profiling starts and drop it when it stops. The
//! engine outlives every walk it serves; the sampler keeps it behind an `Arc`.
//!
//! Besides the index worker, the engine runs a library worker that keeps the
//! library snapshot and the CFI tables in step with the loader. It wakes on
//! [`UnwindEngine::notify_libraries_changed`] or after the configured poll
//! interval, and does nothing unless the loader generation moved.

use crate::config::EngineConfig;
use crate::diagnostics::UnwindDiagnosticsLog;
use crate::error::Result;
use crate::index::{CodeRange, CodeRangeIndex, ModuleCodeRange};
use crate::libraries::{PhdrHookGuard, SharedLibrarySnapshot};
use crate::metadata::{MethodUnwindMetadata, UnwindMetadataRegistry};
use crate::sampler::spawn_unsampled;
use crate::unwind::{
    CfiTables, CfiUnwinder, HybridStackWalker, LocalMemory, RegisterContext, WalkResult,
};
use log::{debug, info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub struct UnwindEngine {
    config: EngineConfig,
    index: CodeRangeIndex,
    registry: UnwindMetadataRegistry,
    libraries: Arc<SharedLibrarySnapshot>,
    cfi: Arc<CfiTables>,
    memory: LocalMemory,
    library_stop: Arc<AtomicBool>,
    library_worker: Option<JoinHandle<()>>,
}

impl UnwindEngine {
    /// Engine over the process loader, with a freshly taken library snapshot.
    pub fn new(config: EngineConfig) -> Result<Self> {
        let libraries = Arc::new(SharedLibrarySnapshot::new());
        libraries.refresh();
        Self::with_libraries(config, libraries)
    }

    pub fn with_libraries(
        config: EngineConfig,
        libraries: Arc<SharedLibrarySnapshot>,
    ) -> Result<Self> {
        config.validate()?;
        let index = CodeRangeIndex::new(&config)?;

        let cfi = Arc::new(CfiTables::new());
        cfi.sync(&libraries.libraries());

        let library_stop = Arc::new(AtomicBool::new(false));
        let library_worker = {
            let libraries = Arc::clone(&libraries);
            let cfi = Arc::clone(&cfi);
            let stop = Arc::clone(&library_stop);
            let interval = config.library_poll_interval;
            spawn_unsampled("library-refresh", move || {
                run_library_worker(&libraries, &cfi, &stop, interval)
            })?
        };

        info!(
            "Unwind engine ready ({} libraries, {} with CFI, max depth {})",
            libraries.len(),
            cfi.module_count(),
            config.max_stack_depth
        );

        Ok(Self {
            config,
            index,
            registry: UnwindMetadataRegistry::new(),
            libraries,
            cfi,
            memory: LocalMemory,
            library_stop,
            library_worker: Some(library_worker),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn index(&self) -> &CodeRangeIndex {
        &self.index
    }

    pub fn registry(&self) -> &UnwindMetadataRegistry {
        &self.registry
    }

    pub fn libraries(&self) -> &Arc<SharedLibrarySnapshot> {
        &self.libraries
    }

    pub fn cfi(&self) -> &CfiTables {
        &self.cfi
    }

    /// Record a freshly compiled method. Metadata is published before the
    /// range so a walker that sees the range also finds its layout.
    pub fn register_method(&self, range: CodeRange, metadata: Option<MethodUnwindMetadata>) {
        self.registry
            .register(metadata.unwrap_or_else(|| MethodUnwindMetadata::new(range)));
        self.index.register_ranges(vec![range]);
    }

    pub fn register_module(&self, ranges: Vec<ModuleCodeRange>) {
        self.index.register_module_ranges(ranges);
    }

    /// Pick up loads and unloads since the last refresh on this thread.
    pub fn refresh_libraries(&self) -> bool {
        let changed = self.libraries.refresh();
        if changed {
            self.cfi.sync(&self.libraries.libraries());
        }
        changed
    }

    /// Wake the library worker, e.g. from a `dlopen`/`dlclose` wrapper that
    /// bumps the loader counter. Returns immediately.
    pub fn notify_libraries_changed(&self) {
        if let Some(worker) = &self.library_worker {
            worker.thread().unpark();
        }
    }

    /// Serve this engine's snapshot through [`crate::libraries::iterate_phdr`].
    pub fn install_phdr_hook(&self) -> Option<PhdrHookGuard> {
        PhdrHookGuard::install(Arc::clone(&self.libraries))
    }

    /// A diagnostics log sized from the configuration.
    pub fn diagnostics_log(&self) -> UnwindDiagnosticsLog {
        UnwindDiagnosticsLog::new(self.config.diagnostics_capacity)
    }

    /// Walk the stack described by `context`, or the caller's stack when
    /// `None`. Signal-safe.
    #[inline(always)]
    pub fn walk(
        &self,
        context: Option<&RegisterContext>,
        out: &mut [usize],
        log: Option<&UnwindDiagnosticsLog>,
    ) -> WalkResult {
        let unwinder = CfiUnwinder::new(&self.cfi, &self.memory).with_libraries(&self.libraries);
        HybridStackWalker::new(&self.index, &self.registry, &unwinder, &self.memory)
            .walk(context, out, log)
    }
}

impl Drop for UnwindEngine {
    fn drop(&mut self) {
        self.library_stop.store(true, Ordering::Release);
        if let Some(worker) = self.library_worker.take() {
            worker.thread().unpark();
            if worker.join().is_err() {
                warn!("Library worker panicked");
            }
        }
    }
}

fn run_library_worker(
    libraries: &SharedLibrarySnapshot,
    cfi: &CfiTables,
    stop: &AtomicBool,
    interval: Duration,
) {
    debug!("Library worker running");
    loop {
        thread::park_timeout(interval);
        if stop.load(Ordering::Acquire) {
            break;
        }
        if libraries.refresh() {
            cfi.sync(&libraries.libraries());
        }
    }
    debug!("Library worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::MethodId;
    use crate::libraries::descriptor::load_segment;
    use crate::libraries::{LibraryDescriptor, PhdrSource};
    use crate::unwind::StopReason;
    use std::ffi::CString;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicU64;
    use std::time::Instant;

    #[derive(Default)]
    struct ScriptedLoader {
        generation: AtomicU64,
        libraries: Mutex<Vec<LibraryDescriptor>>,
    }

    impl PhdrSource for Arc<ScriptedLoader> {
        fn generation(&self) -> u64 {
            self.generation.load(Ordering::SeqCst)
        }

        fn enumerate(&self) -> Vec<LibraryDescriptor> {
            self.libraries.lock().unwrap().clone()
        }
    }

    fn wait_for(what: &str, mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_rejects_invalid_config() {
        let config = EngineConfig::default().with_diagnostics_capacity(0);
        assert!(UnwindEngine::new(config).is_err());
    }

    #[test]
    fn test_register_method_publishes_both() {
        let engine = UnwindEngine::new(EngineConfig::default()).unwrap();
        let range = CodeRange::new(0x1000_0000, 0x1000_0100, MethodId(5)).unwrap();
        engine.register_method(range, None);
        engine.index().flush();

        assert!(engine.index().is_managed(0x1000_0010));
        assert_eq!(engine.registry().find(0x1000_0010).unwrap().method(), MethodId(5));
    }

    #[test]
    fn test_walk_without_managed_code() {
        let engine = UnwindEngine::new(EngineConfig::default()).unwrap();
        let log = engine.diagnostics_log();
        let mut out = [0usize; 16];

        let result = engine.walk(None, &mut out, Some(&log));

        // Nothing registered, so the native stack is skipped entirely
        assert_eq!(result.frames, 0);
        assert!(matches!(
            result.stop,
            StopReason::NoManagedFrame | StopReason::GenericUnwindFailed
        ));
        assert_eq!(log.init_flags(), 0);
        assert!(log.count() > 0);
    }

    #[test]
    fn test_library_worker_follows_loader() {
        let loader = Arc::new(ScriptedLoader::default());
        let snapshot = Arc::new(SharedLibrarySnapshot::with_source(Box::new(Arc::clone(&loader))));
        let config = EngineConfig::default().with_library_poll_interval(Duration::from_secs(60));
        let engine = UnwindEngine::with_libraries(config, snapshot).unwrap();
        assert!(engine.libraries().is_empty());

        // dlopen: the counter moves and the wrapper notifies
        *loader.libraries.lock().unwrap() = vec![LibraryDescriptor::new(
            CString::new("libjit.so").unwrap(),
            0x7000_0000,
            vec![load_segment(0x1000, 0x1000, true)],
        )];
        loader.generation.fetch_add(1, Ordering::SeqCst);
        engine.notify_libraries_changed();

        wait_for("load", || engine.cfi().library_count() == 1);
        assert_eq!(engine.libraries().module_base(0x7000_1800), Some(0x7000_0000));
        // No file behind the fake library, so no CFI either
        assert_eq!(engine.cfi().module_count(), 0);

        // dlclose
        loader.libraries.lock().unwrap().clear();
        loader.generation.fetch_add(1, Ordering::SeqCst);
        engine.notify_libraries_changed();

        wait_for("unload", || engine.cfi().library_count() == 0);
        assert!(engine.libraries().is_empty());
    }

    #[test]
    fn test_library_worker_polls_without_notification() {
        let loader = Arc::new(ScriptedLoader::default());
        let snapshot = Arc::new(SharedLibrarySnapshot::with_source(Box::new(Arc::clone(&loader))));
        let config = EngineConfig::default().with_library_poll_interval(Duration::from_millis(5));
        let engine = UnwindEngine::with_libraries(config, snapshot).unwrap();

        *loader.libraries.lock().unwrap() = vec![LibraryDescriptor::new(
            CString::new("libpolled.so").unwrap(),
            0x7100_0000,
            vec![load_segment(0x1000, 0x1000, true)],
        )];
        loader.generation.fetch_add(1, Ordering::SeqCst);

        wait_for("poll", || engine.libraries().len() == 1);
        drop(engine);
    }
}
