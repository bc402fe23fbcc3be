use hybridprof::EngineConfig;
use hybridprof::diagnostics::{UnwindDiagnosticsLog, UnwindEvent};
use hybridprof::index::{CodeRange, CodeRangeIndex, MethodId};
use hybridprof::metadata::UnwindMetadataRegistry;
use hybridprof::unwind::{
    FramePointerUnwinder, HybridStackWalker, RegisterContext, StopReason, SyntheticStack,
};

const STACK: usize = 0x7ff0_0000_0000;
const W: usize = size_of::<usize>();
const FRAME: usize = 0x40;

fn index_with_methods(count: u64) -> CodeRangeIndex {
    let index = CodeRangeIndex::new(&EngineConfig::default()).unwrap();
    let ranges = (0..count)
        .map(|i| {
            let start = 0x40_0000 + i as usize * 0x1000;
            CodeRange::new(start, start + 0x1000, MethodId(i + 1)).unwrap()
        })
        .collect();
    index.register_ranges(ranges);
    index.flush();
    index
}

/// Frame records at STACK, STACK + FRAME, ... Frame `i` returns into method
/// `i + 1`; the last record holds a zero frame pointer and return address.
fn chain(frames: usize) -> Vec<usize> {
    let mut words = vec![0usize; frames * FRAME / W];
    for i in 0..frames - 1 {
        let fp = STACK + i * FRAME;
        words[(fp - STACK) / W] = fp + FRAME;
        words[(fp - STACK) / W + 1] = 0x40_0000 + (i + 1) * 0x1000 + 0x20;
    }
    words
}

#[test]
fn test_five_frame_chain_ends_at_sentinel() {
    let index = index_with_methods(5);
    let registry = UnwindMetadataRegistry::new();
    let words = chain(5);
    let stack = SyntheticStack::new(STACK, &words);
    let unwinder = FramePointerUnwinder::new(&stack);
    let walker = HybridStackWalker::new(&index, &registry, &unwinder, &stack);
    let log = UnwindDiagnosticsLog::new(128);

    let ctx = RegisterContext::new(0x40_0010, STACK, STACK);
    let mut out = [0usize; 16];
    let result = walker.walk(Some(&ctx), &mut out, Some(&log));

    assert_eq!(result.frames, 5);
    assert_eq!(result.stop, StopReason::StepInvalid);
    assert_eq!(
        &out[..5],
        &[0x40_0010, 0x40_1020, 0x40_2020, 0x40_3020, 0x40_4020]
    );

    let entries = log.entries();
    let successes = entries
        .iter()
        .filter(|e| e.event == UnwindEvent::ManualFramePointerSuccess)
        .count();
    assert_eq!(successes, 4);
    assert_eq!(
        entries
            .iter()
            .filter(|e| e.event == UnwindEvent::ManagedViaJitCache)
            .count(),
        5
    );
    let last = entries.last().unwrap();
    assert_eq!(last.event, UnwindEvent::Finish);
    assert_eq!(last.result, 5);
    assert!(!log.has_overflow());
}

#[test]
fn test_corrupted_link_stops_with_partial_stack() {
    let index = index_with_methods(5);
    let registry = UnwindMetadataRegistry::new();
    let mut words = chain(5);
    // Second record points back down the stack
    words[FRAME / W] = STACK;

    let stack = SyntheticStack::new(STACK, &words);
    let unwinder = FramePointerUnwinder::new(&stack);
    let walker = HybridStackWalker::new(&index, &registry, &unwinder, &stack);
    let log = UnwindDiagnosticsLog::new(128);

    let ctx = RegisterContext::new(0x40_0010, STACK, STACK);
    let mut out = [0usize; 16];
    let result = walker.walk(Some(&ctx), &mut out, Some(&log));

    assert_eq!(result.frames, 2);
    assert_eq!(result.stop, StopReason::StepInvalid);
    let rejected = log
        .entries()
        .into_iter()
        .find(|e| e.event == UnwindEvent::ManualFramePointerInvalidReturn)
        .unwrap();
    assert_eq!(rejected.aux, (STACK + FRAME) | 0x1);
}

#[test]
fn test_diagnostics_saturate_without_affecting_walk() {
    let index = index_with_methods(5);
    let registry = UnwindMetadataRegistry::new();
    let words = chain(5);
    let stack = SyntheticStack::new(STACK, &words);
    let unwinder = FramePointerUnwinder::new(&stack);
    let walker = HybridStackWalker::new(&index, &registry, &unwinder, &stack);

    let capacity = 4;
    let log = UnwindDiagnosticsLog::new(capacity);
    log.reset(42);

    let ctx = RegisterContext::new(0x40_0010, STACK, STACK);
    let mut out = [0usize; 16];
    let result = walker.walk(Some(&ctx), &mut out, Some(&log));

    assert_eq!(result.frames, 5);
    assert_eq!(log.count(), capacity);
    assert!(log.has_overflow());
    assert_eq!(log.context_id(), 42);
    assert_eq!(log.entries().len(), capacity);
    assert!(log.entry_at(capacity).is_none());
    assert!(!log.append(UnwindEvent::Finish, 0, 0, 0));

    log.reset(43);
    assert_eq!(log.count(), 0);
    assert!(!log.has_overflow());
}

#[test]
fn test_same_walk_with_and_without_log() {
    let index = index_with_methods(5);
    let registry = UnwindMetadataRegistry::new();
    let words = chain(5);
    let stack = SyntheticStack::new(STACK, &words);
    let unwinder = FramePointerUnwinder::new(&stack);
    let walker = HybridStackWalker::new(&index, &registry, &unwinder, &stack);
    let ctx = RegisterContext::new(0x40_0010, STACK, STACK);

    let log = UnwindDiagnosticsLog::new(2);
    let mut logged = [0usize; 16];
    let mut silent = [0usize; 16];
    let a = walker.walk(Some(&ctx), &mut logged, Some(&log));
    let b = walker.walk(Some(&ctx), &mut silent, None);

    assert_eq!(a, b);
    assert_eq!(logged, silent);
}
