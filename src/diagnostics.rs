//! Fixed-capacity trace of stack walk steps.
//!
//! A walk runs in signal context where nothing can be printed or inspected,
//! so every decision it makes is appended here and read back afterwards.
//! Storage is allocated once at construction; appending never allocates.

use std::fmt;
use std::sync::atomic::{
    AtomicBool, AtomicI32, AtomicU8, AtomicU32, AtomicU64, AtomicUsize, Ordering,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum UnwindEvent {
    GetContextFailed = 0,
    InitFailed,
    GetIpFailed,
    NativeFrame,
    ManagedFrame,
    StepResult,
    ManualFramePointerReadFailed,
    MetadataMiss,
    ManagedViaJitCache,
    ManagedViaModule,
    ManualFramePointerInvalidReturn,
    ManualFramePointerSuccess,
    BufferFull,
    Finish,
}

impl UnwindEvent {
    const ALL: [UnwindEvent; 14] = [
        UnwindEvent::GetContextFailed,
        UnwindEvent::InitFailed,
        UnwindEvent::GetIpFailed,
        UnwindEvent::NativeFrame,
        UnwindEvent::ManagedFrame,
        UnwindEvent::StepResult,
        UnwindEvent::ManualFramePointerReadFailed,
        UnwindEvent::MetadataMiss,
        UnwindEvent::ManagedViaJitCache,
        UnwindEvent::ManagedViaModule,
        UnwindEvent::ManualFramePointerInvalidReturn,
        UnwindEvent::ManualFramePointerSuccess,
        UnwindEvent::BufferFull,
        UnwindEvent::Finish,
    ];

    fn from_u8(raw: u8) -> Option<Self> {
        Self::ALL.get(raw as usize).copied()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UnwindEvent::GetContextFailed => "get-context-failed",
            UnwindEvent::InitFailed => "init-failed",
            UnwindEvent::GetIpFailed => "get-ip-failed",
            UnwindEvent::NativeFrame => "native-frame",
            UnwindEvent::ManagedFrame => "managed-frame",
            UnwindEvent::StepResult => "step-result",
            UnwindEvent::ManualFramePointerReadFailed => "fp-read-failed",
            UnwindEvent::MetadataMiss => "metadata-miss",
            UnwindEvent::ManagedViaJitCache => "managed-via-jit",
            UnwindEvent::ManagedViaModule => "managed-via-module",
            UnwindEvent::ManualFramePointerInvalidReturn => "fp-invalid-return",
            UnwindEvent::ManualFramePointerSuccess => "fp-success",
            UnwindEvent::BufferFull => "buffer-full",
            UnwindEvent::Finish => "finish",
        }
    }
}

impl fmt::Display for UnwindEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnwindTraceEntry {
    pub event: UnwindEvent,
    pub value: usize,
    pub aux: usize,
    pub result: i32,
}

#[derive(Default)]
struct Slot {
    event: AtomicU8,
    value: AtomicUsize,
    aux: AtomicUsize,
    result: AtomicI32,
}

pub struct UnwindDiagnosticsLog {
    slots: Box<[Slot]>,
    count: AtomicUsize,
    overflow: AtomicBool,
    context_id: AtomicU64,
    init_flags: AtomicU32,
}

impl UnwindDiagnosticsLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| Slot::default()).collect(),
            count: AtomicUsize::new(0),
            overflow: AtomicBool::new(false),
            context_id: AtomicU64::new(0),
            init_flags: AtomicU32::new(0),
        }
    }

    /// Clear for a new walk. Only the walking thread may call this.
    pub fn reset(&self, context_id: u64) {
        self.count.store(0, Ordering::Release);
        self.overflow.store(false, Ordering::Relaxed);
        self.init_flags.store(0, Ordering::Relaxed);
        self.context_id.store(context_id, Ordering::Relaxed);
    }

    /// Record one step. Returns `false` when the log is full; the entry is
    /// dropped and the overflow flag stays set until the next reset.
    pub fn append(&self, event: UnwindEvent, value: usize, aux: usize, result: i32) -> bool {
        let n = self.count.load(Ordering::Relaxed);
        let Some(slot) = self.slots.get(n) else {
            self.overflow.store(true, Ordering::Relaxed);
            return false;
        };

        slot.event.store(event as u8, Ordering::Relaxed);
        slot.value.store(value, Ordering::Relaxed);
        slot.aux.store(aux, Ordering::Relaxed);
        slot.result.store(result, Ordering::Relaxed);
        self.count.store(n + 1, Ordering::Release);
        true
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn has_overflow(&self) -> bool {
        self.overflow.load(Ordering::Relaxed)
    }

    pub fn context_id(&self) -> u64 {
        self.context_id.load(Ordering::Relaxed)
    }

    pub fn set_init_flags(&self, flags: u32) {
        self.init_flags.store(flags, Ordering::Relaxed);
    }

    pub fn init_flags(&self) -> u32 {
        self.init_flags.load(Ordering::Relaxed)
    }

    pub fn entry_at(&self, index: usize) -> Option<UnwindTraceEntry> {
        if index >= self.count() {
            return None;
        }
        let slot = &self.slots[index];
        Some(UnwindTraceEntry {
            event: UnwindEvent::from_u8(slot.event.load(Ordering::Relaxed))?,
            value: slot.value.load(Ordering::Relaxed),
            aux: slot.aux.load(Ordering::Relaxed),
            result: slot.result.load(Ordering::Relaxed),
        })
    }

    /// Published entries, oldest first. Allocates; not for signal context.
    pub fn entries(&self) -> Vec<UnwindTraceEntry> {
        (0..self.count()).filter_map(|i| self.entry_at(i)).collect()
    }
}
