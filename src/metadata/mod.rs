//! Per-method frame layout for managed code.
//!
//! The registry is an append-only lock-free list: publishing is a release CAS
//! on the head, lookups walk with acquire loads, and nodes live until the
//! registry is dropped. Lookups are linear; the walker only asks for the
//! handful of managed frames it actually visits.

pub mod prolog;

use crate::index::{CodeRange, MethodId};
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

pub use prolog::PrologSummary;

/// Prologue bytes kept per method
pub const MAX_PROLOG_BYTES: usize = 64;

/// Saved registers recorded per method beyond the frame record
pub const MAX_SAVED_REGISTERS: usize = 16;

/// Offset of the saved frame pointer when nothing better is known
pub const DEFAULT_SAVED_FP_OFFSET: i32 = 0;

/// Offset of the return address when nothing better is known
pub const DEFAULT_SAVED_LR_OFFSET: i32 = size_of::<usize>() as i32;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SavedRegister {
    pub reg: u8,
    pub offset: i32,
}

#[derive(Debug, Clone)]
pub struct MethodUnwindMetadata {
    start: usize,
    end: usize,
    method: MethodId,
    pub frame_size: u32,
    /// Offset from the frame pointer of the caller's frame pointer
    pub saved_fp_offset: Option<i32>,
    /// Offset from the frame pointer of the return address
    pub saved_lr_offset: Option<i32>,
    pub callee_saved_mask: u32,
    saved_registers: [SavedRegister; MAX_SAVED_REGISTERS],
    saved_register_count: u8,
    prolog: [u8; MAX_PROLOG_BYTES],
    prolog_len: u8,
}

impl MethodUnwindMetadata {
    /// Metadata with no layout information; the walker falls back to defaults.
    pub fn new(range: CodeRange) -> Self {
        Self {
            start: range.start(),
            end: range.end(),
            method: range.method(),
            frame_size: 0,
            saved_fp_offset: None,
            saved_lr_offset: None,
            callee_saved_mask: 0,
            saved_registers: [SavedRegister::default(); MAX_SAVED_REGISTERS],
            saved_register_count: 0,
            prolog: [0; MAX_PROLOG_BYTES],
            prolog_len: 0,
        }
    }

    pub fn with_frame_offsets(mut self, fp_offset: i32, lr_offset: i32) -> Self {
        self.saved_fp_offset = Some(fp_offset);
        self.saved_lr_offset = Some(lr_offset);
        self
    }

    /// Derive the layout from the method's AArch64 prologue.
    ///
    /// `code` is the method's leading bytes; at most [`MAX_PROLOG_BYTES`] are
    /// kept and examined.
    pub fn from_prolog(range: CodeRange, code: &[u8]) -> Self {
        let captured = &code[..code.len().min(MAX_PROLOG_BYTES).min(range.len())];
        let summary = prolog::analyze(captured);

        let mut metadata = Self::new(range);
        metadata.frame_size = summary.frame_size;
        metadata.saved_fp_offset = summary.saved_fp_offset;
        metadata.saved_lr_offset = summary.saved_lr_offset;
        metadata.callee_saved_mask = summary.callee_saved_mask;
        for (slot, &(reg, offset)) in metadata
            .saved_registers
            .iter_mut()
            .zip(&summary.saved_registers)
        {
            *slot = SavedRegister { reg, offset };
        }
        metadata.saved_register_count = summary.saved_registers.len() as u8;
        metadata.prolog[..captured.len()].copy_from_slice(captured);
        metadata.prolog_len = captured.len() as u8;
        metadata
    }

    /// Build from a live method body.
    ///
    /// # Safety
    /// `range` must describe mapped, readable code for the duration of the call.
    pub unsafe fn from_code(range: CodeRange) -> Self {
        let len = range.len().min(MAX_PROLOG_BYTES);
        // SAFETY: caller guarantees the range is readable
        let code = unsafe { std::slice::from_raw_parts(range.start() as *const u8, len) };
        Self::from_prolog(range, code)
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn end(&self) -> usize {
        self.end
    }

    pub fn method(&self) -> MethodId {
        self.method
    }

    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end
    }

    #[inline]
    pub fn fp_offset(&self) -> i32 {
        self.saved_fp_offset.unwrap_or(DEFAULT_SAVED_FP_OFFSET)
    }

    #[inline]
    pub fn lr_offset(&self) -> i32 {
        self.saved_lr_offset.unwrap_or(DEFAULT_SAVED_LR_OFFSET)
    }

    pub fn saved_registers(&self) -> &[SavedRegister] {
        &self.saved_registers[..self.saved_register_count as usize]
    }

    pub fn prolog(&self) -> &[u8] {
        &self.prolog[..self.prolog_len as usize]
    }
}

struct Node {
    metadata: MethodUnwindMetadata,
    next: *mut Node,
}

pub struct UnwindMetadataRegistry {
    head: AtomicPtr<Node>,
    len: AtomicUsize,
    _owns: PhantomData<Box<Node>>,
}

// Nodes are immutable once published and freed only in Drop.
unsafe impl Send for UnwindMetadataRegistry {}
unsafe impl Sync for UnwindMetadataRegistry {}

impl UnwindMetadataRegistry {
    pub fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            len: AtomicUsize::new(0),
            _owns: PhantomData,
        }
    }

    /// Publish metadata. Later registrations shadow earlier overlapping ones.
    pub fn register(&self, metadata: MethodUnwindMetadata) {
        let node = Box::into_raw(Box::new(Node {
            metadata,
            next: ptr::null_mut(),
        }));

        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            // SAFETY: node is private until the CAS publishes it
            unsafe { (*node).next = head };
            match self
                .head
                .compare_exchange_weak(head, node, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(current) => head = current,
            }
        }
        self.len.fetch_add(1, Ordering::Relaxed);
    }

    /// Metadata covering `addr`. Lock-free and allocation-free.
    pub fn find(&self, addr: usize) -> Option<&MethodUnwindMetadata> {
        self.iter().find(|metadata| metadata.contains(addr))
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }

    /// Newest first.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            current: self.head.load(Ordering::Acquire),
            _registry: PhantomData,
        }
    }
}

impl Default for UnwindMetadataRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for UnwindMetadataRegistry {
    fn drop(&mut self) {
        let mut current = *self.head.get_mut();
        while !current.is_null() {
            // SAFETY: exclusive access; every node came from Box::into_raw
            let node = unsafe { Box::from_raw(current) };
            current = node.next;
        }
    }
}

pub struct Iter<'a> {
    current: *const Node,
    _registry: PhantomData<&'a UnwindMetadataRegistry>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a MethodUnwindMetadata;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current.is_null() {
            return None;
        }
        // SAFETY: published nodes are immutable and outlive the registry borrow
        let node = unsafe { &*self.current };
        self.current = node.next;
        Some(&node.metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn range(start: usize, end: usize, method: u64) -> CodeRange {
        CodeRange::new(start, end, MethodId(method)).unwrap()
    }

    #[test]
    fn test_register_and_find() {
        let registry = UnwindMetadataRegistry::new();
        registry.register(MethodUnwindMetadata::new(range(0x1000, 0x2000, 1)));
        registry.register(
            MethodUnwindMetadata::new(range(0x3000, 0x4000, 2)).with_frame_offsets(16, 24),
        );

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.find(0x1800).unwrap().method(), MethodId(1));

        let second = registry.find(0x3000).unwrap();
        assert_eq!((second.fp_offset(), second.lr_offset()), (16, 24));
        assert!(registry.find(0x2800).is_none());
    }

    #[test]
    fn test_defaults_without_layout() {
        let metadata = MethodUnwindMetadata::new(range(0x1000, 0x2000, 1));
        assert_eq!(metadata.fp_offset(), 0);
        assert_eq!(metadata.lr_offset(), size_of::<usize>() as i32);
        assert!(metadata.saved_registers().is_empty());
    }

    #[test]
    fn test_newest_registration_shadows() {
        let registry = UnwindMetadataRegistry::new();
        registry.register(MethodUnwindMetadata::new(range(0x1000, 0x2000, 1)));
        registry.register(MethodUnwindMetadata::new(range(0x1000, 0x2000, 2)));
        assert_eq!(registry.find(0x1000).unwrap().method(), MethodId(2));
        assert_eq!(registry.iter().count(), 2);
    }

    #[test]
    fn test_from_prolog_captures_layout() {
        let code: Vec<u8> = [0xa9bf7bfdu32, 0x910003fd, 0xd10083ff, 0xa90153f3]
            .iter()
            .flat_map(|i| i.to_le_bytes())
            .chain(std::iter::repeat_n(0xd5, 100))
            .collect();

        let metadata = MethodUnwindMetadata::from_prolog(range(0x1000, 0x2000, 7), &code);
        assert_eq!(metadata.saved_fp_offset, Some(0));
        assert_eq!(metadata.saved_lr_offset, Some(8));
        assert_eq!(metadata.frame_size, 32);
        assert_eq!(metadata.callee_saved_mask, 0b11);
        assert_eq!(
            metadata.saved_registers(),
            &[
                SavedRegister { reg: 19, offset: 16 },
                SavedRegister { reg: 20, offset: 24 }
            ]
        );
        assert_eq!(metadata.prolog().len(), MAX_PROLOG_BYTES);
        assert_eq!(&metadata.prolog()[..4], &0xa9bf7bfdu32.to_le_bytes());
    }

    #[test]
    fn test_from_prolog_short_method() {
        let code = 0xa9bf7bfdu32.to_le_bytes();
        let metadata = MethodUnwindMetadata::from_prolog(range(0x1000, 0x1004, 1), &code);
        assert_eq!(metadata.prolog().len(), 4);
        assert_eq!(metadata.frame_size, 16);
    }

    #[test]
    fn test_concurrent_registration() {
        let registry = Arc::new(UnwindMetadataRegistry::new());
        let writers: Vec<_> = (0..4usize)
            .map(|t| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    for i in 0..250usize {
                        let start = 0x10_0000 + (t * 250 + i) * 0x100;
                        registry.register(MethodUnwindMetadata::new(range(
                            start,
                            start + 0x100,
                            (t * 250 + i) as u64,
                        )));
                    }
                })
            })
            .collect();

        for writer in writers {
            writer.join().unwrap();
        }

        assert_eq!(registry.len(), 1000);
        for n in 0..1000usize {
            let addr = 0x10_0000 + n * 0x100 + 0x80;
            assert_eq!(registry.find(addr).unwrap().method(), MethodId(n as u64));
        }
    }
}
