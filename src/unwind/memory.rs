//! Raw word reads for stack walking.
//!
//! Every read the walker does goes through [`StackReader::read_word`], so a
//! corrupt frame pointer turns into a failed read instead of a fault.

use std::io::IoSliceMut;

use nix::sys::uio::{RemoteIoVec, process_vm_readv};
use nix::unistd::Pid;

const WORD: usize = size_of::<usize>();

pub trait StackReader {
    /// One machine word at `addr`, or `None` if it cannot be read.
    /// Must be async-signal-safe.
    fn read_word(&self, addr: usize) -> Option<usize>;
}

impl<T: StackReader + ?Sized> StackReader for &T {
    fn read_word(&self, addr: usize) -> Option<usize> {
        (**self).read_word(addr)
    }
}

/// Reads this process's memory through `process_vm_readv`, which reports
/// unmapped addresses as `EFAULT` rather than raising a signal.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalMemory;

impl StackReader for LocalMemory {
    fn read_word(&self, addr: usize) -> Option<usize> {
        if addr == 0 || addr % WORD != 0 {
            return None;
        }

        let mut buf = [0u8; WORD];
        let mut local = [IoSliceMut::new(&mut buf)];
        let remote = [RemoteIoVec {
            base: addr,
            len: WORD,
        }];

        match process_vm_readv(Pid::this(), &mut local, &remote) {
            Ok(WORD) => Some(usize::from_ne_bytes(buf)),
            _ => None,
        }
    }
}

/// A stack image held in memory, addressed as if it started at `base`.
#[derive(Debug, Clone, Copy)]
pub struct SyntheticStack<'a> {
    base: usize,
    words: &'a [usize],
}

impl<'a> SyntheticStack<'a> {
    pub fn new(base: usize, words: &'a [usize]) -> Self {
        Self { base, words }
    }
}

impl StackReader for SyntheticStack<'_> {
    fn read_word(&self, addr: usize) -> Option<usize> {
        let offset = addr.checked_sub(self.base)?;
        if offset % WORD != 0 {
            return None;
        }
        self.words.get(offset / WORD).copied()
    }
}
