use std::ffi::{CStr, CString};
use std::fmt;
use std::ops::Range;

use libc::{Elf64_Phdr, dl_phdr_info};

const PT_LOAD: u32 = 1;
const PF_X: u32 = 1;

/// Self-owned copy of one loader-reported shared object.
///
/// Nothing here points into loader memory, so a descriptor stays valid after
/// the library it describes is unloaded.
#[derive(Clone)]
pub struct LibraryDescriptor {
    name: CString,
    base: usize,
    phdrs: Vec<Elf64_Phdr>,
}

impl LibraryDescriptor {
    pub fn new(name: CString, base: usize, phdrs: Vec<Elf64_Phdr>) -> Self {
        Self { name, base, phdrs }
    }

    /// Deep-copy a loader record.
    ///
    /// # Safety
    /// `info` must come from `dl_iterate_phdr` (or be laid out like one) and be
    /// valid for the duration of the call.
    pub unsafe fn from_raw(info: &dl_phdr_info) -> Self {
        let name = if info.dlpi_name.is_null() {
            CString::default()
        } else {
            // SAFETY: the loader hands out NUL-terminated names
            unsafe { CStr::from_ptr(info.dlpi_name) }.to_owned()
        };

        let phdrs = if info.dlpi_phdr.is_null() || info.dlpi_phnum == 0 {
            Vec::new()
        } else {
            // SAFETY: dlpi_phdr points at dlpi_phnum headers
            unsafe { std::slice::from_raw_parts(info.dlpi_phdr, info.dlpi_phnum as usize) }
                .to_vec()
        };

        Self {
            name,
            base: info.dlpi_addr as usize,
            phdrs,
        }
    }

    pub fn name(&self) -> &CStr {
        &self.name
    }

    /// Display name; the main executable reports an empty one.
    pub fn display_name(&self) -> String {
        if self.name.is_empty() {
            "[main]".to_string()
        } else {
            self.name.to_string_lossy().into_owned()
        }
    }

    /// Load bias
    pub fn base(&self) -> usize {
        self.base
    }

    pub fn phdrs(&self) -> &[Elf64_Phdr] {
        &self.phdrs
    }

    /// Same object at the same address.
    pub fn same_identity(&self, other: &LibraryDescriptor) -> bool {
        self.base == other.base && self.name == other.name
    }

    fn loaded_segments(&self) -> impl Iterator<Item = &Elf64_Phdr> {
        self.phdrs.iter().filter(|phdr| phdr.p_type == PT_LOAD)
    }

    fn segment_range(&self, phdr: &Elf64_Phdr) -> Range<usize> {
        let start = self.base.wrapping_add(phdr.p_vaddr as usize);
        start..start.wrapping_add(phdr.p_memsz as usize)
    }

    /// Whether any loaded segment covers `addr`.
    pub fn contains(&self, addr: usize) -> bool {
        self.loaded_segments()
            .any(|phdr| self.segment_range(phdr).contains(&addr))
    }

    /// Runtime ranges of the executable loaded segments.
    pub fn executable_ranges(&self) -> impl Iterator<Item = Range<usize>> + '_ {
        self.loaded_segments()
            .filter(|phdr| phdr.p_flags & PF_X != 0)
            .map(|phdr| self.segment_range(phdr))
    }

    /// Loader-shaped view of this descriptor. The pointers borrow from `self`.
    pub(crate) fn as_phdr_info(&self) -> dl_phdr_info {
        // SAFETY: dl_phdr_info is plain data; all-zero is a valid value
        let mut info: dl_phdr_info = unsafe { std::mem::zeroed() };
        info.dlpi_addr = self.base as _;
        info.dlpi_name = self.name.as_ptr();
        info.dlpi_phdr = self.phdrs.as_ptr();
        info.dlpi_phnum = self.phdrs.len() as _;
        info
    }
}

impl fmt::Debug for LibraryDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LibraryDescriptor")
            .field("name", &self.name)
            .field("base", &format_args!("{:#x}", self.base))
            .field("phdrs", &self.phdrs.len())
            .finish()
    }
}

/// Program header for tests and synthetic snapshots.
pub fn load_segment(vaddr: u64, memsz: u64, executable: bool) -> Elf64_Phdr {
    Elf64_Phdr {
        p_type: PT_LOAD,
        p_flags: if executable { PF_X | 4 } else { 4 },
        p_offset: vaddr,
        p_vaddr: vaddr,
        p_paddr: vaddr,
        p_filesz: memsz,
        p_memsz: memsz,
        p_align: 0x1000,
    }
}
