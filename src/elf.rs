//! Code discovery in ELF images: executable segments for the module tier and
//! text symbols for method ranges.

use crate::error::{Error, Result};
use crate::index::{ModuleCodeRange, ModuleId};
use object::{Object, ObjectSection, ObjectSegment, ObjectSymbol, SegmentFlags, SymbolKind};
use std::fs::File;
use std::ops::Range;
use std::path::Path;

/// A `PT_LOAD` segment with execute permission, at its link-time address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutableSegment {
    pub address: u64,
    pub size: u64,
    pub file_offset: u64,
}

/// A function symbol, demangled.
#[derive(Debug, Clone)]
pub struct TextSymbol {
    pub name: String,
    pub address: u64,
    pub size: u64,
}

/// Contents of one section and its link-time address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionData {
    pub address: u64,
    pub data: Vec<u8>,
}

impl SectionData {
    pub fn range(&self) -> Range<u64> {
        self.address..self.address + self.data.len() as u64
    }
}

/// The sections a CFI unwinder needs.
#[derive(Debug, Clone, Default)]
pub struct UnwindSections {
    pub eh_frame: Option<SectionData>,
    pub eh_frame_hdr: Option<SectionData>,
    pub text: Option<Range<u64>>,
}

impl UnwindSections {
    pub fn has_cfi(&self) -> bool {
        self.eh_frame.is_some()
    }
}

/// A memory-mapped ELF file.
pub struct ElfImage {
    path: String,
    mmap: memmap2::Mmap,
}

impl ElfImage {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(Error::Io)?;
        let mmap = unsafe { memmap2::Mmap::map(&file) }.map_err(Error::Io)?;
        Ok(Self {
            path: path.display().to_string(),
            mmap,
        })
    }

    fn parse(&self) -> Result<object::File<'_>> {
        object::File::parse(&*self.mmap).map_err(|source| Error::Elf {
            path: self.path.clone(),
            source,
        })
    }

    pub fn executable_segments(&self) -> Result<Vec<ExecutableSegment>> {
        let object = self.parse()?;

        let segments = object
            .segments()
            .filter(|segment| match segment.flags() {
                SegmentFlags::Elf { p_flags } => p_flags & object::elf::PF_X != 0,
                _ => false,
            })
            .filter(|segment| segment.size() > 0)
            .map(|segment| ExecutableSegment {
                address: segment.address(),
                size: segment.size(),
                file_offset: segment.file_range().0,
            })
            .collect();

        Ok(segments)
    }

    /// Function symbols whose demangled name satisfies `filter`, sorted by address.
    pub fn text_symbols(&self, filter: impl Fn(&str) -> bool) -> Result<Vec<TextSymbol>> {
        let object = self.parse()?;

        let mut symbols: Vec<TextSymbol> = object
            .symbols()
            .filter(|symbol| symbol.kind() == SymbolKind::Text && symbol.size() > 0)
            .filter_map(|symbol| {
                let name = format!("{:#}", rustc_demangle::demangle(symbol.name().ok()?));
                filter(&name).then(|| TextSymbol {
                    name,
                    address: symbol.address(),
                    size: symbol.size(),
                })
            })
            .collect();

        symbols.sort_by_key(|symbol| symbol.address);
        symbols.dedup_by_key(|symbol| symbol.address);
        Ok(symbols)
    }

    /// Copies of `.eh_frame` and `.eh_frame_hdr`, plus the `.text` bounds.
    pub fn unwind_sections(&self) -> Result<UnwindSections> {
        let object = self.parse()?;

        let copy = |name: &str| {
            let section = object.section_by_name(name)?;
            let data = section.data().ok()?;
            (!data.is_empty()).then(|| SectionData {
                address: section.address(),
                data: data.to_vec(),
            })
        };

        Ok(UnwindSections {
            eh_frame: copy(".eh_frame"),
            eh_frame_hdr: copy(".eh_frame_hdr"),
            text: object
                .section_by_name(".text")
                .map(|text| text.address()..text.address() + text.size()),
        })
    }

    /// Module tier entries for this image loaded with load bias `bias`.
    pub fn module_code_ranges(
        &self,
        bias: usize,
        module: ModuleId,
    ) -> Result<Vec<ModuleCodeRange>> {
        self.executable_segments()?
            .into_iter()
            .map(|segment| {
                let start = bias.wrapping_add(segment.address as usize);
                ModuleCodeRange::new(start, start.wrapping_add(segment.size as usize), module)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn own_image() -> ElfImage {
        ElfImage::open(&std::env::current_exe().unwrap()).unwrap()
    }

    #[test]
    fn test_own_executable_has_text_segment() {
        let segments = own_image().executable_segments().unwrap();
        assert!(!segments.is_empty());
    }

    #[test]
    fn test_text_symbols_are_demangled() {
        let symbols = own_image()
            .text_symbols(|name| name.ends_with("test_text_symbols_are_demangled"))
            .unwrap();
        assert!(symbols.iter().all(|s| s.name.contains("elf::tests")));
    }

    #[test]
    fn test_module_ranges_apply_bias() {
        let image = own_image();
        let segments = image.executable_segments().unwrap();
        let ranges = image.module_code_ranges(0x1000, ModuleId(1)).unwrap();
        assert_eq!(ranges.len(), segments.len());
        assert_eq!(ranges[0].start(), segments[0].address as usize + 0x1000);
    }

    #[test]
    fn test_own_executable_carries_cfi() {
        let sections = own_image().unwind_sections().unwrap();
        assert!(sections.has_cfi());
        let hdr = sections.eh_frame_hdr.unwrap();
        // version byte of .eh_frame_hdr
        assert_eq!(hdr.data[0], 1);
        assert!(sections.text.is_some_and(|text| !text.is_empty()));
    }

    #[test]
    fn test_rejects_non_elf() {
        let path =
            std::env::temp_dir().join(format!("hybridprof-not-elf-{}", std::process::id()));
        std::fs::write(&path, b"definitely not an object file").unwrap();
        let result = ElfImage::open(&path).unwrap().executable_segments();
        std::fs::remove_file(&path).ok();
        assert!(matches!(result, Err(Error::Elf { .. })));
    }
}
