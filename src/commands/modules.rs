use super::format_address;
use crate::elf::ElfImage;
use crate::error::Result;
use crate::index::ModuleId;
use comfy_table::Table;
use std::path::Path;

pub fn run(path: &Path) -> Result<()> {
    let image = ElfImage::open(path)?;
    let segments = image.executable_segments()?;
    let ranges = image.module_code_ranges(0, ModuleId(0))?;

    println!("# {}", path.display());
    if ranges.is_empty() {
        println!("No executable segments");
        return Ok(());
    }

    let mut table = Table::new();
    table.set_header(vec!["START", "END", "SIZE", "FILE OFFSET"]);
    for (range, segment) in ranges.iter().zip(&segments) {
        table.add_row(vec![
            format_address(range.start()),
            format_address(range.end()),
            segment.size.to_string(),
            format!("{:#x}", segment.file_offset),
        ]);
    }
    println!("{table}");

    Ok(())
}
