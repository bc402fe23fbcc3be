use super::format_address;
use crate::error::Result;
use crate::libraries::SharedLibrarySnapshot;
use comfy_table::Table;

pub fn run() -> Result<()> {
    let snapshot = SharedLibrarySnapshot::new();
    snapshot.refresh();

    if let Some(generation) = snapshot.generation() {
        println!("# Loader generation {generation}, {} libraries", snapshot.len());
    }

    let mut table = Table::new();
    table.set_header(vec!["BASE", "SEGMENTS", "EXECUTABLE", "NAME"]);
    snapshot.for_each_library(|library| {
        let executable = library
            .executable_ranges()
            .map(|range| format!("{}-{}", format_address(range.start), format_address(range.end)))
            .collect::<Vec<_>>()
            .join("\n");
        table.add_row(vec![
            format_address(library.base()),
            library.phdrs().len().to_string(),
            executable,
            library.display_name(),
        ]);
        true
    });
    println!("{table}");

    Ok(())
}
