//! Profile this binary against itself.
//!
//! The `workload_*` functions below stand in for JIT-compiled methods: their
//! symbol ranges go into the method tier, the rest of the executable's text
//! goes into the module tier. Frames the walk reports from the module tier are
//! resolved through the symbol table afterwards, which promotes them.

use super::format_address;
use crate::config::EngineConfig;
use crate::elf::{ElfImage, TextSymbol};
use crate::engine::UnwindEngine;
use crate::error::{Error, Result};
use crate::index::{CodeRange, MethodId, ModuleId};
use crate::metadata::MethodUnwindMetadata;
use crate::sampler::{SamplerReport, SignalSampler};
use comfy_table::Table;
use log::{debug, info};
use std::collections::{HashMap, HashSet};
use std::hint::black_box;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

const MAIN_MODULE: ModuleId = ModuleId(1);

#[inline(never)]
fn workload_leaf(seed: u64) -> u64 {
    let mut x = seed;
    for i in 0..2_000u64 {
        x = x.rotate_left(5) ^ black_box(i);
    }
    x
}

#[inline(never)]
fn workload_recurse(depth: u32, seed: u64) -> u64 {
    if depth == 0 {
        return workload_leaf(seed);
    }
    let inner = workload_recurse(depth - 1, black_box(seed.wrapping_mul(31)));
    black_box(inner ^ seed)
}

#[inline(never)]
fn workload_entry(seed: u64) -> u64 {
    workload_recurse(6, seed) ^ workload_leaf(seed)
}

/// Executable symbols at their runtime addresses.
struct Symbols {
    symbols: Vec<TextSymbol>,
    bias: usize,
}

impl Symbols {
    fn find(&self, addr: usize) -> Option<&TextSymbol> {
        let addr = addr.checked_sub(self.bias)? as u64;
        let idx = self.symbols.partition_point(|s| s.address <= addr);
        let symbol = self.symbols.get(idx.checked_sub(1)?)?;
        (addr < symbol.address + symbol.size).then_some(symbol)
    }

    fn range_of(&self, symbol: &TextSymbol) -> Option<CodeRange> {
        let start = self.bias + symbol.address as usize;
        CodeRange::with_size(start, symbol.size as usize, MethodId(start as u64)).ok()
    }
}

pub fn run(
    duration: Duration,
    frequency: u32,
    depth: usize,
    top: usize,
    page_shift: u32,
) -> Result<()> {
    let config = EngineConfig::default()
        .with_page_shift(page_shift)
        .with_max_stack_depth(depth);
    let engine = Arc::new(UnwindEngine::new(config)?);

    let exe = std::env::current_exe()?;
    let image = ElfImage::open(&exe)?;

    let bias = engine
        .libraries()
        .libraries()
        .iter()
        .find(|library| library.name().is_empty())
        .map(|library| library.base())
        .ok_or_else(|| {
            Error::UnsupportedPlatform("main executable not in loader list".to_string())
        })?;
    debug!("Main executable loaded at bias {bias:#x}");

    engine.register_module(image.module_code_ranges(bias, MAIN_MODULE)?);

    let symbols = Symbols {
        symbols: image.text_symbols(|_| true)?,
        bias,
    };

    let mut jit = HashSet::new();
    for symbol in symbols.symbols.iter().filter(|s| s.name.contains("selftest::workload_")) {
        let Some(range) = symbols.range_of(symbol) else {
            continue;
        };
        // Prologue analysis decodes AArch64; elsewhere the defaults describe
        // a frame-pointer frame already
        let metadata = cfg!(target_arch = "aarch64").then(|| {
            // SAFETY: the range is this executable's own mapped text
            unsafe { MethodUnwindMetadata::from_code(range) }
        });
        engine.register_method(range, metadata);
        jit.insert(range.method());
    }
    if jit.is_empty() {
        return Err(Error::InvalidArgument(format!(
            "no workload symbols found in {}; is the binary stripped?",
            exe.display()
        )));
    }
    engine.index().flush();
    info!(
        "Registered {} workload methods and {} module ranges",
        jit.len(),
        engine.index().module_count()
    );

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .map_err(|e| Error::Sampler(format!("failed to set Ctrl-C handler: {e}")))?;

    let sampler = SignalSampler::start(Arc::clone(&engine), frequency)?;
    eprintln!(
        "Sampling for {} (Ctrl-C to stop)...",
        humantime::format_duration(duration)
    );

    let start = Instant::now();
    let mut seed = 1u64;
    while running.load(Ordering::SeqCst) && start.elapsed() < duration {
        seed = workload_entry(seed).wrapping_add(1);
    }
    black_box(seed);

    let report = sampler.stop();
    let elapsed = start.elapsed();

    print_summary(&report, elapsed);
    print_stacks(&engine, &symbols, &jit, &report, top);
    print_last_walk(&report);

    Ok(())
}

fn print_summary(report: &SamplerReport, elapsed: Duration) {
    println!(
        "# Duration: {} | Samples: {} | Unattributed: {} | Dropped: {} | Stacks: {}",
        humantime::format_duration(Duration::from_millis(elapsed.as_millis() as u64)),
        report.samples,
        report.unattributed,
        report.dropped,
        report.callsites.len()
    );
    println!();
}

fn describe_frame(
    engine: &UnwindEngine,
    symbols: &Symbols,
    jit: &HashSet<MethodId>,
    names: &HashMap<MethodId, String>,
    addr: usize,
) -> String {
    let resolver = |pc: usize| symbols.find(pc).and_then(|s| symbols.range_of(s));

    match engine.index().resolve(addr, &resolver) {
        Some(method) => {
            let name = names.get(&method).map(String::as_str).unwrap_or("?");
            let tag = if jit.contains(&method) { "jit" } else { "module" };
            format!("{} [{tag}] {name}", format_address(addr))
        }
        None => format!("{} [native]", format_address(addr)),
    }
}

fn print_stacks(
    engine: &UnwindEngine,
    symbols: &Symbols,
    jit: &HashSet<MethodId>,
    report: &SamplerReport,
    top: usize,
) {
    if report.callsites.is_empty() {
        println!("No attributed samples");
        return;
    }

    let names: HashMap<MethodId, String> = symbols
        .symbols
        .iter()
        .filter_map(|s| symbols.range_of(s).map(|r| (r.method(), s.name.clone())))
        .collect();

    let total = report.samples.max(1) as f64;
    let mut table = Table::new();
    table.set_header(vec!["SAMPLES", "%", "STACK"]);

    for callsite in report.callsites.iter().take(top) {
        let stack = callsite
            .frames
            .iter()
            .map(|&addr| describe_frame(engine, symbols, jit, &names, addr))
            .collect::<Vec<_>>()
            .join("\n");
        table.add_row(vec![
            callsite.samples.to_string(),
            format!("{:.1}", callsite.samples as f64 * 100.0 / total),
            stack,
        ]);
    }
    println!("{table}");

    engine.index().flush();
    debug!(
        "{} method ranges after promotion",
        engine.index().range_count()
    );
}

fn print_last_walk(report: &SamplerReport) {
    let Some(stop) = report.last_stop else {
        return;
    };

    println!();
    println!(
        "# Last walk: {}{}",
        stop.as_str(),
        if report.last_walk_overflowed {
            " (diagnostics truncated)"
        } else {
            ""
        }
    );

    let mut table = Table::new();
    table.set_header(vec!["#", "EVENT", "VALUE", "AUX", "RESULT"]);
    for (i, entry) in report.last_walk.iter().enumerate() {
        table.add_row(vec![
            i.to_string(),
            entry.event.to_string(),
            format_address(entry.value),
            format!("{:#x}", entry.aux),
            entry.result.to_string(),
        ]);
    }
    println!("{table}");
}
