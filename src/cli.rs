use crate::sampler::{MAX_FREQUENCY_HZ, MAX_SAMPLE_DEPTH};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "hybridprof")]
#[command(about = "Hybrid managed/native stack unwinding for in-process profilers")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Profile a built-in workload whose functions are registered as managed code
    Selftest {
        /// How long to sample
        #[arg(long, short = 'd', default_value = "2s", value_parser = parse_duration)]
        duration: Duration,

        /// Sampling frequency in Hz
        #[arg(long, short = 'f', default_value = "999")]
        frequency: u32,

        /// Maximum frames recorded per sample
        #[arg(long, default_value = "32")]
        depth: usize,

        /// Number of stacks to display
        #[arg(long, short = 'n', default_value = "10")]
        top: usize,

        /// Address granularity of the index, as log2 bytes
        #[arg(long, default_value = "16")]
        page_shift: u32,
    },

    /// List the executable segments of an ELF file
    Modules {
        /// ELF file to inspect
        path: PathBuf,
    },

    /// List the libraries loaded in this process
    Libraries,

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    if let Ok(d) = humantime::parse_duration(s) {
        return Ok(d);
    }

    // Bare number as seconds
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    Err(format!("Invalid duration '{}'. Examples: 500ms, 2s, 1m, 5", s))
}

impl Cli {
    pub fn validate(&self) -> Result<(), String> {
        if let Command::Selftest {
            duration,
            frequency,
            depth,
            ..
        } = &self.command
        {
            if duration.is_zero() {
                return Err("Duration must be greater than zero".to_string());
            }

            if *frequency == 0 || *frequency > MAX_FREQUENCY_HZ {
                return Err(format!(
                    "Frequency must be between 1 and {} Hz, got {}",
                    MAX_FREQUENCY_HZ, frequency
                ));
            }

            if *depth == 0 || *depth > MAX_SAMPLE_DEPTH {
                return Err(format!(
                    "Depth must be between 1 and {}, got {}",
                    MAX_SAMPLE_DEPTH, depth
                ));
            }
        }

        Ok(())
    }
}
