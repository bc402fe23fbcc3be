use anyhow::Context;
use clap::Parser;
use hybridprof::cli::{Cli, Command};
use hybridprof::error::exit_code;
use std::process::ExitCode;

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    match run() {
        Ok(()) => ExitCode::from(exit_code::SUCCESS as u8),
        Err(e) => {
            eprintln!("Error: {e:#}");
            if let Some(err) = e.downcast_ref::<hybridprof::Error>() {
                ExitCode::from(err.exit_code() as u8)
            } else {
                ExitCode::from(exit_code::GENERAL_ERROR as u8)
            }
        }
    }
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    cli.validate()
        .map_err(|e| anyhow::anyhow!("{}", e))
        .context("Invalid arguments")?;

    match cli.command {
        Command::Selftest {
            duration,
            frequency,
            depth,
            top,
            page_shift,
        } => {
            hybridprof::commands::selftest::run(duration, frequency, depth, top, page_shift)?;
        }
        Command::Modules { path } => {
            hybridprof::commands::modules::run(&path)?;
        }
        Command::Libraries => {
            hybridprof::commands::libraries::run()?;
        }
        Command::Completions { shell } => {
            use clap::CommandFactory;
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "hybridprof", &mut std::io::stdout());
        }
    }

    Ok(())
}
