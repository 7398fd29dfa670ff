use std::{
    io::{BufRead, IsTerminal, Write},
    path::PathBuf,
    process::ExitCode,
    thread,
};

use clap::{Parser, Subcommand};
use log::{error, info, warn};
use rust_wave::{
    archive::clean_scratch, error::IoContext, CancelHandle, Config, Error,
    Progress, Result, Wave, WaveScheduler,
};
use signal_hook::{
    consts::{SIGHUP, SIGINT, SIGTERM},
    iterator::Signals,
};

#[derive(Parser)]
#[command(name = "rust-wave", version, about = "Run waves of ORCA jobs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// run every unit in [START, END] with CONCURRENCY jobs at a time
    Run {
        start: usize,
        end: usize,
        #[arg(default_value_t = 4)]
        concurrency: usize,
        #[arg(long, short, default_value = "wave.toml")]
        config: PathBuf,
    },
    /// split [GLOBAL_START, GLOBAL_END] into consecutive waves
    Waves {
        global_start: usize,
        global_end: usize,
        #[arg(long)]
        chunk_size: usize,
        #[arg(long, default_value_t = 4)]
        concurrency: usize,
    },
    /// count finished and failed units in [START, END]
    Progress {
        start: usize,
        end: usize,
        #[arg(long, short, default_value = "wave.toml")]
        config: PathBuf,
    },
    /// remove everything under the scratch root
    Clean {
        #[arg(long, short, default_value = "wave.toml")]
        config: PathBuf,
        #[arg(long)]
        yes: bool,
    },
}

/// forward SIGTERM, SIGINT, and SIGHUP to the running wave
fn forward_signals(handle: CancelHandle) -> std::io::Result<()> {
    let mut signals = Signals::new([SIGTERM, SIGINT, SIGHUP])?;
    thread::spawn(move || {
        for sig in signals.forever() {
            warn!("caught signal {sig}");
            handle.terminate(sig);
        }
    });
    Ok(())
}

fn run(
    start: usize,
    end: usize,
    concurrency: usize,
    config: PathBuf,
) -> Result<()> {
    let config = Config::load(config)?;
    let mut scheduler = WaveScheduler::new(config);
    forward_signals(scheduler.cancel_handle()).map_err(|e| {
        Error::Config(format!("failed to install signal handlers: {e}"))
    })?;
    let res = scheduler.run_wave(start, end, concurrency)?;
    for f in &res.failures {
        info!(
            "unit {} failed: {}{}",
            f.unit_id,
            f.reason,
            f.primary().map(|p| format!(" ({p})")).unwrap_or_default()
        );
    }
    println!(
        "{} succeeded, {} failed, {} missing input",
        res.succeeded, res.failed, res.skipped_missing_input
    );
    Ok(())
}

fn clean(config: PathBuf, yes: bool) -> Result<()> {
    let config = Config::load(config)?;
    let root = &config.scratch_root;
    if !yes {
        if !std::io::stdin().is_terminal() {
            return Err(Error::Config(
                "refusing to clean without --yes when not on a tty".into(),
            ));
        }
        print!("remove everything under {}? [y/N] ", root.display());
        std::io::stdout().flush().at(root)?;
        let mut line = String::new();
        std::io::stdin().lock().read_line(&mut line).at(root)?;
        if !matches!(line.trim(), "y" | "Y" | "yes") {
            println!("not cleaning");
            return Ok(());
        }
    }
    let n = clean_scratch(root)?;
    println!("removed {n} entries from {}", root.display());
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();
    let res = match cli.command {
        Commands::Run {
            start,
            end,
            concurrency,
            config,
        } => run(start, end, concurrency, config),
        Commands::Waves {
            global_start,
            global_end,
            chunk_size,
            concurrency,
        } => Wave::partition(global_start, global_end, chunk_size, concurrency)
            .map(|waves| {
                for (i, w) in waves.iter().enumerate() {
                    println!("{i:5} {:8} {:8}", w.start, w.end);
                }
            }),
        Commands::Progress { start, end, config } => Config::load(config)
            .map(|config| println!("{}", Progress::scan(&config, start, end))),
        Commands::Clean { config, yes } => clean(config, yes),
    };
    match res {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            eprintln!("{e}");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}
