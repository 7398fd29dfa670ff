use std::{fs::File, io::BufWriter, path::PathBuf, process::ExitCode};

use clap::Parser;
use log::{error, info};
use rust_wave::{energy, Config};

/// collect final single point energies from archived outputs into a CSV
#[derive(Parser)]
#[command(name = "energies", version)]
struct Args {
    #[arg(long, short, default_value = "wave.toml")]
    config: PathBuf,

    /// write here instead of stdout
    #[arg(long, short)]
    output: Option<PathBuf>,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();
    let config = match Config::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(e.exit_code() as u8);
        }
    };
    let rows = match energy::scan(&config) {
        Ok(rows) => rows,
        Err(e) => {
            error!("failed to read {} with {e}", config.dest_root.display());
            return ExitCode::FAILURE;
        }
    };
    info!("found {} energies", rows.len());
    let res = match &args.output {
        Some(path) => File::create(path)
            .and_then(|f| energy::write_csv(&mut BufWriter::new(f), &rows)),
        None => energy::write_csv(&mut std::io::stdout().lock(), &rows),
    };
    if let Err(e) = res {
        error!("failed to write energies with {e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
