use std::{
    fs::read_dir,
    io::{self, Write},
    path::Path,
};

use log::warn;
use rayon::prelude::*;

use crate::{calc::Calc, config::Config, unit::has_ext};

const ENERGY_LABEL: &str = "FINAL SINGLE POINT ENERGY";

/// One converged energy pulled out of an archived output file
#[derive(Clone, Debug, PartialEq)]
pub struct EnergyRow {
    pub key: String,
    pub calc: Calc,

    /// in Hartree
    pub energy: f64,
}

/// the last `FINAL SINGLE POINT ENERGY` in `text`. geometry optimizations
/// print one per cycle, so the last one is the converged value
pub fn parse_energy(text: &str) -> Option<f64> {
    text.lines()
        .rev()
        .filter_map(|line| line.trim().strip_prefix(ENERGY_LABEL))
        .find_map(|rest| rest.split_whitespace().next()?.parse().ok())
}

/// the configured calc whose file name matches `file`, if any
fn calc_for(config: &Config, key: &str, file: &Path) -> Option<Calc> {
    let stem = file.file_stem()?.to_str()?;
    let suffix = stem.strip_prefix(key)?.strip_prefix('_')?;
    config.calcs.iter().copied().find(|c| c.suffix() == suffix)
}

fn scan_dir(config: &Config, dir: &Path, key: &str) -> Vec<EnergyRow> {
    let entries = match read_dir(dir) {
        Ok(e) => e,
        Err(e) => {
            warn!("failed to read {} with {e}", dir.display());
            return Vec::new();
        }
    };
    let mut ret = Vec::new();
    for path in entries.flatten().map(|e| e.path()) {
        if !has_ext(&path, "out") {
            continue;
        }
        let Some(calc) = calc_for(config, key, &path) else {
            continue;
        };
        let text = match std::fs::read(&path) {
            Ok(b) => String::from_utf8_lossy(&b).into_owned(),
            Err(e) => {
                warn!("failed to read {} with {e}", path.display());
                continue;
            }
        };
        match parse_energy(&text) {
            Some(energy) => ret.push(EnergyRow {
                key: key.to_owned(),
                calc,
                energy,
            }),
            None => warn!("no energy in {}", path.display()),
        }
    }
    ret
}

/// collect every energy under `dest_root`, one row per archived output,
/// sorted by key and then calc
pub fn scan(config: &Config) -> io::Result<Vec<EnergyRow>> {
    let mut keys: Vec<String> = read_dir(&config.dest_root)?
        .flatten()
        .filter(|e| e.path().is_dir())
        .filter_map(|e| e.file_name().to_str().map(str::to_owned))
        .collect();
    keys.sort();
    let mut rows: Vec<EnergyRow> = keys
        .par_iter()
        .flat_map_iter(|key| {
            scan_dir(config, &config.dest_dir(key), key).into_iter()
        })
        .collect();
    rows.sort_by(|a, b| {
        a.key.cmp(&b.key).then_with(|| {
            let pos = |c: &Calc| config.calcs.iter().position(|x| x == c);
            pos(&a.calc).cmp(&pos(&b.calc))
        })
    });
    Ok(rows)
}

pub fn write_csv<W: Write>(w: &mut W, rows: &[EnergyRow]) -> io::Result<()> {
    writeln!(w, "key,method,basis,energy_hartree")?;
    for row in rows {
        writeln!(
            w,
            "{},{},{},{:.12}",
            row.key,
            row.calc.method.label(),
            row.calc.basis.label(),
            row.energy
        )?;
    }
    Ok(())
}
