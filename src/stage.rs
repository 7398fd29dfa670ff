use std::{
    fs,
    path::{Path, PathBuf},
};

use log::debug;

use crate::{
    config::Config,
    error::{Error, IoContext, Result},
    unit::Unit,
};

/// `mkdir -p`: an existing directory is not an error
pub fn ensure_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).at(dir)
}

/// Copies a unit's pre-generated input into its scratch directory
pub struct Stager<'a> {
    config: &'a Config,
}

impl<'a> Stager<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self { config }
    }

    /// find the first input for `unit` in the configured calc order,
    /// returning the source path and setting `unit.calc`. fails with
    /// [Error::MissingInput] listing every path tried
    pub fn locate(&self, unit: &mut Unit) -> Result<PathBuf> {
        let dir = self.config.source_dir(&unit.key);
        let mut searched = Vec::with_capacity(self.config.calcs.len());
        for calc in &self.config.calcs {
            let path = dir.join(format!("{}_{}.inp", unit.key, calc.suffix()));
            if path.is_file() {
                unit.calc = Some(*calc);
                return Ok(path);
            }
            searched.push(path);
        }
        Err(Error::MissingInput {
            id: unit.id,
            searched,
        })
    }

    /// locate the input for `unit`, copy it and any whitelisted auxiliary
    /// files into `unit.work_dir`, and rewrite its parallelism directive for
    /// `nprocs` cores
    pub fn stage(&self, unit: &mut Unit, nprocs: usize) -> Result<PathBuf> {
        let src = self.locate(unit)?;
        ensure_dir(&unit.work_dir)?;
        let dst = unit.scratch_file("inp");
        fs::copy(&src, &dst).at(&dst)?;
        debug!("staged {} -> {}", src.display(), dst.display());

        let src_dir = src.parent().unwrap_or_else(|| Path::new(""));
        let base = unit.basename();
        for ext in &self.config.aux_extensions {
            let aux = src_dir.join(format!("{base}.{ext}"));
            if aux.is_file() {
                let to = unit.scratch_file(ext);
                fs::copy(&aux, &to).at(&to)?;
                debug!("staged auxiliary {}", aux.display());
            }
        }

        if let Some(directive) = &self.config.parallel_directive {
            let contents = fs::read_to_string(&dst).at(&dst)?;
            let line = directive.replace("{n}", &nprocs.to_string());
            fs::write(&dst, set_directive(&contents, &line)).at(&dst)?;
        }
        unit.input = Some(dst.clone());
        Ok(dst)
    }
}

/// drop every line mentioning `%pal` and put `directive` first
pub fn set_directive(contents: &str, directive: &str) -> String {
    let mut ret = String::with_capacity(contents.len() + directive.len() + 1);
    ret.push_str(directive);
    ret.push('\n');
    for line in contents.lines() {
        if !line.to_lowercase().contains("%pal") {
            ret.push_str(line);
            ret.push('\n');
        }
    }
    ret
}
