use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use crate::{
    affinity::detect_total_cores,
    calc::Calc,
    classify::{Classifier, Signatures, DEFAULT_EXCERPT_LINES},
    error::{Error, Result},
    unit::{unit_key, Unit},
};

mod raw;

use raw::RawConfig;

/// external post-processing run in the scratch dir of a successful unit
/// that produced a `.gbw`
#[derive(Clone, Debug, PartialEq)]
pub struct Convert {
    pub program: String,
    pub args: Vec<String>,
}

/// Everything the wave scheduler needs, passed in explicitly at
/// construction. Relative paths in a config file are resolved against the
/// file's own directory.
#[derive(Clone, Debug)]
pub struct Config {
    pub source_root: PathBuf,
    pub scratch_root: PathBuf,
    pub dest_root: PathBuf,
    pub err_root: PathBuf,
    pub log_dir: PathBuf,
    pub key_prefix: String,
    pub key_width: usize,
    pub calcs: Vec<Calc>,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub program_home: Option<PathBuf>,
    pub total_cores: usize,
    pub bind_cores: bool,
    pub chunk_size: Option<usize>,
    pub parallel_directive: Option<String>,
    pub aux_extensions: Vec<String>,
    pub keep_extensions: Vec<String>,
    pub terminal_marker: Option<String>,
    pub excerpt_lines: usize,
    pub skip_existing_output: bool,
    pub overwrite_results: bool,
    pub relocate_failures: bool,
    pub signatures: Signatures,
    pub convert: Option<Convert>,

    /// extension -> directory receiving an extra copy of each successful
    /// result with that extension
    pub collect: BTreeMap<String, PathBuf>,

    /// when set, write an OpenMPI rankfile per slot using this many cores
    /// per socket
    pub rankfile_cores_per_socket: Option<usize>,
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.filter(|s| !s.trim().is_empty())
}

fn trim_exts(exts: Vec<String>) -> Vec<String> {
    exts.into_iter()
        .map(|e| e.trim_start_matches('.').to_lowercase())
        .collect()
}

impl Config {
    pub fn load(filename: impl AsRef<Path>) -> Result<Self> {
        let filename = filename.as_ref();
        let raw = RawConfig::load(filename)?;
        let base = filename.parent().unwrap_or_else(|| Path::new(""));
        Self::from_raw(raw, base)
    }

    fn from_raw(raw: RawConfig, base: &Path) -> Result<Self> {
        let resolve = |p: &str| base.join(p);
        let calcs = raw
            .calcs
            .iter()
            .map(|c| c.parse())
            .collect::<Result<Vec<Calc>>>()?;
        let signatures = match &raw.signatures {
            Some(f) => Signatures::load(resolve(f))?,
            None => Signatures::default(),
        };
        let ret = Self {
            source_root: resolve(&raw.source_root),
            scratch_root: resolve(&raw.scratch_root),
            dest_root: resolve(&raw.dest_root),
            err_root: resolve(&raw.err_root),
            log_dir: resolve(&raw.log_dir),
            key_prefix: raw.key_prefix,
            key_width: raw.key_width,
            calcs,
            program: PathBuf::from(raw.program),
            args: raw.args,
            program_home: raw.program_home.map(PathBuf::from),
            total_cores: raw.total_cores.unwrap_or_else(detect_total_cores),
            bind_cores: raw.bind_cores,
            chunk_size: raw.chunk_size,
            parallel_directive: non_empty(raw.parallel_directive),
            aux_extensions: trim_exts(raw.aux_extensions),
            keep_extensions: trim_exts(raw.keep_extensions),
            terminal_marker: non_empty(raw.terminal_marker),
            excerpt_lines: raw.excerpt_lines,
            skip_existing_output: raw.skip_existing_output,
            overwrite_results: raw.overwrite_results,
            relocate_failures: raw.relocate_failures,
            signatures,
            convert: raw.convert.map(|c| Convert {
                program: c.program,
                args: c.args,
            }),
            collect: raw
                .collect
                .into_iter()
                .map(|(ext, dir)| {
                    (ext.trim_start_matches('.').to_lowercase(), resolve(&dir))
                })
                .collect(),
            rankfile_cores_per_socket: raw.rankfile.map(|r| r.cores_per_socket),
        };
        ret.validate()?;
        Ok(ret)
    }

    /// a config with every directory under `root` and defaults elsewhere
    pub fn under(root: &Path, calcs: &[Calc], program: &str) -> Self {
        Self {
            source_root: root.join("source"),
            scratch_root: root.join("scratch"),
            dest_root: root.join("dest"),
            err_root: root.join("err"),
            log_dir: root.join("logs"),
            key_prefix: String::from("dsgdb9nsd_"),
            key_width: 6,
            calcs: calcs.to_vec(),
            program: PathBuf::from(program),
            args: vec![String::from("{input}")],
            program_home: None,
            total_cores: detect_total_cores(),
            bind_cores: true,
            chunk_size: None,
            parallel_directive: Some(String::from("%pal nprocs {n} end")),
            aux_extensions: trim_exts(
                ["gbw", "xyz", "hess", "pc"].map(String::from).to_vec(),
            ),
            keep_extensions: trim_exts(
                ["out", "gbw", "mkl", "xyz", "hess"].map(String::from).to_vec(),
            ),
            terminal_marker: Some(String::from("ORCA TERMINATED NORMALLY")),
            excerpt_lines: DEFAULT_EXCERPT_LINES,
            skip_existing_output: false,
            overwrite_results: false,
            relocate_failures: true,
            signatures: Signatures::default(),
            convert: None,
            collect: BTreeMap::new(),
            rankfile_cores_per_socket: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.calcs.is_empty() {
            return Err(Error::Config("no calcs configured".into()));
        }
        if self.total_cores == 0 {
            return Err(Error::Config("total_cores must be positive".into()));
        }
        if self.chunk_size == Some(0) {
            return Err(Error::Config("chunk_size must be positive".into()));
        }
        if self.excerpt_lines == 0 {
            return Err(Error::Config("excerpt_lines must be positive".into()));
        }
        if self.rankfile_cores_per_socket == Some(0) {
            return Err(Error::Config(
                "rankfile cores_per_socket must be positive".into(),
            ));
        }
        if self.program.as_os_str().is_empty() {
            return Err(Error::Config("program must be set".into()));
        }
        Ok(())
    }

    pub fn key(&self, id: usize) -> String {
        unit_key(&self.key_prefix, self.key_width, id)
    }

    /// a fresh pending unit for `id`, with its scratch directory assigned
    pub fn unit(&self, id: usize) -> Unit {
        let key = self.key(id);
        let work_dir = self.scratch_root.join(&key);
        Unit::new(id, key, work_dir)
    }

    /// `<source_root>/<key>/`
    pub fn source_dir(&self, key: &str) -> PathBuf {
        self.source_root.join(key)
    }

    /// `<dest_root>/<key>/`
    pub fn dest_dir(&self, key: &str) -> PathBuf {
        self.dest_root.join(key)
    }

    /// `<err_root>/<key>.err`, the single source of truth for "this unit
    /// already failed"
    pub fn err_file(&self, key: &str) -> PathBuf {
        self.err_root.join(format!("{key}.err"))
    }

    /// the append-only DONE/FAILED log for the wave `[start, end]`
    pub fn marker_log(&self, start: usize, end: usize) -> PathBuf {
        self.log_dir.join(format!("wave_{start}_{end}.log"))
    }

    pub fn classifier(&self) -> Classifier {
        Classifier::new(
            self.signatures.clone(),
            self.terminal_marker.clone(),
            self.excerpt_lines,
        )
    }

    /// whether archived output already exists for `key` under any calc
    pub fn has_output(&self, key: &str) -> bool {
        let dir = self.dest_dir(key);
        self.calcs
            .iter()
            .any(|c| dir.join(format!("{key}_{}.out", c.suffix())).exists())
    }
}
