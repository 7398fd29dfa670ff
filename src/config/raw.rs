use std::{collections::BTreeMap, path::Path};

use serde::Deserialize;

use crate::error::{Error, IoContext, Result};

fn default_key_prefix() -> String {
    String::from("dsgdb9nsd_")
}

fn default_key_width() -> usize {
    6
}

fn default_args() -> Vec<String> {
    vec![String::from("{input}")]
}

fn yes() -> bool {
    true
}

fn default_directive() -> Option<String> {
    Some(String::from("%pal nprocs {n} end"))
}

fn default_aux() -> Vec<String> {
    ["gbw", "xyz", "hess", "pc"].map(String::from).to_vec()
}

fn default_keep() -> Vec<String> {
    ["out", "gbw", "mkl", "xyz", "hess"].map(String::from).to_vec()
}

fn default_marker() -> Option<String> {
    Some(String::from("ORCA TERMINATED NORMALLY"))
}

fn default_excerpt() -> usize {
    crate::classify::DEFAULT_EXCERPT_LINES
}

/// deserialize into this before validating into a real [super::Config]
#[derive(Deserialize, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub(super) struct RawConfig {
    /// where pre-generated inputs live, one directory per unit key
    pub source_root: String,

    /// per-unit working directories are created under here
    pub scratch_root: String,

    /// successful results are archived to `<dest_root>/<key>/`
    pub dest_root: String,

    /// failure records and preserved failed inputs/outputs
    pub err_root: String,

    /// where the per-wave DONE/FAILED marker logs are written
    pub log_dir: String,

    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    #[serde(default = "default_key_width")]
    pub key_width: usize,

    /// `<method>/<basis>` strings in staging search order
    pub calcs: Vec<String>,

    /// the compute binary
    pub program: String,

    /// arguments to `program`. `{input}` and `{basename}` are substituted
    #[serde(default = "default_args")]
    pub args: Vec<String>,

    /// installation prefix whose `bin` and `lib` are prepended to PATH and
    /// LD_LIBRARY_PATH
    pub program_home: Option<String>,

    pub total_cores: Option<usize>,

    #[serde(default = "yes")]
    pub bind_cores: bool,

    /// the longest wave this node will accept
    pub chunk_size: Option<usize>,

    /// replaces any existing parallelism line in staged inputs. `{n}` is the
    /// slot's core count. an empty string disables the rewrite
    #[serde(default = "default_directive")]
    pub parallel_directive: Option<String>,

    #[serde(default = "default_aux")]
    pub aux_extensions: Vec<String>,

    #[serde(default = "default_keep")]
    pub keep_extensions: Vec<String>,

    /// an empty string disables the check
    #[serde(default = "default_marker")]
    pub terminal_marker: Option<String>,

    #[serde(default = "default_excerpt")]
    pub excerpt_lines: usize,

    #[serde(default)]
    pub skip_existing_output: bool,

    #[serde(default)]
    pub overwrite_results: bool,

    #[serde(default = "yes")]
    pub relocate_failures: bool,

    /// path to a signature list. the built-in list is used when absent
    pub signatures: Option<String>,

    pub convert: Option<RawConvert>,

    #[serde(default)]
    pub collect: BTreeMap<String, String>,

    pub rankfile: Option<RawRankfile>,
}

fn default_convert_program() -> String {
    String::from("orca_2mkl")
}

fn default_convert_args() -> Vec<String> {
    ["{basename}", "-mkl"].map(String::from).to_vec()
}

#[derive(Deserialize, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub(super) struct RawConvert {
    #[serde(default = "default_convert_program")]
    pub program: String,

    #[serde(default = "default_convert_args")]
    pub args: Vec<String>,
}

#[derive(Deserialize, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub(super) struct RawRankfile {
    pub cores_per_socket: usize,
}

impl RawConfig {
    pub fn load(filename: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(filename).at(filename)?;
        toml::from_str(&contents).map_err(|e| Error::Toml {
            path: filename.to_owned(),
            source: e,
        })
    }
}
