use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// invalid range, concurrency, or configuration file contents. fatal
    /// before any unit starts
    #[error("config error: {0}")]
    Config(String),

    /// no input file for the unit under any configured method/basis
    #[error("no input found for unit {id} (searched {} paths)", .searched.len())]
    MissingInput { id: usize, searched: Vec<PathBuf> },

    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", .path.display())]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// the controller received a termination signal while units were in flight
    #[error("terminated by signal {0}")]
    Signalled(i32),
}

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// the process exit code the CLI should report for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Signalled(sig) => 128 + sig,
            Error::Config(_) | Error::Toml { .. } => 2,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// attach `path` to an [std::io::Error]
pub trait IoContext<T> {
    fn at(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn at(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|e| Error::io(path, e))
    }
}
