use std::{
    collections::HashSet,
    fs::{File, OpenOptions},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
};

use crate::error::{Error, IoContext, Result};

/// The append-only `DONE <id>` / `FAILED <id>` log external wrappers count
/// to decide when to submit the next wave. Each line is flushed as soon as
/// it is written.
#[derive(Debug)]
pub struct MarkerLog {
    path: PathBuf,
    file: File,

    /// ids that already have a line, including ones from earlier runs
    marked: HashSet<usize>,
}

fn parse_line(line: &str) -> Option<(&str, usize)> {
    let mut fields = line.split_whitespace();
    let tag = fields.next()?;
    let id = fields.next()?.parse().ok()?;
    Some((tag, id))
}

impl MarkerLog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_owned();
        if let Some(dir) = path.parent() {
            crate::stage::ensure_dir(dir)?;
        }
        let marked = match std::fs::read_to_string(&path) {
            Ok(s) => {
                s.lines().filter_map(parse_line).map(|(_, id)| id).collect()
            }
            Err(e) if e.kind() == ErrorKind::NotFound => HashSet::new(),
            Err(e) => return Err(Error::io(path, e)),
        };
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .at(&path)?;
        Ok(Self { path, file, marked })
    }

    /// whether `id` already has a line in this log
    pub fn contains(&self, id: usize) -> bool {
        self.marked.contains(&id)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn done(&mut self, id: usize) -> Result<()> {
        self.line("DONE", id)
    }

    pub fn failed(&mut self, id: usize) -> Result<()> {
        self.line("FAILED", id)
    }

    fn line(&mut self, tag: &str, id: usize) -> Result<()> {
        writeln!(self.file, "{tag} {id}").at(&self.path)?;
        self.file.flush().at(&self.path)?;
        self.marked.insert(id);
        Ok(())
    }
}

/// count the `(DONE, FAILED)` lines in a marker log
pub fn count(path: impl AsRef<Path>) -> Result<(usize, usize)> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path).at(path)?;
    let mut done = 0;
    let mut failed = 0;
    for (tag, _) in contents.lines().filter_map(parse_line) {
        match tag {
            "DONE" => done += 1,
            "FAILED" => failed += 1,
            _ => (),
        }
    }
    Ok((done, failed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_across_opens() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("logs/wave_1_3.log");
        let mut log = MarkerLog::open(&path).unwrap();
        log.done(1).unwrap();
        log.failed(2).unwrap();
        drop(log);
        MarkerLog::open(&path).unwrap().done(3).unwrap();
        let got = std::fs::read_to_string(&path).unwrap();
        assert_eq!(got, "DONE 1\nFAILED 2\nDONE 3\n");
        assert_eq!(count(&path).unwrap(), (2, 1));

        let log = MarkerLog::open(&path).unwrap();
        assert!(log.contains(2));
        assert!(!log.contains(4));
    }
}
