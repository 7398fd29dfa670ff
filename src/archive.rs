use std::{
    fs::{self, OpenOptions},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use log::{debug, info, warn};

use crate::{
    classify::{FailureRecord, Outcome},
    config::Config,
    error::{Error, IoContext, Result},
    runner::{program_env, ExitInfo},
    stage::ensure_dir,
    unit::{has_ext, Unit},
};

/// What finalizing a unit left on disk
#[derive(Debug, PartialEq)]
pub enum Archived {
    /// result files copied to the unit's permanent directory
    Results(Vec<PathBuf>),

    /// the failure record was written to this path
    Failure(PathBuf),

    /// nothing to do: already finalized
    Skipped,
}

/// the `.err` file contents for `record`
pub fn render_record(
    unit: &Unit,
    record: &FailureRecord,
    exit: ExitInfo,
) -> String {
    let mut ret = format!(
        "Unit: {}\nJob: {}\nDate: {}\nExit: {exit}\nReason: {}\n",
        unit.id,
        unit.basename(),
        chrono::Local::now().format("%a %b %e %H:%M:%S %Y"),
        record.reason,
    );
    for m in &record.matched {
        ret.push_str(&format!("Matched Error: {m}\n"));
    }
    ret.push_str(&format!("\nLast {} lines:\n", record.excerpt.len()));
    for line in &record.excerpt {
        ret.push_str(line);
        ret.push('\n');
    }
    ret
}

/// rename, falling back to copy and delete across filesystems
fn move_file(from: &Path, to: &Path) -> Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::EXDEV) => {
            fs::copy(from, to).at(to)?;
            fs::remove_file(from).at(from)
        }
        Err(e) => Err(Error::io(to, e)),
    }
}

fn remove_dir(dir: &Path) -> Result<()> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::io(dir, e)),
    }
}

/// the regular files directly inside `dir`
/// remove every entry under the scratch root, returning how many there were
pub fn clean_scratch(root: &Path) -> Result<usize> {
    let entries = match fs::read_dir(root) {
        Ok(e) => e,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(Error::io(root, e)),
    };
    let mut n = 0;
    for entry in entries {
        let path = entry.at(root)?.path();
        if path.is_dir() {
            remove_dir(&path)?;
        } else {
            fs::remove_file(&path).at(&path)?;
        }
        n += 1;
    }
    Ok(n)
}

fn files_in(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut ret = Vec::new();
    for entry in fs::read_dir(dir).at(dir)? {
        let path = entry.at(dir)?.path();
        if path.is_file() {
            ret.push(path);
        }
    }
    ret.sort();
    Ok(ret)
}

/// Moves a classified unit's files to their final places
pub struct Archiver<'a> {
    config: &'a Config,
}

impl<'a> Archiver<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self { config }
    }

    /// finalize `unit` according to `outcome`. running this again on an
    /// already finalized unit does nothing. a failure record is written
    /// even when the unit never got a scratch directory
    pub fn finalize(
        &self,
        unit: &Unit,
        outcome: &Outcome,
        exit: ExitInfo,
    ) -> Result<Archived> {
        if self.config.err_file(&unit.key).exists() {
            debug!("unit {} already has a failure record", unit.id);
            return Ok(Archived::Skipped);
        }
        match outcome {
            Outcome::Succeeded if !unit.work_dir.is_dir() => {
                debug!("unit {} has no scratch directory", unit.id);
                Ok(Archived::Skipped)
            }
            Outcome::Succeeded => self.succeed(unit),
            Outcome::Failed(record) => self.fail(unit, record, exit),
        }
    }

    /// remove the scratch directory of a unit that will never finish
    pub fn discard(&self, unit: &Unit) -> Result<()> {
        debug!("discarding {}", unit.work_dir.display());
        remove_dir(&unit.work_dir)
    }

    /// run the configured converter when the job left a `.gbw` behind.
    /// conversion problems are logged, not fatal
    fn convert(&self, unit: &Unit) {
        let Some(convert) = &self.config.convert else {
            return;
        };
        if !unit.scratch_file("gbw").exists() {
            return;
        }
        let base = unit.basename();
        let mut cmd = Command::new(&convert.program);
        cmd.args(convert.args.iter().map(|a| a.replace("{basename}", &base)))
            .current_dir(&unit.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Some(home) = &self.config.program_home {
            program_env(&mut cmd, home);
        }
        match cmd.status() {
            Ok(s) if s.success() => debug!("converted {base}"),
            Ok(s) => warn!("{} exited with {s} for {base}", convert.program),
            Err(e) => warn!("failed to run {} with {e}", convert.program),
        }
    }

    fn succeed(&self, unit: &Unit) -> Result<Archived> {
        self.convert(unit);
        let mut created = Vec::new();
        let res = self
            .copy_results(unit, &mut created)
            .and_then(|kept| remove_dir(&unit.work_dir).map(|()| kept));
        match res {
            Ok(kept) => {
                info!("unit {} archived {} files", unit.id, kept.len());
                Ok(Archived::Results(kept))
            }
            Err(e) => {
                for path in created.iter().rev() {
                    if let Err(e) = fs::remove_file(path) {
                        warn!("failed to remove {} with {e}", path.display());
                    }
                }
                // only succeeds if nothing else is in there
                let _ = fs::remove_dir(self.config.dest_dir(&unit.key));
                Err(e)
            }
        }
    }

    /// copy the kept and collected files out of scratch, returning the kept
    /// ones. every file this creates is pushed onto `created`
    fn copy_results(
        &self,
        unit: &Unit,
        created: &mut Vec<PathBuf>,
    ) -> Result<Vec<PathBuf>> {
        let dest = self.config.dest_dir(&unit.key);
        ensure_dir(&dest)?;
        let mut kept = Vec::new();
        for file in files_in(&unit.work_dir)? {
            let Some(name) = file.file_name() else {
                continue;
            };
            if let Some((ext, dir)) = self
                .config
                .collect
                .iter()
                .find(|(ext, _)| has_ext(&file, ext))
            {
                ensure_dir(dir)?;
                let to = dir.join(name);
                let fresh = !to.exists();
                fs::copy(&file, &to).at(&to)?;
                if fresh {
                    created.push(to);
                }
                debug!("collected {} into {ext} dir", file.display());
            }
            if !self.config.keep_extensions.iter().any(|e| has_ext(&file, e))
            {
                continue;
            }
            let to = dest.join(name);
            let fresh = !to.exists();
            if !fresh && !self.config.overwrite_results {
                warn!("not overwriting existing {}", to.display());
                continue;
            }
            fs::copy(&file, &to).at(&to)?;
            if fresh {
                created.push(to.clone());
            }
            kept.push(to);
        }
        Ok(kept)
    }

    fn fail(
        &self,
        unit: &Unit,
        record: &FailureRecord,
        exit: ExitInfo,
    ) -> Result<Archived> {
        let err_root = &self.config.err_root;
        ensure_dir(err_root)?;
        let triple = [unit.scratch_file("inp"), unit.log_path()];
        if self.config.relocate_failures {
            for file in triple.iter().filter(|f| f.exists()) {
                if let Some(name) = file.file_name() {
                    move_file(file, &err_root.join(name))?;
                }
            }
            remove_dir(&unit.work_dir)?;
        } else if unit.work_dir.is_dir() {
            for file in files_in(&unit.work_dir)? {
                if !triple.contains(&file) {
                    fs::remove_file(&file).at(&file)?;
                }
            }
        }

        // the record goes last: its existence marks the unit as finalized
        let path = self.config.err_file(&unit.key);
        let mut f = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Ok(Archived::Skipped);
            }
            Err(e) => return Err(Error::io(path, e)),
        };
        f.write_all(render_record(unit, record, exit).as_bytes())
            .at(&path)?;
        warn!("unit {} failed: {}", unit.id, record.reason);
        Ok(Archived::Failure(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        calc::{Basis, Calc, Method},
        classify::FailureReason,
        config::Convert,
    };

    fn setup() -> (tempfile::TempDir, Config, Unit) {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config::under(
            tmp.path(),
            &[Calc::new(Method::Ccsd, Basis::B631gs)],
            "orca",
        );
        let mut unit = config.unit(42);
        unit.calc = Some(config.calcs[0]);
        fs::create_dir_all(&unit.work_dir).unwrap();
        for ext in ["inp", "out", "gbw", "tmp", "densities", "mkl"] {
            fs::write(unit.scratch_file(ext), ext).unwrap();
        }
        (tmp, config, unit)
    }

    fn record() -> FailureRecord {
        FailureRecord {
            unit_id: 42,
            reason: FailureReason::Signature,
            matched: vec!["Segmentation fault".into()],
            excerpt: vec!["a".into(), "Segmentation fault".into()],
        }
    }

    fn names(dir: &Path) -> Vec<String> {
        let mut ret: Vec<_> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        ret.sort();
        ret
    }

    #[test]
    fn success_keeps_results() {
        let (_tmp, config, unit) = setup();
        let archiver = Archiver::new(&config);
        let got = archiver
            .finalize(&unit, &Outcome::Succeeded, ExitInfo::Code(0))
            .unwrap();
        let Archived::Results(kept) = got else {
            panic!("expected results");
        };
        assert_eq!(kept.len(), 3);
        assert_eq!(
            names(&config.dest_dir(&unit.key)),
            vec![
                "dsgdb9nsd_000042_ccsd_631gs.gbw",
                "dsgdb9nsd_000042_ccsd_631gs.mkl",
                "dsgdb9nsd_000042_ccsd_631gs.out",
            ]
        );
        assert!(!unit.work_dir.exists());

        // second run is a no-op
        let again = archiver
            .finalize(&unit, &Outcome::Succeeded, ExitInfo::Code(0))
            .unwrap();
        assert_eq!(again, Archived::Skipped);
        assert_eq!(names(&config.dest_dir(&unit.key)).len(), 3);
    }

    #[test]
    fn success_never_clobbers() {
        let (_tmp, config, unit) = setup();
        let dest = config.dest_dir(&unit.key);
        fs::create_dir_all(&dest).unwrap();
        let out = dest.join("dsgdb9nsd_000042_ccsd_631gs.out");
        fs::write(&out, "earlier result").unwrap();
        Archiver::new(&config)
            .finalize(&unit, &Outcome::Succeeded, ExitInfo::Code(0))
            .unwrap();
        assert_eq!(fs::read_to_string(&out).unwrap(), "earlier result");
    }

    #[test]
    fn success_collects() {
        let (tmp, mut config, unit) = setup();
        config.collect.insert("mkl".into(), tmp.path().join("orca_mkl"));
        Archiver::new(&config)
            .finalize(&unit, &Outcome::Succeeded, ExitInfo::Code(0))
            .unwrap();
        assert_eq!(
            names(&tmp.path().join("orca_mkl")),
            vec!["dsgdb9nsd_000042_ccsd_631gs.mkl"]
        );
    }

    #[test]
    fn failure_leaves_triple() {
        let (_tmp, config, unit) = setup();
        let archiver = Archiver::new(&config);
        let outcome = Outcome::Failed(record());
        let got = archiver
            .finalize(&unit, &outcome, ExitInfo::Signal(11))
            .unwrap();
        let err = config.err_file(&unit.key);
        assert_eq!(got, Archived::Failure(err.clone()));
        assert_eq!(
            names(&config.err_root),
            vec![
                "dsgdb9nsd_000042.err",
                "dsgdb9nsd_000042_ccsd_631gs.inp",
                "dsgdb9nsd_000042_ccsd_631gs.out",
            ]
        );
        assert!(!unit.work_dir.exists());
        assert!(!config.dest_dir(&unit.key).exists());

        let contents = fs::read_to_string(&err).unwrap();
        assert!(contents.starts_with("Unit: 42\nJob: dsgdb9nsd_000042_ccsd_631gs\n"));
        assert!(contents.contains("Exit: signal 11\n"));
        assert!(contents.contains("Matched Error: Segmentation fault\n"));
        assert!(contents.ends_with("Last 2 lines:\na\nSegmentation fault\n"));

        // a second pass neither rewrites nor deletes anything
        fs::create_dir_all(&unit.work_dir).unwrap();
        fs::write(unit.scratch_file("out"), "rerun").unwrap();
        let again = archiver
            .finalize(&unit, &outcome, ExitInfo::Code(0))
            .unwrap();
        assert_eq!(again, Archived::Skipped);
        assert_eq!(fs::read_to_string(&err).unwrap(), contents);
        assert!(unit.scratch_file("out").exists());
    }

    #[test]
    fn failure_in_place() {
        let (_tmp, mut config, unit) = setup();
        config.relocate_failures = false;
        Archiver::new(&config)
            .finalize(&unit, &Outcome::Failed(record()), ExitInfo::Code(1))
            .unwrap();
        assert_eq!(
            names(&unit.work_dir),
            vec![
                "dsgdb9nsd_000042_ccsd_631gs.inp",
                "dsgdb9nsd_000042_ccsd_631gs.out",
            ]
        );
        assert!(config.err_file(&unit.key).exists());
    }

    #[test]
    fn clean_everything() {
        let (tmp, config, unit) = setup();
        fs::write(config.scratch_root.join("stray.tmp"), "").unwrap();
        assert_eq!(clean_scratch(&config.scratch_root).unwrap(), 2);
        assert!(!unit.work_dir.exists());
        assert!(config.scratch_root.exists());
        assert_eq!(clean_scratch(&tmp.path().join("nowhere")).unwrap(), 0);
    }

    #[test]
    fn discard_missing_dir() {
        let (_tmp, config, unit) = setup();
        let archiver = Archiver::new(&config);
        archiver.discard(&unit).unwrap();
        assert!(!unit.work_dir.exists());
        archiver.discard(&unit).unwrap();
    }

    #[test]
    fn failed_copy_rolls_back() {
        let (_tmp, mut config, unit) = setup();
        config.overwrite_results = true;
        let dest = config.dest_dir(&unit.key);
        // a directory can't be overwritten by a copy
        fs::create_dir_all(dest.join("dsgdb9nsd_000042_ccsd_631gs.out"))
            .unwrap();
        let got = Archiver::new(&config).finalize(
            &unit,
            &Outcome::Succeeded,
            ExitInfo::Code(0),
        );
        assert!(got.is_err());
        assert_eq!(names(&dest), vec!["dsgdb9nsd_000042_ccsd_631gs.out"]);
        assert!(unit.scratch_file("gbw").exists());
        assert!(!config.err_file(&unit.key).exists());
    }

    #[test]
    fn failure_without_scratch() {
        let (_tmp, config, unit) = setup();
        fs::remove_dir_all(&unit.work_dir).unwrap();
        let got = Archiver::new(&config)
            .finalize(&unit, &Outcome::Failed(record()), ExitInfo::Code(1))
            .unwrap();
        let err = config.err_file(&unit.key);
        assert_eq!(got, Archived::Failure(err.clone()));
        assert_eq!(names(&config.err_root), vec!["dsgdb9nsd_000042.err"]);
    }

    #[test]
    fn converter_sees_program_home() {
        let (tmp, mut config, unit) = setup();
        let home = tmp.path().join("orca");
        config.program_home = Some(home.clone());
        config.keep_extensions.push("txt".into());
        config.convert = Some(Convert {
            program: "sh".into(),
            args: vec!["-c".into(), "echo \"$PATH\" > env.txt".into()],
        });
        Archiver::new(&config)
            .finalize(&unit, &Outcome::Succeeded, ExitInfo::Code(0))
            .unwrap();
        let got =
            fs::read_to_string(config.dest_dir(&unit.key).join("env.txt"))
                .unwrap();
        let want = format!("{}:", home.join("bin").display());
        assert!(got.starts_with(&want), "{got}");
        if let Ok(path) = std::env::var("PATH") {
            assert!(got.trim_end().ends_with(&path), "{got}");
        }
    }
}
