use std::{
    path::{Path, PathBuf},
    time::Instant,
};

use crate::{affinity::CoreRange, calc::Calc};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum UnitStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl UnitStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, UnitStatus::Succeeded | UnitStatus::Failed)
    }
}

/// One computational task: a single molecule ID computed with the first
/// method/basis whose input could be found
#[derive(Clone, Debug, PartialEq)]
pub struct Unit {
    pub id: usize,

    /// directory-style name, eg `dsgdb9nsd_000053`
    pub key: String,

    /// set once staging has found an input
    pub calc: Option<Calc>,

    /// the unit's private scratch directory
    pub work_dir: PathBuf,

    /// staged input file inside `work_dir`
    pub input: Option<PathBuf>,

    status: UnitStatus,
}

impl Unit {
    pub fn new(id: usize, key: String, work_dir: PathBuf) -> Self {
        Self {
            id,
            key,
            calc: None,
            work_dir,
            input: None,
            status: UnitStatus::Pending,
        }
    }

    pub fn status(&self) -> UnitStatus {
        self.status
    }

    /// move the unit forward to `status`. units never move backward, so a
    /// request to do so is ignored and reported as `false`
    pub fn advance(&mut self, status: UnitStatus) -> bool {
        if status <= self.status
            || (self.status.is_terminal() && status.is_terminal())
        {
            return false;
        }
        self.status = status;
        true
    }

    /// `<key>_<method>_<basis>`, the stem shared by every file the job
    /// produces. falls back to the bare key before staging
    pub fn basename(&self) -> String {
        match &self.calc {
            Some(calc) => format!("{}_{}", self.key, calc.suffix()),
            None => self.key.clone(),
        }
    }

    /// path of the file with `ext` inside the scratch directory
    pub fn scratch_file(&self, ext: &str) -> PathBuf {
        self.work_dir.join(format!("{}.{ext}", self.basename()))
    }

    /// the captured stdout/stderr of the compute job
    pub fn log_path(&self) -> PathBuf {
        self.scratch_file("out")
    }
}

/// A concurrency lane bound to a disjoint set of cores
#[derive(Debug)]
pub struct Slot {
    pub id: usize,
    pub cores: CoreRange,
    pub unit: Option<Unit>,
    pub pid: Option<u32>,
    pub started: Option<Instant>,
}

impl Slot {
    pub fn new(id: usize, cores: CoreRange) -> Self {
        Self {
            id,
            cores,
            unit: None,
            pid: None,
            started: None,
        }
    }

    pub fn is_free(&self) -> bool {
        self.unit.is_none()
    }

    pub fn occupy(&mut self, unit: Unit, pid: u32) {
        self.unit = Some(unit);
        self.pid = Some(pid);
        self.started = Some(Instant::now());
    }

    /// release the bound unit, returning it along with its runtime in seconds
    pub fn release(&mut self) -> Option<(Unit, f64)> {
        let unit = self.unit.take()?;
        self.pid = None;
        let secs = self
            .started
            .take()
            .map(|s| s.elapsed().as_secs_f64())
            .unwrap_or_default();
        Some((unit, secs))
    }
}

/// build the `<prefix><zero-padded id>` key for unit `id`
pub fn unit_key(prefix: &str, width: usize, id: usize) -> String {
    format!("{prefix}{id:0width$}")
}

/// whether `path` has extension `ext`, ignoring case
pub(crate) fn has_ext(path: &Path, ext: &str) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(ext))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calc::{Basis, Method};

    #[test]
    fn key_and_basename() {
        let key = unit_key("dsgdb9nsd_", 6, 53);
        assert_eq!(key, "dsgdb9nsd_000053");
        let mut unit = Unit::new(53, key, PathBuf::from("/scr/dsgdb9nsd_000053"));
        assert_eq!(unit.basename(), "dsgdb9nsd_000053");
        unit.calc = Some(Calc::new(Method::Ccsd, Basis::B631gs));
        assert_eq!(
            unit.log_path(),
            PathBuf::from("/scr/dsgdb9nsd_000053/dsgdb9nsd_000053_ccsd_631gs.out")
        );
    }

    #[test]
    fn never_backward() {
        let mut unit = Unit::new(1, "k".into(), PathBuf::from("/tmp"));
        assert!(unit.advance(UnitStatus::Running));
        assert!(!unit.advance(UnitStatus::Pending));
        assert!(unit.advance(UnitStatus::Failed));
        assert!(!unit.advance(UnitStatus::Succeeded));
        assert!(!unit.advance(UnitStatus::Running));
        assert_eq!(unit.status(), UnitStatus::Failed);
    }

    #[test]
    fn slot_cycle() {
        let mut slot = Slot::new(0, CoreRange { start: 0, end: 2 });
        assert!(slot.is_free());
        slot.occupy(Unit::new(7, "k".into(), PathBuf::from("/tmp")), 42);
        assert!(!slot.is_free());
        let (unit, _secs) = slot.release().unwrap();
        assert_eq!(unit.id, 7);
        assert!(slot.is_free());
        assert!(slot.release().is_none());
    }

    #[test]
    fn ext_ignores_case() {
        assert!(has_ext(Path::new("a/b.GBW"), "gbw"));
        assert!(!has_ext(Path::new("a/b.gbw.tmp"), "gbw"));
    }
}
