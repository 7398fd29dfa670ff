//! The top-level loop: fill every slot, wait for any job to finish, finalize
//! it, and refill the slot until the range is exhausted.

use std::{
    collections::VecDeque,
    fmt::Display,
    sync::{
        atomic::{AtomicI32, Ordering},
        mpsc::{channel, Receiver, RecvTimeoutError, Sender},
        Arc,
    },
    time::Duration,
};

use log::{debug, error, info, warn};

use crate::{
    affinity::{allocate, bindable_cpus},
    archive::{Archived, Archiver},
    classify::{Classifier, FailureReason, FailureRecord, Outcome},
    config::Config,
    error::{Error, Result},
    marker::MarkerLog,
    runner::{signal_group, ExitInfo, Runner},
    stage::{ensure_dir, Stager},
    unit::{Slot, Unit, UnitStatus},
};

/// how long running jobs get to exit after SIGTERM before SIGKILL
const TERM_GRACE: Duration = Duration::from_secs(10);

/// A contiguous range of unit IDs processed under one concurrency level
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Wave {
    pub start: usize,
    pub end: usize,
    pub concurrency: usize,
}

impl Wave {
    pub fn new(start: usize, end: usize, concurrency: usize) -> Result<Self> {
        if start > end {
            return Err(Error::Config(format!(
                "wave start {start} is past its end {end}"
            )));
        }
        if concurrency == 0 {
            return Err(Error::Config("concurrency must be positive".into()));
        }
        Ok(Self {
            start,
            end,
            concurrency,
        })
    }

    pub fn len(&self) -> usize {
        self.end - self.start + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn ids(&self) -> std::ops::RangeInclusive<usize> {
        self.start..=self.end
    }

    /// split `[global_start, global_end]` into consecutive waves of
    /// `chunk_size` units. only the last wave can be shorter
    pub fn partition(
        global_start: usize,
        global_end: usize,
        chunk_size: usize,
        concurrency: usize,
    ) -> Result<Vec<Wave>> {
        if chunk_size == 0 {
            return Err(Error::Config("chunk_size must be positive".into()));
        }
        Wave::new(global_start, global_end, concurrency)?;
        let mut ret = Vec::new();
        let mut start = global_start;
        while start <= global_end {
            let end = global_end.min(start + chunk_size - 1);
            ret.push(Wave::new(start, end, concurrency)?);
            start = end + 1;
        }
        Ok(ret)
    }
}

impl Display for Wave {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}] x{}", self.start, self.end, self.concurrency)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaveState {
    Init,
    Filling,
    Running,
    Draining,
    Done,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct WaveResult {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped_missing_input: usize,

    /// failure records produced by this run
    pub failures: Vec<FailureRecord>,

    /// number of compute processes started
    pub spawned: usize,

    /// units counted in `failed` because a record already existed
    pub previously_failed: usize,

    /// units counted in `succeeded` because output already existed
    pub previously_succeeded: usize,
}

impl WaveResult {
    pub fn total(&self) -> usize {
        self.succeeded + self.failed + self.skipped_missing_input
    }
}

/// completion counts over a range, from what is on disk
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Progress {
    pub archived: usize,
    pub failed: usize,
    pub total: usize,
}

impl Progress {
    pub fn scan(config: &Config, start: usize, end: usize) -> Self {
        let mut ret = Self::default();
        for id in start..=end {
            let key = config.key(id);
            ret.total += 1;
            if config.err_file(&key).exists() {
                ret.failed += 1;
            } else if config.has_output(&key) {
                ret.archived += 1;
            }
        }
        ret
    }
}

impl Display for Progress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let done = self.archived + self.failed;
        let pct = if self.total == 0 {
            100.0
        } else {
            100.0 * done as f64 / self.total as f64
        };
        write!(
            f,
            "Progress: {done}/{} units done ({pct:.1}%), {} failed",
            self.total, self.failed
        )
    }
}

enum Event {
    Exited { slot: usize, status: ExitInfo },

    /// sent after the termination flag is set so a blocked controller wakes
    Wake,
}

/// Asks a running wave to stop. Cloneable and sendable, typically handed to
/// a signal-forwarding thread
#[derive(Clone)]
pub struct CancelHandle {
    signal: Arc<AtomicI32>,
    tx: Sender<Event>,
}

impl CancelHandle {
    pub fn terminate(&self, sig: i32) {
        self.signal.store(sig, Ordering::SeqCst);
        let _ = self.tx.send(Event::Wake);
    }
}

/// Owns one node's concurrency pool
pub struct WaveScheduler {
    config: Config,
    signal: Arc<AtomicI32>,
    tx: Sender<Event>,
    rx: Receiver<Event>,
}

impl WaveScheduler {
    pub fn new(config: Config) -> Self {
        let (tx, rx) = channel();
        Self {
            config,
            signal: Arc::new(AtomicI32::new(0)),
            tx,
            rx,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            signal: self.signal.clone(),
            tx: self.tx.clone(),
        }
    }

    /// run every unit in `[start_id, end_id]` with `concurrency` jobs at a
    /// time. individual unit failures are reported in the result, not as
    /// errors. the only errors are configuration problems, which happen
    /// before any job starts, and [Error::Signalled]
    pub fn run_wave(
        &mut self,
        start_id: usize,
        end_id: usize,
        concurrency: usize,
    ) -> Result<WaveResult> {
        let wave = Wave::new(start_id, end_id, concurrency)?;
        let mut controller = Controller::init(
            &self.config,
            wave,
            self.tx.clone(),
            &self.signal,
        )?;
        controller.run(&self.rx)
    }
}

/// check everything that can be checked before touching any unit
fn validate(config: &Config, wave: &Wave) -> Result<()> {
    config.validate()?;
    if let Some(chunk) = config.chunk_size {
        if wave.len() > chunk {
            return Err(Error::Config(format!(
                "wave {wave} has {} units, more than chunk_size {chunk}",
                wave.len()
            )));
        }
    }
    if config.bind_cores {
        bindable_cpus(config.total_cores)?;
    }
    let program = &config.program;
    if program.components().count() > 1 && !program.is_file() {
        return Err(Error::Config(format!(
            "compute program {} does not exist",
            program.display()
        )));
    }
    Ok(())
}

/// the state of one wave in progress
struct Controller<'a> {
    config: &'a Config,
    wave: Wave,
    state: WaveState,
    stager: Stager<'a>,
    runner: Runner<'a>,
    archiver: Archiver<'a>,
    classifier: Classifier,
    slots: Vec<Slot>,
    pending: VecDeque<usize>,
    marker: MarkerLog,
    result: WaveResult,
    tx: Sender<Event>,
    signal: &'a AtomicI32,
}

impl<'a> Controller<'a> {
    fn init(
        config: &'a Config,
        wave: Wave,
        tx: Sender<Event>,
        signal: &'a AtomicI32,
    ) -> Result<Self> {
        debug!("wave {wave}: {:?}", WaveState::Init);
        validate(config, &wave)?;
        let ranges = allocate(config.total_cores, wave.concurrency)?;
        info!(
            "{} cores -> {} slots x {} cores",
            config.total_cores,
            wave.concurrency,
            ranges[0].len()
        );
        for dir in [&config.scratch_root, &config.err_root, &config.log_dir] {
            ensure_dir(dir)?;
        }
        let marker = MarkerLog::open(config.marker_log(wave.start, wave.end))?;
        Ok(Self {
            config,
            wave,
            state: WaveState::Init,
            stager: Stager::new(config),
            runner: Runner::new(config),
            archiver: Archiver::new(config),
            classifier: config.classifier(),
            slots: ranges
                .into_iter()
                .enumerate()
                .map(|(i, r)| Slot::new(i, r))
                .collect(),
            pending: wave.ids().collect(),
            marker,
            result: WaveResult::default(),
            tx,
            signal,
        })
    }

    fn set_state(&mut self, state: WaveState) {
        debug!("wave {}: {:?} -> {:?}", self.wave, self.state, state);
        self.state = state;
    }

    fn terminating(&self) -> Option<i32> {
        match self.signal.load(Ordering::SeqCst) {
            0 => None,
            sig => Some(sig),
        }
    }

    fn occupied(&self) -> usize {
        self.slots.iter().filter(|s| !s.is_free()).count()
    }

    fn run(&mut self, rx: &Receiver<Event>) -> Result<WaveResult> {
        self.log_progress();
        self.set_state(WaveState::Filling);
        for slot in 0..self.slots.len() {
            self.fill(slot);
        }
        self.set_state(if self.pending.is_empty() {
            WaveState::Draining
        } else {
            WaveState::Running
        });

        loop {
            if let Some(sig) = self.terminating() {
                return Err(self.cancel(rx, sig));
            }
            if self.occupied() == 0 {
                break;
            }
            match rx.recv() {
                Ok(Event::Exited { slot, status }) => {
                    self.complete(slot, status);
                    self.fill(slot);
                    if self.pending.is_empty()
                        && self.state == WaveState::Running
                    {
                        self.set_state(WaveState::Draining);
                    }
                }
                Ok(Event::Wake) => (),
                // unreachable while self.tx is alive
                Err(_) => break,
            }
        }

        self.set_state(WaveState::Done);
        info!(
            "wave {} done: {} succeeded, {} failed, {} missing input",
            self.wave,
            self.result.succeeded,
            self.result.failed,
            self.result.skipped_missing_input
        );
        self.log_progress();
        Ok(std::mem::take(&mut self.result))
    }

    fn log_progress(&self) {
        let Wave { start, end, .. } = self.wave;
        info!("{}", Progress::scan(self.config, start, end));
    }

    fn mark(&mut self, id: usize, ok: bool) {
        let res = if ok {
            self.marker.done(id)
        } else {
            self.marker.failed(id)
        };
        if let Err(e) = res {
            error!("failed to record unit {id}: {e}");
        }
    }

    /// count `unit` as failed with `record`, persisting the record
    fn fail_unit(
        &mut self,
        mut unit: Unit,
        record: FailureRecord,
        exit: ExitInfo,
    ) {
        unit.advance(UnitStatus::Failed);
        let outcome = Outcome::Failed(record);
        if let Err(e) = self.archiver.finalize(&unit, &outcome, exit) {
            error!("failed to archive unit {}: {e}", unit.id);
        }
        if let Outcome::Failed(record) = outcome {
            self.result.failures.push(record);
        }
        self.result.failed += 1;
        self.mark(unit.id, false);
    }

    /// start the next runnable pending unit on `slot`. units that resolve
    /// without running (already failed, missing input, spawn errors) are
    /// finalized here and the next one is tried
    fn fill(&mut self, slot: usize) {
        let nprocs = self.slots[slot].cores.len();
        while self.terminating().is_none() {
            let Some(id) = self.pending.pop_front() else {
                return;
            };
            let mut unit = self.config.unit(id);
            if self.config.err_file(&unit.key).exists() {
                info!("unit {id} already has a failure record, skipping");
                self.result.failed += 1;
                self.result.previously_failed += 1;
                continue;
            }
            if self.config.skip_existing_output
                && self.config.has_output(&unit.key)
            {
                info!("unit {id} already has output, skipping");
                self.result.succeeded += 1;
                self.result.previously_succeeded += 1;
                continue;
            }

            match self.stager.stage(&mut unit, nprocs) {
                Ok(_) => (),
                Err(e @ Error::MissingInput { .. }) => {
                    warn!("{e}");
                    self.result.skipped_missing_input += 1;
                    // one line per unit, however many times the wave reruns
                    if !self.marker.contains(id) {
                        self.mark(id, false);
                    }
                    continue;
                }
                Err(e) => {
                    let record = FailureRecord::bare(
                        id,
                        FailureReason::StageFailed(e.to_string()),
                    );
                    self.fail_unit(unit, record, ExitInfo::Unknown);
                    continue;
                }
            }

            let cores = self.slots[slot].cores;
            match self.runner.spawn(&unit, cores) {
                Ok(job) => {
                    unit.advance(UnitStatus::Running);
                    let tx = self.tx.clone();
                    let pid = job.watch(move |status| {
                        let _ = tx.send(Event::Exited { slot, status });
                    });
                    self.slots[slot].occupy(unit, pid);
                    self.result.spawned += 1;
                    return;
                }
                Err(e) => {
                    let record = FailureRecord::bare(
                        id,
                        FailureReason::SpawnFailed(e.to_string()),
                    );
                    self.fail_unit(unit, record, ExitInfo::Unknown);
                }
            }
        }
    }

    /// classify and finalize the unit that just exited on `slot`
    fn complete(&mut self, slot: usize, status: ExitInfo) {
        let Some((mut unit, secs)) = self.slots[slot].release() else {
            warn!("exit event for empty slot {slot}");
            return;
        };
        info!(
            "unit {} finished in {secs:.1}s with exit status {status}",
            unit.id
        );
        let log = unit.log_path();
        let record = match self.classifier.classify_file(unit.id, &log) {
            Outcome::Failed(record) => record,
            Outcome::Succeeded => {
                let done = Outcome::Succeeded;
                match self.archiver.finalize(&unit, &done, status) {
                    Ok(archived) => {
                        if archived == Archived::Skipped {
                            warn!("unit {} was already finalized", unit.id);
                        }
                        unit.advance(UnitStatus::Succeeded);
                        self.result.succeeded += 1;
                        self.mark(unit.id, true);
                        return;
                    }
                    // copies were rolled back, so this is a plain failure
                    Err(e) => {
                        error!("failed to archive unit {}: {e}", unit.id);
                        FailureRecord::bare(
                            unit.id,
                            FailureReason::ArchiveFailed(e.to_string()),
                        )
                    }
                }
            }
        };
        self.fail_unit(unit, record, status);
    }

    /// stop every running job, wait for them to exit, and remove their
    /// scratch directories. no markers are written for these units
    fn cancel(&mut self, rx: &Receiver<Event>, sig: i32) -> Error {
        self.set_state(WaveState::Done);
        warn!(
            "received signal {sig}, stopping {} running jobs",
            self.occupied()
        );
        for slot in &self.slots {
            if let Some(pid) = slot.pid {
                if let Err(e) = signal_group(pid, libc::SIGTERM) {
                    debug!("SIGTERM to {pid} failed with {e}");
                }
            }
        }
        let mut killed = false;
        while self.occupied() > 0 {
            match rx.recv_timeout(TERM_GRACE) {
                Ok(Event::Exited { slot, status }) => {
                    if let Some((unit, _)) = self.slots[slot].release() {
                        debug!("unit {} stopped with {status}", unit.id);
                        if let Err(e) = self.archiver.discard(&unit) {
                            error!("{e}");
                        }
                    }
                }
                Ok(Event::Wake) => (),
                Err(RecvTimeoutError::Timeout) if !killed => {
                    for slot in &self.slots {
                        if let Some(pid) = slot.pid {
                            let _ = signal_group(pid, libc::SIGKILL);
                        }
                    }
                    killed = true;
                }
                Err(_) => {
                    error!("jobs did not exit after SIGKILL, leaving them");
                    break;
                }
            }
        }
        // anything left behind by a job that never reported
        for slot in &mut self.slots {
            if let Some((unit, _)) = slot.release() {
                if let Err(e) = self.archiver.discard(&unit) {
                    error!("{e}");
                }
            }
        }
        // the signal is consumed, so a later wave on this scheduler can run
        self.signal.store(0, Ordering::SeqCst);
        Error::Signalled(sig)
    }
}
