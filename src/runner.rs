use std::{
    ffi::OsString,
    fmt::Display,
    fs::File,
    io,
    os::unix::process::{CommandExt, ExitStatusExt},
    path::Path,
    process::{Child, Command, ExitStatus, Stdio},
    thread,
    time::{Duration, Instant},
};

use log::{debug, info};

use crate::{
    affinity::{self, allowed_cpus, bind_current, hostname, CoreRange},
    config::Config,
    error::{Error, IoContext, Result},
    unit::Unit,
};

/// how a job process ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitInfo {
    Code(i32),
    Signal(i32),
    Unknown,
}

impl ExitInfo {
    pub fn success(&self) -> bool {
        *self == ExitInfo::Code(0)
    }
}

impl From<ExitStatus> for ExitInfo {
    fn from(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            ExitInfo::Code(code)
        } else if let Some(sig) = status.signal() {
            ExitInfo::Signal(sig)
        } else {
            ExitInfo::Unknown
        }
    }
}

impl Display for ExitInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitInfo::Code(c) => write!(f, "{c}"),
            ExitInfo::Signal(s) => write!(f, "signal {s}"),
            ExitInfo::Unknown => write!(f, "unknown"),
        }
    }
}

/// A running compute process. The child is the leader of its own process
/// group, so signalling the group also reaches anything it launched (MPI
/// ranks, ORCA's helper binaries)
#[derive(Debug)]
pub struct JobHandle {
    child: Child,
    started: Instant,
}

impl JobHandle {
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// non-blocking status check
    pub fn try_wait(&mut self) -> io::Result<Option<ExitInfo>> {
        Ok(self.child.try_wait()?.map(ExitInfo::from))
    }

    /// block for at most `timeout` waiting for the process to exit
    pub fn wait_timeout(
        &mut self,
        timeout: Duration,
    ) -> io::Result<Option<ExitInfo>> {
        const POLL: Duration = Duration::from_millis(20);
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = self.try_wait()? {
                return Ok(Some(status));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            thread::sleep(POLL.min(deadline - now));
        }
    }

    pub fn wait(&mut self) -> io::Result<ExitInfo> {
        Ok(self.child.wait()?.into())
    }

    /// send `sig` to the job's whole process group
    pub fn signal(&self, sig: i32) -> io::Result<()> {
        signal_group(self.pid(), sig)
    }

    /// hand the child to a waiter thread that calls `on_exit` once it
    /// exits. returns the pid for later signalling
    pub fn watch<F>(mut self, on_exit: F) -> u32
    where
        F: FnOnce(ExitInfo) + Send + 'static,
    {
        let pid = self.pid();
        thread::spawn(move || {
            let status = self.wait().unwrap_or(ExitInfo::Unknown);
            on_exit(status);
        });
        pid
    }
}

/// send `sig` to the process group led by `pid`
pub fn signal_group(pid: u32, sig: i32) -> io::Result<()> {
    let ret = unsafe { libc::kill(-(pid as libc::pid_t), sig) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// PATH-style variable `var` with `dir` in front
fn prepend(dir: &Path, var: &str) -> OsString {
    let mut ret = OsString::from(dir);
    if let Some(old) = std::env::var_os(var) {
        if !old.is_empty() {
            ret.push(":");
            ret.push(old);
        }
    }
    ret
}

/// put the program installation under `home` first on PATH and
/// LD_LIBRARY_PATH
pub(crate) fn program_env(cmd: &mut Command, home: &Path) {
    cmd.env("PATH", prepend(&home.join("bin"), "PATH"));
    cmd.env(
        "LD_LIBRARY_PATH",
        prepend(&home.join("lib"), "LD_LIBRARY_PATH"),
    );
}

/// Launches the compute program for staged units
pub struct Runner<'a> {
    config: &'a Config,

    /// the controller's own CPU mask, which slot indices are mapped onto
    allowed: Vec<usize>,
}

impl<'a> Runner<'a> {
    pub fn new(config: &'a Config) -> Self {
        let allowed = allowed_cpus().unwrap_or_else(|e| {
            log::warn!("failed to read cpu affinity with {e}");
            Vec::new()
        });
        Self { config, allowed }
    }

    /// substitute `{input}`, `{basename}`, and `{rankfile}` in `template`
    fn render(template: &str, unit: &Unit, rankfile: Option<&Path>) -> String {
        let base = unit.basename();
        let mut ret = template
            .replace("{input}", &format!("{base}.inp"))
            .replace("{basename}", &base);
        if let Some(rf) = rankfile {
            ret = ret.replace("{rankfile}", &rf.to_string_lossy());
        }
        ret
    }

    /// build the command for `unit` on `cores` without starting it. stdout
    /// and stderr both go to the unit's log
    pub fn command(&self, unit: &Unit, cores: CoreRange) -> Result<Command> {
        let cpus = match cores.physical(&self.allowed) {
            Some(cpus) => cpus,
            None if !self.config.bind_cores => cores.cores().collect(),
            None => {
                return Err(Error::Config(format!(
                    "cores {cores} are outside this process's cpu mask"
                )))
            }
        };
        let mut rankfile = None;
        if let Some(per_socket) = self.config.rankfile_cores_per_socket {
            let path = unit.scratch_file("rankfile");
            let contents = affinity::rankfile(&cpus, &hostname(), per_socket);
            std::fs::write(&path, contents).at(&path)?;
            rankfile = Some(path);
        }

        let mut cmd = Command::new(&self.config.program);
        cmd.args(
            self.config
                .args
                .iter()
                .map(|a| Self::render(a, unit, rankfile.as_deref())),
        );
        cmd.current_dir(&unit.work_dir);
        if let Some(home) = &self.config.program_home {
            program_env(&mut cmd, home);
        }

        let log_path = unit.log_path();
        let log = File::create(&log_path).at(&log_path)?;
        let err = log.try_clone().at(&log_path)?;
        cmd.stdin(Stdio::null()).stdout(log).stderr(err);
        cmd.process_group(0);

        if self.config.bind_cores {
            // SAFETY: sched_setaffinity is a raw syscall with no allocation
            // or locking, so it is fine between fork and exec
            unsafe {
                cmd.pre_exec(move || bind_current(&cpus));
            }
        }
        Ok(cmd)
    }

    pub fn spawn(&self, unit: &Unit, cores: CoreRange) -> Result<JobHandle> {
        let mut cmd = self.command(unit, cores)?;
        let child = cmd
            .spawn()
            .map_err(|e| Error::io(&self.config.program, e))?;
        info!(
            "unit {} ({}) started as pid {} on cores {cores}",
            unit.id,
            unit.basename(),
            child.id()
        );
        debug!("{cmd:?}");
        Ok(JobHandle {
            child,
            started: Instant::now(),
        })
    }
}
