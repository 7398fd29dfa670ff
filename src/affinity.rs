use std::{fmt::Display, io};

use crate::error::{Error, Result};

/// A contiguous, half-open range `[start, end)` of core IDs owned by one slot
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CoreRange {
    pub start: usize,
    pub end: usize,
}

impl CoreRange {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn cores(&self) -> std::ops::Range<usize> {
        self.start..self.end
    }

    /// the OS CPU IDs behind this range's logical indices. index `k` is the
    /// `k`th CPU in `allowed` (the controller's own affinity mask), so a
    /// node whose cgroup hands out CPUs 16-31 still gets disjoint slots.
    /// `None` if the range reaches past the end of `allowed`
    pub fn physical(&self, allowed: &[usize]) -> Option<Vec<usize>> {
        allowed.get(self.start..self.end).map(<[usize]>::to_vec)
    }
}

/// OpenMPI rankfile pinning one rank to each of `cpus`
pub fn rankfile(
    cpus: &[usize],
    hostname: &str,
    cores_per_socket: usize,
) -> String {
    let mut ret = String::new();
    for (rank, core) in cpus.iter().enumerate() {
        ret.push_str(&format!(
            "rank {rank}={hostname} slot={}:{}\n",
            core / cores_per_socket,
            core % cores_per_socket
        ));
    }
    ret
}

/// formats like a Linux cpu list, eg `8-15`
impl Display for CoreRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.len() == 1 {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end.saturating_sub(1))
        }
    }
}

/// restrict the calling thread (and anything it later execs) to exactly
/// `cpus`. this only makes plain syscalls, so it is safe to call between
/// fork and exec
#[cfg(target_os = "linux")]
pub fn bind_current(cpus: &[usize]) -> io::Result<()> {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        for &cpu in cpus {
            libc::CPU_SET(cpu, &mut set);
        }
        if libc::sched_setaffinity(
            0,
            std::mem::size_of::<libc::cpu_set_t>(),
            &set,
        ) != 0
        {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn bind_current(_cpus: &[usize]) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "cpu affinity requires sched_setaffinity",
    ))
}

/// the CPUs the current process may run on, in increasing order
#[cfg(target_os = "linux")]
pub fn allowed_cpus() -> io::Result<Vec<usize>> {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        if libc::sched_getaffinity(
            0,
            std::mem::size_of::<libc::cpu_set_t>(),
            &mut set,
        ) != 0
        {
            return Err(io::Error::last_os_error());
        }
        Ok((0..libc::CPU_SETSIZE as usize)
            .filter(|&cpu| libc::CPU_ISSET(cpu, &set))
            .collect())
    }
}

#[cfg(not(target_os = "linux"))]
pub fn allowed_cpus() -> io::Result<Vec<usize>> {
    Ok(Vec::new())
}

/// the CPUs this process may run on, provided there are at least `total` of
/// them to bind slots to
pub fn bindable_cpus(total: usize) -> Result<Vec<usize>> {
    let allowed = allowed_cpus().map_err(|e| {
        Error::Config(format!("failed to read the cpu affinity mask: {e}"))
    })?;
    if total > allowed.len() {
        return Err(Error::Config(format!(
            "total_cores {total} exceeds the {} cpus this process may use",
            allowed.len()
        )));
    }
    Ok(allowed)
}

/// split `total` cores into `concurrency` disjoint ranges of `total /
/// concurrency` cores each. leftover cores at the top are not handed out
pub fn allocate(total: usize, concurrency: usize) -> Result<Vec<CoreRange>> {
    if concurrency == 0 {
        return Err(Error::Config("concurrency must be positive".into()));
    }
    if concurrency > total {
        return Err(Error::Config(format!(
            "concurrency {concurrency} exceeds {total} available cores"
        )));
    }
    let per = total / concurrency;
    Ok((0..concurrency)
        .map(|i| CoreRange {
            start: i * per,
            end: (i + 1) * per,
        })
        .collect())
}

/// the number of cores this node should hand out: the Slurm allocation if
/// there is one, otherwise whatever the OS reports
pub fn detect_total_cores() -> usize {
    if let Some(n) = std::env::var("SLURM_CPUS_ON_NODE")
        .ok()
        .and_then(|s| s.trim().parse().ok())
    {
        return n;
    }
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

pub fn hostname() -> String {
    let mut buf = [0u8; 256];
    let ret = unsafe {
        libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len())
    };
    if ret != 0 {
        return String::from("localhost");
    }
    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    match std::str::from_utf8(&buf[..len]) {
        Ok(s) if !s.is_empty() => s.to_owned(),
        _ => String::from("localhost"),
    }
}
