use std::{
    fs,
    path::Path,
    thread,
    time::{Duration, Instant},
};

use crate::{
    calc::{Basis, Calc, Method},
    classify::FailureReason,
    marker,
};

use super::*;

const NORMAL: &str = "
FINAL SINGLE POINT ENERGY       -76.026765327612
                             ****ORCA TERMINATED NORMALLY****
";

const SEGFAULT: &str = "
[node1:12345] *** Process received signal ***
Segmentation fault (Address not mapped to object)
";

/// partial SCF output from a job that hit the wall-clock limit
const TRUNCATED: &str = "
ITER       Energy         Delta-E        Max-DP      RMS-DP
  0    -75.9812633471   0.000000000000 0.0412
";

/// a config whose compute program just prints the staged input
fn setup(total_cores: usize) -> (tempfile::TempDir, Config) {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = Config::under(
        tmp.path(),
        &[Calc::new(Method::Mp2, Basis::B631gs)],
        "sh",
    );
    config.args = string!["-c", "cat \"$0\"", "{input}"];
    config.total_cores = total_cores;
    config.bind_cores = false;
    (tmp, config)
}

fn write_input(config: &Config, id: usize, contents: &str) {
    let key = config.key(id);
    let dir = config.source_dir(&key);
    fs::create_dir_all(&dir).unwrap();
    let calc = config.calcs[0];
    fs::write(dir.join(format!("{key}_{}.inp", calc.suffix())), contents)
        .unwrap();
}

fn sorted_lines(path: &Path) -> Vec<String> {
    let mut ret: Vec<_> = fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(String::from)
        .collect();
    ret.sort();
    ret
}

#[test]
fn mixed_wave() {
    let (_tmp, config) = setup(4);
    write_input(&config, 100, NORMAL);
    write_input(&config, 101, SEGFAULT);
    write_input(&config, 102, NORMAL);
    write_input(&config, 103, SEGFAULT);
    let mut scheduler = WaveScheduler::new(config.clone());
    let got = scheduler.run_wave(100, 103, 2).unwrap();

    assert_eq!(got.succeeded, 2);
    assert_eq!(got.failed, 2);
    assert_eq!(got.skipped_missing_input, 0);
    assert_eq!(got.spawned, 4);
    let mut failed: Vec<_> = got.failures.iter().map(|f| f.unit_id).collect();
    failed.sort();
    assert_eq!(failed, vec![101, 103]);
    for f in &got.failures {
        assert_eq!(f.reason, FailureReason::Signature);
        assert_eq!(f.primary(), Some("Segmentation fault"));
    }

    assert_eq!(
        sorted_lines(&config.marker_log(100, 103)),
        string!["DONE 100", "DONE 102", "FAILED 101", "FAILED 103"]
    );
    for id in 100..=103 {
        let key = config.key(id);
        let failed = id % 2 == 1;
        assert_eq!(config.err_file(&key).exists(), failed);
        assert_eq!(config.has_output(&key), !failed);
        assert!(!config.scratch_root.join(&key).exists());
    }

    let out = config.dest_dir(&config.key(100)).join(format!(
        "{}_mp2_631gs.out",
        config.key(100)
    ));
    let got = fs::read_to_string(out).unwrap();
    assert!(got.starts_with("%pal nprocs 2 end\n"));
    assert!(got.contains("ORCA TERMINATED NORMALLY"));

    let record = fs::read_to_string(config.err_file(&config.key(101))).unwrap();
    assert!(record.contains("Segmentation fault"));
    assert!(config.err_root.join("dsgdb9nsd_000101_mp2_631gs.inp").exists());
    assert!(config.err_root.join("dsgdb9nsd_000101_mp2_631gs.out").exists());
}

#[test]
fn counts_cover_the_range() {
    let (_tmp, config) = setup(3);
    write_input(&config, 1, NORMAL);
    write_input(&config, 2, SEGFAULT);
    write_input(&config, 4, TRUNCATED);
    write_input(&config, 5, NORMAL);
    let mut scheduler = WaveScheduler::new(config.clone());
    let got = scheduler.run_wave(1, 6, 3).unwrap();

    assert_eq!(got.total(), 6);
    assert_eq!(got.succeeded, 2);
    assert_eq!(got.failed, 2);
    assert_eq!(got.skipped_missing_input, 2);
    assert_eq!(got.spawned, 4);
    let truncated = got.failures.iter().find(|f| f.unit_id == 4).unwrap();
    assert_eq!(truncated.reason, FailureReason::NoTerminalMarker);
    assert!(truncated.matched.is_empty());

    // missing inputs are marked but leave no record, so a later wave retries
    let log = config.marker_log(1, 6);
    assert_eq!(marker::count(&log).unwrap(), (2, 4));
    assert!(!config.err_file(&config.key(3)).exists());
    assert!(!config.err_file(&config.key(6)).exists());

    let progress = Progress::scan(&config, 1, 6);
    assert_eq!(
        progress,
        Progress {
            archived: 2,
            failed: 2,
            total: 6
        }
    );
}

#[test]
fn rerun_skips_recorded_failures() {
    let (_tmp, config) = setup(2);
    for id in 1..=3 {
        write_input(&config, id, SEGFAULT);
    }
    let mut scheduler = WaveScheduler::new(config.clone());
    let first = scheduler.run_wave(1, 3, 2).unwrap();
    assert_eq!(first.failed, 3);
    assert_eq!(first.spawned, 3);
    let records: Vec<_> = (1..=3)
        .map(|id| fs::read_to_string(config.err_file(&config.key(id))).unwrap())
        .collect();

    let second = scheduler.run_wave(1, 3, 2).unwrap();
    assert_eq!(second.failed, 3);
    assert_eq!(second.previously_failed, 3);
    assert_eq!(second.spawned, 0);
    assert!(second.failures.is_empty());
    assert_eq!(marker::count(config.marker_log(1, 3)).unwrap(), (0, 3));
    for (id, want) in (1..=3).zip(records) {
        let got = fs::read_to_string(config.err_file(&config.key(id))).unwrap();
        assert_eq!(got, want);
    }
}

#[test]
fn skip_existing_output() {
    let (_tmp, mut config) = setup(1);
    config.skip_existing_output = true;
    write_input(&config, 7, NORMAL);
    let key = config.key(7);
    let dest = config.dest_dir(&key);
    fs::create_dir_all(&dest).unwrap();
    fs::write(dest.join(format!("{key}_mp2_631gs.out")), "old").unwrap();

    let got = WaveScheduler::new(config.clone()).run_wave(7, 7, 1).unwrap();
    assert_eq!(got.succeeded, 1);
    assert_eq!(got.previously_succeeded, 1);
    assert_eq!(got.spawned, 0);
    let out = fs::read_to_string(dest.join(format!("{key}_mp2_631gs.out")));
    assert_eq!(out.unwrap(), "old");
}

#[test]
fn too_much_concurrency() {
    let (_tmp, config) = setup(4);
    write_input(&config, 1, NORMAL);
    let mut scheduler = WaveScheduler::new(config.clone());
    let got = scheduler.run_wave(1, 5, 5);
    assert!(matches!(got, Err(Error::Config(_))));
    assert_eq!(got.unwrap_err().exit_code(), 2);
    // nothing was touched
    assert!(!config.log_dir.exists());
    assert!(!config.scratch_root.exists());
}

#[test]
fn wave_longer_than_chunk() {
    let (_tmp, mut config) = setup(2);
    config.chunk_size = Some(2);
    let got = WaveScheduler::new(config).run_wave(1, 3, 1);
    assert!(matches!(got, Err(Error::Config(_))));
}

#[test]
fn missing_program() {
    let (tmp, mut config) = setup(1);
    config.program = tmp.path().join("bin/orca");
    let got = WaveScheduler::new(config).run_wave(1, 1, 1);
    assert!(matches!(got, Err(Error::Config(_))));
}

#[test]
fn spawn_failure_is_recorded() {
    let (_tmp, mut config) = setup(1);
    config.program = "rust-wave-no-such-program".into();
    write_input(&config, 9, NORMAL);
    let got = WaveScheduler::new(config.clone()).run_wave(9, 9, 1).unwrap();
    assert_eq!(got.failed, 1);
    assert_eq!(got.spawned, 0);
    assert!(matches!(
        got.failures[0].reason,
        FailureReason::SpawnFailed(_)
    ));
    assert!(config.err_file(&config.key(9)).exists());
    assert_eq!(marker::count(config.marker_log(9, 9)).unwrap(), (0, 1));
}

#[test]
fn signal_stops_the_wave() {
    let (_tmp, mut config) = setup(1);
    config.args = string!["-c", "sleep 30", "{input}"];
    write_input(&config, 55, NORMAL);
    let mut scheduler = WaveScheduler::new(config.clone());
    let handle = scheduler.cancel_handle();
    let unit = config.unit(55);
    let log = config
        .scratch_root
        .join(&unit.key)
        .join(format!("{}_mp2_631gs.out", unit.key));
    let killer = thread::spawn(move || {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !log.exists() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        thread::sleep(Duration::from_millis(100));
        handle.terminate(libc::SIGTERM);
    });

    let start = Instant::now();
    let got = scheduler.run_wave(55, 55, 1);
    killer.join().unwrap();
    assert!(matches!(got, Err(Error::Signalled(libc::SIGTERM))));
    assert_eq!(got.unwrap_err().exit_code(), 128 + libc::SIGTERM);
    assert!(start.elapsed() < Duration::from_secs(25));
    assert!(!unit.work_dir.exists());
    assert!(!config.err_file(&unit.key).exists());
    assert!(!config.has_output(&unit.key));
    assert_eq!(marker::count(config.marker_log(55, 55)).unwrap(), (0, 0));
}

#[test]
fn load_and_run_from_file() {
    let tmp = tempfile::tempdir().unwrap();
    let toml = r#"
source_root = "source"
scratch_root = "scratch"
dest_root = "dest"
err_root = "err"
log_dir = "logs"
calcs = ["ccsd/631gs", "mp2/631gs"]
program = "sh"
args = ["-c", "cat \"$0\"", "{input}"]
total_cores = 2
bind_cores = false
"#;
    let path = tmp.path().join("wave.toml");
    fs::write(&path, toml).unwrap();
    let config = Config::load(&path).unwrap();
    assert_eq!(config.source_root, tmp.path().join("source"));
    // only the fallback calc has an input
    let mp2 = Config {
        calcs: vec![config.calcs[1]],
        ..config.clone()
    };
    write_input(&mp2, 3, NORMAL);
    let got = WaveScheduler::new(config.clone()).run_wave(3, 3, 2).unwrap();
    assert_eq!(got.succeeded, 1);
    let key = config.key(3);
    let dest = config.dest_dir(&key);
    assert!(dest.join(format!("{key}_mp2_631gs.out")).exists());
    assert!(!dest.join(format!("{key}_ccsd_631gs.out")).exists());
}

#[cfg(target_os = "linux")]
#[test]
fn cores_outside_the_mask() {
    let n = crate::affinity::allowed_cpus().unwrap().len();
    let (_tmp, mut config) = setup(n + 1);
    config.bind_cores = true;
    write_input(&config, 2, NORMAL);
    let got = WaveScheduler::new(config.clone()).run_wave(2, 2, 1);
    assert!(matches!(got, Err(Error::Config(_))));
    assert!(!config.err_file(&config.key(2)).exists());
    assert!(!config.scratch_root.exists());
}

#[test]
fn failed_archive_is_a_failure() {
    let (_tmp, config) = setup(1);
    write_input(&config, 8, NORMAL);
    let key = config.key(8);
    // a plain file where the result directory should go
    fs::create_dir_all(&config.dest_root).unwrap();
    fs::write(config.dest_dir(&key), "in the way").unwrap();

    let got = WaveScheduler::new(config.clone()).run_wave(8, 8, 1).unwrap();
    assert_eq!(got.succeeded, 0);
    assert_eq!(got.failed, 1);
    assert!(matches!(
        got.failures[0].reason,
        FailureReason::ArchiveFailed(_)
    ));
    assert!(config.err_file(&key).exists());
    assert!(!config.scratch_root.join(&key).exists());
    assert!(config.err_root.join(format!("{key}_mp2_631gs.inp")).exists());
    assert!(config.err_root.join(format!("{key}_mp2_631gs.out")).exists());
    assert_eq!(marker::count(config.marker_log(8, 8)).unwrap(), (0, 1));
}

#[test]
fn slots_run_at_the_same_time() {
    let (tmp, mut config) = setup(2);
    let gate = tmp.path().join("started");
    fs::create_dir_all(&gate).unwrap();
    // each job waits up to 10 s for the other to start, and only prints its
    // input (with the terminal marker) if it did
    let script = format!(
        "touch {gate}/$0; i=0; \
         while [ $(ls {gate} | wc -l) -lt 2 ] && [ $i -lt 100 ]; do \
         sleep 0.1; i=$((i+1)); done; \
         [ $(ls {gate} | wc -l) -ge 2 ] && cat \"$0\"",
        gate = gate.display()
    );
    config.args = vec!["-c".into(), script, "{input}".into()];
    write_input(&config, 1, NORMAL);
    write_input(&config, 2, NORMAL);

    let got = WaveScheduler::new(config.clone()).run_wave(1, 2, 2).unwrap();
    assert_eq!(got.succeeded, 2);
    assert!(got.failures.is_empty());
    assert_eq!(fs::read_dir(&gate).unwrap().count(), 2);
}

#[test]
fn scheduler_runs_again_after_signal() {
    let (_tmp, config) = setup(1);
    write_input(&config, 1, NORMAL);
    let mut scheduler = WaveScheduler::new(config.clone());
    scheduler.cancel_handle().terminate(libc::SIGINT);
    let got = scheduler.run_wave(1, 1, 1);
    assert!(matches!(got, Err(Error::Signalled(libc::SIGINT))));
    assert_eq!(marker::count(config.marker_log(1, 1)).unwrap(), (0, 0));

    let got = scheduler.run_wave(1, 1, 1).unwrap();
    assert_eq!(got.succeeded, 1);
    assert_eq!(marker::count(config.marker_log(1, 1)).unwrap(), (1, 0));
}

#[test]
fn missing_input_marked_once() {
    let (_tmp, config) = setup(1);
    let mut scheduler = WaveScheduler::new(config.clone());
    for _ in 0..3 {
        let got = scheduler.run_wave(3, 3, 1).unwrap();
        assert_eq!(got.skipped_missing_input, 1);
    }
    assert_eq!(marker::count(config.marker_log(3, 3)).unwrap(), (0, 1));
}
