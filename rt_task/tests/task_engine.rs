use rt_task::busyloop::BusyloopCalibration;
use rt_task::overhead::Overheads;
use rt_task::ring::OverrunPolicy;
use rt_task::sched::BestEffort;
use rt_task::statslog::{ReleaseKind, StatsLogReader};
use rt_task::task::{Task, TaskParams, TaskState};
use rt_task::{EventReleases, Result, RtError};
use rt_timing::{clock, Timespec};
use std::sync::Arc;
use std::time::Duration;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn start_soon() -> Timespec {
    clock::now().unwrap() + Timespec::from_millis(5)
}

#[test]
fn periodic_releases_do_not_drift() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let period = Timespec::from_millis(2);
    let offset = Timespec::from_micros(300);
    let mut params = TaskParams::periodic("drift", Timespec::from_micros(10), period);
    params.offset = offset;
    params.max_jobs = Some(100);

    let t0 = start_soon();
    let report = Task::new(params, t0, rt_task::job::NoopJob, dir.path().join("drift.log"))
        .unwrap()
        .spawn(Arc::new(BestEffort))
        .unwrap()
        .join()
        .unwrap();
    assert_eq!(report.jobs, 100);

    let samples = StatsLogReader::open(&report.log_path).unwrap().read_all().unwrap();
    assert_eq!(samples.len(), 100);
    // Generous bound for unprivileged runs; accumulated drift of even
    // 50us per release would exceed it by the last job.
    let bound = Timespec::from_millis(4);
    for (k, sample) in samples.iter().enumerate() {
        let release = t0 + offset + period * k as u64;
        assert!(sample.start >= release, "job {} started early", k + 1);
        let lateness = sample.start.checked_sub(release).unwrap();
        assert!(lateness < bound, "job {} late by {}s", k + 1, lateness);
    }
}

#[test]
fn task_log_round_trip() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tau.log");
    let overheads = Overheads {
        job_stats: Timespec::from_nanos(120),
        finish_to_start: Timespec::from_micros(3),
    };
    let mut params = TaskParams::periodic("tau", Timespec::from_micros(50), Timespec::from_millis(1));
    params.deadline = Timespec::from_micros(900);
    params.offset = Timespec::from_micros(10);
    params.overheads = overheads;
    params.max_jobs = Some(7);

    let t0 = start_soon();
    let report = Task::new(params.clone(), t0, rt_task::job::NoopJob, &path)
        .unwrap()
        .spawn(Arc::new(BestEffort))
        .unwrap()
        .join()
        .unwrap();
    assert_eq!(report.samples_written, 7);
    assert_eq!(report.total_writes, 7);
    assert!(!report.overrun);

    let mut reader = StatsLogReader::open(&path).unwrap();
    let header = reader.header().clone();
    assert_eq!(header.name, "tau");
    assert_eq!(header.release, ReleaseKind::Periodic);
    assert!(!header.stats_disabled);
    assert_eq!(header.wcet, params.wcet);
    assert_eq!(header.period, params.period);
    assert_eq!(header.deadline, params.deadline);
    assert_eq!(header.offset, params.offset);
    assert_eq!(header.t0, t0);
    assert_eq!(header.overheads, overheads);

    let samples: Vec<_> = reader.by_ref().collect::<Result<_>>().unwrap();
    assert_eq!(samples.len(), 7);
    assert!(samples.windows(2).all(|w| w[0].finish <= w[1].start));
    assert!(reader.next_sample().unwrap().is_none());
}

#[test]
fn overrun_keeps_the_newest_samples() {
    let dir = tempfile::tempdir().unwrap();
    let mut params = TaskParams::periodic("small", Timespec::from_micros(10), Timespec::from_micros(200));
    params.stats.capacity = 4;
    params.stats.policy = OverrunPolicy::Overwrite;
    params.max_jobs = Some(10);

    let report = Task::new(params, start_soon(), rt_task::job::NoopJob, dir.path().join("small.log"))
        .unwrap()
        .spawn(Arc::new(BestEffort))
        .unwrap()
        .join()
        .unwrap();
    assert!(report.overrun);
    assert_eq!(report.total_writes, 10);
    assert_eq!(report.lost, 6);
    assert_eq!(report.samples_written, 4);
    assert_eq!(StatsLogReader::open(&report.log_path).unwrap().count(), 4);
}

#[test]
fn overrun_log_summary_matches_the_surviving_releases() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let period = Timespec::from_millis(2);
    let mut params = TaskParams::periodic("kept", Timespec::from_micros(10), period);
    params.stats.capacity = 4;
    params.stats.policy = OverrunPolicy::Overwrite;
    params.max_jobs = Some(10);

    let report = Task::new(params, start_soon(), rt_task::job::NoopJob, dir.path().join("kept.log"))
        .unwrap()
        .spawn(Arc::new(BestEffort))
        .unwrap()
        .join()
        .unwrap();
    assert_eq!(report.lost, 6);

    let summary = StatsLogReader::open(&report.log_path).unwrap().summarize().unwrap();
    assert_eq!(summary.samples, 4);
    assert_eq!(summary.deadline_misses, 0);
    assert!(summary.start_lateness.max < period, "lateness {}s", summary.start_lateness.max);
}

#[test]
fn disabled_statistics_write_only_the_header() {
    let dir = tempfile::tempdir().unwrap();
    let mut params = TaskParams::periodic("quiet", Timespec::from_micros(10), Timespec::from_micros(500));
    params.stats.enabled = false;
    params.max_jobs = Some(3);

    let report = Task::new(params, start_soon(), rt_task::job::NoopJob, dir.path().join("quiet.log"))
        .unwrap()
        .spawn(Arc::new(BestEffort))
        .unwrap()
        .join()
        .unwrap();
    assert_eq!(report.jobs, 3);
    assert_eq!(report.samples_written, 0);

    let mut reader = StatsLogReader::open(&report.log_path).unwrap();
    assert!(reader.header().stats_disabled);
    assert!(reader.next_sample().unwrap().is_none());
}

#[test]
fn budget_rejection_creates_no_log() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rejected.log");
    let calibration = BusyloopCalibration {
        cpu: 0,
        frequency_hz: None,
        iterations: 1_000_000,
        target: Timespec::from_millis(1),
        tolerance: Timespec::from_micros(10),
    };
    let mut params = TaskParams::periodic("tight", Timespec::from_micros(5), Timespec::from_millis(1));
    params.overheads = Overheads {
        job_stats: Timespec::from_micros(2),
        finish_to_start: Timespec::from_micros(3),
    };

    match Task::busyloop(params, start_soon(), &calibration, &path) {
        Err(RtError::BudgetTooSmall { wcet, overhead }) => {
            assert_eq!(wcet, Timespec::from_micros(5));
            assert_eq!(overhead, Timespec::from_micros(5));
        }
        Err(other) => panic!("unexpected error {}", other),
        Ok(_) => panic!("task constructed with a zero budget"),
    }
    assert!(!path.exists());
}

#[test]
fn busyloop_task_scales_its_job_to_the_budget() {
    let dir = tempfile::tempdir().unwrap();
    let calibration = BusyloopCalibration {
        cpu: 0,
        frequency_hz: None,
        iterations: 10_000,
        target: Timespec::from_millis(1),
        tolerance: Timespec::from_micros(10),
    };
    let mut params = TaskParams::periodic("busy", Timespec::from_micros(100), Timespec::from_millis(1));
    params.max_jobs = Some(2);

    let report = Task::busyloop(params, start_soon(), &calibration, dir.path().join("busy.log"))
        .unwrap()
        .spawn(Arc::new(BestEffort))
        .unwrap()
        .join()
        .unwrap();
    assert_eq!(report.jobs, 2);
}

#[test]
fn aperiodic_task_runs_one_job_per_release_and_stops_while_waiting() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let releases = EventReleases::new().unwrap();
    let trigger = releases.trigger();
    let params = TaskParams::aperiodic("sporadic", Timespec::from_micros(10), Timespec::from_millis(1));

    let handle = Task::new(params, clock::now().unwrap(), rt_task::job::NoopJob, dir.path().join("ap.log"))
        .unwrap()
        .with_release_wait(releases)
        .spawn(Arc::new(BestEffort))
        .unwrap();

    for _ in 0..3 {
        trigger.release().unwrap();
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(handle.state(), TaskState::Running);

    // Blocked in its release wait; stop must wake it.
    let report = handle.stop_and_join().unwrap();
    assert_eq!(report.jobs, 3);

    let mut reader = StatsLogReader::open(&report.log_path).unwrap();
    assert_eq!(reader.header().release, ReleaseKind::Aperiodic);
    assert_eq!(reader.read_all().unwrap().len(), 3);
}

#[test]
fn running_periodic_task_stops_from_another_thread() {
    let dir = tempfile::tempdir().unwrap();
    let params = TaskParams::periodic("endless", Timespec::from_micros(10), Timespec::from_millis(1));
    assert_eq!(params.max_jobs, None);

    let handle = Task::new(params, start_soon(), rt_task::job::NoopJob, dir.path().join("endless.log"))
        .unwrap()
        .spawn(Arc::new(BestEffort))
        .unwrap();
    std::thread::sleep(Duration::from_millis(30));
    assert_eq!(handle.state(), TaskState::Running);

    handle.stop();
    let mut waited = 0;
    while handle.state() != TaskState::Joined && waited < 1000 {
        std::thread::sleep(Duration::from_millis(1));
        waited += 1;
    }
    assert_eq!(handle.state(), TaskState::Joined);

    let report = handle.join().unwrap();
    assert!(report.jobs > 0 && report.jobs < 1000, "{} jobs", report.jobs);
    assert_eq!(report.samples_written, report.jobs);
}

#[test]
fn stop_before_first_release() {
    let dir = tempfile::tempdir().unwrap();
    let releases = EventReleases::new().unwrap();
    let params = TaskParams::aperiodic("never", Timespec::from_micros(10), Timespec::from_millis(1));

    let handle = Task::new(params, clock::now().unwrap(), rt_task::job::NoopJob, dir.path().join("never.log"))
        .unwrap()
        .with_release_wait(releases)
        .spawn(Arc::new(BestEffort))
        .unwrap();
    let report = handle.stop_and_join().unwrap();
    assert_eq!(report.jobs, 0);
    assert_eq!(report.samples_written, 0);
}

#[test]
fn failing_job_still_flushes_its_samples() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fail.log");
    let mut runs = 0;
    let job = move || -> Result<()> {
        runs += 1;
        if runs == 3 {
            return Err(RtError::InvalidArgument("third job fails".into()));
        }
        Ok(())
    };
    let params = TaskParams::periodic("fail", Timespec::from_micros(10), Timespec::from_micros(500));

    let result = Task::new(params, start_soon(), job, &path)
        .unwrap()
        .spawn(Arc::new(BestEffort))
        .unwrap()
        .join();
    assert!(matches!(result, Err(RtError::InvalidArgument(_))));
    assert_eq!(StatsLogReader::open(&path).unwrap().read_all().unwrap().len(), 2);
}
