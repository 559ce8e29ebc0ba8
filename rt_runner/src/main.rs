mod experiment;

use crate::experiment::{Experiment, ExperimentTask};
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use rt_task::busyloop::BusyloopCalibration;
use rt_task::overhead;
use rt_task::statslog::{ReleaseKind, StatsLogReader};
use rt_task::{
    BestEffort, CalibrationParams, CalibrationStore, EventReleases, FifoAdmission, Overheads,
    RealtimeAdmission, ReleaseTrigger, Result, RtError, Task, TaskHandle, TaskState,
};
use rt_timing::measurements::{format_duration, MeasureValues};
use rt_timing::{clock, Timespec};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Allowed drift of the CPU frequency since calibration.
const FRESHNESS_PPM: u64 = 10_000;

#[derive(Parser)]
#[command(version, about = "Real-time task scheduling experiments", long_about = None)]
struct Cli {
    /// Calibration store read and updated by the subcommands
    #[arg(short, long, default_value = "calibration.json")]
    store: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Calibrate the busyloop on one CPU
    Calibrate {
        #[arg(short, long, default_value_t = 0)]
        cpu: usize,
        /// Duration the loop must reproduce, in seconds
        #[arg(short, long, default_value = "0.5")]
        target: Timespec,
        #[arg(long, default_value = "0.001")]
        tolerance: Timespec,
        #[arg(long, default_value_t = 64)]
        max_passes: u32,
    },
    /// Measure the job-stats and finish-to-start overheads on one CPU
    Overhead {
        #[arg(short, long, default_value_t = 0)]
        cpu: usize,
        #[arg(short, long, default_value_t = overhead::DEFAULT_ROUNDS)]
        rounds: u32,
    },
    /// Run the experiment described by a JSON file
    Run {
        config: PathBuf,
        /// Overrides the experiment's duration, in seconds
        #[arg(short, long)]
        duration: Option<Timespec>,
    },
    /// Print the header and statistics of task logs
    Inspect {
        #[arg(required = true)]
        logs: Vec<PathBuf>,
        /// Also print every sample
        #[arg(long)]
        samples: bool,
    },
}

fn main() {
    env_logger::init();

    let cli = Cli::parse();

    if let Err(e) = run_command(cli) {
        error!("{}", e);
        if let RtError::InsufficientPrivilege(_) = e {
            eprintln!("Real-time scheduling needs CAP_SYS_NICE or an adequate RLIMIT_RTPRIO");
            std::process::exit(2);
        }
        std::process::exit(1);
    }
}

fn run_command(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Calibrate {
            cpu,
            target,
            tolerance,
            max_passes,
        } => {
            let params = CalibrationParams {
                max_passes,
                ..CalibrationParams::new(cpu, target, tolerance)
            };
            let calibration = BusyloopCalibration::calibrate(params)?;
            println!(
                "CPU {}: {} iterations for {}s",
                cpu, calibration.iterations, calibration.target
            );

            let mut store = CalibrationStore::from_file_or_default(&cli.store)?;
            store.cpu_mut(cpu).busyloop = Some(calibration);
            store.save(&cli.store)
        }
        Commands::Overhead { cpu, rounds } => {
            let mut store = CalibrationStore::from_file_or_default(&cli.store)?;
            for release in [ReleaseKind::Periodic, ReleaseKind::Aperiodic] {
                let overheads = overhead::measure(cpu, release, rounds)?;
                println!(
                    "CPU {} {:?}: job stats {}, finish to start {}",
                    cpu,
                    release,
                    pretty(overheads.job_stats),
                    pretty(overheads.finish_to_start)
                );
                store.cpu_mut(cpu).set_overheads(release, overheads);
            }
            store.save(&cli.store)
        }
        Commands::Run { config, duration } => {
            let mut experiment = Experiment::from_file(&config)?;
            if duration.is_some() {
                experiment.duration = duration;
            }
            let store = CalibrationStore::from_file(&cli.store)?;
            run_experiment(&experiment, &store)
        }
        Commands::Inspect { logs, samples } => {
            for log in &logs {
                inspect(log, samples)?;
            }
            Ok(())
        }
    }
}

fn pretty(value: Timespec) -> String {
    let (value, unit) = format_duration(value.as_secs_f64());
    format!("{:.3} {}", value, unit)
}

fn run_experiment(experiment: &Experiment, store: &CalibrationStore) -> Result<()> {
    std::fs::create_dir_all(&experiment.log_dir)?;

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = Arc::clone(&running);
        ctrlc::set_handler(move || running.store(false, Ordering::SeqCst))
            .map_err(|e| RtError::Io(io::Error::new(io::ErrorKind::Other, e.to_string())))?;
    }

    let t0 = clock::now()?.checked_add(experiment.start_delay)?;
    let mut handles: Vec<TaskHandle> = Vec::with_capacity(experiment.tasks.len());
    let mut generators = Vec::new();

    for task in &experiment.tasks {
        match start_task(experiment, store, task, t0, &running) {
            Ok((handle, generator)) => {
                handles.push(handle);
                generators.extend(generator);
            }
            Err(e) => {
                running.store(false, Ordering::SeqCst);
                for handle in handles {
                    if let Err(join) = handle.stop_and_join() {
                        error!("{}", join);
                    }
                }
                join_generators(generators);
                return Err(e);
            }
        }
    }

    let end = match experiment.duration {
        Some(duration) => Some(t0.checked_add(duration)?),
        None => None,
    };
    info!("Running {} tasks from t0 = {}", handles.len(), t0);
    while running.load(Ordering::SeqCst) {
        let now = clock::now()?;
        if end.is_some_and(|end| now >= end) {
            break;
        }
        if handles.iter().all(|h| h.state() >= TaskState::Stopped) {
            info!("All tasks finished on their own");
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    running.store(false, Ordering::SeqCst);

    for handle in &handles {
        handle.stop();
    }
    let mut first_error = None;
    for handle in handles {
        let name = handle.name().to_string();
        match handle.join() {
            Ok(report) => println!(
                "{}: {} jobs, {} samples in {:?}, {} lost",
                report.name,
                report.jobs,
                report.samples_written,
                report.log_path,
                report.lost
            ),
            Err(e) => {
                error!("Task {} failed: {}", name, e);
                first_error.get_or_insert(e);
            }
        }
    }
    join_generators(generators);

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn start_task(
    experiment: &Experiment,
    store: &CalibrationStore,
    task: &ExperimentTask,
    t0: Timespec,
    running: &Arc<AtomicBool>,
) -> Result<(TaskHandle, Option<JoinHandle<()>>)> {
    let cpu = experiment.task_cpu(task);
    let calibration = store.cpu(cpu).and_then(|c| c.busyloop).ok_or_else(|| {
        RtError::InvalidArgument(format!(
            "no busyloop calibration for CPU {}, run `calibrate --cpu {}` first",
            cpu, cpu
        ))
    })?;
    if calibration.is_fresh(FRESHNESS_PPM) == Some(false) {
        warn!(
            "CPU {} runs at a different frequency than during calibration; job durations will be off",
            cpu
        );
    }

    let mut params = task.params.clone();
    if params.overheads == Overheads::default() {
        match store.cpu(cpu).and_then(|c| c.overheads(params.release)) {
            Some(measured) => params.overheads = measured,
            None => warn!(
                "No {:?} overheads measured for CPU {}; task {} uses its full WCET",
                params.release, cpu, params.name
            ),
        }
    }

    let admission: Arc<dyn RealtimeAdmission> = if experiment.realtime {
        Arc::new(FifoAdmission {
            priority: task.priority(),
            cpu: Some(cpu),
        })
    } else {
        Arc::new(BestEffort)
    };

    let built = Task::busyloop(params, t0, &calibration, task.log_path(&experiment.log_dir))?;
    match (task.params.release, task.release_interval) {
        (ReleaseKind::Aperiodic, Some(interval)) => {
            let releases = EventReleases::new()?;
            let trigger = releases.trigger();
            let first = t0.checked_add(task.params.offset)?;
            let handle = built.with_release_wait(releases).spawn(admission)?;
            let generator = spawn_generator(
                &task.params.name,
                trigger,
                first,
                interval,
                Arc::clone(running),
            )?;
            Ok((handle, Some(generator)))
        }
        _ => Ok((built.spawn(admission)?, None)),
    }
}

/// Releases an aperiodic task every `interval` until `running` drops.
fn spawn_generator(
    name: &str,
    trigger: ReleaseTrigger,
    first: Timespec,
    interval: Timespec,
    running: Arc<AtomicBool>,
) -> Result<JoinHandle<()>> {
    let thread_name = format!("{}-releases", name);
    let handle = std::thread::Builder::new()
        .name(thread_name.clone())
        .spawn(move || {
            let mut release = first;
            while running.load(Ordering::SeqCst) {
                if let Err(e) = clock::sleep_until(release).and_then(|_| trigger.release()) {
                    error!("{}: {}", thread_name, e);
                    return;
                }
                release += interval;
            }
        })?;
    Ok(handle)
}

/// Generators leave their loop once `running` drops, at most one interval later.
fn join_generators(generators: Vec<JoinHandle<()>>) {
    for generator in generators {
        if generator.join().is_err() {
            error!("A release generator panicked");
        }
    }
}

fn inspect(path: &Path, print_samples: bool) -> Result<()> {
    let mut reader = StatsLogReader::open(path)?;
    let header = reader.header().clone();

    println!("{}", path.display());
    println!("  task:       {} ({:?})", header.name, header.release);
    println!("  wcet:       {}", pretty(header.wcet));
    println!("  period:     {}", pretty(header.period));
    println!("  deadline:   {}", pretty(header.deadline));
    println!("  t0:         {}s", header.t0);
    println!("  offset:     {}", pretty(header.offset));
    println!(
        "  overheads:  job stats {}, finish to start {}",
        pretty(header.overheads.job_stats),
        pretty(header.overheads.finish_to_start)
    );
    if header.stats_disabled {
        println!("  statistics disabled");
        return Ok(());
    }

    if print_samples {
        for (i, sample) in reader.by_ref().enumerate() {
            let sample = sample?;
            println!(
                "  {:>6} start {}s finish {}s response {}",
                i + 1,
                sample.start,
                sample.finish,
                pretty(sample.response_time())
            );
        }
        return Ok(());
    }

    let summary = reader.summarize()?;
    println!("  samples:    {}", summary.samples);
    print_measure("response", &summary.response_time);
    if header.release == ReleaseKind::Periodic {
        print_measure("lateness", &summary.start_lateness);
    }
    println!("  misses:     {}", summary.deadline_misses);
    Ok(())
}

fn print_measure(label: &str, values: &MeasureValues) {
    if values.number_of_measurements > 0 {
        println!("  {:<10}  {}", format!("{}:", label), values);
    }
}
