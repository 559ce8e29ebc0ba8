//! Experiment description loaded from JSON.
//!
//! ```json
//! {
//!   "duration": "2.0",
//!   "cpu": 2,
//!   "log_dir": "logs",
//!   "realtime": true,
//!   "tasks": [
//!     { "name": "tau1", "wcet": "0.002", "period": "0.010", "deadline": "0.010",
//!       "release": "periodic", "priority": 60 },
//!     { "name": "srv", "wcet": "0.001", "period": "0", "deadline": "0.005",
//!       "release": "aperiodic", "release_interval": "0.020" }
//!   ]
//! }
//! ```

use rt_task::statslog::ReleaseKind;
use rt_task::{Result, RtError, TaskParams};
use rt_timing::Timespec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

const DEFAULT_PRIORITY: i32 = 50;

fn default_start_delay() -> Timespec {
    Timespec::from_millis(100)
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExperimentTask {
    #[serde(flatten)]
    pub params: TaskParams,
    /// CPU to pin to, defaults to the experiment's
    #[serde(default)]
    pub cpu: Option<usize>,
    /// `SCHED_FIFO` priority when the experiment runs real-time
    #[serde(default)]
    pub priority: Option<i32>,
    /// Log file name relative to the log directory
    #[serde(default)]
    pub log: Option<PathBuf>,
    /// Fixed inter-arrival time of generated aperiodic releases
    #[serde(default)]
    pub release_interval: Option<Timespec>,
}

impl ExperimentTask {
    pub fn priority(&self) -> i32 {
        self.priority.unwrap_or(DEFAULT_PRIORITY)
    }

    pub fn log_path(&self, log_dir: &Path) -> PathBuf {
        match &self.log {
            Some(log) => log_dir.join(log),
            None => log_dir.join(format!("{}.log", self.params.name)),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Experiment {
    /// Run time; until interrupted when absent
    #[serde(default)]
    pub duration: Option<Timespec>,
    #[serde(default)]
    pub cpu: usize,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// Admit tasks into `SCHED_FIFO` instead of running best effort
    #[serde(default)]
    pub realtime: bool,
    /// Delay between setup and the common release instant t0
    #[serde(default = "default_start_delay")]
    pub start_delay: Timespec,
    pub tasks: Vec<ExperimentTask>,
}

impl Experiment {
    pub fn from_file<A: AsRef<Path>>(path: A) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        let reader = std::io::BufReader::new(file);
        let experiment: Experiment = serde_json::from_reader(reader)?;
        experiment.validate()?;
        Ok(experiment)
    }

    pub fn task_cpu(&self, task: &ExperimentTask) -> usize {
        task.cpu.unwrap_or(self.cpu)
    }

    fn validate(&self) -> Result<()> {
        if self.tasks.is_empty() {
            return Err(RtError::InvalidArgument("experiment has no tasks".to_string()));
        }
        let mut names = BTreeSet::new();
        let mut logs = BTreeSet::new();
        for task in &self.tasks {
            if !names.insert(task.params.name.as_str()) {
                return Err(RtError::InvalidArgument(format!(
                    "duplicate task name {}",
                    task.params.name
                )));
            }
            if !logs.insert(task.log_path(&self.log_dir)) {
                return Err(RtError::InvalidArgument(format!(
                    "task {} shares its log file with another task",
                    task.params.name
                )));
            }
            match (task.params.release, task.release_interval) {
                (ReleaseKind::Aperiodic, None) => {
                    return Err(RtError::InvalidArgument(format!(
                        "aperiodic task {} needs a release_interval",
                        task.params.name
                    )))
                }
                (ReleaseKind::Aperiodic, Some(interval)) if interval.is_zero() => {
                    return Err(RtError::InvalidArgument(format!(
                        "task {}: release_interval must be > 0",
                        task.params.name
                    )))
                }
                (ReleaseKind::Periodic, _) if task.params.period.is_zero() => {
                    return Err(RtError::InvalidArgument(format!(
                        "periodic task {} needs a period > 0",
                        task.params.name
                    )))
                }
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rt_task::OverrunPolicy;
    use std::io::Write;

    fn write_config(json: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();
        file
    }

    #[test]
    fn parses_tasks_with_defaults() {
        let file = write_config(
            r#"{
                "duration": "1.5",
                "cpu": 1,
                "tasks": [
                    { "name": "tau1", "wcet": "0.002", "period": "0.01", "deadline": "0.008",
                      "release": "periodic", "cpu": 3, "priority": 70,
                      "stats": { "capacity": 16, "policy": "reject" } },
                    { "name": "srv", "wcet": "0.001", "period": "0", "deadline": "0.005",
                      "release": "aperiodic", "release_interval": "0.02", "log": "server.bin" }
                ]
            }"#,
        );
        let experiment = Experiment::from_file(file.path()).unwrap();
        assert_eq!(experiment.duration, Some(Timespec::from_millis(1500)));
        assert_eq!(experiment.start_delay, Timespec::from_millis(100));
        assert!(!experiment.realtime);

        let tau1 = &experiment.tasks[0];
        assert_eq!(experiment.task_cpu(tau1), 3);
        assert_eq!(tau1.priority(), 70);
        assert_eq!(tau1.params.deadline, Timespec::from_millis(8));
        assert_eq!(tau1.params.offset, Timespec::ZERO);
        assert!(tau1.params.stats.enabled);
        assert_eq!(tau1.params.stats.capacity, 16);
        assert_eq!(tau1.params.stats.policy, OverrunPolicy::Reject);
        assert_eq!(tau1.log_path(&experiment.log_dir), PathBuf::from("logs/tau1.log"));

        let srv = &experiment.tasks[1];
        assert_eq!(experiment.task_cpu(srv), 1);
        assert_eq!(srv.priority(), DEFAULT_PRIORITY);
        assert_eq!(srv.params.release, ReleaseKind::Aperiodic);
        assert_eq!(srv.release_interval, Some(Timespec::from_millis(20)));
        assert_eq!(srv.log_path(&experiment.log_dir), PathBuf::from("logs/server.bin"));
    }

    #[test]
    fn aperiodic_task_needs_an_interval() {
        let file = write_config(
            r#"{ "tasks": [ { "name": "srv", "wcet": "0.001", "period": "0",
                 "deadline": "0.005", "release": "aperiodic" } ] }"#,
        );
        assert!(matches!(
            Experiment::from_file(file.path()),
            Err(RtError::InvalidArgument(_))
        ));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let file = write_config(
            r#"{ "tasks": [
                { "name": "a", "wcet": "0.001", "period": "0.01", "deadline": "0.01", "release": "periodic" },
                { "name": "a", "wcet": "0.001", "period": "0.01", "deadline": "0.01", "release": "periodic" }
            ] }"#,
        );
        assert!(Experiment::from_file(file.path()).is_err());
    }

    #[test]
    fn malformed_duration_is_a_serde_error() {
        let file = write_config(r#"{ "duration": "soon", "tasks": [] }"#);
        assert!(matches!(Experiment::from_file(file.path()), Err(RtError::Serde(_))));
    }
}
