use rt_timing::{TimeError, Timespec};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::io;

#[derive(Debug)]
pub enum RtError {
    /// The caller may not use a real-time scheduling class or the requested affinity
    InsufficientPrivilege(io::Error),
    CalibrationFailed(String),
    DurationTooShort {
        requested: Timespec,
        minimum: Timespec,
    },
    DurationTooLong {
        requested: Timespec,
        maximum: Timespec,
    },
    /// The declared WCET cannot absorb the measured overheads
    BudgetTooSmall {
        wcet: Timespec,
        overhead: Timespec,
    },
    Io(io::Error),
    CorruptLog(String),
    Underflow,
    Overflow,
    InvalidArgument(String),
    Serde(serde_json::Error),
}

impl Display for RtError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            RtError::InsufficientPrivilege(e) => {
                write!(f, "Insufficient privilege for real-time scheduling: {}", e)
            }
            RtError::CalibrationFailed(reason) => write!(f, "Calibration failed: {}", reason),
            RtError::DurationTooShort { requested, minimum } => write!(
                f,
                "Duration too short: {}s requested, at least {}s required",
                requested, minimum
            ),
            RtError::DurationTooLong { requested, maximum } => write!(
                f,
                "Duration too long: {}s requested, at most {}s supported",
                requested, maximum
            ),
            RtError::BudgetTooSmall { wcet, overhead } => write!(
                f,
                "Budget too small: WCET {}s does not exceed overhead {}s",
                wcet, overhead
            ),
            RtError::Io(e) => write!(f, "IO error: {}", e),
            RtError::CorruptLog(reason) => write!(f, "Corrupt statistics log: {}", reason),
            RtError::Underflow => write!(f, "Time subtraction underflow"),
            RtError::Overflow => write!(f, "Time value overflow"),
            RtError::InvalidArgument(reason) => write!(f, "Invalid argument: {}", reason),
            RtError::Serde(e) => write!(f, "Serde error: {}", e),
        }
    }
}

impl Error for RtError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            RtError::InsufficientPrivilege(e) | RtError::Io(e) => Some(e),
            RtError::Serde(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for RtError {
    fn from(error: io::Error) -> Self {
        RtError::Io(error)
    }
}

impl From<serde_json::Error> for RtError {
    fn from(error: serde_json::Error) -> Self {
        RtError::Serde(error)
    }
}

impl From<TimeError> for RtError {
    fn from(error: TimeError) -> Self {
        match error {
            TimeError::Underflow => RtError::Underflow,
            TimeError::Overflow => RtError::Overflow,
            TimeError::Parse(reason) => RtError::InvalidArgument(reason.to_string()),
        }
    }
}

impl RtError {
    /// Classifies an error from a scheduling or affinity call.
    pub(crate) fn from_sched(error: io::Error) -> Self {
        match error.raw_os_error() {
            Some(libc::EPERM) | Some(libc::EACCES) => RtError::InsufficientPrivilege(error),
            _ => RtError::Io(error),
        }
    }
}

pub type Result<T> = std::result::Result<T, RtError>;
