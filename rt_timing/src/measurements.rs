use crate::Timespec;
use core::fmt::Display;
use serde::{Deserialize, Serialize};

/// Running statistics over a stream of durations.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MeasureValues {
    pub cumulative_average: f64,
    pub cumulative_sum_of_squares: f64,
    pub min: Timespec,
    pub max: Timespec,
    pub total_time: Timespec,
    pub number_of_measurements: u64,
}

impl MeasureValues {
    pub fn register_data_point(&mut self, value: Timespec) {
        let x = value.as_secs_f64();
        if self.number_of_measurements == 0 {
            self.cumulative_average = x;
            self.cumulative_sum_of_squares = 0.0;
            self.number_of_measurements = 1;
            self.min = value;
            self.max = value;
            self.total_time = value;
        } else if self.number_of_measurements == u64::MAX {
            return;
        } else {
            // see Welford's online algorithm
            let delta = x - self.cumulative_average;
            self.number_of_measurements += 1;
            self.cumulative_average += delta / (self.number_of_measurements as f64);
            let delta2 = x - self.cumulative_average;
            self.cumulative_sum_of_squares += delta * delta2;

            self.min = self.min.min(value);
            self.max = self.max.max(value);
            self.total_time += value;
        }
    }

    pub fn variance(&self) -> f64 {
        if self.number_of_measurements == 0 {
            return 0.0;
        }
        self.cumulative_sum_of_squares / (self.number_of_measurements as f64)
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }
}

impl Display for MeasureValues {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let (avg, avg_unit) = format_duration(self.cumulative_average);
        let (dev, dev_unit) = format_duration(self.std_dev());
        let (min, min_unit) = format_duration(self.min.as_secs_f64());
        let (max, max_unit) = format_duration(self.max.as_secs_f64());
        write!(
            f,
            "n={} avg={:.3} {} dev={:.3} {} min={:.3} {} max={:.3} {}",
            self.number_of_measurements,
            avg,
            avg_unit,
            dev,
            dev_unit,
            min,
            min_unit,
            max,
            max_unit
        )
    }
}

/// Scales a duration in seconds to a readable magnitude and unit.
pub fn format_duration(duration: f64) -> (f64, &'static str) {
    if duration >= 60.0 * 60.0 {
        (duration / (60.0 * 60.0), "h")
    } else if duration >= 60.0 {
        (duration / 60.0, "m")
    } else if duration >= 1.0 {
        (duration, " s")
    } else if duration >= 1e-3 {
        (duration * 1e3, "ms")
    } else if duration >= 1e-6 {
        (duration * 1e6, "us")
    } else {
        (duration * 1e9, "ns")
    }
}
