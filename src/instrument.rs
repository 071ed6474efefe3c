//! A registry of moving averages, e.g. of how long logging or executing takes.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use instant::Instant;

use crate::util::lock;

/// Exponential moving averages keyed by operation name.
///
/// One registry is created per node and handed to whatever wants to record
/// into it.
#[derive(Debug)]
pub struct Instrumentation {
    alpha: f64,
    averages: Mutex<BTreeMap<String, f64>>,
}

impl Instrumentation {
    pub fn new(alpha: f64) -> Self {
        assert!(alpha > 0.0 && alpha <= 1.0, "alpha must be in (0, 1]");

        Self {
            alpha,
            averages: Mutex::new(BTreeMap::new()),
        }
    }

    /// Records the time elapsed since `start`, in milliseconds.
    pub fn update_delay(&self, op: &str, start: Instant) {
        self.update_duration(op, start.elapsed());
    }

    pub fn update_duration(&self, op: &str, delay: Duration) {
        self.update_value(op, delay.as_secs_f64() * 1000.0);
    }

    pub fn update_value(&self, op: &str, value: f64) {
        let mut averages = lock(&self.averages);

        match averages.get_mut(op) {
            Some(average) => *average = (1.0 - self.alpha) * *average + self.alpha * value,
            None => {
                averages.insert(op.to_string(), value);
            }
        }
    }

    pub fn get(&self, op: &str) -> Option<f64> {
        lock(&self.averages).get(op).copied()
    }
}

impl Default for Instrumentation {
    fn default() -> Self {
        Self::new(0.05)
    }
}

impl std::fmt::Display for Instrumentation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let averages = lock(&self.averages);

        f.write_str("[")?;
        for (i, (op, average)) in averages.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}:{:.3}", op, average)?;
        }
        f.write_str("]")
    }
}
