//! Weighted multi-phase progress
//!
//! A job is a fixed sequence of named phases of very different cost:
//! reading the archive history is quick, copying files is not. [`Progress`]
//! maps "which phase am I in, and how far into it" onto one overall fraction
//! so callers only ever see a single number in `0..=1`.
//!
//! ```rust
//! use murphy::Progress;
//!
//! let mut progress = Progress::new([("scan", 0.5), ("copy", 0.5)]);
//! assert_eq!(progress.value(), 0.0);
//! progress.advance().current(0.5);
//! assert_eq!(progress.value(), 0.75);
//! ```

/// Overall progress across weighted, ordered steps
#[derive(Debug, Clone, PartialEq)]
pub struct Progress {
    steps: Vec<(String, f64)>,
    step: usize,
    fraction: f64,
}

impl Progress {
    /// Create a tracker from ordered `(name, weight)` pairs
    ///
    /// Weights conventionally sum to 1.
    pub fn new<I, S>(steps: I) -> Self
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        Self {
            steps: steps.into_iter().map(|(name, w)| (name.into(), w)).collect(),
            step: 0,
            fraction: 0.0,
        }
    }

    /// Move to the next step, resetting the within-step fraction
    pub fn advance(&mut self) -> &mut Self {
        if self.step < self.steps.len() {
            self.step += 1;
        }
        self.fraction = 0.0;
        self
    }

    /// Set how far into the current step the job is (clamped to `0..=1`)
    pub fn current(&mut self, fraction: f64) -> &mut Self {
        self.fraction = if fraction.is_nan() {
            0.0
        } else {
            fraction.clamp(0.0, 1.0)
        };
        self
    }

    /// Return to the first step at zero
    pub fn reset(&mut self) -> &mut Self {
        self.step = 0;
        self.fraction = 0.0;
        self
    }

    /// Name of the current step, `None` once every step has completed
    pub fn step_name(&self) -> Option<&str> {
        self.steps.get(self.step).map(|(name, _)| name.as_str())
    }

    /// Weighted overall completion
    pub fn value(&self) -> f64 {
        self.steps
            .iter()
            .take(self.step + 1)
            .enumerate()
            .map(|(i, (_, weight))| {
                if i == self.step {
                    weight * self.fraction
                } else {
                    *weight
                }
            })
            .sum()
    }
}
