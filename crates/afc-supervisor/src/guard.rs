// SPDX-License-Identifier: MIT OR Apache-2.0
//! Regression guard over the best-score metric.
//!
//! The guard keeps a rolling window of samples. A drop of more than the
//! configured fraction below the window plateau pauses the
//! self-improvement runners; regaining the plateau resumes them.

use std::collections::VecDeque;

/// What the supervisor should do after one observation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GuardDecision {
    /// Nothing to do.
    Hold,
    /// Pause self-improvement runners; the plateau that was lost.
    Pause {
        /// Window maximum at the moment of decline.
        plateau: f64,
    },
    /// The metric recovered; resume paused runners.
    Resume,
}

/// Rolling-window decline detector.
#[derive(Debug, Clone)]
pub struct RegressionGuard {
    window: usize,
    decline: f64,
    samples: VecDeque<f64>,
    plateau: f64,
    paused: bool,
}

impl RegressionGuard {
    /// Create a guard with a window of `window` samples and a pause trigger
    /// of `decline` fractional drop from the plateau.
    #[must_use]
    pub fn new(window: usize, decline: f64) -> Self {
        Self {
            window: window.max(2),
            decline: decline.clamp(0.0, 1.0),
            samples: VecDeque::new(),
            plateau: f64::NEG_INFINITY,
            paused: false,
        }
    }

    /// Returns `true` while the guard holds runners paused.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// The plateau a resume must regain.
    #[must_use]
    pub fn plateau(&self) -> f64 {
        self.plateau
    }

    /// Feed one sample and decide.
    pub fn observe(&mut self, sample: f64) -> GuardDecision {
        self.samples.push_back(sample);
        if self.samples.len() > self.window {
            self.samples.pop_front();
        }

        if self.paused {
            if sample >= self.plateau {
                self.paused = false;
                return GuardDecision::Resume;
            }
            return GuardDecision::Hold;
        }

        let window_max = self
            .samples
            .iter()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max);
        if self.samples.len() >= 2 && sample < window_max * (1.0 - self.decline) {
            self.plateau = window_max;
            self.paused = true;
            return GuardDecision::Pause {
                plateau: window_max,
            };
        }
        GuardDecision::Hold
    }
}
