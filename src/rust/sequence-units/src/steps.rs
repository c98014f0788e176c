// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Step counts for DAC voltage sweeps.
//!
//! A sweep is played as a staircase. The number of stairs is bounded by the
//! minimum time one update of the converter takes, and clamped to
//! `[MIN_SWEEP_STEPS, MAX_SWEEP_STEPS]`.

use crate::Seconds;

pub const MIN_SWEEP_STEPS: usize = 2;
pub const MAX_SWEEP_STEPS: usize = 1024;

pub const ZOTINO_MIN_STEP_TIME: Seconds = 32e-6;
pub const FASTINO_MIN_STEP_TIME: Seconds = 1.5e-6;
pub const CURRENT_DRIVER_MIN_STEP_TIME: Seconds = 2e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DacFamily {
    Zotino,
    /// Fastino updates swept channels one after another, so the minimum step
    /// time scales with the number of channels swept in parallel.
    Fastino {
        parallel_channels: usize,
    },
    CurrentDriver,
}

impl DacFamily {
    pub fn min_step_time(&self) -> Seconds {
        match self {
            DacFamily::Zotino => ZOTINO_MIN_STEP_TIME,
            DacFamily::Fastino { parallel_channels } => {
                (*parallel_channels).max(1) as f64 * FASTINO_MIN_STEP_TIME
            }
            DacFamily::CurrentDriver => CURRENT_DRIVER_MIN_STEP_TIME,
        }
    }

    pub fn step_count(&self, duration: Seconds) -> usize {
        let steps = (duration / self.min_step_time()).max(0.0) as usize;
        steps.clamp(MIN_SWEEP_STEPS, MAX_SWEEP_STEPS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zotino_steps() {
        assert_eq!(DacFamily::Zotino.step_count(100e-3), 1024);
        assert_eq!(DacFamily::Zotino.step_count(3.21e-3), 100);
        assert_eq!(DacFamily::Zotino.step_count(10e-6), 2);
        assert_eq!(DacFamily::Zotino.step_count(0.0), 2);
    }

    #[test]
    fn test_fastino_steps_scale_with_channels() {
        let single = DacFamily::Fastino {
            parallel_channels: 1,
        };
        let quad = DacFamily::Fastino {
            parallel_channels: 4,
        };
        assert_eq!(single.step_count(151e-6), 100);
        assert_eq!(quad.step_count(151e-6), 25);
        let none = DacFamily::Fastino {
            parallel_channels: 0,
        };
        assert_eq!(none.step_count(151e-6), 100);
    }

    #[test]
    fn test_current_driver_steps() {
        assert_eq!(DacFamily::CurrentDriver.step_count(1.001e-3), 500);
        assert_eq!(DacFamily::CurrentDriver.step_count(1.0), 1024);
    }
}
