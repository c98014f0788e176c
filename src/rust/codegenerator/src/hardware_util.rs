// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Numeric tables and register values computed ahead of the experiment.

use sequence_compiler::Location;
use sequence_units::{Formula, Seconds};

use crate::device::SweepDirection;
use crate::{Error, Result};

/// Duration of one AD9910 sync clock cycle.
pub const DDS_SYNC_CLOCK_PERIOD: Seconds = 4e-9;
/// Frequency tuning words per Hz at a 1 GHz system clock.
pub const FTW_PER_HZ: f64 = 4294967296.0 / 1e9;
/// Full scale amplitude scale factor.
pub const ASF_FULL_SCALE: f64 = 16383.0;
/// Target number of ramp steps of a DDS sweep.
const RAMP_STEPS: u64 = 1000;

/// `count` voltages following `formula`, rescaled so that its minimum maps
/// to `start` and its maximum to `end`.
pub fn sweep_voltages(
    formula_text: &str,
    count: usize,
    start: f64,
    end: f64,
    location: &Location,
) -> Result<Vec<f64>> {
    let formula =
        Formula::parse(formula_text).map_err(|err| Error::authoring(location, err.to_string()))?;
    let samples = formula.sample_inclusive(count);
    let min = samples.iter().copied().fold(f64::INFINITY, f64::min);
    let max = samples.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let span = max - min;
    if !span.is_finite() || span == 0.0 {
        return Err(Error::authoring(
            location,
            format!("Sweep formula '{formula_text}' must vary over 0 <= x <= 1"),
        ));
    }
    let scale = (end - start) / span;
    let offset = start - min * scale;
    Ok(samples.iter().map(|y| y * scale + offset).collect())
}

/// Step-major table: row `i` holds the value of every column at step `i`.
pub fn transpose(columns: &[Vec<f64>], steps: usize) -> Vec<Vec<f64>> {
    (0..steps)
        .map(|i| columns.iter().map(|column| column[i]).collect())
        .collect()
}

/// Values of `formula_text` at `x = i / count` for `i` in `0..count`.
pub fn ram_samples(formula_text: &str, count: usize, location: &Location) -> Result<Vec<f64>> {
    let formula =
        Formula::parse(formula_text).map_err(|err| Error::authoring(location, err.to_string()))?;
    Ok((0..count)
        .map(|i| formula.eval(i as f64 / count as f64))
        .collect())
}

/// Register values programming an AD9910 digital ramp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RampRegisters {
    pub upper_limit: i64,
    pub lower_limit: i64,
    pub ramp_rate: i64,
    pub decrement_step: i64,
    pub increment_step: i64,
}

/// Direction of a ramp from `start` towards `target`.
pub fn sweep_direction(start: f64, target: f64) -> SweepDirection {
    if target < start {
        SweepDirection::Down
    } else {
        SweepDirection::Up
    }
}

/// Ramp rate and step count covering `duration` in about [`RAMP_STEPS`] steps.
fn ramp_timing(duration: Seconds) -> (i64, i64) {
    let duration_mu = (duration / DDS_SYNC_CLOCK_PERIOD).max(0.0) as u64;
    let ramp_rate = duration_mu.div_ceil(RAMP_STEPS).clamp(1, u16::MAX as u64);
    let steps = duration_mu.div_ceil(ramp_rate).max(1);
    (ramp_rate as i64, steps as i64)
}

fn ramp_registers(
    start_mu: i64,
    target_mu: i64,
    shift: u32,
    duration: Seconds,
    direction: SweepDirection,
) -> RampRegisters {
    let (ramp_rate, steps) = ramp_timing(duration);
    let step = ((start_mu - target_mu).abs() + steps - 1) / steps;
    match direction {
        SweepDirection::Up => RampRegisters {
            upper_limit: target_mu << shift,
            lower_limit: start_mu << shift,
            ramp_rate,
            decrement_step: 0,
            increment_step: step << shift,
        },
        SweepDirection::Down => RampRegisters {
            upper_limit: start_mu << shift,
            lower_limit: target_mu << shift,
            ramp_rate: ramp_rate << 16,
            decrement_step: step << shift,
            increment_step: 1_i64 << 31,
        },
    }
}

pub fn frequency_ramp(
    freq: f64,
    sweep_freq: f64,
    duration: Seconds,
    direction: SweepDirection,
) -> RampRegisters {
    let freq_mu = (freq * FTW_PER_HZ) as i64;
    let sweep_freq_mu = (sweep_freq * FTW_PER_HZ) as i64;
    ramp_registers(freq_mu, sweep_freq_mu, 0, duration, direction)
}

pub fn amplitude_ramp(
    amp: f64,
    sweep_amp: f64,
    duration: Seconds,
    direction: SweepDirection,
) -> RampRegisters {
    let amp_mu = (amp * ASF_FULL_SCALE).round_ties_even() as i64;
    let sweep_amp_mu = (sweep_amp * ASF_FULL_SCALE).round_ties_even() as i64;
    ramp_registers(amp_mu, sweep_amp_mu, 18, duration, direction)
}

/// Mirny attenuator setting in machine units for `attenuation` dB.
pub fn mirny_attenuation_mu(attenuation: f64) -> i64 {
    255 - (attenuation * 8.0).round_ties_even() as i64
}
