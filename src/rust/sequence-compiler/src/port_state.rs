// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Raw target states as entered by the user, one shape per module family.
//!
//! Missing keys take the same defaults a freshly added port state has.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sequence_units::{FieldValue, Unit};

use crate::labsetup::Module;
use crate::{Error, Location, Result};

fn default_true() -> bool {
    true
}

fn with_unit(text: &str, unit: &str, factor: f64) -> FieldValue {
    FieldValue::with_unit(text, Unit::new(unit, factor))
}

fn text(value: &str) -> FieldValue {
    FieldValue::Text(value.to_string())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TtlState {
    #[serde(default = "default_true")]
    pub state: bool,
}

fn default_voltage() -> FieldValue {
    with_unit("100", "mV", 1e-3)
}
fn default_sweep_voltage() -> FieldValue {
    with_unit("200", "mV", 1e-3)
}
fn default_formula() -> FieldValue {
    text("x")
}

/// State of a Zotino, Fastino or CurrentDriver channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DacState {
    #[serde(default = "default_voltage")]
    pub voltage: FieldValue,
    #[serde(default)]
    pub sweep_enable: bool,
    #[serde(default = "default_sweep_voltage")]
    pub sweep_voltage: FieldValue,
    #[serde(default)]
    pub formula_enable: bool,
    #[serde(default = "default_formula")]
    pub formula_text: FieldValue,
}

fn default_sample_rate() -> FieldValue {
    with_unit("10", "kHz", 1e3)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplerState {
    #[serde(default = "default_sample_rate")]
    pub freq: FieldValue,
}

fn default_attenuation() -> FieldValue {
    with_unit("10", "dB", 1.0)
}
fn default_dds_mode() -> String {
    "Normal".to_string()
}
fn default_dds_freq() -> FieldValue {
    with_unit("100", "MHz", 1e6)
}
fn default_amp() -> FieldValue {
    text("1.0")
}
fn default_phase() -> FieldValue {
    text("0.0")
}
fn default_sweep_freq() -> FieldValue {
    with_unit("200", "MHz", 1e6)
}
fn default_sweep_amp() -> FieldValue {
    text("0.5")
}
fn default_sweep_duration() -> FieldValue {
    with_unit("10", "ms", 1e-3)
}
fn default_ram_phase_formula() -> String {
    "0.0".to_string()
}
fn default_ram_amplitude_formula() -> String {
    "1.0".to_string()
}
fn default_ram_frequency_formula() -> String {
    "1e6".to_string()
}
fn default_ram_profile() -> FieldValue {
    text("1")
}
fn default_ram_start() -> FieldValue {
    text("0")
}
fn default_ram_end() -> FieldValue {
    text("1023")
}
fn default_ram_step_size() -> FieldValue {
    text("16")
}
fn default_ram_destination() -> String {
    "RAM_DEST_POWASF".to_string()
}
fn default_ram_mode() -> String {
    "RAM_MODE_RAMPUP".to_string()
}

/// State of an AD9910 DDS channel on an Urukul board.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DdsState {
    #[serde(default = "default_true")]
    pub switch_enable: bool,
    #[serde(default = "default_true")]
    pub switch: bool,
    #[serde(default)]
    pub attenuation_enable: bool,
    #[serde(default = "default_attenuation")]
    pub attenuation: FieldValue,
    #[serde(default = "default_dds_mode")]
    pub mode: String,
    #[serde(default = "default_true")]
    pub mode_enable: bool,
    #[serde(default = "default_dds_freq")]
    pub freq: FieldValue,
    #[serde(default = "default_amp")]
    pub amp: FieldValue,
    #[serde(default = "default_phase")]
    pub phase: FieldValue,
    #[serde(default = "default_sweep_freq")]
    pub sweep_freq: FieldValue,
    #[serde(default = "default_sweep_amp")]
    pub sweep_amp: FieldValue,
    #[serde(default)]
    pub sweep_duration_enable: bool,
    #[serde(default = "default_sweep_duration")]
    pub sweep_duration: FieldValue,
    #[serde(default = "default_ram_phase_formula")]
    pub ram_phase_formula: String,
    #[serde(default = "default_ram_amplitude_formula")]
    pub ram_amplitude_formula: String,
    #[serde(default = "default_ram_frequency_formula")]
    pub ram_frequency_formula: String,
    #[serde(default = "default_ram_profile")]
    pub ram_profile: FieldValue,
    #[serde(default = "default_ram_start")]
    pub ram_start: FieldValue,
    #[serde(default = "default_ram_end")]
    pub ram_end: FieldValue,
    #[serde(default = "default_ram_step_size")]
    pub ram_step_size: FieldValue,
    #[serde(default = "default_ram_destination")]
    pub ram_destination: String,
    #[serde(default = "default_ram_mode")]
    pub ram_mode: String,
}

fn default_rf_freq() -> FieldValue {
    with_unit("1000", "MHz", 1e6)
}

/// State of an ADF5356 synthesizer channel on a Mirny board.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RfSynthState {
    #[serde(default = "default_true")]
    pub switch_enable: bool,
    #[serde(default = "default_true")]
    pub freq_enable: bool,
    #[serde(default)]
    pub attenuation_enable: bool,
    #[serde(default = "default_true")]
    pub switch: bool,
    #[serde(default = "default_rf_freq")]
    pub freq: FieldValue,
    #[serde(default = "default_attenuation")]
    pub attenuation: FieldValue,
    #[serde(default, rename = "skipInit")]
    pub skip_init: bool,
    #[serde(default, rename = "useAlmazny")]
    pub use_almazny: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RawPortState {
    Ttl(TtlState),
    Dac(DacState),
    Sampler(SamplerState),
    Dds(Box<DdsState>),
    RfSynth(RfSynthState),
}

impl RawPortState {
    /// Read a raw state stored under a port wired to `module`.
    pub fn from_value(
        module: Module,
        value: &serde_json::Value,
        location: &Location,
    ) -> Result<Self> {
        let invalid = |err: serde_json::Error| {
            Error::authoring(location, format!("Invalid {module} port state: {err}"))
        };
        let state = match module {
            Module::Ttl => {
                RawPortState::Ttl(TtlState::deserialize(value).map_err(invalid)?)
            }
            Module::Zotino | Module::Fastino | Module::CurrentDriver => {
                RawPortState::Dac(DacState::deserialize(value).map_err(invalid)?)
            }
            Module::Sampler => {
                RawPortState::Sampler(SamplerState::deserialize(value).map_err(invalid)?)
            }
            Module::Ad9910 => {
                RawPortState::Dds(Box::new(DdsState::deserialize(value).map_err(invalid)?))
            }
            Module::Adf5356 => {
                RawPortState::RfSynth(RfSynthState::deserialize(value).map_err(invalid)?)
            }
        };
        Ok(state)
    }
}

/// The operating mode selected for a DDS channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DdsModeSelect {
    Normal,
    SweepFrequency,
    SweepAmplitude,
    WriteRamProfile,
    ExecuteRamProfile,
}

impl FromStr for DdsModeSelect {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Normal" => Ok(DdsModeSelect::Normal),
            "Sweep frequency" => Ok(DdsModeSelect::SweepFrequency),
            "Sweep amplitude" => Ok(DdsModeSelect::SweepAmplitude),
            "Write RAM Profile" => Ok(DdsModeSelect::WriteRamProfile),
            "Execute RAM Profile" => Ok(DdsModeSelect::ExecuteRamProfile),
            other => Err(format!("Unknown DDS mode '{other}'")),
        }
    }
}

/// What the DDS RAM drives during playback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RamDestination {
    #[serde(rename = "RAM_DEST_ASF")]
    Asf,
    #[serde(rename = "RAM_DEST_POW")]
    Pow,
    #[serde(rename = "RAM_DEST_FTW")]
    Ftw,
    #[serde(rename = "RAM_DEST_POWASF")]
    PowAsf,
}

impl RamDestination {
    pub fn as_str(&self) -> &'static str {
        match self {
            RamDestination::Asf => "RAM_DEST_ASF",
            RamDestination::Pow => "RAM_DEST_POW",
            RamDestination::Ftw => "RAM_DEST_FTW",
            RamDestination::PowAsf => "RAM_DEST_POWASF",
        }
    }
}

impl FromStr for RamDestination {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RAM_DEST_ASF" => Ok(RamDestination::Asf),
            "RAM_DEST_POW" => Ok(RamDestination::Pow),
            "RAM_DEST_FTW" => Ok(RamDestination::Ftw),
            "RAM_DEST_POWASF" => Ok(RamDestination::PowAsf),
            other => Err(format!("Unknown RAM destination '{other}'")),
        }
    }
}

/// Playback mode of a DDS RAM profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RamMode {
    #[serde(rename = "RAM_MODE_DIRECTSWITCH")]
    DirectSwitch,
    #[serde(rename = "RAM_MODE_RAMPUP")]
    RampUp,
    #[serde(rename = "RAM_MODE_BIDIR_RAMP")]
    BidirRamp,
    #[serde(rename = "RAM_MODE_CONT_RAMPUP")]
    ContRampUp,
    #[serde(rename = "RAM_MODE_CONT_BIDIR_RAMP")]
    ContBidirRamp,
}

impl RamMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RamMode::DirectSwitch => "RAM_MODE_DIRECTSWITCH",
            RamMode::RampUp => "RAM_MODE_RAMPUP",
            RamMode::BidirRamp => "RAM_MODE_BIDIR_RAMP",
            RamMode::ContRampUp => "RAM_MODE_CONT_RAMPUP",
            RamMode::ContBidirRamp => "RAM_MODE_CONT_BIDIR_RAMP",
        }
    }
}

impl FromStr for RamMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RAM_MODE_DIRECTSWITCH" => Ok(RamMode::DirectSwitch),
            "RAM_MODE_RAMPUP" => Ok(RamMode::RampUp),
            "RAM_MODE_BIDIR_RAMP" => Ok(RamMode::BidirRamp),
            "RAM_MODE_CONT_RAMPUP" => Ok(RamMode::ContRampUp),
            "RAM_MODE_CONT_BIDIR_RAMP" => Ok(RamMode::ContBidirRamp),
            other => Err(format!("Unknown RAM mode '{other}'")),
        }
    }
}
