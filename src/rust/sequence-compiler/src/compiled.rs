// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Output of the time and value compilers.
//!
//! All text has been resolved to numbers. Times of a subsequence's segments
//! are relative to the start of one repetition of that subsequence.

use indexmap::IndexMap;
use serde::Serialize;

use crate::port_state::{RamDestination, RamMode};
use crate::Seconds;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CompiledSegment {
    PortState(CompiledPortStates),
    Subsequence(CompiledSubsequence),
    TriggerWait(CompiledTriggerWait),
}

impl CompiledSegment {
    pub fn time(&self) -> Seconds {
        match self {
            CompiledSegment::PortState(segment) => segment.time,
            CompiledSegment::Subsequence(segment) => segment.time,
            CompiledSegment::TriggerWait(segment) => segment.time,
        }
    }

    pub fn duration(&self) -> Seconds {
        match self {
            CompiledSegment::PortState(segment) => segment.duration,
            CompiledSegment::Subsequence(segment) => segment.duration,
            CompiledSegment::TriggerWait(segment) => segment.duration,
        }
    }

    pub fn end(&self) -> Seconds {
        self.time() + self.duration()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompiledPortStates {
    pub time: Seconds,
    pub duration: Seconds,
    pub single_duration: Seconds,
    pub ports: IndexMap<String, CompiledPortState>,
    pub rpcs: IndexMap<String, CompiledRpc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompiledSubsequence {
    pub name: String,
    pub time: Seconds,
    pub single_duration: Seconds,
    pub duration: Seconds,
    pub repeats: u64,
    pub subsequence: Vec<CompiledSegment>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompiledTriggerWait {
    pub time: Seconds,
    pub duration: Seconds,
    pub single_duration: Seconds,
    /// Physical TTL device the trigger arrives on.
    pub input_ttl: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CompiledPortState {
    Ttl(CompiledTtl),
    Dac(CompiledDac),
    Sampler(CompiledSampler),
    Dds(CompiledDds),
    RfSynth(CompiledRfSynth),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompiledTtl {
    /// Output level after applying the port's inversion.
    pub state: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompiledDac {
    pub voltage: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sweep_voltage: Option<f64>,
    pub formula_text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompiledSampler {
    pub freq: f64,
}

/// Frequency, amplitude and phase of a DDS tone.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DdsTone {
    pub freq: f64,
    pub amp: f64,
    pub phase: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RamProfile {
    #[serde(rename = "ram_profile")]
    pub profile: u32,
    #[serde(rename = "ram_start")]
    pub start: u32,
    #[serde(rename = "ram_end")]
    pub end: u32,
    #[serde(rename = "ram_step_size")]
    pub step_size: u32,
    #[serde(rename = "ram_phase_formula")]
    pub phase_formula: String,
    #[serde(rename = "ram_amplitude_formula")]
    pub amplitude_formula: String,
    #[serde(rename = "ram_frequency_formula")]
    pub frequency_formula: String,
    #[serde(rename = "ram_destination")]
    pub destination: RamDestination,
    #[serde(rename = "ram_mode")]
    pub mode: RamMode,
}

impl RamProfile {
    /// Number of RAM words the profile spans.
    pub fn step_count(&self) -> usize {
        (self.end - self.start + 1) as usize
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DdsMode {
    Normal,
    SweepFreq {
        sweep_freq: f64,
        /// Defaults to the segment duration when absent.
        sweep_duration: Option<Seconds>,
    },
    SweepAmp {
        sweep_amp: f64,
        sweep_duration: Option<Seconds>,
    },
    RamWrite(RamProfile),
    RamExecute { ram_profile: u32 },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompiledDds {
    pub switch: Option<bool>,
    pub attenuation: Option<f64>,
    /// Absent when the mode fields are disabled.
    #[serde(flatten)]
    pub tone: Option<DdsTone>,
    #[serde(flatten)]
    pub mode: DdsMode,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompiledRfSynth {
    pub freq: Option<f64>,
    pub attenuation: Option<f64>,
    pub switch: Option<bool>,
    #[serde(rename = "skipInit")]
    pub skip_init: bool,
    #[serde(rename = "useAlmazny")]
    pub use_almazny: bool,
}

/// A positional RPC argument, typed by what it parses as.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RpcArg {
    Int(i64),
    Float(f64),
    Text(String),
}

impl RpcArg {
    pub fn parse(text: &str) -> Self {
        if let Ok(value) = text.parse::<i64>() {
            RpcArg::Int(value)
        } else if let Ok(value) = text.parse::<f64>() {
            RpcArg::Float(value)
        } else {
            RpcArg::Text(text.to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompiledRpc {
    pub args: Vec<RpcArg>,
    pub kargs: IndexMap<String, String>,
}

/// A fully compiled top-level sequence.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompiledProgram {
    pub name: String,
    pub segments: Vec<CompiledSegment>,
    /// End time of the last top-level segment.
    pub duration: Seconds,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_rpc_arg_parse() {
        assert_eq!(RpcArg::parse("42"), RpcArg::Int(42));
        assert_eq!(RpcArg::parse("-1.5"), RpcArg::Float(-1.5));
        assert_eq!(RpcArg::parse("1e3"), RpcArg::Float(1000.0));
        assert_eq!(RpcArg::parse("hello"), RpcArg::Text("hello".to_string()));
    }

    #[test]
    fn test_serialize_dds() {
        let dds = CompiledPortState::Dds(CompiledDds {
            switch: Some(true),
            attenuation: None,
            tone: Some(DdsTone {
                freq: 1e8,
                amp: 1.0,
                phase: 0.0,
            }),
            mode: DdsMode::SweepFreq {
                sweep_freq: 2e8,
                sweep_duration: None,
            },
        });
        assert_eq!(
            serde_json::to_value(&dds).unwrap(),
            json!({
                "switch": true,
                "attenuation": null,
                "freq": 1e8,
                "amp": 1.0,
                "phase": 0.0,
                "mode": "sweep_freq",
                "sweep_freq": 2e8,
                "sweep_duration": null
            })
        );
    }

    #[test]
    fn test_ram_step_count() {
        let profile = RamProfile {
            profile: 1,
            start: 0,
            end: 1023,
            step_size: 16,
            phase_formula: "0.0".to_string(),
            amplitude_formula: "x".to_string(),
            frequency_formula: "1e6".to_string(),
            destination: RamDestination::Asf,
            mode: RamMode::RampUp,
        };
        assert_eq!(profile.step_count(), 1024);
    }
}
