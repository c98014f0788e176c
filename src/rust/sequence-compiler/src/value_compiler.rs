// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Resolution of raw port states into plain values.
//!
//! Every text field goes through alias substitution first, then expression
//! evaluation, then its unit factor. DAC values in a port's calibration unit
//! are read through the port's calibration curve instead.

use indexmap::IndexMap;
use sequence_units::{FieldValue, Formula, Substitute};

use crate::compiled::{
    CompiledDac, CompiledDds, CompiledPortState, CompiledRfSynth, CompiledRpc, CompiledSampler,
    CompiledTtl, DdsMode, DdsTone, RamProfile, RpcArg,
};
use crate::context::CompileContext;
use crate::labsetup::{Module, Port};
use crate::model::RpcCall;
use crate::port_state::{
    DacState, DdsModeSelect, DdsState, RawPortState, RfSynthState, SamplerState, TtlState,
};
use crate::{Error, Location, Result, ResultExt};

/// Highest RAM word address of the AD9910.
const RAM_LAST_ADDRESS: i64 = 1023;
/// Number of single-tone/RAM profiles of the AD9910.
const PROFILE_COUNT: i64 = 8;

pub fn compile_port_state(
    ctx: &CompileContext,
    port_name: &str,
    raw: &serde_json::Value,
    location: &Location,
) -> Result<CompiledPortState> {
    let location = location.port(port_name);
    let port = ctx.lab_setup.port(port_name)?;
    let module = port.module()?;
    let variables: &dyn Substitute = ctx.variables;
    let compiled = match RawPortState::from_value(module, raw, &location)? {
        RawPortState::Ttl(state) => CompiledPortState::Ttl(compile_ttl(port, &state)),
        RawPortState::Dac(state) => {
            CompiledPortState::Dac(compile_dac(port, &state, variables, &location)?)
        }
        RawPortState::Sampler(state) => {
            CompiledPortState::Sampler(compile_sampler(&state, variables, &location)?)
        }
        RawPortState::Dds(state) => {
            CompiledPortState::Dds(compile_dds(&state, variables, &location)?)
        }
        RawPortState::RfSynth(state) => {
            CompiledPortState::RfSynth(compile_rf_synth(&state, variables, &location)?)
        }
    };
    debug_assert!(matches!(
        (module, &compiled),
        (Module::Ttl, CompiledPortState::Ttl(_))
            | (
                Module::Zotino | Module::Fastino | Module::CurrentDriver,
                CompiledPortState::Dac(_)
            )
            | (Module::Sampler, CompiledPortState::Sampler(_))
            | (Module::Ad9910, CompiledPortState::Dds(_))
            | (Module::Adf5356, CompiledPortState::RfSynth(_))
    ));
    Ok(compiled)
}

fn compile_ttl(port: &Port, state: &TtlState) -> CompiledTtl {
    CompiledTtl {
        state: state.state ^ port.inverted,
    }
}

fn resolve(field: &FieldValue, variables: &dyn Substitute, location: &Location) -> Result<f64> {
    field.resolve(variables).located(location)
}

/// Resolve a field that must hold a whole number.
pub(crate) fn resolve_integer(
    field: &FieldValue,
    variables: &dyn Substitute,
    location: &Location,
    what: &str,
) -> Result<i64> {
    let value = resolve(field, variables, location)?;
    if value.fract() != 0.0 || value.abs() > i64::MAX as f64 {
        return Err(Error::authoring(
            location,
            format!("{what} must be an integer, got {value}"),
        ));
    }
    Ok(value as i64)
}

fn resolve_dac_value(
    port: &Port,
    field: &FieldValue,
    variables: &dyn Substitute,
    location: &Location,
) -> Result<f64> {
    let unit_text = field.unit().map(|unit| unit.text.as_str()).unwrap_or_default();
    if !port.is_calibration_unit(unit_text) {
        return resolve(field, variables, location);
    }
    if !port.calibration_enabled {
        return Err(Error::authoring(
            location,
            "Calibration disabled but calibration unit still selected",
        ));
    }
    let reader = port.calibration_reader().located(location)?;
    field
        .resolve_with(variables, |text| reader.read(text))
        .located(location)
}

fn compile_dac(
    port: &Port,
    state: &DacState,
    variables: &dyn Substitute,
    location: &Location,
) -> Result<CompiledDac> {
    let voltage = resolve_dac_value(port, &state.voltage, variables, location)?;
    let sweep_voltage = if state.sweep_enable {
        Some(resolve_dac_value(port, &state.sweep_voltage, variables, location)?)
    } else {
        None
    };
    let formula_text = if state.formula_enable {
        let text = state.formula_text.substituted(variables).located(location)?;
        Formula::parse(&text).located(location)?;
        text
    } else {
        "x".to_string()
    };
    Ok(CompiledDac {
        voltage,
        sweep_voltage,
        formula_text,
    })
}

fn compile_sampler(
    state: &SamplerState,
    variables: &dyn Substitute,
    location: &Location,
) -> Result<CompiledSampler> {
    Ok(CompiledSampler {
        freq: resolve(&state.freq, variables, location)?,
    })
}

fn ram_formula(text: &str, variables: &dyn Substitute, location: &Location) -> Result<String> {
    let substituted = variables.substitute(text).located(location)?;
    Formula::parse(&substituted).located(location)?;
    Ok(substituted)
}

fn ram_field(
    field: &FieldValue,
    variables: &dyn Substitute,
    location: &Location,
    what: &str,
) -> Result<i64> {
    if field.is_blank() {
        return Err(Error::authoring(
            location,
            format!("RAM profile parameter '{what}' is missing"),
        ));
    }
    resolve_integer(field, variables, location, what)
}

fn ram_profile_index(
    state: &DdsState,
    variables: &dyn Substitute,
    location: &Location,
) -> Result<u32> {
    let profile = ram_field(&state.ram_profile, variables, location, "ram_profile")?;
    if !(0..PROFILE_COUNT).contains(&profile) {
        return Err(Error::authoring(
            location,
            format!("RAM profile must be between 0 and {}, got {profile}", PROFILE_COUNT - 1),
        ));
    }
    Ok(profile as u32)
}

fn compile_ram_profile(
    state: &DdsState,
    variables: &dyn Substitute,
    location: &Location,
) -> Result<RamProfile> {
    let profile = ram_profile_index(state, variables, location)?;
    let start = ram_field(&state.ram_start, variables, location, "ram_start")?;
    let end = ram_field(&state.ram_end, variables, location, "ram_end")?;
    let step_size = ram_field(&state.ram_step_size, variables, location, "ram_step_size")?;
    if start < 0 || end > RAM_LAST_ADDRESS || start > end {
        return Err(Error::authoring(
            location,
            format!(
                "RAM range {start}..{end} must satisfy 0 <= start <= end <= {RAM_LAST_ADDRESS}"
            ),
        ));
    }
    if step_size < 1 || step_size > u16::MAX as i64 {
        return Err(Error::authoring(
            location,
            format!("RAM step size must be between 1 and {}, got {step_size}", u16::MAX),
        ));
    }
    Ok(RamProfile {
        profile,
        start: start as u32,
        end: end as u32,
        step_size: step_size as u32,
        phase_formula: ram_formula(&state.ram_phase_formula, variables, location)?,
        amplitude_formula: ram_formula(&state.ram_amplitude_formula, variables, location)?,
        frequency_formula: ram_formula(&state.ram_frequency_formula, variables, location)?,
        destination: state
            .ram_destination
            .parse()
            .map_err(|msg: String| Error::authoring(location, msg))?,
        mode: state
            .ram_mode
            .parse()
            .map_err(|msg: String| Error::authoring(location, msg))?,
    })
}

fn compile_dds(
    state: &DdsState,
    variables: &dyn Substitute,
    location: &Location,
) -> Result<CompiledDds> {
    let switch = state.switch_enable.then_some(state.switch);
    let attenuation = if state.attenuation_enable {
        Some(resolve(&state.attenuation, variables, location)?)
    } else {
        None
    };
    if !state.mode_enable {
        return Ok(CompiledDds {
            switch,
            attenuation,
            tone: None,
            mode: DdsMode::Normal,
        });
    }
    let tone = DdsTone {
        amp: resolve(&state.amp, variables, location)?,
        freq: resolve(&state.freq, variables, location)?,
        phase: resolve(&state.phase, variables, location)?,
    };
    let sweep_duration = || -> Result<Option<f64>> {
        if state.sweep_duration_enable {
            Ok(Some(resolve(&state.sweep_duration, variables, location)?))
        } else {
            Ok(None)
        }
    };
    let selected: DdsModeSelect = state
        .mode
        .parse()
        .map_err(|msg: String| Error::authoring(location, msg))?;
    let mode = match selected {
        DdsModeSelect::Normal => DdsMode::Normal,
        DdsModeSelect::SweepFrequency => DdsMode::SweepFreq {
            sweep_freq: resolve(&state.sweep_freq, variables, location)?,
            sweep_duration: sweep_duration()?,
        },
        DdsModeSelect::SweepAmplitude => DdsMode::SweepAmp {
            sweep_amp: resolve(&state.sweep_amp, variables, location)?,
            sweep_duration: sweep_duration()?,
        },
        DdsModeSelect::WriteRamProfile => {
            DdsMode::RamWrite(compile_ram_profile(state, variables, location)?)
        }
        DdsModeSelect::ExecuteRamProfile => DdsMode::RamExecute {
            ram_profile: ram_profile_index(state, variables, location)?,
        },
    };
    Ok(CompiledDds {
        switch,
        attenuation,
        tone: Some(tone),
        mode,
    })
}

fn compile_rf_synth(
    state: &RfSynthState,
    variables: &dyn Substitute,
    location: &Location,
) -> Result<CompiledRfSynth> {
    let freq = if state.freq_enable {
        Some(resolve(&state.freq, variables, location)?)
    } else {
        None
    };
    let attenuation = if state.attenuation_enable {
        Some(resolve(&state.attenuation, variables, location)?)
    } else {
        None
    };
    let switch = state.switch_enable.then_some(state.switch);
    if state.use_almazny && (attenuation.is_some() ^ switch.is_some()) {
        return Err(Error::authoring(
            location,
            "Almazny attenuation and switch must be set together",
        ));
    }
    Ok(CompiledRfSynth {
        freq,
        attenuation,
        switch,
        skip_init: state.skip_init,
        use_almazny: state.use_almazny,
    })
}

/// Split, substitute and type the arguments of an RPC call.
pub fn compile_rpc(
    call: &RpcCall,
    variables: &dyn Substitute,
    location: &Location,
) -> Result<CompiledRpc> {
    let mut args = Vec::new();
    for token in call.args.split(' ').filter(|token| !token.is_empty()) {
        let text = variables.substitute(token).located(location)?;
        if text.contains('"') || text.contains('\'') {
            return Err(Error::authoring(location, "No \" or ' allowed in args"));
        }
        args.push(RpcArg::parse(&text));
    }
    let kargs = call
        .kargs
        .iter()
        .map(|(key, value)| Ok((key.clone(), variables.substitute(value).located(location)?)))
        .collect::<Result<IndexMap<_, _>>>()?;
    Ok(CompiledRpc { args, kargs })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labsetup::{CalibrationMode, LabSetup};
    use crate::store::SequenceStore;
    use crate::port_state::RamDestination;
    use crate::ErrorKind;
    use serde_json::json;
    use sequence_units::{Unit, Variable, VariableTable};

    fn lab_setup() -> LabSetup {
        let mut lab_setup = LabSetup::default();
        let mut led = Port::new(Module::Ttl, "ttl4", None::<String>);
        led.inverted = true;
        lab_setup.add_port("led", led);
        let mut coil = Port::new(Module::Zotino, "zotino0", Some("2"));
        coil.calibration_enabled = true;
        coil.calibration_unit_text = "G".to_string();
        coil.calibration_to_unit = Some(Unit::new("V", 1.0));
        coil.calibration_mode = CalibrationMode::Formula;
        coil.calibration_formula = "x/10".to_string();
        lab_setup.add_port("coil", coil);
        let mut uncalibrated = Port::new(Module::Fastino, "fastino0", Some("0"));
        uncalibrated.calibration_unit_text = "G".to_string();
        lab_setup.add_port("fast", uncalibrated);
        lab_setup.add_port("dds", Port::new(Module::Ad9910, "urukul0_ch0", Some("0")));
        lab_setup.add_port("rf", Port::new(Module::Adf5356, "mirny0_ch1", Some("1")));
        lab_setup.add_port("adc", Port::new(Module::Sampler, "sampler0", Some("0")));
        lab_setup
    }

    fn compile(
        port: &str,
        raw: serde_json::Value,
        variables: &VariableTable,
    ) -> Result<CompiledPortState> {
        let sequences = SequenceStore::default();
        let lab_setup = lab_setup();
        let ctx = CompileContext::new(&sequences, &lab_setup, variables);
        compile_port_state(&ctx, port, &raw, &Location::sequence("main").segment("s0"))
    }

    #[test]
    fn test_ttl_inversion() {
        let compiled = compile("led", json!({"state": true}), &VariableTable::default()).unwrap();
        assert_eq!(compiled, CompiledPortState::Ttl(CompiledTtl { state: false }));
    }

    #[test]
    fn test_dac_with_alias_and_calibration() {
        let mut variables = VariableTable::default();
        variables.insert("Field", Variable::new("$field", "25"));
        let compiled = compile(
            "coil",
            json!({
                "voltage": {"text": "$field", "unit": {"text": "G", "factor": 1.0}},
                "sweep_enable": true,
                "sweep_voltage": {"text": "500", "unit": {"text": "mV", "factor": 0.001}},
                "formula_enable": true,
                "formula_text": "x**2"
            }),
            &variables,
        )
        .unwrap();
        let CompiledPortState::Dac(dac) = compiled else {
            panic!("expected DAC");
        };
        assert!((dac.voltage - 2.5).abs() < 1e-12);
        assert_eq!(dac.sweep_voltage, Some(0.5));
        assert_eq!(dac.formula_text, "x**2");
    }

    #[test]
    fn test_disabled_calibration_unit() {
        let err = compile(
            "fast",
            json!({"voltage": {"text": "1", "unit": {"text": "G", "factor": 1.0}}}),
            &VariableTable::default(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authoring);
        assert!(
            err.to_string()
                .contains("Calibration disabled but calibration unit still selected")
        );
        assert!(err.to_string().contains("port 'fast'"));
    }

    #[test]
    fn test_dds_modes() {
        let variables = VariableTable::default();
        let CompiledPortState::Dds(dds) = compile(
            "dds",
            json!({"mode": "Sweep amplitude", "attenuation_enable": true, "switch_enable": false}),
            &variables,
        )
        .unwrap() else {
            panic!("expected DDS");
        };
        assert_eq!(dds.switch, None);
        assert_eq!(dds.attenuation, Some(10.0));
        assert_eq!(
            dds.mode,
            DdsMode::SweepAmp {
                sweep_amp: 0.5,
                sweep_duration: None
            }
        );

        let CompiledPortState::Dds(dds) = compile(
            "dds",
            json!({"mode": "Write RAM Profile", "ram_destination": "RAM_DEST_ASF",
                   "ram_amplitude_formula": "x"}),
            &variables,
        )
        .unwrap() else {
            panic!("expected DDS");
        };
        let DdsMode::RamWrite(profile) = dds.mode else {
            panic!("expected RAM write");
        };
        assert_eq!(profile.step_count(), 1024);
        assert_eq!(profile.destination, RamDestination::Asf);

        let CompiledPortState::Dds(dds) =
            compile("dds", json!({"mode_enable": false, "mode": "bogus"}), &variables).unwrap()
        else {
            panic!("expected DDS");
        };
        assert_eq!(dds.tone, None);
        assert_eq!(dds.mode, DdsMode::Normal);
    }

    #[test]
    fn test_dds_errors() {
        let variables = VariableTable::default();
        let err = compile("dds", json!({"mode": "Sweep phase"}), &variables).unwrap_err();
        assert!(err.to_string().contains("Unknown DDS mode"));
        let err = compile(
            "dds",
            json!({"mode": "Write RAM Profile", "ram_start": ""}),
            &variables,
        )
        .unwrap_err();
        assert!(err.to_string().contains("ram_start"));
        let err = compile(
            "dds",
            json!({"mode": "Write RAM Profile", "ram_start": "10", "ram_end": "5"}),
            &variables,
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authoring);
    }

    #[test]
    fn test_almazny_pairing() {
        let variables = VariableTable::default();
        let err = compile("rf", json!({"useAlmazny": true}), &variables).unwrap_err();
        assert!(err.to_string().contains("must be set together"));
        let CompiledPortState::RfSynth(rf) = compile(
            "rf",
            json!({"useAlmazny": true, "attenuation_enable": true, "skipInit": true}),
            &variables,
        )
        .unwrap() else {
            panic!("expected RF synth");
        };
        assert_eq!(rf.freq, Some(1e9));
        assert!(rf.skip_init);
    }

    #[test]
    fn test_sampler_and_unknown_port() {
        let variables = VariableTable::default();
        assert_eq!(
            compile("adc", json!({}), &variables).unwrap(),
            CompiledPortState::Sampler(CompiledSampler { freq: 1e4 })
        );
        let err = compile("nope", json!({}), &variables).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Inventory);
    }

    #[test]
    fn test_compile_rpc() {
        let mut variables = VariableTable::default();
        variables.insert("Count", Variable::new("$n", "3"));
        let call = RpcCall {
            args: "$n  2.5 label".to_string(),
            kargs: [("mode".to_string(), "$n".to_string())].into_iter().collect(),
        };
        let compiled = compile_rpc(&call, &variables, &Location::sequence("main")).unwrap();
        assert_eq!(
            compiled.args,
            vec![
                RpcArg::Int(3),
                RpcArg::Float(2.5),
                RpcArg::Text("label".to_string())
            ]
        );
        assert_eq!(compiled.kargs["mode"], "3");

        let call = RpcCall {
            args: "'quoted'".to_string(),
            kargs: IndexMap::new(),
        };
        assert!(compile_rpc(&call, &variables, &Location::sequence("main")).is_err());
    }
}
