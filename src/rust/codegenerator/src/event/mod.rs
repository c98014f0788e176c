// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Events emitted into the generated experiment.
//!
//! An [`Event`] is one action on one device at one point of the timeline.
//! Each kind knows the code it contributes to the `prepare`, `run` and
//! `analyze` methods, and how far its `run` code moves the kernel's time
//! cursor beyond the start of its group.

mod dac;
mod dds;
mod rf_synth;

pub use dac::{CurrentDriverEvent, FastinoEvent, ZotinoEvent};
pub use dds::{UrukulEvent, WRITE_RAM_FUNCTION};
pub use rf_synth::MirnyEvent;

use indexmap::IndexMap;
use sequence_compiler::Seconds;
use sequence_compiler::compiled::{CompiledRpc, RpcArg};
use sequence_log::warn;
use sequence_units::float_repr;

use crate::Result;
use crate::device::{DeviceArena, DeviceId};
use crate::python::{PythonGenerator, string_literal};
use crate::settings::CodeGeneratorSettings;

/// Earliest a kernel can react to a detected trigger edge.
pub const MIN_REACTION_TIME: Seconds = 1e-5;

/// `self.core.seconds_to_mu(<seconds>)`
pub(crate) fn seconds_to_mu(seconds: Seconds) -> String {
    format!("self.core.seconds_to_mu({})", float_repr(seconds))
}

#[derive(Debug, Clone)]
pub struct TriggerWaitEvent {
    duration_var: String,
    end_var: String,
    edge_var: String,
}

impl TriggerWaitEvent {
    pub fn new(arena: &mut DeviceArena, device: DeviceId) -> Self {
        TriggerWaitEvent {
            duration_var: arena.variable_name(device, "trigger_duration"),
            end_var: arena.variable_name(device, "tEnd"),
            edge_var: arena.variable_name(device, "tEdge"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RpcEvent {
    pub name: String,
    pub args: Vec<RpcArg>,
    pub kargs: IndexMap<String, String>,
}

impl RpcEvent {
    pub fn new(name: &str, rpc: &CompiledRpc) -> Self {
        RpcEvent {
            name: name.to_string(),
            args: rpc.args.clone(),
            kargs: rpc.kargs.clone(),
        }
    }

    fn call_arguments(&self) -> String {
        let mut arguments = vec![string_literal(&self.name)];
        arguments.extend(self.args.iter().map(|arg| match arg {
            RpcArg::Int(value) => value.to_string(),
            RpcArg::Float(value) => float_repr(*value),
            RpcArg::Text(text) => string_literal(text),
        }));
        arguments.extend(
            self.kargs
                .iter()
                .map(|(key, value)| format!("{key}={}", string_literal(value))),
        );
        arguments.join(", ")
    }
}

#[derive(Debug, Clone)]
pub struct SampleEvent {
    pub rate: f64,
    pub sample_count: usize,
}

impl SampleEvent {
    pub fn new(rate: f64, duration: Seconds) -> Self {
        let sample_count = (rate * duration).max(0.0) as usize;
        if sample_count == 0 {
            warn!(
                "Sampling at {} Hz for {} s takes no samples, no code is generated",
                rate,
                duration
            );
        }
        SampleEvent { rate, sample_count }
    }

    fn period(&self) -> Seconds {
        1.0 / self.rate
    }
}

#[derive(Debug, Clone)]
pub enum EventKind {
    Ttl { state: bool },
    TriggerWait(TriggerWaitEvent),
    /// Blocks until the hardware timeline has caught up.
    Wait,
    Rpc(RpcEvent),
    Sample(SampleEvent),
    Zotino(ZotinoEvent),
    Fastino(FastinoEvent),
    CurrentDriver(CurrentDriverEvent),
    Mirny(MirnyEvent),
    Urukul(UrukulEvent),
}

impl EventKind {
    /// Higher priorities run first within one group.
    fn priority(&self) -> i32 {
        match self {
            EventKind::Ttl { .. } => 30,
            EventKind::Fastino(_) => 6,
            EventKind::Zotino(_) => 5,
            EventKind::Sample(_) => 0,
            _ => 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Event {
    pub device: DeviceId,
    pub time: Seconds,
    pub duration: Seconds,
    pub priority: i32,
    /// Counts the event groups the device had events in before this one.
    pub time_index: usize,
    pub kind: EventKind,
}

impl Event {
    pub fn new(
        device: DeviceId,
        time: Seconds,
        duration: Seconds,
        time_index: usize,
        kind: EventKind,
    ) -> Self {
        Event {
            device,
            time,
            duration,
            priority: kind.priority(),
            time_index,
            kind,
        }
    }

    /// Name of the dataset buffer of a sampling event.
    fn dataset_name(&self, arena: &DeviceArena) -> String {
        format!("d{}_{}", arena.get(self.device).name, self.time_index)
    }

    pub fn import_code(&self) -> Option<&'static str> {
        match &self.kind {
            EventKind::Sample(_) => Some("import numpy as np"),
            EventKind::CurrentDriver(_) => Some(dac::CURRENT_DRIVER_IMPORTS),
            EventKind::Urukul(_) => Some("from artiq.coredevice import ad9910, urukul"),
            _ => None,
        }
    }

    pub fn prepare_code(&self, arena: &DeviceArena, code: &mut PythonGenerator) {
        let device = &arena.get(self.device).name;
        match &self.kind {
            EventKind::TriggerWait(wait) => code.add_assignment(
                &wait.duration_var,
                format!(
                    "self.core.seconds_to_mu({} - {})",
                    float_repr(self.duration),
                    float_repr(MIN_REACTION_TIME)
                ),
            ),
            EventKind::Sample(sample) if sample.sample_count > 0 => code.add_assignment(
                self.dataset_name(arena),
                format!("np.full(({},8),0,dtype=float)", sample.sample_count),
            ),
            EventKind::Zotino(event) => event.prepare_code(device, code),
            EventKind::Fastino(event) => event.prepare_code(device, code),
            EventKind::CurrentDriver(event) => event.prepare_code(device, code),
            EventKind::Urukul(event) => event.prepare_code(device, code),
            EventKind::Ttl { .. }
            | EventKind::Sample(_)
            | EventKind::Wait
            | EventKind::Rpc(_)
            | EventKind::Mirny(_) => {}
        }
    }

    pub fn run_code(
        &self,
        arena: &mut DeviceArena,
        settings: &CodeGeneratorSettings,
        code: &mut PythonGenerator,
    ) -> Result<()> {
        let device = arena.get(self.device).name.clone();
        match &self.kind {
            EventKind::Ttl { state } => {
                code.add_line(format!("self.{device}.{}()", if *state { "on" } else { "off" }));
            }
            EventKind::TriggerWait(wait) => {
                code.add_line(format!(
                    "{} = self.{device}.gate_rising_mu(self.{})",
                    wait.end_var, wait.duration_var
                ));
                code.add_line(format!(
                    "{} = self.{device}.timestamp_mu({})",
                    wait.edge_var, wait.end_var
                ));
                let mut on_edge = PythonGenerator::new();
                on_edge.add_line(format!("at_mu({})", wait.edge_var));
                if !settings.relative_timestamps {
                    // Later groups are anchored to the edge instead of the timeout.
                    on_edge.add_line(format!(
                        "start_mu -= ({} - {})",
                        wait.end_var, wait.edge_var
                    ));
                }
                code.add_block(format!("if {} > 0", wait.edge_var), on_edge);
            }
            EventKind::Wait => code.add_line(format!("self.{device}.wait_until_mu(now_mu())")),
            EventKind::Rpc(rpc) => {
                code.add_line("self.core.wait_until_mu(now_mu())");
                code.add_line(format!("self.{device}.run({})", rpc.call_arguments()));
            }
            EventKind::Sample(sample) => {
                if sample.sample_count == 0 {
                    return Ok(());
                }
                let mut parallel = PythonGenerator::new();
                parallel.add_line(format!(
                    "self.{device}.sample(self.{}[i])",
                    self.dataset_name(arena)
                ));
                parallel.add_line(format!("delay({})", float_repr(sample.period())));
                let mut body = PythonGenerator::new();
                body.add_block("with parallel", parallel);
                code.add_block(format!("for i in range({})", sample.sample_count), body);
            }
            EventKind::Zotino(event) => event.run_code(&device, code),
            EventKind::Fastino(event) => event.run_code(&device, code),
            EventKind::CurrentDriver(event) => event.run_code(&device, code),
            EventKind::Mirny(event) => event.run_code(arena, self.device, code)?,
            EventKind::Urukul(event) => event.run_code(arena, self.device, code)?,
        }
        Ok(())
    }

    pub fn analyze_code(&self, arena: &DeviceArena, code: &mut PythonGenerator) {
        if let EventKind::Sample(sample) = &self.kind {
            if sample.sample_count == 0 {
                return;
            }
            let dataset = self.dataset_name(arena);
            let mut body = PythonGenerator::new();
            body.add_line(format!(
                "self.set_dataset(\"{dataset}_data_ch_\" + str(i), self.{dataset}[:,i])"
            ));
            code.add_block("for i in range(8)", body);
            code.add_line(format!(
                "self.set_dataset(\"{dataset}_samplerate\", {:.3})",
                sample.rate
            ));
        }
    }

    /// Time the event's run code advances the time cursor by.
    pub fn time_cursor_shift(&self) -> Seconds {
        match &self.kind {
            EventKind::TriggerWait(_) => self.duration - MIN_REACTION_TIME,
            EventKind::Sample(sample) if sample.sample_count > 0 => {
                sample.sample_count as f64 * sample.period()
            }
            EventKind::Zotino(event) => event.time_cursor_shift(),
            EventKind::Fastino(event) => event.time_cursor_shift(),
            EventKind::CurrentDriver(event) => event.time_cursor_shift(),
            EventKind::Urukul(event) => event.time_cursor_shift(),
            EventKind::Ttl { .. }
            | EventKind::Sample(_)
            | EventKind::Wait
            | EventKind::Rpc(_)
            | EventKind::Mirny(_) => 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceKind, TtlMode};
    use sequence_compiler::Location;

    fn arena_with(name: &str, kind: DeviceKind) -> (DeviceArena, DeviceId) {
        let mut arena = DeviceArena::new("rpc");
        let id = arena
            .get_or_insert_with(name, &Location::default(), |_| Ok(kind))
            .unwrap();
        (arena, id)
    }

    fn run(event: &Event, arena: &mut DeviceArena, settings: &CodeGeneratorSettings) -> String {
        let mut code = PythonGenerator::new();
        event.run_code(arena, settings, &mut code).unwrap();
        code.generate_python()
    }

    #[test]
    fn test_ttl_event() {
        let (mut arena, ttl) = arena_with("ttl4", DeviceKind::Ttl(TtlMode::Output));
        let event = Event::new(ttl, 0.0, 1e-3, 0, EventKind::Ttl { state: true });
        assert_eq!(event.priority, 30);
        assert_eq!(
            run(&event, &mut arena, &CodeGeneratorSettings::default()),
            "self.ttl4.on()\n"
        );
    }

    #[test]
    fn test_trigger_wait_event() {
        let (mut arena, ttl) = arena_with("ttl0", DeviceKind::Ttl(TtlMode::Input));
        let kind = EventKind::TriggerWait(TriggerWaitEvent::new(&mut arena, ttl));
        let event = Event::new(ttl, 0.0, 0.5, 0, kind);

        let mut prepare = PythonGenerator::new();
        event.prepare_code(&arena, &mut prepare);
        assert_eq!(
            prepare.generate_python(),
            "self.ttl0_trigger_duration_0 = self.core.seconds_to_mu(0.5 - 1e-05)\n"
        );
        assert_eq!(
            run(&event, &mut arena, &CodeGeneratorSettings::default()),
            "ttl0_tEnd_0 = self.ttl0.gate_rising_mu(self.ttl0_trigger_duration_0)\n\
             ttl0_tEdge_0 = self.ttl0.timestamp_mu(ttl0_tEnd_0)\n\
             if ttl0_tEdge_0 > 0:\n    \
             at_mu(ttl0_tEdge_0)\n    \
             start_mu -= (ttl0_tEnd_0 - ttl0_tEdge_0)\n"
        );
        let relative = CodeGeneratorSettings {
            relative_timestamps: true,
            ..Default::default()
        };
        assert!(!run(&event, &mut arena, &relative).contains("start_mu"));
        assert!((event.time_cursor_shift() - (0.5 - 1e-5)).abs() < 1e-15);
    }

    #[test]
    fn test_rpc_event() {
        let mut arena = DeviceArena::new("sequence_gui_rpc");
        let rpc = CompiledRpc {
            args: vec![RpcArg::Int(3), RpcArg::Float(0.5), RpcArg::Text("red".to_string())],
            kargs: IndexMap::from([("mode".to_string(), "fast".to_string())]),
        };
        let device = arena.rpc();
        let event = Event::new(device, 0.0, 0.0, 0, EventKind::Rpc(RpcEvent::new("flash", &rpc)));
        assert_eq!(
            run(&event, &mut arena, &CodeGeneratorSettings::default()),
            "self.core.wait_until_mu(now_mu())\n\
             self.sequence_gui_rpc.run(\"flash\", 3, 0.5, \"red\", mode=\"fast\")\n"
        );

        let bare = CompiledRpc {
            args: vec![],
            kargs: IndexMap::new(),
        };
        let event = Event::new(device, 0.0, 0.0, 0, EventKind::Rpc(RpcEvent::new("stop", &bare)));
        assert!(
            run(&event, &mut arena, &CodeGeneratorSettings::default())
                .ends_with("self.sequence_gui_rpc.run(\"stop\")\n")
        );
    }

    #[test]
    fn test_sample_event() {
        let (mut arena, sampler) = arena_with("sampler0", DeviceKind::Sampler);
        let event = Event::new(
            sampler,
            0.0,
            1e-3,
            2,
            EventKind::Sample(SampleEvent::new(10e3, 1e-3)),
        );
        let mut prepare = PythonGenerator::new();
        event.prepare_code(&arena, &mut prepare);
        assert_eq!(
            prepare.generate_python(),
            "self.dsampler0_2 = np.full((10,8),0,dtype=float)\n"
        );
        assert_eq!(
            run(&event, &mut arena, &CodeGeneratorSettings::default()),
            "for i in range(10):\n    with parallel:\n        \
             self.sampler0.sample(self.dsampler0_2[i])\n        delay(0.0001)\n"
        );
        let mut analyze = PythonGenerator::new();
        event.analyze_code(&arena, &mut analyze);
        assert_eq!(
            analyze.generate_python(),
            "for i in range(8):\n    \
             self.set_dataset(\"dsampler0_2_data_ch_\" + str(i), self.dsampler0_2[:,i])\n\
             self.set_dataset(\"dsampler0_2_samplerate\", 10000.000)\n"
        );
        assert_eq!(event.import_code(), Some("import numpy as np"));
    }

    #[test]
    fn test_empty_sample_event_emits_nothing() {
        let (mut arena, sampler) = arena_with("sampler0", DeviceKind::Sampler);
        let kind = EventKind::Sample(SampleEvent::new(1e3, 1e-5));
        let event = Event::new(sampler, 0.0, 1e-5, 0, kind);
        let mut code = PythonGenerator::new();
        event.prepare_code(&arena, &mut code);
        event.run_code(&mut arena, &CodeGeneratorSettings::default(), &mut code).unwrap();
        event.analyze_code(&arena, &mut code);
        assert!(code.is_empty());
        assert_eq!(event.time_cursor_shift(), 0.0);
    }
}
