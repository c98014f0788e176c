// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! The methods of the generated experiment class.
//!
//! Group slots are numbered per nesting level: the `n`th group inside the
//! subsequence `name` is scheduled through `self.timestamp_{name}_{n}` in
//! absolute mode and `self.delay_{name}_{n}` in relative mode. Top level
//! slots have an empty name.

use indexmap::IndexSet;
use sequence_compiler::Seconds;
use sequence_compiler::build_id::BuildId;
use sequence_units::float_repr;

use crate::device::DeviceArena;
use crate::event::seconds_to_mu;
use crate::event_builder::{EventGraph, Group};
use crate::python::{PythonGenerator, string_literal};
use crate::settings::CodeGeneratorSettings;
use crate::{Error, Result};

/// Negative delays closer to zero than this are rounding noise.
const DELAY_TOLERANCE: Seconds = 1e-12;

/// Extra code contributed to the generated experiment by the host.
///
/// Every method returns code snippets for one part of the file. Snippets are
/// inserted verbatim, indented to the level of the part they belong to.
pub trait CodeHook {
    /// Module level imports. Deduplicated together with event imports.
    fn imports(&self) -> Vec<String> {
        Vec::new()
    }

    /// Lines run in `build` after the devices are declared.
    fn build(&self) -> Vec<String> {
        Vec::new()
    }

    /// Lines run at the end of `prepare`.
    fn prepare(&self) -> Vec<String> {
        Vec::new()
    }

    /// Lines run at the start of the `init` kernel.
    fn init(&self) -> Vec<String> {
        Vec::new()
    }

    /// Methods added to the class body.
    fn functions(&self) -> Vec<String> {
        Vec::new()
    }

    fn analyze(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Name of the `kind` slot of the `index`th group inside `parent`.
///
/// The separator keeps names of different groups apart even when a
/// subsequence name ends in digits.
fn slot(kind: &str, parent: &str, index: usize) -> String {
    if parent.is_empty() {
        format!("{kind}_{index}")
    } else {
        format!("{kind}_{parent}_{index}")
    }
}

fn add_snippets(snippets: Vec<String>, code: &mut PythonGenerator) {
    for snippet in snippets {
        code.add_raw(snippet);
    }
}

/// Import statements needed by the events, followed by hook imports.
pub fn import_tokens(graph: &EventGraph, hooks: &[&dyn CodeHook]) -> Vec<String> {
    let mut imports: IndexSet<String> = graph
        .events()
        .filter_map(|event| event.import_code())
        .map(str::to_string)
        .collect();
    for hook in hooks {
        imports.extend(hook.imports());
    }
    imports.into_iter().collect()
}

pub fn build_code(
    graph: &EventGraph,
    settings: &CodeGeneratorSettings,
    hooks: &[&dyn CodeHook],
) -> PythonGenerator {
    let mut code = PythonGenerator::new();
    code.add_line(format!(
        "self.setattr_argument(\"codeID\", NumberValue(type=\"int\", {}=0, scale=1, step=1))",
        settings.number_value_precision_keyword()
    ));
    for id in &graph.declared {
        code.add_line(format!(
            "self.setattr_device({})",
            string_literal(&graph.devices.get(*id).name)
        ));
    }
    for hook in hooks {
        add_snippets(hook.build(), &mut code);
    }
    for id in &graph.declared {
        graph.devices.get(*id).build_code(&mut code);
    }
    code
}

/// Kernel helpers of the declared devices and the hooks, without duplicates.
pub fn function_code(graph: &EventGraph, hooks: &[&dyn CodeHook]) -> Vec<String> {
    let mut functions: IndexSet<String> = IndexSet::new();
    for id in &graph.declared {
        functions.extend(graph.devices.get(*id).functions.iter().cloned());
    }
    for hook in hooks {
        functions.extend(hook.functions());
    }
    functions.into_iter().collect()
}

fn prepare_groups(
    groups: &[Group],
    parent: &str,
    devices: &DeviceArena,
    settings: &CodeGeneratorSettings,
    code: &mut PythonGenerator,
) -> Result<()> {
    for (index, group) in groups.iter().enumerate() {
        match group {
            Group::Repeat {
                name,
                time,
                single_duration,
                groups,
                ..
            } => {
                if !settings.relative_timestamps {
                    let single_duration = seconds_to_mu(*single_duration);
                    code.add_assignment(format!("duration_{name}"), single_duration);
                    code.add_assignment(slot("timestamp", parent, index), seconds_to_mu(*time));
                }
                prepare_groups(groups, name, devices, settings, code)?;
            }
            Group::Events {
                time,
                duration,
                events,
            } => {
                if settings.relative_timestamps {
                    let shift: Seconds = events.iter().map(|event| event.time_cursor_shift()).sum();
                    let mut delay = duration - shift;
                    if delay < 0.0 {
                        if delay > -DELAY_TOLERANCE {
                            delay = 0.0;
                        } else {
                            return Err(Error::NegativeDelay {
                                group: slot("delay", parent, index),
                                delay,
                            });
                        }
                    }
                    code.add_assignment(slot("delay", parent, index), seconds_to_mu(delay));
                } else {
                    code.add_assignment(slot("timestamp", parent, index), seconds_to_mu(*time));
                }
                for event in events {
                    event.prepare_code(devices, code);
                }
            }
        }
    }
    Ok(())
}

pub fn prepare_code(
    graph: &EventGraph,
    settings: &CodeGeneratorSettings,
    build_id: BuildId,
    sequence_json: &str,
    hooks: &[&dyn CodeHook],
) -> Result<PythonGenerator> {
    let mut code = PythonGenerator::new();
    let mut guard = PythonGenerator::new();
    guard.add_line(format!(
        "raise AssertionError(\"Sequence Control tried to execute the wrong generated code. \
         Maybe wrong artiq_master running? I am {build_id}, but got \" + str(self.codeID))"
    ));
    code.add_block(format!("if self.codeID != {build_id}"), guard);
    code.add_line(format!(
        "self.set_dataset(\"sequenceJson\", {})",
        string_literal(sequence_json)
    ));
    prepare_groups(&graph.groups, "", &graph.devices, settings, &mut code)?;
    for hook in hooks {
        add_snippets(hook.prepare(), &mut code);
    }
    Ok(code)
}

/// Device initialization, highest device priority first.
pub fn init_code(
    graph: &EventGraph,
    settings: &CodeGeneratorSettings,
    hooks: &[&dyn CodeHook],
) -> PythonGenerator {
    let mut code = PythonGenerator::new();
    for hook in hooks {
        add_snippets(hook.init(), &mut code);
    }
    let mut devices: Vec<_> = graph.declared.iter().map(|id| graph.devices.get(*id)).collect();
    devices.sort_by_key(|device| -device.priority);
    for device in devices {
        device.init_code(settings, &mut code);
    }
    code
}

fn run_groups(
    groups: &[Group],
    parent: &str,
    loop_depth: usize,
    start: &str,
    devices: &mut DeviceArena,
    settings: &CodeGeneratorSettings,
    code: &mut PythonGenerator,
) -> Result<()> {
    for (index, group) in groups.iter().enumerate() {
        match group {
            Group::Repeat {
                name,
                repeats,
                groups,
                ..
            } => {
                let loop_start = format!(
                    "{start} + self.{} + i{loop_depth} * self.duration_{name}",
                    slot("timestamp", parent, index)
                );
                let mut body = PythonGenerator::new();
                let depth = loop_depth + 1;
                run_groups(groups, name, depth, &loop_start, devices, settings, &mut body)?;
                if body.is_empty() {
                    continue;
                }
                code.add_block(format!("for i{loop_depth} in range({repeats})"), body);
            }
            Group::Events {
                time,
                duration,
                events,
            } => {
                if settings.emit_timing_comments {
                    code.add_comment(format!(
                        "{} s for {} s",
                        float_repr(*time),
                        float_repr(*duration)
                    ));
                }
                if !settings.relative_timestamps {
                    let timestamp = slot("timestamp", parent, index);
                    code.add_line(format!("at_mu({start} + self.{timestamp})"));
                }
                for event in events {
                    event.run_code(devices, settings, code)?;
                }
                if settings.relative_timestamps {
                    code.add_line(format!("delay_mu(self.{})", slot("delay", parent, index)));
                }
            }
        }
    }
    Ok(())
}

/// The `run` kernel. Register states tracked on the devices start over.
pub fn run_code(
    graph: &mut EventGraph,
    settings: &CodeGeneratorSettings,
    build_id: BuildId,
    sequence_name: &str,
) -> Result<PythonGenerator> {
    graph.devices.reset_run_state();
    let rpc = graph.devices.get(graph.devices.rpc()).name.clone();
    let sequence = string_literal(sequence_name);

    let mut code = PythonGenerator::new();
    code.add_line("self.core.break_realtime()");
    code.add_line("self.init()");
    code.add_line("delay(5*ms)");
    code.add_line("self.core.break_realtime()");
    code.add_line(format!("self.{rpc}.sequenceStarted(\"{build_id}\", {sequence})"));
    code.add_line("self.core.break_realtime()");
    code.add_line("delay(5*ms)");
    code.add_line("start_mu = now_mu()");
    run_groups(&graph.groups, "", 0, "start_mu", &mut graph.devices, settings, &mut code)?;
    code.add_line("delay(5*ms)");
    code.add_line("self.core.wait_until_mu(now_mu())");
    code.add_line(format!("self.{rpc}.sequenceFinished(\"{build_id}\", {sequence})"));
    Ok(code)
}

pub fn analyze_code(graph: &EventGraph, hooks: &[&dyn CodeHook]) -> PythonGenerator {
    let mut code = PythonGenerator::new();
    for event in graph.events() {
        event.analyze_code(&graph.devices, &mut code);
    }
    for hook in hooks {
        add_snippets(hook.analyze(), &mut code);
    }
    code
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceKind;
    use crate::event::{Event, EventKind};
    use sequence_compiler::Location;

    struct Marker;

    impl CodeHook for Marker {
        fn imports(&self) -> Vec<String> {
            vec!["import numpy as np".to_string(), "import json".to_string()]
        }

        fn init(&self) -> Vec<String> {
            vec!["self.marker.reset()".to_string()]
        }

        fn functions(&self) -> Vec<String> {
            vec!["def helper(self):\n    pass".to_string()]
        }
    }

    /// A led switched on at 0 and off at 1 ms, inside a subsequence repeated
    /// three times at 2 ms.
    fn graph() -> EventGraph {
        let mut devices = DeviceArena::new("rpc");
        let led = devices
            .get_or_insert_with("ttl0", &Location::default(), |_| {
                Ok(DeviceKind::Ttl(crate::device::TtlMode::Output))
            })
            .unwrap();
        let ttl = |devices: &mut DeviceArena, group, time, state| {
            let index = devices.register_event(led, group);
            Event::new(led, time, 1e-3, index, EventKind::Ttl { state })
        };
        let on = ttl(&mut devices, 0, 0.0, true);
        let off = ttl(&mut devices, 1, 1e-3, false);
        let inner = vec![
            Group::Events {
                time: 0.0,
                duration: 1e-3,
                events: vec![on],
            },
            Group::Events {
                time: 1e-3,
                duration: 1e-3,
                events: vec![off],
            },
        ];
        let wait = Event::new(devices.core(), 8e-3, 0.0, 0, EventKind::Wait);
        devices.register_event(devices.core(), 2);
        let declared = devices.declared_devices(|_| 0);
        EventGraph {
            devices,
            declared,
            groups: vec![
                Group::Repeat {
                    name: "blink".to_string(),
                    time: 2e-3,
                    duration: 6e-3,
                    single_duration: 2e-3,
                    repeats: 3,
                    groups: inner,
                },
                Group::Events {
                    time: 8e-3,
                    duration: 0.0,
                    events: vec![wait],
                },
            ],
        }
    }

    #[test]
    fn test_imports_deduplicated() {
        let graph = graph();
        assert_eq!(
            import_tokens(&graph, &[&Marker, &Marker]),
            vec!["import numpy as np".to_string(), "import json".to_string()]
        );
        assert_eq!(function_code(&graph, &[&Marker, &Marker]).len(), 1);
    }

    #[test]
    fn test_build_code() {
        let graph = graph();
        let settings = CodeGeneratorSettings {
            artiq_version: 7,
            ..Default::default()
        };
        assert_eq!(
            build_code(&graph, &settings, &[]).generate_python(),
            "self.setattr_argument(\"codeID\", NumberValue(type=\"int\", ndecimals=0, scale=1, step=1))\n\
             self.setattr_device(\"core\")\n\
             self.setattr_device(\"rpc\")\n\
             self.setattr_device(\"ttl0\")\n"
        );
    }

    #[test]
    fn test_absolute_prepare_and_run() {
        let mut graph = graph();
        let settings = CodeGeneratorSettings::default();
        let prepare = prepare_code(&graph, &settings, BuildId::from(7), "[]", &[])
            .unwrap()
            .generate_python();
        assert!(prepare.contains(
            "self.duration_blink = self.core.seconds_to_mu(0.002)\n\
             self.timestamp_0 = self.core.seconds_to_mu(0.002)\n\
             self.timestamp_blink_0 = self.core.seconds_to_mu(0.0)\n\
             self.timestamp_blink_1 = self.core.seconds_to_mu(0.001)\n\
             self.timestamp_1 = self.core.seconds_to_mu(0.008)\n"
        ));

        let run = run_code(&mut graph, &settings, BuildId::from(7), "main")
            .unwrap()
            .generate_python();
        assert!(run.contains(
            "start_mu = now_mu()\n\
             for i0 in range(3):\n    \
             at_mu(start_mu + self.timestamp_0 + i0 * self.duration_blink + self.timestamp_blink_0)\n    \
             self.ttl0.on()\n    \
             at_mu(start_mu + self.timestamp_0 + i0 * self.duration_blink + self.timestamp_blink_1)\n    \
             self.ttl0.off()\n\
             at_mu(start_mu + self.timestamp_1)\n\
             self.core.wait_until_mu(now_mu())\n"
        ));
        assert!(run.ends_with("self.rpc.sequenceFinished(\"7\", \"main\")\n"));
    }

    #[test]
    fn test_relative_prepare_and_run() {
        let mut graph = graph();
        let settings = CodeGeneratorSettings {
            relative_timestamps: true,
            ..Default::default()
        };
        let prepare = prepare_code(&graph, &settings, BuildId::from(7), "[]", &[])
            .unwrap()
            .generate_python();
        assert!(!prepare.contains("timestamp_"));
        assert!(prepare.contains("self.delay_blink_0 = self.core.seconds_to_mu(0.001)\n"));
        assert!(prepare.contains("self.delay_1 = self.core.seconds_to_mu(0.0)\n"));

        let run = run_code(&mut graph, &settings, BuildId::from(7), "main")
            .unwrap()
            .generate_python();
        assert!(run.contains(
            "for i0 in range(3):\n    \
             self.ttl0.on()\n    \
             delay_mu(self.delay_blink_0)\n    \
             self.ttl0.off()\n    \
             delay_mu(self.delay_blink_1)\n"
        ));
        assert!(!run.contains("at_mu"));
    }

    #[test]
    fn test_negative_delay() {
        let mut devices = DeviceArena::new("rpc");
        let trigger = devices
            .get_or_insert_with("ttl1", &Location::default(), |_| {
                Ok(DeviceKind::Ttl(crate::device::TtlMode::Input))
            })
            .unwrap();
        let wait = crate::event::TriggerWaitEvent::new(&mut devices, trigger);
        let mut event = Event::new(trigger, 0.0, 1e-3, 0, EventKind::TriggerWait(wait));
        // The wait shifts the cursor by its own duration.
        event.duration = 2e-3;
        let graph = EventGraph {
            declared: devices.declared_devices(|_| 0),
            devices,
            groups: vec![Group::Events {
                time: 0.0,
                duration: 1e-3,
                events: vec![event],
            }],
        };
        let settings = CodeGeneratorSettings {
            relative_timestamps: true,
            ..Default::default()
        };
        let err = prepare_code(&graph, &settings, BuildId::from(7), "[]", &[]).unwrap_err();
        assert!(matches!(err, Error::NegativeDelay { ref group, .. } if group == "delay_0"));
        assert_eq!(err.kind(), sequence_compiler::ErrorKind::Authoring);
    }

    #[test]
    fn test_init_code_order_and_hooks() {
        let graph = graph();
        let init =
            init_code(&graph, &CodeGeneratorSettings::default(), &[&Marker]).generate_python();
        assert!(init.starts_with("self.marker.reset()\nself.core.reset()\n"));
        assert!(init.ends_with("self.ttl0.output()\n"));
    }

    #[test]
    fn test_empty_analyze() {
        let graph = graph();
        assert!(analyze_code(&graph, &[]).is_empty());
    }
}
