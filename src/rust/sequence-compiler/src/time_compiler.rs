// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Placement of segments on a time axis.
//!
//! Segments of one sequence are laid out back to back by a [`TimeRunner`].
//! A subsequence segment reserves `duration x repeats` in its parent and is
//! compiled on its own time axis starting at zero; the code generator turns
//! the repetitions into a loop.

use indexmap::IndexMap;
use sequence_log::{diagnostic, info};
use sequence_units::{Seconds, Substitute};

use crate::compiled::{
    CompiledPortStates, CompiledProgram, CompiledRpc, CompiledSegment, CompiledSubsequence,
    CompiledTriggerWait,
};
use crate::context::CompileContext;
use crate::labsetup::Module;
use crate::model::{RpcCall, Segment, SegmentKind};
use crate::store::SequenceStore;
use crate::value_compiler::{compile_port_state, compile_rpc, resolve_integer};
use crate::{Error, Location, Result, ResultExt};

/// Running time cursor of one sequence.
#[derive(Debug, Default, Clone)]
pub struct TimeRunner {
    time: Seconds,
}

impl TimeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn time(&self) -> Seconds {
        self.time
    }

    /// Advance the cursor by `dt`, returning the time before the advance.
    pub fn run(&mut self, dt: Seconds) -> Seconds {
        let start = self.time;
        self.time += dt;
        start
    }
}

/// The sequences currently being entered, innermost first.
///
/// Frames live on the Rust call stack and are never mutated, so sibling
/// branches of the recursion each see exactly their own ancestors.
#[derive(Debug, Clone, Copy)]
pub enum CallStack<'a> {
    Empty,
    Frame {
        name: &'a str,
        parent: &'a CallStack<'a>,
    },
}

impl<'a> CallStack<'a> {
    pub fn push(&'a self, name: &'a str) -> CallStack<'a> {
        CallStack::Frame { name, parent: self }
    }

    pub fn contains(&self, needle: &str) -> bool {
        let mut current = self;
        while let CallStack::Frame { name, parent } = current {
            if *name == needle {
                return true;
            }
            current = parent;
        }
        false
    }
}

fn segment_duration(
    segment: &Segment,
    variables: &dyn Substitute,
    location: &Location,
) -> Result<Seconds> {
    let duration = segment.duration.resolve(variables).located(location)?;
    if duration < 0.0 {
        return Err(Error::authoring(
            location,
            format!("Segment duration must not be negative, got {duration}"),
        ));
    }
    Ok(duration)
}

fn subsequence_repeats(
    repeats: &sequence_units::FieldValue,
    variables: &dyn Substitute,
    location: &Location,
) -> Result<u64> {
    let value = resolve_integer(repeats, variables, location, "Subsequence repeats")?;
    u64::try_from(value).map_err(|_| {
        Error::authoring(
            location,
            format!("Subsequence repeats must not be negative, got {value}"),
        )
    })
}

/// Total duration of one pass through `name`: the sum of its enabled
/// top-level segment durations.
///
/// Returns `+inf` if `name` is already on `stack`, and propagates `+inf` from
/// any subsequence that loops back onto itself.
pub fn duration_of(
    sequences: &SequenceStore,
    variables: &dyn Substitute,
    name: &str,
    stack: &CallStack,
) -> Result<Seconds> {
    if stack.contains(name) {
        return Ok(Seconds::INFINITY);
    }
    let location = Location::sequence(name);
    let sequence = sequences.get(name).ok_or_else(|| {
        Error::authoring(&location, format!("Unknown sequence '{name}'"))
    })?;
    let stack = stack.push(name);
    let mut total = 0.0;
    for (segment_name, segment) in sequence.segments.iter().filter(|(_, s)| s.enabled) {
        let location = location.segment(segment_name);
        total += match &segment.kind {
            SegmentKind::PortState { .. } | SegmentKind::TriggerWait { .. } => {
                segment_duration(segment, variables, &location)?
            }
            SegmentKind::Subsequence {
                subsequence,
                repeats,
            } => {
                let single = duration_of(sequences, variables, subsequence, &stack)?;
                if single.is_infinite() {
                    return Ok(Seconds::INFINITY);
                }
                single * subsequence_repeats(repeats, variables, &location)? as f64
            }
        };
    }
    Ok(total)
}

/// Compile the segments of `name`, laid out from the cursor of `runner`.
pub fn compile_sequence(
    ctx: &CompileContext,
    name: &str,
    runner: &mut TimeRunner,
) -> Result<Vec<CompiledSegment>> {
    compile_nested(ctx, name, runner, &CallStack::Empty)
}

fn compile_nested(
    ctx: &CompileContext,
    name: &str,
    runner: &mut TimeRunner,
    stack: &CallStack,
) -> Result<Vec<CompiledSegment>> {
    if stack.contains(name) {
        return Err(Error::Cycle(name.to_string()));
    }
    let location = Location::sequence(name);
    let sequence = ctx.sequences.get(name).ok_or_else(|| {
        Error::authoring(&location, format!("Unknown sequence '{name}'"))
    })?;
    if sequence.is_dir {
        return Err(Error::authoring(
            &location,
            format!("'{name}' is a directory and cannot be compiled"),
        ));
    }
    let stack = stack.push(name);
    let mut compiled = Vec::with_capacity(sequence.segments.len());
    for (segment_name, segment) in sequence.segments.iter().filter(|(_, s)| s.enabled) {
        let location = location.segment(segment_name);
        let segment = match &segment.kind {
            SegmentKind::PortState { ports, rpcs } => {
                let duration = segment_duration(segment, ctx.variables, &location)?;
                let ports = ports
                    .iter()
                    .map(|(port, raw)| {
                        Ok((port.clone(), compile_port_state(ctx, port, raw, &location)?))
                    })
                    .collect::<Result<IndexMap<_, _>>>()?;
                let rpcs = rpcs
                    .iter()
                    .map(|(rpc, call)| {
                        Ok((rpc.clone(), compile_rpc(call, ctx.variables, &location)?))
                    })
                    .collect::<Result<IndexMap<_, _>>>()?;
                CompiledSegment::PortState(CompiledPortStates {
                    time: runner.run(duration),
                    duration,
                    single_duration: duration,
                    ports,
                    rpcs,
                })
            }
            SegmentKind::Subsequence {
                subsequence,
                repeats,
            } => {
                let single =
                    duration_of(ctx.sequences, ctx.variables, subsequence, &CallStack::Empty)?;
                if single.is_infinite() {
                    return Err(Error::Cycle(subsequence.clone()));
                }
                let repeats = subsequence_repeats(repeats, ctx.variables, &location)?;
                let duration = single * repeats as f64;
                if !duration.is_finite() || duration < 0.0 {
                    return Err(Error::authoring(
                        &location,
                        format!("Subsequence '{subsequence}' has invalid duration {duration}"),
                    ));
                }
                let time = runner.run(duration);
                let inner = compile_nested(ctx, subsequence, &mut TimeRunner::new(), &stack)?;
                CompiledSegment::Subsequence(CompiledSubsequence {
                    name: subsequence.clone(),
                    time,
                    single_duration: single,
                    duration,
                    repeats,
                    subsequence: inner,
                })
            }
            SegmentKind::TriggerWait { input_ttl } => {
                let duration = segment_duration(segment, ctx.variables, &location)?;
                let port = ctx.lab_setup.port(input_ttl)?;
                if port.module()? != Module::Ttl {
                    return Err(Error::Inventory(format!(
                        "Trigger input '{input_ttl}' is not a TTL port"
                    )));
                }
                CompiledSegment::TriggerWait(CompiledTriggerWait {
                    time: runner.run(duration),
                    duration,
                    single_duration: duration,
                    input_ttl: port.device.clone(),
                })
            }
        };
        compiled.push(segment);
    }
    diagnostic!(
        "Compiled sequence '{}': {} segments, cursor at {} s",
        name,
        compiled.len(),
        runner.time()
    );
    Ok(compiled)
}

/// Compile a top-level sequence starting at time zero.
pub fn compile_program(ctx: &CompileContext, name: &str) -> Result<CompiledProgram> {
    info!("Compiling sequence '{}'", name);
    let mut runner = TimeRunner::new();
    let segments = compile_sequence(ctx, name, &mut runner)?;
    Ok(CompiledProgram {
        name: name.to_string(),
        segments,
        duration: runner.time(),
    })
}

/// The RPC a sequence asks the caller to run before it is compiled, with its
/// arguments substituted and typed. Running it is up to the caller.
pub fn pre_compile_rpc(ctx: &CompileContext, name: &str) -> Result<Option<(String, CompiledRpc)>> {
    let location = Location::sequence(name);
    let sequence = ctx
        .sequences
        .get(name)
        .ok_or_else(|| Error::authoring(&location, format!("Unknown sequence '{name}'")))?;
    let Some(rpc) = sequence.pre_compile_rpc.as_deref().filter(|rpc| !rpc.is_empty()) else {
        return Ok(None);
    };
    let call = RpcCall {
        args: sequence.pre_compile_args.clone(),
        ..Default::default()
    };
    let compiled = compile_rpc(&call, ctx.variables, &location)?;
    Ok(Some((rpc.to_string(), compiled)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labsetup::{LabSetup, Port};
    use crate::model::Sequence;
    use crate::ErrorKind;
    use proptest::prelude::*;
    use serde_json::json;
    use sequence_units::{FieldValue, NoSubstitution, Unit, Variable, VariableTable};

    fn ms(value: f64) -> FieldValue {
        FieldValue::with_unit(value.to_string(), Unit::new("ms", 1e-3))
    }

    fn lab_setup() -> LabSetup {
        let mut lab_setup = LabSetup::default();
        lab_setup.add_port("led", Port::new(Module::Ttl, "ttl4", None::<String>));
        lab_setup.add_port("trigger", Port::new(Module::Ttl, "ttl0", None::<String>));
        lab_setup
    }

    fn blink_store() -> SequenceStore {
        let mut store = SequenceStore::default();
        store.insert(
            "blink",
            Sequence::default()
                .with_segment(
                    "on",
                    Segment::port_state(ms(10.0)).with_port("led", json!({"state": true})),
                )
                .with_segment(
                    "off",
                    Segment::port_state(ms(20.0)).with_port("led", json!({"state": false})),
                ),
        );
        store.insert(
            "main",
            Sequence::default()
                .with_segment("start", Segment::port_state(ms(5.0)))
                .with_segment("loop", Segment::subsequence("blink", "3".into()))
                .with_segment("skipped", Segment::port_state(ms(100.0)).disabled())
                .with_segment("wait", Segment::trigger_wait(ms(1.0), "trigger")),
        );
        store
    }

    fn assert_close(a: f64, b: f64) {
        assert!((a - b).abs() < 1e-12, "{a} != {b}");
    }

    #[test]
    fn test_time_runner() {
        let mut runner = TimeRunner::new();
        assert_eq!(runner.run(1.5), 0.0);
        assert_eq!(runner.run(0.5), 1.5);
        assert_eq!(runner.time(), 2.0);
    }

    #[test]
    fn test_call_stack() {
        let root = CallStack::Empty;
        let a = root.push("a");
        let b = a.push("b");
        assert!(b.contains("a") && b.contains("b"));
        assert!(!a.contains("b"));
        assert!(!root.contains("a"));
    }

    #[test]
    fn test_compile_nested_sequence() {
        let store = blink_store();
        let lab_setup = lab_setup();
        let ctx = CompileContext::new(&store, &lab_setup, &NoSubstitution);
        let program = compile_program(&ctx, "main").unwrap();
        assert_eq!(program.segments.len(), 3);
        assert_close(program.duration, 5e-3 + 90e-3 + 1e-3);

        let CompiledSegment::Subsequence(inner) = &program.segments[1] else {
            panic!("expected subsequence");
        };
        assert_close(inner.time, 5e-3);
        assert_close(inner.single_duration, 30e-3);
        assert_close(inner.duration, 90e-3);
        assert_eq!(inner.repeats, 3);
        assert_eq!(inner.subsequence[0].time(), 0.0);
        assert_close(inner.subsequence[1].time(), 10e-3);

        let CompiledSegment::TriggerWait(wait) = &program.segments[2] else {
            panic!("expected trigger wait");
        };
        assert_eq!(wait.input_ttl, "ttl0");
        assert_close(wait.time, 95e-3);
    }

    #[test]
    fn test_duration_counts_trigger_waits() {
        let store = blink_store();
        let duration = duration_of(&store, &NoSubstitution, "main", &CallStack::Empty).unwrap();
        assert_close(duration, 96e-3);
    }

    #[test]
    fn test_cycle_detection() {
        let mut store = SequenceStore::default();
        store.insert(
            "a",
            Sequence::default().with_segment("to_b", Segment::subsequence("b", "1".into())),
        );
        store.insert(
            "b",
            Sequence::default()
                .with_segment("pad", Segment::port_state(ms(1.0)))
                .with_segment("to_a", Segment::subsequence("a", "0".into())),
        );
        let duration = duration_of(&store, &NoSubstitution, "a", &CallStack::Empty).unwrap();
        assert!(duration.is_infinite());

        let lab_setup = LabSetup::default();
        let ctx = CompileContext::new(&store, &lab_setup, &NoSubstitution);
        let err = compile_program(&ctx, "a").unwrap_err();
        assert!(matches!(err, Error::Cycle(_)));
        assert_eq!(err.kind(), ErrorKind::Authoring);
    }

    #[test]
    fn test_unresolvable_duration() {
        let mut store = SequenceStore::default();
        store.insert(
            "main",
            Sequence::default()
                .with_segment("s", Segment::port_state(FieldValue::Text("$t".into()))),
        );
        let lab_setup = LabSetup::default();
        let ctx = CompileContext::new(&store, &lab_setup, &NoSubstitution);
        let err = compile_program(&ctx, "main").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authoring);
        assert!(err.to_string().contains("segment 's'"));

        let mut variables = VariableTable::default();
        variables.insert("T", Variable::new("$t", "0.25"));
        let ctx = CompileContext::new(&store, &lab_setup, &variables);
        assert_eq!(compile_program(&ctx, "main").unwrap().duration, 0.25);
    }

    #[test]
    fn test_negative_repeats() {
        let mut store = blink_store();
        store.insert(
            "neg",
            Sequence::default().with_segment("loop", Segment::subsequence("blink", "-1".into())),
        );
        let lab_setup = lab_setup();
        let ctx = CompileContext::new(&store, &lab_setup, &NoSubstitution);
        assert!(compile_program(&ctx, "neg").is_err());
    }

    #[test]
    fn test_pre_compile_rpc() {
        let mut store = blink_store();
        let mut variables = VariableTable::default();
        variables.insert("power", Variable::new("$p", "0.5"));
        let lab_setup = lab_setup();
        let ctx = CompileContext::new(&store, &lab_setup, &variables);
        assert!(pre_compile_rpc(&ctx, "main").unwrap().is_none());

        let main = store.get_mut("main").unwrap();
        main.pre_compile_rpc = Some("set_laser".to_string());
        main.pre_compile_args = "$p 3 red".to_string();
        let ctx = CompileContext::new(&store, &lab_setup, &variables);
        let (rpc, call) = pre_compile_rpc(&ctx, "main").unwrap().unwrap();
        assert_eq!(rpc, "set_laser");
        assert_eq!(
            call.args,
            vec![
                crate::compiled::RpcArg::Float(0.5),
                crate::compiled::RpcArg::Int(3),
                crate::compiled::RpcArg::Text("red".to_string()),
            ]
        );
    }

    proptest! {
        #[test]
        fn test_duration_is_sum_of_segments(
            durations in prop::collection::vec(0u32..1000, 0..8),
            repeats in 0u32..5,
        ) {
            let mut inner = Sequence::default();
            for (i, d) in durations.iter().enumerate() {
                inner = inner.with_segment(format!("s{i}"), Segment::port_state(ms(*d as f64)));
            }
            let mut store = SequenceStore::default();
            store.insert("inner", inner);
            store.insert(
                "outer",
                Sequence::default()
                    .with_segment("pad", Segment::port_state(ms(1.0)))
                    .with_segment(
                        "loop",
                        Segment::subsequence("inner", FieldValue::Text(repeats.to_string())),
                    ),
            );
            let single = duration_of(&store, &NoSubstitution, "inner", &CallStack::Empty).unwrap();
            let expected: f64 = durations.iter().map(|d| *d as f64 * 1e-3).sum();
            prop_assert!((single - expected).abs() < 1e-9);
            let outer = duration_of(&store, &NoSubstitution, "outer", &CallStack::Empty).unwrap();
            prop_assert!((outer - (1e-3 + expected * repeats as f64)).abs() < 1e-9);
        }
    }
}
