// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Sequences as they are stored in a project: ordered maps of segments.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use sequence_units::{FieldValue, Unit};

fn default_true() -> bool {
    true
}

fn default_duration() -> FieldValue {
    FieldValue::with_unit("10", Unit::new("ms", 1e-3))
}

fn default_repeats() -> FieldValue {
    FieldValue::Text("1".to_string())
}

/// A remote procedure call attached to a port state segment.
///
/// `args` is a single space-separated string; `kargs` maps keyword names to
/// text values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RpcCall {
    #[serde(default)]
    pub args: String,
    #[serde(default)]
    pub kargs: IndexMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SegmentKind {
    /// Sets ports to target states and triggers RPCs.
    PortState {
        /// Raw target states by port name; their shape depends on the port's
        /// module and is checked by the value compiler.
        #[serde(default)]
        ports: IndexMap<String, serde_json::Value>,
        #[serde(default)]
        rpcs: IndexMap<String, RpcCall>,
    },
    /// Plays another sequence `repeats` times.
    Subsequence {
        #[serde(default)]
        subsequence: String,
        #[serde(default = "default_repeats")]
        repeats: FieldValue,
    },
    /// Waits for a rising edge on an input TTL, at most for the duration.
    TriggerWait {
        #[serde(default)]
        input_ttl: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub description: String,
    /// For subsequence segments this is a cache of the played duration.
    #[serde(default = "default_duration")]
    pub duration: FieldValue,
    #[serde(flatten)]
    pub kind: SegmentKind,
}

impl Segment {
    fn new(duration: FieldValue, kind: SegmentKind) -> Self {
        Segment {
            enabled: true,
            description: String::new(),
            duration,
            kind,
        }
    }

    pub fn port_state(duration: FieldValue) -> Self {
        Segment::new(
            duration,
            SegmentKind::PortState {
                ports: IndexMap::new(),
                rpcs: IndexMap::new(),
            },
        )
    }

    pub fn subsequence<S: Into<String>>(subsequence: S, repeats: FieldValue) -> Self {
        Segment::new(
            FieldValue::with_unit("0", Unit::new("ms", 1e-3)),
            SegmentKind::Subsequence {
                subsequence: subsequence.into(),
                repeats,
            },
        )
    }

    pub fn trigger_wait<S: Into<String>>(duration: FieldValue, input_ttl: S) -> Self {
        Segment::new(
            duration,
            SegmentKind::TriggerWait {
                input_ttl: input_ttl.into(),
            },
        )
    }

    /// Add a raw port state; ignored for segments other than port states.
    pub fn with_port<S: Into<String>>(mut self, port: S, state: serde_json::Value) -> Self {
        if let SegmentKind::PortState { ports, .. } = &mut self.kind {
            ports.insert(port.into(), state);
        }
        self
    }

    pub fn with_rpc<S: Into<String>>(mut self, name: S, call: RpcCall) -> Self {
        if let SegmentKind::PortState { rpcs, .. } = &mut self.kind {
            rpcs.insert(name.into(), call);
        }
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn referenced_sequence(&self) -> Option<&str> {
        match &self.kind {
            SegmentKind::Subsequence { subsequence, .. } => Some(subsequence),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Sequence {
    #[serde(default, rename = "isDir")]
    pub is_dir: bool,
    #[serde(default)]
    pub segments: IndexMap<String, Segment>,
    /// Sequences and their segments that play this sequence.
    #[serde(default)]
    pub appearances: IndexMap<String, Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_compile_rpc: Option<String>,
    #[serde(default)]
    pub pre_compile_args: String,
}

impl Sequence {
    pub fn with_segment<S: Into<String>>(mut self, name: S, segment: Segment) -> Self {
        self.segments.insert(name.into(), segment);
        self
    }
}
