// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! The project's sequences plus the bookkeeping that keeps subsequence
//! segments consistent with the sequences they play.

use std::collections::VecDeque;

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use sequence_units::{FieldValue, Seconds, Substitute, Unit};

use crate::model::{Segment, SegmentKind, Sequence};
use crate::time_compiler::{duration_of, CallStack};
use crate::value_compiler::resolve_integer;
use crate::{Location, Result};

/// Display form of a cached subsequence duration, in the largest unit that
/// keeps the number readable.
pub fn duration_field(duration: Seconds) -> FieldValue {
    if duration.is_infinite() {
        FieldValue::with_unit("inf", Unit::new("ms", 1e-3))
    } else if duration > 1.0 {
        FieldValue::with_unit(duration.to_string(), Unit::new("s", 1.0))
    } else if duration > 1e-3 || duration == 0.0 {
        FieldValue::with_unit((duration * 1e3).to_string(), Unit::new("ms", 1e-3))
    } else {
        FieldValue::with_unit((duration * 1e6).to_string(), Unit::new("us", 1e-6))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SequenceStore {
    sequences: IndexMap<String, Sequence>,
}

impl SequenceStore {
    pub fn get(&self, name: &str) -> Option<&Sequence> {
        self.sequences.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Sequence> {
        self.sequences.get_mut(name)
    }

    pub fn insert<S: Into<String>>(&mut self, name: S, sequence: Sequence) {
        self.sequences.insert(name.into(), sequence);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Sequence)> {
        self.sequences.iter()
    }

    pub fn len(&self) -> usize {
        self.sequences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }

    /// Recompute every sequence's `appearances` from the subsequence segments.
    pub fn rebuild_appearances(&mut self) {
        let mut appearances: IndexMap<String, IndexMap<String, Vec<String>>> = IndexMap::new();
        for (sequence_name, sequence) in &self.sequences {
            for (segment_name, segment) in &sequence.segments {
                if let Some(target) = segment.referenced_sequence() {
                    appearances
                        .entry(target.to_string())
                        .or_default()
                        .entry(sequence_name.clone())
                        .or_default()
                        .push(segment_name.clone());
                }
            }
        }
        for (name, sequence) in self.sequences.iter_mut() {
            sequence.appearances = appearances.swap_remove(name).unwrap_or_default();
        }
    }

    fn played_duration(
        &self,
        segment: &Segment,
        variables: &dyn Substitute,
        location: &Location,
    ) -> Result<Option<Seconds>> {
        let SegmentKind::Subsequence {
            subsequence,
            repeats,
        } = &segment.kind
        else {
            return Ok(None);
        };
        if self.get(subsequence).is_none() {
            return Ok(Some(0.0));
        }
        let single = duration_of(self, variables, subsequence, &CallStack::Empty)?;
        if single.is_infinite() {
            return Ok(Some(Seconds::INFINITY));
        }
        let repeats = resolve_integer(repeats, variables, location, "Subsequence repeats")?;
        Ok(Some(single * repeats as f64))
    }

    fn refresh_segment(
        &mut self,
        sequence_name: &str,
        segment_name: &str,
        variables: &dyn Substitute,
    ) -> Result<bool> {
        let location = Location::sequence(sequence_name).segment(segment_name);
        let Some(segment) = self
            .get(sequence_name)
            .and_then(|sequence| sequence.segments.get(segment_name))
        else {
            return Ok(false);
        };
        let Some(duration) = self.played_duration(segment, variables, &location)? else {
            return Ok(false);
        };
        let field = duration_field(duration);
        let segment = self
            .get_mut(sequence_name)
            .and_then(|sequence| sequence.segments.get_mut(segment_name));
        match segment {
            Some(segment) if segment.duration != field => {
                segment.duration = field;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Refresh the cached durations of all subsequence segments that
    /// (transitively) play `changed`.
    ///
    /// Each sequence is visited at most once, so cyclic references terminate;
    /// segments inside a cycle end up with an infinite duration.
    pub fn propagate_durations(&mut self, changed: &str, variables: &dyn Substitute) -> Result<()> {
        let mut queue = VecDeque::from([changed.to_string()]);
        let mut visited: IndexSet<String> = IndexSet::new();
        while let Some(name) = queue.pop_front() {
            if !visited.insert(name.clone()) {
                continue;
            }
            let appearances = self
                .get(&name)
                .map(|sequence| sequence.appearances.clone())
                .unwrap_or_default();
            for (parent, segments) in appearances {
                for segment in segments {
                    self.refresh_segment(&parent, &segment, variables)?;
                }
                queue.push_back(parent);
            }
        }
        Ok(())
    }

    /// Rebuild appearances and refresh every cached subsequence duration.
    pub fn refresh_all(&mut self, variables: &dyn Substitute) -> Result<()> {
        self.rebuild_appearances();
        let targets: Vec<(String, String)> = self
            .sequences
            .iter()
            .flat_map(|(sequence_name, sequence)| {
                sequence
                    .segments
                    .iter()
                    .filter(|(_, segment)| segment.referenced_sequence().is_some())
                    .map(move |(segment_name, _)| (sequence_name.clone(), segment_name.clone()))
            })
            .collect();
        for (sequence_name, segment_name) in targets {
            self.refresh_segment(&sequence_name, &segment_name, variables)?;
        }
        Ok(())
    }
}
