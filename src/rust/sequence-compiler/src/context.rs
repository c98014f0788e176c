// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

use sequence_units::Substitute;

use crate::labsetup::LabSetup;
use crate::store::SequenceStore;

/// Everything a compilation reads. Compilations never write to it, so
/// independent compilations can share the store and lab setup as long as
/// each one brings its own variables.
#[derive(Clone, Copy)]
pub struct CompileContext<'a> {
    pub sequences: &'a SequenceStore,
    pub lab_setup: &'a LabSetup,
    pub variables: &'a (dyn Substitute + Sync),
}

impl<'a> CompileContext<'a> {
    pub fn new(
        sequences: &'a SequenceStore,
        lab_setup: &'a LabSetup,
        variables: &'a (dyn Substitute + Sync),
    ) -> Self {
        CompileContext {
            sequences,
            lab_setup,
            variables,
        }
    }
}
