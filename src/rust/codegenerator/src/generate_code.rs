// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

use anyhow::Context;
use sequence_compiler::build_id::BuildId;
use sequence_compiler::compiled::CompiledProgram;
use sequence_compiler::labsetup::LabSetup;
use sequence_compiler::{CompileContext, Seconds, compile_program};
use sequence_log::{diagnostic, info, warn};
use sequence_units::text_to_identifier;

use crate::Result;
use crate::event_builder;
use crate::phases::{self, CodeHook};
use crate::python::PythonGenerator;
use crate::settings::CodeGeneratorSettings;

const AD9910_IMPORTS: &str = "from artiq.coredevice.ad9910 import (PHASE_MODE_TRACKING, PHASE_MODE_ABSOLUTE, \
RAM_DEST_ASF, RAM_DEST_POW, RAM_DEST_FTW, RAM_DEST_POWASF, RAM_MODE_DIRECTSWITCH, RAM_MODE_RAMPUP, \
RAM_MODE_BIDIR_RAMP, RAM_MODE_CONT_RAMPUP, RAM_MODE_CONT_BIDIR_RAMP, _AD9910_REG_RAM)";

/// Generated experiment source and what it was generated for.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedCode {
    pub source: String,
    pub build_id: BuildId,
    /// Duration of the sequence the source plays.
    pub duration: Seconds,
}

/// Generate the ARTIQ experiment playing `program`.
pub fn generate_code(
    program: &CompiledProgram,
    lab_setup: &LabSetup,
    build_id: BuildId,
    mut settings: CodeGeneratorSettings,
    hooks: &[&dyn CodeHook],
) -> Result<GeneratedCode> {
    for msg in settings.sanitize()? {
        warn!(
            "Code generator setting `{}` is sanitized from {} to {}. Reason: {}",
            msg.field.to_uppercase(),
            msg.original,
            msg.sanitized,
            msg.reason
        );
    }
    let sequence_json = serde_json::to_string(&program.segments)
        .context("Error while serializing the compiled sequence")?;
    let mut graph = event_builder::build(program, lab_setup, &settings)?;

    let imports = phases::import_tokens(&graph, hooks);
    let build = phases::build_code(&graph, &settings, hooks);
    let functions = phases::function_code(&graph, hooks);
    let prepare = phases::prepare_code(&graph, &settings, build_id, &sequence_json, hooks)?;
    let init = phases::init_code(&graph, &settings, hooks);
    let run = phases::run_code(&mut graph, &settings, build_id, &program.name)?;
    let analyze = phases::analyze_code(&graph, hooks);
    diagnostic!(
        "Generated {} prepare, {} init and {} run statements",
        prepare.num_lines(),
        init.num_lines(),
        run.num_lines()
    );

    let mut file = PythonGenerator::new();
    file.add_line("from artiq.experiment import *");
    file.add_line(AD9910_IMPORTS);
    file.add_line("from artiq.coredevice import urukul");
    file.add_line("from artiq.coredevice import spi2 as spi");
    file.add_line("import numpy as np");
    for import in imports {
        file.add_raw(import);
    }
    file.add_blank();

    let mut class = PythonGenerator::new();
    class.add_blank();
    class.add_block("def build(self)", build);
    class.add_blank();
    for function in functions {
        class.add_raw(function);
        class.add_blank();
    }
    class.add_block("def prepare(self)", prepare);
    class.add_blank();
    class.add_line("@kernel");
    class.add_block("def init(self)", init);
    class.add_blank();
    class.add_line("@kernel");
    class.add_block("def run(self)", run);
    class.add_blank();
    class.add_block("def analyze(self)", analyze);
    file.add_block(
        format!("class {}(EnvExperiment)", text_to_identifier(&program.name)),
        class,
    );

    Ok(GeneratedCode {
        source: file.generate_python(),
        build_id,
        duration: program.duration,
    })
}

/// Compile the sequence `sequence` and generate its experiment.
pub fn compile_code(
    ctx: &CompileContext,
    sequence: &str,
    build_id: BuildId,
    settings: CodeGeneratorSettings,
    hooks: &[&dyn CodeHook],
) -> Result<GeneratedCode> {
    let program = compile_program(ctx, sequence)?;
    let generated = generate_code(&program, ctx.lab_setup, build_id, settings, hooks)?;
    info!(
        "Generated code {} for sequence '{}' lasting {} s",
        build_id,
        sequence,
        generated.duration
    );
    Ok(generated)
}
