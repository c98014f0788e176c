// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Generation of ARTIQ experiment source from compiled sequences.
//!
//! The [`event_builder`] turns a [`CompiledProgram`] into devices and groups
//! of events, the [`phases`] render those into the methods of an
//! `EnvExperiment`, and [`generate_code`] ties both to the sequence compiler.
//!
//! [`CompiledProgram`]: sequence_compiler::compiled::CompiledProgram

pub mod device;
pub mod event;
pub mod event_builder;
pub mod generate_code;
pub mod hardware_util;
pub mod phases;
pub mod python;
pub mod settings;

#[cfg(test)]
mod tests;

pub use generate_code::{GeneratedCode, compile_code, generate_code};
pub use phases::CodeHook;
pub use settings::CodeGeneratorSettings;

use sequence_compiler::{ErrorKind, Location};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Compiler(#[from] sequence_compiler::Error),

    #[error("Delay of {delay} s before the next group is negative in '{group}'")]
    NegativeDelay { group: String, delay: f64 },

    #[error("Internal code generation error: {0}")]
    Internal(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl Error {
    pub fn new(msg: &str) -> Self {
        Error::Anyhow(anyhow::anyhow!(msg.to_string()))
    }

    pub fn authoring<S: Into<String>>(location: &Location, message: S) -> Self {
        Error::Compiler(sequence_compiler::Error::authoring(location, message))
    }

    pub fn inventory<S: Into<String>>(message: S) -> Self {
        Error::Compiler(sequence_compiler::Error::Inventory(message.into()))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Compiler(err) => err.kind(),
            Error::NegativeDelay { .. } => ErrorKind::Authoring,
            Error::Internal(_) | Error::Anyhow(_) => ErrorKind::Internal,
        }
    }
}

impl From<sequence_units::Error> for Error {
    fn from(err: sequence_units::Error) -> Self {
        Error::Compiler(err.into())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
