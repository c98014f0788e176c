// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Numeric building blocks of the sequence compiler.
//!
//! Everything a user types into a sequence ends up as text: durations,
//! voltages, frequencies, formulas. This crate turns that text into numbers:
//! alias substitution ([`variables`]), expression evaluation ([`formula`]),
//! unit factors ([`unit`]), calibration curves ([`calibration`]) and the
//! DAC step-count heuristics ([`steps`]).

pub mod calibration;
pub mod formula;
pub mod identifier;
pub mod repr;
pub mod steps;
pub mod unit;
pub mod variables;

pub use formula::{Formula, evaluate_constant};
pub use identifier::text_to_identifier;
pub use repr::float_repr;
pub use unit::{FieldValue, Unit};
pub use variables::{NoSubstitution, Substitute, Variable, VariableTable};

/// Time in seconds.
pub type Seconds = f64;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Invalid formula '{formula}': {message}")]
    Formula { formula: String, message: String },

    #[error("Unknown unit '{0}'")]
    UnknownUnit(String),

    #[error("Infinite loop in variable substitution of '{0}'")]
    Substitution(String),

    #[error("{0}")]
    Interpolation(String),

    #[error("Value of '{0}' is not a finite number")]
    NotFinite(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl Error {
    pub fn new(msg: &str) -> Self {
        Error::Anyhow(anyhow::anyhow!(msg.to_string()))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
