// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

use std::borrow::Cow;

use serde::{Deserialize, Serialize};

use crate::formula::evaluate_constant;
use crate::variables::Substitute;
use crate::{Error, Result};

const NAMED_UNITS: &[(&str, f64)] = &[
    ("", 1.0),
    ("s", 1.0),
    ("ms", 1e-3),
    ("us", 1e-6),
    ("µs", 1e-6),
    ("ns", 1e-9),
    ("Hz", 1.0),
    ("kHz", 1e3),
    ("MHz", 1e6),
    ("GHz", 1e9),
    ("V", 1.0),
    ("mV", 1e-3),
    ("uV", 1e-6),
    ("µV", 1e-6),
    ("A", 1.0),
    ("mA", 1e-3),
    ("uA", 1e-6),
    ("µA", 1e-6),
    ("dB", 1.0),
];

/// Look up the multiplier of a well-known unit symbol.
pub fn named_unit_factor(text: &str) -> Option<f64> {
    NAMED_UNITS
        .iter()
        .find(|(name, _)| *name == text)
        .map(|(_, factor)| *factor)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum UnitRepr {
    Text(String),
    Full {
        text: String,
        #[serde(default)]
        factor: Option<f64>,
    },
}

/// A unit selected for a field, e.g. `{"text": "ms", "factor": 0.001}`.
///
/// Units stored by name only (`"ms"`) resolve their factor from the table of
/// named units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "UnitRepr")]
pub struct Unit {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub factor: Option<f64>,
}

impl From<UnitRepr> for Unit {
    fn from(repr: UnitRepr) -> Self {
        match repr {
            UnitRepr::Text(text) => Unit { text, factor: None },
            UnitRepr::Full { text, factor } => Unit { text, factor },
        }
    }
}

impl Unit {
    pub fn new<S: Into<String>>(text: S, factor: f64) -> Self {
        Unit {
            text: text.into(),
            factor: Some(factor),
        }
    }

    pub fn named<S: Into<String>>(text: S) -> Self {
        Unit {
            text: text.into(),
            factor: None,
        }
    }

    pub fn factor(&self) -> Result<f64> {
        self.factor
            .or_else(|| named_unit_factor(&self.text))
            .ok_or_else(|| Error::UnknownUnit(self.text.clone()))
    }
}

/// A user-entered value: a bare number, a text expression, or a text
/// expression with a unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Number(f64),
    Text(String),
    WithUnit {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        unit: Option<Unit>,
    },
}

impl FieldValue {
    pub fn with_unit<S: Into<String>>(text: S, unit: Unit) -> Self {
        FieldValue::WithUnit {
            text: text.into(),
            unit: Some(unit),
        }
    }

    pub fn text(&self) -> Cow<'_, str> {
        match self {
            FieldValue::Number(value) => Cow::Owned(value.to_string()),
            FieldValue::Text(text) | FieldValue::WithUnit { text, .. } => Cow::Borrowed(text),
        }
    }

    pub fn unit(&self) -> Option<&Unit> {
        match self {
            FieldValue::WithUnit { unit, .. } => unit.as_ref(),
            _ => None,
        }
    }

    /// Whether the field holds no text at all.
    pub fn is_blank(&self) -> bool {
        self.text().trim().is_empty()
    }

    fn unit_factor(&self) -> Result<f64> {
        self.unit().map_or(Ok(1.0), Unit::factor)
    }

    /// The text after alias substitution.
    pub fn substituted(&self, variables: &dyn Substitute) -> Result<String> {
        variables.substitute(&self.text())
    }

    /// Substitute aliases, evaluate the text and apply the unit factor.
    pub fn resolve(&self, variables: &dyn Substitute) -> Result<f64> {
        self.resolve_with(variables, evaluate_constant)
    }

    /// Like [`FieldValue::resolve`], with a custom reader for the substituted text.
    pub fn resolve_with<F>(&self, variables: &dyn Substitute, reader: F) -> Result<f64>
    where
        F: FnOnce(&str) -> Result<f64>,
    {
        let text = self.substituted(variables)?;
        let value = reader(text.trim())? * self.unit_factor()?;
        if !value.is_finite() {
            return Err(Error::NotFinite(self.text().into_owned()));
        }
        Ok(value)
    }
}

impl From<&str> for FieldValue {
    fn from(text: &str) -> Self {
        FieldValue::Text(text.to_string())
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Number(value)
    }
}
