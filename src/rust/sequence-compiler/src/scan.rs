// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Multi-dimensional scans over variables.
//!
//! A scan is a list of dimensions. Every variable of a dimension steps in
//! lockstep with the others of the same dimension; dimensions nest, the last
//! one varying fastest. Each run gets its own copy of the variable table so
//! back-to-back compilations never see each other's values.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sequence_units::{VariableTable, float_repr};

use crate::{Error, Location, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanMode {
    #[default]
    Scan,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanVariableMode {
    #[default]
    #[serde(rename = "linear")]
    Linear,
    #[serde(rename = "data list")]
    DataList,
}

fn default_bound() -> Value {
    Value::String("0".to_string())
}

fn default_steps() -> Value {
    Value::String("10".to_string())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanVariable {
    #[serde(default)]
    pub mode: ScanVariableMode,
    #[serde(default = "default_bound")]
    pub min: Value,
    #[serde(default = "default_bound")]
    pub max: Value,
    #[serde(default)]
    pub datalist: Vec<Value>,
}

impl ScanVariable {
    pub fn linear(min: f64, max: f64) -> Self {
        ScanVariable {
            mode: ScanVariableMode::Linear,
            min: min.into(),
            max: max.into(),
            datalist: Vec::new(),
        }
    }

    pub fn data_list<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        ScanVariable {
            mode: ScanVariableMode::DataList,
            min: default_bound(),
            max: default_bound(),
            datalist: values.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanDimension {
    #[serde(default)]
    pub variables: IndexMap<String, ScanVariable>,
    #[serde(default = "default_steps")]
    pub steps: Value,
}

impl ScanDimension {
    pub fn new(steps: usize) -> Self {
        ScanDimension {
            variables: IndexMap::new(),
            steps: steps.into(),
        }
    }

    pub fn with_variable<S: Into<String>>(mut self, name: S, variable: ScanVariable) -> Self {
        self.variables.insert(name.into(), variable);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanPlan {
    #[serde(default)]
    pub mode: ScanMode,
    #[serde(default)]
    pub dimensions: IndexMap<String, ScanDimension>,
}

fn number(value: &Value, what: &str, location: &Location) -> Result<f64> {
    let parsed = match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| Error::authoring(location, format!("{what} '{value}' is not a number")))
}

/// Evenly spaced points from `min` to `max`, both included.
fn linspace(min: f64, max: f64, count: usize) -> Vec<f64> {
    match count {
        0 => Vec::new(),
        1 => vec![min],
        _ => {
            let step = (max - min) / (count - 1) as f64;
            let mut points: Vec<f64> = (0..count).map(|i| min + step * i as f64).collect();
            points[count - 1] = max;
            points
        }
    }
}

/// Text a variable is set to for one scan point.
fn value_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Number(number) => match number.as_i64() {
            Some(integer) => integer.to_string(),
            None => float_repr(number.as_f64().unwrap_or(f64::NAN)),
        },
        other => other.to_string(),
    }
}

/// The resolved values of a scan, one table per dimension.
struct ScanTable {
    steps: Vec<usize>,
    values: Vec<IndexMap<String, Vec<String>>>,
}

impl ScanPlan {
    /// Scan errors point at the dimension in place of a segment.
    fn location(dimension: &str) -> Location {
        Location {
            segment: Some(dimension.to_string()),
            ..Default::default()
        }
    }

    fn steps_of(name: &str, dimension: &ScanDimension) -> Result<usize> {
        let location = Self::location(name);
        let steps = number(&dimension.steps, "Scan steps", &location)?;
        if steps < 0.0 || steps.fract() != 0.0 {
            return Err(Error::authoring(
                &location,
                format!("Scan steps must be a non-negative integer, got {steps}"),
            ));
        }
        Ok(steps as usize)
    }

    /// Check that every data list has exactly as many values as its dimension
    /// has steps.
    pub fn validate(&self) -> Result<()> {
        for (name, dimension) in &self.dimensions {
            let steps = Self::steps_of(name, dimension)?;
            for (variable, data) in &dimension.variables {
                if data.mode == ScanVariableMode::DataList && data.datalist.len() != steps {
                    return Err(Error::authoring(
                        &Self::location(name),
                        format!(
                            "Dimension \"{name}\" has {steps} steps, but data list for variable \"{variable}\" has {} values.",
                            data.datalist.len()
                        ),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Total number of runs, the product of all dimension step counts.
    pub fn run_count(&self) -> Result<usize> {
        self.dimensions
            .iter()
            .try_fold(1usize, |count, (name, dimension)| {
                Ok(count * Self::steps_of(name, dimension)?)
            })
    }

    fn table(&self) -> Result<ScanTable> {
        self.validate()?;
        let mut steps = Vec::with_capacity(self.dimensions.len());
        let mut values = Vec::with_capacity(self.dimensions.len());
        for (name, dimension) in &self.dimensions {
            let count = Self::steps_of(name, dimension)?;
            let location = Self::location(name);
            let mut columns: IndexMap<String, Vec<String>> = IndexMap::new();
            for (variable, data) in &dimension.variables {
                let column: Vec<String> = match data.mode {
                    ScanVariableMode::Linear => {
                        let min = number(&data.min, "Scan minimum", &location)?;
                        let max = number(&data.max, "Scan maximum", &location)?;
                        linspace(min, max, count).into_iter().map(float_repr).collect()
                    }
                    ScanVariableMode::DataList => data.datalist.iter().map(value_text).collect(),
                };
                columns.insert(variable.clone(), column);
            }
            steps.push(count);
            values.push(columns);
        }
        Ok(ScanTable { steps, values })
    }

    /// Variable tables for every run, in run order.
    pub fn runs(&self, base: &VariableTable) -> Result<Vec<VariableTable>> {
        let table = self.table()?;
        let count = table.steps.iter().product::<usize>();
        (0..count)
            .map(|run| Self::apply(&table, run, base))
            .collect()
    }

    /// Variable table of run `run`: a copy of `base` with every scanned
    /// variable set to its value at that scan point.
    pub fn variables_for_run(&self, run: usize, base: &VariableTable) -> Result<VariableTable> {
        let table = self.table()?;
        let count = table.steps.iter().product::<usize>();
        if run >= count {
            return Err(Error::Internal(format!(
                "Scan run {run} out of range, the scan has {count} runs"
            )));
        }
        Self::apply(&table, run, base)
    }

    fn apply(table: &ScanTable, run: usize, base: &VariableTable) -> Result<VariableTable> {
        let mut variables = base.clone();
        for (j, columns) in table.values.iter().enumerate() {
            let divisor: usize = table.steps[j + 1..].iter().product();
            let index = (run / divisor) % table.steps[j];
            for (name, column) in columns {
                variables.set_value(name, column[index].as_str())?;
            }
        }
        Ok(variables)
    }
}
