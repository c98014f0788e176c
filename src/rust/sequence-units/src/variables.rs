// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Number of full substitution passes before a text is considered to loop.
pub const MAX_SUBSTITUTION_PASSES: usize = 100;

/// Replaces alias tokens in user text with their current values.
pub trait Substitute {
    fn substitute(&self, text: &str) -> Result<String>;
}

impl<F> Substitute for F
where
    F: Fn(&str) -> Result<String>,
{
    fn substitute(&self, text: &str) -> Result<String> {
        self(text)
    }
}

/// Leaves every text untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSubstitution;

impl Substitute for NoSubstitution {
    fn substitute(&self, text: &str) -> Result<String> {
        Ok(text.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    #[serde(default)]
    pub alias: String,
    #[serde(default)]
    pub value: String,
    #[serde(default, rename = "isDir")]
    pub is_dir: bool,
}

impl Variable {
    pub fn new<S1: Into<String>, S2: Into<String>>(alias: S1, value: S2) -> Self {
        Variable {
            alias: alias.into(),
            value: value.into(),
            is_dir: false,
        }
    }

    /// The alias, falling back to the last path component of the variable name.
    pub fn effective_alias<'a>(&'a self, name: &'a str) -> &'a str {
        if self.alias.is_empty() {
            name.rsplit('/').next().unwrap_or(name)
        } else {
            &self.alias
        }
    }
}

/// Ordered table of variables keyed by their (possibly path-like) name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VariableTable {
    variables: IndexMap<String, Variable>,
}

impl VariableTable {
    pub fn insert<S: Into<String>>(&mut self, name: S, variable: Variable) {
        self.variables.insert(name.into(), variable);
    }

    pub fn get(&self, name: &str) -> Option<&Variable> {
        self.variables.get(name)
    }

    pub fn set_value<S: Into<String>>(&mut self, name: &str, value: S) -> Result<()> {
        let variable = self
            .variables
            .get_mut(name)
            .ok_or_else(|| anyhow::anyhow!("Unknown variable '{name}'"))?;
        variable.value = value.into();
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Variable)> {
        self.variables.iter()
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }
}

impl Substitute for VariableTable {
    fn substitute(&self, text: &str) -> Result<String> {
        let mut current = text.to_string();
        let mut passes = 0;
        loop {
            let mut changed = false;
            for (name, variable) in self.variables.iter().filter(|(_, v)| !v.is_dir) {
                let alias = variable.effective_alias(name);
                if alias.is_empty() || !current.contains(alias) {
                    continue;
                }
                let replaced = current.replace(alias, &variable.value);
                if replaced != current {
                    current = replaced;
                    changed = true;
                }
            }
            if !changed {
                return Ok(current);
            }
            passes += 1;
            if passes > MAX_SUBSTITUTION_PASSES {
                return Err(Error::Substitution(text.to_string()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_substitution() {
        let mut table = VariableTable::default();
        table.insert("Outer", Variable::new("$outer", "2*$inner"));
        table.insert("Inner", Variable::new("$inner", "21"));
        assert_eq!(table.substitute("$outer + 1").unwrap(), "2*21 + 1");
    }

    #[test]
    fn test_alias_falls_back_to_name() {
        let mut table = VariableTable::default();
        table.insert("timing/WaitTime", Variable::new("", "3"));
        assert_eq!(table.substitute("WaitTime").unwrap(), "3");
    }

    #[test]
    fn test_directories_are_skipped() {
        let mut table = VariableTable::default();
        table.insert(
            "dir",
            Variable {
                alias: "dir".to_string(),
                value: "boom".to_string(),
                is_dir: true,
            },
        );
        assert_eq!(table.substitute("dir").unwrap(), "dir");
    }

    #[test]
    fn test_runaway_substitution() {
        let mut table = VariableTable::default();
        table.insert("a", Variable::new("$a", "$b"));
        table.insert("b", Variable::new("$b", "$a"));
        assert!(matches!(
            table.substitute("$a"),
            Err(Error::Substitution(_))
        ));
    }

    #[test]
    fn test_self_reference_is_stable() {
        let mut table = VariableTable::default();
        table.insert("a", Variable::new("a", "a"));
        assert_eq!(table.substitute("a").unwrap(), "a");
    }

    #[test]
    fn test_closure_substitution() {
        let upper = |text: &str| -> Result<String> { Ok(text.to_uppercase()) };
        assert_eq!(upper.substitute("abc").unwrap(), "ABC");
    }

    #[test]
    fn test_deserialize() {
        let table: VariableTable = serde_json::from_str(
            r#"{"BlinkTime": {"isDir": false, "value": "500", "alias": "BlinkTime"}}"#,
        )
        .unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.substitute("BlinkTime").unwrap(), "500");
    }
}
