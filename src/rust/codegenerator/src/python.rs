// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Statement list for emitting Python source.
//!
//! Statements are collected in a tree and rendered in one go, so callers
//! never deal with indentation: a [`PyStatement::Block`] indents its body by
//! one level when it is rendered.

use sequence_units::float_repr;

const INDENT: &str = "    ";

/// A value rendered as a Python literal.
#[derive(Debug, Clone, PartialEq)]
pub enum PyValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Str(String),
    List(Vec<PyValue>),
}

impl PyValue {
    pub fn float_list(values: &[f64]) -> Self {
        PyValue::List(values.iter().copied().map(PyValue::Float).collect())
    }

    pub fn integer_list<I: IntoIterator<Item = i64>>(values: I) -> Self {
        PyValue::List(values.into_iter().map(PyValue::Integer).collect())
    }
}

impl std::fmt::Display for PyValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PyValue::Bool(true) => write!(f, "True"),
            PyValue::Bool(false) => write!(f, "False"),
            PyValue::Integer(value) => write!(f, "{value}"),
            PyValue::Float(value) => write!(f, "{}", float_repr(*value)),
            PyValue::Str(text) => write!(f, "{}", string_literal(text)),
            PyValue::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
        }
    }
}

/// Double quoted Python string literal of `text`.
pub fn string_literal(text: &str) -> String {
    // JSON string escapes are a subset of Python's.
    serde_json::to_string(text).unwrap_or_else(|_| format!("\"{text}\""))
}

#[derive(Debug, Clone, PartialEq)]
pub enum PyStatement {
    Line(String),
    Comment(String),
    Blank,
    /// `header:` followed by an indented body; an empty body renders `pass`.
    Block {
        header: String,
        body: PythonGenerator,
    },
    /// Verbatim, possibly multi-line text. Indented like any other statement.
    Raw(String),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PythonGenerator {
    statements: Vec<PyStatement>,
}

fn indent(s: &str, prefix: &str) -> String {
    s.lines()
        .flat_map(|line| {
            if line.is_empty() {
                ["", "", "\n"]
            } else {
                [prefix, line, "\n"]
            }
        })
        .collect()
}

impl PythonGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    /// Number of rendered non-blank statements, nested bodies included.
    pub fn num_lines(&self) -> usize {
        self.statements
            .iter()
            .map(|statement| match statement {
                PyStatement::Line(_) | PyStatement::Comment(_) => 1,
                PyStatement::Blank => 0,
                PyStatement::Block { body, .. } => 1 + body.num_lines().max(1),
                PyStatement::Raw(text) => text.lines().filter(|l| !l.trim().is_empty()).count(),
            })
            .sum()
    }

    pub fn add_line<S: Into<String>>(&mut self, line: S) {
        self.statements.push(PyStatement::Line(line.into()));
    }

    pub fn add_comment<S: Into<String>>(&mut self, comment: S) {
        self.statements.push(PyStatement::Comment(comment.into()));
    }

    pub fn add_blank(&mut self) {
        self.statements.push(PyStatement::Blank);
    }

    pub fn add_block<S: Into<String>>(&mut self, header: S, body: PythonGenerator) {
        self.statements.push(PyStatement::Block {
            header: header.into(),
            body,
        });
    }

    pub fn add_raw<S: Into<String>>(&mut self, text: S) {
        self.statements.push(PyStatement::Raw(text.into()));
    }

    /// `self.<target> = <value>`
    pub fn add_assignment<S1: AsRef<str>, S2: AsRef<str>>(&mut self, target: S1, value: S2) {
        self.add_line(format!("self.{} = {}", target.as_ref(), value.as_ref()));
    }

    /// `self.<device>.<method>(<args>)`
    pub fn add_device_call<S: AsRef<str>>(&mut self, device: &str, method: S, args: &[String]) {
        self.add_line(format!(
            "self.{device}.{}({})",
            method.as_ref(),
            args.join(", ")
        ));
    }

    pub fn generate_python(&self) -> String {
        self.statements
            .iter()
            .map(|statement| self.emit_statement(statement))
            .collect::<String>()
    }

    fn emit_statement(&self, statement: &PyStatement) -> String {
        match statement {
            PyStatement::Line(line) => format!("{line}\n"),
            PyStatement::Comment(text) => format!("# {text}\n"),
            PyStatement::Blank => "\n".to_string(),
            PyStatement::Block { header, body } => {
                let body = if body.is_empty() {
                    format!("{INDENT}pass\n")
                } else {
                    indent(&body.generate_python(), INDENT)
                };
                format!("{header}:\n{body}")
            }
            PyStatement::Raw(text) => {
                if text.ends_with('\n') {
                    text.clone()
                } else {
                    format!("{text}\n")
                }
            }
        }
    }
}
