// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Compilation of segment trees into time-stamped, typed events.
//!
//! A [`model::Sequence`] is an ordered list of segments that set ports, call
//! RPCs, wait for triggers, or play other sequences a number of times. The
//! [`time_compiler`] walks that tree with a running time cursor and uses the
//! [`value_compiler`] to turn each raw port state into the plain values the
//! code generator needs.

pub mod build_id;
pub mod compiled;
pub mod context;
pub mod labsetup;
pub mod model;
pub mod port_state;
pub mod scan;
pub mod store;
pub mod time_compiler;
pub mod value_compiler;

use std::fmt;

pub use context::CompileContext;
pub use sequence_units::Seconds;
pub use time_compiler::{compile_program, compile_sequence, duration_of, pre_compile_rpc};

/// Where in the user's sequence data an error originates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Location {
    pub sequence: Option<String>,
    pub segment: Option<String>,
    pub port: Option<String>,
}

impl Location {
    pub fn sequence<S: Into<String>>(sequence: S) -> Self {
        Location {
            sequence: Some(sequence.into()),
            ..Default::default()
        }
    }

    pub fn segment<S: Into<String>>(&self, segment: S) -> Self {
        Location {
            segment: Some(segment.into()),
            ..self.clone()
        }
    }

    pub fn port<S: Into<String>>(&self, port: S) -> Self {
        Location {
            port: Some(port.into()),
            ..self.clone()
        }
    }

    fn is_unknown(&self) -> bool {
        self.sequence.is_none() && self.segment.is_none() && self.port.is_none()
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = [
            ("sequence", &self.sequence),
            ("segment", &self.segment),
            ("port", &self.port),
        ]
        .iter()
        .filter_map(|(label, value)| value.as_ref().map(|v| format!("{label} '{v}'")))
        .collect();
        if parts.is_empty() {
            write!(f, "unknown location")
        } else {
            write!(f, "{}", parts.join(", "))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The user's sequence data cannot be compiled as written.
    Authoring,
    /// The lab setup or device database is missing or inconsistent.
    Inventory,
    /// A broken invariant of the compiler itself.
    Internal,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{message} ({location})")]
    Authoring { location: Location, message: String },

    #[error("Sequence '{0}' contains an infinite loop of subsequences")]
    Cycle(String),

    #[error("Lab setup error: {0}")]
    Inventory(String),

    #[error("Internal compiler error: {0}")]
    Internal(String),

    #[error(transparent)]
    Units(#[from] sequence_units::Error),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl Error {
    pub fn new(msg: &str) -> Self {
        Error::Anyhow(anyhow::anyhow!(msg.to_string()))
    }

    pub fn authoring<S: Into<String>>(location: &Location, message: S) -> Self {
        Error::Authoring {
            location: location.clone(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Authoring { .. } | Error::Cycle(_) | Error::Units(_) => ErrorKind::Authoring,
            Error::Inventory(_) => ErrorKind::Inventory,
            Error::Internal(_) | Error::Anyhow(_) => ErrorKind::Internal,
        }
    }

    /// Attach a location to errors that were raised without one.
    pub fn located(self, location: &Location) -> Self {
        match self {
            Error::Units(err) => Error::authoring(location, err.to_string()),
            Error::Authoring {
                location: unknown,
                message,
            } if unknown.is_unknown() => Error::authoring(location, message),
            other => other,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Attach a [`Location`] to a failing result.
pub trait ResultExt<T> {
    fn located(self, location: &Location) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T> for std::result::Result<T, E> {
    fn located(self, location: &Location) -> Result<T> {
        self.map_err(|err| err.into().located(location))
    }
}
