// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Build ids and the path their generated code is filed under.
//!
//! A build id is the local wall-clock time of the compilation written as
//! digits, `YYYYmmddHHMMSS` followed by three digits of milliseconds. The
//! generated experiment checks the id it was handed against its own, so two
//! builds must never share one.

use std::fmt;

use chrono::{Local, NaiveDateTime, Timelike};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BuildId(u64);

impl BuildId {
    pub fn from_datetime(datetime: &NaiveDateTime) -> Self {
        let seconds = datetime.format("%Y%m%d%H%M%S").to_string();
        // The format only ever produces digits.
        let seconds: u64 = seconds.parse().unwrap_or_default();
        let millis = u64::from((datetime.nanosecond() / 1_000_000).min(999));
        BuildId(seconds * 1000 + millis)
    }

    pub fn now() -> Self {
        Self::from_datetime(&Local::now().naive_local())
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    pub fn next(&self) -> Self {
        BuildId(self.0 + 1)
    }
}

impl From<u64> for BuildId {
    fn from(value: u64) -> Self {
        BuildId(value)
    }
}

impl fmt::Display for BuildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Relative path of the generated code of `id`, bucketed by day and hour of
/// `datetime`.
pub fn artifact_path(datetime: &NaiveDateTime, id: BuildId) -> String {
    format!(
        "generatedCode/{}/{}/{id}.py",
        datetime.format("%Y-%m-%d"),
        datetime.format("%H")
    )
}

/// First build id at or after the one of `datetime` whose artifact path is
/// not taken yet.
pub fn allocate<F>(datetime: &NaiveDateTime, is_taken: F) -> (BuildId, String)
where
    F: Fn(&str) -> bool,
{
    let mut id = BuildId::from_datetime(datetime);
    loop {
        let path = artifact_path(datetime, id);
        if !is_taken(&path) {
            return (id, path);
        }
        id = id.next();
    }
}
