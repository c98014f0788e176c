// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Module for defining settings for the code generator.
use serde::{Deserialize, Serialize};
use sequence_units::text_to_identifier;

use crate::{Error, Result};

pub const DEFAULT_RPC_DEVICE_NAME: &str = "sequence_gui_rpc";
pub const DEFAULT_ARTIQ_VERSION: u32 = 8;

#[derive(Debug, Clone)]
pub struct SanitizationChange {
    pub field: &'static str,
    pub original: String,
    pub sanitized: String,
    pub reason: String,
}

fn default_artiq_version() -> u32 {
    DEFAULT_ARTIQ_VERSION
}

fn default_rpc_device_name() -> String {
    DEFAULT_RPC_DEVICE_NAME.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeGeneratorSettings {
    /// Schedule groups with `delay_mu` instead of absolute `at_mu` timestamps.
    #[serde(default)]
    pub relative_timestamps: bool,
    /// Major ARTIQ version of the target master.
    #[serde(default = "default_artiq_version")]
    pub artiq_version: u32,
    /// Power down the Fastino analog front end during init.
    #[serde(default)]
    pub fastino_afe_power_down: bool,
    /// Device db name of the controller receiving RPC calls.
    #[serde(default = "default_rpc_device_name")]
    pub rpc_device_name: String,
    #[serde(default)]
    pub emit_timing_comments: bool,
}

impl Default for CodeGeneratorSettings {
    fn default() -> Self {
        CodeGeneratorSettings {
            relative_timestamps: false,
            artiq_version: DEFAULT_ARTIQ_VERSION,
            fastino_afe_power_down: false,
            rpc_device_name: default_rpc_device_name(),
            emit_timing_comments: false,
        }
    }
}

impl CodeGeneratorSettings {
    /// Keyword of `NumberValue` that sets the displayed precision.
    pub(crate) fn number_value_precision_keyword(&self) -> &'static str {
        if self.artiq_version <= 7 {
            "ndecimals"
        } else {
            "precision"
        }
    }

    pub fn sanitize(&mut self) -> Result<Vec<SanitizationChange>> {
        if self.artiq_version == 0 {
            return Err(Error::new("ARTIQ version must be a positive major version"));
        }
        let mut changes = vec![];
        let sanitized = text_to_identifier(&self.rpc_device_name);
        if sanitized != self.rpc_device_name {
            changes.push(SanitizationChange {
                field: "rpc_device_name",
                original: self.rpc_device_name.clone(),
                sanitized: sanitized.clone(),
                reason: "Not a valid Python identifier.".to_string(),
            });
            self.rpc_device_name = sanitized;
        }
        Ok(changes)
    }
}
