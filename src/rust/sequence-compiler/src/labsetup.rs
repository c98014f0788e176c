// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Hardware inventory: which physical device and channel sits behind every
//! logical port name, and the device database entries needed to find shared
//! controller boards.

use std::fmt;
use std::str::FromStr;

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};
use sequence_units::calibration::{CalibrationDataset, CalibrationReader};
use sequence_units::Unit;

use crate::{Error, Result};

/// The closed set of device modules a port can be wired to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Module {
    Ttl,
    Ad9910,
    Zotino,
    Fastino,
    Adf5356,
    Sampler,
    CurrentDriver,
}

impl Module {
    pub fn as_str(&self) -> &'static str {
        match self {
            Module::Ttl => "artiq.coredevice.ttl",
            Module::Ad9910 => "artiq.coredevice.ad9910",
            Module::Zotino => "artiq.coredevice.zotino",
            Module::Fastino => "artiq.coredevice.fastino",
            Module::Adf5356 => "artiq.coredevice.adf5356",
            Module::Sampler => "artiq.coredevice.sampler",
            Module::CurrentDriver => "custom.CurrentDriver",
        }
    }
}

impl FromStr for Module {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let module = match s {
            "artiq.coredevice.ttl" => Module::Ttl,
            "artiq.coredevice.ad9910" => Module::Ad9910,
            "artiq.coredevice.zotino" => Module::Zotino,
            "artiq.coredevice.fastino" => Module::Fastino,
            "artiq.coredevice.adf5356" => Module::Adf5356,
            "artiq.coredevice.sampler" => Module::Sampler,
            "custom.CurrentDriver" => Module::CurrentDriver,
            other => {
                return Err(Error::Inventory(format!(
                    "Device module '{other}' is not implemented"
                )));
            }
        };
        Ok(module)
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CalibrationMode {
    #[default]
    Formula,
    Dataset,
}

fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Text(String),
        Integer(i64),
        Float(f64),
    }
    Ok(Option::<Repr>::deserialize(deserializer)?.map(|repr| match repr {
        Repr::Text(text) => text,
        Repr::Integer(value) => value.to_string(),
        Repr::Float(value) => value.to_string(),
    }))
}

/// One lab setup entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Port {
    #[serde(default)]
    pub module: String,
    #[serde(default)]
    pub device: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub channel: Option<String>,
    #[serde(default)]
    pub inverted: bool,
    #[serde(default, rename = "isDir")]
    pub is_dir: bool,
    #[serde(default)]
    pub calibration_enabled: bool,
    #[serde(default)]
    pub calibration_unit_text: String,
    #[serde(default)]
    pub calibration_to_unit: Option<Unit>,
    #[serde(default)]
    pub calibration_mode: CalibrationMode,
    #[serde(default)]
    pub calibration_formula: String,
    #[serde(default)]
    pub calibration_dataset: Option<CalibrationDataset>,
}

impl Port {
    pub fn new<S1: Into<String>, S2: Into<String>>(
        module: Module,
        device: S1,
        channel: Option<S2>,
    ) -> Self {
        Port {
            module: module.as_str().to_string(),
            device: device.into(),
            channel: channel.map(Into::into),
            inverted: false,
            is_dir: false,
            calibration_enabled: false,
            calibration_unit_text: String::new(),
            calibration_to_unit: None,
            calibration_mode: CalibrationMode::Formula,
            calibration_formula: String::new(),
            calibration_dataset: None,
        }
    }

    pub fn module(&self) -> Result<Module> {
        self.module.parse()
    }

    /// Channel index on a multi-channel board.
    pub fn channel_index(&self) -> Result<u32> {
        let channel = self.channel.as_deref().unwrap_or_default();
        channel.trim().parse().map_err(|_| {
            Error::Inventory(format!(
                "Port on device '{}' has invalid channel '{channel}'",
                self.device
            ))
        })
    }

    /// Whether `unit_text` selects this port's calibration unit.
    pub fn is_calibration_unit(&self, unit_text: &str) -> bool {
        !self.calibration_unit_text.is_empty() && unit_text == self.calibration_unit_text
    }

    pub fn calibration_reader(&self) -> Result<CalibrationReader> {
        let factor = match &self.calibration_to_unit {
            Some(unit) => unit.factor()?,
            None => 1.0,
        };
        let reader = match self.calibration_mode {
            CalibrationMode::Formula => {
                CalibrationReader::formula(&self.calibration_formula, factor)?
            }
            CalibrationMode::Dataset => {
                let dataset = self.calibration_dataset.as_ref().ok_or_else(|| {
                    Error::Inventory(format!(
                        "Calibration of device '{}' has no dataset",
                        self.device
                    ))
                })?;
                CalibrationReader::dataset(dataset, factor)?
            }
        };
        Ok(reader)
    }
}

/// A device database entry, either a device description or an alias.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DeviceDbEntry {
    Alias(String),
    Device {
        #[serde(default, rename = "type")]
        kind: Option<String>,
        #[serde(default)]
        module: Option<String>,
        #[serde(default)]
        class: Option<String>,
        #[serde(default)]
        arguments: IndexMap<String, serde_json::Value>,
    },
}

impl DeviceDbEntry {
    pub fn class(&self) -> Option<&str> {
        match self {
            DeviceDbEntry::Device { class, .. } => class.as_deref(),
            DeviceDbEntry::Alias(_) => None,
        }
    }

    pub fn argument(&self, name: &str) -> Option<&str> {
        match self {
            DeviceDbEntry::Device { arguments, .. } => {
                arguments.get(name).and_then(|value| value.as_str())
            }
            DeviceDbEntry::Alias(_) => None,
        }
    }
}

/// The port table plus the device database it refers to.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LabSetup {
    #[serde(default)]
    pub ports: IndexMap<String, Port>,
    #[serde(default)]
    pub device_db: IndexMap<String, DeviceDbEntry>,
}

impl LabSetup {
    pub fn new(ports: IndexMap<String, Port>, device_db: IndexMap<String, DeviceDbEntry>) -> Self {
        LabSetup { ports, device_db }
    }

    pub fn add_port<S: Into<String>>(&mut self, name: S, port: Port) {
        self.ports.insert(name.into(), port);
    }

    pub fn port(&self, name: &str) -> Result<&Port> {
        self.ports
            .get(name)
            .filter(|port| !port.is_dir)
            .ok_or_else(|| Error::Inventory(format!("Unknown port '{name}'")))
    }

    /// Position of the first port wired to `device`, used to order devices
    /// in the generated code.
    pub fn declaration_index(&self, device: &str) -> Option<usize> {
        self.ports.values().position(|port| port.device == device)
    }

    fn resolve_entry(&self, device: &str) -> Option<&DeviceDbEntry> {
        let mut name = device;
        // Alias chains are short; bound the walk to the table size.
        for _ in 0..=self.device_db.len() {
            match self.device_db.get(name)? {
                DeviceDbEntry::Alias(target) => name = target,
                entry => return Some(entry),
            }
        }
        None
    }

    /// The CPLD controller board of a DDS or RF synthesizer channel.
    pub fn cpld_of(&self, device: &str) -> Result<String> {
        self.resolve_entry(device)
            .and_then(|entry| entry.argument("cpld_device"))
            .map(str::to_string)
            .ok_or_else(|| {
                Error::Inventory(format!(
                    "No CPLD device found in device_db for device '{device}'"
                ))
            })
    }

    /// The Almazny daughter board mounted on the Mirny board `cpld`.
    pub fn almazny_of(&self, cpld: &str) -> Result<String> {
        self.device_db
            .iter()
            .find(|(_, entry)| {
                entry.class() == Some("Almazny") && entry.argument("host_mirny") == Some(cpld)
            })
            .map(|(name, _)| name.clone())
            .ok_or_else(|| {
                Error::Inventory(format!("No almazny device found for mirny device '{cpld}'"))
            })
    }
}
