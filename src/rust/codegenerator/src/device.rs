// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Physical devices addressed by the generated experiment.
//!
//! Devices live in a [`DeviceArena`] for the duration of one code generation
//! and are referenced by [`DeviceId`]. Events carry the id of the device they
//! act on; everything a device needs to know about its events (whether it has
//! to be initialized, the helper functions it pulls in, the names of its
//! prepared variables) is recorded on the device while events are built.

use std::collections::HashMap;
use std::mem::discriminant;

use indexmap::{IndexMap, IndexSet};
use sequence_compiler::Location;

use crate::python::PythonGenerator;
use crate::settings::CodeGeneratorSettings;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(usize);

pub const CORE_DEVICE_NAME: &str = "core";

/// Hands out unique variable names of the form `<device>_<token>_<n>`.
#[derive(Debug, Clone, Default)]
pub struct NameAllocator {
    counters: HashMap<String, usize>,
}

impl NameAllocator {
    pub fn allocate(&mut self, device: &str, token: &str) -> String {
        let counter = self.counters.entry(token.to_string()).or_insert(0);
        let name = format!("{device}_{token}_{counter}");
        *counter += 1;
        name
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlMode {
    Output,
    Input,
}

impl TtlMode {
    fn as_str(&self) -> &'static str {
        match self {
            TtlMode::Output => "output",
            TtlMode::Input => "input",
        }
    }
}

/// Register configuration an AD9910 was left in by the previous event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DdsRegisterState {
    #[default]
    Normal,
    Sweep,
    Ram,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SweepDirection {
    Up,
    #[default]
    Down,
}

#[derive(Debug, Clone)]
pub struct UrukulChannel {
    pub channel: u32,
    pub cpld: DeviceId,
    pub need_init: bool,
    pub state: DdsRegisterState,
    pub last_sweep_dir: SweepDirection,
}

#[derive(Debug, Clone)]
pub struct MirnyChannel {
    pub channel: String,
    pub cpld: DeviceId,
    /// Last switch level written, `None` before the first write.
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone)]
pub enum DeviceKind {
    Core,
    Rpc,
    Ttl(TtlMode),
    Zotino,
    Fastino,
    Sampler,
    CurrentDriver,
    Urukul(UrukulChannel),
    UrukulCpld { need_init: bool, need_get_att: bool },
    Mirny(MirnyChannel),
    MirnyCpld { skip_init: bool },
    Almazny,
}

impl DeviceKind {
    fn describe(&self) -> &'static str {
        match self {
            DeviceKind::Core => "core",
            DeviceKind::Rpc => "RPC controller",
            DeviceKind::Ttl(_) => "TTL",
            DeviceKind::Zotino => "Zotino",
            DeviceKind::Fastino => "Fastino",
            DeviceKind::Sampler => "Sampler",
            DeviceKind::CurrentDriver => "CurrentDriver",
            DeviceKind::Urukul(_) => "AD9910",
            DeviceKind::UrukulCpld { .. } => "Urukul CPLD",
            DeviceKind::Mirny(_) => "ADF5356",
            DeviceKind::MirnyCpld { .. } => "Mirny CPLD",
            DeviceKind::Almazny => "Almazny",
        }
    }

    fn priority(&self) -> i32 {
        match self {
            DeviceKind::Core => 100,
            DeviceKind::UrukulCpld { .. } | DeviceKind::MirnyCpld { .. } => 20,
            _ => 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Device {
    pub name: String,
    pub kind: DeviceKind,
    /// Higher priorities are initialized first.
    pub priority: i32,
    /// Declared even if no event uses it.
    pub important: bool,
    /// Devices declared together with this one, e.g. its CPLD.
    pub related: Vec<DeviceId>,
    pub event_count: usize,
    /// Kernel helper functions the device's events call.
    pub functions: IndexSet<String>,
    names: NameAllocator,
    group_slot: Option<(usize, usize)>,
    next_time_index: usize,
}

impl Device {
    fn new(name: String, kind: DeviceKind) -> Self {
        Device {
            name,
            priority: kind.priority(),
            important: matches!(kind, DeviceKind::Core | DeviceKind::Rpc),
            kind,
            related: Vec::new(),
            event_count: 0,
            functions: IndexSet::new(),
            names: NameAllocator::default(),
            group_slot: None,
            next_time_index: 0,
        }
    }

    pub fn variable_name(&mut self, token: &str) -> String {
        self.names.allocate(&self.name, token)
    }

    pub(crate) fn init_code(&self, settings: &CodeGeneratorSettings, code: &mut PythonGenerator) {
        let name = &self.name;
        match &self.kind {
            DeviceKind::Core => {
                code.add_line("self.core.reset()");
                code.add_line("delay(10*ms)");
                code.add_line("self.core.break_realtime()");
                code.add_line("delay(10*ms)");
            }
            DeviceKind::Ttl(mode) => code.add_line(format!("self.{name}.{}()", mode.as_str())),
            DeviceKind::Zotino => {
                code.add_line(format!("self.{name}.init()"));
                code.add_line("delay(1*ms)");
            }
            DeviceKind::Fastino => {
                code.add_line(format!("self.{name}.init()"));
                if settings.fastino_afe_power_down {
                    code.add_line("delay(2*us)");
                    code.add_line(format!(
                        "self.{name}.set_cfg(reset=0, afe_power_down=1, dac_clr=0, clr_err=0)"
                    ));
                    code.add_line("delay(2*us)");
                }
            }
            DeviceKind::Sampler => code.add_line(format!("self.{name}.init()")),
            DeviceKind::Urukul(channel) if channel.need_init => {
                code.add_line(format!("self.{name}.init()"));
                code.add_line("delay(1*ms)");
            }
            DeviceKind::UrukulCpld {
                need_init,
                need_get_att,
            } => {
                if *need_init {
                    code.add_line(format!("self.{name}.init()"));
                    code.add_line("delay(1*ms)");
                }
                if *need_get_att {
                    code.add_line(format!("self.{name}.get_att_mu()"));
                    code.add_line("delay(1*ms)");
                }
            }
            DeviceKind::MirnyCpld { skip_init: false } => {
                code.add_line(format!("self.{name}.init()"));
            }
            DeviceKind::Rpc
            | DeviceKind::CurrentDriver
            | DeviceKind::Urukul(_)
            | DeviceKind::Mirny(_)
            | DeviceKind::MirnyCpld { .. }
            | DeviceKind::Almazny => {}
        }
    }

    pub(crate) fn build_code(&self, code: &mut PythonGenerator) {
        if let DeviceKind::CurrentDriver = self.kind {
            code.add_line(format!(
                "self.{} = CurrentDriverHandler(self.{})",
                current_driver_handler(&self.name),
                self.name
            ));
        }
    }

    fn reset_run_state(&mut self) {
        match &mut self.kind {
            DeviceKind::Urukul(channel) => {
                channel.state = DdsRegisterState::Normal;
                channel.last_sweep_dir = SweepDirection::Down;
            }
            DeviceKind::Mirny(channel) => channel.enabled = None,
            _ => {}
        }
    }
}

/// Name of the handler object wrapping the SPI bus of a current driver.
pub fn current_driver_handler(device: &str) -> String {
    format!("{device}_handler")
}

#[derive(Debug, Clone, Default)]
pub struct DeviceArena {
    devices: Vec<Device>,
    by_name: IndexMap<String, DeviceId>,
}

impl DeviceArena {
    /// Arena holding the core device and the RPC controller.
    pub fn new(rpc_device_name: &str) -> Self {
        let mut arena = DeviceArena::default();
        arena.insert(CORE_DEVICE_NAME, DeviceKind::Core);
        arena.insert(rpc_device_name, DeviceKind::Rpc);
        arena
    }

    fn insert(&mut self, name: &str, kind: DeviceKind) -> DeviceId {
        let id = DeviceId(self.devices.len());
        self.devices.push(Device::new(name.to_string(), kind));
        self.by_name.insert(name.to_string(), id);
        id
    }

    pub fn core(&self) -> DeviceId {
        DeviceId(0)
    }

    pub fn rpc(&self) -> DeviceId {
        DeviceId(1)
    }

    pub fn get(&self, id: DeviceId) -> &Device {
        &self.devices[id.0]
    }

    pub fn get_mut(&mut self, id: DeviceId) -> &mut Device {
        &mut self.devices[id.0]
    }

    pub fn find(&self, name: &str) -> Option<DeviceId> {
        self.by_name.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = DeviceId> + use<> {
        (0..self.devices.len()).map(DeviceId)
    }

    /// The device called `name`, created with `make` on first use.
    ///
    /// A name can only ever stand for one kind of device; a TTL in particular
    /// is either an output or an input.
    pub fn get_or_insert_with<F>(
        &mut self,
        name: &str,
        location: &Location,
        make: F,
    ) -> Result<DeviceId>
    where
        F: FnOnce(&mut Self) -> Result<DeviceKind>,
    {
        let kind = make(self)?;
        if let Some(id) = self.find(name) {
            let existing = &self.get(id).kind;
            return match (existing, &kind) {
                (DeviceKind::Ttl(a), DeviceKind::Ttl(b)) if a != b => Err(Error::authoring(
                    location,
                    format!("TTL '{name}' can only be either input or output, not both"),
                )),
                (a, b) if discriminant(a) != discriminant(b) => Err(Error::inventory(format!(
                    "Device '{name}' is used both as {} and as {}",
                    a.describe(),
                    b.describe()
                ))),
                _ => Ok(id),
            };
        }
        Ok(self.insert(name, kind))
    }

    pub fn add_related(&mut self, device: DeviceId, related: DeviceId) {
        let list = &mut self.get_mut(device).related;
        if !list.contains(&related) {
            list.push(related);
        }
    }

    pub fn variable_name(&mut self, device: DeviceId, token: &str) -> String {
        self.get_mut(device).variable_name(token)
    }

    /// Register an event on `device` in event group `group` and return the
    /// event's time index.
    ///
    /// The index counts the groups the device has events in, so all events of
    /// one device in one group share an index.
    pub fn register_event(&mut self, device: DeviceId, group: usize) -> usize {
        let device = self.get_mut(device);
        device.event_count += 1;
        match device.group_slot {
            Some((last_group, index)) if last_group == group => index,
            _ => {
                let index = device.next_time_index;
                device.next_time_index += 1;
                device.group_slot = Some((group, index));
                index
            }
        }
    }

    /// Forget the register states tracked while emitting run code.
    pub fn reset_run_state(&mut self) {
        for device in &mut self.devices {
            device.reset_run_state();
        }
    }

    pub fn urukul_mut(&mut self, id: DeviceId) -> Result<&mut UrukulChannel> {
        match &mut self.get_mut(id).kind {
            DeviceKind::Urukul(channel) => Ok(channel),
            other => Err(Error::Internal(format!(
                "Expected an AD9910 device, found {}",
                other.describe()
            ))),
        }
    }

    pub fn urukul(&self, id: DeviceId) -> Result<&UrukulChannel> {
        match &self.get(id).kind {
            DeviceKind::Urukul(channel) => Ok(channel),
            other => Err(Error::Internal(format!(
                "Expected an AD9910 device, found {}",
                other.describe()
            ))),
        }
    }

    pub fn mirny_mut(&mut self, id: DeviceId) -> Result<&mut MirnyChannel> {
        match &mut self.get_mut(id).kind {
            DeviceKind::Mirny(channel) => Ok(channel),
            other => Err(Error::Internal(format!(
                "Expected an ADF5356 device, found {}",
                other.describe()
            ))),
        }
    }

    /// Devices to declare, in declaration order.
    ///
    /// The core and RPC controller come first, followed by every device that
    /// has events in the order `rank` gives, each immediately followed by its
    /// related devices.
    pub fn declared_devices<F>(&self, rank: F) -> Vec<DeviceId>
    where
        F: Fn(&Device) -> usize,
    {
        let mut candidates: Vec<DeviceId> = self
            .ids()
            .filter(|id| {
                let device = self.get(*id);
                device.important || device.event_count > 0
            })
            .collect();
        candidates.sort_by_key(|id| match self.get(*id).kind {
            DeviceKind::Core => (0, 0),
            DeviceKind::Rpc => (1, 0),
            _ => (2, rank(self.get(*id))),
        });
        let mut declared: IndexSet<DeviceId> = IndexSet::new();
        for id in candidates {
            declared.insert(id);
            for related in &self.get(id).related {
                declared.insert(*related);
            }
        }
        declared.into_iter().collect()
    }
}
