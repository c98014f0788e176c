// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Builds the devices and grouped events of a compiled program.
//!
//! Every port state segment becomes one [`Group::Events`] holding its RPC
//! calls and one event per device, and every repeated subsequence becomes a
//! [`Group::Repeat`] with its own groups. Ports wired to different channels
//! of the same multiplexed DAC (Zotino, Fastino) are merged into a single
//! event before the events are built.

use std::cmp::Reverse;

use indexmap::IndexMap;
use sequence_compiler::compiled::{
    CompiledDac, CompiledPortState, CompiledPortStates, CompiledProgram, CompiledSegment,
    CompiledSubsequence, CompiledTriggerWait,
};
use sequence_compiler::labsetup::{LabSetup, Module, Port};
use sequence_compiler::{Location, Seconds};
use sequence_log::diagnostic;
use sequence_units::text_to_identifier;

use crate::device::{
    DdsRegisterState, DeviceArena, DeviceId, DeviceKind, MirnyChannel, SweepDirection, TtlMode,
    UrukulChannel,
};
use crate::event::{
    CurrentDriverEvent, Event, EventKind, FastinoEvent, MirnyEvent, RpcEvent, SampleEvent,
    TriggerWaitEvent, UrukulEvent, ZotinoEvent,
};
use crate::settings::CodeGeneratorSettings;
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub enum Group {
    /// Events starting together at `time`, sorted by descending priority.
    Events {
        time: Seconds,
        duration: Seconds,
        events: Vec<Event>,
    },
    Repeat {
        /// Python identifier of the subsequence.
        name: String,
        time: Seconds,
        duration: Seconds,
        single_duration: Seconds,
        repeats: u64,
        groups: Vec<Group>,
    },
}

impl Group {
    pub fn time(&self) -> Seconds {
        match self {
            Group::Events { time, .. } | Group::Repeat { time, .. } => *time,
        }
    }

    pub fn duration(&self) -> Seconds {
        match self {
            Group::Events { duration, .. } | Group::Repeat { duration, .. } => *duration,
        }
    }

    /// Events of this group and all nested groups, depth first.
    pub fn events(&self) -> Box<dyn Iterator<Item = &Event> + '_> {
        match self {
            Group::Events { events, .. } => Box::new(events.iter()),
            Group::Repeat { groups, .. } => Box::new(groups.iter().flat_map(Group::events)),
        }
    }
}

/// Devices and event groups of one program.
#[derive(Debug, Clone)]
pub struct EventGraph {
    pub devices: DeviceArena,
    /// Devices the experiment declares, in declaration order.
    pub declared: Vec<DeviceId>,
    pub groups: Vec<Group>,
}

impl EventGraph {
    pub fn events(&self) -> impl Iterator<Item = &Event> {
        self.groups.iter().flat_map(Group::events)
    }
}

/// A port state segment entry after merging multiplexed DAC channels.
enum PortAction<'a> {
    Single {
        port: &'a str,
        state: &'a CompiledPortState,
    },
    /// All channels of one Zotino or Fastino, keyed by channel index.
    Multiplexed {
        port: &'a str,
        channels: IndexMap<u32, CompiledDac>,
    },
}

impl PortAction<'_> {
    fn port(&self) -> &str {
        match self {
            PortAction::Single { port, .. } | PortAction::Multiplexed { port, .. } => port,
        }
    }
}

fn is_multiplexed(module: Module) -> bool {
    matches!(module, Module::Zotino | Module::Fastino)
}

/// Merge the ports of each multiplexed DAC into the position of its first
/// port in the segment.
fn merge_dac_channels<'a>(
    segment: &'a CompiledPortStates,
    lab_setup: &LabSetup,
    location: &Location,
) -> Result<Vec<PortAction<'a>>> {
    let mut actions: Vec<PortAction<'a>> = Vec::with_capacity(segment.ports.len());
    let mut by_device: IndexMap<&str, usize> = IndexMap::new();
    for (port_name, state) in &segment.ports {
        let port = lab_setup.port(port_name)?;
        let dac = match state {
            CompiledPortState::Dac(dac) if is_multiplexed(port.module()?) => dac,
            _ => {
                actions.push(PortAction::Single {
                    port: port_name,
                    state,
                });
                continue;
            }
        };
        let channel = port
            .channel_index()
            .map_err(|err| err.located(&location.port(port_name)))?;
        match by_device.get(port.device.as_str()) {
            Some(index) => {
                if let PortAction::Multiplexed { channels, .. } = &mut actions[*index] {
                    channels.insert(channel, dac.clone());
                }
            }
            None => {
                by_device.insert(&port.device, actions.len());
                actions.push(PortAction::Multiplexed {
                    port: port_name,
                    channels: IndexMap::from([(channel, dac.clone())]),
                });
            }
        }
    }
    Ok(actions)
}

/// AD9910 channel number: the digits after the last `ch` of the device
/// name, falling back to the port's channel.
fn urukul_channel(device: &str, port: &Port) -> Result<u32> {
    match device.rsplit_once("ch").and_then(|(_, digits)| digits.parse().ok()) {
        Some(channel) => Ok(channel),
        None => Ok(port.channel_index()?),
    }
}

/// ADF5356 channel: the port's channel, falling back to the last character
/// of the device name.
fn mirny_channel(device: &str, port: &Port) -> String {
    port.channel
        .as_deref()
        .map(str::trim)
        .filter(|channel| !channel.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| device.chars().last().map(String::from).unwrap_or_default())
}

struct GraphBuilder<'a> {
    lab_setup: &'a LabSetup,
    location: Location,
    devices: DeviceArena,
    next_group: usize,
}

impl<'a> GraphBuilder<'a> {
    fn new(
        program: &CompiledProgram,
        lab_setup: &'a LabSetup,
        settings: &CodeGeneratorSettings,
    ) -> Self {
        GraphBuilder {
            lab_setup,
            location: Location::sequence(&program.name),
            devices: DeviceArena::new(&settings.rpc_device_name),
            next_group: 0,
        }
    }

    fn port_device(&mut self, port_name: &str, location: &Location) -> Result<DeviceId> {
        let lab_setup = self.lab_setup;
        let port = lab_setup.port(port_name)?;
        let name = port.device.as_str();
        let devices = &mut self.devices;
        let mut simple =
            |kind: DeviceKind| devices.get_or_insert_with(name, location, |_| Ok(kind));
        let id = match port.module()? {
            Module::Ttl => simple(DeviceKind::Ttl(TtlMode::Output))?,
            Module::Zotino => simple(DeviceKind::Zotino)?,
            Module::Fastino => simple(DeviceKind::Fastino)?,
            Module::Sampler => simple(DeviceKind::Sampler)?,
            Module::CurrentDriver => simple(DeviceKind::CurrentDriver)?,
            Module::Ad9910 => {
                let cpld_name = lab_setup.cpld_of(name)?;
                let cpld = devices.get_or_insert_with(&cpld_name, location, |_| {
                    Ok(DeviceKind::UrukulCpld {
                        need_init: false,
                        need_get_att: false,
                    })
                })?;
                let channel = urukul_channel(name, port)?;
                let id = devices.get_or_insert_with(name, location, |_| {
                    Ok(DeviceKind::Urukul(UrukulChannel {
                        channel,
                        cpld,
                        need_init: false,
                        state: DdsRegisterState::Normal,
                        last_sweep_dir: SweepDirection::Down,
                    }))
                })?;
                devices.add_related(id, cpld);
                id
            }
            Module::Adf5356 => {
                let cpld_name = lab_setup.cpld_of(name)?;
                let cpld = devices.get_or_insert_with(&cpld_name, location, |_| {
                    Ok(DeviceKind::MirnyCpld { skip_init: false })
                })?;
                let id = devices.get_or_insert_with(name, location, |_| {
                    Ok(DeviceKind::Mirny(MirnyChannel {
                        channel: mirny_channel(name, port),
                        cpld,
                        enabled: None,
                    }))
                })?;
                devices.add_related(id, cpld);
                id
            }
        };
        Ok(id)
    }

    /// The Almazny mounted on the Mirny board of `mirny`.
    fn almazny_device(&mut self, mirny: DeviceId, location: &Location) -> Result<DeviceId> {
        let cpld = self.devices.mirny_mut(mirny)?.cpld;
        let almazny_name = self.lab_setup.almazny_of(&self.devices.get(cpld).name)?;
        let almazny = self
            .devices
            .get_or_insert_with(&almazny_name, location, |_| Ok(DeviceKind::Almazny))?;
        self.devices.add_related(mirny, almazny);
        Ok(almazny)
    }

    fn next_group_id(&mut self) -> usize {
        let id = self.next_group;
        self.next_group += 1;
        id
    }

    fn event(
        &mut self,
        device: DeviceId,
        group: usize,
        time: Seconds,
        duration: Seconds,
        kind: EventKind,
    ) -> Event {
        let time_index = self.devices.register_event(device, group);
        Event::new(device, time, duration, time_index, kind)
    }

    fn build_groups(&mut self, segments: &[CompiledSegment]) -> Result<Vec<Group>> {
        let mut groups = Vec::with_capacity(segments.len());
        for segment in segments {
            match segment {
                CompiledSegment::PortState(segment) => {
                    groups.push(self.port_state_group(segment)?);
                }
                CompiledSegment::TriggerWait(segment) => {
                    groups.push(self.trigger_wait_group(segment)?);
                }
                CompiledSegment::Subsequence(segment) => {
                    if let Some(group) = self.repeat_group(segment)? {
                        groups.push(group);
                    }
                }
            }
        }
        Ok(groups)
    }

    fn repeat_group(&mut self, segment: &CompiledSubsequence) -> Result<Option<Group>> {
        if segment.repeats == 0 {
            return Ok(None);
        }
        let groups = self.build_groups(&segment.subsequence)?;
        Ok(Some(Group::Repeat {
            name: text_to_identifier(&segment.name),
            time: segment.time,
            duration: segment.duration,
            single_duration: segment.single_duration,
            repeats: segment.repeats,
            groups,
        }))
    }

    fn trigger_wait_group(&mut self, segment: &CompiledTriggerWait) -> Result<Group> {
        let location = self.location.port(&segment.input_ttl);
        let device = self.devices.get_or_insert_with(&segment.input_ttl, &location, |_| {
            Ok(DeviceKind::Ttl(TtlMode::Input))
        })?;
        let group = self.next_group_id();
        let wait = TriggerWaitEvent::new(&mut self.devices, device);
        let event = self.event(
            device,
            group,
            segment.time,
            segment.duration,
            EventKind::TriggerWait(wait),
        );
        Ok(Group::Events {
            time: segment.time,
            duration: segment.duration,
            events: vec![event],
        })
    }

    fn port_state_group(&mut self, segment: &CompiledPortStates) -> Result<Group> {
        let group = self.next_group_id();
        let (time, duration) = (segment.time, segment.duration);
        let mut events = Vec::with_capacity(segment.rpcs.len() + segment.ports.len());
        for (name, rpc) in &segment.rpcs {
            let rpc_device = self.devices.rpc();
            let kind = EventKind::Rpc(RpcEvent::new(name, rpc));
            events.push(self.event(rpc_device, group, time, duration, kind));
        }
        for action in merge_dac_channels(segment, self.lab_setup, &self.location)? {
            let location = self.location.port(action.port());
            let device = self.port_device(action.port(), &location)?;
            let kind = self
                .event_kind(&action, device, duration, &location)
                .map_err(|err| match err {
                    Error::Compiler(err) => Error::Compiler(err.located(&location)),
                    other => other,
                })?;
            events.push(self.event(device, group, time, duration, kind));
        }
        events.sort_by_key(|event| Reverse(event.priority));
        Ok(Group::Events {
            time,
            duration,
            events,
        })
    }

    fn event_kind(
        &mut self,
        action: &PortAction,
        device: DeviceId,
        duration: Seconds,
        location: &Location,
    ) -> Result<EventKind> {
        let (port, state) = match action {
            PortAction::Single { port, state } => (*port, *state),
            PortAction::Multiplexed { channels, .. } => {
                let is_zotino = matches!(self.devices.get(device).kind, DeviceKind::Zotino);
                return if is_zotino {
                    Ok(EventKind::Zotino(ZotinoEvent::new(
                        &mut self.devices,
                        device,
                        channels,
                        duration,
                        location,
                    )?))
                } else {
                    Ok(EventKind::Fastino(FastinoEvent::new(
                        &mut self.devices,
                        device,
                        channels,
                        duration,
                        location,
                    )?))
                };
            }
        };
        let matches_module = matches!(
            (&self.devices.get(device).kind, state),
            (DeviceKind::Ttl(_), CompiledPortState::Ttl(_))
                | (DeviceKind::Sampler, CompiledPortState::Sampler(_))
                | (DeviceKind::CurrentDriver, CompiledPortState::Dac(_))
                | (DeviceKind::Urukul(_), CompiledPortState::Dds(_))
                | (DeviceKind::Mirny(_), CompiledPortState::RfSynth(_))
        );
        if !matches_module {
            return Err(Error::Internal(format!(
                "Compiled state of port '{port}' does not match its device module"
            )));
        }
        let kind = match state {
            CompiledPortState::Ttl(ttl) => EventKind::Ttl { state: ttl.state },
            CompiledPortState::Sampler(sampler) => {
                EventKind::Sample(SampleEvent::new(sampler.freq, duration))
            }
            CompiledPortState::Dac(dac) => EventKind::CurrentDriver(CurrentDriverEvent::new(
                &mut self.devices,
                device,
                dac,
                duration,
                location,
            )?),
            CompiledPortState::Dds(dds) => EventKind::Urukul(UrukulEvent::new(
                &mut self.devices,
                device,
                dds,
                duration,
                location,
            )?),
            CompiledPortState::RfSynth(rf) => {
                let almazny = if rf.use_almazny {
                    Some(self.almazny_device(device, location)?)
                } else {
                    None
                };
                EventKind::Mirny(MirnyEvent::new(&mut self.devices, device, rf, almazny)?)
            }
        };
        Ok(kind)
    }

    /// Hold the end of the program until the timeline has caught up.
    fn final_wait(&mut self, time: Seconds) -> Group {
        let group = self.next_group_id();
        let core = self.devices.core();
        let event = self.event(core, group, time, 0.0, EventKind::Wait);
        Group::Events {
            time,
            duration: 0.0,
            events: vec![event],
        }
    }
}

/// Build the devices and event groups of `program`.
pub fn build(
    program: &CompiledProgram,
    lab_setup: &LabSetup,
    settings: &CodeGeneratorSettings,
) -> Result<EventGraph> {
    let mut builder = GraphBuilder::new(program, lab_setup, settings);
    let mut groups = builder.build_groups(&program.segments)?;
    groups.push(builder.final_wait(program.duration));

    let devices = builder.devices;
    let declared = devices.declared_devices(|device| {
        lab_setup
            .declaration_index(&device.name)
            .unwrap_or(usize::MAX)
    });
    diagnostic!(
        "Built {} event groups on {} devices, {} declared",
        builder.next_group,
        devices.len(),
        declared.len()
    );
    Ok(EventGraph {
        devices,
        declared,
        groups,
    })
}
