// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

use indexmap::IndexMap;
use sequence_compiler::Location;
use sequence_compiler::Seconds;
use sequence_compiler::compiled::CompiledDac;
use sequence_log::warn;
use sequence_units::float_repr;
use sequence_units::steps::DacFamily;

use super::seconds_to_mu;
use crate::device::{DeviceArena, DeviceId, current_driver_handler};
use crate::hardware_util::{sweep_voltages, transpose};
use crate::python::{PyValue, PythonGenerator};
use crate::{Error, Result};

/// Time one Fastino channel update occupies on the timeline.
const FASTINO_CHANNEL_TIME: Seconds = 5e-8;
/// SPI transfer time of one CurrentDriver update.
const CURRENT_DRIVER_WRITE_TIME: Seconds = 528e-9;

pub(super) const CURRENT_DRIVER_IMPORTS: &str = r#"CURRENT_DRIVER_SPI_CONFIG = (0*spi.SPI_OFFLINE | 0*spi.SPI_END |
            0*spi.SPI_INPUT | 0*spi.SPI_CS_POLARITY |
            0*spi.SPI_CLK_POLARITY | 1*spi.SPI_CLK_PHASE |
            0*spi.SPI_LSB_FIRST | 0*spi.SPI_HALF_DUPLEX)

class CurrentDriverHandler:
    def __init__(self, spi):
        self.spi = spi

    def voltage_to_mu(self, voltage):
        voltage_bits = int(2**20/20*(voltage+10))
        bits = np.int32(0 << 31 | 1 << 24 | voltage_bits << 4)
        return bits

    @kernel
    def set_voltage_mu(self, voltage_mu):
        self.spi.set_config_mu(CURRENT_DRIVER_SPI_CONFIG | spi.SPI_END, 32, 2, 1)
        self.spi.write(voltage_mu)"#;

/// Channels of one multiplexed DAC set in the same segment, with the
/// step-major voltage table of the swept ones.
#[derive(Debug, Clone)]
struct ChannelSet {
    channels: Vec<u32>,
    voltages: Vec<f64>,
    sweep_channels: Vec<u32>,
    sweep_table: Vec<Vec<f64>>,
}

impl ChannelSet {
    fn new(
        channels: &IndexMap<u32, CompiledDac>,
        step_count: impl FnOnce(usize) -> usize,
        location: &Location,
    ) -> Result<(Self, usize)> {
        let swept: Vec<(u32, &CompiledDac, f64)> = channels
            .iter()
            .filter_map(|(channel, dac)| dac.sweep_voltage.map(|target| (*channel, dac, target)))
            .collect();
        let steps = step_count(swept.len());
        let columns = swept
            .iter()
            .map(|(_, dac, target)| {
                sweep_voltages(&dac.formula_text, steps, dac.voltage, *target, location)
            })
            .collect::<Result<Vec<_>>>()?;
        let set = ChannelSet {
            channels: channels.keys().copied().collect(),
            voltages: channels.values().map(|dac| dac.voltage).collect(),
            sweep_channels: swept.iter().map(|(channel, _, _)| *channel).collect(),
            sweep_table: transpose(&columns, steps),
        };
        Ok((set, steps))
    }

    fn is_sweeping(&self) -> bool {
        !self.sweep_channels.is_empty()
    }

    fn channel_list(channels: &[u32]) -> PyValue {
        PyValue::integer_list(channels.iter().map(|channel| *channel as i64))
    }

    fn sweep_table_literal(&self) -> PyValue {
        PyValue::List(
            self.sweep_table
                .iter()
                .map(|step| PyValue::float_list(step))
                .collect(),
        )
    }

    fn prepare_voltages(&self, device: &str, target: &str, code: &mut PythonGenerator) {
        code.add_assignment(
            target,
            format!(
                "[self.{device}.voltage_to_mu(voltage) for voltage in {}]",
                PyValue::float_list(&self.voltages)
            ),
        );
    }

    fn prepare_sweep(&self, device: &str, target: &str, code: &mut PythonGenerator) {
        code.add_assignment(
            target,
            format!(
                "[[self.{device}.voltage_to_mu(voltage) for voltage in step] for step in {}]",
                self.sweep_table_literal()
            ),
        );
    }
}

/// Voltages for several channels of a Zotino, written in one transfer.
#[derive(Debug, Clone)]
pub struct ZotinoEvent {
    set: ChannelSet,
    step_count: usize,
    step_time: Seconds,
    voltages_var: String,
    sweep_var: String,
    step_time_var: String,
}

impl ZotinoEvent {
    pub fn new(
        arena: &mut DeviceArena,
        device: DeviceId,
        channels: &IndexMap<u32, CompiledDac>,
        duration: Seconds,
        location: &Location,
    ) -> Result<Self> {
        let (set, step_count) =
            ChannelSet::new(channels, |_| DacFamily::Zotino.step_count(duration), location)?;
        Ok(ZotinoEvent {
            set,
            step_count,
            step_time: duration / step_count as f64,
            voltages_var: arena.variable_name(device, "voltages"),
            sweep_var: arena.variable_name(device, "sweep_voltages"),
            step_time_var: arena.variable_name(device, "step_time"),
        })
    }

    pub(super) fn prepare_code(&self, device: &str, code: &mut PythonGenerator) {
        self.set.prepare_voltages(device, &self.voltages_var, code);
        if self.set.is_sweeping() {
            self.set.prepare_sweep(device, &self.sweep_var, code);
            code.add_assignment(&self.step_time_var, seconds_to_mu(self.step_time));
        }
    }

    pub(super) fn run_code(&self, device: &str, code: &mut PythonGenerator) {
        code.add_line(format!(
            "self.{device}.set_dac_mu(self.{}, {})",
            self.voltages_var,
            ChannelSet::channel_list(&self.set.channels)
        ));
        if self.set.is_sweeping() {
            let mut body = PythonGenerator::new();
            body.add_line(format!("delay_mu(self.{})", self.step_time_var));
            body.add_line(format!(
                "self.{device}.set_dac_mu(self.{}[i], {})",
                self.sweep_var,
                ChannelSet::channel_list(&self.set.sweep_channels)
            ));
            code.add_block(format!("for i in range({})", self.step_count), body);
        }
    }

    pub(super) fn time_cursor_shift(&self) -> Seconds {
        if self.set.is_sweeping() {
            self.step_time * self.step_count as f64
        } else {
            0.0
        }
    }
}

/// Voltages for several Fastino channels, updated one channel at a time.
#[derive(Debug, Clone)]
pub struct FastinoEvent {
    set: ChannelSet,
    step_count: usize,
    step_time: Seconds,
    voltages_var: String,
    sweep_var: String,
    step_time_var: String,
    single_time_var: String,
}

impl FastinoEvent {
    pub fn new(
        arena: &mut DeviceArena,
        device: DeviceId,
        channels: &IndexMap<u32, CompiledDac>,
        duration: Seconds,
        location: &Location,
    ) -> Result<Self> {
        let (set, step_count) = ChannelSet::new(
            channels,
            |swept| {
                DacFamily::Fastino {
                    parallel_channels: swept.max(1),
                }
                .step_count(duration)
            },
            location,
        )?;
        let settle = FASTINO_CHANNEL_TIME * set.channels.len() as f64;
        Ok(FastinoEvent {
            step_time: (duration - settle) / step_count as f64,
            set,
            step_count,
            voltages_var: arena.variable_name(device, "voltages"),
            sweep_var: arena.variable_name(device, "sweep_voltages"),
            step_time_var: arena.variable_name(device, "step_time"),
            single_time_var: arena.variable_name(device, "single_time"),
        })
    }

    /// Delay between two swept channel updates within one step.
    fn rotate_time(&self) -> Seconds {
        self.step_time / self.set.sweep_channels.len() as f64
    }

    pub(super) fn prepare_code(&self, device: &str, code: &mut PythonGenerator) {
        self.set.prepare_voltages(device, &self.voltages_var, code);
        code.add_assignment(&self.single_time_var, seconds_to_mu(FASTINO_CHANNEL_TIME));
        if self.set.is_sweeping() {
            self.set.prepare_sweep(device, &self.sweep_var, code);
            code.add_assignment(&self.step_time_var, seconds_to_mu(self.rotate_time()));
        }
    }

    pub(super) fn run_code(&self, device: &str, code: &mut PythonGenerator) {
        for (i, channel) in self.set.channels.iter().enumerate() {
            code.add_line(format!(
                "self.{device}.set_dac_mu({channel}, self.{}[{i}])",
                self.voltages_var
            ));
            code.add_line(format!("delay_mu(self.{})", self.single_time_var));
        }
        if self.set.is_sweeping() {
            let mut body = PythonGenerator::new();
            for (k, channel) in self.set.sweep_channels.iter().enumerate() {
                body.add_line(format!("delay_mu(self.{})", self.step_time_var));
                body.add_line(format!(
                    "self.{device}.set_dac_mu({channel}, self.{}[i][{k}])",
                    self.sweep_var
                ));
            }
            code.add_block(format!("for i in range({})", self.step_count), body);
        }
    }

    pub(super) fn time_cursor_shift(&self) -> Seconds {
        let settle = FASTINO_CHANNEL_TIME * self.set.channels.len() as f64;
        if self.set.is_sweeping() {
            settle + self.step_time * self.step_count as f64
        } else {
            settle
        }
    }
}

/// Output of a single CurrentDriver channel, optionally swept.
#[derive(Debug, Clone)]
pub struct CurrentDriverEvent {
    voltage: f64,
    sweep: Option<Vec<f64>>,
    step_count: usize,
    step_time: Seconds,
    voltage_var: String,
    sweep_var: String,
    step_time_var: String,
}

impl CurrentDriverEvent {
    pub fn new(
        arena: &mut DeviceArena,
        device: DeviceId,
        dac: &CompiledDac,
        duration: Seconds,
        location: &Location,
    ) -> Result<Self> {
        let step_count = DacFamily::CurrentDriver.step_count(duration);
        let mut step_time = duration / step_count as f64 - CURRENT_DRIVER_WRITE_TIME;
        if step_time < -1e-9 {
            return Err(Error::authoring(
                location,
                "CurrentDriver step time too small, you may need to increase the duration",
            ));
        }
        if step_time < 0.0 {
            warn!("CurrentDriver step time {} s clamped to zero", step_time);
            step_time = 0.0;
        }
        let sweep = dac
            .sweep_voltage
            .map(|target| {
                sweep_voltages(&dac.formula_text, step_count, dac.voltage, target, location)
            })
            .transpose()?;
        Ok(CurrentDriverEvent {
            voltage: dac.voltage,
            sweep,
            step_count,
            step_time,
            voltage_var: arena.variable_name(device, "voltage"),
            sweep_var: arena.variable_name(device, "sweep_voltage"),
            step_time_var: arena.variable_name(device, "step_time"),
        })
    }

    pub(super) fn prepare_code(&self, device: &str, code: &mut PythonGenerator) {
        let handler = current_driver_handler(device);
        match &self.sweep {
            Some(voltages) => {
                code.add_assignment(
                    &self.sweep_var,
                    format!(
                        "[self.{handler}.voltage_to_mu(voltage) for voltage in {}]",
                        PyValue::float_list(voltages)
                    ),
                );
                code.add_assignment(&self.step_time_var, seconds_to_mu(self.step_time));
            }
            None => code.add_assignment(
                &self.voltage_var,
                format!("self.{handler}.voltage_to_mu({})", float_repr(self.voltage)),
            ),
        }
    }

    pub(super) fn run_code(&self, device: &str, code: &mut PythonGenerator) {
        let handler = current_driver_handler(device);
        if self.sweep.is_some() {
            let mut body = PythonGenerator::new();
            body.add_line(format!("self.{handler}.set_voltage_mu(self.{}[i])", self.sweep_var));
            body.add_line(format!("delay_mu(self.{})", self.step_time_var));
            code.add_block(format!("for i in range({})", self.step_count), body);
        } else {
            code.add_line(format!("self.{handler}.set_voltage_mu(self.{})", self.voltage_var));
        }
    }

    pub(super) fn time_cursor_shift(&self) -> Seconds {
        if self.sweep.is_some() {
            self.step_time * self.step_count as f64
        } else {
            0.0
        }
    }
}
