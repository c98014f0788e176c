// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! AD9910 events on Urukul boards.
//!
//! A channel is left either in single tone, digital ramp or RAM playback
//! mode. The run code tracks that mode on the device while it is emitted, so
//! every event only resets the control registers the previous event changed.

use sequence_compiler::compiled::{CompiledDds, DdsMode, DdsTone, RamProfile};
use sequence_compiler::port_state::RamDestination;
use sequence_compiler::{Location, Seconds};
use sequence_units::float_repr;

use crate::device::{DdsRegisterState, DeviceArena, DeviceId, DeviceKind, SweepDirection};
use crate::hardware_util::{
    RampRegisters, amplitude_ramp, frequency_ramp, ram_samples, sweep_direction,
};
use crate::python::{PyValue, PythonGenerator};
use crate::{Error, Result};

/// Kernel helper streaming a RAM table to an AD9910 over SPI.
pub const WRITE_RAM_FUNCTION: &str = "@kernel
def write_ram(self, device, data):
    device.bus.set_config_mu(urukul.SPI_CONFIG, 8, urukul.SPIT_DDS_WR, device.chip_select)
    device.bus.write(_AD9910_REG_RAM << 24)
    device.bus.set_config_mu(urukul.SPI_CONFIG, 32, urukul.SPIT_DDS_WR, device.chip_select)
    for i in range(len(data) - 1):
        device.bus.write(data[i])
    device.bus.set_config_mu(urukul.SPI_CONFIG | spi.SPI_END, 32, urukul.SPIT_DDS_WR, device.chip_select)
    device.bus.write(data[len(data) - 1])";

/// Settling delay before the digital ramp is reprogrammed.
const SWEEP_SETUP_DELAY: Seconds = 10e-6;

#[derive(Debug, Clone)]
struct ToneVariables {
    tone: DdsTone,
    amp: String,
    freq: String,
    phase: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum SweepTarget {
    Frequency,
    Amplitude,
}

#[derive(Debug, Clone)]
enum UrukulMode {
    SingleTone,
    Sweep {
        target: SweepTarget,
        direction: SweepDirection,
        registers: RampRegisters,
    },
    RamWrite {
        profile: RamProfile,
        data_var: String,
        /// Source values per destination, `(phase, amplitude)` for POWASF.
        samples: Vec<Vec<f64>>,
    },
    RamExecute {
        profile: u32,
    },
}

#[derive(Debug, Clone)]
pub struct UrukulEvent {
    switch: Option<bool>,
    attenuation: Option<f64>,
    tone: Option<ToneVariables>,
    mode: UrukulMode,
}

fn clamp_amplitudes(values: Vec<f64>) -> Vec<f64> {
    values.into_iter().map(|value| value.clamp(0.0, 1.0)).collect()
}

impl UrukulEvent {
    pub fn new(
        arena: &mut DeviceArena,
        device: DeviceId,
        dds: &CompiledDds,
        duration: Seconds,
        location: &Location,
    ) -> Result<Self> {
        let sweeping = matches!(dds.mode, DdsMode::SweepFreq { .. } | DdsMode::SweepAmp { .. });
        let tone = dds.tone.map(|tone| ToneVariables {
            tone,
            amp: arena.variable_name(device, "amp"),
            freq: arena.variable_name(device, "freq"),
            phase: (!sweeping).then(|| arena.variable_name(device, "phase")),
        });
        let mode = match &dds.mode {
            DdsMode::Normal => UrukulMode::SingleTone,
            DdsMode::SweepFreq {
                sweep_freq,
                sweep_duration,
            } => {
                let tone = sweep_tone(dds, location)?;
                // Allocated for both sweep kinds.
                arena.variable_name(device, "sweep_freq");
                let direction = sweep_direction(tone.freq, *sweep_freq);
                UrukulMode::Sweep {
                    target: SweepTarget::Frequency,
                    direction,
                    registers: frequency_ramp(
                        tone.freq,
                        *sweep_freq,
                        sweep_duration.unwrap_or(duration),
                        direction,
                    ),
                }
            }
            DdsMode::SweepAmp {
                sweep_amp,
                sweep_duration,
            } => {
                let tone = sweep_tone(dds, location)?;
                arena.variable_name(device, "sweep_freq");
                let direction = sweep_direction(tone.amp, *sweep_amp);
                UrukulMode::Sweep {
                    target: SweepTarget::Amplitude,
                    direction,
                    registers: amplitude_ramp(
                        tone.amp,
                        *sweep_amp,
                        sweep_duration.unwrap_or(duration),
                        direction,
                    ),
                }
            }
            DdsMode::RamWrite(profile) => {
                if tone.is_none() {
                    return Err(Error::Internal(
                        "RAM profile written without a frequency".to_string(),
                    ));
                }
                let count = profile.step_count();
                let samples = match profile.destination {
                    RamDestination::Asf => vec![clamp_amplitudes(ram_samples(
                        &profile.amplitude_formula,
                        count,
                        location,
                    )?)],
                    RamDestination::Pow => {
                        vec![ram_samples(&profile.phase_formula, count, location)?]
                    }
                    RamDestination::Ftw => {
                        vec![ram_samples(&profile.frequency_formula, count, location)?]
                    }
                    RamDestination::PowAsf => vec![
                        ram_samples(&profile.phase_formula, count, location)?,
                        clamp_amplitudes(ram_samples(&profile.amplitude_formula, count, location)?),
                    ],
                };
                arena.get_mut(device).functions.insert(WRITE_RAM_FUNCTION.to_string());
                UrukulMode::RamWrite {
                    profile: profile.clone(),
                    data_var: arena.variable_name(device, "ramdata"),
                    samples,
                }
            }
            DdsMode::RamExecute { ram_profile } => {
                arena.variable_name(device, "ramdata");
                UrukulMode::RamExecute {
                    profile: *ram_profile,
                }
            }
        };

        if tone.is_some() {
            let cpld = arena.urukul_mut(device)?.cpld;
            arena.urukul_mut(device)?.need_init = true;
            if let DeviceKind::UrukulCpld { need_init, .. } = &mut arena.get_mut(cpld).kind {
                *need_init = true;
            }
        }
        if dds.attenuation.is_some() {
            let cpld = arena.urukul(device)?.cpld;
            if let DeviceKind::UrukulCpld { need_get_att, .. } = &mut arena.get_mut(cpld).kind {
                *need_get_att = true;
            }
        }

        Ok(UrukulEvent {
            switch: dds.switch,
            attenuation: dds.attenuation,
            tone,
            mode,
        })
    }

    pub fn is_ram_write(&self) -> bool {
        matches!(self.mode, UrukulMode::RamWrite { .. })
    }

    pub(super) fn prepare_code(&self, device: &str, code: &mut PythonGenerator) {
        if let UrukulMode::RamExecute { .. } = self.mode {
            return;
        }
        if let Some(vars) = &self.tone {
            code.add_assignment(
                &vars.freq,
                format!("self.{device}.frequency_to_ftw({})", float_repr(vars.tone.freq)),
            );
            code.add_assignment(
                &vars.amp,
                format!("self.{device}.amplitude_to_asf({})", float_repr(vars.tone.amp)),
            );
            if let Some(phase) = &vars.phase {
                code.add_assignment(
                    phase,
                    format!("self.{device}.turns_to_pow({})", float_repr(vars.tone.phase)),
                );
            }
        }
        if let UrukulMode::RamWrite {
            profile,
            data_var,
            samples,
        } = &self.mode
        {
            code.add_assignment(
                data_var,
                format!(
                    "np.array(np.zeros({}), dtype=np.int32)",
                    profile.step_count()
                ),
            );
            let conversion = match profile.destination {
                RamDestination::Asf => "amplitude_to_ram",
                RamDestination::Pow => "turns_to_ram",
                RamDestination::Ftw => "frequency_to_ram",
                RamDestination::PowAsf => "turns_amplitude_to_ram",
            };
            let mut arguments: Vec<String> = samples
                .iter()
                .map(|values| PyValue::float_list(values).to_string())
                .collect();
            arguments.push(format!("self.{data_var}"));
            code.add_device_call(device, conversion, &arguments);
        }
    }

    fn attenuation_code(&self, device: &str, code: &mut PythonGenerator) {
        if let Some(attenuation) = self.attenuation {
            code.add_line(format!("self.{device}.set_att({}*dB)", float_repr(attenuation)));
        }
    }

    fn switch_code(&self, device: &str, code: &mut PythonGenerator) {
        if let Some(switch) = self.switch {
            code.add_line(format!("self.{device}.sw.{}()", if switch { "on" } else { "off" }));
        }
    }

    /// Unmask the channel's profile pins on the CPLD.
    fn mask_nu_code(device: &str, channel: u32, code: &mut PythonGenerator) {
        code.add_line(format!("cpld = self.{device}.cpld"));
        code.add_line(format!(
            "cpld.cfg_write((cpld.cfg_reg | (15 << urukul.CFG_MASK_NU)) & ~(1 << urukul.CFG_MASK_NU + {channel}))"
        ));
    }

    fn set_mu_code(vars: &ToneVariables, device: &str, code: &mut PythonGenerator) {
        match &vars.phase {
            Some(phase) => code.add_line(format!(
                "self.{device}.set_mu(self.{}, pow_=self.{phase}, asf=self.{})",
                vars.freq, vars.amp
            )),
            None => code.add_line(format!(
                "self.{device}.set_mu(self.{}, asf=self.{})",
                vars.freq, vars.amp
            )),
        }
    }

    pub(super) fn run_code(
        &self,
        arena: &mut DeviceArena,
        device_id: DeviceId,
        code: &mut PythonGenerator,
    ) -> Result<()> {
        let device = arena.get(device_id).name.clone();
        let channel = arena.urukul(device_id)?.clone();
        let cpld = arena.get(channel.cpld).name.clone();
        let mut state = channel.state;
        let mut last_sweep_dir = channel.last_sweep_dir;

        self.attenuation_code(&device, code);
        match &self.mode {
            UrukulMode::SingleTone => {
                if let Some(vars) = &self.tone {
                    Self::mask_nu_code(&device, channel.channel, code);
                    match state {
                        DdsRegisterState::Sweep => {
                            code.add_line(format!("self.{device}.set_cfr2()"));
                        }
                        DdsRegisterState::Ram => {
                            code.add_line(format!("self.{device}.set_cfr1()"));
                        }
                        DdsRegisterState::Normal => {}
                    }
                    state = DdsRegisterState::Normal;
                    Self::set_mu_code(vars, &device, code);
                }
                self.switch_code(&device, code);
            }
            UrukulMode::Sweep {
                target,
                direction,
                registers,
            } => {
                if let Some(vars) = &self.tone {
                    Self::mask_nu_code(&device, channel.channel, code);
                    if state == DdsRegisterState::Ram {
                        code.add_line(format!("self.{device}.set_cfr1()"));
                    }
                    Self::set_mu_code(vars, &device, code);
                }
                if *direction == last_sweep_dir {
                    // Clear the ramp accumulator before ramping the same way again.
                    code.add_line(format!(
                        "self.{device}.write32(ad9910._AD9910_REG_CFR1,1 << 12)"
                    ));
                    code.add_line(format!("self.{device}.cpld.io_update.pulse_mu(8)"));
                    code.add_line(format!("self.{device}.set_cfr1()"));
                    code.add_line(format!("self.{device}.set_cfr2()"));
                    code.add_line(format!("self.{device}.cpld.io_update.pulse_mu(8)"));
                }
                code.add_line("delay(10*us)");
                match target {
                    SweepTarget::Frequency => code.add_line(format!(
                        "self.{device}.write32(ad9910._AD9910_REG_CFR2,0x01010000|(0<<20)|(1<<19)|(3<<17)|(1<<7))"
                    )),
                    SweepTarget::Amplitude => code.add_line(format!(
                        "self.{device}.write32(ad9910._AD9910_REG_CFR2,(1<<21)|(1 << 19)|(3<<17)|(1<<7))"
                    )),
                }
                code.add_line(format!(
                    "self.{device}.write64(ad9910._AD9910_REG_RAMP_LIMIT, {}, {})",
                    registers.upper_limit, registers.lower_limit
                ));
                code.add_line(format!(
                    "self.{device}.write32(ad9910._AD9910_REG_RAMP_RATE, {})",
                    registers.ramp_rate
                ));
                code.add_line(format!(
                    "self.{device}.write64(ad9910._AD9910_REG_RAMP_STEP, {}, {})",
                    registers.decrement_step, registers.increment_step
                ));
                code.add_line(format!("self.{device}.cpld.io_update.pulse_mu(8)"));
                if *direction == SweepDirection::Down {
                    code.add_line(format!(
                        "self.{device}.write64(ad9910._AD9910_REG_RAMP_STEP, {}, 0)",
                        registers.decrement_step
                    ));
                    code.add_line(format!("self.{device}.cpld.io_update.pulse_mu(8)"));
                }
                last_sweep_dir = *direction;
                state = DdsRegisterState::Sweep;
                self.switch_code(&device, code);
            }
            UrukulMode::RamWrite {
                profile, data_var, ..
            } => {
                self.switch_code(&device, code);
                Self::mask_nu_code(&device, channel.channel, code);
                if state == DdsRegisterState::Sweep {
                    code.add_line(format!("self.{device}.set_cfr2()"));
                }
                let freq = self
                    .tone
                    .as_ref()
                    .map(|vars| vars.freq.as_str())
                    .ok_or_else(|| {
                        Error::Internal("RAM profile written without a frequency".to_string())
                    })?;
                code.add_line(format!("self.{cpld}.set_profile({})", profile.profile));
                code.add_line(format!("self.{device}.set_ftw(self.{freq})"));
                code.add_line(format!("self.{device}.set_cfr1()"));
                code.add_line(format!("self.{cpld}.io_update.pulse_mu(8)"));
                code.add_line(format!(
                    "self.{device}.set_profile_ram(start={}, end={}, step={}, profile={}, mode={})",
                    profile.start,
                    profile.end,
                    profile.step_size,
                    profile.profile,
                    profile.mode.as_str()
                ));
                code.add_line(format!("self.{cpld}.io_update.pulse_mu(8)"));
                code.add_line(format!("self.write_ram(self.{device}, self.{data_var})"));
                code.add_line(format!(
                    "self.{device}.set_cfr1(ram_enable=1, ram_destination={}, phase_autoclear=1)",
                    profile.destination.as_str()
                ));
                state = DdsRegisterState::Ram;
            }
            UrukulMode::RamExecute { profile } => {
                self.switch_code(&device, code);
                Self::mask_nu_code(&device, channel.channel, code);
                if state == DdsRegisterState::Sweep {
                    code.add_line(format!("self.{device}.set_cfr2()"));
                }
                code.add_line(format!("self.{cpld}.set_profile({profile})"));
                code.add_line(format!("self.{cpld}.io_update.pulse_mu(8)"));
                state = DdsRegisterState::Ram;
            }
        }

        let channel = arena.urukul_mut(device_id)?;
        channel.state = state;
        channel.last_sweep_dir = last_sweep_dir;
        Ok(())
    }

    pub(super) fn time_cursor_shift(&self) -> Seconds {
        match self.mode {
            UrukulMode::Sweep { .. } => SWEEP_SETUP_DELAY,
            _ => 0.0,
        }
    }
}

/// The tone a sweep starts from.
fn sweep_tone(dds: &CompiledDds, location: &Location) -> Result<DdsTone> {
    dds.tone.ok_or_else(|| {
        Error::authoring(location, "A DDS sweep needs a start frequency and amplitude")
    })
}
