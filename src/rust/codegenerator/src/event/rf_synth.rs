// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! ADF5356 events on Mirny boards, optionally through an Almazny mezzanine.

use sequence_compiler::compiled::CompiledRfSynth;
use sequence_units::float_repr;

use crate::Result;
use crate::device::{DeviceArena, DeviceId, DeviceKind};
use crate::hardware_util::mirny_attenuation_mu;
use crate::python::{PyValue, PythonGenerator};

/// The Almazny doubles the frequency twice after the synthesizer.
const ALMAZNY_FREQUENCY_FACTOR: f64 = 0.25;

#[derive(Debug, Clone)]
pub struct MirnyEvent {
    freq: Option<f64>,
    attenuation: Option<f64>,
    switch: Option<bool>,
    almazny: Option<DeviceId>,
}

impl MirnyEvent {
    pub fn new(
        arena: &mut DeviceArena,
        device: DeviceId,
        rf: &CompiledRfSynth,
        almazny: Option<DeviceId>,
    ) -> Result<Self> {
        if rf.skip_init {
            let cpld = arena.mirny_mut(device)?.cpld;
            if let DeviceKind::MirnyCpld { skip_init } = &mut arena.get_mut(cpld).kind {
                *skip_init = true;
            }
        }
        Ok(MirnyEvent {
            freq: rf.freq,
            attenuation: rf.attenuation,
            switch: rf.switch,
            almazny: almazny.filter(|_| rf.use_almazny),
        })
    }

    pub(super) fn run_code(
        &self,
        arena: &mut DeviceArena,
        device_id: DeviceId,
        code: &mut PythonGenerator,
    ) -> Result<()> {
        let device = arena.get(device_id).name.clone();
        match self.almazny {
            None => {
                if let Some(attenuation) = self.attenuation {
                    code.add_line(format!(
                        "self.{device}.set_att_mu({}) # machine unit for {} dB",
                        mirny_attenuation_mu(attenuation),
                        float_repr(attenuation)
                    ));
                }
                if let Some(freq) = self.freq {
                    code.add_line(format!("self.{device}.set_frequency({})", float_repr(freq)));
                }
                let channel = arena.mirny_mut(device_id)?;
                match self.switch {
                    Some(switch) if channel.enabled != Some(switch) => {
                        channel.enabled = Some(switch);
                        let action = if switch { "on" } else { "off" };
                        code.add_line(format!("self.{device}.sw.{action}()"));
                    }
                    _ => {}
                }
            }
            Some(almazny) => {
                let almazny = &arena.get(almazny).name;
                if let Some(freq) = self.freq {
                    code.add_line(format!(
                        "self.{device}.set_frequency({})",
                        float_repr(ALMAZNY_FREQUENCY_FACTOR * freq)
                    ));
                }
                if let Some(attenuation) = self.attenuation {
                    let channel = match &arena.get(device_id).kind {
                        DeviceKind::Mirny(channel) => channel.channel.clone(),
                        _ => String::new(),
                    };
                    code.add_line(format!(
                        "self.{almazny}.set_att({channel}, {}, {})",
                        float_repr(attenuation),
                        PyValue::Bool(self.switch.unwrap_or(false))
                    ));
                    code.add_line(format!("self.{almazny}.output_toggle(True)"));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MirnyChannel;
    use sequence_compiler::Location;

    fn mirny() -> (DeviceArena, DeviceId, DeviceId, DeviceId) {
        let mut arena = DeviceArena::new("rpc");
        let location = Location::default();
        let cpld = arena
            .get_or_insert_with("mirny0_cpld", &location, |_| {
                Ok(DeviceKind::MirnyCpld { skip_init: false })
            })
            .unwrap();
        let mirny = arena
            .get_or_insert_with("mirny0_ch2", &location, |_| {
                Ok(DeviceKind::Mirny(MirnyChannel {
                    channel: "2".to_string(),
                    cpld,
                    enabled: None,
                }))
            })
            .unwrap();
        let almazny = arena
            .get_or_insert_with("mirny0_almazny", &location, |_| Ok(DeviceKind::Almazny))
            .unwrap();
        (arena, mirny, cpld, almazny)
    }

    fn rf(switch: Option<bool>, use_almazny: bool) -> CompiledRfSynth {
        CompiledRfSynth {
            freq: Some(3e9),
            attenuation: Some(10.0),
            switch,
            skip_init: false,
            use_almazny,
        }
    }

    fn run(event: &MirnyEvent, arena: &mut DeviceArena, device: DeviceId) -> String {
        let mut code = PythonGenerator::new();
        event.run_code(arena, device, &mut code).unwrap();
        code.generate_python()
    }

    #[test]
    fn test_switch_written_on_change_only() {
        let (mut arena, mirny, _, _) = mirny();
        let on = MirnyEvent::new(&mut arena, mirny, &rf(Some(true), false), None).unwrap();
        assert_eq!(
            run(&on, &mut arena, mirny),
            "self.mirny0_ch2.set_att_mu(175) # machine unit for 10.0 dB\n\
             self.mirny0_ch2.set_frequency(3000000000.0)\n\
             self.mirny0_ch2.sw.on()\n"
        );
        assert!(!run(&on, &mut arena, mirny).contains("sw.on()"));

        arena.reset_run_state();
        assert!(run(&on, &mut arena, mirny).contains("sw.on()"));
    }

    #[test]
    fn test_almazny() {
        let (mut arena, mirny, _, almazny) = mirny();
        let event =
            MirnyEvent::new(&mut arena, mirny, &rf(Some(true), true), Some(almazny)).unwrap();
        assert_eq!(
            run(&event, &mut arena, mirny),
            "self.mirny0_ch2.set_frequency(750000000.0)\n\
             self.mirny0_almazny.set_att(2, 10.0, True)\n\
             self.mirny0_almazny.output_toggle(True)\n"
        );
    }

    #[test]
    fn test_skip_init_marks_cpld() {
        let (mut arena, mirny, cpld, _) = mirny();
        let mut skipped = rf(None, false);
        skipped.skip_init = true;
        MirnyEvent::new(&mut arena, mirny, &skipped, None).unwrap();
        assert!(matches!(
            arena.get(cpld).kind,
            DeviceKind::MirnyCpld { skip_init: true }
        ));
    }
}
