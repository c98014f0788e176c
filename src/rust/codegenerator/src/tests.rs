// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Sequences compiled all the way to experiment source.

use serde_json::json;
use sequence_compiler::build_id::BuildId;
use sequence_compiler::labsetup::{LabSetup, Module, Port};
use sequence_compiler::model::{Segment, Sequence};
use sequence_compiler::store::SequenceStore;
use sequence_compiler::{CompileContext, ErrorKind};
use sequence_units::{FieldValue, NoSubstitution, Unit};

use crate::{CodeGeneratorSettings, CodeHook, Error, GeneratedCode, compile_code};

const BUILD_ID: u64 = 20250101120000000;

fn ms(value: f64) -> FieldValue {
    FieldValue::with_unit(value.to_string(), Unit::new("ms", 1e-3))
}

fn mv(value: f64) -> serde_json::Value {
    json!({"text": value.to_string(), "unit": {"text": "mV", "factor": 0.001}})
}

fn lab_setup() -> LabSetup {
    let mut lab_setup = LabSetup::default();
    lab_setup.add_port("led", Port::new(Module::Ttl, "ttl4", None::<String>));
    lab_setup.add_port("trigger", Port::new(Module::Ttl, "ttl0", None::<String>));
    lab_setup.add_port("coil_x", Port::new(Module::Zotino, "zotino0", Some("1")));
    lab_setup.add_port("coil_y", Port::new(Module::Zotino, "zotino0", Some("2")));
    lab_setup.add_port("pd", Port::new(Module::Sampler, "sampler0", None::<String>));
    lab_setup.add_port("aom", Port::new(Module::Ad9910, "urukul0_ch0", None::<String>));
    lab_setup.device_db = serde_json::from_value(json!({
        "urukul0_cpld": {
            "type": "local",
            "module": "artiq.coredevice.urukul",
            "class": "CPLD",
            "arguments": {}
        },
        "urukul0_ch0": {
            "type": "local",
            "module": "artiq.coredevice.ad9910",
            "class": "AD9910",
            "arguments": {"cpld_device": "urukul0_cpld", "chip_select": 4}
        }
    }))
    .unwrap();
    lab_setup
}

fn single_segment(segment: Segment) -> SequenceStore {
    let mut store = SequenceStore::default();
    store.insert("main", Sequence::default().with_segment("s0", segment));
    store
}

fn led(state: bool) -> Segment {
    Segment::port_state(ms(1.0)).with_port("led", json!({"state": state}))
}

fn generate(
    store: &SequenceStore,
    settings: CodeGeneratorSettings,
) -> crate::Result<GeneratedCode> {
    let lab_setup = lab_setup();
    let ctx = CompileContext::new(store, &lab_setup, &NoSubstitution);
    compile_code(&ctx, "main", BuildId::from(BUILD_ID), settings, &[])
}

#[test]
fn test_led_on_for_ten_milliseconds() {
    let store =
        single_segment(Segment::port_state(ms(10.0)).with_port("led", json!({"state": true})));
    let generated = generate(&store, CodeGeneratorSettings::default()).unwrap();
    assert_eq!(generated.build_id.value(), BUILD_ID);
    assert!((generated.duration - 10e-3).abs() < 1e-12);

    let source = &generated.source;
    assert!(source.starts_with("from artiq.experiment import *\n"));
    assert!(source.contains("\nclass main(EnvExperiment):\n"));
    assert!(source.contains("        self.setattr_device(\"ttl4\")\n"));
    assert!(source.contains(&format!("        if self.codeID != {BUILD_ID}:\n")));
    assert!(source.contains("        self.timestamp_0 = self.core.seconds_to_mu(0.0)\n"));
    assert!(source.contains(
        "        at_mu(start_mu + self.timestamp_0)\n        self.ttl4.on()\n        at_mu(start_mu + self.timestamp_1)\n"
    ));
    assert!(source.contains("    @kernel\n    def init(self):\n"));
    assert!(source.contains("        self.ttl4.output()\n"));
    assert!(source.contains(&format!(
        "        self.sequence_gui_rpc.sequenceFinished(\"{BUILD_ID}\", \"main\")\n"
    )));
    assert!(source.contains("    def analyze(self):\n        pass\n"));
}

#[test]
fn test_zotino_sweep() {
    let store = single_segment(Segment::port_state(ms(100.0)).with_port(
        "coil_x",
        json!({"voltage": mv(0.0), "sweep_enable": true, "sweep_voltage": mv(1000.0)}),
    ));
    let source = generate(&store, CodeGeneratorSettings::default()).unwrap().source;
    // 100 ms at the Zotino's 32 us minimum step time, capped.
    assert!(source.contains("        for i in range(1024):\n"));
    assert!(source.contains("self.zotino0.set_dac_mu(self.zotino0_sweep_voltages_0[i], [1])"));
    assert!(source.contains("        self.zotino0.init()\n"));

    // The table runs from the held voltage to the sweep target, in volts.
    let table = source
        .lines()
        .map(str::trim)
        .find(|line| line.starts_with("self.zotino0_sweep_voltages_0 = "))
        .unwrap();
    let literal = table.rsplit_once(" for step in ").unwrap().1;
    let literal = literal.strip_suffix(']').unwrap();
    assert!(literal.starts_with("[[0.0]"));
    assert!(literal.ends_with("[1.0]]"));
}

#[test]
fn test_zotino_channels_share_one_update() {
    let store = single_segment(
        Segment::port_state(ms(1.0))
            .with_port("coil_x", json!({"voltage": mv(100.0)}))
            .with_port("led", json!({"state": true}))
            .with_port("coil_y", json!({"voltage": mv(200.0)})),
    );
    let source = generate(&store, CodeGeneratorSettings::default()).unwrap().source;
    assert_eq!(source.matches("self.zotino0.set_dac_mu(").count(), 1);
    assert!(source.contains(
        "self.ttl4.on()\n        self.zotino0.set_dac_mu(self.zotino0_voltages_0, [1, 2])\n"
    ));
}

#[test]
fn test_ram_profile() {
    let store = single_segment(Segment::port_state(ms(1.0)).with_port(
        "aom",
        json!({
            "mode": "Write RAM Profile",
            "ram_destination": "RAM_DEST_ASF",
            "ram_amplitude_formula": "2*x"
        }),
    ));
    let source = generate(&store, CodeGeneratorSettings::default()).unwrap().source;
    assert!(
        source.contains("self.urukul0_ch0_ramdata_0 = np.array(np.zeros(1024), dtype=np.int32)")
    );
    // Amplitudes past full scale are clamped.
    assert!(source.contains(", 1.0], self.urukul0_ch0_ramdata_0)"));
    assert!(!source.contains("1.5"));
    assert_eq!(source.matches("    def write_ram(self, device, data):\n").count(), 1);
    assert!(source.contains("self.write_ram(self.urukul0_ch0, self.urukul0_ch0_ramdata_0)"));
    assert!(source.contains(
        "self.urukul0_ch0.set_cfr1(ram_enable=1, ram_destination=RAM_DEST_ASF, phase_autoclear=1)"
    ));

    // The CPLD is declared right after its channel and initialized first.
    assert!(source.contains(
        "        self.setattr_device(\"urukul0_ch0\")\n        self.setattr_device(\"urukul0_cpld\")\n"
    ));
    let cpld_init = source.find("self.urukul0_cpld.init()").unwrap();
    let channel_init = source.find("self.urukul0_ch0.init()").unwrap();
    assert!(cpld_init < channel_init);
}

#[test]
fn test_trigger_wait() {
    let mut store = SequenceStore::default();
    store.insert(
        "main",
        Sequence::default()
            .with_segment("on", led(true))
            .with_segment("wait", Segment::trigger_wait(ms(5.0), "trigger")),
    );
    let source = generate(&store, CodeGeneratorSettings::default()).unwrap().source;
    assert!(source.contains("        self.ttl0.input()\n"));
    assert!(source.contains(
        "        ttl0_tEnd_0 = self.ttl0.gate_rising_mu(self.ttl0_trigger_duration_0)\n"
    ));
    assert!(source.contains("            start_mu -= (ttl0_tEnd_0 - ttl0_tEdge_0)\n"));
}

#[test]
fn test_sampler_analyze() {
    let store = single_segment(Segment::port_state(ms(1.0)).with_port("pd", json!({})));
    let source = generate(&store, CodeGeneratorSettings::default()).unwrap().source;
    assert!(source.contains("        self.dsampler0_0 = np.full((10,8),0,dtype=float)\n"));
    assert!(source.contains("        self.set_dataset(\"dsampler0_0_samplerate\", 10000.000)\n"));
}

#[test]
fn test_relative_timestamps() {
    let mut store = SequenceStore::default();
    store.insert(
        "blink",
        Sequence::default()
            .with_segment("on", led(true))
            .with_segment("off", led(false)),
    );
    store.insert(
        "main",
        Sequence::default().with_segment("loop", Segment::subsequence("blink", "4".into())),
    );
    let settings = CodeGeneratorSettings {
        relative_timestamps: true,
        ..Default::default()
    };
    let source = generate(&store, settings).unwrap().source;
    assert!(!source.contains("at_mu("));
    assert!(source.contains(
        "        for i0 in range(4):\n            self.ttl4.on()\n            delay_mu(self.delay_blink_0)\n"
    ));
    assert!(source.contains("        self.delay_blink_1 = self.core.seconds_to_mu(0.001)\n"));
}

#[test]
fn test_slot_names_of_nested_groups_are_distinct() {
    let mut store = SequenceStore::default();
    let mut long = Sequence::default();
    for i in 0..11 {
        long = long.with_segment(format!("s{i}"), led(i % 2 == 0));
    }
    store.insert("a", long);
    store.insert("a1", Sequence::default().with_segment("s0", led(false)));
    store.insert(
        "main",
        Sequence::default()
            .with_segment("first", Segment::subsequence("a", "1".into()))
            .with_segment("second", Segment::subsequence("a1", "1".into())),
    );
    let source = generate(&store, CodeGeneratorSettings::default()).unwrap().source;
    assert_eq!(source.matches("self.timestamp_a_10 = ").count(), 1);
    assert_eq!(source.matches("self.timestamp_a1_0 = ").count(), 1);
    assert!(source.contains(" + self.timestamp_a_10)\n"));
    assert!(source.contains(" + self.timestamp_a1_0)\n"));
    assert!(!source.contains("timestamp_a10"));

    let settings = CodeGeneratorSettings {
        relative_timestamps: true,
        ..Default::default()
    };
    let source = generate(&store, settings).unwrap().source;
    assert_eq!(source.matches("self.delay_a_10 = ").count(), 1);
    assert_eq!(source.matches("self.delay_a1_0 = ").count(), 1);
    assert!(!source.contains("delay_a10"));
}

#[test]
fn test_negative_delay() {
    let microsecond = FieldValue::with_unit("1", Unit::new("us", 1e-6));
    let store = single_segment(
        Segment::port_state(microsecond).with_port("aom", json!({"mode": "Sweep frequency"})),
    );
    let settings = CodeGeneratorSettings {
        relative_timestamps: true,
        ..Default::default()
    };
    let err = generate(&store, settings).unwrap_err();
    assert!(matches!(err, Error::NegativeDelay { .. }));
    assert_eq!(err.kind(), ErrorKind::Authoring);

    // Absolute timestamps do not budget the sweep setup.
    assert!(generate(&store, CodeGeneratorSettings::default()).is_ok());
}

#[test]
fn test_cycle_is_authoring_error() {
    let mut store = SequenceStore::default();
    store.insert(
        "main",
        Sequence::default().with_segment("again", Segment::subsequence("main", "1".into())),
    );
    let err = generate(&store, CodeGeneratorSettings::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Authoring);
}

#[test]
fn test_generation_is_deterministic() {
    let store = single_segment(
        Segment::port_state(ms(2.0))
            .with_port("coil_y", json!({"voltage": mv(100.0)}))
            .with_port("aom", json!({"mode": "Sweep amplitude"}))
            .with_port(
                "coil_x",
                json!({"voltage": mv(300.0), "sweep_enable": true, "sweep_voltage": mv(0.0)}),
            ),
    );
    let first = generate(&store, CodeGeneratorSettings::default()).unwrap();
    let second = generate(&store, CodeGeneratorSettings::default()).unwrap();
    assert_eq!(first, second);
}

struct DatasetHook;

impl CodeHook for DatasetHook {
    fn imports(&self) -> Vec<String> {
        vec!["import json".to_string()]
    }

    fn analyze(&self) -> Vec<String> {
        vec!["self.set_dataset(\"done\", True)".to_string()]
    }
}

#[test]
fn test_hooks_and_sanitized_settings() {
    let store = single_segment(led(false));
    let lab_setup = lab_setup();
    let ctx = CompileContext::new(&store, &lab_setup, &NoSubstitution);
    let settings = CodeGeneratorSettings {
        rpc_device_name: "lab rpc".to_string(),
        artiq_version: 7,
        ..Default::default()
    };
    let source = compile_code(&ctx, "main", BuildId::from(BUILD_ID), settings, &[&DatasetHook])
        .unwrap()
        .source;
    assert!(source.contains("import numpy as np\nimport json\n"));
    assert!(source.contains("    def analyze(self):\n        self.set_dataset(\"done\", True)\n"));
    assert!(source.contains("        self.setattr_device(\"lab_rpc\")\n"));
    assert!(source.contains("ndecimals=0"));
}
