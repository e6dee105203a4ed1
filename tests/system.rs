mod common;

use common::{add_detector, add_module, simulated_system, StrictBackend};
use handel::channels::ALL_CHANNELS;
use handel::defaults::AcqValueState;
use handel::{ErrorKind, Handel, SimulatedFalconX, SystemState, Value};
use std::fs;

#[test]
fn registry_happy_path() {
    let mut handel = simulated_system();
    handel.start_system().unwrap();
    assert_eq!(handel.state(), SystemState::Running);

    let channels = handel.channels();
    assert_eq!(channels.singles(), vec![0, 1]);
    let mut all = channels.resolve(ALL_CHANNELS).unwrap();
    all.sort_unstable();
    assert_eq!(all, vec![0, 1]);
    assert_eq!(handel.module_from_detchan(1).unwrap(), "mod1");
    assert_eq!(handel.detector_from_detchan(0).unwrap(), "det1");
    assert_eq!(handel.get_module_channel(1), 1);

    handel.end_system().unwrap();
    assert_eq!(handel.state(), SystemState::Dead);
}

#[test]
fn aliases_are_case_insensitive() {
    let mut handel = simulated_system();
    assert!(handel.detector("DET1").is_some());
    assert_eq!(
        handel.get_module_item("Mod1", "inet_port").unwrap(),
        Value::Int(8756)
    );
    let err = handel.new_detector("Det1").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AliasExists);
}

#[test]
fn overlapping_firmware_fails_start() {
    let mut handel = simulated_system();
    handel.new_firmware("fw").unwrap();
    for (ptrr, min, max) in [(1, 1e-6, 3e-6), (2, 2e-6, 5e-6)] {
        handel.add_firmware_item("fw", "ptrr", ptrr).unwrap();
        handel.add_firmware_item("fw", "min_peaking_time", min).unwrap();
        handel.add_firmware_item("fw", "max_peaking_time", max).unwrap();
        handel.add_firmware_item("fw", "fippi", format!("f{ptrr}.fip")).unwrap();
        handel.add_firmware_item("fw", "dsp", format!("d{ptrr}.hex")).unwrap();
    }
    handel.add_module_item("mod1", "firmware_set_all", "fw").unwrap();

    let err = handel.start_system().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PtrOverlap);
    assert_eq!(handel.state(), SystemState::Dead);
}

#[test]
fn configuration_survives_save_and_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("a.ini");

    let mut handel = simulated_system();
    handel.new_default("my_defaults").unwrap();
    handel.add_default_item("my_defaults", "peaking_time", 2.0).unwrap();
    handel.add_module_item("mod1", "default_all", "my_defaults").unwrap();
    handel.add_module_item("mod1", "count_rate", 5000.0).unwrap();
    let before = handel.to_ini_string().unwrap();
    handel.save_system("handel_ini", &path).unwrap();

    handel.init();
    assert_eq!(handel.num_modules(), 0);
    assert_eq!(handel.num_detectors(), 0);

    handel.load_system("handel_ini", &path).unwrap();
    assert_eq!(handel.to_ini_string().unwrap(), before);
    assert_eq!(handel.list_detectors(), vec!["det1".to_string()]);
    assert_eq!(
        handel.get_default_item("my_defaults", "peaking_time").unwrap(),
        Value::Double(2.0)
    );
    handel.start_system().unwrap();
    assert_eq!(
        handel.get_acquisition_values(0, "peaking_time").unwrap(),
        2.0
    );
}

#[test]
fn channel_data_blobs_round_trip_through_the_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("blob.ini");
    let blob: Vec<u8> = (0..2000u32).map(|i| (i % 97) as u8).collect();

    let mut handel = simulated_system();
    handel
        .add_module_item("mod1", "data_chan1", Value::Bytes(blob.clone()))
        .unwrap();
    handel.save_system("handel_ini", &path).unwrap();
    let text = fs::read_to_string(&path).unwrap();
    assert!(text.contains("[module channel data]"));
    assert!(text.contains("data_chan1_len"));

    let mut fresh = Handel::new().with_backend(SimulatedFalconX::new(1));
    fresh.load_system("handel_ini", &path).unwrap();
    assert_eq!(
        fresh.get_module_item("mod1", "data_chan1").unwrap(),
        Value::Bytes(blob)
    );
    let err = fresh.get_module_item("mod1", "data_chan0").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnknownItem);
}

#[test]
fn missing_module_section_loads_empty() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nomod.ini");
    fs::write(
        &path,
        "[detector definitions]\n\
         START #1\n\
         alias = det1\n\
         number_of_channels = 1\n\
         type = reset\n\
         type_value = 1.0e-6\n\
         channel0_gain = 1.0\n\
         channel0_polarity = +\n\
         END #1\n",
    )
    .unwrap();

    let mut handel = Handel::new().with_backend(SimulatedFalconX::default());
    handel.load_system("handel_ini", &path).unwrap();
    assert_eq!(handel.num_detectors(), 1);
    assert_eq!(handel.num_modules(), 0);
    let err = handel.start_system().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoDetChans);
}

#[test]
fn broken_file_leaves_registries_empty() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.ini");
    fs::write(&path, "[detector definitions]\nSTART #1\nalias = det1\n").unwrap();

    let mut handel = simulated_system();
    let err = handel.load_system("handel_ini", &path).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FormatError);
    assert_eq!(handel.num_detectors(), 0);
    assert_eq!(handel.num_modules(), 0);

    let err = handel
        .load_system("handel_ini", dir.path().join("absent.ini"))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OpenFile);
}

#[test]
fn channel_alias_past_the_channel_count() {
    let mut handel = Handel::new().with_backend(SimulatedFalconX::default());
    handel.new_module("mod4").unwrap();
    handel.add_module_item("mod4", "module_type", "falconx4").unwrap();
    handel.add_module_item("mod4", "number_of_channels", 4).unwrap();
    let err = handel.add_module_item("mod4", "channel5_alias", 9).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadChannel);
}

#[test]
fn set_cycles_are_rejected() {
    let mut handel = simulated_system();
    handel.add_channel_set_elem(100, 0).unwrap();
    handel.add_channel_set_elem(101, 100).unwrap();
    handel.add_channel_set_elem(100, 101).unwrap();

    let err = handel.channels().validate_sets().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InfiniteLoop);
    let err = handel.start_system().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InfiniteLoop);

    handel.remove_channel_set_elem(100, 101).unwrap();
    handel.start_system().unwrap();
}

#[test]
fn all_channels_set_follows_the_singles() {
    let mut handel = simulated_system();
    assert!(!handel.channels().is_free(ALL_CHANNELS));
    handel.modify_module_item("mod1", "channel0_alias", -1).unwrap();
    assert_eq!(handel.channels().resolve(ALL_CHANNELS).unwrap(), vec![1]);
    handel.modify_module_item("mod1", "channel1_alias", -1).unwrap();
    assert!(handel.channels().is_free(ALL_CHANNELS));
}

#[test]
fn registries_are_frozen_while_running() {
    let mut handel = simulated_system();
    handel.start_system().unwrap();
    let err = handel.new_detector("det2").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoModify);
    let err = handel.remove_module("mod1").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoModify);
    handel.end_system().unwrap();
    handel.remove_module("mod1").unwrap();
    assert!(handel.channels().singles().is_empty());
}

#[test]
fn setting_a_value_twice_is_idempotent() {
    let mut handel = simulated_system();
    handel.start_system().unwrap();

    for _ in 0..2 {
        let mut value = 2.5;
        handel.set_acquisition_values(0, "peaking_time", &mut value).unwrap();
        assert_eq!(value, 2.5);
    }
    let defaults = handel.defaults_set("defaults_mod1_channel0").unwrap();
    let matching: Vec<_> = defaults
        .entries()
        .iter()
        .filter(|e| e.name == "peaking_time")
        .collect();
    assert_eq!(matching.len(), 1);
    assert_eq!(matching[0].data, 2.5);
    assert_eq!(matching[0].state, AcqValueState::Synced);
}

#[test]
fn set_members_each_get_the_requested_value() {
    let mut handel = simulated_system();
    handel.start_system().unwrap();

    let mut bins = 1000.0;
    handel
        .set_acquisition_values(ALL_CHANNELS, "number_mca_channels", &mut bins)
        .unwrap();
    assert_eq!(bins, 1024.0);
    for ch in [0, 1] {
        assert_eq!(
            handel.get_acquisition_values(ch, "number_mca_channels").unwrap(),
            1024.0
        );
    }
    let err = handel
        .get_acquisition_values(ALL_CHANNELS, "number_mca_channels")
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadType);
}

#[test]
fn removal_is_gated_by_the_backend() {
    let mut handel = Handel::new().with_backend(StrictBackend::default());
    add_detector(&mut handel);
    add_module(&mut handel);
    handel.start_system().unwrap();

    let before = handel
        .defaults_set("defaults_mod1_channel0")
        .unwrap()
        .clone();
    let err = handel
        .remove_acquisition_values(0, "preset_type")
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoRemove);
    assert_eq!(
        handel.defaults_set("defaults_mod1_channel0").unwrap(),
        &before
    );
}

#[test]
fn removable_values_are_dropped_and_reapplied() {
    let mut handel = simulated_system();
    handel.start_system().unwrap();
    handel.remove_acquisition_values(1, "scale_factor").unwrap();
    let defaults = handel.defaults_set("defaults_mod1_channel1").unwrap();
    assert!(defaults.get("scale_factor").is_none());
    assert!(handel.defaults_set("defaults_mod1_channel0").unwrap().get("scale_factor").is_some());
}

#[test]
fn acquisition_calls_need_a_running_system() {
    let mut handel = simulated_system();
    let mut value = 1.0;
    let err = handel
        .set_acquisition_values(0, "peaking_time", &mut value)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IllegalOperation);
    let err = handel.start_run(0, false).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IllegalOperation);
}

#[test]
fn gain_calibration_updates_the_detector() {
    let mut handel = simulated_system();
    handel.start_system().unwrap();
    handel.gain_calibrate(0, 2.0).unwrap();
    let gain = handel.get_detector_item("det1", "channel0_gain").unwrap();
    assert!(gain.as_f64().unwrap() > 1.0);
    assert_eq!(
        handel.get_detector_item("det1", "channel1_gain").unwrap().as_f64().unwrap(),
        1.0
    );
}

#[test]
fn set_edits_need_a_stopped_system() {
    let mut handel = simulated_system();
    handel.add_channel_set_elem(100, 0).unwrap();
    handel.start_system().unwrap();

    for err in [
        handel.add_channel_set_elem(100, 1).unwrap_err(),
        handel.remove_channel_set_elem(100, 0).unwrap_err(),
        handel.remove_channel_set(100).unwrap_err(),
    ] {
        assert_eq!(err.kind(), ErrorKind::NoModify);
    }
    assert_eq!(handel.channels().resolve(100).unwrap(), vec![0]);

    handel.end_system().unwrap();
    handel.remove_channel_set(100).unwrap();
    assert!(handel.channels().is_free(100));
}

#[test]
fn partial_configuration_survives_save_and_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("partial.ini");

    let mut handel = Handel::new().with_backend(SimulatedFalconX::default());
    handel.new_detector("d").unwrap();
    handel.add_detector_item("d", "number_of_channels", 1).unwrap();
    handel.new_detector("bare").unwrap();
    handel.new_firmware("bundle").unwrap();
    handel.add_firmware_item("bundle", "filename", "falconx.fdd").unwrap();
    handel.add_firmware_item("bundle", "num_keywords", 2).unwrap();
    handel.add_firmware_item("bundle", "keyword1", "fast").unwrap();
    let before = handel.to_ini_string().unwrap();
    assert!(!before.contains("type = "));
    handel.save_system("handel_ini", &path).unwrap();

    handel.load_system("handel_ini", &path).unwrap();
    assert_eq!(handel.list_detectors(), vec!["d".to_string(), "bare".to_string()]);
    assert_eq!(
        handel.get_detector_item("d", "number_of_channels").unwrap(),
        Value::Int(1)
    );
    assert_eq!(
        handel.get_firmware_item("bundle", "keyword1").unwrap(),
        Value::from("fast")
    );
    assert_eq!(handel.to_ini_string().unwrap(), before);
}

#[test]
fn sync_count_reads_back_one_based() {
    let mut handel = simulated_system();
    handel.start_system().unwrap();

    let mut count = 3.0;
    handel.set_acquisition_values(0, "sync_count", &mut count).unwrap();
    assert_eq!(count, 3.0);
    assert_eq!(handel.get_acquisition_values(0, "sync_count").unwrap(), 3.0);
    assert_eq!(
        handel.defaults_set("defaults_mod1_channel0").unwrap().get("sync_count"),
        Some(3.0)
    );

    let mut zero = 0.0;
    let err = handel
        .set_acquisition_values(0, "sync_count", &mut zero)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadValue);
    assert_eq!(handel.get_acquisition_values(0, "sync_count").unwrap(), 3.0);
}
