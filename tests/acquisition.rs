mod common;

use approx::assert_relative_eq;
use common::{add_detector, add_module, mapping_buffer, simulated_system, ScriptedBackend};
use handel::channels::ALL_CHANNELS;
use handel::{CollectMode, Conf, Controller, FrameData, Handel};
use std::time::Duration;

fn started(settings: &[(&str, f64)]) -> Handel {
    let mut handel = simulated_system();
    handel.start_system().unwrap();
    for &(name, value) in settings {
        let mut value = value;
        handel
            .set_acquisition_values(ALL_CHANNELS, name, &mut value)
            .unwrap();
    }
    handel
}

fn controller(handel: Handel) -> Controller {
    let conf = Conf::load(None).unwrap();
    Controller::new(handel.into_shared(), conf)
}

#[test]
fn preset_mca_run_emits_one_frame() {
    let handel = started(&[("preset_type", 1.0), ("preset_value", 0.05)]);
    let mut controller = controller(handel);

    controller.start_acquisition(CollectMode::Mca).unwrap();
    assert!(controller.wait_idle(Duration::from_secs(5)));

    let frame = controller
        .frames()
        .recv_timeout(Duration::from_secs(1))
        .unwrap();
    assert_eq!(frame.pixel, None);
    assert_eq!(frame.n_channels(), 2);
    match &frame.data {
        FrameData::Spectra(data) => assert_eq!(data.dim(), (4096, 2)),
        FrameData::Raw(_) => panic!("expected spectra"),
    }
    assert!(frame.attributes[0].realtime >= 0.05);
    assert!(controller.frames().try_recv().is_err());

    let counters = controller.counters().unwrap();
    assert_eq!(counters.buffer_counter, 1);
    assert_eq!(controller.spectrum(1).unwrap().len(), 4096);
    controller.shutdown().unwrap();
}

#[test]
fn mapping_run_reads_every_pixel() {
    let handel = started(&[
        ("number_mca_channels", 256.0),
        ("num_map_pixels", 5.0),
        ("num_map_pixels_per_buffer", 4.0),
    ]);
    let mut controller = controller(handel);

    controller.start_acquisition(CollectMode::McaMapping).unwrap();
    assert!(controller.wait_idle(Duration::from_secs(5)));

    let frames: Vec<_> = controller.frames().try_iter().collect();
    assert_eq!(frames.len(), 5);
    let pixels: Vec<_> = frames.iter().map(|f| f.pixel).collect();
    assert_eq!(pixels, (0..5u32).map(Some).collect::<Vec<_>>());
    for frame in &frames {
        match &frame.data {
            FrameData::Spectra(data) => assert_eq!(data.dim(), (256, 2)),
            FrameData::Raw(_) => panic!("expected spectra"),
        }
    }

    let counters = controller.counters().unwrap();
    assert_eq!(counters.buffer_counter, 2);
    assert_eq!(counters.pixels, 5);
    assert_eq!(controller.spectrum(0).unwrap().len(), 256);
    controller.shutdown().unwrap();
}

#[test]
fn sca_windows_are_clamped() {
    let handel = started(&[]);
    let mut controller = controller(handel);

    let mut windows = vec![(10, 20), (40, 30)];
    windows.extend((0..20).map(|i| (i, i + 1)));
    controller.configure_scas(ALL_CHANNELS, &windows).unwrap();

    let shared = controller.handel().clone();
    let mut handel = shared.lock().unwrap();
    assert_eq!(handel.get_acquisition_values(0, "number_of_scas").unwrap(), 16.0);
    assert_eq!(handel.get_acquisition_values(1, "sca0_hi").unwrap(), 20.0);
    assert_eq!(handel.get_acquisition_values(0, "sca1_lo").unwrap(), 40.0);
    assert_eq!(handel.get_acquisition_values(0, "sca1_hi").unwrap(), 40.0);
}

#[test]
fn trace_times_follow_the_clock() {
    let handel = started(&[]);
    let mut controller = controller(handel);

    let (trace, time) = controller.get_trace(0, 100).unwrap();
    assert_eq!(trace.len(), 100);
    assert_eq!(time.len(), 100);
    assert_relative_eq!(time[0], 0.0);
    assert_relative_eq!(time[1], 1.0 / 250.0);
    assert_relative_eq!(time[99], 99.0 / 250.0);

    let (trace, time) = controller.get_trace(1, 10).unwrap();
    assert_eq!(trace.len(), 10);
    assert_eq!(time.len(), 10);
}

#[test]
fn preset_runs_can_be_repeated() {
    let handel = started(&[("preset_type", 1.0), ("preset_value", 0.05)]);
    let mut controller = controller(handel);

    let mut frames = Vec::new();
    for _ in 0..2 {
        controller.start_acquisition(CollectMode::Mca).unwrap();
        assert!(controller.wait_idle(Duration::from_secs(5)));
        {
            let handel = controller.handel().lock().unwrap();
            assert!(!handel.is_run_active(0));
            assert!(!handel.is_run_active(1));
        }
        frames.push(
            controller
                .frames()
                .recv_timeout(Duration::from_secs(1))
                .unwrap(),
        );
    }

    assert!(frames[1].id > frames[0].id);
    assert!(frames[1].attributes[0].realtime >= 0.05);
    assert!(frames[1].attributes[0].realtime < 0.1);
    match (&frames[0].data, &frames[1].data) {
        (FrameData::Spectra(first), FrameData::Spectra(second)) => assert_ne!(first, second),
        _ => panic!("expected spectra"),
    }
    controller.shutdown().unwrap();
}

fn scripted(buffers: Vec<Vec<u16>>) -> Controller {
    let mut handel = Handel::new().with_backend(ScriptedBackend::new(buffers));
    add_detector(&mut handel);
    add_module(&mut handel);
    handel.start_system().unwrap();
    controller(handel)
}

#[test]
fn empty_buffer_counts_once() {
    let mut controller = scripted(vec![mapping_buffer(0, &[])]);

    controller.start_acquisition(CollectMode::McaMapping).unwrap();
    assert!(controller.wait_idle(Duration::from_secs(5)));

    let counters = controller.counters().unwrap();
    assert_eq!(counters.buffer_counter, 1);
    assert_eq!(counters.pixels, 0);
    assert_eq!(counters.bytes_read, 2 * 2 * 256);
    assert!(controller.frames().try_recv().is_err());
    controller.shutdown().unwrap();
}

#[test]
fn corrupt_buffer_does_not_end_the_run() {
    let mut controller = scripted(vec![
        vec![0; 512],
        mapping_buffer(0, &[]),
        mapping_buffer(0, &[vec![1, 2, 3, 4]]),
    ]);

    controller.start_acquisition(CollectMode::McaMapping).unwrap();
    assert!(controller.wait_idle(Duration::from_secs(5)));

    let counters = controller.counters().unwrap();
    assert_eq!(counters.buffer_counter, 3);
    assert_eq!(counters.pixels, 1);
    let frames: Vec<_> = controller.frames().try_iter().collect();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].pixel, Some(0));
    assert_eq!(controller.spectrum(1).unwrap(), vec![1, 2, 3, 4]);
    controller.shutdown().unwrap();
}
