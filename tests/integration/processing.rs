//! Audio and MIDI through live instances

use crate::helpers::tolerances::FLOAT_EPSILON;
use crate::helpers::{generate_sine, signals_approx_equal, Fixture, TEST_BUFFER_SIZE, TEST_SAMPLE_RATE};
use approx::assert_relative_eq;
use vstbridge::host::testing::{MockProcessing, MockSpec};
use vstbridge::prelude::*;

#[test]
fn test_pass_through_law_before_initialise() {
    let layouts = [(0, 2), (1, 2), (2, 2), (2, 1), (1, 4)];
    for (inputs, outputs) in layouts {
        let spec = MockSpec::effect("Idle", 9, 0).with_io(inputs, outputs).with_gain(0.0);
        let fx = Fixture::new(vec![("idle.so", spec)]);
        let module = fx.loader.find_or_create_module(&fx.path("idle.so")).unwrap();
        let plugin = PluginInstance::create(module, 0).unwrap();

        let source: Vec<Vec<f32>> = (0..4)
            .map(|ch| generate_sine(110.0 * (ch + 1) as f64, TEST_SAMPLE_RATE, 64))
            .collect();
        let mut channels = source.clone();
        {
            let mut audio: Vec<&mut [f32]> = channels.iter_mut().map(|c| c.as_mut_slice()).collect();
            plugin.process_block(&mut audio, &mut MidiEventVec::new());
        }

        let available = (inputs as usize).min(4);
        for ch in 0..4 {
            let expected = if available > 0 && ch >= available && ch < outputs as usize {
                &source[ch % available]
            } else {
                &source[ch]
            };
            assert_eq!(&channels[ch], expected, "layout {inputs}x{outputs}, channel {ch}");
        }
    }
}

#[test]
fn test_gain_applied_to_signal() {
    let fx = Fixture::new(vec![("gain.so", MockSpec::effect("Gain", 3, 0).with_gain(0.25))]);
    let plugin = fx.prepared("gain.so");

    let input = generate_sine(440.0, TEST_SAMPLE_RATE, TEST_BUFFER_SIZE);
    let mut left = input.clone();
    let mut right = input.clone();
    plugin.process_block(&mut [&mut left[..], &mut right[..]], &mut MidiEventVec::new());

    let expected: Vec<f32> = input.iter().map(|s| s * 0.25).collect();
    assert!(signals_approx_equal(&left, &expected, FLOAT_EPSILON));
    assert!(signals_approx_equal(&right, &expected, FLOAT_EPSILON));
}

#[test]
fn test_separate_output_processing_matches_in_place() {
    let in_place = Fixture::new(vec![("a.so", MockSpec::effect("A", 1, 0).with_gain(0.5))]);
    let separate = Fixture::new(vec![(
        "b.so",
        MockSpec::effect("B", 2, 0)
            .with_gain(0.5)
            .with_processing(MockProcessing::Accumulating),
    )]);
    let a = in_place.prepared("a.so");
    let b = separate.prepared("b.so");

    let input = generate_sine(1000.0, TEST_SAMPLE_RATE, TEST_BUFFER_SIZE);
    let (mut al, mut ar) = (input.clone(), input.clone());
    let (mut bl, mut br) = (input.clone(), input.clone());
    for _ in 0..3 {
        a.process_block(&mut [&mut al[..], &mut ar[..]], &mut MidiEventVec::new());
        b.process_block(&mut [&mut bl[..], &mut br[..]], &mut MidiEventVec::new());
    }
    for (x, y) in al.iter().zip(&bl) {
        assert_relative_eq!(*x, *y, epsilon = FLOAT_EPSILON);
    }
    assert_eq!(ar, br);
}

#[test]
fn test_faulting_plugin_keeps_processing_state() {
    let spec = MockSpec::effect("Crashy", 5, 0).panicking_in_process();
    let fx = Fixture::new(vec![("crashy.so", spec)]);
    let plugin = fx.prepared("crashy.so");

    let input = generate_sine(220.0, TEST_SAMPLE_RATE, TEST_BUFFER_SIZE);
    for _ in 0..10 {
        let mut left = input.clone();
        let mut right = input.clone();
        plugin.process_block(&mut [&mut left[..], &mut right[..]], &mut MidiEventVec::new());
        assert_eq!(left, input);
    }
    assert_eq!(plugin.processing_faults(), 10);
    assert_eq!(plugin.state(), LifecycleState::Processing);

    plugin.release();
    assert_eq!(plugin.state(), LifecycleState::Suspended);
}

#[test]
fn test_fault_midway_leaves_input_intact() {
    let spec = MockSpec::effect("Scribble", 6, 0)
        .with_gain(99.0)
        .panicking_after_write();
    let fx = Fixture::new(vec![("scribble.so", spec)]);
    let plugin = fx.prepared("scribble.so");

    let input = generate_sine(330.0, TEST_SAMPLE_RATE, TEST_BUFFER_SIZE);
    let mut left = input.clone();
    let mut right = vec![0.2; TEST_BUFFER_SIZE];
    plugin.process_block(&mut [&mut left[..], &mut right[..]], &mut MidiEventVec::new());

    assert_eq!(plugin.processing_faults(), 1);
    assert_eq!(left, input);
    assert!(right.iter().all(|s| *s == 0.2));
}

#[test]
fn test_midi_echo_round_trip() {
    let spec = MockSpec::synth("Echo", 7, 0).with_midi(true, true);
    let fx = Fixture::new(vec![("echo.so", spec)]);
    let plugin = fx.prepared("echo.so");

    let mut left = vec![0.0; TEST_BUFFER_SIZE];
    let mut right = vec![0.0; TEST_BUFFER_SIZE];
    let mut midi = MidiEventVec::new();
    midi.push(MidiEvent::note_on(0, 1, 64, 100));
    midi.push(MidiEvent::control_change(32, 1, 7, 90));
    plugin.process_block(&mut [&mut left[..], &mut right[..]], &mut midi);

    assert_eq!(midi.len(), 2);
    assert_eq!(midi[0].as_bytes(), &[0x91, 64, 100]);
    assert_eq!(midi[1].frame_offset, 32);

    midi.clear();
    plugin.process_block(&mut [&mut left[..], &mut right[..]], &mut midi);
    assert!(midi.is_empty());
}

#[test]
fn test_plugin_automation_reaches_event_queue() {
    let fx = Fixture::new(vec![("auto.so", MockSpec::effect("Auto", 8, 3))]);
    let plugin = fx.prepared("auto.so");
    let events = plugin.events();
    while events.try_recv().is_ok() {}

    plugin.set_parameter(2, 0.75);
    let changes: Vec<InstanceEvent> = events.try_iter().collect();
    assert!(changes.contains(&InstanceEvent::ParameterChanged {
        index: 2,
        value: 0.75
    }));
}
