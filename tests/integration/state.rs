//! Bank and program files against live instances

use crate::helpers::tolerances::PARAM_EPSILON;
use crate::helpers::{parameter_vector, snapshot, Fixture};
use approx::assert_relative_eq;
use vstbridge::host::testing::MockSpec;
use vstbridge::host::StateFormatError;
use vstbridge::prelude::*;

fn set_all(plugin: &PluginInstance, values: &[f32]) {
    for (index, value) in values.iter().enumerate() {
        plugin.set_parameter(index, *value);
    }
}

#[test]
fn test_bank_file_scenario() {
    let spec = MockSpec::effect("Trio", 0x5472_696f, 3).with_programs(&["Low", "Mid", "High"]);
    let fx = Fixture::new(vec![("trio.so", spec)]);
    let file = fx.path("trio.fxb");

    let original = fx.prepared("trio.so");
    original.set_current_program(1);
    set_all(&original, &[0.2, 0.5, 0.9]);
    original.save_to_file(&file, true).unwrap();

    let fresh = fx.prepared("trio.so");
    assert_eq!(fresh.current_program(), 0);
    fresh.load_from_file(&file).unwrap();

    assert_eq!(fresh.current_program(), 1);
    let restored = snapshot(&fresh);
    for (got, want) in restored.iter().zip([0.2, 0.5, 0.9]) {
        assert_relative_eq!(*got, want, epsilon = PARAM_EPSILON);
    }
    assert_eq!(fresh.program_names(), vec!["Low", "Mid", "High"]);

    // the saving instance is left as it was
    assert_eq!(original.current_program(), 1);
    assert_eq!(snapshot(&original), vec![0.2, 0.5, 0.9]);
}

#[test]
fn test_program_round_trip_law() {
    let fx = Fixture::new(vec![("flat.so", MockSpec::effect("Flat", 0x466c_6174, 8))]);
    let source = fx.prepared("flat.so");
    let target = fx.prepared("flat.so");

    for seed in 1..=25 {
        let values = parameter_vector(8, seed);
        set_all(&source, &values);
        let image = source.save_program_state();

        target.restore_state(&image).unwrap();
        let restored = snapshot(&target);
        let same_bits = restored
            .iter()
            .zip(&values)
            .all(|(a, b)| a.to_bits() == b.to_bits());
        assert!(same_bits, "seed {seed}: {restored:?} != {values:?}");
    }
}

#[test]
fn test_bank_round_trip_law() {
    let spec = MockSpec::effect("Banked", 0x4261_6e6b, 4).with_programs(&["One", "Two", "Three", "Four"]);
    let fx = Fixture::new(vec![("banked.so", spec)]);
    let source = fx.prepared("banked.so");

    let mut expected = Vec::new();
    for program in 0..4 {
        source.set_current_program(program);
        let values = parameter_vector(4, program as u64 + 100);
        set_all(&source, &values);
        expected.push(values);
    }
    source.set_current_program(2);
    let image = source.save_state();

    let target = fx.prepared("banked.so");
    target.restore_state(&image).unwrap();
    assert_eq!(target.current_program(), 2);
    for (program, values) in expected.iter().enumerate() {
        target.set_current_program(program);
        assert_eq!(&snapshot(&target), values, "program {program}");
    }
}

#[test]
fn test_unknown_magic_leaves_parameters_unchanged() {
    let fx = Fixture::new(vec![("guard.so", MockSpec::effect("Guard", 0x4775_6172, 3))]);
    let plugin = fx.prepared("guard.so");
    set_all(&plugin, &[0.1, 0.2, 0.3]);
    let mut image = plugin.save_state();
    set_all(&plugin, &[0.7, 0.8, 0.9]);

    image[..4].copy_from_slice(b"RIFF");
    let err = plugin.restore_state(&image).unwrap_err();
    assert!(matches!(err, StateFormatError::UnknownMagic(_)));
    assert_eq!(snapshot(&plugin), vec![0.7, 0.8, 0.9]);

    let truncated = &plugin.save_state()[..40];
    assert!(plugin.restore_state(truncated).is_err());
    assert_eq!(snapshot(&plugin), vec![0.7, 0.8, 0.9]);
}

#[test]
fn test_chunk_plugin_state() {
    let spec = MockSpec::effect("Opaque", 0x4f70_6171, 2)
        .with_programs(&["A", "B"])
        .with_chunks();
    let fx = Fixture::new(vec![("opaque.so", spec)]);
    let source = fx.prepared("opaque.so");
    source.set_current_program(1);
    set_all(&source, &[0.25, 0.75]);

    let bank = StateChunk::parse(&source.save_state()).unwrap();
    assert!(bank.is_bank());
    assert!(bank.is_opaque());
    assert_eq!(bank.fx_id(), 0x4f70_6171);

    let target = fx.prepared("opaque.so");
    target.restore_state(&source.save_state()).unwrap();
    assert_eq!(target.current_program(), 1);
    assert_eq!(snapshot(&target), vec![0.25, 0.75]);
}

#[test]
fn test_empty_chunk_is_refused() {
    let spec = MockSpec::effect("Opaque", 0x4f70_6171, 2).with_chunks();
    let fx = Fixture::new(vec![("opaque.so", spec)]);
    let plugin = fx.prepared("opaque.so");
    set_all(&plugin, &[0.3, 0.6]);

    let empty = StateChunk::ChunkProgram {
        fx_id: 0x4f70_6171,
        fx_version: 1,
        num_programs: 0,
        name: String::new(),
        data: Vec::new(),
    };
    let err = plugin.restore_state(&empty.to_bytes()).unwrap_err();
    assert_eq!(err, StateFormatError::ChunkRejected { size: 0 });
    assert_eq!(snapshot(&plugin), vec![0.3, 0.6]);
}

#[test]
fn test_program_file_into_other_plugin_still_applies() {
    let fx = Fixture::new(vec![
        ("one.so", MockSpec::effect("One", 1, 2)),
        ("two.so", MockSpec::effect("Two", 2, 2)),
    ]);
    let one = fx.prepared("one.so");
    let two = fx.prepared("two.so");
    set_all(&one, &[0.4, 0.6]);

    two.restore_state(&one.save_program_state()).unwrap();
    assert_eq!(snapshot(&two), vec![0.4, 0.6]);
}

#[test]
fn test_missing_state_file_is_io_error() {
    let fx = Fixture::new(vec![("x.so", MockSpec::effect("X", 1, 1))]);
    let plugin = fx.prepared("x.so");
    let err = plugin.load_from_file(&fx.path("nothing.fxp")).unwrap_err();
    assert!(matches!(err, vstbridge::host::HostError::Io(_)));
}
