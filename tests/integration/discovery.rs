//! Shell enumeration and catalog scans

use std::collections::HashSet;

use crate::helpers::{touch, Fixture};
use vstbridge::host::testing::MockSpec;
use vstbridge::prelude::*;

fn shell_spec(count: i32) -> MockSpec {
    let names: Vec<String> = (1..=count).map(|i| format!("Sub {i}")).collect();
    let entries: Vec<(i32, &str)> = names
        .iter()
        .enumerate()
        .map(|(i, n)| (0x5300 + i as i32, n.as_str()))
        .collect();
    MockSpec::shell("Suite", &entries)
}

#[test]
fn test_shell_yields_one_descriptor_per_sub_plugin() {
    for count in [1, 3, 12] {
        let fx = Fixture::new(vec![("suite.so", shell_spec(count))]);
        let found = enumerate(&fx.loader, &fx.path("suite.so"));

        assert_eq!(found.len(), count as usize);
        let ids: HashSet<i32> = found.iter().map(|d| d.unique_id).collect();
        assert_eq!(ids.len(), found.len());
        assert!(found.iter().all(|d| d.name.starts_with("Sub ")));
        assert!(found.iter().all(|d| d.path == found[0].path));
    }
}

#[test]
fn test_misbehaving_shell_terminates() {
    let mut spec = shell_spec(4);
    spec.shell_repeats = true;
    let fx = Fixture::new(vec![("loop.so", spec)]);

    let found = enumerate(&fx.loader, &fx.path("loop.so"));
    assert_eq!(found.len(), 4);
}

#[test]
fn test_sub_plugins_load_by_shell_id() {
    let fx = Fixture::new(vec![("suite.so", shell_spec(3))]);
    let found = enumerate(&fx.loader, &fx.path("suite.so"));
    let second = &found[1];

    let plugin = PluginInstance::load(&fx.loader, &second.path, second.unique_id).unwrap();
    assert_eq!(plugin.unique_id(), second.unique_id);
    assert_eq!(plugin.shell_id(), second.unique_id);
    assert_eq!(plugin.name(), "Sub 2");
    assert_eq!(plugin.category(), PluginCategory::Effect);
}

#[cfg(not(any(target_os = "macos", windows)))]
#[test]
fn test_catalog_scan_and_persist() {
    let fx = Fixture::new(vec![
        ("nested/deep/suite.so", shell_spec(2)),
        ("synth.so", MockSpec::synth("Pad", 0x5061_6421, 4)),
        ("effect.so", MockSpec::effect("Chorus", 0x4368_6f72, 2)),
    ]);
    // matches no mock, so loading fails
    touch(&fx.path("stray.so"));
    touch(&fx.path("readme.txt"));
    let root = vec![fx.dir.path().to_path_buf()];

    let mut flat = PluginCatalog::new();
    flat.scan_directories(&fx.loader, &root, false);
    assert_eq!(flat.len(), 2);

    let mut catalog = PluginCatalog::new();
    catalog.scan_directories(&fx.loader, &root, true);
    assert_eq!(catalog.len(), 4);
    assert_eq!(catalog.failed_files().count(), 1);
    let pad = catalog.find_by_name("pad").unwrap();
    assert!(pad.is_instrument);
    assert_eq!(pad.category, PluginCategory::Synth);

    let opened = fx.backend.opened();
    assert_eq!(catalog.scan_directories(&fx.loader, &root, true), 0);
    assert_eq!(fx.backend.opened(), opened);

    let file = fx.path("cache/catalog.bin");
    catalog.save(&file).unwrap();
    assert_eq!(PluginCatalog::load(&file).unwrap(), catalog);
}

#[test]
fn test_descriptors_serialize() {
    let fx = Fixture::new(vec![("effect.so", MockSpec::effect("Chorus", 0x4368_6f72, 2))]);
    let found = enumerate(&fx.loader, &fx.path("effect.so"));
    let desc = &found[0];
    assert_eq!(desc.identifier(), "VST-Chorus-43686f72");
    assert_eq!(desc.version, "V1.2.0");
    assert_eq!((desc.num_inputs, desc.num_outputs), (2, 2));
    assert!(desc.last_modified.is_some());
}
