//! Module loading and sharing

use crate::helpers::Fixture;
use vstbridge::prelude::*;
use vstbridge::host::testing::MockSpec;
use vstbridge::host::LoadError;

#[test]
fn test_module_loaded_once_and_unloaded_with_last_reference() {
    let fx = Fixture::new(vec![("delay.so", MockSpec::effect("Delay", 1, 2))]);
    let path = fx.path("delay.so");

    for round in 1..=3 {
        let a = fx.loader.find_or_create_module(&path).unwrap();
        let b = fx.loader.find_or_create_module(&path).unwrap();
        assert!(std::sync::Arc::ptr_eq(&a, &b));
        assert_eq!(fx.backend.opened(), round);
        assert_eq!(fx.backend.live_modules(), 1);

        drop(a);
        assert!(fx.loader.is_resident(&path));
        drop(b);
        assert!(!fx.loader.is_resident(&path));
        assert_eq!(fx.backend.live_modules(), 0);
    }
}

#[test]
fn test_instances_keep_their_module_alive() {
    let fx = Fixture::new(vec![("delay.so", MockSpec::effect("Delay", 1, 2))]);

    let first = fx.load("delay.so");
    let second = fx.load("delay.so");
    assert_eq!(fx.backend.opened(), 1);
    assert_eq!(fx.loader.resident_count(), 1);

    drop(first);
    assert_eq!(fx.backend.live_modules(), 1);
    assert_eq!(second.state(), LifecycleState::Initialized);

    drop(second);
    assert_eq!(fx.backend.live_modules(), 0);
    assert_eq!(fx.loader.resident_count(), 0);
}

#[test]
fn test_distinct_paths_load_distinct_modules() {
    let fx = Fixture::new(vec![
        ("a.so", MockSpec::effect("A", 1, 0)),
        ("b.so", MockSpec::effect("B", 2, 0)),
    ]);
    let a = fx.load("a.so");
    let b = fx.load("b.so");
    assert_eq!(fx.backend.opened(), 2);
    assert_eq!(a.name(), "A");
    assert_eq!(b.name(), "B");
}

#[test]
fn test_failed_load_leaves_nothing_resident() {
    let mut broken = MockSpec::effect("Broken", 1, 0);
    broken.panic_on_open = true;
    let fx = Fixture::new(vec![("broken.so", broken)]);

    let result = PluginInstance::load(&fx.loader, &fx.path("broken.so"), 0);
    assert!(matches!(result, Err(LoadError::Failed { .. })));
    assert_eq!(fx.backend.live_modules(), 0);
    assert_eq!(fx.loader.resident_count(), 0);

    let missing = PluginInstance::load(&fx.loader, &fx.path("absent.so"), 0);
    assert!(matches!(missing, Err(LoadError::MissingBinary(_))));
}

#[test]
fn test_umbrella_error_wraps_load_errors() {
    let fx = Fixture::new(vec![]);
    let result: vstbridge::Result<PluginInstance> =
        PluginInstance::load(&fx.loader, &fx.path("absent.so"), 0).map_err(Into::into);
    let err = result.err().unwrap();
    assert!(matches!(err, vstbridge::Error::Host(_)));
    assert!(err.to_string().contains("absent.so"));
}
