//! Editor embedding

use crate::helpers::Fixture;
use raw_window_handle::{RawWindowHandle, XlibWindowHandle};
use vstbridge::host::testing::MockSpec;
use vstbridge::prelude::*;

#[test]
fn test_editor_lifecycle_alongside_processing() {
    let spec = MockSpec::effect("Panel", 0x5061_6e6c, 2).with_editor(480, 320);
    let probe = spec.probe.clone();
    let fx = Fixture::new(vec![("panel.so", spec)]);
    let plugin = fx.prepared("panel.so");
    assert!(plugin.has_editor());

    let mut editor = plugin.create_editor().unwrap();
    let parent = RawWindowHandle::Xlib(XlibWindowHandle::new(0x4400));
    assert_eq!(editor.open(parent).unwrap(), (480, 320));

    let mut left = vec![0.5; 64];
    let mut right = vec![0.5; 64];
    for _ in 0..4 {
        plugin.process_block(&mut [&mut left[..], &mut right[..]], &mut MidiEventVec::new());
        editor.idle();
    }
    assert_eq!(probe.with(|s| s.editor_idles), 4);

    drop(editor);
    assert_eq!(probe.with(|s| s.editor_parent), None);
    assert!(plugin.create_editor().is_some());
}
