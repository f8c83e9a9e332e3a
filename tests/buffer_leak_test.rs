// Kept to a single test: the live buffer counter is process wide.

use ghostview::render::{WaitPolicy, live_owned_buffers};
use ghostview::test_utils::Fixture;

#[test]
fn page_images_are_released_by_evictions_and_unload() {
    let baseline = live_owned_buffers();
    let fixture = Fixture::new(4);
    let document = fixture.open();
    assert_eq!(live_owned_buffers(), baseline + 4);

    document.load_high_res(WaitPolicy::Wait, 1, 4).unwrap();
    assert_eq!(live_owned_buffers(), baseline + 8);

    // Reloading a tier replaces the previous image.
    document.load_high_res(WaitPolicy::Wait, 1, 4).unwrap();
    assert_eq!(live_owned_buffers(), baseline + 8);

    document.zoom_area(WaitPolicy::Wait, 2, 2.0).unwrap();
    assert_eq!(live_owned_buffers(), baseline + 11);

    document.unload_high_res(1, 4).unwrap();
    assert_eq!(live_owned_buffers(), baseline + 7);

    document.unload_zoomed(1, 4).unwrap();
    assert_eq!(live_owned_buffers(), baseline + 4);

    // A failed load must not leave buffers behind.
    fixture.probe.set_missing_pages(1);
    assert!(document.load_high_res(WaitPolicy::Wait, 1, 4).is_err());
    assert_eq!(live_owned_buffers(), baseline + 4);

    document.unload();
    assert_eq!(live_owned_buffers(), baseline);
}
