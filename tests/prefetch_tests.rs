use std::sync::Arc;
use std::thread;
use std::time::Duration;

use ghostview::render::{
    PrefetchScheduler, ProgressSink, SchedulerState, ViewCursor, ViewState, WaitPolicy,
};
use ghostview::test_utils::{Fixture, RecordingProgress, wait_until};

const TIMEOUT: Duration = Duration::from_secs(5);

fn loaded_pages(document: &ghostview::Document) -> Vec<usize> {
    (1..=document.size())
        .filter(|&page| document.is_high_res_loaded(page))
        .collect()
}

#[test]
fn keeps_window_around_current_page() {
    let fixture = Fixture::new(10);
    let document = fixture.open_shared();
    let cursor = Arc::new(ViewCursor::new(5));
    let progress = Arc::new(RecordingProgress::default());
    let sink: Arc<dyn ProgressSink> = progress.clone();

    let handle =
        PrefetchScheduler::spawn(Arc::clone(&document), cursor.clone(), Some(sink), None).unwrap();
    assert!(wait_until(TIMEOUT, || handle.passes() >= 1));
    assert_eq!(loaded_pages(&document), vec![3, 4, 5, 6, 7]);

    let values = progress.values();
    assert_eq!(values.first(), Some(&0));
    assert_eq!(values.last(), Some(&100));
    assert!(values.windows(2).all(|w| w[0] <= w[1]));

    cursor.set_page(9);
    handle.signal().page_changed();
    assert!(wait_until(TIMEOUT, || {
        handle.passes() >= 2 && loaded_pages(&document) == vec![7, 8, 9, 10]
    }));
    assert_eq!(fixture.probe.max_concurrent_runs(), 1);
}

#[test]
fn spurious_wake_is_a_no_op_pass() {
    let fixture = Fixture::new(6);
    let document = fixture.open_shared();
    let cursor = Arc::new(ViewCursor::new(1));

    let handle = PrefetchScheduler::spawn(Arc::clone(&document), cursor, None, Some(1)).unwrap();
    assert!(wait_until(TIMEOUT, || handle.passes() >= 1));
    let runs = fixture.probe.run_count();

    handle.signal().scroll_changed();
    assert!(wait_until(TIMEOUT, || handle.passes() >= 2));
    assert_eq!(fixture.probe.run_count(), runs);
    assert_eq!(loaded_pages(&document), vec![1, 2]);
}

#[test]
fn stops_when_view_closes() {
    let fixture = Fixture::new(4);
    let document = fixture.open_shared();
    let cursor = Arc::new(ViewCursor::new(2));

    let handle =
        PrefetchScheduler::spawn(Arc::clone(&document), cursor.clone(), None, None).unwrap();
    assert!(wait_until(TIMEOUT, || handle.passes() >= 1));

    cursor.close();
    assert_eq!(cursor.current_page(), None);
    handle.signal().page_changed();
    assert!(wait_until(TIMEOUT, || handle.is_finished()));
    assert_eq!(handle.state(), SchedulerState::Stopped);
}

#[test]
fn stops_when_document_unloads() {
    let fixture = Fixture::new(4);
    let document = fixture.open_shared();
    let cursor = Arc::new(ViewCursor::new(2));

    let handle = PrefetchScheduler::spawn(Arc::clone(&document), cursor, None, None).unwrap();
    assert!(wait_until(TIMEOUT, || handle.passes() >= 1));

    document.unload();
    handle.signal().page_changed();
    assert!(wait_until(TIMEOUT, || handle.is_finished()));
    assert_eq!(handle.state(), SchedulerState::Stopped);
}

#[test]
fn waits_for_busy_gate_instead_of_spinning() {
    let fixture = Fixture::new(5);
    let document = fixture.open_shared();
    let cursor = Arc::new(ViewCursor::new(3));
    let gate = Arc::clone(fixture.engine.gate());

    let permit = gate
        .acquire(WaitPolicy::Wait, "test")
        .unwrap()
        .completed()
        .unwrap();
    let handle = PrefetchScheduler::spawn(Arc::clone(&document), cursor, None, None).unwrap();

    assert!(wait_until(TIMEOUT, || handle.state() == SchedulerState::Computing));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(fixture.probe.run_count(), 1);
    assert_eq!(gate.completed_operations(), 1);
    assert!(loaded_pages(&document).is_empty());

    drop(permit);
    assert!(wait_until(TIMEOUT, || handle.passes() >= 1));
    assert_eq!(loaded_pages(&document), vec![1, 2, 3, 4, 5]);
}

#[test]
fn dropping_handle_joins_scheduler() {
    let fixture = Fixture::new(3);
    let document = fixture.open_shared();
    let cursor = Arc::new(ViewCursor::new(1));

    let handle = PrefetchScheduler::spawn(Arc::clone(&document), cursor, None, None).unwrap();
    assert!(wait_until(TIMEOUT, || handle.passes() >= 1));
    drop(handle);

    assert!(!fixture.engine.gate().is_busy());
    assert_eq!(Arc::strong_count(&document), 1);
}
