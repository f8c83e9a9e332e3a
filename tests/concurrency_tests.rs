use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use ghostview::render::{Outcome, RenderError, WaitPolicy};
use ghostview::test_utils::Fixture;

#[test]
fn concurrent_loads_never_overlap_in_engine() {
    let fixture = Fixture::new(16);
    let document = fixture.open_shared();
    fixture.probe.set_page_delay(Duration::from_millis(2));

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let document = Arc::clone(&document);
            thread::spawn(move || {
                let start = i * 2 + 1;
                document.load_high_res(WaitPolicy::Wait, start, start + 1)
            })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap().unwrap(), Outcome::Completed(()));
    }

    assert_eq!(fixture.probe.max_concurrent_runs(), 1);
    assert_eq!(fixture.engine.gate().completed_operations(), 9);
    assert!((1..=16).all(|page| document.is_high_res_loaded(page)));
    assert!(!fixture.engine.gate().is_busy());
}

#[test]
fn skipping_callers_never_block_and_one_wins() {
    let fixture = Fixture::new(4);
    let document = fixture.open_shared();
    fixture.probe.set_page_delay(Duration::from_millis(20));

    let completed = Arc::new(AtomicUsize::new(0));
    let skipped = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..6)
        .map(|_| {
            let document = Arc::clone(&document);
            let completed = Arc::clone(&completed);
            let skipped = Arc::clone(&skipped);
            thread::spawn(move || {
                match document.load_high_res(WaitPolicy::ReturnIfBusy, 1, 4) {
                    Ok(Outcome::Completed(())) => completed.fetch_add(1, Ordering::SeqCst),
                    Ok(Outcome::InProgress) => skipped.fetch_add(1, Ordering::SeqCst),
                    Err(e) => panic!("unexpected error: {e}"),
                };
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let completed = completed.load(Ordering::SeqCst);
    assert!(completed >= 1);
    assert_eq!(completed + skipped.load(Ordering::SeqCst), 6);
    assert_eq!(fixture.probe.max_concurrent_runs(), 1);
}

#[test]
fn throwing_callers_see_operation_in_progress() {
    let fixture = Fixture::new(2);
    let document = fixture.open_shared();
    fixture.probe.set_page_delay(Duration::from_millis(50));

    let loader = {
        let document = Arc::clone(&document);
        thread::spawn(move || document.load_high_res(WaitPolicy::Wait, 1, 2))
    };
    let gate = Arc::clone(fixture.engine.gate());
    assert!(ghostview::test_utils::wait_until(
        Duration::from_secs(5),
        || gate.is_busy()
    ));

    let result = document.load_high_res_page(WaitPolicy::ThrowIfBusy, 1);
    assert!(matches!(
        result,
        Err(RenderError::OperationInProgress { ref caller }) if caller == "Document::load_high_res"
    ));

    loader.join().unwrap().unwrap();
    assert!(gate.wait_idle_timeout(Duration::from_secs(5)));
}
