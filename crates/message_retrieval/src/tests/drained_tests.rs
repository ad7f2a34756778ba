use super::*;

use std::sync::atomic::AtomicUsize;

fn counting_listener() -> (Arc<AtomicUsize>, DrainedListener) {
    let count = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&count);
    let listener: DrainedListener = Arc::new(move || {
        seen.fetch_add(1, Ordering::SeqCst);
    });
    (count, listener)
}

#[test]
fn listeners_fire_once_on_rising_edge() {
    let flag = DecryptionDrainedFlag::new();
    let (count, listener) = counting_listener();
    flag.add_listener(listener);

    assert!(!flag.is_drained());
    assert!(flag.mark_drained());
    assert!(!flag.mark_drained());
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert!(flag.is_drained());
}

#[test]
fn reset_rearms_listeners() {
    let flag = DecryptionDrainedFlag::new();
    let (count, listener) = counting_listener();
    flag.add_listener(listener);

    flag.mark_drained();
    flag.reset();
    assert!(!flag.is_drained());
    flag.mark_drained();
    assert_eq!(count.load(Ordering::SeqCst), 2);
}

#[test]
fn late_listener_fires_immediately_when_already_drained() {
    let flag = DecryptionDrainedFlag::new();
    flag.mark_drained();

    let (count, listener) = counting_listener();
    flag.add_listener(listener);
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[test]
fn removed_listener_is_not_fired() {
    let flag = DecryptionDrainedFlag::new();
    let (kept_count, kept) = counting_listener();
    let (removed_count, removed) = counting_listener();
    flag.add_listener(kept);
    let id = flag.add_listener(removed);

    assert!(flag.remove_listener(id));
    assert!(!flag.remove_listener(id));
    flag.mark_drained();

    assert_eq!(kept_count.load(Ordering::SeqCst), 1);
    assert_eq!(removed_count.load(Ordering::SeqCst), 0);
}

#[test]
fn listener_may_register_another_listener_while_firing() {
    let flag = Arc::new(DecryptionDrainedFlag::new());
    let (inner_count, inner_listener) = counting_listener();
    let registrar = Arc::clone(&flag);
    flag.add_listener(Arc::new(move || {
        registrar.add_listener(Arc::clone(&inner_listener));
    }));

    flag.mark_drained();
    // Added while drained, so it fired on registration.
    assert_eq!(inner_count.load(Ordering::SeqCst), 1);
}
