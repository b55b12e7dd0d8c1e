//! Loom model-checking for the spin-lock word.
//!
//! Run with: `RUSTFLAGS="--cfg loom" cargo test -p shmap-primitives --release`

use loom::sync::atomic::{AtomicU32, Ordering};
use loom::sync::Arc;

use crate::spin::SpinWord;

#[test]
fn spin_word_is_mutually_exclusive() {
    loom::model(|| {
        let words = Arc::new((AtomicU32::new(0), AtomicU32::new(0)));
        let inside = Arc::new(AtomicU32::new(0));

        let handles: Vec<_> = (1..=2u32)
            .map(|pid| {
                let words = words.clone();
                let inside = inside.clone();
                loom::thread::spawn(move || {
                    let spin = SpinWord::new(&words.0, &words.1);
                    while spin.try_lock(pid).is_err() {
                        loom::thread::yield_now();
                    }
                    assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                    inside.fetch_sub(1, Ordering::SeqCst);
                    assert!(spin.unlock(pid));
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(words.0.load(Ordering::SeqCst), 0);
    });
}

#[test]
fn force_lock_always_leaves_one_holder() {
    loom::model(|| {
        let words = Arc::new((AtomicU32::new(0), AtomicU32::new(0)));

        let w1 = words.clone();
        let t1 = loom::thread::spawn(move || {
            let spin = SpinWord::new(&w1.0, &w1.1);
            let _ = spin.try_lock(1);
        });

        let w2 = words.clone();
        let t2 = loom::thread::spawn(move || {
            let spin = SpinWord::new(&w2.0, &w2.1);
            spin.force_lock(2);
        });

        t1.join().unwrap();
        t2.join().unwrap();

        let spin = SpinWord::new(&words.0, &words.1);
        assert!(spin.holder() == 1 || spin.holder() == 2);
    });
}
