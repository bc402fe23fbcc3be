use hybridprof::EngineConfig;
use hybridprof::index::{CodeOwner, CodeRange, CodeRangeIndex, MethodId, WorkQueue};
use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

const WRITERS: usize = 4;
const PER_WRITER: usize = 200;
const BASE: usize = 0x1000_0000;
const SIZE: usize = 0x100;

/// Writer `w` owns a disjoint run of methods; gaps of SIZE separate them.
fn range_for(w: usize, i: usize) -> CodeRange {
    let n = w * PER_WRITER + i;
    CodeRange::with_size(BASE + n * SIZE * 2, SIZE, MethodId(n as u64 + 1)).unwrap()
}

#[test]
fn test_concurrent_writers_and_readers() {
    let index = CodeRangeIndex::new(&EngineConfig::default().with_page_shift(12)).unwrap();
    let done = AtomicBool::new(false);

    thread::scope(|s| {
        for w in 0..WRITERS {
            let index = &index;
            s.spawn(move || {
                for i in 0..PER_WRITER {
                    index.register_ranges(vec![range_for(w, i)]);
                }
            });
        }

        for _ in 0..3 {
            let index = &index;
            let done = &done;
            s.spawn(move || {
                while !done.load(Ordering::Relaxed) {
                    for n in 0..WRITERS * PER_WRITER {
                        let inside = BASE + n * SIZE * 2 + 0x10;
                        let gap = BASE + n * SIZE * 2 + SIZE + 0x10;

                        // A hit must name the right method; a miss is allowed
                        if let Some(owner) = index.lookup(inside) {
                            assert_eq!(owner, CodeOwner::Method(MethodId(n as u64 + 1)));
                        }
                        assert_eq!(index.lookup(gap), None);
                    }
                }
            });
        }

        // Writers finish first, then the readers are released
        s.spawn(|| {
            while index.pending_work() > 0 || index.range_count() < WRITERS * PER_WRITER {
                thread::yield_now();
                index.flush();
            }
            done.store(true, Ordering::Relaxed);
        });
    });

    index.flush();
    assert_eq!(index.range_count(), WRITERS * PER_WRITER);
    for w in 0..WRITERS {
        for i in 0..PER_WRITER {
            let range = range_for(w, i);
            assert_eq!(index.lookup(range.start()), Some(CodeOwner::Method(range.method())));
            assert_eq!(
                index.lookup(range.end() - 1),
                Some(CodeOwner::Method(range.method()))
            );
            assert_eq!(index.lookup(range.end()), None);
        }
    }
}

#[test]
fn test_flush_makes_prior_registrations_visible() {
    let index = CodeRangeIndex::new(&EngineConfig::default()).unwrap();
    for batch in 0..10 {
        let ranges = (0..50)
            .map(|i| range_for(batch, i))
            .collect::<Vec<_>>();
        index.register_ranges(ranges);
    }
    index.flush();

    assert_eq!(index.pending_work(), 0);
    assert_eq!(index.range_count(), 500);
    assert!(index.is_managed(range_for(9, 49).start()));
}

#[test]
fn test_queue_delivers_each_item_once() {
    let queue = WorkQueue::new();
    let seen = Mutex::new(Vec::new());
    let producing = AtomicBool::new(true);

    thread::scope(|s| {
        let producers: Vec<_> = (0..4)
            .map(|p| {
                let queue = &queue;
                s.spawn(move || {
                    for i in 0..1000u64 {
                        queue.push(p * 1000 + i);
                    }
                })
            })
            .collect();

        s.spawn(|| {
            loop {
                let finished = !producing.load(Ordering::Acquire);
                seen.lock().unwrap().extend(queue.take_all());
                if finished {
                    break;
                }
                thread::yield_now();
            }
        });

        for producer in producers {
            producer.join().unwrap();
        }
        producing.store(false, Ordering::Release);
    });

    let seen = seen.into_inner().unwrap();
    assert_eq!(seen.len(), 4000);
    let unique: HashSet<_> = seen.iter().copied().collect();
    assert_eq!(unique.len(), 4000);

    // Each producer's items stay in push order
    for p in 0..4u64 {
        let own: Vec<_> = seen.iter().filter(|v| **v / 1000 == p).collect();
        assert!(own.windows(2).all(|w| w[0] < w[1]));
    }
}
