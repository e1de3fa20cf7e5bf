//! Concurrent work pool for import items.
//!
//! Workers pull titles off a shared queue until it drains. A failed item
//! is logged and the pool moves on; one bad page must not sink the run.

use std::collections::VecDeque;
use std::fmt::Display;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use anyhow::Result;
use log::{error, info, warn};

/// Runs `work` over every item with `num_workers` threads. Each worker
/// builds its own context once via `setup` (an API client is not shared
/// across threads); a worker whose setup fails is lost but the others
/// still drain the queue.
pub fn process_concurrently<T, C, S, F>(
    items: Vec<T>,
    name: &str,
    num_workers: usize,
    setup: S,
    work: F,
) where
    T: Send + Display,
    S: Fn() -> Result<C> + Send + Sync,
    F: Fn(&mut C, &T) -> Result<()> + Send + Sync,
{
    let total = items.len();
    if total == 0 {
        return;
    }
    let queue = Mutex::new(VecDeque::from(items));
    let completed = AtomicUsize::new(0);

    thread::scope(|scope| {
        for _ in 0..num_workers.max(1) {
            scope.spawn(|| {
                let mut context = match setup() {
                    Ok(context) => context,
                    Err(setup_error) => {
                        error!("worker setup failed, dropping worker: {setup_error:#}");
                        return;
                    }
                };
                loop {
                    let item = {
                        let mut queue = queue.lock().expect("work queue lock poisoned");
                        queue.pop_front()
                    };
                    let Some(item) = item else {
                        break;
                    };
                    if let Err(work_error) = work(&mut context, &item) {
                        warn!("unable to process {item}: {work_error:#}");
                    }
                    let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                    info!(
                        "{} {name} left to process ({}% done)",
                        total - done,
                        100 * done / total
                    );
                }
            });
        }
    });
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::bail;

    use super::process_concurrently;

    #[test]
    fn all_items_are_processed_across_workers() {
        let seen = Mutex::new(Vec::new());
        let items: Vec<String> = (0..25).map(|n| format!("item-{n}")).collect();
        process_concurrently(
            items,
            "items",
            4,
            || Ok(()),
            |_context, item: &String| {
                seen.lock().expect("seen lock").push(item.clone());
                Ok(())
            },
        );
        let mut seen = seen.into_inner().expect("seen lock");
        seen.sort();
        assert_eq!(seen.len(), 25);
        assert_eq!(seen[0], "item-0");
    }

    #[test]
    fn a_failing_item_does_not_stop_the_pool() {
        let processed = AtomicUsize::new(0);
        let items: Vec<String> = (0..10).map(|n| format!("page-{n}")).collect();
        process_concurrently(
            items,
            "pages",
            2,
            || Ok(()),
            |_context, item: &String| {
                if item == "page-3" {
                    bail!("synthetic failure");
                }
                processed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        );
        assert_eq!(processed.load(Ordering::SeqCst), 9);
    }

    #[test]
    fn empty_queue_is_a_no_op() {
        process_concurrently(
            Vec::<String>::new(),
            "nothing",
            3,
            || Ok(()),
            |_context: &mut (), _item: &String| Ok(()),
        );
    }
}
