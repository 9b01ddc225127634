use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use tokio::task::JoinSet;

use crate::budget::Deadline;

/// Run `work` over `items` with at most `concurrency` workers.
///
/// Workers claim indices from a shared cursor, so every item is processed at
/// most once and a slow item only holds up its own worker. Each result lands
/// in the slot of its index. When the deadline fires, in-flight work is
/// dropped and every slot without a result falls back to its input item.
/// The output is always index-aligned with `items`.
pub async fn run_pool<T, F, Fut>(items: Vec<T>, concurrency: usize, deadline: &Deadline, work: F) -> Vec<T>
where
    T: Clone + Send + Sync + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = T> + Send + 'static,
{
    let n = items.len();
    if n == 0 {
        return items;
    }

    let workers = concurrency.max(1).min(n);
    let items = Arc::new(items);
    let slots: Arc<Vec<OnceLock<T>>> = Arc::new((0..n).map(|_| OnceLock::new()).collect());
    let cursor = Arc::new(AtomicUsize::new(0));
    let work = Arc::new(work);

    let mut set = JoinSet::new();
    for worker_id in 0..workers {
        let items = items.clone();
        let slots = slots.clone();
        let cursor = cursor.clone();
        let work = work.clone();
        let deadline = deadline.clone();

        set.spawn(async move {
            let mut done = 0usize;
            loop {
                if deadline.is_expired() {
                    break;
                }
                let idx = cursor.fetch_add(1, Ordering::SeqCst);
                let Some(item) = items.get(idx) else {
                    break;
                };
                match deadline.run(work(item.clone())).await {
                    Ok(out) => {
                        let _ = slots[idx].set(out);
                        done += 1;
                    }
                    Err(_) => {
                        tracing::debug!(worker_id, idx, "deadline hit mid-item");
                        deadline.cancel();
                        break;
                    }
                }
            }
            done
        });
    }

    let mut completed = 0usize;
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(done) => completed += done,
            Err(e) => tracing::error!(error = %e, "pool worker panicked"),
        }
    }
    tracing::info!(total = n, completed, workers, "pool finished");

    slots
        .iter()
        .zip(items.iter())
        .map(|(slot, original)| slot.get().cloned().unwrap_or_else(|| original.clone()))
        .collect()
}
