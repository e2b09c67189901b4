use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use crate::error::{Error, InstanceFailure, Result};

const SLEEP_SLICE: Duration = Duration::from_millis(100);

/// Shared cancellation flag threaded through every blocking call.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    /// The shared flag, for handlers that set it from outside the engine.
    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.flag)
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::cancelled());
        }
        Ok(())
    }

    /// Sleep for `dur`, waking early (with a cancellation error) if cancelled.
    pub fn sleep(&self, dur: Duration) -> Result<()> {
        let deadline = Instant::now() + dur;
        loop {
            self.check()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            std::thread::sleep((deadline - now).min(SLEEP_SLICE));
        }
    }
}

/// A finished fan-out job, in completion order.
#[derive(Debug)]
pub struct Completed<R> {
    pub index: usize,
    pub result: Result<R>,
}

/// Run `job` once per item on scoped threads, at most `max_parallel` at a time
/// (0 = all at once). Results come back in completion order; a panicking job
/// is reported as an error rather than tearing down the batch.
pub fn fan_out<T, R, F>(items: Vec<T>, max_parallel: usize, job: F) -> Vec<Completed<R>>
where
    T: Send,
    R: Send,
    F: Fn(usize, T) -> Result<R> + Sync,
{
    let total = items.len();
    let limit = if max_parallel == 0 {
        total.max(1)
    } else {
        max_parallel
    };
    let job = &job;
    let mut done = Vec::with_capacity(total);

    std::thread::scope(|scope| {
        let (tx, rx) = mpsc::channel::<(usize, Result<R>)>();
        let mut pending = items.into_iter().enumerate();
        let mut running = HashMap::new();

        loop {
            while running.len() < limit {
                let Some((index, item)) = pending.next() else {
                    break;
                };
                let tx = tx.clone();
                let handle = scope.spawn(move || {
                    let result = catch_unwind(AssertUnwindSafe(|| job(index, item)))
                        .unwrap_or_else(|panic| {
                            Err(Error::msg(format!("worker panicked: {}", panic_text(&panic))))
                        });
                    let _ = tx.send((index, result));
                });
                running.insert(index, handle);
            }

            if running.is_empty() {
                break;
            }

            let Ok((index, result)) = rx.recv() else {
                break;
            };
            if let Some(handle) = running.remove(&index) {
                let _ = handle.join();
            }
            done.push(Completed { index, result });
        }
    });

    done
}

fn panic_text(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        return (*s).to_string();
    }
    if let Some(s) = panic.downcast_ref::<String>() {
        return s.clone();
    }
    "unknown panic".into()
}

/// Collect the failures of a fan-out phase, labelling each with its instance.
/// Cancellation wins over per-instance failures.
pub fn collect_failures<R>(
    done: Vec<Completed<R>>,
    label: impl Fn(usize) -> (String, Option<String>),
) -> Result<Vec<(usize, R)>> {
    let mut ok = Vec::new();
    let mut failures = Vec::new();
    let mut cancelled = false;
    for c in done {
        match c.result {
            Ok(v) => ok.push((c.index, v)),
            Err(e) if e.is_cancelled() => cancelled = true,
            Err(e) => {
                let (address, name) = label(c.index);
                failures.push((
                    c.index,
                    InstanceFailure {
                        address,
                        name,
                        cause: e.to_string(),
                    },
                ));
            }
        }
    }
    if cancelled {
        return Err(Error::cancelled());
    }
    if !failures.is_empty() {
        // Report in roster order so repeated runs read the same way.
        failures.sort_by_key(|(idx, _)| *idx);
        let failures: Vec<InstanceFailure> = failures.into_iter().map(|(_, f)| f).collect();
        return Err(Error::aggregate(&failures));
    }
    Ok(ok)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn raising_the_shared_flag_cancels_every_clone() {
        let token = CancelToken::new();
        let worker = token.clone();
        let flag = token.flag();
        assert!(!worker.is_cancelled());

        // What a registered signal handler does.
        flag.store(true, Ordering::SeqCst);
        assert!(worker.is_cancelled());
        assert!(worker.check().unwrap_err().is_cancelled());
        assert!(
            worker
                .sleep(Duration::from_secs(30))
                .unwrap_err()
                .is_cancelled()
        );
    }

    #[test]
    fn fan_out_respects_parallel_limit() {
        let live = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        let done = fan_out((0..8).collect::<Vec<_>>(), 3, |_, n: i32| {
            let now = live.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(20));
            live.fetch_sub(1, Ordering::SeqCst);
            Ok(n * 2)
        });
        assert_eq!(done.len(), 8);
        assert!(peak.load(Ordering::SeqCst) <= 3);
        let mut values: Vec<i32> = done.into_iter().map(|c| c.result.expect("ok")).collect();
        values.sort();
        assert_eq!(values, vec![0, 2, 4, 6, 8, 10, 12, 14]);
    }

    #[test]
    fn fan_out_reports_panics_as_errors() {
        let done = fan_out(vec![1, 2], 0, |_, n: i32| {
            if n == 2 {
                panic!("bad instance");
            }
            Ok(n)
        });
        let failed: Vec<_> = done.iter().filter(|c| c.result.is_err()).collect();
        assert_eq!(failed.len(), 1);
        assert!(
            failed[0]
                .result
                .as_ref()
                .unwrap_err()
                .to_string()
                .contains("bad instance")
        );
    }

    #[test]
    fn collect_failures_orders_by_index() {
        let done = vec![
            Completed::<()> {
                index: 3,
                result: Err(Error::msg("late")),
            },
            Completed {
                index: 0,
                result: Ok(()),
            },
            Completed {
                index: 1,
                result: Err(Error::msg("early")),
            },
        ];
        let err = collect_failures(done, |i| (format!("10.0.0.{i}"), None)).unwrap_err();
        assert_eq!(
            err.to_string(),
            "2 instance(s) failed:\n- [10.0.0.1] early\n- [10.0.0.3] late"
        );
    }

    #[test]
    fn cancelled_sleep_returns_early() {
        let token = CancelToken::new();
        token.cancel();
        let start = Instant::now();
        let err = token.sleep(Duration::from_secs(5)).unwrap_err();
        assert!(err.is_cancelled());
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
