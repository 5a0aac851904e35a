//! Polling subscriptions: turn a paged query over a cursor into a stream of batches.

use crate::context::Context;
use crate::error::{Error, Result};
use crossbeam_channel::{after, bounded, never, select, Receiver, Sender};
use std::marker::PhantomData;
use std::ops::ControlFlow;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, trace, warn};

/// A paged query: results strictly after `cursor`, at most `limit` of them,
/// plus the cursor to resume from.
///
/// Implementations must never return rows at or below the cursor. Returning
/// a fatal error (see [`Error::is_fatal`]) tears the subscription down; any
/// other error is retried from the same cursor on the next wake-up.
pub trait PollableQuery<V, C>: Send {
    fn query(&mut self, cursor: &C, limit: usize) -> Result<(Vec<V>, C)>;
}

impl<V, C, F> PollableQuery<V, C> for F
where
    F: FnMut(&C, usize) -> Result<(Vec<V>, C)> + Send,
{
    fn query(&mut self, cursor: &C, limit: usize) -> Result<(Vec<V>, C)> {
        self(cursor, limit)
    }
}

/// When and how much to poll.
#[derive(Clone, Debug)]
pub struct PollingOptions {
    /// Fallback timer between polls.
    pub interval: Duration,
    /// Low-latency wake-up; each message triggers a poll.
    pub notifier: Option<Receiver<()>>,
    pub page_size: usize,
}

impl PollingOptions {
    pub fn new(interval: Duration, page_size: usize) -> Self {
        Self {
            interval,
            notifier: None,
            page_size,
        }
    }

    pub fn with_notifier(mut self, notifier: Receiver<()>) -> Self {
        self.notifier = Some(notifier);
        self
    }
}

#[derive(Clone, Copy, Debug)]
enum Wake {
    Cancelled,
    Notified,
    NotifierClosed,
    Timer,
}

/// A background loop that polls `query` and emits each non-empty page.
///
/// The output channel has no buffer: a slow consumer slows the polling.
/// It closes when the context is cancelled or the query fails fatally.
pub struct PollingSubscription<V, C, Q> {
    ctx: Context,
    name: String,
    query: Q,
    cursor: C,
    options: PollingOptions,
    _values: PhantomData<fn() -> V>,
}

impl<V, C, Q> PollingSubscription<V, C, Q>
where
    V: Send + 'static,
    C: Send + 'static,
    Q: PollableQuery<V, C> + 'static,
{
    pub fn new(
        ctx: Context,
        name: impl Into<String>,
        query: Q,
        cursor: C,
        options: PollingOptions,
    ) -> Self {
        Self {
            ctx,
            name: name.into(),
            query,
            cursor,
            options,
            _values: PhantomData,
        }
    }

    /// Spawn the polling loop. Polls once immediately.
    pub fn start(self) -> Result<Receiver<Vec<V>>> {
        if self.options.page_size == 0 {
            return Err(Error::InvalidArgument("page size must be positive".into()));
        }
        let (updates, output) = bounded(0);
        thread::Builder::new()
            .name(format!("poll-{}", self.name))
            .spawn(move || self.run(updates))?;
        Ok(output)
    }

    fn run(mut self, updates: Sender<Vec<V>>) {
        let done = self.ctx.done().clone();
        let mut notifier = self.options.notifier.take().unwrap_or_else(never);

        if self.poll(&updates, "startup").is_continue() {
            loop {
                let wake = select! {
                    recv(done) -> _ => Wake::Cancelled,
                    recv(notifier) -> msg => match msg {
                        Ok(()) => Wake::Notified,
                        Err(_) => Wake::NotifierClosed,
                    },
                    recv(after(self.options.interval)) -> _ => Wake::Timer,
                };

                let flow = match wake {
                    Wake::Cancelled => break,
                    Wake::NotifierClosed => {
                        notifier = never();
                        continue;
                    }
                    Wake::Notified => self.poll(&updates, "notification"),
                    Wake::Timer => self.poll(&updates, "timer"),
                };
                if flow.is_break() {
                    break;
                }
            }
        }
        debug!(name = %self.name, "polling subscription stopped");
    }

    /// Page until a short page. `Break` means the subscription is over.
    fn poll(&mut self, updates: &Sender<Vec<V>>, trigger: &'static str) -> ControlFlow<()> {
        let mut total = 0;
        loop {
            if self.ctx.is_done() {
                return ControlFlow::Break(());
            }

            let (results, next) = match self.query.query(&self.cursor, self.options.page_size) {
                Ok(page) => page,
                Err(e) if e.is_fatal() => {
                    error!(name = %self.name, error = %e, "polling query failed fatally; closing subscription");
                    return ControlFlow::Break(());
                }
                Err(e) => {
                    // Cursor untouched; the next wake-up retries from here.
                    warn!(name = %self.name, trigger, error = %e, "polling query failed");
                    return ControlFlow::Continue(());
                }
            };

            if results.is_empty() {
                trace!(name = %self.name, trigger, total, "caught up");
                return ControlFlow::Continue(());
            }

            let full = results.len() >= self.options.page_size;
            total += results.len();
            self.cursor = next;

            let delivered = select! {
                send(updates, results) -> sent => sent.is_ok(),
                recv(self.ctx.done()) -> _ => false,
            };
            if !delivered {
                return ControlFlow::Break(());
            }
            if !full {
                return ControlFlow::Continue(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Scalar-cursor query over a shared list of ids.
    fn id_query(log: Arc<Mutex<Vec<u64>>>) -> impl FnMut(&u64, usize) -> Result<(Vec<u64>, u64)> + Send {
        move |last: &u64, limit: usize| {
            let ids: Vec<u64> = log
                .lock()
                .iter()
                .copied()
                .filter(|id| id > last)
                .take(limit)
                .collect();
            let next = ids.last().copied().unwrap_or(*last);
            Ok((ids, next))
        }
    }

    fn recv_batch(rx: &Receiver<Vec<u64>>) -> Vec<u64> {
        rx.recv_timeout(Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_pages_until_short_page() {
        let log = Arc::new(Mutex::new((1..=5).collect::<Vec<u64>>()));
        let ctx = Context::background();
        let rx = PollingSubscription::new(
            ctx.clone(),
            "ids",
            id_query(Arc::clone(&log)),
            0u64,
            PollingOptions::new(Duration::from_secs(60), 2),
        )
        .start()
        .unwrap();

        assert_eq!(recv_batch(&rx), vec![1, 2]);
        assert_eq!(recv_batch(&rx), vec![3, 4]);
        assert_eq!(recv_batch(&rx), vec![5]);
        ctx.cancel();
    }

    #[test]
    fn test_notifier_wakes_poll() {
        let log = Arc::new(Mutex::new(vec![1u64]));
        let (notify, notifier) = bounded(1);
        let ctx = Context::background();
        let rx = PollingSubscription::new(
            ctx.clone(),
            "ids",
            id_query(Arc::clone(&log)),
            0u64,
            PollingOptions::new(Duration::from_secs(60), 10).with_notifier(notifier),
        )
        .start()
        .unwrap();

        assert_eq!(recv_batch(&rx), vec![1]);
        log.lock().push(2);
        notify.send(()).unwrap();
        assert_eq!(recv_batch(&rx), vec![2]);
        ctx.cancel();
    }

    #[test]
    fn test_transient_error_keeps_cursor() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let query = move |last: &u64, _limit: usize| -> Result<(Vec<u64>, u64)> {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(Error::Transient("hiccup".into()));
            }
            if *last == 0 {
                Ok((vec![7], 7))
            } else {
                Ok((vec![], *last))
            }
        };

        let ctx = Context::background();
        let rx = PollingSubscription::new(
            ctx.clone(),
            "flaky",
            query,
            0u64,
            PollingOptions::new(Duration::from_millis(10), 10),
        )
        .start()
        .unwrap();

        assert_eq!(recv_batch(&rx), vec![7]);
        assert!(calls.load(Ordering::SeqCst) >= 2);
        ctx.cancel();
    }

    #[test]
    fn test_fatal_error_closes_output() {
        let query = |_: &u64, _: usize| -> Result<(Vec<u64>, u64)> {
            Err(Error::InvariantViolation("sequence went backwards".into()))
        };
        let rx = PollingSubscription::new(
            Context::background(),
            "broken",
            query,
            0u64,
            PollingOptions::new(Duration::from_millis(10), 10),
        )
        .start()
        .unwrap();

        assert!(rx.recv_timeout(Duration::from_secs(5)).is_err());
    }

    #[test]
    fn test_cancel_closes_output() {
        let ctx = Context::background();
        let rx = PollingSubscription::new(
            ctx.clone(),
            "idle",
            id_query(Arc::new(Mutex::new(Vec::new()))),
            0u64,
            PollingOptions::new(Duration::from_millis(10), 10),
        )
        .start()
        .unwrap();

        ctx.cancel();
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_err());
    }

    #[test]
    fn test_zero_page_size_rejected() {
        let result = PollingSubscription::new(
            Context::background(),
            "bad",
            id_query(Arc::new(Mutex::new(Vec::new()))),
            0u64,
            PollingOptions::new(Duration::from_millis(10), 0),
        )
        .start();
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }
}
