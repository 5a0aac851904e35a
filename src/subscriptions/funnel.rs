//! Dynamic fan-in of many channels into one.

use crossbeam_channel::{bounded, select, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{error, warn};

/// Merges any number of input channels into one output.
///
/// Inputs can be added at any time until [`Funnel::close`]. The output
/// disconnects once the funnel is closed and every input added before that
/// has been drained. Forwarding blocks on the output, so a slow consumer
/// slows every input. [`Funnel::shutdown`] abandons undelivered items and
/// waits for every forwarder.
pub struct Funnel<T> {
    /// Held until `close`; each forwarder owns a clone.
    sender: Mutex<Option<Sender<T>>>,
    output: Receiver<T>,
    /// Dropped by `shutdown`, which wakes every forwarder.
    stop: Mutex<Option<Sender<()>>>,
    stopped: Receiver<()>,
    forwarders: Mutex<Vec<JoinHandle<()>>>,
    active: Arc<AtomicUsize>,
}

impl<T: Send + 'static> Funnel<T> {
    pub fn new() -> Self {
        let (sender, output) = bounded(0);
        let (stop, stopped) = bounded(0);
        Self {
            sender: Mutex::new(Some(sender)),
            output,
            stop: Mutex::new(Some(stop)),
            stopped,
            forwarders: Mutex::new(Vec::new()),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Start forwarding `source` into the output until it disconnects.
    ///
    /// Returns `false`, dropping `source`, if the funnel is already closed.
    pub fn add_channel(&self, source: Receiver<T>) -> bool {
        let Some(sender) = self.sender.lock().as_ref().cloned() else {
            return false;
        };

        self.active.fetch_add(1, Ordering::SeqCst);
        let active = Arc::clone(&self.active);
        let stopped = self.stopped.clone();
        let spawned = thread::Builder::new()
            .name("funnel-input".into())
            .spawn(move || {
                loop {
                    let item = select! {
                        recv(source) -> item => item.ok(),
                        recv(stopped) -> _ => None,
                    };
                    let Some(item) = item else {
                        break;
                    };
                    let delivered = select! {
                        send(sender, item) -> sent => sent.is_ok(),
                        recv(stopped) -> _ => false,
                    };
                    if !delivered {
                        break;
                    }
                }
                active.fetch_sub(1, Ordering::SeqCst);
            });
        match spawned {
            Ok(handle) => {
                let mut forwarders = self.forwarders.lock();
                forwarders.retain(|h| !h.is_finished());
                forwarders.push(handle);
                true
            }
            Err(e) => {
                self.active.fetch_sub(1, Ordering::SeqCst);
                warn!(error = %e, "failed to spawn funnel forwarder");
                false
            }
        }
    }

    /// The merged stream. Clones share the same items.
    pub fn output(&self) -> Receiver<T> {
        self.output.clone()
    }

    /// Stop accepting inputs. Idempotent.
    pub fn close(&self) {
        self.sender.lock().take();
    }

    /// Close, drop whatever is still in flight, and join every forwarder.
    pub fn shutdown(&self) {
        self.close();
        self.stop.lock().take();
        let forwarders: Vec<_> = self.forwarders.lock().drain(..).collect();
        for handle in forwarders {
            if handle.join().is_err() {
                error!("funnel forwarder panicked");
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.sender.lock().is_none()
    }

    /// Inputs still being forwarded.
    pub fn active_inputs(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

impl<T: Send + 'static> Default for Funnel<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::time::Duration;

    fn source(items: impl IntoIterator<Item = u32>) -> Receiver<u32> {
        let items: Vec<u32> = items.into_iter().collect();
        let (tx, rx) = bounded(0);
        thread::spawn(move || {
            for item in items {
                tx.send(item).unwrap();
            }
        });
        rx
    }

    #[test]
    fn test_merges_inputs_added_while_consuming() {
        let funnel = Funnel::new();
        let output = funnel.output();
        assert!(funnel.add_channel(source(10..20)));
        assert!(funnel.add_channel(source(20..25)));

        let mut seen = Vec::new();
        seen.push(output.recv_timeout(Duration::from_secs(5)).unwrap());

        assert!(funnel.add_channel(source(30..37)));
        funnel.close();

        while let Ok(item) = output.recv_timeout(Duration::from_secs(5)) {
            seen.push(item);
        }

        let expected: Vec<u32> = (10..20).chain(20..25).chain(30..37).collect();
        assert_eq!(seen.len(), expected.len());
        let seen: BTreeSet<_> = seen.into_iter().collect();
        assert_eq!(seen, expected.into_iter().collect());
    }

    #[test]
    fn test_add_after_close_is_noop() {
        let funnel: Funnel<u32> = Funnel::new();
        let output = funnel.output();
        funnel.close();
        funnel.close();
        assert!(!funnel.add_channel(source(1..3)));
        assert!(output.recv_timeout(Duration::from_secs(5)).is_err());
        assert!(funnel.is_closed());
    }

    #[test]
    fn test_output_stays_open_while_inputs_run() {
        let funnel = Funnel::new();
        let output = funnel.output();
        let (tx, rx) = bounded(0);
        funnel.add_channel(rx);
        funnel.close();

        tx.send(5u32).unwrap();
        assert_eq!(output.recv_timeout(Duration::from_secs(5)).unwrap(), 5);
        assert_eq!(funnel.active_inputs(), 1);
        drop(tx);
        assert!(output.recv_timeout(Duration::from_secs(5)).is_err());
    }

    #[test]
    fn test_shutdown_releases_blocked_forwarders() {
        let funnel = Funnel::new();
        let _output = funnel.output();

        // Nobody reads the output, so this forwarder blocks on delivery.
        let (full_tx, full_rx) = bounded(4);
        for i in 0..4u32 {
            full_tx.send(i).unwrap();
        }
        assert!(funnel.add_channel(full_rx));

        // And this one waits on an input that never ends.
        let (_idle_tx, idle_rx) = bounded::<u32>(0);
        assert!(funnel.add_channel(idle_rx));
        assert_eq!(funnel.active_inputs(), 2);

        funnel.shutdown();
        assert_eq!(funnel.active_inputs(), 0);
        assert!(funnel.is_closed());
        assert!(!funnel.add_channel(source(1..3)));
    }
}
