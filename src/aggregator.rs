//! Completion aggregator for fan-out publishes (C7).
//!
//! Grounded in `original_source/src/pubcontrol.py`, which defers to a small
//! callback-handler helper to turn N independent per-client results into one
//! callback invocation: success is the AND of every branch, the message is
//! the first failure's, and the combined callback fires exactly once no
//! matter how the branches interleave.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::http_publisher::Callback;

pub struct Aggregator {
    remaining: AtomicUsize,
    success: AtomicBool,
    message: Mutex<Option<String>>,
    callback: Mutex<Option<Callback>>,
}

impl Aggregator {
    /// `count` is the number of branches that will each call [`Self::complete`]
    /// exactly once. `count == 0` invokes `callback` immediately with success.
    pub fn new(count: usize, callback: Option<Callback>) -> std::sync::Arc<Self> {
        let aggregator = std::sync::Arc::new(Aggregator {
            remaining: AtomicUsize::new(count),
            success: AtomicBool::new(true),
            message: Mutex::new(None),
            callback: Mutex::new(callback),
        });
        if count == 0 {
            aggregator.fire();
        }
        aggregator
    }

    /// Record one branch's outcome. Once every branch has reported, the
    /// callback fires with the AND of all successes and the first failure
    /// message seen (empty string if every branch succeeded).
    pub fn complete(&self, success: bool, message: String) {
        if !success {
            self.success.store(false, Ordering::SeqCst);
            let mut guard = self.message.lock().expect("aggregator message mutex poisoned");
            if guard.is_none() {
                *guard = Some(message);
            }
        }

        if self.remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.fire();
        }
    }

    fn fire(&self) {
        let callback = self.callback.lock().expect("aggregator callback mutex poisoned").take();
        if let Some(callback) = callback {
            let success = self.success.load(Ordering::SeqCst);
            let message = self
                .message
                .lock()
                .expect("aggregator message mutex poisoned")
                .clone()
                .unwrap_or_default();
            callback(success, message);
        }
    }
}
