//! Per-session outbound mailbox
//!
//! Broadcast producers enqueue encoded wire lines; the session's writer
//! task drains them. The queue is bounded at [`MAILBOX_CAPACITY`]: on
//! overflow the oldest line is dropped and the slow-consumer counter is
//! bumped. Enqueueing never blocks, so one stalled receiver cannot hold up
//! a broadcast.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

/// Maximum pending lines per session
pub const MAILBOX_CAPACITY: usize = 256;

#[derive(Debug)]
struct MailboxInner {
    queue: Mutex<VecDeque<String>>,
    notify: Notify,
    dropped: AtomicU64,
    closed: AtomicBool,
}

/// Bounded drop-oldest outbound queue
#[derive(Debug, Clone)]
pub struct Mailbox {
    inner: Arc<MailboxInner>,
}

impl Mailbox {
    /// Create an empty mailbox
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MailboxInner {
                queue: Mutex::new(VecDeque::with_capacity(MAILBOX_CAPACITY)),
                notify: Notify::new(),
                dropped: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Enqueue a line, dropping the oldest pending line at capacity
    pub fn push(&self, line: String) {
        if self.inner.closed.load(Ordering::Acquire) {
            return;
        }
        {
            let mut queue = self.inner.queue.lock().expect("mailbox lock poisoned");
            if queue.len() == MAILBOX_CAPACITY {
                queue.pop_front();
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(line);
        }
        self.inner.notify.notify_one();
    }

    /// Wait for the next line; `None` once closed and drained
    pub async fn recv(&self) -> Option<String> {
        loop {
            {
                let mut queue = self.inner.queue.lock().expect("mailbox lock poisoned");
                if let Some(line) = queue.pop_front() {
                    return Some(line);
                }
                if self.inner.closed.load(Ordering::Acquire) {
                    return None;
                }
            }
            self.inner.notify.notified().await;
        }
    }

    /// Close the mailbox; pending lines remain readable
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.notify.notify_one();
    }

    /// Lines dropped because the consumer was too slow
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}
