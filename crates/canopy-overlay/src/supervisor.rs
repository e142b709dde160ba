//! Timeout supervisor - abandons attempts that never connect.
//!
//! Every unconfirmed connection (the parent attempt or a candidate attempt)
//! is armed with a single-shot timer when it is opened. A successful connect
//! cancels it. When a timer elapses it posts [`Input::Timeout`] to the node's
//! inbox; the node then calls [`expire`](TimeoutSupervisor::expire), which
//! only reports the attempt as expired if it is still armed. A connect event
//! that overtakes an already-posted expiry therefore wins.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::trace;

use crate::node::Input;
use crate::types::ChannelId;

/// Per-attempt timers for one node.
#[derive(Debug)]
pub struct TimeoutSupervisor {
    timeout: Duration,
    armed: HashMap<ChannelId, AbortHandle>,
    inbox: mpsc::UnboundedSender<Input>,
}

impl TimeoutSupervisor {
    pub(crate) fn new(timeout: Duration, inbox: mpsc::UnboundedSender<Input>) -> Self {
        Self {
            timeout,
            armed: HashMap::new(),
            inbox,
        }
    }

    /// Start the timer for `channel`. Re-arming restarts it.
    pub fn arm(&mut self, channel: ChannelId) {
        let inbox = self.inbox.clone();
        let timeout = self.timeout;
        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = inbox.send(Input::Timeout(channel));
        });
        if let Some(previous) = self.armed.insert(channel, task.abort_handle()) {
            previous.abort();
        }
        trace!(%channel, ?timeout, "timer armed");
    }

    /// Stop the timer for `channel`. Returns whether it was armed.
    pub fn cancel(&mut self, channel: ChannelId) -> bool {
        match self.armed.remove(&channel) {
            Some(handle) => {
                handle.abort();
                trace!(%channel, "timer cancelled");
                true
            }
            None => false,
        }
    }

    /// Consume an elapsed timer. Returns `false` if it was cancelled meanwhile.
    pub fn expire(&mut self, channel: ChannelId) -> bool {
        self.armed.remove(&channel).is_some()
    }

    /// Whether `channel` has a pending timer.
    #[cfg(test)]
    pub fn is_armed(&self, channel: ChannelId) -> bool {
        self.armed.contains_key(&channel)
    }

    /// Number of pending timers.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.armed.len()
    }

    /// Whether no timer is pending.
    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.armed.is_empty()
    }

    /// Cancel every pending timer.
    pub fn clear(&mut self) {
        for (_, handle) in self.armed.drain() {
            handle.abort();
        }
    }
}

impl Drop for TimeoutSupervisor {
    fn drop(&mut self) {
        self.clear();
    }
}
