//! Accounting of stream items a listener has not received yet.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast::{self, error::TryRecvError};

/// Counts the items sent on a broadcast stream that its listener did not
/// handle yet.
///
/// A shadow receiver positioned where the listener's receiver starts sees
/// every item the listener will see. Items seen by the shadow minus items
/// reported by the listener is the backlog.
pub(crate) struct StreamBacklog<M> {
    shadow: Mutex<broadcast::Receiver<M>>,
    sent: AtomicU64,
    handled: AtomicU64,
}

impl<M: Clone> StreamBacklog<M> {
    /// Starts tracking `stream`, which must not have received anything yet.
    pub fn track(stream: &broadcast::Receiver<M>) -> Self {
        loop {
            // items sent before the shadow exists are only visible to `stream`
            let unseen = stream.len();
            let shadow = stream.resubscribe();
            if stream.len() == unseen {
                return Self {
                    shadow: Mutex::new(shadow),
                    sent: AtomicU64::new(unseen as u64),
                    handled: AtomicU64::new(0),
                };
            }
        }
    }

    /// Records items the listener handled, lagged ones included.
    pub fn handled(&self, count: u64) {
        self.handled.fetch_add(count, Ordering::SeqCst);
    }

    /// Returns the number of sent items the listener did not handle yet.
    pub fn pending(&self) -> u64 {
        let mut shadow = self.shadow.lock();
        loop {
            match shadow.try_recv() {
                Ok(_) => {
                    self.sent.fetch_add(1, Ordering::SeqCst);
                }
                Err(TryRecvError::Lagged(missed)) => {
                    self.sent.fetch_add(missed, Ordering::SeqCst);
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
        self.sent
            .load(Ordering::SeqCst)
            .saturating_sub(self.handled.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn counts_items_until_handled() {
        let (sender, mut receiver) = broadcast::channel::<u32>(16);
        let backlog = StreamBacklog::track(&receiver);
        assert_eq!(backlog.pending(), 0);

        sender.send(1).unwrap();
        sender.send(2).unwrap();
        assert_eq!(backlog.pending(), 2);

        receiver.recv().await.unwrap();
        backlog.handled(1);
        assert_eq!(backlog.pending(), 1);

        receiver.recv().await.unwrap();
        backlog.handled(1);
        assert_eq!(backlog.pending(), 0);
    }

    #[tokio::test]
    async fn items_sent_before_tracking_are_counted() {
        let (sender, receiver) = broadcast::channel::<u32>(16);
        sender.send(1).unwrap();
        let backlog = StreamBacklog::track(&receiver);
        assert_eq!(backlog.pending(), 1);
    }

    #[tokio::test]
    async fn lagged_items_are_counted_on_both_sides() {
        let (sender, mut receiver) = broadcast::channel::<u32>(2);
        let backlog = StreamBacklog::track(&receiver);
        for i in 0..5 {
            sender.send(i).unwrap();
        }
        assert_eq!(backlog.pending(), 5);

        match receiver.recv().await {
            Err(broadcast::error::RecvError::Lagged(missed)) => backlog.handled(missed),
            other => panic!("expected lag, got {other:?}"),
        }
        while receiver.try_recv().is_ok() {
            backlog.handled(1);
        }
        assert_eq!(backlog.pending(), 0);
    }
}
