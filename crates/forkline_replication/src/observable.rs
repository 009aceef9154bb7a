//! Current value plus change notifications.

use tokio::sync::watch;

/// A value that can be read synchronously and watched for changes.
///
/// Used for the canceled, paused and per-direction active flags.
#[derive(Debug)]
pub struct ObservableValue<T> {
    sender: watch::Sender<T>,
}

impl<T: Clone + PartialEq> ObservableValue<T> {
    /// Creates an observable holding `value`.
    pub fn new(value: T) -> Self {
        let (sender, _) = watch::channel(value);
        Self { sender }
    }

    /// Returns the current value.
    pub fn get(&self) -> T {
        self.sender.borrow().clone()
    }

    /// Replaces the value; subscribers are only notified if it changed.
    pub fn set(&self, value: T) {
        self.sender.send_if_modified(|current| {
            if *current == value {
                false
            } else {
                *current = value;
                true
            }
        });
    }

    /// Subscribes to changes.
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.sender.subscribe()
    }

    /// Waits until the value satisfies `predicate`, returning immediately if
    /// it already does.
    pub async fn wait_for(&self, predicate: impl FnMut(&T) -> bool) {
        let mut receiver = self.sender.subscribe();
        // the sender outlives `self`, so the wait only ends on a match
        let _matched = receiver.wait_for(predicate).await.is_ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn get_and_set() {
        let flag = ObservableValue::new(false);
        assert!(!flag.get());
        flag.set(true);
        assert!(flag.get());
    }

    #[tokio::test]
    async fn subscribers_see_changes_only() {
        let flag = ObservableValue::new(false);
        let mut receiver = flag.subscribe();

        flag.set(false);
        assert!(!receiver.has_changed().unwrap());

        flag.set(true);
        assert!(receiver.has_changed().unwrap());
        assert!(*receiver.borrow_and_update());
    }

    #[tokio::test]
    async fn wait_for_resolves_on_match() {
        let flag = Arc::new(ObservableValue::new(0u32));
        let setter = Arc::clone(&flag);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            setter.set(3);
        });

        tokio::time::timeout(Duration::from_secs(5), flag.wait_for(|v| *v == 3))
            .await
            .unwrap();
        assert_eq!(flag.get(), 3);
    }

    #[tokio::test]
    async fn wait_for_returns_immediately_if_matching() {
        let flag = ObservableValue::new(true);
        tokio::time::timeout(Duration::from_millis(100), flag.wait_for(|v| *v))
            .await
            .unwrap();
    }
}
