//! Latest-value state container
//!
//! A cheap-to-clone cell that always holds the current value and lets any
//! number of observers wait for changes. New subscribers see the current
//! value immediately.

use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug)]
pub struct StateFlow<T> {
    sender: Arc<watch::Sender<T>>,
}

impl<T> Clone for StateFlow<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<T> StateFlow<T> {
    pub fn new(initial: T) -> Self {
        let (sender, _) = watch::channel(initial);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Replace the value, waking observers
    pub fn set(&self, value: T) {
        self.sender.send_replace(value);
    }

    /// Modify the value in place, waking observers only if `f` returns true
    pub fn update(&self, f: impl FnOnce(&mut T) -> bool) -> bool {
        self.sender.send_if_modified(f)
    }

    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.sender.subscribe()
    }
}

impl<T: Clone> StateFlow<T> {
    pub fn get(&self) -> T {
        self.sender.borrow().clone()
    }
}

impl<T: PartialEq> StateFlow<T> {
    /// Store `value` unless it equals the current one; returns true if it changed
    pub fn set_if_changed(&self, value: T) -> bool {
        self.sender.send_if_modified(|current| {
            if *current == value {
                false
            } else {
                *current = value;
                true
            }
        })
    }
}
