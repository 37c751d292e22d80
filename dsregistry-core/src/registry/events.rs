//! Registry change notifications.

use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

/// Something changed in the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// A data source was added
    Added {
        /// Data source id
        id: String,
    },
    /// A data source was removed
    Removed {
        /// Data source id
        id: String,
    },
    /// A data source's settings changed
    Updated {
        /// Data source id
        id: String,
    },
    /// A connection was opened
    ConnectionOpened {
        /// Data source id
        id: String,
    },
    /// A connection was closed
    ConnectionClosed {
        /// Data source id
        id: String,
    },
    /// A connect attempt failed
    ConnectionFailed {
        /// Data source id
        id: String,
        /// Error text
        error: String,
    },
    /// A folder was added, changed or removed
    FolderChanged {
        /// Folder path
        path: String,
    },
}

impl RegistryEvent {
    /// Data source the event is about, if any.
    pub fn data_source_id(&self) -> Option<&str> {
        match self {
            Self::Added { id }
            | Self::Removed { id }
            | Self::Updated { id }
            | Self::ConnectionOpened { id }
            | Self::ConnectionClosed { id }
            | Self::ConnectionFailed { id, .. } => Some(id),
            Self::FolderChanged { .. } => None,
        }
    }
}

/// Receives registry events.
pub trait RegistryListener: Send + Sync {
    /// Called on a background task, in registration order.
    fn handle_event(&self, event: &RegistryEvent);
}

/// Listener forwarding events into an unbounded channel.
#[derive(Debug)]
pub struct ChannelListener {
    sender: mpsc::UnboundedSender<RegistryEvent>,
}

impl ChannelListener {
    /// Creates the listener and the receiving end.
    pub fn channel() -> (Arc<Self>, mpsc::UnboundedReceiver<RegistryEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Arc::new(Self { sender }), receiver)
    }
}

impl RegistryListener for ChannelListener {
    fn handle_event(&self, event: &RegistryEvent) {
        // A dropped receiver just means nobody listens anymore
        let _ = self.sender.send(event.clone());
    }
}

#[derive(Default)]
pub(crate) struct ListenerSet {
    listeners: RwLock<Vec<Arc<dyn RegistryListener>>>,
}

impl ListenerSet {
    pub(crate) fn add(&self, listener: Arc<dyn RegistryListener>) {
        self.listeners.write().push(listener);
    }

    pub(crate) fn remove(&self, listener: &Arc<dyn RegistryListener>) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        before != listeners.len()
    }

    pub(crate) fn clear(&self) {
        self.listeners.write().clear();
    }

    /// Delivers on a spawned task; inline when no runtime is running.
    pub(crate) fn notify(&self, event: RegistryEvent) {
        let snapshot: Vec<Arc<dyn RegistryListener>> = self.listeners.read().clone();
        if snapshot.is_empty() {
            return;
        }
        trace!(?event, listeners = snapshot.len(), "Dispatching registry event");
        let deliver = move || {
            for listener in &snapshot {
                listener.handle_event(&event);
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { deliver() });
            }
            Err(_) => deliver(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_listener_receives_events() {
        let set = ListenerSet::default();
        let (listener, mut events) = ChannelListener::channel();
        set.add(listener);
        set.notify(RegistryEvent::Added { id: "a".to_string() });
        let event = events.recv().await.unwrap();
        assert_eq!(event.data_source_id(), Some("a"));
    }

    #[test]
    fn test_removed_listener_gets_nothing() {
        let set = ListenerSet::default();
        let (listener, mut events) = ChannelListener::channel();
        let as_dyn: Arc<dyn RegistryListener> = listener;
        set.add(Arc::clone(&as_dyn));
        assert!(set.remove(&as_dyn));
        set.notify(RegistryEvent::FolderChanged { path: "x".to_string() });
        assert!(events.try_recv().is_err());
    }
}
