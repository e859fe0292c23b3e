//! Screen-change notification.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Told whenever a capture produces a frame with new content.
pub trait ChangeListener: Send + Sync {
    fn on_change(&self, device_id: &str);
}

impl<F> ChangeListener for F
where
    F: Fn(&str) + Send + Sync,
{
    fn on_change(&self, device_id: &str) {
        self(device_id)
    }
}

/// Handle returned by [`ListenerRegistry::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
pub struct ListenerRegistry {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(ListenerId, Arc<dyn ChangeListener>)>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, listener: Arc<dyn ChangeListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        if let Ok(mut l) = self.listeners.lock() {
            l.push((id, listener));
        }
        id
    }

    /// `false` if `id` was not registered.
    pub fn unregister(&self, id: ListenerId) -> bool {
        let Ok(mut l) = self.listeners.lock() else {
            return false;
        };
        let before = l.len();
        l.retain(|(lid, _)| *lid != id);
        l.len() != before
    }

    pub fn len(&self) -> usize {
        self.listeners.lock().map(|l| l.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Call every listener outside the registry lock, so a listener may
    /// register or unregister from inside its callback.
    pub fn notify(&self, device_id: &str) {
        let snapshot: Vec<Arc<dyn ChangeListener>> = match self.listeners.lock() {
            Ok(l) => l.iter().map(|(_, cb)| cb.clone()).collect(),
            Err(_) => return,
        };
        for cb in snapshot {
            cb.on_change(device_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn register_notify_unregister() {
        let reg = ListenerRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let id = reg.register(Arc::new(move |dev: &str| {
            assert_eq!(dev, "emulator-5554");
            h.fetch_add(1, Ordering::SeqCst);
        }));

        reg.notify("emulator-5554");
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        assert!(reg.unregister(id));
        assert!(!reg.unregister(id));
        reg.notify("emulator-5554");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn listener_may_unregister_itself() {
        let reg = Arc::new(ListenerRegistry::new());
        let slot: Arc<Mutex<Option<ListenerId>>> = Arc::new(Mutex::new(None));
        let (r, s) = (reg.clone(), slot.clone());
        let id = reg.register(Arc::new(move |_: &str| {
            if let Some(id) = *s.lock().unwrap() {
                r.unregister(id);
            }
        }));
        *slot.lock().unwrap() = Some(id);
        reg.notify("dev");
        assert!(reg.is_empty());
    }
}
