use parking_lot::{Condvar, Mutex};

struct SlotState<T> {
    value: Option<T>,
    closed: bool,
}

/// Capacity-one channel where a new value replaces the pending one.
///
/// The producer never blocks. The consumer blocks in [`LatestSlot::take`]
/// until a value is present or the slot is closed.
pub struct LatestSlot<T> {
    state: Mutex<SlotState<T>>,
    ready: Condvar,
}

impl<T> Default for LatestSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> LatestSlot<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SlotState {
                value: None,
                closed: false,
            }),
            ready: Condvar::new(),
        }
    }

    /// Stores `value`, returning the value it displaced. On a closed slot the
    /// value is handed straight back.
    pub fn put(&self, value: T) -> Option<T> {
        let mut state = self.state.lock();
        if state.closed {
            return Some(value);
        }
        let displaced = state.value.replace(value);
        drop(state);
        self.ready.notify_one();
        displaced
    }

    /// Like [`LatestSlot::put`], but a pending value ordered after `value` by
    /// `key` stays in place. Returns whichever value did not end up pending.
    pub fn put_newest<K: Ord>(&self, value: T, key: impl Fn(&T) -> K) -> Option<T> {
        let mut state = self.state.lock();
        if state.closed {
            return Some(value);
        }
        if state.value.as_ref().is_some_and(|pending| key(pending) > key(&value)) {
            return Some(value);
        }
        let displaced = state.value.replace(value);
        drop(state);
        self.ready.notify_one();
        displaced
    }

    /// Waits for the next value. `None` once the slot is closed.
    pub fn take(&self) -> Option<T> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return None;
            }
            if let Some(value) = state.value.take() {
                return Some(value);
            }
            self.ready.wait(&mut state);
        }
    }

    pub fn try_take(&self) -> Option<T> {
        self.state.lock().value.take()
    }

    /// Drops any pending value and wakes the consumer.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.value = None;
        drop(state);
        self.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_put_replaces_pending() {
        let slot = LatestSlot::new();
        assert_eq!(slot.put(1), None);
        assert_eq!(slot.put(2), Some(1));
        assert_eq!(slot.take(), Some(2));
        assert_eq!(slot.try_take(), None);
    }

    #[test]
    fn test_put_newest_keeps_later_pending_value() {
        let slot = LatestSlot::new();
        assert_eq!(slot.put_newest((2, 5), |v| *v), None);
        // An older value arriving late is refused.
        assert_eq!(slot.put_newest((1, 9), |v| *v), Some((1, 9)));
        assert_eq!(slot.put_newest((2, 6), |v| *v), Some((2, 5)));
        assert_eq!(slot.take(), Some((2, 6)));

        slot.close();
        assert_eq!(slot.put_newest((3, 0), |v| *v), Some((3, 0)));
    }

    #[test]
    fn test_close_wakes_blocked_consumer() {
        let slot = Arc::new(LatestSlot::<u32>::new());
        let consumer = {
            let slot = slot.clone();
            thread::spawn(move || slot.take())
        };
        thread::sleep(Duration::from_millis(20));
        slot.close();
        assert_eq!(consumer.join().unwrap(), None);
        assert_eq!(slot.put(5), Some(5));
    }

    #[test]
    fn test_consumer_sees_latest_value() {
        let slot = Arc::new(LatestSlot::new());
        for i in 0..100 {
            slot.put(i);
        }
        let consumer = {
            let slot = slot.clone();
            thread::spawn(move || slot.take())
        };
        assert_eq!(consumer.join().unwrap(), Some(99));
    }
}
