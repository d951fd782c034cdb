use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

#[derive(Debug, Default)]
struct Inner {
    packets: VecDeque<Vec<u8>>,
    closed: bool,
}

/// Ordered blocking queue of application payloads. The dispatcher produces,
/// `recv` consumes; one message per dequeue, never split or coalesced.
#[derive(Debug, Default)]
pub struct AppBuffer {
    inner: Mutex<Inner>,
    cond: Condvar,
}

impl AppBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, payload: Vec<u8>) {
        let mut inner = self.inner.lock().unwrap();

        if inner.closed {
            return;
        }

        inner.packets.push_back(payload);
        self.cond.notify_one();
    }

    /// Blocks until a payload is available. Returns `None` once the buffer
    /// has been closed and drained.
    pub fn get(&self) -> Option<Vec<u8>> {
        let mut inner = self.inner.lock().unwrap();

        inner = self
            .cond
            .wait_while(inner, |inner| inner.packets.is_empty() && !inner.closed)
            .unwrap();

        inner.packets.pop_front()
    }

    /// Lets queued payloads drain, then makes `get` return `None`.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();

        inner.closed = true;
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn payloads_come_out_in_order_one_per_dequeue() {
        let buffer = AppBuffer::new();

        buffer.put(b"first".to_vec());
        buffer.put(b"second".to_vec());

        assert_eq!(buffer.get().unwrap(), b"first");
        assert_eq!(buffer.get().unwrap(), b"second");
    }

    #[test]
    fn get_blocks_until_put() {
        let buffer = Arc::new(AppBuffer::new());

        let producer = {
            let buffer = buffer.clone();

            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                buffer.put(b"late".to_vec());
            })
        };

        assert_eq!(buffer.get().unwrap(), b"late");
        producer.join().unwrap();
    }

    #[test]
    fn close_drains_then_yields_none() {
        let buffer = AppBuffer::new();

        buffer.put(b"leftover".to_vec());
        buffer.close();

        assert_eq!(buffer.get().unwrap(), b"leftover");
        assert!(buffer.get().is_none());
    }

    #[test]
    fn close_wakes_blocked_consumers() {
        let buffer = Arc::new(AppBuffer::new());

        let consumer = {
            let buffer = buffer.clone();

            thread::spawn(move || buffer.get())
        };

        thread::sleep(Duration::from_millis(50));
        buffer.close();

        assert!(consumer.join().unwrap().is_none());
    }
}
