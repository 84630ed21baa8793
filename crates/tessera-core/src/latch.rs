//! A count-down latch built on a mutex and condition variable.
//!
//! Each in-flight unit owns one: its count is the number of earlier
//! in-flight units it waits for. `prepare_reset` uses a separate latch to
//! wait for the in-flight set to drain.

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
pub struct Latch {
    count: Mutex<usize>,
    released: Condvar,
}

impl Latch {
    pub fn new(count: usize) -> Self {
        Self {
            count: Mutex::new(count),
            released: Condvar::new(),
        }
    }

    /// Raise the count by `n`.
    pub fn add(&self, n: usize) {
        *self.count.lock() += n;
    }

    /// Lower the count by one, waking waiters when it reaches zero.
    /// Saturates at zero.
    pub fn count_down(&self) {
        let mut count = self.count.lock();
        if *count > 0 {
            *count -= 1;
        }
        if *count == 0 {
            self.released.notify_all();
        }
    }

    pub fn count(&self) -> usize {
        *self.count.lock()
    }

    /// Block until the count is zero.
    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.released.wait(&mut count);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::Latch;

    #[test]
    fn test_zero_latch_does_not_block() {
        Latch::new(0).wait();
    }

    #[test]
    fn test_wait_released_by_other_threads() {
        let latch = Arc::new(Latch::new(3));
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let latch = Arc::clone(&latch);
                thread::spawn(move || latch.count_down())
            })
            .collect();

        latch.wait();
        assert_eq!(latch.count(), 0);
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_count_down_saturates() {
        let latch = Latch::new(1);
        latch.count_down();
        latch.count_down();
        assert_eq!(latch.count(), 0);
        latch.add(2);
        assert_eq!(latch.count(), 2);
    }
}
