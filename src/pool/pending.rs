use std::sync::Mutex;

/// Count of enqueued-but-unfinished build jobs.
///
/// Incremented before a task reaches the queue, decremented exactly once
/// per worker termination. Never goes below zero; `reset_to` exists for an
/// operator forcing a recount after manual surgery on the pool.
#[derive(Debug, Default)]
pub struct PendingCounter {
    count: Mutex<u32>,
}

impl PendingCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        *self.count.lock().unwrap() += 1;
    }

    pub fn dec(&self) {
        let mut count = self.count.lock().unwrap();
        *count = count.saturating_sub(1);
    }

    pub fn value(&self) -> u32 {
        *self.count.lock().unwrap()
    }

    pub fn reset_to(&self, value: i64) {
        *self.count.lock().unwrap() = value.max(0) as u32;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inc_dec_value() {
        let pending = PendingCounter::new();
        assert_eq!(pending.value(), 0);
        pending.inc();
        pending.inc();
        assert_eq!(pending.value(), 2);
        pending.dec();
        assert_eq!(pending.value(), 1);
    }

    #[test]
    fn test_dec_floors_at_zero() {
        let pending = PendingCounter::new();
        pending.dec();
        pending.dec();
        assert_eq!(pending.value(), 0);
    }

    #[test]
    fn test_reset_to_clamps_negative() {
        let pending = PendingCounter::new();
        pending.reset_to(5);
        assert_eq!(pending.value(), 5);
        pending.reset_to(-3);
        assert_eq!(pending.value(), 0);
    }

    #[test]
    fn test_shared_across_threads() {
        let pending = std::sync::Arc::new(PendingCounter::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let p = pending.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        p.inc();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(pending.value(), 800);
    }
}
