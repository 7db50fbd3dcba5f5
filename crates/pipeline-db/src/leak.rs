//! Leak detection: tracks every live acquisition and warns when one is held
//! past a threshold (§4.1, default 30s).

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Instant;

#[derive(Debug, Clone)]
struct LeakEntry {
    acquired_at: Instant,
    caller: String,
}

#[derive(Default)]
pub struct LeakRegistry {
    next_id: Mutex<u64>,
    live: Mutex<HashMap<u64, LeakEntry>>,
}

impl LeakRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self, caller: impl Into<String>) -> u64 {
        let id = {
            let mut next = self.next_id.lock();
            let id = *next;
            *next += 1;
            id
        };
        self.live.lock().insert(
            id,
            LeakEntry {
                acquired_at: Instant::now(),
                caller: caller.into(),
            },
        );
        id
    }

    pub fn release(&self, id: u64) {
        self.live.lock().remove(&id);
    }

    /// Returns `(id, caller, held_for_secs)` for every acquisition held
    /// longer than `threshold_secs`.
    pub fn sweep(&self, threshold_secs: u64) -> Vec<(u64, String, u64)> {
        self.live
            .lock()
            .iter()
            .filter_map(|(id, entry)| {
                let held = entry.acquired_at.elapsed().as_secs();
                if held >= threshold_secs {
                    Some((*id, entry.caller.clone(), held))
                } else {
                    None
                }
            })
            .collect()
    }

    pub fn live_count(&self) -> usize {
        self.live.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn sweep_flags_long_lived_acquisitions() {
        let registry = LeakRegistry::new();
        let id = registry.track("caller-a");
        tokio::time::sleep(Duration::from_millis(20)).await;
        let flagged = registry.sweep(0);
        assert_eq!(flagged.len(), 1);
        assert_eq!(flagged[0].0, id);
        registry.release(id);
        assert_eq!(registry.live_count(), 0);
    }

    #[test]
    fn sweep_ignores_fresh_acquisitions() {
        let registry = LeakRegistry::new();
        registry.track("caller-a");
        let flagged = registry.sweep(30);
        assert!(flagged.is_empty());
    }
}
