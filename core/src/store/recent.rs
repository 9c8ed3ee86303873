// Recent-id window: drop packets already seen
//
// Bounded both by count and by age; the oldest ids are evicted first.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

pub const DEFAULT_CAPACITY: usize = 1_000;
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(10 * 60);

#[derive(Debug)]
pub struct RecentIds {
    seen: HashMap<String, Instant>,
    order: VecDeque<(String, Instant)>,
    capacity: usize,
    max_age: Duration,
}

impl RecentIds {
    pub fn new(capacity: usize, max_age: Duration) -> Self {
        Self {
            seen: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
            max_age,
        }
    }

    /// Record `id`. Returns false when it is already inside the window.
    pub fn insert(&mut self, id: &str) -> bool {
        let now = Instant::now();
        self.expire(now);
        if self.seen.contains_key(id) {
            return false;
        }
        while self.order.len() >= self.capacity {
            if let Some((oldest, _)) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(id.to_string(), now);
        self.order.push_back((id.to_string(), now));
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.seen
            .get(id)
            .map_or(false, |at| at.elapsed() < self.max_age)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn expire(&mut self, now: Instant) {
        while let Some((id, at)) = self.order.front() {
            if now.duration_since(*at) < self.max_age {
                break;
            }
            self.seen.remove(id);
            self.order.pop_front();
        }
    }
}

impl Default for RecentIds {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_MAX_AGE)
    }
}
