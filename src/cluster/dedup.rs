use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};

/// 近期事件ID集合（有界）/ Bounded set of recently seen event ids
pub struct RecentIds {
    inner: Mutex<(HashSet<String>, VecDeque<String>)>,
    capacity: usize,
}

impl RecentIds {
    pub fn new(capacity: usize) -> Self {
        Self { inner: Mutex::new((HashSet::new(), VecDeque::new())), capacity: capacity.max(1) }
    }

    /// 首次出现返回 true / Returns true the first time an id is seen
    pub fn should_deliver(&self, id: &str) -> bool {
        let mut guard = self.inner.lock();
        let (seen, order) = &mut *guard;
        if seen.contains(id) {
            return false;
        }
        seen.insert(id.to_string());
        order.push_back(id.to_string());
        while order.len() > self.capacity {
            if let Some(old) = order.pop_front() {
                seen.remove(&old);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.inner.lock().1.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
