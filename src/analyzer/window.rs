/// Fixed-capacity FIFO of recent values for one sensor.
///
/// Backed by a ring buffer: once full, each push overwrites the oldest slot.
#[derive(Debug, Clone)]
pub struct RollingWindow {
    data: Vec<f64>,
    head: usize,
    capacity: usize,
}

impl RollingWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            data: Vec::with_capacity(capacity),
            head: 0,
            capacity,
        }
    }

    pub fn push(&mut self, value: f64) {
        if self.data.len() < self.capacity {
            self.data.push(value);
        } else {
            self.data[self.head] = value;
            self.head = (self.head + 1) % self.capacity;
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.data.len() == self.capacity
    }

    /// Arithmetic mean of the current contents, `None` when empty
    pub fn mean(&self) -> Option<f64> {
        if self.data.is_empty() {
            return None;
        }
        Some(self.data.iter().sum::<f64>() / self.data.len() as f64)
    }

    /// Value pushed `back` steps ago (0 = latest)
    fn nth_latest(&self, back: usize) -> Option<f64> {
        if back >= self.data.len() {
            return None;
        }
        let idx = if self.data.len() < self.capacity {
            self.data.len() - 1 - back
        } else {
            (self.head + self.capacity - 1 - back) % self.capacity
        };
        Some(self.data[idx])
    }

    pub fn latest(&self) -> Option<f64> {
        self.nth_latest(0)
    }

    /// The two most recent values as `(previous, latest)`
    pub fn last_two(&self) -> Option<(f64, f64)> {
        Some((self.nth_latest(1)?, self.nth_latest(0)?))
    }

    /// Contents oldest-first
    pub fn to_vec(&self) -> Vec<f64> {
        let mut out = Vec::with_capacity(self.data.len());
        if self.data.len() < self.capacity {
            out.extend_from_slice(&self.data);
        } else {
            out.extend_from_slice(&self.data[self.head..]);
            out.extend_from_slice(&self.data[..self.head]);
        }
        out
    }
}
