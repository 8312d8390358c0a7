/// Running mean over the most recent `capacity` samples.
#[derive(Debug, Clone)]
pub struct RollingAverage {
    capacity: usize,
    head: usize,
    values: Vec<f64>,
}

impl RollingAverage {
    /// Number of trueV samples kept per port.
    pub const PORT_WINDOW: usize = 10;

    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self { capacity, head: 0, values: Vec::with_capacity(capacity) }
    }

    /// Add a sample, overwriting the oldest once full. Returns the number of samples held.
    pub fn add(&mut self, value: f64) -> usize {
        if self.values.len() < self.capacity {
            self.values.push(value);
            self.head = self.values.len() - 1;
        } else {
            self.head = (self.head + 1) % self.capacity;
            self.values[self.head] = value;
        }
        self.values.len()
    }

    /// Mean of the held samples, `None` before the first sample.
    pub fn average(&self) -> Option<f64> {
        if self.values.is_empty() {
            return None;
        }
        Some(self.values.iter().sum::<f64>() / self.values.len() as f64)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl Default for RollingAverage {
    fn default() -> Self {
        Self::new(Self::PORT_WINDOW)
    }
}
