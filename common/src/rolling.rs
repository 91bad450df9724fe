//! Fixed-depth rolling averages
//!
//! [`RollingAverage`] keeps the last `depth` samples in a circular buffer that starts out filled
//! with a seed value, so [`RollingAverage::average`] is defined from the very first call. The
//! summation and division are supplied by the caller, which keeps the type usable for byte counts
//! as well as any other summable value.
//!
//! [`SpeedHistory`] uses it to smooth observed transfer rates per storage device.

/// Circular buffer of `depth` samples with a caller-defined mean.
#[derive(Clone)]
pub struct RollingAverage<T> {
    values: Vec<T>,
    cursor: usize,
    add: fn(T, T) -> T,
    divide: fn(T, usize) -> T,
}

impl<T: Copy> RollingAverage<T> {
    /// Creates a buffer of `depth` copies of `seed`.
    ///
    /// # Panics
    ///
    /// Panics if `depth` is zero.
    pub fn new(depth: usize, seed: T, add: fn(T, T) -> T, divide: fn(T, usize) -> T) -> Self {
        assert!(depth > 0, "rolling average depth must be at least 1");
        Self {
            values: vec![seed; depth],
            cursor: 0,
            add,
            divide,
        }
    }

    /// Overwrites the oldest sample.
    pub fn push(&mut self, value: T) {
        self.values[self.cursor] = value;
        self.cursor = (self.cursor + 1) % self.values.len();
    }

    pub fn average(&self) -> T {
        let sum = self.values[1..]
            .iter()
            .fold(self.values[0], |acc, value| (self.add)(acc, *value));
        (self.divide)(sum, self.values.len())
    }

    pub fn depth(&self) -> usize {
        self.values.len()
    }

    pub fn values(&self) -> &[T] {
        &self.values
    }
}

impl RollingAverage<u64> {
    /// Integer average suitable for byte counts and rates.
    pub fn bytes(depth: usize, seed: u64) -> Self {
        Self::new(depth, seed, u64::saturating_add, |sum, count| {
            sum / count as u64
        })
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for RollingAverage<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RollingAverage")
            .field("values", &self.values)
            .field("cursor", &self.cursor)
            .finish()
    }
}

/// Observed bytes/second per storage device, used for populate time estimates.
#[derive(Debug)]
pub struct SpeedHistory {
    depth: usize,
    devices: std::collections::HashMap<u64, RollingAverage<u64>>,
}

impl SpeedHistory {
    pub fn new(depth: usize) -> Self {
        Self {
            depth: depth.max(1),
            devices: Default::default(),
        }
    }

    /// Records a rate for `device`. The first sample for a device also seeds every slot so a
    /// single measurement is not diluted by zeros.
    pub fn record(&mut self, device: u64, bytes_per_sec: u64) {
        let depth = self.depth;
        self.devices
            .entry(device)
            .or_insert_with(|| RollingAverage::bytes(depth, bytes_per_sec))
            .push(bytes_per_sec);
    }

    pub fn average(&self, device: u64) -> Option<u64> {
        self.devices.get(&device).map(RollingAverage::average)
    }

    pub fn estimate(&self, device: u64, bytes: u64) -> Option<std::time::Duration> {
        match self.average(device)? {
            0 => None,
            bps => Some(std::time::Duration::from_secs_f64(bytes as f64 / bps as f64)),
        }
    }
}
