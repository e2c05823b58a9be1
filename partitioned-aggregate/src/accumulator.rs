use crate::error::Overflow;

/// Running count, sum, max and min of the byte counts seen for one key.
///
/// `max` and `min` are `None` until the first fold. `merge` is associative and commutative, so
/// partial accumulators built on different workers can be combined in any order or grouping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Accumulator {
    pub count: u64,
    pub sum: u64,
    pub max: Option<u64>,
    pub min: Option<u64>,
}

impl Accumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_value(value: u64) -> Self {
        Self {
            count: 1,
            sum: value,
            max: Some(value),
            min: Some(value),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Adds one observation. Leaves `self` untouched on overflow.
    pub fn fold(&mut self, value: u64) -> Result<(), Overflow> {
        let count = self.count.checked_add(1).ok_or(Overflow)?;
        let sum = self.sum.checked_add(value).ok_or(Overflow)?;

        self.count = count;
        self.sum = sum;
        self.max = Some(self.max.map_or(value, |max| max.max(value)));
        self.min = Some(self.min.map_or(value, |min| min.min(value)));
        Ok(())
    }

    /// Combines another accumulator for the same key into `self`. Leaves `self` untouched on
    /// overflow.
    pub fn merge(&mut self, other: &Accumulator) -> Result<(), Overflow> {
        let count = self.count.checked_add(other.count).ok_or(Overflow)?;
        let sum = self.sum.checked_add(other.sum).ok_or(Overflow)?;

        self.count = count;
        self.sum = sum;
        self.max = combine(self.max, other.max, u64::max);
        self.min = combine(self.min, other.min, u64::min);
        Ok(())
    }
}

// Unset operands are ignored.
fn combine(a: Option<u64>, b: Option<u64>, op: fn(u64, u64) -> u64) -> Option<u64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(op(a, b)),
        (a, b) => a.or(b),
    }
}
