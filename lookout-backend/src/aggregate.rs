//! Stateless numeric helpers over bounded sample windows.
//!
//! Helpers return `None` for an empty window; [`or_missing`] turns that into
//! the `-1` "no valid sample" marker used in stored records.

/// How a window's average is computed before it is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AveragePolicy {
    /// Middle value of the sorted window; midpoint of the two middle values for even counts.
    /// Used for ping windows.
    Median,
    /// Plain arithmetic mean.
    Arithmetic,
}

impl AveragePolicy {
    pub fn apply(self, values: &[i32]) -> Option<f64> {
        match self {
            AveragePolicy::Median => median(values),
            AveragePolicy::Arithmetic => mean(values),
        }
    }
}

pub fn min(values: &[i32]) -> Option<i32> {
    values.iter().copied().min()
}

pub fn max(values: &[i32]) -> Option<i32> {
    values.iter().copied().max()
}

/// Arithmetic mean.
pub fn mean(values: &[i32]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let sum: i64 = values.iter().map(|v| *v as i64).sum();
    Some(sum as f64 / values.len() as f64)
}

/// Arithmetic mean truncated toward zero.
pub fn mean_truncated(values: &[i32]) -> Option<i64> {
    if values.is_empty() {
        return None;
    }
    let sum: i64 = values.iter().map(|v| *v as i64).sum();
    Some(sum / values.len() as i64)
}

/// Arithmetic mean over floating point samples.
pub fn mean_f64(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

pub fn median(values: &[i32]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] as f64 + sorted[mid] as f64) / 2.0)
    } else {
        Some(sorted[mid] as f64)
    }
}

/// `-1` stands in for a missing aggregate in stored records.
pub fn or_missing<T: From<i8>>(value: Option<T>) -> T {
    value.unwrap_or_else(|| T::from(-1))
}
