//! Cumulative-weight categorical sampling.

use rand::Rng;

#[derive(Debug, Clone)]
pub struct WeightedChoice<T> {
    entries: Vec<(T, f64)>,
}

impl<T> WeightedChoice<T> {
    /// Build from `(value, weight)` pairs. Weights are expected to sum to 1.0;
    /// draws beyond the last cumulative weight fall back to the final entry.
    ///
    /// Returns `None` for an empty list or any negative/non-finite weight.
    pub fn new(entries: Vec<(T, f64)>) -> Option<Self> {
        if entries.is_empty() || entries.iter().any(|(_, w)| !w.is_finite() || *w < 0.0) {
            return None;
        }
        Some(WeightedChoice { entries })
    }

    /// First value whose cumulative weight meets or exceeds `draw`.
    pub fn pick(&self, draw: f64) -> &T {
        let mut cumulative = 0.0;
        for (value, weight) in &self.entries {
            cumulative += weight;
            if draw <= cumulative {
                return value;
            }
        }
        // rounding slack when the weights sum to just under 1.0
        &self.entries[self.entries.len() - 1].0
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> &T {
        self.pick(rng.random::<f64>())
    }
}
