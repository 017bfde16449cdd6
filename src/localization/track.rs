use std::collections::VecDeque;

/// Outcome of offering one distance to a [`MarkerTrack`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackUpdate {
    /// Mean of the history after the update.
    pub smoothed: f64,
    /// `false` when the sample was rejected as an outlier.
    pub accepted: bool,
}

/// Recent distances of one marker, used to smooth and reject outliers.
#[derive(Debug, Clone)]
pub struct MarkerTrack {
    history: VecDeque<f64>,
    capacity: usize,
    max_deviation: f64,
}

impl MarkerTrack {
    /// `max_deviation` is relative to the current mean, e.g. `0.2` for 20 %.
    pub fn new(capacity: usize, max_deviation: f64) -> Self {
        let capacity = capacity.max(1);
        MarkerTrack {
            history: VecDeque::with_capacity(capacity),
            capacity,
            max_deviation,
        }
    }

    pub fn mean(&self) -> Option<f64> {
        if self.history.is_empty() {
            return None;
        }
        Some(self.history.iter().sum::<f64>() / self.history.len() as f64)
    }

    /// Adds `distance` unless it deviates from the current mean by more than
    /// the allowed fraction. A rejected sample leaves the history untouched and
    /// the previous mean is returned. The first sample is always accepted.
    pub fn push(&mut self, distance: f64) -> TrackUpdate {
        if let Some(mean) = self.mean() {
            if mean > 0.0 && (distance - mean).abs() / mean > self.max_deviation {
                return TrackUpdate {
                    smoothed: mean,
                    accepted: false,
                };
            }
        }

        self.history.push_back(distance);
        while self.history.len() > self.capacity {
            self.history.pop_front();
        }
        TrackUpdate {
            smoothed: self.mean().unwrap_or(distance),
            accepted: true,
        }
    }

    pub fn history(&self) -> impl Iterator<Item = f64> + '_ {
        self.history.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn filled() -> MarkerTrack {
        let mut track = MarkerTrack::new(5, 0.2);
        for d in [100.0, 101.0, 99.0, 100.0, 98.0] {
            assert!(track.push(d).accepted);
        }
        track
    }

    #[test]
    fn test_outlier_is_rejected() {
        let mut track = filled();
        let update = track.push(500.0);
        assert!(!update.accepted);
        assert_relative_eq!(update.smoothed, 99.6, epsilon = 1e-12);
        assert_eq!(track.len(), 5);
        assert!(track.history().all(|d| d < 200.0));
    }

    #[test]
    fn test_inlier_evicts_oldest() {
        let mut track = filled();
        let update = track.push(105.0);
        assert!(update.accepted);
        assert_eq!(track.len(), 5);
        assert_eq!(
            track.history().collect::<Vec<_>>(),
            vec![101.0, 99.0, 100.0, 98.0, 105.0]
        );
        assert_relative_eq!(update.smoothed, 100.6, epsilon = 1e-12);
    }

    #[test]
    fn test_first_sample_always_accepted() {
        let mut track = MarkerTrack::new(5, 0.2);
        let update = track.push(1234.5);
        assert!(update.accepted);
        assert_relative_eq!(update.smoothed, 1234.5);

        let update = track.push(1234.5 * 1.19);
        assert!(update.accepted);
    }
}
