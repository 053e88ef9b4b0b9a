/// Step learning rate: multiplied by `multiplier` every `interval` superbatches.
///
/// The rate is a pure function of the superbatch number, so resuming at any
/// superbatch picks up the same rate the uninterrupted run would have had.
#[derive(Debug, Clone)]
pub struct StepLr {
    base: f64,
    multiplier: f64,
    interval: usize,
}

impl StepLr {
    pub fn new(base: f64, multiplier: f64, interval: usize) -> Self {
        Self {
            base,
            multiplier,
            interval: interval.max(1),
        }
    }

    pub fn at(&self, superbatch: usize) -> f64 {
        let drops = superbatch.saturating_sub(1) / self.interval;
        self.base * self.multiplier.powi(drops as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drops_every_interval() {
        let lr = StepLr::new(0.001, 0.5, 10);
        assert_eq!(lr.at(1), 0.001);
        assert_eq!(lr.at(10), 0.001);
        assert_eq!(lr.at(11), 0.0005);
        assert_eq!(lr.at(21), 0.00025);
    }

    #[test]
    fn resuming_matches_an_uninterrupted_run() {
        let lr = StepLr::new(0.001, 0.99, 1);
        assert!((lr.at(5) - 0.001 * 0.99f64.powi(4)).abs() < 1e-15);
    }
}
