use crate::common::{DetectorError, DetectorResult};

/// Iteration bookkeeping for one training run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainingSchedule {
    pub total_iterations: u64,
    pub lr_decay_iteration: u64,
    /// Strictly increasing, every point in `[0, total_iterations]`.
    pub evaluation_points: Vec<u64>,
}

impl TrainingSchedule {
    /// Evaluation happens at the ten fractions `i * total / 10`, at the first
    /// learning-rate decay and at the final iteration.
    pub fn new(total_iterations: u64, lr_decay_iteration: u64) -> DetectorResult<Self> {
        if total_iterations == 0 {
            return Err(DetectorError::configuration("iteration count must be positive"));
        }
        if lr_decay_iteration == 0 {
            return Err(DetectorError::configuration("step size must be positive"));
        }

        let mut evaluation_points: Vec<u64> = (0..10).map(|i| i * total_iterations / 10).collect();
        evaluation_points.push(lr_decay_iteration);
        evaluation_points.push(total_iterations);
        evaluation_points.retain(|&p| p <= total_iterations);
        evaluation_points.sort_unstable();
        evaluation_points.dedup();

        Ok(Self {
            total_iterations,
            lr_decay_iteration,
            evaluation_points,
        })
    }

    pub fn is_evaluation_point(&self, iteration: u64) -> bool {
        self.evaluation_points.binary_search(&iteration).is_ok()
    }

    /// The learning rate shrinks every `lr_decay_iteration` iterations.
    pub fn should_decay(&self, iteration: u64) -> bool {
        iteration > 0 && iteration % self.lr_decay_iteration == 0
    }

    pub fn is_final(&self, iteration: u64) -> bool {
        iteration == self.total_iterations
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_run_points() {
        let schedule = TrainingSchedule::new(70000, 50000).unwrap();
        assert_eq!(
            schedule.evaluation_points,
            vec![0, 7000, 14000, 21000, 28000, 35000, 42000, 49000, 50000, 56000, 63000, 70000]
        );
        assert!(schedule.is_evaluation_point(50000));
        assert!(!schedule.is_evaluation_point(50001));
        assert!(schedule.should_decay(50000));
        assert!(!schedule.should_decay(0));
    }

    #[test]
    fn points_are_strictly_increasing_and_bounded() {
        for (total, step) in [(1, 1), (7, 3), (10, 10), (95, 200), (123457, 1000)] {
            let schedule = TrainingSchedule::new(total, step).unwrap();
            let points = &schedule.evaluation_points;
            assert!(points.windows(2).all(|w| w[0] < w[1]));
            assert!(points.iter().all(|&p| p <= total));
            assert_eq!(points.first(), Some(&0));
            assert_eq!(points.last(), Some(&total));
        }
    }

    #[test]
    fn decay_beyond_the_run_is_not_an_evaluation_point() {
        let schedule = TrainingSchedule::new(100, 500).unwrap();
        assert!(!schedule.is_evaluation_point(500));
        assert_eq!(schedule.evaluation_points.len(), 11);
    }

    #[test]
    fn zero_iterations_is_rejected() {
        assert!(matches!(TrainingSchedule::new(0, 10), Err(DetectorError::Configuration(_))));
    }
}
