//! Learning rate schedulers

use super::Optimizer;

/// Learning rate scheduler trait
pub trait LRScheduler {
    /// Get the current learning rate
    fn get_lr(&self) -> f32;

    /// Step the scheduler (called after every optimizer step)
    fn step(&mut self);
}

/// Linear warmup followed by linear decay to zero
///
/// ```text
/// lr_t = lr_max · t / warmup                                t < warmup
/// lr_t = lr_max · max(0, (total - t) / (total - warmup))    otherwise
/// ```
#[derive(Debug, Clone)]
pub struct LinearSchedule {
    lr_max: f32,
    warmup_steps: usize,
    total_steps: usize,
    current_step: usize,
}

impl LinearSchedule {
    /// Create a new linear scheduler
    ///
    /// # Arguments
    /// * `lr_max` - Peak learning rate, reached at the end of warmup
    /// * `warmup_steps` - Steps of linear warmup from 0
    /// * `total_steps` - Step at which the learning rate reaches 0
    pub fn new(lr_max: f32, warmup_steps: usize, total_steps: usize) -> Self {
        Self {
            lr_max,
            warmup_steps,
            total_steps,
            current_step: 0,
        }
    }

    pub fn current_step(&self) -> usize {
        self.current_step
    }

    /// Apply the current learning rate to an optimizer
    pub fn apply<O: Optimizer + ?Sized>(&self, optimizer: &mut O) {
        optimizer.set_lr(self.get_lr());
    }
}

impl LRScheduler for LinearSchedule {
    fn get_lr(&self) -> f32 {
        let t = self.current_step;
        if t < self.warmup_steps {
            return self.lr_max * t as f32 / self.warmup_steps as f32;
        }
        if t >= self.total_steps {
            return 0.0;
        }
        let remaining = (self.total_steps - t) as f32;
        let span = (self.total_steps - self.warmup_steps).max(1) as f32;
        self.lr_max * remaining / span
    }

    fn step(&mut self) {
        self.current_step += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optim::AdamW;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_linear_starts_at_peak_without_warmup() {
        let scheduler = LinearSchedule::new(3e-4, 0, 100);
        assert_abs_diff_eq!(scheduler.get_lr(), 3e-4, epsilon = 1e-9);
    }

    #[test]
    fn test_linear_midpoint_and_end() {
        let mut scheduler = LinearSchedule::new(1.0, 0, 100);
        for _ in 0..50 {
            scheduler.step();
        }
        assert_abs_diff_eq!(scheduler.get_lr(), 0.5, epsilon = 1e-6);

        for _ in 0..60 {
            scheduler.step();
        }
        assert_eq!(scheduler.get_lr(), 0.0);
        assert_eq!(scheduler.current_step(), 110);
    }

    #[test]
    fn test_warmup_then_decay() {
        let mut scheduler = LinearSchedule::new(1.0, 10, 110);
        assert_eq!(scheduler.get_lr(), 0.0);

        for _ in 0..5 {
            scheduler.step();
        }
        assert_abs_diff_eq!(scheduler.get_lr(), 0.5, epsilon = 1e-6);

        for _ in 0..5 {
            scheduler.step();
        }
        assert_abs_diff_eq!(scheduler.get_lr(), 1.0, epsilon = 1e-6);

        for _ in 0..50 {
            scheduler.step();
        }
        assert_abs_diff_eq!(scheduler.get_lr(), 0.5, epsilon = 1e-6);
    }

    #[test]
    fn test_decreases_monotonically() {
        let mut scheduler = LinearSchedule::new(1.0, 0, 37);
        let mut prev_lr = scheduler.get_lr();

        for _ in 0..40 {
            scheduler.step();
            let current_lr = scheduler.get_lr();
            assert!(
                current_lr <= prev_lr,
                "Learning rate should decrease monotonically: prev={}, current={}",
                prev_lr,
                current_lr
            );
            prev_lr = current_lr;
        }
    }

    #[test]
    fn test_apply_to_optimizer() {
        let mut optimizer = AdamW::default_params(1.0, 0.0);
        let mut scheduler = LinearSchedule::new(1.0, 0, 4);

        scheduler.step();
        scheduler.apply(&mut optimizer);
        assert_abs_diff_eq!(optimizer.lr(), 0.75, epsilon = 1e-6);
    }
}
