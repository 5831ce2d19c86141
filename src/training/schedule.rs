//! Learning-rate schedule.

use std::f64::consts::PI;

use crate::config::ScheduleConfig;

/// Linear warmup followed by a half-cycle cosine decay to `min_lr`.
///
/// Evaluated at fractional epochs so the rate changes every step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LrSchedule {
    pub base_lr: f64,
    pub min_lr: f64,
    pub warmup_epochs: f64,
    pub total_epochs: f64,
}

impl LrSchedule {
    #[allow(clippy::cast_precision_loss)]
    pub fn from_config(cfg: &ScheduleConfig) -> Self {
        Self {
            base_lr: cfg.learning_rate,
            min_lr: cfg.min_lr,
            warmup_epochs: cfg.warmup_epochs as f64,
            total_epochs: cfg.epochs as f64,
        }
    }

    pub fn lr_at(&self, epoch: f64) -> f64 {
        if epoch < self.warmup_epochs {
            return self.base_lr * epoch / self.warmup_epochs;
        }
        let span = self.total_epochs - self.warmup_epochs;
        if span <= 0.0 {
            return self.base_lr;
        }
        let progress = ((epoch - self.warmup_epochs) / span).clamp(0.0, 1.0);
        self.min_lr + (self.base_lr - self.min_lr) * 0.5 * (1.0 + (PI * progress).cos())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule() -> LrSchedule {
        LrSchedule {
            base_lr: 1e-3,
            min_lr: 1e-5,
            warmup_epochs: 5.0,
            total_epochs: 25.0,
        }
    }

    #[test]
    fn test_warmup_is_linear() {
        let s = schedule();
        assert_eq!(s.lr_at(0.0), 0.0);
        assert!((s.lr_at(2.5) - 5e-4).abs() < 1e-12);
        assert!((s.lr_at(5.0) - 1e-3).abs() < 1e-12);
    }

    #[test]
    fn test_cosine_reaches_floor() {
        let s = schedule();
        assert!((s.lr_at(15.0) - (1e-5 + (1e-3 - 1e-5) * 0.5)).abs() < 1e-12);
        assert!((s.lr_at(25.0) - 1e-5).abs() < 1e-12);
        assert!((s.lr_at(40.0) - 1e-5).abs() < 1e-12);
    }

    #[test]
    fn test_monotone_after_warmup() {
        let s = schedule();
        let mut prev = s.lr_at(5.0);
        for i in 6..=25 {
            let lr = s.lr_at(f64::from(i));
            assert!(lr <= prev);
            prev = lr;
        }
    }

    #[test]
    fn test_no_warmup() {
        let s = LrSchedule {
            warmup_epochs: 0.0,
            ..schedule()
        };
        assert!((s.lr_at(0.0) - 1e-3).abs() < 1e-12);
    }
}
