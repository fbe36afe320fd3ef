//! Fixed-step accumulator with a cap on catch-up sub-steps

use tracing::warn;

/// Converts variable elapsed time into whole fixed sub-steps.
///
/// The cap bounds worst-case CPU work after a stall; when it is hit the
/// whole-step backlog is discarded (only the sub-step fraction survives)
/// so the simulation never enters a catch-up spiral. Pausing is handled
/// upstream by simply
/// not calling [`FixedStepper::advance`], so no time accrues while
/// paused and resuming does not jump.
#[derive(Debug, Default)]
pub struct FixedStepper {
    accumulator: f32,
}

impl FixedStepper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add elapsed wall time and return how many sub-steps of `step_size`
    /// to perform, at most `max_sub_steps`
    pub fn advance(&mut self, elapsed: f32, step_size: f32, max_sub_steps: u32) -> u32 {
        if step_size <= 0.0 {
            return 0;
        }
        self.accumulator += elapsed.max(0.0);

        let pending = (self.accumulator / step_size) as u32;
        let steps = pending.min(max_sub_steps);
        self.accumulator -= steps as f32 * step_size;

        if pending > max_sub_steps {
            warn!(
                pending,
                max_sub_steps, "stall detected, dropping simulation backlog"
            );
            // Only the sub-step fraction survives; whole pending steps
            // are gone, so the next frame runs a normal step count.
            self.accumulator %= step_size;
        }

        steps
    }

    /// Interpolation fraction into the next sub-step, in `[0, 1)`
    pub fn alpha(&self, step_size: f32) -> f32 {
        if step_size <= 0.0 {
            0.0
        } else {
            self.accumulator / step_size
        }
    }

    pub fn reset(&mut self) {
        self.accumulator = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const H: f32 = 1.0 / 60.0;

    #[test]
    fn test_accumulates_partial_steps() {
        let mut stepper = FixedStepper::new();
        assert_eq!(stepper.advance(H / 2.0, H, 10), 0);
        assert!((stepper.alpha(H) - 0.5).abs() < 1e-3);
        assert_eq!(stepper.advance(H / 2.0, H, 10), 1);
        assert!(stepper.alpha(H) < 1e-3);
    }

    #[test]
    fn test_two_frames_worth_gives_two_steps() {
        let mut stepper = FixedStepper::new();
        assert_eq!(stepper.advance(2.0 * H, H, 10), 2);
    }

    #[test]
    fn test_stall_is_capped_at_max_sub_steps() {
        // A one-second stall at 60 Hz would be 60 sub-steps; the cap
        // must hold it to 10.
        let mut stepper = FixedStepper::new();
        assert_eq!(stepper.advance(1.0, H, 10), 10);
        // Backlog was dropped: the next normal frame is normal again.
        assert_eq!(stepper.advance(H, H, 10), 1);
    }

    #[test]
    fn test_stall_residue_is_less_than_one_step() {
        let mut stepper = FixedStepper::new();
        // 25.5 steps of backlog against a cap of 10.
        assert_eq!(stepper.advance(25.5 * H, H, 10), 10);
        assert!(stepper.alpha(H) < 1.0, "alpha = {}", stepper.alpha(H));
        // Half a step of residue plus 0.6 steps of new time: one step.
        assert_eq!(stepper.advance(0.6 * H, H, 10), 1);
    }

    #[test]
    fn test_reset_clears_backlog() {
        let mut stepper = FixedStepper::new();
        stepper.advance(H / 2.0, H, 10);
        stepper.reset();
        assert_eq!(stepper.advance(H / 2.0, H, 10), 0);
    }
}
