//! High-level runtime driver settings
//!
//! Iteration rate, sub-steps per tick, time scaling and the start-paused flag
//! used when starting a [`SimulationDriver`](super::driver::SimulationDriver)

use std::time::Duration;

use crate::error::SimError;

#[derive(Debug, Clone, PartialEq)]
pub struct Engine {
    pub simulate: bool, // false = leave bodies where they are
    pub iterations_per_second: u32, // RK4 steps per wall-clock second
    pub sub_steps: u32, // RK4 steps per tick
    pub time_factor: f64, // simulated seconds per wall-clock second
    pub start_active: bool, // false = start paused
}

impl Default for Engine {
    fn default() -> Self {
        Self {
            simulate: true,
            iterations_per_second: 10_000,
            sub_steps: 50,
            time_factor: 1.0,
            start_active: true,
        }
    }
}

impl Engine {
    /// Simulated duration of one RK4 step
    pub fn dt(&self) -> f64 {
        self.time_factor / f64::from(self.iterations_per_second)
    }

    /// Wall-clock duration of one tick (`sub_steps` steps)
    pub fn tick_period(&self) -> Duration {
        Duration::from_secs_f64(f64::from(self.sub_steps) / f64::from(self.iterations_per_second))
    }

    pub fn validate(&self) -> Result<(), SimError> {
        if self.iterations_per_second == 0 {
            return Err(SimError::invalid_config("iterations per second must be positive"));
        }
        if self.sub_steps == 0 {
            return Err(SimError::invalid_config("sub-steps must be positive"));
        }
        if !(self.time_factor.is_finite() && self.time_factor > 0.0) {
            return Err(SimError::invalid_config(format!(
                "time factor must be positive, got {}",
                self.time_factor
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn timing_follows_iterations_and_sub_steps() {
        let engine = Engine {
            iterations_per_second: 2500,
            sub_steps: 2,
            time_factor: 0.5,
            ..Engine::default()
        };
        assert_relative_eq!(engine.dt(), 0.0002);
        assert_relative_eq!(engine.tick_period().as_secs_f64(), 0.0008, epsilon = 1e-12);
    }

    #[test]
    fn rejects_zero_rates() {
        let engine = Engine {
            sub_steps: 0,
            ..Engine::default()
        };
        assert!(engine.validate().unwrap_err().is_config_error());
    }

    #[test]
    fn ticks_longer_than_a_second_are_valid() {
        let engine = Engine {
            iterations_per_second: 20,
            sub_steps: 50,
            ..Engine::default()
        };
        assert!(engine.validate().is_ok());
        assert_relative_eq!(engine.dt(), 0.05);
        assert_relative_eq!(engine.tick_period().as_secs_f64(), 2.5, epsilon = 1e-12);
    }
}
