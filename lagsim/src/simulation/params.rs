//! Numerical and physical parameters for the simulation
//!
//! `Parameters` holds runtime settings:
//! - gravitational acceleration applied to every body,
//! - Baumgarte gains given to constraints that do not set their own,
//! - settings of the multiplier solve (strategy, conditioning, regularisation)

use super::constraints::Gains;
use super::solver::SolverSettings;
use super::states::NVec3;

#[derive(Debug, Clone, PartialEq)]
pub struct Parameters {
    pub gravity: NVec3, // world acceleration, Y up
    pub gains: Gains, // default ks / kd
    pub solver: SolverSettings, // multiplier solve
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            gravity: NVec3::new(0.0, -9.81, 0.0),
            gains: Gains::default(),
            solver: SolverSettings::default(),
        }
    }
}
