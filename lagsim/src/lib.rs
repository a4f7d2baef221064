pub mod error;
pub mod simulation;
pub mod configuration;
pub mod visualization;
pub mod benchmark;

pub use error::SimError;

pub use simulation::states::{BodyState, BodyTransform, ObjectHandle, Pose, NVec3, NMat3, NQuat};
pub use simulation::constraints::{Constraint, ConstraintKind, Gains};
pub use simulation::inertia::{
    sphere_inertia_mass, sphere_inertia_density, block_inertia_mass, block_inertia_density,
    cube_inertia_mass, cube_inertia_density, cylinder_inertia_mass, cylinder_inertia_density,
};
pub use simulation::solver::{SolverKind, SolverSettings, Degeneracy};
pub use simulation::params::Parameters;
pub use simulation::engine::Engine;
pub use simulation::system::PhysicsSystem;
pub use simulation::snapshot::{Snapshot, Diagnostics, TransformSink};
pub use simulation::driver::SimulationDriver;
pub use simulation::scenario::Scenario;

pub use configuration::config::{EngineConfig, ParametersConfig, BodyConfig, ConstraintConfig, ScenarioConfig};

pub use visualization::headless::{run_headless, HeadlessOptions, HeadlessReport};

pub use benchmark::benchmark::{bench_solvers, bench_rope_curve, rope_system};
