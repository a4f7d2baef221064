pub mod states;
pub mod inertia;
pub mod params;
pub mod engine;
pub mod jacobian;
pub mod constraints;
pub mod solver;
pub mod system;
pub mod integrator;
pub mod snapshot;
pub mod driver;
pub mod scenario;
