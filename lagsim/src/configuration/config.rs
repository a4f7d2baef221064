//! Configuration types for loading simulation scenarios from YAML.
//!
//! A thin, `serde`-deserializable representation of a scenario:
//!
//! - [`EngineConfig`]     – driver options (rate, sub-steps, time factor, solver)
//! - [`ParametersConfig`] – gravity, default Baumgarte gains, solver tolerances
//! - [`BodyConfig`]       – initial state and mass properties of each body
//! - [`ConstraintConfig`] – constraints between named bodies
//! - [`ScenarioConfig`]   – top-level wrapper used to load a scenario from YAML
//!
//! # YAML format
//!
//! ```yaml
//! engine:
//!   simulate: true
//!   iterations: 10000          # RK4 steps per wall-clock second
//!   sub_steps: 50              # RK4 steps per tick
//!   time_factor: 1.0
//!   start_active: true
//!   solver: "cholesky"         # or "cg"
//!
//! parameters:
//!   gravity: [0.0, -9.81, 0.0]
//!   ks: 100.0
//!   kd: 20.0
//!
//! bodies:
//!   - name: "upper"
//!     position: [0.0, 2.5, 0.0]
//!     rotation: { axis: [1.0, 0.0, 0.0], angle: 90.0 }   # degrees
//!     mass: 1.0
//!     shape: { block: [0.1, 0.1, 1.0] }
//!   - name: "lower"
//!     density: 1000.0
//!     shape: { arm: { from: [0.0, 2.0, 0.0], to: [0.7, 1.3, 0.0], width: 0.1 } }
//!
//! constraints:
//!   - kind: "fixed_pivot"
//!     bodies: ["upper"]
//!     pin: [0.0, 3.0, 0.0]
//!     axis: [0.0, 0.0, 1.0]
//!   - kind: "pivot"
//!     bodies: ["upper", "lower"]
//!     pin: [0.0, 2.0, 0.0]
//!     axis: [0.0, 0.0, 1.0]
//!     ks: 200.0
//!     kd: 28.0
//! ```
//!
//! The loader in [`scenario`](crate::simulation::scenario) maps this into
//! bodies, constraints and an initialized physics system.

use serde::Deserialize;

use crate::simulation::solver::SolverKind;

/// Driver configuration
#[derive(Deserialize, Debug, Clone)]
pub struct EngineConfig {
    #[serde(default = "default_true")]
    pub simulate: bool, // `false` - bodies stay at their initial poses
    #[serde(default = "default_iterations")]
    pub iterations: u32, // RK4 steps per wall-clock second
    #[serde(default = "default_sub_steps")]
    pub sub_steps: u32, // RK4 steps per published tick
    #[serde(default = "default_time_factor")]
    pub time_factor: f64, // simulated seconds per wall-clock second
    #[serde(default = "default_true")]
    pub start_active: bool,
    #[serde(default)]
    pub solver: SolverKind,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            simulate: true,
            iterations: default_iterations(),
            sub_steps: default_sub_steps(),
            time_factor: default_time_factor(),
            start_active: true,
            solver: SolverKind::default(),
        }
    }
}

/// Physical constants and solver tolerances
#[derive(Deserialize, Debug, Clone)]
pub struct ParametersConfig {
    #[serde(default = "default_gravity")]
    pub gravity: Vec<f64>, // world acceleration
    #[serde(default = "default_ks")]
    pub ks: f64, // Baumgarte position gain
    #[serde(default = "default_kd")]
    pub kd: f64, // Baumgarte velocity gain
    pub regularization: Option<f64>,
    pub conditioning_tolerance: Option<f64>,
    pub cg_max_iterations: Option<usize>,
    pub cg_tolerance: Option<f64>,
}

impl Default for ParametersConfig {
    fn default() -> Self {
        Self {
            gravity: default_gravity(),
            ks: default_ks(),
            kd: default_kd(),
            regularization: None,
            conditioning_tolerance: None,
            cg_max_iterations: None,
            cg_tolerance: None,
        }
    }
}

/// Axis-angle rotation, angle in degrees
#[derive(Deserialize, Debug, Clone)]
pub struct RotationConfig {
    pub axis: Vec<f64>,
    pub angle: f64,
}

/// Solid shape used to derive the inertia tensor
#[derive(Deserialize, Debug, Clone)]
pub enum ShapeConfig {
    #[serde(rename = "sphere")] // radius
    Sphere(f64),
    #[serde(rename = "cube")] // edge length
    Cube(f64),
    #[serde(rename = "block")] // edge lengths along body X, Y, Z
    Block(Vec<f64>),
    #[serde(rename = "cylinder")] // [radius, height], axis along body Y
    Cylinder(Vec<f64>),
    #[serde(rename = "arm")] // square bar spanning two world points; sets pose too
    Arm {
        from: Vec<f64>,
        to: Vec<f64>,
        width: f64,
    },
    #[serde(rename = "inertia")] // explicit body-frame tensor, row major
    Inertia(Vec<Vec<f64>>),
}

/// Initial state of one body
#[derive(Deserialize, Debug, Clone)]
pub struct BodyConfig {
    pub name: String, // referenced by constraints
    #[serde(default)]
    pub position: Option<Vec<f64>>, // centre of mass; required unless the shape is an arm
    #[serde(default)]
    pub rotation: Option<RotationConfig>,
    #[serde(default)]
    pub linear_velocity: Option<Vec<f64>>,
    #[serde(default)]
    pub angular_velocity: Option<Vec<f64>>,
    pub mass: Option<f64>, // exactly one of mass / density
    pub density: Option<f64>,
    #[serde(with = "serde_yaml::with::singleton_map")]
    pub shape: ShapeConfig,
    #[serde(default)]
    pub force: Option<Vec<f64>>, // constant world force
    #[serde(default)]
    pub torque: Option<Vec<f64>>, // constant world torque
}

/// Which constraint to build; `bodies` lists one or two names accordingly
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintKindConfig {
    #[serde(rename = "fixed_joint")]
    FixedJoint,
    #[serde(rename = "joint")]
    Joint,
    #[serde(rename = "fixed_pivot")]
    FixedPivot,
    #[serde(rename = "pivot")]
    Pivot,
    #[serde(rename = "fixed_weld")]
    FixedWeld,
    #[serde(rename = "weld")]
    Weld,
}

/// One constraint between named bodies
#[derive(Deserialize, Debug, Clone)]
pub struct ConstraintConfig {
    pub kind: ConstraintKindConfig,
    pub bodies: Vec<String>,
    pub pin: Vec<f64>, // world point, initial configuration
    #[serde(default)]
    pub axis: Option<Vec<f64>>, // pivots only
    pub ks: Option<f64>, // overrides parameters.ks
    pub kd: Option<f64>,
}

/// Top-level scenario configuration loaded from YAML.
#[derive(Deserialize, Debug, Clone)]
pub struct ScenarioConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub parameters: ParametersConfig,
    pub bodies: Vec<BodyConfig>,
    #[serde(default)]
    pub constraints: Vec<ConstraintConfig>,
}

impl ScenarioConfig {
    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }
}

fn default_true() -> bool {
    true
}

fn default_iterations() -> u32 {
    10_000
}

fn default_sub_steps() -> u32 {
    50
}

fn default_time_factor() -> f64 {
    1.0
}

fn default_gravity() -> Vec<f64> {
    vec![0.0, -9.81, 0.0]
}

fn default_ks() -> f64 {
    100.0
}

fn default_kd() -> f64 {
    20.0
}
