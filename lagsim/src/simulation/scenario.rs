//! Build fully-initialized simulation scenarios from configuration
//!
//! Takes a `ScenarioConfig` (YAML-facing) and produces a runtime bundle
//! (`Scenario`) containing:
//! - driver settings (`Engine`)
//! - numerical parameters (`Parameters`)
//! - an initialized `PhysicsSystem` with every body and constraint registered
//! - the body names, in registration order, for reporting

use std::collections::HashMap;

use tracing::debug;

use crate::configuration::config::{BodyConfig, ConstraintConfig, ConstraintKindConfig, ScenarioConfig, ShapeConfig};
use crate::error::SimError;
use crate::simulation::constraints::{Constraint, Gains};
use crate::simulation::engine::Engine;
use crate::simulation::inertia;
use crate::simulation::params::Parameters;
use crate::simulation::solver::SolverSettings;
use crate::simulation::states::{BodyState, NMat3, NQuat, NVec3, ObjectHandle, Pose};
use crate::simulation::system::PhysicsSystem;

/// Runtime bundle built from a [`ScenarioConfig`]
#[derive(Debug, Clone)]
pub struct Scenario {
    pub engine: Engine,
    pub parameters: Parameters,
    pub system: PhysicsSystem,
    pub names: Vec<String>, // body names, indexed like the system's bodies
}

impl Scenario {
    pub fn build_scenario(cfg: ScenarioConfig) -> Result<Self, SimError> {
        // Parameters (runtime) from ParametersConfig and the engine's solver choice
        let p_cfg = &cfg.parameters;
        let defaults = SolverSettings::default();
        let parameters = Parameters {
            gravity: vec3(&p_cfg.gravity, "parameters.gravity")?,
            gains: Gains {
                ks: p_cfg.ks,
                kd: p_cfg.kd,
            },
            solver: SolverSettings {
                kind: cfg.engine.solver,
                conditioning_tolerance: p_cfg.conditioning_tolerance.unwrap_or(defaults.conditioning_tolerance),
                regularization: p_cfg.regularization.unwrap_or(defaults.regularization),
                cg_max_iterations: p_cfg.cg_max_iterations.unwrap_or(defaults.cg_max_iterations),
                cg_tolerance: p_cfg.cg_tolerance.unwrap_or(defaults.cg_tolerance),
            },
        };

        // Engine (runtime) from EngineConfig
        let e_cfg = &cfg.engine;
        let engine = Engine {
            simulate: e_cfg.simulate,
            iterations_per_second: e_cfg.iterations,
            sub_steps: e_cfg.sub_steps,
            time_factor: e_cfg.time_factor,
            start_active: e_cfg.start_active,
        };
        engine.validate()?;

        // Bodies: handles follow declaration order
        let mut bodies = Vec::with_capacity(cfg.bodies.len());
        let mut by_name: HashMap<&str, usize> = HashMap::new();
        for (i, bc) in cfg.bodies.iter().enumerate() {
            if by_name.insert(bc.name.as_str(), i).is_some() {
                return Err(SimError::invalid_config(format!("body name '{}' used twice", bc.name)));
            }
            bodies.push(build_body(ObjectHandle(i as u64), bc)?);
        }

        let constraints = cfg
            .constraints
            .iter()
            .map(|cc| build_constraint(cc, &bodies, &by_name, parameters.gains))
            .collect::<Result<Vec<_>, _>>()?;

        let mut system = PhysicsSystem::with_params(parameters.clone());
        system.set_bodies(bodies)?;
        system.set_constraints(constraints)?;
        system.initialize()?;

        Ok(Self {
            engine,
            parameters,
            system,
            names: cfg.bodies.into_iter().map(|b| b.name).collect(),
        })
    }

    /// Name of the body driving `handle`
    pub fn name_of(&self, handle: ObjectHandle) -> Option<&str> {
        self.names.get(handle.0 as usize).map(String::as_str)
    }
}

fn vec3(v: &[f64], field: &str) -> Result<NVec3, SimError> {
    match v {
        [x, y, z] => Ok(NVec3::new(*x, *y, *z)),
        _ => Err(SimError::invalid_config(format!("{field}: expected 3 components, got {}", v.len()))),
    }
}

fn opt_vec3(v: &Option<Vec<f64>>, field: &str) -> Result<NVec3, SimError> {
    v.as_deref().map_or(Ok(NVec3::zeros()), |v| vec3(v, field))
}

fn build_body(handle: ObjectHandle, bc: &BodyConfig) -> Result<BodyState, SimError> {
    let field = |f: &str| format!("bodies.{}.{f}", bc.name);

    // an arm places itself between its end points, long side along body Z
    let (mut pose, arm) = match &bc.shape {
        ShapeConfig::Arm { from, to, width } => {
            let from = vec3(from, &field("shape.arm.from"))?;
            let to = vec3(to, &field("shape.arm.to"))?;
            let dir = to - from;
            let length = dir.norm();
            if length <= 0.0 {
                return Err(SimError::invalid_config(format!("{}: arm ends coincide", field("shape"))));
            }
            let orientation = NQuat::rotation_between(&NVec3::z(), &dir)
                .unwrap_or_else(|| NQuat::from_axis_angle(&NVec3::x_axis(), std::f64::consts::PI));
            (Pose::new((from + to) * 0.5, orientation), Some((*width, length)))
        }
        _ => {
            let position = bc
                .position
                .as_deref()
                .ok_or_else(|| SimError::invalid_config(format!("{} is required", field("position"))))?;
            (Pose::from_position(vec3(position, &field("position"))?), None)
        }
    };
    if let Some(rot) = &bc.rotation {
        let axis = vec3(&rot.axis, &field("rotation.axis"))?;
        let axis = nalgebra::Unit::try_new(axis, 1.0e-12)
            .ok_or_else(|| SimError::invalid_config(format!("{} is zero", field("rotation.axis"))))?;
        pose.orientation = NQuat::from_axis_angle(&axis, rot.angle.to_radians()) * pose.orientation;
    }
    // an explicit position still wins over the arm midpoint
    if let (Some(position), Some(_)) = (bc.position.as_deref(), arm) {
        pose.position = vec3(position, &field("position"))?;
    }

    let inertia_of = |mass: Option<f64>, density: Option<f64>| -> Result<(f64, NMat3), SimError> {
        let dims = |v: &[f64], n: usize, what: &str| -> Result<Vec<f64>, SimError> {
            if v.len() == n {
                Ok(v.to_vec())
            } else {
                Err(SimError::invalid_config(format!("{}: expected {n} values", field(what))))
            }
        };
        Ok(match (&bc.shape, mass, density) {
            (ShapeConfig::Sphere(r), Some(m), None) => (m, inertia::sphere_inertia_mass(m, *r)),
            (ShapeConfig::Sphere(r), None, Some(d)) => (d * inertia::sphere_volume(*r), inertia::sphere_inertia_density(d, *r)),
            (ShapeConfig::Cube(s), Some(m), None) => (m, inertia::cube_inertia_mass(m, *s)),
            (ShapeConfig::Cube(s), None, Some(d)) => (d * s * s * s, inertia::cube_inertia_density(d, *s)),
            (ShapeConfig::Block(b), m, d) => {
                let b = dims(b, 3, "shape.block")?;
                match (m, d) {
                    (Some(m), None) => (m, inertia::block_inertia_mass(m, b[0], b[1], b[2])),
                    (None, Some(d)) => (d * b[0] * b[1] * b[2], inertia::block_inertia_density(d, b[0], b[1], b[2])),
                    _ => return Err(mass_xor_density(&field)),
                }
            }
            (ShapeConfig::Cylinder(c), m, d) => {
                let c = dims(c, 2, "shape.cylinder")?;
                match (m, d) {
                    (Some(m), None) => (m, inertia::cylinder_inertia_mass(m, c[0], c[1])),
                    (None, Some(d)) => (
                        d * std::f64::consts::PI * c[0] * c[0] * c[1],
                        inertia::cylinder_inertia_density(d, c[0], c[1]),
                    ),
                    _ => return Err(mass_xor_density(&field)),
                }
            }
            (ShapeConfig::Arm { .. }, m, d) => {
                let (w, l) = arm.unwrap_or_default();
                match (m, d) {
                    (Some(m), None) => (m, inertia::block_inertia_mass(m, w, w, l)),
                    (None, Some(d)) => (d * w * w * l, inertia::block_inertia_density(d, w, w, l)),
                    _ => return Err(mass_xor_density(&field)),
                }
            }
            (ShapeConfig::Inertia(rows), Some(m), None) => {
                if rows.len() != 3 || rows.iter().any(|r| r.len() != 3) {
                    return Err(SimError::invalid_config(format!("{}: expected a 3x3 matrix", field("shape.inertia"))));
                }
                (m, NMat3::from_fn(|r, c| rows[r][c]))
            }
            (ShapeConfig::Inertia(_), _, _) => {
                return Err(SimError::invalid_config(format!("{}: an explicit inertia needs a mass", field("shape"))))
            }
            _ => return Err(mass_xor_density(&field)),
        })
    };
    let (mass, inertia) = inertia_of(bc.mass, bc.density)?;

    let body = BodyState::new(handle, pose, mass, inertia)?
        .with_velocity(
            opt_vec3(&bc.linear_velocity, &field("linear_velocity"))?,
            opt_vec3(&bc.angular_velocity, &field("angular_velocity"))?,
        )
        .with_external_force(opt_vec3(&bc.force, &field("force"))?, opt_vec3(&bc.torque, &field("torque"))?);
    debug!(name = %bc.name, %handle, mass, "body built");
    Ok(body)
}

fn mass_xor_density(field: &dyn Fn(&str) -> String) -> SimError {
    SimError::invalid_config(format!("{}: give exactly one of mass or density", field("mass")))
}

fn build_constraint(
    cc: &ConstraintConfig,
    bodies: &[BodyState],
    by_name: &HashMap<&str, usize>,
    defaults: Gains,
) -> Result<Constraint, SimError> {
    let expected = match cc.kind {
        ConstraintKindConfig::FixedJoint | ConstraintKindConfig::FixedPivot | ConstraintKindConfig::FixedWeld => 1,
        ConstraintKindConfig::Joint | ConstraintKindConfig::Pivot | ConstraintKindConfig::Weld => 2,
    };
    if cc.bodies.len() != expected {
        return Err(SimError::invalid_config(format!(
            "{:?} constraint needs {expected} bodies, got {}",
            cc.kind,
            cc.bodies.len()
        )));
    }
    let resolved = cc
        .bodies
        .iter()
        .map(|name| {
            by_name
                .get(name.as_str())
                .map(|i| &bodies[*i])
                .ok_or_else(|| SimError::invalid_config(format!("constraint references unknown body '{name}'")))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let pin = vec3(&cc.pin, "constraints.pin")?;
    let axis = || -> Result<NVec3, SimError> {
        let axis = cc
            .axis
            .as_deref()
            .ok_or_else(|| SimError::invalid_config(format!("{:?} constraint needs an axis", cc.kind)))?;
        let axis = vec3(axis, "constraints.axis")?;
        if axis.norm() <= 1.0e-12 {
            return Err(SimError::invalid_config("constraints.axis is zero"));
        }
        Ok(axis)
    };

    let constraint = match cc.kind {
        ConstraintKindConfig::FixedJoint => Constraint::fixed_joint(resolved[0], pin),
        ConstraintKindConfig::Joint => Constraint::joint(resolved[0], resolved[1], pin),
        ConstraintKindConfig::FixedPivot => Constraint::fixed_pivot(resolved[0], pin, axis()?),
        ConstraintKindConfig::Pivot => Constraint::pivot(resolved[0], resolved[1], pin, axis()?),
        ConstraintKindConfig::FixedWeld => Constraint::fixed_weld(resolved[0], pin),
        ConstraintKindConfig::Weld => Constraint::weld(resolved[0], resolved[1], pin),
    };

    Ok(match (cc.ks, cc.kd) {
        (None, None) => constraint,
        (ks, kd) => constraint.with_gains(ks.unwrap_or(defaults.ks), kd.unwrap_or(defaults.kd)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn load(yaml: &str) -> Result<Scenario, SimError> {
        Scenario::build_scenario(ScenarioConfig::from_yaml(yaml).unwrap())
    }

    #[test]
    fn builds_an_initialized_pendulum() {
        let scenario = load(
            r#"
engine:
  iterations: 1000
  sub_steps: 10
bodies:
  - name: "rod"
    density: 1000.0
    shape: { arm: { from: [0.0, 2.0, 0.0], to: [1.0, 2.0, 0.0], width: 0.1 } }
constraints:
  - kind: "fixed_pivot"
    bodies: ["rod"]
    pin: [0.0, 2.0, 0.0]
    axis: [0.0, 0.0, 1.0]
"#,
        )
        .unwrap();
        assert!(scenario.system.is_initialized());
        assert_eq!(scenario.system.reduced_system_size().unwrap(), 5);
        assert_eq!(scenario.name_of(ObjectHandle(0)), Some("rod"));

        let body = &scenario.system.bodies()[0];
        assert_relative_eq!(body.mass(), 10.0, epsilon = 1e-9);
        assert_relative_eq!(body.pose().position, NVec3::new(0.5, 2.0, 0.0), epsilon = 1e-12);
        // body Z now points along world X
        assert_relative_eq!(body.pose().orientation * NVec3::z(), NVec3::x(), epsilon = 1e-12);
    }

    #[test]
    fn rotation_is_in_degrees() {
        let scenario = load(
            r#"
bodies:
  - name: "box"
    position: [0.0, 0.0, 0.0]
    rotation: { axis: [0.0, 1.0, 0.0], angle: 90.0 }
    mass: 1.0
    shape: { cube: 1.0 }
"#,
        )
        .unwrap();
        let q = scenario.system.bodies()[0].pose().orientation;
        assert_relative_eq!(q * NVec3::x(), -NVec3::z(), epsilon = 1e-12);
    }

    #[test]
    fn missing_body_is_a_config_error() {
        let err = load(
            r#"
bodies:
  - name: "a"
    position: [0.0, 0.0, 0.0]
    mass: 1.0
    shape: { sphere: 0.1 }
constraints:
  - kind: "joint"
    bodies: ["a", "ghost"]
    pin: [0.0, 0.0, 0.0]
"#,
        )
        .unwrap_err();
        assert!(err.is_config_error());
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn mass_and_density_are_exclusive() {
        let err = load(
            r#"
bodies:
  - name: "a"
    position: [0.0, 0.0, 0.0]
    mass: 1.0
    density: 1.0
    shape: { sphere: 0.1 }
"#,
        )
        .unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn per_constraint_gains_override_defaults() {
        let scenario = load(
            r#"
bodies:
  - name: "a"
    position: [0.0, 0.0, 0.0]
    mass: 1.0
    shape: { sphere: 0.1 }
constraints:
  - kind: "fixed_weld"
    bodies: ["a"]
    pin: [0.0, 0.0, 0.0]
    ks: 400.0
"#,
        )
        .unwrap();
        let gains = scenario.system.constraints()[0].gains().unwrap();
        assert_eq!(gains, Gains { ks: 400.0, kd: 20.0 });
    }
}
