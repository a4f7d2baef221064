//! Core state types for the constrained solver.
//!
//! Defines the per-body records handed to the [`PhysicsSystem`]:
//! - `ObjectHandle` links a body to the external scene object it drives
//! - `Pose` / `BodyTransform` position + orientation as seen by consumers
//! - `BodyState` mass properties and initial motion of one rigid body
//!
//! [`PhysicsSystem`]: crate::simulation::system::PhysicsSystem

use std::fmt;

use nalgebra::{Matrix3, UnitQuaternion, Vector3};

use crate::error::SimError;

pub type NVec3 = Vector3<f64>;
pub type NMat3 = Matrix3<f64>;
pub type NQuat = UnitQuaternion<f64>;

/// Number of velocity components per body (3 linear + 3 angular)
pub const BODY_DOF: usize = 6;

/// Opaque reference to an object owned by the scene layer.
///
/// The core never dereferences it; it is only echoed back with transforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectHandle(pub u64);

impl fmt::Display for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// World-space placement of a rigid body
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    pub position: NVec3, // centre of mass
    pub orientation: NQuat, // body -> world rotation
}

impl Pose {
    pub fn new(position: NVec3, orientation: NQuat) -> Self {
        Self { position, orientation }
    }

    /// Pose at `position` with identity orientation
    pub fn from_position(position: NVec3) -> Self {
        Self {
            position,
            orientation: NQuat::identity(),
        }
    }

    /// Body-local point to world space
    pub fn transform_point(&self, local: &NVec3) -> NVec3 {
        self.position + self.orientation * local
    }

    /// World point to body-local coordinates
    pub fn inverse_transform_point(&self, world: &NVec3) -> NVec3 {
        self.orientation.inverse() * (world - self.position)
    }

    /// Blend towards `other` by `t` (lerp for position, slerp for orientation)
    pub fn interpolate(&self, other: &Pose, t: f64) -> Pose {
        let position = self.position.lerp(&other.position, t);
        // slerp is undefined for exactly opposite quaternions; fall back to nlerp there
        let orientation = self
            .orientation
            .try_slerp(&other.orientation, t, 1.0e-12)
            .unwrap_or_else(|| self.orientation.nlerp(&other.orientation, t));
        Pose { position, orientation }
    }
}

/// Transform handed back to the scene layer for one body
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BodyTransform {
    pub handle: ObjectHandle, // external object to update
    pub pose: Pose, // new world pose
}

/// Physical description of one simulated rigid body.
///
/// Mass and inertia are fixed at construction. The index is assigned once by
/// [`PhysicsSystem::initialize`](crate::simulation::system::PhysicsSystem::initialize)
/// and identifies the body's 6-wide slice in every global vector.
#[derive(Debug, Clone)]
pub struct BodyState {
    handle: ObjectHandle, // scene object this body drives
    pose: Pose, // initial pose
    linear_velocity: NVec3, // initial linear velocity (world)
    angular_velocity: NVec3, // initial angular velocity (world)
    mass: f64, // strictly positive
    inertia: NMat3, // body-frame inertia tensor, SPD
    force: NVec3, // constant external force (world)
    torque: NVec3, // constant external torque (world)
    pub(crate) index: Option<usize>, // slot in the system, set by initialize
}

impl BodyState {
    /// Create a body at rest.
    ///
    /// Fails if the mass is not strictly positive and finite, or if the
    /// inertia tensor is not symmetric positive definite.
    pub fn new(handle: ObjectHandle, pose: Pose, mass: f64, inertia: NMat3) -> Result<Self, SimError> {
        if !(mass.is_finite() && mass > 0.0) {
            return Err(SimError::invalid_body(handle, format!("mass must be positive, got {mass}")));
        }
        if inertia.iter().any(|v| !v.is_finite()) {
            return Err(SimError::invalid_body(handle, "inertia tensor has non-finite entries"));
        }
        let asym = (inertia - inertia.transpose()).abs().max();
        if asym > 1.0e-9 * inertia.abs().max().max(1.0) {
            return Err(SimError::invalid_body(handle, "inertia tensor is not symmetric"));
        }
        if inertia.cholesky().is_none() {
            return Err(SimError::invalid_body(handle, "inertia tensor is not positive definite"));
        }
        if !(pose.position.iter().all(|v| v.is_finite()) && pose.orientation.coords.iter().all(|v| v.is_finite())) {
            return Err(SimError::invalid_body(handle, "pose has non-finite entries"));
        }

        Ok(Self {
            handle,
            pose,
            linear_velocity: NVec3::zeros(),
            angular_velocity: NVec3::zeros(),
            mass,
            inertia,
            force: NVec3::zeros(),
            torque: NVec3::zeros(),
            index: None,
        })
    }

    /// Set the velocities the body starts with
    pub fn with_velocity(mut self, linear: NVec3, angular: NVec3) -> Self {
        self.linear_velocity = linear;
        self.angular_velocity = angular;
        self
    }

    /// Apply a constant world-space force and torque on top of gravity
    pub fn with_external_force(mut self, force: NVec3, torque: NVec3) -> Self {
        self.force = force;
        self.torque = torque;
        self
    }

    pub fn handle(&self) -> ObjectHandle {
        self.handle
    }

    pub fn pose(&self) -> &Pose {
        &self.pose
    }

    pub fn linear_velocity(&self) -> NVec3 {
        self.linear_velocity
    }

    pub fn angular_velocity(&self) -> NVec3 {
        self.angular_velocity
    }

    pub fn mass(&self) -> f64 {
        self.mass
    }

    pub fn inertia(&self) -> &NMat3 {
        &self.inertia
    }

    pub fn external_force(&self) -> (NVec3, NVec3) {
        (self.force, self.torque)
    }

    /// Index assigned at initialization, `None` before
    pub fn index(&self) -> Option<usize> {
        self.index
    }
}

/// Skew-symmetric cross-product matrix: `skew(a) * b == a.cross(&b)`
pub fn skew(v: &NVec3) -> NMat3 {
    NMat3::new(
        0.0, -v.z, v.y,
        v.z, 0.0, -v.x,
        -v.y, v.x, 0.0,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn rejects_non_positive_mass() {
        let err = BodyState::new(ObjectHandle(1), Pose::from_position(NVec3::zeros()), 0.0, NMat3::identity());
        assert!(matches!(err, Err(SimError::InvalidBody { .. })));
    }

    #[test]
    fn rejects_indefinite_inertia() {
        let inertia = NMat3::from_diagonal(&NVec3::new(1.0, -1.0, 1.0));
        let err = BodyState::new(ObjectHandle(1), Pose::from_position(NVec3::zeros()), 1.0, inertia);
        assert!(err.is_err());
    }

    #[test]
    fn pose_point_round_trip() {
        let pose = Pose::new(
            NVec3::new(1.0, 2.0, 3.0),
            NQuat::from_axis_angle(&NVec3::z_axis(), 0.7),
        );
        let world = NVec3::new(-0.3, 0.4, 2.0);
        let back = pose.transform_point(&pose.inverse_transform_point(&world));
        assert_relative_eq!(back, world, epsilon = 1e-12);
    }

    #[test]
    fn skew_matches_cross() {
        let a = NVec3::new(0.3, -1.2, 2.0);
        let b = NVec3::new(1.1, 0.5, -0.7);
        assert_relative_eq!(skew(&a) * b, a.cross(&b), epsilon = 1e-12);
    }
}
