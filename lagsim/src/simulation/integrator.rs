//! Fixed-step RK4 integrator for the constrained system
//!
//! The state is `(q, dq)`: one pose per body and a 6-wide world-frame
//! velocity. Positions advance linearly, orientations by left-multiplying
//! the exponential map of the angular velocity: `R(t + h) = exp(h ω) R(t)`.
//! Every stage evaluates the full constrained dynamics, so one step costs
//! four force evaluations.

use nalgebra::DVector;

use super::constraints::Constraint;
use super::params::Parameters;
use super::states::{NQuat, Pose, BODY_DOF};
use super::system::Workspace;
use crate::error::SimError;

/// Per-step scratch state, allocated once with the system
#[derive(Debug, Clone)]
pub(crate) struct Rk4Buffers {
    pub(crate) q0: Vec<Pose>, // state at the start of the step
    pub(crate) dq0: DVector<f64>,
    velocity_sum: DVector<f64>, // k1 + 2k2 + 2k3 + k4 for q
    acceleration_sum: DVector<f64>, // same for dq
}

impl Rk4Buffers {
    pub(crate) fn new(q: &[Pose]) -> Self {
        let n = BODY_DOF * q.len();
        Self {
            q0: q.to_vec(),
            dq0: DVector::zeros(n),
            velocity_sum: DVector::zeros(n),
            acceleration_sum: DVector::zeros(n),
        }
    }
}

/// `out[i] = q0[i]` moved along `velocity` for `h` seconds
fn advance(q0: &[Pose], velocity: &DVector<f64>, h: f64, out: &mut [Pose]) {
    for (i, (start, pose)) in q0.iter().zip(out.iter_mut()).enumerate() {
        let v = velocity.fixed_rows::<3>(BODY_DOF * i);
        let w = velocity.fixed_rows::<3>(BODY_DOF * i + 3);
        pose.position = start.position + v * h;
        pose.orientation = NQuat::from_scaled_axis(w * h) * start.orientation;
    }
}

/// First body whose pose or velocity is not finite
fn first_non_finite(q: &[Pose], dq: &DVector<f64>) -> Option<usize> {
    q.iter().enumerate().position(|(i, pose)| {
        let finite_pose = pose.position.iter().chain(pose.orientation.coords.iter()).all(|v| v.is_finite());
        let finite_velocity = dq.rows(BODY_DOF * i, BODY_DOF).iter().all(|v| v.is_finite());
        !(finite_pose && finite_velocity)
    })
}

/// Advance the workspace state by one RK4 step of `dt`.
///
/// On a non-finite result the state is restored to the start of the step and
/// `SimError::Diverged` is returned.
pub(crate) fn rk4_step(ws: &mut Workspace, constraints: &[Constraint], params: &Parameters, dt: f64) -> Result<(), SimError> {
    if ws.q.is_empty() {
        ws.time += dt;
        ws.diagnostics.steps += 1;
        return Ok(());
    }

    // y0
    ws.rk4.q0.clone_from(&ws.q);
    ws.rk4.dq0.copy_from(&ws.dq);
    ws.rk4.velocity_sum.fill(0.0);
    ws.rk4.acceleration_sum.fill(0.0);

    // (offset of the next stage from y0, weight of this stage)
    let stages = [(0.5 * dt, 1.0), (0.5 * dt, 2.0), (dt, 2.0), (0.0, 1.0)];

    for (next, weight) in stages {
        // k_i = f(y_i): velocity is dq itself, acceleration from the constrained solve
        ws.evaluate(constraints, params);
        ws.rk4.velocity_sum.axpy(weight, &ws.dq, 1.0);
        ws.rk4.acceleration_sum.axpy(weight, &ws.ddq, 1.0);

        if next > 0.0 {
            // y_{i+1} = y0 + next * k_i
            advance(&ws.rk4.q0, &ws.dq, next, &mut ws.q);
            ws.dq.copy_from(&ws.rk4.dq0);
            ws.dq.axpy(next, &ws.ddq, 1.0);
        }
    }

    // y1 = y0 + dt/6 (k1 + 2k2 + 2k3 + k4)
    ws.rk4.velocity_sum /= 6.0;
    advance(&ws.rk4.q0, &ws.rk4.velocity_sum, dt, &mut ws.q);
    ws.dq.copy_from(&ws.rk4.dq0);
    ws.dq.axpy(dt / 6.0, &ws.rk4.acceleration_sum, 1.0);

    // keep orientations unit length
    for pose in ws.q.iter_mut() {
        pose.orientation.renormalize();
    }

    if let Some(body) = first_non_finite(&ws.q, &ws.dq) {
        let handle = ws.handles[body];
        ws.q.clone_from(&ws.rk4.q0);
        ws.dq.copy_from(&ws.rk4.dq0);
        return Err(SimError::diverged(format!(
            "non-finite state for body {handle} at t = {:.6}",
            ws.time
        )));
    }

    ws.time += dt;
    ws.diagnostics.steps += 1;
    Ok(())
}
