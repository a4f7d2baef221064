//! The constrained multi-body system.
//!
//! Bodies and constraints are registered first, then [`PhysicsSystem::initialize`]
//! assigns body indices, resolves constraint handles and allocates every
//! buffer once. After that the registration set is frozen.
//!
//! One force evaluation at state `(q, dq)`:
//! 1. world inverse inertia `I_w⁻¹ = R I⁻¹ Rᵀ` per body
//! 2. external forces: gravity, constant loads, gyroscopic `-ω × (I_w ω)`
//! 3. `C`, `dC`, `J`, `dJ` from every constraint
//! 4. `A = J W Jᵀ`, `b = -dJ dq - J W F_ext - ks C - kd dC`
//! 5. `A λ = b`, `F_c = Jᵀ λ`
//! 6. `ddq = W (F_ext + F_c)`

use std::collections::HashMap;
use std::time::Instant;

use nalgebra::{DMatrix, DVector};
use tracing::{debug, error, info, warn};

use super::constraints::{Constraint, ConstraintBuffers, Kinematics};
use super::integrator::{self, Rk4Buffers};
use super::jacobian::BlockJacobian;
use super::params::Parameters;
use super::snapshot::{Diagnostics, Snapshot};
use super::solver::LinearSolver;
use super::states::{BodyState, BodyTransform, NMat3, NVec3, ObjectHandle, Pose, BODY_DOF};
use crate::error::SimError;

/// Every buffer the solver touches, allocated once at initialization
#[derive(Debug, Clone)]
pub(crate) struct Workspace {
    pub(crate) handles: Vec<ObjectHandle>,
    pub(crate) q: Vec<Pose>,
    pub(crate) dq: DVector<f64>, // 6 per body, world frame
    pub(crate) ddq: DVector<f64>,
    pub(crate) last_q: Vec<Pose>, // q before the last tick
    pub(crate) time: f64,
    pub(crate) diagnostics: Diagnostics,
    pub(crate) rk4: Rk4Buffers,

    // mass properties
    mass: Vec<f64>,
    inertia: Vec<NMat3>, // body frame
    inv_inertia: Vec<NMat3>, // body frame
    world_inv_inertia: Vec<NMat3>,
    loads: Vec<(NVec3, NVec3)>, // constant force / torque

    // constraint resolution
    f_ext: DVector<f64>,
    buffers: ConstraintBuffers,
    jw: BlockJacobian, // J W, same sparsity as J
    pairs: Vec<Vec<(usize, usize)>>, // per body: (constraint, block slot)
    system_matrix: DMatrix<f64>, // A
    rhs: DVector<f64>, // b
    scratch: DVector<f64>,
    lambda: DVector<f64>,
    fc: DVector<f64>,
    solver: LinearSolver,

    // tick rollback
    tick_q: Vec<Pose>,
    tick_dq: DVector<f64>,
    tick_time: f64,

    initial_q: Vec<Pose>,
    initial_dq: DVector<f64>,
}

impl Workspace {
    fn new(bodies: &[BodyState], constraints: &[Constraint], params: &Parameters) -> Self {
        let n = bodies.len();
        let layout: Vec<(usize, Vec<usize>)> = constraints
            .iter()
            .map(|c| (c.dof(), c.indices().to_vec()))
            .collect();
        let buffers = ConstraintBuffers::new(&layout, n);
        let rows = buffers.j.nrows();

        let mut pairs = vec![Vec::new(); n];
        for (ci, (_, indices)) in layout.iter().enumerate() {
            for (slot, body) in indices.iter().enumerate() {
                pairs[*body].push((ci, slot));
            }
        }

        let q: Vec<Pose> = bodies.iter().map(|b| *b.pose()).collect();
        let mut dq = DVector::zeros(BODY_DOF * n);
        for (i, b) in bodies.iter().enumerate() {
            dq.fixed_rows_mut::<3>(BODY_DOF * i).copy_from(&b.linear_velocity());
            dq.fixed_rows_mut::<3>(BODY_DOF * i + 3).copy_from(&b.angular_velocity());
        }
        let inv_inertia: Vec<NMat3> = bodies
            .iter()
            .map(|b| b.inertia().try_inverse().unwrap_or_else(NMat3::zeros))
            .collect();

        Self {
            handles: bodies.iter().map(BodyState::handle).collect(),
            last_q: q.clone(),
            ddq: DVector::zeros(BODY_DOF * n),
            time: 0.0,
            diagnostics: Diagnostics::default(),
            rk4: Rk4Buffers::new(&q),
            mass: bodies.iter().map(BodyState::mass).collect(),
            inertia: bodies.iter().map(|b| *b.inertia()).collect(),
            world_inv_inertia: inv_inertia.clone(),
            inv_inertia,
            loads: bodies.iter().map(BodyState::external_force).collect(),
            f_ext: DVector::zeros(BODY_DOF * n),
            jw: buffers.j.clone(),
            buffers,
            pairs,
            system_matrix: DMatrix::zeros(rows, rows),
            rhs: DVector::zeros(rows),
            scratch: DVector::zeros(rows),
            lambda: DVector::zeros(rows),
            fc: DVector::zeros(BODY_DOF * n),
            solver: LinearSolver::new(params.solver, rows),
            tick_q: q.clone(),
            tick_dq: dq.clone(),
            tick_time: 0.0,
            initial_q: q.clone(),
            initial_dq: dq.clone(),
            q,
            dq,
        }
    }

    fn body_count(&self) -> usize {
        self.q.len()
    }

    /// Fill `C`, `dC`, `J`, `dJ` at the current state
    fn evaluate_constraints(&mut self, constraints: &[Constraint]) {
        let kin = Kinematics {
            poses: &self.q,
            velocity: &self.dq,
        };
        let mut row = 0;
        for (index, constraint) in constraints.iter().enumerate() {
            constraint.evaluate(&kin, row, index, &mut self.buffers);
            row += constraint.dof();
        }
        self.diagnostics.max_residual = self.buffers.c.iter().fold(0.0, |m, v| m.max(v.abs()));
    }

    /// Compute `ddq` at the current `(q, dq)`
    pub(crate) fn evaluate(&mut self, constraints: &[Constraint], params: &Parameters) {
        self.diagnostics.evaluations += 1;

        for i in 0..self.body_count() {
            let rot = self.q[i].orientation.to_rotation_matrix();
            let r = rot.matrix();
            self.world_inv_inertia[i] = r * self.inv_inertia[i] * r.transpose();
            let world_inertia = r * self.inertia[i] * r.transpose();

            let w = self.dq.fixed_rows::<3>(BODY_DOF * i + 3).into_owned();
            let (force, torque) = self.loads[i];
            let linear = params.gravity * self.mass[i] + force;
            let angular = torque - w.cross(&(world_inertia * w));
            self.f_ext.fixed_rows_mut::<3>(BODY_DOF * i).copy_from(&linear);
            self.f_ext.fixed_rows_mut::<3>(BODY_DOF * i + 3).copy_from(&angular);
        }

        self.fc.fill(0.0);
        if !constraints.is_empty() {
            self.evaluate_constraints(constraints);
            self.assemble(constraints, params);
            self.solve_multipliers();
            self.buffers.j.tr_mul_vec(&self.lambda, &mut self.fc);
        }

        for i in 0..self.body_count() {
            let base = BODY_DOF * i;
            let force = self.f_ext.fixed_rows::<3>(base) + self.fc.fixed_rows::<3>(base);
            let torque = self.f_ext.fixed_rows::<3>(base + 3) + self.fc.fixed_rows::<3>(base + 3);
            let linear = force / self.mass[i];
            let angular = self.world_inv_inertia[i] * torque;
            self.ddq.fixed_rows_mut::<3>(base).copy_from(&linear);
            self.ddq.fixed_rows_mut::<3>(base + 3).copy_from(&angular);
        }
    }

    /// Build `J W`, `A` and `b`
    fn assemble(&mut self, constraints: &[Constraint], params: &Parameters) {
        for (ci, row) in self.buffers.j.rows().iter().enumerate() {
            let dst = self.jw.blocks_mut(ci);
            for (slot, (body, block)) in row.bodies.iter().zip(&row.blocks).enumerate() {
                let linear = block.fixed_columns::<3>(0) / self.mass[*body];
                let angular = block.fixed_columns::<3>(3) * self.world_inv_inertia[*body];
                dst[slot].fixed_columns_mut::<3>(0).copy_from(&linear);
                dst[slot].fixed_columns_mut::<3>(3).copy_from(&angular);
            }
        }

        // only constraints sharing a body produce a non-zero block of A
        self.system_matrix.fill(0.0);
        let j_rows = self.buffers.j.rows();
        let jw_rows = self.jw.rows();
        for entries in &self.pairs {
            for &(ci, si) in entries {
                let left = &jw_rows[ci];
                for &(cj, sj) in entries {
                    let right = &j_rows[cj];
                    let product = &left.blocks[si] * right.blocks[sj].transpose();
                    let mut dst = self
                        .system_matrix
                        .view_mut((left.row, right.row), (left.dof, right.dof));
                    dst += product;
                }
            }
        }

        self.buffers.dj.mul_vec(&self.dq, &mut self.rhs);
        self.jw.mul_vec(&self.f_ext, &mut self.scratch);
        self.rhs += &self.scratch;
        self.rhs.neg_mut();

        let mut row = 0;
        for constraint in constraints {
            let gains = constraint.gains().unwrap_or(params.gains);
            for k in row..row + constraint.dof() {
                self.rhs[k] -= gains.ks * self.buffers.c[k] + gains.kd * self.buffers.dc[k];
            }
            row += constraint.dof();
        }
    }

    fn solve_multipliers(&mut self) {
        let report = self.solver.solve(&self.system_matrix, &self.rhs, &mut self.lambda);
        let Some(degeneracy) = report.degeneracy else {
            return;
        };

        let diag = &mut self.diagnostics;
        diag.degenerate_solves += 1;
        diag.last_degeneracy = Some(degeneracy);
        if !report.applied {
            diag.skipped_solves += 1;
        }
        // the same rig usually degenerates on every evaluation; only the first is loud
        if diag.degenerate_solves == 1 {
            warn!(?degeneracy, applied = report.applied, t = self.time, "degenerate constraint solve");
        } else {
            debug!(?degeneracy, applied = report.applied, count = diag.degenerate_solves, "degenerate constraint solve");
        }
    }

    fn begin_tick(&mut self) {
        self.tick_q.clone_from(&self.q);
        self.tick_dq.copy_from(&self.dq);
        self.tick_time = self.time;
    }

    fn finish_tick(&mut self, constraints: &[Constraint]) {
        std::mem::swap(&mut self.last_q, &mut self.tick_q);
        self.diagnostics.ticks += 1;
        // stages leave their own residual behind; publish the one at q
        self.evaluate_constraints(constraints);
    }

    fn rollback_tick(&mut self, constraints: &[Constraint]) {
        self.q.clone_from(&self.tick_q);
        self.dq.copy_from(&self.tick_dq);
        self.time = self.tick_time;
        self.evaluate_constraints(constraints);
    }

    fn reset(&mut self) {
        self.q.clone_from(&self.initial_q);
        self.dq.copy_from(&self.initial_dq);
        self.last_q.clone_from(&self.initial_q);
        self.ddq.fill(0.0);
        self.lambda.fill(0.0);
        self.time = 0.0;
        self.diagnostics = Diagnostics::default();
    }
}

/// A set of rigid bodies coupled by constraints
#[derive(Debug, Clone, Default)]
pub struct PhysicsSystem {
    bodies: Vec<BodyState>,
    constraints: Vec<Constraint>,
    params: Parameters,
    workspace: Option<Box<Workspace>>, // Some once initialized
}

impl PhysicsSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_params(params: Parameters) -> Self {
        Self {
            params,
            ..Self::default()
        }
    }

    // ==================================================================================
    // Registration
    // ==================================================================================

    fn ensure_open(&self) -> Result<(), SimError> {
        if self.workspace.is_some() {
            return Err(SimError::AlreadyInitialized);
        }
        Ok(())
    }

    /// Append one body
    pub fn add_body(&mut self, body: BodyState) -> Result<(), SimError> {
        self.ensure_open()?;
        self.bodies.push(body);
        Ok(())
    }

    /// Replace the registered bodies
    pub fn set_bodies(&mut self, bodies: impl IntoIterator<Item = BodyState>) -> Result<(), SimError> {
        self.ensure_open()?;
        self.bodies = bodies.into_iter().collect();
        Ok(())
    }

    /// Append one constraint
    pub fn add_constraint(&mut self, constraint: Constraint) -> Result<(), SimError> {
        self.ensure_open()?;
        self.constraints.push(constraint);
        Ok(())
    }

    /// Replace the registered constraints
    pub fn set_constraints(&mut self, constraints: impl IntoIterator<Item = Constraint>) -> Result<(), SimError> {
        self.ensure_open()?;
        self.constraints = constraints.into_iter().collect();
        Ok(())
    }

    /// Freeze the registration set and allocate the solver.
    ///
    /// Fails on duplicate bodies, on constraints naming unregistered objects
    /// and when called twice. Nothing is modified on failure.
    pub fn initialize(&mut self) -> Result<(), SimError> {
        self.ensure_open()?;

        let mut slots = HashMap::with_capacity(self.bodies.len());
        for (i, body) in self.bodies.iter().enumerate() {
            if slots.insert(body.handle(), i).is_some() {
                return Err(SimError::DuplicateBody { handle: body.handle() });
            }
        }

        let mut resolved = Vec::with_capacity(self.constraints.len());
        for constraint in &self.constraints {
            let indices = constraint
                .handles()
                .iter()
                .map(|h| slots.get(h).copied().ok_or(SimError::UnknownBody { handle: *h }))
                .collect::<Result<Vec<_>, _>>()?;
            if indices.len() == 2 && indices[0] == indices[1] {
                return Err(SimError::invalid_config(format!(
                    "{} constraint joins {} to itself",
                    constraint.kind().name(),
                    constraint.handles()[0]
                )));
            }
            resolved.push(indices);
        }

        for (i, body) in self.bodies.iter_mut().enumerate() {
            body.index = Some(i);
        }
        for (constraint, indices) in self.constraints.iter_mut().zip(resolved) {
            constraint.bind(indices);
        }

        let mut workspace = Box::new(Workspace::new(&self.bodies, &self.constraints, &self.params));
        workspace.evaluate(&self.constraints, &self.params);
        workspace.diagnostics.evaluations = 0;
        self.workspace = Some(workspace);

        let dof = self.constraint_dof();
        info!(
            bodies = self.bodies.len(),
            constraints = self.constraints.len(),
            dof,
            "physics system initialized"
        );
        if dof > BODY_DOF * self.bodies.len() {
            warn!(dof, bodies = self.bodies.len(), "more constraint rows than body degrees of freedom");
        }
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.workspace.is_some()
    }

    fn ws(&self) -> Result<&Workspace, SimError> {
        self.workspace.as_deref().ok_or(SimError::NotInitialized)
    }

    // ==================================================================================
    // Inspection
    // ==================================================================================

    pub fn bodies(&self) -> &[BodyState] {
        &self.bodies
    }

    pub fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }

    pub fn params(&self) -> &Parameters {
        &self.params
    }

    pub fn handles(&self) -> Vec<ObjectHandle> {
        self.bodies.iter().map(BodyState::handle).collect()
    }

    /// Total degrees of freedom removed by all constraints
    pub fn constraint_dof(&self) -> usize {
        self.constraints.iter().map(Constraint::dof).sum()
    }

    /// Side of the multiplier system `A`
    pub fn reduced_system_size(&self) -> Result<usize, SimError> {
        Ok(self.ws()?.system_matrix.nrows())
    }

    /// Current poses, in registration order
    pub fn poses(&self) -> Result<&[Pose], SimError> {
        Ok(&self.ws()?.q)
    }

    /// Poses before the last tick
    pub fn last_poses(&self) -> Result<&[Pose], SimError> {
        Ok(&self.ws()?.last_q)
    }

    /// Current velocities, 6 per body (linear then angular, world frame)
    pub fn velocities(&self) -> Result<&DVector<f64>, SimError> {
        Ok(&self.ws()?.dq)
    }

    /// Simulated time since initialization or reset
    pub fn time(&self) -> Result<f64, SimError> {
        Ok(self.ws()?.time)
    }

    pub fn diagnostics(&self) -> Result<&Diagnostics, SimError> {
        Ok(&self.ws()?.diagnostics)
    }

    /// Multipliers from the last evaluation
    pub fn multipliers(&self) -> Result<&DVector<f64>, SimError> {
        Ok(&self.ws()?.lambda)
    }

    /// Constraint residual `C` at the current state
    pub fn residual(&mut self) -> Result<&DVector<f64>, SimError> {
        let Self { constraints, workspace, .. } = self;
        let ws = workspace.as_deref_mut().ok_or(SimError::NotInitialized)?;
        ws.evaluate_constraints(constraints);
        Ok(&ws.buffers.c)
    }

    /// `|C|∞` at the current state
    pub fn max_residual(&mut self) -> Result<f64, SimError> {
        Ok(self.residual()?.iter().fold(0.0, |m, v| m.max(v.abs())))
    }

    /// Evaluate forces at the current state and return the accelerations
    pub fn accelerations(&mut self) -> Result<&DVector<f64>, SimError> {
        let Self { constraints, params, workspace, .. } = self;
        let ws = workspace.as_deref_mut().ok_or(SimError::NotInitialized)?;
        ws.evaluate(constraints, params);
        Ok(&ws.ddq)
    }

    /// Kinetic plus gravitational potential energy
    pub fn total_energy(&self) -> Result<f64, SimError> {
        let ws = self.ws()?;
        let mut energy = 0.0;
        for i in 0..ws.body_count() {
            let v = ws.dq.fixed_rows::<3>(BODY_DOF * i);
            let w = ws.dq.fixed_rows::<3>(BODY_DOF * i + 3).into_owned();
            let rot = ws.q[i].orientation.to_rotation_matrix();
            let world_inertia = rot.matrix() * ws.inertia[i] * rot.matrix().transpose();
            energy += 0.5 * ws.mass[i] * v.norm_squared();
            energy += 0.5 * w.dot(&(world_inertia * w));
            energy -= ws.mass[i] * self.params.gravity.dot(&ws.q[i].position);
        }
        Ok(energy)
    }

    // ==================================================================================
    // Stepping
    // ==================================================================================

    /// Advance by `sub_steps` RK4 steps of `dt`.
    ///
    /// On divergence the whole tick is rolled back, the reason is recorded in
    /// the diagnostics and `SimError::Diverged` is returned.
    pub fn tick(&mut self, dt: f64, sub_steps: u32) -> Result<(), SimError> {
        let Self { constraints, params, workspace, .. } = self;
        let ws = workspace.as_deref_mut().ok_or(SimError::NotInitialized)?;

        ws.begin_tick();
        for _ in 0..sub_steps {
            if let Err(err) = integrator::rk4_step(ws, constraints, params, dt) {
                ws.rollback_tick(constraints);
                error!(%err, t = ws.time, "tick rolled back");
                ws.diagnostics.diverged = Some(err.to_string());
                return Err(err);
            }
        }
        ws.finish_tick(constraints);
        Ok(())
    }

    /// Restore the state captured at initialization
    pub fn reset(&mut self) -> Result<(), SimError> {
        let Self { constraints, params, workspace, .. } = self;
        let ws = workspace.as_deref_mut().ok_or(SimError::NotInitialized)?;
        ws.reset();
        ws.evaluate(constraints, params);
        ws.diagnostics.evaluations = 0;
        info!("physics system reset");
        Ok(())
    }

    // ==================================================================================
    // Output
    // ==================================================================================

    /// Current transforms, or a blend towards the previous tick when `smooth`
    pub fn query_positions(&self, smooth: bool, weight: f64) -> Result<Vec<BodyTransform>, SimError> {
        Ok(self.snapshot_at(Instant::now())?.positions(smooth, weight))
    }

    /// Copy of the published state
    pub fn snapshot(&self) -> Result<Snapshot, SimError> {
        self.snapshot_at(Instant::now())
    }

    pub(crate) fn snapshot_at(&self, published_at: Instant) -> Result<Snapshot, SimError> {
        let ws = self.ws()?;
        Ok(Snapshot {
            handles: ws.handles.clone(),
            q: ws.q.clone(),
            last_q: ws.last_q.clone(),
            tick: ws.diagnostics.ticks,
            time: ws.time,
            published_at,
            frozen_at: None,
            diagnostics: ws.diagnostics.clone(),
        })
    }
}
