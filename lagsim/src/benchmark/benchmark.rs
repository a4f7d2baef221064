use std::time::Instant;

use crate::error::SimError;
use crate::simulation::constraints::Constraint;
use crate::simulation::inertia::block_inertia_density;
use crate::simulation::params::Parameters;
use crate::simulation::solver::{SolverKind, SolverSettings};
use crate::simulation::states::{BodyState, NQuat, NVec3, ObjectHandle, Pose};
use crate::simulation::system::PhysicsSystem;

const SEGMENT_LENGTH: f64 = 0.2;
const SEGMENT_WIDTH: f64 = 0.04;
const DENSITY: f64 = 1000.0;

/// A horizontal rope of `segments` bars hanging from a fixed joint at the origin,
/// each bar joined to the next at their shared end
pub fn rope_system(segments: usize, kind: SolverKind) -> Result<PhysicsSystem, SimError> {
    let mut bodies = Vec::with_capacity(segments);
    let mut constraints = Vec::with_capacity(segments);
    // bars lie along world X, their long side is body Z
    let orientation = NQuat::rotation_between(&NVec3::z(), &NVec3::x()).unwrap_or_else(NQuat::identity);
    let inertia = block_inertia_density(DENSITY, SEGMENT_WIDTH, SEGMENT_WIDTH, SEGMENT_LENGTH);
    let mass = DENSITY * SEGMENT_WIDTH * SEGMENT_WIDTH * SEGMENT_LENGTH;

    for i in 0..segments {
        let start = NVec3::new(i as f64 * SEGMENT_LENGTH, 0.0, 0.0);
        let centre = start + NVec3::new(0.5 * SEGMENT_LENGTH, 0.0, 0.0);
        let body = BodyState::new(ObjectHandle(i as u64), Pose::new(centre, orientation), mass, inertia)?;
        let constraint = match bodies.last() {
            None => Constraint::fixed_joint(&body, start),
            Some(prev) => Constraint::joint(prev, &body, start),
        };
        constraints.push(constraint);
        bodies.push(body);
    }

    let params = Parameters {
        solver: SolverSettings {
            kind,
            ..SolverSettings::default()
        },
        ..Parameters::default()
    };
    let mut sys = PhysicsSystem::with_params(params);
    sys.set_bodies(bodies)?;
    sys.set_constraints(constraints)?;
    sys.initialize()?;
    Ok(sys)
}

/// Time one tick of `steps` RK4 steps, in ms per step
fn time_steps(sys: &mut PhysicsSystem, dt: f64, steps: u32) -> Result<f64, SimError> {
    // Warm up
    sys.tick(dt, 1)?;

    let t0 = Instant::now();
    sys.tick(dt, steps)?;
    Ok(t0.elapsed().as_secs_f64() * 1000.0 / f64::from(steps))
}

/// Direct vs CG multiplier solve on ropes of growing length
pub fn bench_solvers() -> Result<(), SimError> {
    let ns = [4, 8, 16, 32, 64];
    let steps = 50;
    let dt = 1.0e-4;

    for n in ns {
        let mut direct = rope_system(n, SolverKind::Cholesky)?;
        let mut cg = rope_system(n, SolverKind::ConjugateGradient)?;

        let ms_direct = time_steps(&mut direct, dt, steps)?;
        let ms_cg = time_steps(&mut cg, dt, steps)?;

        let residual = direct.max_residual()?;
        println!(
            "segments = {n:3}, rows = {:4}, cholesky step = {ms_direct:8.4} ms, cg step = {ms_cg:8.4} ms, |C| = {residual:.2e}",
            direct.constraint_dof()
        );
    }
    Ok(())
}

/// Step cost against rope length as CSV
/// Paste output directly into a spreadsheet to graph
pub fn bench_rope_curve() -> Result<(), SimError> {
    println!("segments,rows,cholesky_ms,cg_ms");

    for n in (2..=96).step_by(2) {
        // Long ropes: fewer steps to keep the sweep short
        let steps = if n <= 32 { 20 } else { 5 };

        let mut direct = rope_system(n, SolverKind::Cholesky)?;
        let mut cg = rope_system(n, SolverKind::ConjugateGradient)?;

        let ms_direct = time_steps(&mut direct, 1.0e-4, steps)?;
        let ms_cg = time_steps(&mut cg, 1.0e-4, steps)?;

        println!("{},{},{:.6},{:.6}", n, direct.constraint_dof(), ms_direct, ms_cg);
    }
    Ok(())
}
