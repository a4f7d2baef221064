use std::thread;
use std::time::{Duration, Instant};

use approx::assert_relative_eq;

use lagsim::simulation::states::{BodyState, NMat3, NQuat, NVec3, ObjectHandle, Pose};
use lagsim::simulation::constraints::Constraint;
use lagsim::simulation::inertia::{block_inertia_mass, cylinder_inertia_mass, sphere_inertia_mass};
use lagsim::simulation::system::PhysicsSystem;
use lagsim::simulation::engine::Engine;
use lagsim::simulation::driver::SimulationDriver;
use lagsim::{Scenario, ScenarioConfig, SimError};

const DT: f64 = 1.0e-3;

/// A bar of square section `width` spanning `from` -> `to`, long side along body Z
pub fn arm(id: u64, from: NVec3, to: NVec3, width: f64, density: f64) -> BodyState {
    let dir = to - from;
    let length = dir.norm();
    let mass = width * width * length * density;
    let orientation = NQuat::rotation_between(&NVec3::z(), &dir).unwrap_or_else(NQuat::identity);
    BodyState::new(
        ObjectHandle(id),
        Pose::new((from + to) * 0.5, orientation),
        mass,
        block_inertia_mass(mass, width, width, length),
    )
    .unwrap()
}

/// A solid ball of `mass` centred on `at`
pub fn ball(id: u64, at: NVec3, diameter: f64, mass: f64) -> BodyState {
    BodyState::new(ObjectHandle(id), Pose::from_position(at), mass, sphere_inertia_mass(mass, 0.5 * diameter)).unwrap()
}

/// A disc whose axis (body Y) points along `axis`
pub fn wheel(id: u64, at: NVec3, axis: NVec3, diameter: f64, mass: f64) -> BodyState {
    let orientation = NQuat::rotation_between(&NVec3::y(), &axis).unwrap_or_else(NQuat::identity);
    BodyState::new(
        ObjectHandle(id),
        Pose::new(at, orientation),
        mass,
        cylinder_inertia_mass(mass, 0.5 * diameter, 0.1 * diameter),
    )
    .unwrap()
}

pub fn build(bodies: Vec<BodyState>, constraints: Vec<Constraint>) -> PhysicsSystem {
    let mut sys = PhysicsSystem::new();
    sys.set_bodies(bodies).unwrap();
    sys.set_constraints(constraints).unwrap();
    sys.initialize().unwrap();
    sys
}

/// Two bars hanging from a fixed pivot, joined by a pivot, both free to swing about Z
pub fn double_pendulum() -> PhysicsSystem {
    let axis = NVec3::z();
    let pin1 = NVec3::new(0.0, 3.0, 0.0);
    let pin2 = NVec3::new(1.0, 3.0, 0.0);
    let pin3 = NVec3::new(1.0, 2.0, 0.0);
    let upper = arm(1, pin1, pin2, 0.1, 1000.0);
    let lower = arm(2, pin2, pin3, 0.1, 1000.0);
    let constraints = vec![
        Constraint::fixed_pivot(&upper, pin1, axis),
        Constraint::pivot(&upper, &lower, pin2, axis),
    ];
    build(vec![upper, lower], constraints)
}

/// Fixed pivot, arm, weighted pivot, arm, weighted pivot. The pivot bodies
/// are discs on the shared axis, tilted `angle` degrees from X towards Y;
/// the lower arm starts horizontal and the upper one vertical.
pub fn weighted_double_pendulum(angle: f64, weight: f64) -> PhysicsSystem {
    let angle = angle.to_radians();
    let axis = NVec3::new(angle.cos(), angle.sin(), 0.0);
    let pin1 = NVec3::new(0.0, 3.5, 0.0);
    let pin2 = pin1 + NVec3::new(0.0, 0.0, 1.0);
    let pin3 = pin2 + NVec3::new(0.0, 1.0, 0.0);

    let arm1 = arm(1, pin1, pin2, 0.1, 1000.0);
    let pivot2 = wheel(2, pin2, axis, 0.5, weight);
    let arm2 = arm(3, pin2, pin3, 0.1, 1000.0);
    let pivot3 = wheel(4, pin3, axis, 0.5, weight);
    let constraints = vec![
        Constraint::fixed_pivot(&arm1, pin1, axis),
        Constraint::pivot(&arm1, &pivot2, pin2, axis),
        Constraint::pivot(&pivot2, &arm2, pin2, axis),
        Constraint::pivot(&arm2, &pivot3, pin3, axis),
    ];
    build(vec![arm1, pivot2, arm2, pivot3], constraints)
}

/// The trebuchet truss: a braced frame of 15 bars, 4 wheels, a throwing arm
/// and a counterweight, held by 31 joints (many of them redundant)
pub fn trebuchet(weight: f64) -> PhysicsSystem {
    let w_ul = NVec3::new(-1.0, 0.15, 0.5);
    let w_ur = NVec3::new(1.0, 0.15, 0.5);
    let w_dl = NVec3::new(-1.0, 0.15, -0.5);
    let w_dr = NVec3::new(1.0, 0.15, -0.5);
    let t_u = NVec3::new(0.0, 1.5, 0.3);
    let t_d = NVec3::new(0.0, 1.5, -0.3);
    let (width, density) = (0.1, 1000.0);

    let bar = |id, a, b| arm(id, a, b, width, density);
    let arm1 = bar(1, w_ul, w_ur);
    let arm2 = bar(2, w_dl, w_dr);
    let arm3 = bar(3, w_ul, w_dl);
    let arm4 = bar(4, w_ur, w_dr);
    let arm5 = bar(5, w_ur, w_dl);
    let arm6 = bar(6, w_ul, w_dr);
    let arm7 = bar(7, w_ul, t_u);
    let arm8 = bar(8, w_ur, t_u);
    let arm9 = bar(9, w_dl, t_d);
    let arm10 = bar(10, w_dr, t_d);
    let arm11 = bar(11, t_u, t_d);
    let arm12 = bar(12, w_dl, t_u);
    let arm13 = bar(13, w_ur, t_d);

    let t_m = (t_u + t_d) * 0.5;
    let dir = NVec3::new(1.0, 1.0, 0.0);
    let a_1 = t_m + dir;
    let a_2 = t_m - dir;
    let a_3 = a_1 - NVec3::new(0.0, 0.5, 0.0);
    let arm14 = bar(14, a_1, a_2);
    let arm15 = bar(15, a_1, a_3);
    let mass = ball(16, a_3, 0.3, weight);

    let wheel1 = wheel(17, w_dl, -NVec3::z(), 0.3, 100.0);
    let wheel2 = wheel(18, w_dr, -NVec3::z(), 0.3, 100.0);
    let wheel3 = wheel(19, w_ul, NVec3::z(), 0.3, 100.0);
    let wheel4 = wheel(20, w_ur, NVec3::z(), 0.3, 100.0);

    let j = Constraint::joint;
    let constraints = vec![
        j(&arm1, &wheel4, w_ur),
        j(&arm2, &wheel1, w_dl),
        j(&arm3, &wheel3, w_ul),
        j(&arm4, &wheel2, w_dr),
        Constraint::fixed_joint(&arm1, w_ur),
        Constraint::fixed_joint(&arm2, w_dr),
        Constraint::fixed_joint(&arm3, w_ul),
        Constraint::fixed_joint(&arm4, w_dl),
        j(&arm1, &arm3, w_ul),
        j(&arm1, &arm4, w_ur),
        j(&arm2, &arm4, w_dr),
        j(&arm2, &arm3, w_dl),
        j(&arm5, &arm4, w_ur),
        j(&arm5, &arm3, w_dl),
        j(&arm6, &arm2, w_dr),
        j(&arm6, &arm1, w_ul),
        j(&arm7, &arm6, w_ul),
        j(&arm8, &arm5, w_ur),
        j(&arm9, &arm5, w_dl),
        j(&arm10, &arm6, w_dr),
        j(&arm7, &arm8, t_u),
        j(&arm9, &arm10, t_d),
        j(&arm11, &arm7, t_u),
        j(&arm11, &arm9, t_d),
        j(&arm12, &arm11, t_u),
        j(&arm12, &arm9, w_dl),
        j(&arm13, &arm11, t_d),
        j(&arm13, &arm8, w_ur),
        j(&arm14, &arm11, t_m),
        j(&arm15, &arm14, a_1),
        j(&mass, &arm15, a_3),
    ];
    let bodies = vec![
        arm1, arm2, arm3, arm4, arm5, arm6, arm7, arm8, arm9, arm10, arm11, arm12, arm13, arm14, arm15, mass,
        wheel1, wheel2, wheel3, wheel4,
    ];
    build(bodies, constraints)
}

/// One rig per constraint kind: single-body kinds hang a bar from a pin,
/// two-body kinds hang a bar from a world-welded anchor block
pub fn rig_for(kind: &str) -> PhysicsSystem {
    let pin = NVec3::new(0.0, 2.0, 0.0);
    let tilted = NVec3::new(0.3, 0.2, 1.0).normalize();
    let bar = arm(1, pin, pin + NVec3::new(0.8, -0.3, 0.2), 0.1, 1000.0);
    let anchor = BodyState::new(ObjectHandle(2), Pose::from_position(pin + NVec3::new(-0.2, 0.0, 0.0)), 5.0, NMat3::identity() * 0.05).unwrap();
    let hold = Constraint::fixed_weld(&anchor, anchor.pose().position);

    let (bodies, constraints) = match kind {
        "fixed_joint" => (vec![bar.clone()], vec![Constraint::fixed_joint(&bar, pin)]),
        "fixed_pivot" => (vec![bar.clone()], vec![Constraint::fixed_pivot(&bar, pin, tilted)]),
        "fixed_weld" => (vec![bar.clone()], vec![Constraint::fixed_weld(&bar, pin)]),
        "joint" => (vec![bar.clone(), anchor.clone()], vec![hold, Constraint::joint(&anchor, &bar, pin)]),
        "pivot" => (vec![bar.clone(), anchor.clone()], vec![hold, Constraint::pivot(&anchor, &bar, pin, tilted)]),
        "weld" => (vec![bar.clone(), anchor.clone()], vec![hold, Constraint::weld(&anchor, &bar, pin)]),
        other => panic!("no rig for {other}"),
    };
    build(bodies, constraints)
}

const KINDS: [&str; 6] = ["fixed_joint", "joint", "fixed_pivot", "pivot", "fixed_weld", "weld"];

fn run_for(sys: &mut PhysicsSystem, seconds: f64, sub_steps: u32) {
    let ticks = (seconds / (DT * f64::from(sub_steps))).round() as u32;
    for _ in 0..ticks {
        sys.tick(DT, sub_steps).unwrap();
    }
}

fn engine(iterations: u32, sub_steps: u32, start_active: bool) -> Engine {
    Engine {
        iterations_per_second: iterations,
        sub_steps,
        start_active,
        ..Engine::default()
    }
}

fn wait_until(timeout: Duration, mut f: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + timeout;
    while Instant::now() < end {
        if f() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    f()
}

// ==================================================================================
// Constraint accounting
// ==================================================================================

#[test]
fn reduced_system_matches_constraint_dof() {
    let a = ball(1, NVec3::zeros(), 0.2, 1.0);
    let b = ball(2, NVec3::x(), 0.2, 1.0);
    let pin = NVec3::new(0.5, 0.0, 0.0);
    let axis = NVec3::y();
    let sys = build(
        vec![a.clone(), b.clone()],
        vec![
            Constraint::fixed_joint(&a, pin),
            Constraint::joint(&a, &b, pin),
            Constraint::fixed_pivot(&a, pin, axis),
            Constraint::pivot(&a, &b, pin, axis),
            Constraint::fixed_weld(&b, pin),
            Constraint::weld(&a, &b, pin),
        ],
    );
    assert_eq!(sys.constraint_dof(), 28);
    assert_eq!(sys.reduced_system_size().unwrap(), 28, "A must be sum(dof) square");
}

#[test]
fn trebuchet_has_redundant_rows() {
    let sys = trebuchet(50.0);
    assert_eq!(sys.bodies().len(), 20);
    assert_eq!(sys.reduced_system_size().unwrap(), 93);
}

// ==================================================================================
// Constraint satisfaction
// ==================================================================================

#[test]
fn every_kind_holds_its_residual() {
    for kind in KINDS {
        let mut sys = rig_for(kind);
        assert!(sys.max_residual().unwrap() < 1e-12, "{kind} violated at start");
        run_for(&mut sys, 1.0, 10);
        let residual = sys.max_residual().unwrap();
        assert!(residual < 1e-4, "{kind} drifted to {residual}");
    }
}

#[test]
fn swinging_rigs_actually_move() {
    for kind in ["fixed_joint", "joint", "fixed_pivot", "pivot"] {
        let mut sys = rig_for(kind);
        let start = sys.poses().unwrap()[0].position;
        run_for(&mut sys, 0.3, 10);
        let moved = (sys.poses().unwrap()[0].position - start).norm();
        assert!(moved > 1e-2, "{kind} bar did not swing ({moved})");
    }
}

#[test]
fn welds_keep_bodies_still() {
    for kind in ["fixed_weld", "weld"] {
        let mut sys = rig_for(kind);
        let start = sys.poses().unwrap().to_vec();
        run_for(&mut sys, 0.5, 10);
        for (p, s) in sys.poses().unwrap().iter().zip(&start) {
            assert_relative_eq!(p.position, s.position, epsilon = 1e-5);
            assert!(p.orientation.angle_to(&s.orientation) < 1e-5, "{kind} rotated");
        }
    }
}

#[test]
fn pivot_only_rotates_about_its_axis() {
    let axis = NVec3::new(0.3, 0.2, 1.0).normalize();
    let mut sys = rig_for("fixed_pivot");
    let start = sys.poses().unwrap()[0].orientation;
    run_for(&mut sys, 0.5, 10);
    let relative = sys.poses().unwrap()[0].orientation * start.inverse();
    let rotation_axis = relative.axis().unwrap();
    assert!(relative.angle() > 1e-2);
    assert_relative_eq!(rotation_axis.dot(&axis).abs(), 1.0, epsilon = 1e-4);
}

#[test]
fn trebuchet_truss_keeps_its_shape() {
    let mut sys = trebuchet(50.0);
    let frame_start = sys.poses().unwrap()[0].position;
    run_for(&mut sys, 2.0, 20);

    let residual = sys.max_residual().unwrap();
    assert!(residual < 1e-3, "joint separation grew to {residual}");
    // the frame is pinned to the ground
    assert_relative_eq!(sys.poses().unwrap()[0].position, frame_start, epsilon = 1e-3);
    // the redundant joints went through the regularised path, not divergence
    let diag = sys.diagnostics().unwrap();
    assert!(diag.degenerate_solves > 0);
    assert!(diag.diverged.is_none());
}

// ==================================================================================
// Dynamics
// ==================================================================================

#[test]
fn free_body_follows_projectile_motion() {
    let x0 = NVec3::new(0.0, 1.0, 0.0);
    let v0 = NVec3::new(1.0, 5.0, -0.5);
    let w0 = NVec3::new(0.3, 0.0, 0.2);
    let body = ball(1, x0, 0.2, 1.5).with_velocity(v0, w0);
    let mut sys = build(vec![body], vec![]);

    run_for(&mut sys, 1.0, 10);
    let t = sys.time().unwrap();
    assert_relative_eq!(t, 1.0, epsilon = 1e-9);

    let g = NVec3::new(0.0, -9.81, 0.0);
    let expected = x0 + v0 * t + g * (0.5 * t * t);
    let pose = sys.poses().unwrap()[0];
    assert_relative_eq!(pose.position, expected, epsilon = 1e-9);
    assert_relative_eq!(pose.orientation.angle(), w0.norm() * t, epsilon = 1e-9);

    let v = sys.velocities().unwrap();
    assert_relative_eq!(v[1], v0.y + g.y * t, epsilon = 1e-9);
}

fn assert_energy_bounded(mut sys: PhysicsSystem) {
    let e0 = sys.total_energy().unwrap();
    let start = sys.poses().unwrap().to_vec();
    let tolerance = 1e-3 * e0.abs().max(1.0);

    for _ in 0..40 {
        run_for(&mut sys, 0.05, 10);
        let e = sys.total_energy().unwrap();
        assert!(e - e0 < tolerance, "energy grew from {e0} to {e}");
    }
    let e = sys.total_energy().unwrap();
    assert!(e0 - e < 0.05 * e0.abs(), "energy collapsed from {e0} to {e}");
    assert!(sys.max_residual().unwrap() < 1e-4);

    let moved = sys.poses().unwrap().iter().zip(&start).any(|(p, s)| (p.position - s.position).norm() > 0.1);
    assert!(moved, "pendulum did not swing");
}

#[test]
fn double_pendulum_energy_does_not_grow() {
    assert_energy_bounded(double_pendulum());
}

#[test]
fn weighted_double_pendulum_energy_does_not_grow() {
    assert_energy_bounded(weighted_double_pendulum(0.0, 5.0));
}

#[test]
fn tilted_weighted_double_pendulum_energy_does_not_grow() {
    assert_energy_bounded(weighted_double_pendulum(30.0, 5.0));
}

#[test]
fn weighted_double_pendulum_shares_the_middle_pivot() {
    let sys = weighted_double_pendulum(0.0, 5.0);
    assert_eq!(sys.bodies().len(), 4);
    assert_eq!(sys.constraints().len(), 4);
    assert_eq!(sys.constraint_dof(), 20);
    assert_eq!(sys.reduced_system_size().unwrap(), 20);
}

#[test]
fn double_pendulum_stays_planar() {
    let mut sys = double_pendulum();
    run_for(&mut sys, 1.0, 10);
    for pose in sys.poses().unwrap() {
        assert!(pose.position.z.abs() < 1e-6, "left the XY plane: {}", pose.position.z);
    }
}

#[test]
fn divergence_rolls_back_the_tick() {
    let runaway = ball(1, NVec3::zeros(), 0.2, 1.0).with_external_force(NVec3::new(f64::INFINITY, 0.0, 0.0), NVec3::zeros());
    let mut sys = build(vec![runaway], vec![]);
    let before = sys.poses().unwrap().to_vec();

    let err = sys.tick(DT, 5).unwrap_err();
    assert!(err.is_diverged());
    assert_eq!(sys.poses().unwrap(), before.as_slice());
    assert_eq!(sys.time().unwrap(), 0.0);
    assert!(sys.diagnostics().unwrap().is_diverged());
}

// ==================================================================================
// Queries
// ==================================================================================

#[test]
fn plain_query_is_idempotent() {
    let mut sys = double_pendulum();
    sys.tick(DT, 10).unwrap();
    let first = sys.query_positions(false, 0.0).unwrap();
    let second = sys.query_positions(false, 0.0).unwrap();
    assert_eq!(first, second);
    assert_eq!(first[1].handle, ObjectHandle(2));
    assert_eq!(first[1].pose, sys.poses().unwrap()[1]);
}

#[test]
fn smooth_query_blends_between_ticks() {
    let mut sys = double_pendulum();
    sys.tick(DT, 50).unwrap();
    let q = sys.poses().unwrap().to_vec();
    let last = sys.last_poses().unwrap().to_vec();

    let at_start = sys.query_positions(true, 0.0).unwrap();
    let at_end = sys.query_positions(true, 1.0).unwrap();
    let middle = sys.query_positions(true, 0.25).unwrap();

    for i in 0..q.len() {
        assert_eq!(at_start[i].pose, q[i]);
        assert_eq!(at_end[i].pose, last[i]);
        for k in 0..3 {
            let (lo, hi) = (q[i].position[k].min(last[i].position[k]), q[i].position[k].max(last[i].position[k]));
            let v = middle[i].pose.position[k];
            assert!(lo - 1e-12 <= v && v <= hi + 1e-12, "component {k} of body {i} outside [{lo}, {hi}]");
        }
        let expected = q[i].position + (last[i].position - q[i].position) * 0.25;
        assert_relative_eq!(middle[i].pose.position, expected, epsilon = 1e-12);
    }
}

// ==================================================================================
// Driver
// ==================================================================================

#[test]
fn driver_refuses_uninitialized_system() {
    let mut sys = PhysicsSystem::new();
    sys.add_body(ball(1, NVec3::zeros(), 0.2, 1.0)).unwrap();
    let err = SimulationDriver::start(sys, &engine(1000, 10, true)).unwrap_err();
    assert_eq!(err, SimError::NotInitialized);
}

#[test]
fn driver_advances_and_stops() {
    let driver = SimulationDriver::start(double_pendulum(), &engine(2000, 20, true)).unwrap();
    assert!(driver.is_active());
    assert!(wait_until(Duration::from_secs(2), || driver.diagnostics().ticks >= 3));
    assert_eq!(driver.query_positions(false).len(), 2);
    driver.stop().unwrap();
}

#[test]
fn paused_driver_publishes_nothing() {
    let driver = SimulationDriver::start(double_pendulum(), &engine(2000, 20, true)).unwrap();
    assert!(wait_until(Duration::from_secs(2), || driver.diagnostics().ticks >= 2));

    driver.set_active(false);
    assert!(!driver.is_active());
    let plain = driver.query_positions(false);
    let smooth = driver.query_positions(true);
    let tick = driver.snapshot().tick;

    thread::sleep(Duration::from_millis(60));
    assert_eq!(driver.query_positions(false), plain);
    assert_eq!(driver.query_positions(true), smooth);
    assert_eq!(driver.snapshot().tick, tick);
}

#[test]
fn resume_continues_from_the_paused_state() {
    let reference = double_pendulum();
    let driver = SimulationDriver::start(reference.clone(), &engine(2000, 20, true)).unwrap();

    assert!(wait_until(Duration::from_secs(2), || driver.diagnostics().ticks >= 2));
    driver.set_active(false);
    let first = driver.snapshot();

    driver.set_active(true);
    assert!(wait_until(Duration::from_secs(2), || driver.diagnostics().ticks >= first.tick + 3));
    driver.set_active(false);
    let second = driver.snapshot();
    driver.stop().unwrap();

    // the same ticks run cooperatively land on bit-identical poses
    let mut cooperative = reference;
    for _ in 0..first.tick {
        cooperative.tick(Engine::default().time_factor / 2000.0, 20).unwrap();
    }
    assert_eq!(cooperative.poses().unwrap(), first.q.as_slice());
    for _ in first.tick..second.tick {
        cooperative.tick(Engine::default().time_factor / 2000.0, 20).unwrap();
    }
    assert_eq!(cooperative.poses().unwrap(), second.q.as_slice());
}

#[test]
fn driver_can_start_paused_and_reset() {
    let driver = SimulationDriver::start(double_pendulum(), &engine(2000, 20, false)).unwrap();
    let initial = driver.query_positions(false);
    thread::sleep(Duration::from_millis(40));
    assert_eq!(driver.diagnostics().ticks, 0);

    driver.set_active(true);
    assert!(wait_until(Duration::from_secs(2), || driver.diagnostics().ticks >= 2));
    driver.set_active(false);
    assert_ne!(driver.query_positions(false), initial);

    driver.reset();
    assert_eq!(driver.query_positions(false), initial);
    assert_eq!(driver.diagnostics().ticks, 0);
}

#[test]
fn driver_pauses_itself_on_divergence() {
    let runaway = ball(1, NVec3::zeros(), 0.2, 1.0).with_external_force(NVec3::new(f64::NAN, 0.0, 0.0), NVec3::zeros());
    let driver = SimulationDriver::start(build(vec![runaway], vec![]), &engine(1000, 10, true)).unwrap();
    assert!(wait_until(Duration::from_secs(2), || !driver.is_active()));
    assert!(driver.diagnostics().is_diverged());
    assert_eq!(driver.query_positions(false)[0].pose.position, NVec3::zeros());
}

// ==================================================================================
// Scenario files
// ==================================================================================

#[test]
fn bundled_scenarios_load() {
    let dir = std::path::PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("scenarios");
    for name in ["double_pendulum.yaml", "rope.yaml", "trebuchet.yaml"] {
        let text = std::fs::read_to_string(dir.join(name)).unwrap();
        let cfg = ScenarioConfig::from_yaml(&text).unwrap();
        let mut scenario = Scenario::build_scenario(cfg).unwrap();
        assert!(scenario.system.max_residual().unwrap() < 1e-9, "{name} starts violated");
    }
}
