//! Headless consumer loop
//!
//! Stands in for a renderer: a fixed-rate frame loop that samples the
//! driver's transforms into a scene map, the way a render thread would copy
//! them onto its scene objects each frame.

use std::collections::HashMap;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::SimError;
use crate::simulation::driver::SimulationDriver;
use crate::simulation::scenario::Scenario;
use crate::simulation::snapshot::{Diagnostics, TransformSink};
use crate::simulation::states::{BodyTransform, ObjectHandle, Pose};

/// How the frame loop samples the simulation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeadlessOptions {
    pub frames: u32, // frames to render before stopping
    pub fps: f64, // frame rate of the consumer
    pub smooth: bool, // interpolate between ticks
    pub resume_after: Option<u32>, // frame at which a paused driver is resumed
}

impl Default for HeadlessOptions {
    fn default() -> Self {
        Self {
            frames: 600,
            fps: 60.0,
            smooth: false,
            resume_after: None,
        }
    }
}

/// Stand-in scene: the last transform applied to each object
#[derive(Debug, Default, Clone)]
pub struct SceneMirror {
    pub poses: HashMap<ObjectHandle, Pose>,
    pub updates: u64,
}

impl TransformSink for SceneMirror {
    fn apply_transform(&mut self, transform: &BodyTransform) {
        self.poses.insert(transform.handle, transform.pose);
        self.updates += 1;
    }
}

/// What the run ended with
#[derive(Debug, Clone)]
pub struct HeadlessReport {
    pub frames: u32,
    pub scene: SceneMirror,
    pub diagnostics: Diagnostics,
    pub simulated_time: f64,
}

impl HeadlessReport {
    /// One line per body, ordered by handle
    pub fn print(&self, scenario: &Scenario) {
        let mut handles: Vec<_> = self.scene.poses.keys().copied().collect();
        handles.sort();
        println!(
            "frames = {}, simulated t = {:.4} s, ticks = {}, degenerate solves = {}",
            self.frames, self.simulated_time, self.diagnostics.ticks, self.diagnostics.degenerate_solves
        );
        for handle in handles {
            let pose = &self.scene.poses[&handle];
            let (roll, pitch, yaw) = pose.orientation.euler_angles();
            println!(
                "{:>12} {handle}: x = [{:8.4}, {:8.4}, {:8.4}]  rpy = [{:7.2}, {:7.2}, {:7.2}] deg",
                scenario.name_of(handle).unwrap_or("?"),
                pose.position.x,
                pose.position.y,
                pose.position.z,
                roll.to_degrees(),
                pitch.to_degrees(),
                yaw.to_degrees(),
            );
        }
        if let Some(reason) = &self.diagnostics.diverged {
            println!("diverged: {reason}");
        }
    }
}

/// Run the consumer loop against a freshly started driver
pub fn run_headless(scenario: &Scenario, options: HeadlessOptions) -> Result<HeadlessReport, SimError> {
    if !(options.fps.is_finite() && options.fps > 0.0) {
        return Err(SimError::invalid_config(format!("fps must be positive, got {}", options.fps)));
    }

    let mut scene = SceneMirror::default();

    // no simulation: the scene keeps its initial poses
    if !scenario.engine.simulate {
        let snapshot = scenario.system.snapshot()?;
        snapshot.sync(false, 0.0, &mut scene);
        info!(bodies = scene.poses.len(), "simulation disabled, showing initial poses");
        return Ok(HeadlessReport {
            frames: 0,
            scene,
            diagnostics: snapshot.diagnostics,
            simulated_time: 0.0,
        });
    }

    let driver = SimulationDriver::start(scenario.system.clone(), &scenario.engine)?;
    let frame = Duration::from_secs_f64(options.fps.recip());
    let mut next = Instant::now();
    let mut last_ticks = 0;
    let mut warned_divergence = false;

    for i in 0..options.frames {
        if options.resume_after == Some(i) && !driver.is_active() {
            driver.set_active(true);
        }

        driver.sync_positions(options.smooth, &mut scene);

        let diagnostics = driver.diagnostics();
        if diagnostics.is_diverged() && !warned_divergence {
            warn!(frame = i, reason = diagnostics.diverged.as_deref().unwrap_or(""), "simulation diverged and paused itself");
            warned_divergence = true;
        }
        if (i as f64) % options.fps.round().max(1.0) == 0.0 {
            info!(
                frame = i,
                ticks = diagnostics.ticks,
                per_frame = diagnostics.ticks.saturating_sub(last_ticks),
                residual = diagnostics.max_residual,
                "frame"
            );
        } else {
            debug!(frame = i, ticks = diagnostics.ticks, "frame");
        }
        last_ticks = diagnostics.ticks;

        next += frame;
        let now = Instant::now();
        if next > now {
            thread::sleep(next - now);
        } else {
            next = now;
        }
    }

    let snapshot = driver.snapshot();
    driver.stop()?;

    Ok(HeadlessReport {
        frames: options.frames,
        scene,
        diagnostics: snapshot.diagnostics,
        simulated_time: snapshot.time,
    })
}
