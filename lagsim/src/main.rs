use lagsim::{ScenarioConfig, Scenario};
use lagsim::{run_headless, HeadlessOptions};
use lagsim::{bench_solvers, bench_rope_curve};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(about = "Constrained rigid-body simulation, sampled by a headless consumer")]
struct Args {
    /// Scenario file under `scenarios/`
    #[arg(short, long, default_value = "double_pendulum.yaml")]
    file_name: String,

    /// Simulate at ITER RK4 iterations per second
    #[arg(long, value_name = "ITER")]
    phys: Option<u32>,

    /// Start with the simulation paused
    #[arg(long)]
    paused: bool,

    /// RK4 steps per published tick
    #[arg(long, value_name = "N", requires = "phys")]
    substep: Option<u32>,

    /// Simulated seconds per wall-clock second
    #[arg(long, value_name = "F", requires = "phys")]
    factor: Option<f64>,

    /// Frames the consumer samples before exiting
    #[arg(long, default_value_t = 600)]
    frames: u32,

    /// Consumer frame rate
    #[arg(long, default_value_t = 60.0)]
    fps: f64,

    /// Interpolate between ticks when sampling
    #[arg(long)]
    smooth: bool,

    /// Resume a paused simulation at this frame
    #[arg(long, value_name = "FRAME")]
    resume_after: Option<u32>,

    /// Run the solver benchmarks instead of a scenario
    #[arg(long)]
    bench: bool,

    /// With --bench: print the CSV sweep
    #[arg(long, requires = "bench")]
    curve: bool,
}

// load here to keep main clean
fn load_scenario_from_yaml(file_name: &str) -> Result<ScenarioConfig> {
    let config_path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("scenarios").join(file_name);
    let file = File::open(&config_path).with_context(|| format!("failed to open {}", config_path.display()))?;
    let reader = BufReader::new(file);
    let scenario_cfg: ScenarioConfig = serde_yaml::from_reader(reader)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(scenario_cfg)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    if args.bench {
        if args.curve {
            bench_rope_curve()?;
        } else {
            bench_solvers()?;
        }
        return Ok(());
    }

    let mut scenario_cfg = load_scenario_from_yaml(&args.file_name)?;

    // command line overrides the scenario's engine block
    if let Some(iterations) = args.phys {
        scenario_cfg.engine.simulate = true;
        scenario_cfg.engine.iterations = iterations;
    }
    if let Some(sub_steps) = args.substep {
        scenario_cfg.engine.sub_steps = sub_steps;
    }
    if let Some(factor) = args.factor {
        scenario_cfg.engine.time_factor = factor;
    }
    if args.paused {
        scenario_cfg.engine.start_active = false;
    }

    let scenario = Scenario::build_scenario(scenario_cfg).context("invalid scenario")?;
    info!(
        file = %args.file_name,
        bodies = scenario.system.bodies().len(),
        constraints = scenario.system.constraints().len(),
        "scenario loaded"
    );

    let options = HeadlessOptions {
        frames: args.frames,
        fps: args.fps,
        smooth: args.smooth,
        resume_after: args.resume_after,
    };
    let report = run_headless(&scenario, options)?;
    report.print(&scenario);

    Ok(())
}
