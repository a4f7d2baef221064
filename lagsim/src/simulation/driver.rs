//! Background driver for a [`PhysicsSystem`].
//!
//! A producer thread owns the system and advances it one tick at a time,
//! paced to wall-clock time (`sub_steps / iterations_per_second` per tick).
//! After each tick it publishes a fresh [`Snapshot`] by swapping it in under
//! a write lock; readers clone or read the current one under the read lock.
//!
//! Pausing is a handshake: `set_active(false)` returns only once the producer
//! has parked between ticks and frozen the published snapshot, so nothing a
//! reader sees changes until `set_active(true)`.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use super::engine::Engine;
use super::snapshot::{Diagnostics, Snapshot, TransformSink};
use super::states::BodyTransform;
use super::system::PhysicsSystem;
use crate::error::SimError;

/// How long a pausing caller waits between liveness checks of the producer
const PARK_POLL: Duration = Duration::from_millis(20);

/// Ticks the producer may fall behind before it stops trying to catch up
const MAX_LAG_TICKS: u32 = 10;

#[derive(Debug)]
struct Control {
    active: bool, // requested state
    parked: bool, // producer is idle between ticks
    reset: bool, // reset requested, cleared by the producer
    shutdown: bool,
}

#[derive(Debug)]
struct Shared {
    snapshot: RwLock<Snapshot>,
    control: Mutex<Control>,
    wake: Condvar,
}

/// Runs a physics system on its own thread
#[derive(Debug)]
pub struct SimulationDriver {
    shared: Arc<Shared>,
    tick_period: Duration,
    producer: Option<JoinHandle<()>>,
}

impl SimulationDriver {
    /// Start the producer thread.
    ///
    /// The system must be initialized. With `engine.start_active == false`
    /// the producer parks before its first tick.
    pub fn start(system: PhysicsSystem, engine: &Engine) -> Result<Self, SimError> {
        if !system.is_initialized() {
            error!("cannot start driver: physics system not initialized");
            return Err(SimError::NotInitialized);
        }
        engine.validate()?;
        if engine.sub_steps > engine.iterations_per_second {
            warn!(
                sub_steps = engine.sub_steps,
                iterations = engine.iterations_per_second,
                "tick period exceeds one second, published positions will update slowly"
            );
        }

        let tick_period = engine.tick_period();
        let shared = Arc::new(Shared {
            snapshot: RwLock::new(system.snapshot()?),
            control: Mutex::new(Control {
                active: engine.start_active,
                parked: false,
                reset: false,
                shutdown: false,
            }),
            wake: Condvar::new(),
        });

        let producer = Producer {
            system,
            shared: Arc::clone(&shared),
            dt: engine.dt(),
            sub_steps: engine.sub_steps,
            tick_period,
        };
        let handle = thread::Builder::new()
            .name("lagsim-producer".into())
            .spawn(move || producer.run())
            .map_err(|e| SimError::invalid_config(format!("failed to spawn producer thread: {e}")))?;

        info!(
            dt = engine.dt(),
            sub_steps = engine.sub_steps,
            tick_ms = tick_period.as_secs_f64() * 1e3,
            active = engine.start_active,
            "simulation driver started"
        );

        let driver = Self {
            shared,
            tick_period,
            producer: Some(handle),
        };
        if !engine.start_active {
            driver.wait_parked();
        }
        Ok(driver)
    }

    /// Resume or pause.
    ///
    /// Pausing blocks until the producer has finished its current tick and
    /// parked, so every query afterwards returns the same transforms.
    pub fn set_active(&self, active: bool) {
        {
            let mut ctl = self.shared.control.lock();
            if ctl.active == active {
                return;
            }
            ctl.active = active;
            self.shared.wake.notify_all();
        }
        if active {
            info!("simulation resumed");
        } else {
            self.wait_parked();
            info!("simulation paused");
        }
    }

    pub fn is_active(&self) -> bool {
        self.shared.control.lock().active
    }

    fn producer_alive(&self) -> bool {
        self.producer.as_ref().is_some_and(|h| !h.is_finished())
    }

    fn wait_parked(&self) {
        let mut ctl = self.shared.control.lock();
        while !ctl.parked && !ctl.shutdown && !ctl.active {
            self.shared.wake.wait_for(&mut ctl, PARK_POLL);
            if !self.producer_alive() {
                break;
            }
        }
    }

    /// Wall-clock duration of one tick
    pub fn tick_period(&self) -> Duration {
        self.tick_period
    }

    /// Transforms of the last completed tick, or blended towards the previous
    /// one by elapsed time when `smooth`
    pub fn query_positions(&self, smooth: bool) -> Vec<BodyTransform> {
        let snapshot = self.shared.snapshot.read();
        let weight = snapshot.blend_weight(Instant::now(), self.tick_period);
        snapshot.positions(smooth, weight)
    }

    /// Push the current transforms into `sink`
    pub fn sync_positions<S: TransformSink + ?Sized>(&self, smooth: bool, sink: &mut S) {
        let snapshot = self.shared.snapshot.read();
        let weight = snapshot.blend_weight(Instant::now(), self.tick_period);
        snapshot.sync(smooth, weight, sink);
    }

    /// Copy of the published snapshot
    pub fn snapshot(&self) -> Snapshot {
        self.shared.snapshot.read().clone()
    }

    pub fn diagnostics(&self) -> Diagnostics {
        self.shared.snapshot.read().diagnostics.clone()
    }

    /// Restore the initial state. Blocks until the producer has applied it.
    pub fn reset(&self) {
        let mut ctl = self.shared.control.lock();
        ctl.reset = true;
        self.shared.wake.notify_all();
        while ctl.reset && !ctl.shutdown {
            self.shared.wake.wait_for(&mut ctl, PARK_POLL);
            if !self.producer_alive() {
                break;
            }
        }
    }

    /// Stop the producer and wait for it to exit
    pub fn stop(mut self) -> Result<(), SimError> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<(), SimError> {
        let Some(handle) = self.producer.take() else {
            return Ok(());
        };
        {
            let mut ctl = self.shared.control.lock();
            ctl.shutdown = true;
            self.shared.wake.notify_all();
        }
        handle.join().map_err(|_| SimError::ProducerPanicked)?;
        info!("simulation driver stopped");
        Ok(())
    }
}

impl Drop for SimulationDriver {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            error!(%err, "simulation driver did not stop cleanly");
        }
    }
}

/// State owned by the producer thread
struct Producer {
    system: PhysicsSystem,
    shared: Arc<Shared>,
    dt: f64,
    sub_steps: u32,
    tick_period: Duration,
}

impl Producer {
    fn run(mut self) {
        let shared = Arc::clone(&self.shared);
        let mut deadline = Instant::now() + self.tick_period;
        let mut lagging = false;

        loop {
            // wait here while paused; handle resets and shutdown between ticks
            {
                let mut ctl = shared.control.lock();
                loop {
                    if ctl.shutdown {
                        return;
                    }
                    if ctl.reset {
                        self.apply_reset(ctl.parked);
                        ctl.reset = false;
                        shared.wake.notify_all();
                        continue;
                    }
                    if ctl.active {
                        break;
                    }
                    if !ctl.parked {
                        ctl.parked = true;
                        shared.snapshot.write().frozen_at = Some(Instant::now());
                        debug!("producer parked");
                        shared.wake.notify_all();
                    }
                    shared.wake.wait(&mut ctl);
                }
                if ctl.parked {
                    ctl.parked = false;
                    self.thaw();
                    deadline = Instant::now() + self.tick_period;
                }
            }

            match self.system.tick(self.dt, self.sub_steps) {
                Ok(()) => self.publish(),
                Err(err) => {
                    // the tick was rolled back; keep showing the last good state
                    error!(%err, "pausing simulation after divergence");
                    self.publish();
                    shared.control.lock().active = false;
                    continue;
                }
            }

            // pace to wall-clock time; control changes wake us early
            let mut ctl = shared.control.lock();
            while Instant::now() < deadline && ctl.active && !ctl.shutdown && !ctl.reset {
                shared.wake.wait_until(&mut ctl, deadline);
            }
            drop(ctl);

            let now = Instant::now();
            if now > deadline + self.tick_period * MAX_LAG_TICKS {
                if !lagging {
                    warn!(period_ms = self.tick_period.as_secs_f64() * 1e3, "simulation cannot keep up with wall-clock time");
                    lagging = true;
                }
                deadline = now;
            } else if now <= deadline + self.tick_period {
                lagging = false;
            }
            deadline += self.tick_period;
        }
    }

    fn publish(&self) {
        match self.system.snapshot() {
            Ok(snapshot) => *self.shared.snapshot.write() = snapshot,
            Err(err) => error!(%err, "failed to build snapshot"),
        }
    }

    /// Resume the blend clock where it stopped
    fn thaw(&self) {
        let mut snapshot = self.shared.snapshot.write();
        if let Some(frozen) = snapshot.frozen_at.take() {
            let paused = Instant::now().saturating_duration_since(frozen);
            snapshot.published_at += paused;
        }
        debug!("producer resumed");
    }

    fn apply_reset(&mut self, parked: bool) {
        if let Err(err) = self.system.reset() {
            error!(%err, "reset failed");
            return;
        }
        let now = Instant::now();
        match self.system.snapshot_at(now) {
            Ok(mut snapshot) => {
                if parked {
                    snapshot.frozen_at = Some(now);
                }
                *self.shared.snapshot.write() = snapshot;
            }
            Err(err) => error!(%err, "failed to build snapshot"),
        }
    }
}
