//! Synthetic load generator for power/thermal testing.
//!
//! Runs as the lowest-priority schedulable unit: a self-messaging task that
//! alternates randomized busy and sleep slices around a configured duty
//! cycle, requesting the high-performance clock state only while busy. One
//! toggle starts a bounded run of slices; a second toggle stops it early.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

use crate::config::LOAD_GEN_NB_RUN;
use crate::dvfs::DvfsGovernor;
use crate::msg::Message;

/// Fixed seed so load patterns are reproducible run to run.
const LOAD_GEN_SEED: u64 = 335_312;

/// How often the idle task re-checks its shutdown flag.
const SHUTDOWN_POLL: Duration = Duration::from_millis(50);

pub struct LoadGenerator {
    tx: Sender<Message>,
    alive: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

struct LoadGenState {
    nb_run: u32,
    time_slice_ms: u32,
    duty_cycle: f32,
}

impl LoadGenerator {
    /// Spawn the generator task. It idles on its queue until toggled.
    pub fn spawn(queue_depth: usize, dvfs: Arc<DvfsGovernor>) -> Self {
        let (tx, rx) = bounded::<Message>(queue_depth);
        let self_tx = tx.clone();
        let alive = Arc::new(AtomicBool::new(true));
        let task_alive = Arc::clone(&alive);

        let handle = thread::Builder::new()
            .name("earshot-loadgen".into())
            .spawn(move || {
                let mut rng = StdRng::seed_from_u64(LOAD_GEN_SEED);
                let mut state = LoadGenState {
                    nb_run: 0,
                    time_slice_ms: 0,
                    duty_cycle: 0.0,
                };

                while task_alive.load(Ordering::Relaxed) {
                    let msg = match rx.recv_timeout(SHUTDOWN_POLL) {
                        Ok(msg) => msg,
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => break,
                    };
                    match msg {
                        Message::GenerateLoad {
                            time_slice_ms,
                            duty_cycle_pct,
                        } => {
                            if state.nb_run > 0 {
                                // A run is active — this toggle stops it.
                                post(&self_tx, Message::GenerateLoadStop);
                            } else {
                                state.time_slice_ms = time_slice_ms;
                                state.duty_cycle = duty_cycle_pct as f32 / 100.0;
                                post(&self_tx, Message::GenerateLoadStart);
                            }
                        }
                        Message::GenerateLoadStart => {
                            state.nb_run = LOAD_GEN_NB_RUN;
                            info!(
                                time_slice_ms = state.time_slice_ms,
                                duty_cycle = state.duty_cycle,
                                "load generation started"
                            );
                            post(&self_tx, Message::GenerateLoadStep);
                        }
                        Message::GenerateLoadStep => {
                            if state.nb_run == 0 {
                                continue;
                            }
                            state.nb_run -= 1;

                            let busy_ms = state.time_slice_ms as f32
                                * 2.0
                                * rng.gen::<f32>()
                                * state.duty_cycle;
                            let sleep_ms = state.time_slice_ms as f32
                                * 2.0
                                * rng.gen::<f32>()
                                * (1.0 - state.duty_cycle);

                            {
                                let _opp = dvfs.request_max();
                                let deadline =
                                    Instant::now() + Duration::from_millis(busy_ms as u64);
                                while Instant::now() < deadline {
                                    std::hint::spin_loop();
                                }
                            }
                            thread::sleep(Duration::from_millis(sleep_ms as u64));

                            if state.nb_run == 0 {
                                info!("load generation run complete");
                            } else {
                                post(&self_tx, Message::GenerateLoadStep);
                            }
                        }
                        Message::GenerateLoadStop => {
                            if state.nb_run > 0 {
                                state.nb_run = 0;
                                info!("load generation stopped");
                            } else {
                                // Nothing to stop — treat as a restart request.
                                post(&self_tx, Message::GenerateLoadStart);
                            }
                        }
                        other => debug!(?other, "load generator ignoring message"),
                    }
                }
            })
            .expect("spawn load generator thread");

        Self {
            tx,
            alive,
            handle: Some(handle),
        }
    }

    /// Toggle load generation on or off.
    pub fn toggle(&self, time_slice_ms: u32, duty_cycle_pct: u8) {
        post(
            &self.tx,
            Message::GenerateLoad {
                time_slice_ms,
                duty_cycle_pct,
            },
        );
    }
}

impl Drop for LoadGenerator {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn post(tx: &Sender<Message>, msg: Message) {
    if tx.try_send(msg).is_err() {
        warn!(?msg, "load generator queue full, message dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dvfs::NoopScaler;

    #[test]
    fn toggle_starts_and_second_toggle_stops() {
        let dvfs = Arc::new(DvfsGovernor::new(Box::new(NoopScaler)));
        let gen = LoadGenerator::spawn(10, dvfs);

        gen.toggle(1, 50);
        thread::sleep(Duration::from_millis(20));
        gen.toggle(1, 50); // stop
        thread::sleep(Duration::from_millis(20));
        drop(gen); // must join cleanly, not hang
    }

    #[test]
    fn idle_generator_shuts_down_promptly() {
        let dvfs = Arc::new(DvfsGovernor::new(Box::new(NoopScaler)));
        let gen = LoadGenerator::spawn(10, dvfs);
        let start = Instant::now();
        drop(gen);
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
