//! The engine: per-period processing loop over an enabled chainsetup.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};

use crate::chain::Slot;
use crate::error::EngineError;
use crate::object::AudioObject;
use crate::proxy::ProxyRing;
use crate::setup::Chainsetup;

/// Counters accumulated over one engine run.
#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    /// Completed periods.
    pub ticks: u64,
    /// Frames advanced (the last period may be partial).
    pub frames_processed: u64,
    /// Read-side ring misses survived with silence.
    pub underruns: u64,
    /// Write-side ring misses survived by dropping a period.
    pub overruns: u64,
}

enum Command {
    Seek { frames: u64, done: Sender<()> },
}

/// Control handle usable from other threads while the engine runs.
#[derive(Clone)]
pub struct EngineHandle {
    stop: Arc<AtomicBool>,
    cmd_tx: Sender<Command>,
}

impl EngineHandle {
    /// Requests the engine to stop at the top of the next tick.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Repositions the running chainsetup at the next period boundary.
    ///
    /// Blocks until the engine has flushed pending proxy data and seeked
    /// every object. Returns false if the engine is no longer running.
    pub fn seek(&self, frames: u64) -> bool {
        let (done_tx, done_rx) = bounded(1);
        if self
            .cmd_tx
            .send(Command::Seek {
                frames,
                done: done_tx,
            })
            .is_err()
        {
            return false;
        }
        done_rx.recv_timeout(Duration::from_secs(5)).is_ok()
    }
}

/// Executes the per-period schedule on the calling thread.
///
/// Per period: controllers update, every chain pulls one period from its
/// input slot, processes it, and pushes it to its output slot; then the
/// position advances. The engine never performs blocking file I/O itself -
/// non-realtime objects sit behind proxy rings, and the engine blocks at
/// most one period on a ring before counting an xrun and carrying on.
///
/// The engine terminates when every non-loop input is exhausted (and
/// proxied output rings have drained), when the configured length is
/// reached, or when [`EngineHandle::stop`] is observed.
pub struct Engine {
    stop: Arc<AtomicBool>,
    cmd_rx: Receiver<Command>,
}

impl Engine {
    /// Creates an engine and its control handle.
    pub fn new() -> (Self, EngineHandle) {
        let stop = Arc::new(AtomicBool::new(false));
        let (cmd_tx, cmd_rx) = unbounded();
        (
            Self {
                stop: Arc::clone(&stop),
                cmd_rx,
            },
            EngineHandle { stop, cmd_tx },
        )
    }

    /// Runs the chainsetup until it terminates. The setup is locked for
    /// the duration of the run.
    pub fn run(&mut self, setup: &mut Chainsetup) -> Result<EngineStats, EngineError> {
        if !setup.is_enabled() {
            return Err(EngineError::InvalidState {
                operation: "run",
                requirement: "an enabled chainsetup",
            });
        }
        setup.locked = true;
        let stats = self.run_locked(setup);
        setup.locked = false;
        Ok(stats)
    }

    fn run_locked(&mut self, setup: &mut Chainsetup) -> EngineStats {
        let mut stats = EngineStats::default();
        let buffersize = setup.buffersize();
        let rate = setup.sample_rate().max(1);
        // The most the engine may stall on a saturated or starved ring.
        let period_wait = Duration::from_secs_f64(buffersize as f64 / f64::from(rate));

        // Loop-fed chains run after the chains that feed the loops.
        let order = execution_order(setup);
        tracing::info!(
            chains = order.len(),
            buffersize,
            rate,
            "engine starting"
        );

        loop {
            if self.stop.load(Ordering::SeqCst) {
                tracing::debug!("engine stop observed");
                break;
            }
            while let Ok(cmd) = self.cmd_rx.try_recv() {
                match cmd {
                    Command::Seek { frames, done } => {
                        setup.seek_unchecked(frames);
                        let _ = done.send(());
                    }
                }
            }
            if inputs_exhausted(setup) {
                tracing::debug!("all inputs finished");
                break;
            }
            if let Some(length) = setup.length_frames() {
                if setup.position >= length {
                    tracing::debug!(length, "configured length reached");
                    break;
                }
            }

            let position = setup.position;
            for &ci in &order {
                setup.chains[ci].controller_update(position);
            }

            // Chains run to completion one at a time, in loop-aware order:
            // a chain feeding a loop device writes before the chain reading
            // that loop pulls its period.
            let remaining = setup
                .length_frames()
                .map(|length| (length - setup.position) as usize);
            let mut tick_frames = 0usize;
            for &ci in &order {
                let mut frames = self.read_chain_input(setup, ci, period_wait, &mut stats);
                if let Some(remaining) = remaining {
                    if frames > remaining {
                        frames = remaining;
                        setup.chains[ci].audioslot_mut().set_frames(remaining);
                    }
                }
                tick_frames = tick_frames.max(frames);
                setup.chains[ci].process();
                self.write_chain_output(setup, ci, period_wait, &mut stats);
            }
            if tick_frames == 0 {
                break;
            }

            setup.position += tick_frames as u64;
            stats.ticks += 1;
            stats.frames_processed += tick_frames as u64;
        }

        self.drain_output_rings(setup);
        tracing::info!(
            ticks = stats.ticks,
            frames = stats.frames_processed,
            underruns = stats.underruns,
            overruns = stats.overruns,
            "engine finished"
        );
        stats
    }

    /// Pulls one period into the chain's audioslot. Returns the frames that
    /// count towards this tick's progress.
    fn read_chain_input(
        &self,
        setup: &mut Chainsetup,
        chain_index: usize,
        period_wait: Duration,
        stats: &mut EngineStats,
    ) -> usize {
        let buffersize = setup.buffersize();
        let slot = setup.chains[chain_index].input().cloned();
        let chain = &mut setup.chains[chain_index];
        match slot {
            Some(Slot::Direct(index)) => match setup.inputs_direct[index].as_mut() {
                Some(object) if !object.finished() => object.read(chain.audioslot_mut()),
                _ => {
                    chain.audioslot_mut().make_silent();
                    0
                }
            },
            Some(Slot::Loop(id)) => {
                let device = setup.loops.get_mut(&id).expect("loop device exists");
                device.read(chain.audioslot_mut())
            }
            Some(Slot::Proxied { ring, .. }) => {
                if ring.read_space() == 0 && !ring.is_finished() {
                    wait_for_ring(&ring, period_wait, |r| {
                        r.read_space() > 0 || r.is_finished()
                    });
                }
                if ring.read_space() > 0 {
                    chain.audioslot_mut().copy_from(ring.readable_slot());
                    ring.advance_read();
                    chain.audioslot().frames()
                } else if ring.is_finished() {
                    chain.audioslot_mut().make_silent();
                    0
                } else {
                    stats.underruns += 1;
                    tracing::warn!(chain = chain.name(), "xrun: proxy ring underrun");
                    chain.audioslot_mut().make_silent();
                    buffersize
                }
            }
            None => {
                chain.audioslot_mut().make_silent();
                0
            }
        }
    }

    /// Pushes the chain's audioslot to its output slot.
    fn write_chain_output(
        &self,
        setup: &mut Chainsetup,
        chain_index: usize,
        period_wait: Duration,
        stats: &mut EngineStats,
    ) {
        let slot = setup.chains[chain_index].output().cloned();
        let chain = &setup.chains[chain_index];
        match slot {
            Some(Slot::Direct(index)) => {
                if let Some(object) = setup.outputs_direct[index].as_mut() {
                    object.write(chain.audioslot());
                }
            }
            Some(Slot::Loop(id)) => {
                let device = setup.loops.get_mut(&id).expect("loop device exists");
                device.write(chain.audioslot());
            }
            Some(Slot::Proxied { ring, .. }) => {
                if ring.write_space() == 0 {
                    wait_for_ring(&ring, period_wait, |r| r.write_space() > 0);
                }
                if ring.write_space() > 0 {
                    ring.writable_slot().copy_from(chain.audioslot());
                    ring.advance_write();
                } else {
                    stats.overruns += 1;
                    tracing::warn!(chain = chain.name(), "xrun: proxy ring overrun");
                }
            }
            None => {}
        }
    }

    /// Lets proxied outputs flush before the run returns.
    fn drain_output_rings(&self, setup: &Chainsetup) {
        if setup.pserver.is_none() {
            return;
        }
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let pending = setup
                .outputs
                .iter()
                .filter_map(|slot| match slot {
                    Slot::Proxied { ring, .. } => Some(ring.read_space()),
                    _ => None,
                })
                .sum::<usize>();
            if pending == 0 || Instant::now() >= deadline {
                if pending > 0 {
                    tracing::warn!(pending, "output rings not fully drained");
                }
                return;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
    }
}

/// Chain execution order: loop-fed chains after everything else, so a loop
/// written this tick is readable this tick.
fn execution_order(setup: &Chainsetup) -> Vec<usize> {
    let mut order: Vec<usize> = (0..setup.chains.len()).collect();
    order.sort_by_key(|&ci| matches!(setup.chains[ci].input(), Some(Slot::Loop(_))));
    order
}

/// True when every non-loop input has delivered its last frame (and there
/// is at least one such input).
fn inputs_exhausted(setup: &Chainsetup) -> bool {
    let mut any = false;
    for (index, slot) in setup.inputs.iter().enumerate() {
        let finished = match slot {
            Slot::Loop(_) => continue,
            Slot::Direct(_) => match setup.inputs_direct[index].as_deref() {
                Some(object) => object.finished(),
                None => continue,
            },
            Slot::Proxied { ring, .. } => ring.is_finished() && ring.read_space() == 0,
        };
        any = true;
        if !finished {
            return false;
        }
    }
    any
}

fn wait_for_ring<F: Fn(&ProxyRing) -> bool>(ring: &ProxyRing, limit: Duration, ready: F) {
    let deadline = Instant::now() + limit;
    while !ready(ring) && Instant::now() < deadline {
        std::thread::sleep(Duration::from_micros(500));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::Environment;
    use crate::object::MockDevice;
    use crate::op::Gain;

    fn simple_setup(input_frames: u64, buffersize: usize) -> (Chainsetup, Arc<crate::object::MockStats>) {
        let mut setup = Chainsetup::new("engine-test", Environment::default());
        setup.overrides.buffersize = Some(buffersize);
        setup
            .add_input_object(Box::new(MockDevice::source("in", input_frames)))
            .unwrap();
        let sink = MockDevice::sink("out");
        let stats = sink.stats();
        setup.add_output_object(Box::new(sink)).unwrap();
        (setup, stats)
    }

    #[test]
    fn test_tick_count_and_final_position() {
        let (mut setup, out_stats) = simple_setup(1000, 256);
        setup.enable().unwrap();
        let (mut engine, _handle) = Engine::new();
        let stats = engine.run(&mut setup).unwrap();
        setup.disable().unwrap();

        // ceil(1000 / 256) periods, last one partial.
        assert_eq!(stats.ticks, 4);
        assert_eq!(stats.frames_processed, 1000);
        assert_eq!(setup.position_frames(), 1000);
        assert_eq!(
            out_stats.frames_written.load(Ordering::SeqCst),
            1000
        );
        assert_eq!(stats.underruns, 0);
        assert_eq!(stats.overruns, 0);
    }

    #[test]
    fn test_run_requires_enabled_setup() {
        let (mut setup, _) = simple_setup(100, 64);
        let (mut engine, _handle) = Engine::new();
        assert!(matches!(
            engine.run(&mut setup),
            Err(EngineError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_operators_transform_the_stream() {
        let mut setup = Chainsetup::new("gain-test", Environment::default());
        setup.overrides.buffersize = Some(50);
        setup
            .add_input_object(Box::new(MockDevice::source("in", 100)))
            .unwrap();
        let sink = MockDevice::sink("out").with_capture();
        let captured = sink.stats();
        setup.add_output_object(Box::new(sink)).unwrap();
        setup.add_operator(Box::new(Gain::new(50.0))).unwrap();

        setup.enable().unwrap();
        let (mut engine, _handle) = Engine::new();
        engine.run(&mut setup).unwrap();
        setup.disable().unwrap();

        let samples = captured.captured.lock().unwrap();
        assert_eq!(samples.len(), 100);
        // Ramp value n scaled by 50%.
        assert!((samples[80] - 40.0).abs() < 1e-3);
    }

    #[test]
    fn test_stop_request_terminates_infinite_run() {
        let mut setup = Chainsetup::new("stop-test", Environment::default());
        setup.overrides.buffersize = Some(64);
        setup
            .add_input_object(Box::new(MockDevice::infinite_source("in")))
            .unwrap();
        setup.add_output("null").unwrap();
        setup.enable().unwrap();

        let (mut engine, handle) = Engine::new();
        let stopper = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            handle.stop();
        });
        let stats = engine.run(&mut setup).unwrap();
        stopper.join().unwrap();
        setup.disable().unwrap();
        assert!(stats.ticks > 0);
    }

    #[test]
    fn test_length_bounds_infinite_inputs() {
        let mut setup = Chainsetup::new("len-test", Environment::default());
        setup.overrides.buffersize = Some(100);
        setup
            .add_input_object(Box::new(MockDevice::infinite_source("in")))
            .unwrap();
        setup.add_output("null").unwrap();
        setup.set_length_frames(500);
        setup.enable().unwrap();

        let (mut engine, _handle) = Engine::new();
        let stats = engine.run(&mut setup).unwrap();
        setup.disable().unwrap();
        assert_eq!(stats.ticks, 5);
        assert_eq!(setup.position_frames(), 500);
    }

    #[test]
    fn test_muted_chain_writes_silence() {
        let mut setup = Chainsetup::new("mute-test", Environment::default());
        setup.overrides.buffersize = Some(32);
        setup
            .add_input_object(Box::new(MockDevice::source("in", 64)))
            .unwrap();
        let sink = MockDevice::sink("out").with_capture();
        let captured = sink.stats();
        setup.add_output_object(Box::new(sink)).unwrap();
        setup.toggle_chain_muting().unwrap();

        setup.enable().unwrap();
        let (mut engine, _handle) = Engine::new();
        engine.run(&mut setup).unwrap();
        setup.disable().unwrap();

        let samples = captured.captured.lock().unwrap();
        assert_eq!(samples.len(), 64);
        assert!(samples.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_loop_device_feeds_second_chain() {
        let mut setup = Chainsetup::new("loop-test", Environment::default());
        setup.overrides.buffersize = Some(25);
        setup.add_chains(&["src".to_string()]).unwrap();
        setup.select_chains(&["src".to_string()]);
        setup
            .add_input_object(Box::new(MockDevice::source("in", 100)))
            .unwrap();
        setup.add_output("loop,1").unwrap();

        setup.add_chains(&["dst".to_string()]).unwrap();
        setup.select_chains(&["dst".to_string()]);
        setup.add_input("loop,1").unwrap();
        let sink = MockDevice::sink("out").with_capture();
        let captured = sink.stats();
        setup.add_output_object(Box::new(sink)).unwrap();

        setup.enable().unwrap();
        let (mut engine, _handle) = Engine::new();
        engine.run(&mut setup).unwrap();
        setup.disable().unwrap();

        let samples = captured.captured.lock().unwrap();
        // The ramp passed through the loop unchanged, same tick.
        assert_eq!(samples.len(), 100);
        assert!((samples[10] - 10.0).abs() < 1e-3);
        assert!((samples[99] - 99.0).abs() < 1e-3);
    }
}
