//! Proxy server: one background thread multiplexing all proxied objects.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};

use crate::error::EngineError;
use crate::object::AudioObject;
use crate::proxy::{ProxyRing, RingDirection};

/// Coarse poll interval for the idle and saturated states.
///
/// The rings buffer several periods, so a coarse schedule is enough for
/// starvation handling; commands wake the worker promptly in between.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Control flags shared with the worker thread. Everything on the work
/// loop's hot path is an atomic; locks never appear there.
struct Shared {
    running: AtomicBool,
    stop_request: AtomicBool,
    exit_request: AtomicBool,
    full: AtomicBool,
}

enum Command {
    Register {
        client: Box<dyn AudioObject>,
        ring: Arc<ProxyRing>,
    },
    SeekAll {
        frames: u64,
        done: Sender<()>,
    },
    TakeClients {
        reply: Sender<Vec<Box<dyn AudioObject>>>,
    },
    Wake,
}

/// Background worker that keeps read rings full and write rings drained.
///
/// Clients (the slow, non-realtime audio objects) are *moved* into the
/// worker thread at registration and moved back by
/// [`take_clients`](Self::take_clients), so exactly one thread owns each
/// object. The engine touches only the rings.
///
/// States: idle (sleeping in 50 ms waits), running (polling all clients),
/// exiting. `start` wakes the worker promptly via the command channel;
/// `stop` takes effect at the next pass boundary; dropping the server
/// requests exit and joins the thread.
pub struct ProxyServer {
    shared: Arc<Shared>,
    cmd_tx: Sender<Command>,
    worker: Option<JoinHandle<()>>,
}

impl ProxyServer {
    /// Spawns the worker thread.
    pub fn new() -> Result<Self, EngineError> {
        let shared = Arc::new(Shared {
            running: AtomicBool::new(false),
            stop_request: AtomicBool::new(false),
            exit_request: AtomicBool::new(false),
            full: AtomicBool::new(false),
        });
        let (cmd_tx, cmd_rx) = unbounded();
        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("chain-audio-proxy".to_string())
            .spawn(move || worker_loop(&worker_shared, &cmd_rx))
            .map_err(|e| EngineError::ProxyThread { source: e })?;
        Ok(Self {
            shared,
            cmd_tx,
            worker: Some(worker),
        })
    }

    /// Moves `client` into the worker and returns the ring connecting it to
    /// the engine.
    ///
    /// The ring direction follows the client: sources feed `Read` rings,
    /// sinks drain `Write` rings. Registration happens while the chainsetup
    /// is being enabled, never while the engine ticks.
    pub fn register_client(
        &mut self,
        client: Box<dyn AudioObject>,
        direction: RingDirection,
        slots: usize,
        channels: usize,
        frames: usize,
        sample_rate: u32,
    ) -> Arc<ProxyRing> {
        let ring = Arc::new(ProxyRing::new(
            direction,
            slots,
            channels,
            frames,
            sample_rate,
        ));
        tracing::debug!(
            label = client.label(),
            ?direction,
            slots,
            frames,
            "registering proxy client"
        );
        let _ = self.cmd_tx.send(Command::Register {
            client,
            ring: Arc::clone(&ring),
        });
        ring
    }

    /// Signals the worker to begin filling and draining rings.
    pub fn start(&self) {
        self.shared.stop_request.store(false, Ordering::SeqCst);
        self.shared.running.store(true, Ordering::SeqCst);
        let _ = self.cmd_tx.send(Command::Wake);
        tracing::debug!("proxy server started");
    }

    /// Requests the worker to go idle at the next pass boundary.
    pub fn stop(&self) {
        self.shared.stop_request.store(true, Ordering::SeqCst);
        tracing::debug!("proxy server stop requested");
    }

    /// Whether the worker is in the running state.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Whether the last full pass made no progress (all read rings full and
    /// all write rings empty). The engine uses this to detect saturation in
    /// both directions.
    pub fn is_full(&self) -> bool {
        self.shared.full.load(Ordering::SeqCst)
    }

    /// Flushes every ring and seeks every client to `frames`.
    ///
    /// Blocks until the worker acknowledges. Must only be called while the
    /// engine is not ticking the affected rings.
    pub fn seek_all(&self, frames: u64) {
        let (done_tx, done_rx) = bounded(1);
        if self
            .cmd_tx
            .send(Command::SeekAll {
                frames,
                done: done_tx,
            })
            .is_ok()
        {
            let _ = done_rx.recv();
        }
    }

    /// Drains pending write-ring data and returns ownership of all
    /// registered clients, in registration order.
    pub fn take_clients(&mut self) -> Vec<Box<dyn AudioObject>> {
        let (reply_tx, reply_rx) = bounded(1);
        if self
            .cmd_tx
            .send(Command::TakeClients { reply: reply_tx })
            .is_err()
        {
            return Vec::new();
        }
        reply_rx.recv().unwrap_or_default()
    }
}

impl Drop for ProxyServer {
    fn drop(&mut self) {
        self.shared.stop_request.store(true, Ordering::SeqCst);
        self.shared.exit_request.store(true, Ordering::SeqCst);
        let _ = self.cmd_tx.send(Command::Wake);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

struct ClientSlot {
    client: Box<dyn AudioObject>,
    ring: Arc<ProxyRing>,
}

fn worker_loop(shared: &Shared, cmd_rx: &Receiver<Command>) {
    let mut clients: Vec<ClientSlot> = Vec::new();
    tracing::debug!("proxy worker up");

    loop {
        if shared.exit_request.load(Ordering::SeqCst) {
            break;
        }

        if !shared.running.load(Ordering::SeqCst) {
            match cmd_rx.recv_timeout(POLL_INTERVAL) {
                Ok(cmd) => handle_command(cmd, &mut clients),
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
            }
            continue;
        }

        while let Ok(cmd) = cmd_rx.try_recv() {
            handle_command(cmd, &mut clients);
        }

        let mut processed = 0;
        for slot in &mut clients {
            if slot.ring.is_finished() {
                continue;
            }
            match slot.ring.direction() {
                RingDirection::Read => {
                    if slot.ring.write_space() > 0 {
                        let buf = slot.ring.writable_slot();
                        let frames = slot.client.read(buf);
                        if slot.client.finished() {
                            slot.ring.mark_finished();
                        }
                        if frames > 0 {
                            slot.ring.advance_write();
                            processed += 1;
                        }
                    }
                }
                RingDirection::Write => {
                    if slot.ring.read_space() > 0 {
                        slot.client.write(slot.ring.readable_slot());
                        slot.ring.advance_read();
                        processed += 1;
                    }
                }
            }
        }

        if shared.stop_request.swap(false, Ordering::SeqCst) {
            shared.running.store(false, Ordering::SeqCst);
            tracing::debug!("proxy worker idle");
        }

        if processed == 0 {
            shared.full.store(true, Ordering::SeqCst);
            match cmd_rx.recv_timeout(POLL_INTERVAL) {
                Ok(cmd) => handle_command(cmd, &mut clients),
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
            }
        } else {
            shared.full.store(false, Ordering::SeqCst);
        }
    }
    tracing::debug!("proxy worker exiting");
}

fn handle_command(cmd: Command, clients: &mut Vec<ClientSlot>) {
    match cmd {
        Command::Register { client, ring } => {
            clients.push(ClientSlot { client, ring });
        }
        Command::SeekAll { frames, done } => {
            for slot in clients.iter_mut() {
                slot.ring.flush();
                slot.client.seek(frames);
            }
            tracing::debug!(frames, "proxy rings flushed and clients repositioned");
            let _ = done.send(());
        }
        Command::TakeClients { reply } => {
            // Push out whatever the engine queued before handing sinks back.
            for slot in clients.iter_mut() {
                if slot.ring.direction() == RingDirection::Write {
                    while slot.ring.read_space() > 0 {
                        slot.client.write(slot.ring.readable_slot());
                        slot.ring.advance_read();
                    }
                }
            }
            let taken = clients.drain(..).map(|s| s.client).collect();
            let _ = reply.send(taken);
        }
        Command::Wake => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{AudioObject, MockDevice};
    use crate::SampleBuffer;

    fn wait_for<F: Fn() -> bool>(cond: F, note: &str) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("timed out waiting for: {note}");
    }

    #[test]
    fn test_read_client_fills_ring_until_finished() {
        let mut server = ProxyServer::new().unwrap();
        let mut source = MockDevice::source("m-in", 100);
        source.set_buffersize(32);
        source.open().unwrap();
        let stats = source.stats();

        let ring = server.register_client(Box::new(source), RingDirection::Read, 8, 2, 32, 44100);
        server.start();

        wait_for(|| ring.is_finished(), "source to finish");
        assert_eq!(stats.frames_read.load(Ordering::SeqCst), 100);

        // 100 frames at 32/period: 3 full periods + one partial.
        let mut frames = 0;
        while ring.read_space() > 0 {
            frames += ring.readable_slot().frames();
            ring.advance_read();
        }
        assert_eq!(frames, 100);
    }

    #[test]
    fn test_write_client_drains_ring() {
        let mut server = ProxyServer::new().unwrap();
        let mut sink = MockDevice::sink("m-out");
        sink.set_buffersize(16);
        sink.open().unwrap();
        let stats = sink.stats();

        let ring = server.register_client(Box::new(sink), RingDirection::Write, 8, 1, 16, 44100);
        server.start();

        for _ in 0..5 {
            wait_for(|| ring.write_space() > 0, "write space");
            let slot = ring.writable_slot();
            slot.set_frames(16);
            ring.advance_write();
        }

        wait_for(
            || stats.frames_written.load(Ordering::SeqCst) == 80,
            "sink to drain",
        );
    }

    #[test]
    fn test_stop_goes_idle_and_sets_full_on_no_progress() {
        let mut server = ProxyServer::new().unwrap();
        let mut source = MockDevice::infinite_source("m-in");
        source.set_buffersize(8);
        source.open().unwrap();

        let ring = server.register_client(Box::new(source), RingDirection::Read, 2, 1, 8, 44100);
        server.start();

        // Two slots fill, then no progress is possible: full goes up.
        wait_for(|| server.is_full(), "full flag");
        assert_eq!(ring.read_space(), 2);

        server.stop();
        wait_for(|| !server.is_running(), "worker idle");
    }

    #[test]
    fn test_seek_all_flushes_and_repositions() {
        let mut server = ProxyServer::new().unwrap();
        let mut source = MockDevice::source("m-in", 10_000);
        source.set_buffersize(8);
        source.open().unwrap();

        let ring = server.register_client(Box::new(source), RingDirection::Read, 4, 1, 8, 44100);
        server.start();
        wait_for(|| ring.read_space() == 4, "ring to fill");
        server.stop();
        wait_for(|| !server.is_running(), "worker idle");

        server.seek_all(5000);
        assert_eq!(ring.read_space(), 0);

        server.start();
        wait_for(|| ring.read_space() > 0, "post-seek data");
        assert_eq!(ring.readable_slot().channel(0)[0], 5000.0);
    }

    #[test]
    fn test_take_clients_returns_ownership_and_drains() {
        let mut server = ProxyServer::new().unwrap();
        let mut sink = MockDevice::sink("m-out");
        sink.set_buffersize(4);
        sink.open().unwrap();
        let stats = sink.stats();

        let ring = server.register_client(Box::new(sink), RingDirection::Write, 4, 1, 4, 44100);
        // Queue one period while the worker is idle; take_clients must
        // still deliver it.
        let slot = ring.writable_slot();
        slot.set_frames(4);
        ring.advance_write();

        let clients = server.take_clients();
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].label(), "m-out");
        assert_eq!(stats.frames_written.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_drop_joins_worker() {
        let server = ProxyServer::new().unwrap();
        server.start();
        drop(server); // must not hang
    }

    #[test]
    fn test_stalled_client_keeps_worker_alive() {
        let mut server = ProxyServer::new().unwrap();
        let mut slow = MockDevice::source("m-slow", 1000)
            .with_read_delay(Duration::from_millis(20));
        slow.set_buffersize(8);
        slow.open().unwrap();

        let ring = server.register_client(Box::new(slow), RingDirection::Read, 4, 1, 8, 44100);
        server.start();
        wait_for(|| ring.read_space() > 0, "slow source progress");

        // Drain one period to prove data still flows.
        let mut buf = SampleBuffer::new(1, 8, 44100);
        buf.copy_from(ring.readable_slot());
        ring.advance_read();
        assert_eq!(buf.channel(0)[0], 0.0);
    }
}
