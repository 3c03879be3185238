use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{after, bounded, select, Receiver, Sender, TryRecvError};

use super::backoff::Backoff;
use super::outbox::Outbox;
use super::payload::OutgoingPayload;
use super::{Link, Transport};

/// Connection state of the publisher loop.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Backoff,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Backoff => "backoff",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug)]
pub struct PublisherSettings {
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub outbox_capacity: usize,
    /// How often an idle connection is checked for a peer close.
    pub idle_poll: Duration,
}

impl Default for PublisherSettings {
    fn default() -> Self {
        Self {
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(8),
            outbox_capacity: 32,
            idle_poll: Duration::from_millis(250),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PublisherStats {
    pub state: ConnectionState,
    pub sent: u64,
    /// Dropped while not connected, or unserializable.
    pub dropped: u64,
    /// Evicted from a full outbox.
    pub evicted: u64,
    pub connections: u64,
    pub connect_failures: u64,
    pub send_failures: u64,
    pub last_delay: Option<Duration>,
}

type SharedStats = Arc<Mutex<PublisherStats>>;

fn lock(stats: &SharedStats) -> MutexGuard<'_, PublisherStats> {
    stats.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to the publisher thread.
pub struct Publisher {
    outbox: Outbox,
    stats: SharedStats,
    stop_tx: Option<Sender<Instant>>,
    handle: Option<JoinHandle<()>>,
}

impl Publisher {
    /// Spawn the publisher loop. Never fails because of the network.
    pub fn start(transport: Box<dyn Transport>, settings: PublisherSettings) -> Result<Self> {
        let outbox = Outbox::new(settings.outbox_capacity);
        let stats: SharedStats = Arc::new(Mutex::new(PublisherStats::default()));
        let (stop_tx, stop_rx) = bounded(1);

        let worker = Worker {
            transport,
            outbox_rx: outbox.receiver(),
            stop_rx,
            backoff: Backoff::new(settings.backoff_base, settings.backoff_max),
            idle_poll: settings.idle_poll,
            stats: stats.clone(),
        };
        let handle = std::thread::Builder::new()
            .name("publisher".to_string())
            .spawn(move || worker.run())
            .context("failed to spawn publisher thread")?;

        Ok(Self {
            outbox,
            stats,
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Cloneable handoff used by the result sink.
    pub fn outbox(&self) -> Outbox {
        self.outbox.clone()
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.stats).state
    }

    pub fn stats(&self) -> PublisherStats {
        let mut stats = lock(&self.stats).clone();
        stats.evicted = self.outbox.evicted();
        stats
    }

    /// Flush what is queued (while connected, until `grace` elapses), close the
    /// connection and join the thread.
    pub fn shutdown(mut self, grace: Duration) -> Result<PublisherStats> {
        self.stop(grace)?;
        Ok(self.stats())
    }

    fn stop(&mut self, grace: Duration) -> Result<()> {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(Instant::now() + grace);
        }
        if let Some(handle) = self.handle.take() {
            handle
                .join()
                .map_err(|_| anyhow!("publisher thread panicked"))?;
        }
        Ok(())
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        if let Err(err) = self.stop(Duration::ZERO) {
            log::warn!("{}", err);
        }
    }
}

enum Served {
    Failed,
    Stopped,
}

struct Worker {
    transport: Box<dyn Transport>,
    outbox_rx: Receiver<OutgoingPayload>,
    stop_rx: Receiver<Instant>,
    backoff: Backoff,
    idle_poll: Duration,
    stats: SharedStats,
}

impl Worker {
    fn set_state(&self, state: ConnectionState) {
        lock(&self.stats).state = state;
    }

    fn run(mut self) {
        log::info!("publisher started for {}", self.transport.describe());
        loop {
            if !matches!(self.stop_rx.try_recv(), Err(TryRecvError::Empty)) {
                break;
            }

            self.set_state(ConnectionState::Connecting);
            match self.transport.connect() {
                Ok(link) => {
                    {
                        let mut stats = lock(&self.stats);
                        stats.state = ConnectionState::Connected;
                        stats.connections += 1;
                    }
                    log::info!("publisher connected to {}", self.transport.describe());
                    if let Served::Stopped = self.serve(link) {
                        break;
                    }
                }
                Err(err) => {
                    lock(&self.stats).connect_failures += 1;
                    log::warn!("publisher connect failed: {:#}", err);
                }
            }

            let delay = self.backoff.next_delay();
            {
                let mut stats = lock(&self.stats);
                stats.state = ConnectionState::Backoff;
                stats.last_delay = Some(delay);
            }
            log::info!("publisher retrying in {:?}", delay);
            if !self.wait_backoff(delay) {
                break;
            }
            self.set_state(ConnectionState::Disconnected);
        }
        self.set_state(ConnectionState::Disconnected);
        log::info!("publisher stopped");
    }

    /// Backoff resets on the first send that succeeds on `link`.
    fn serve(&mut self, mut link: Box<dyn Link>) -> Served {
        let mut proven = false;
        loop {
            select! {
                recv(self.outbox_rx) -> msg => {
                    // Never disconnected: the outbox keeps a receiver.
                    let Ok(payload) = msg else { continue };
                    match self.deliver(link.as_mut(), &payload) {
                        Ok(()) if !proven => {
                            self.backoff.reset();
                            proven = true;
                        }
                        Ok(()) => {}
                        Err(err) => {
                            lock(&self.stats).send_failures += 1;
                            log::warn!("publisher send failed: {:#}", err);
                            link.close();
                            return Served::Failed;
                        }
                    }
                }
                recv(self.stop_rx) -> msg => {
                    let deadline = msg.unwrap_or_else(|_| Instant::now());
                    self.flush(link.as_mut(), deadline);
                    link.close();
                    return Served::Stopped;
                }
                default(self.idle_poll) => {
                    if !link.is_open() {
                        log::warn!("publisher connection closed by peer");
                        link.close();
                        return Served::Failed;
                    }
                }
            }
        }
    }

    /// Serialize and send one payload. Serialization failures drop the payload
    /// without touching the connection.
    fn deliver(&self, link: &mut dyn Link, payload: &OutgoingPayload) -> Result<()> {
        let bytes = match payload.to_json_bytes() {
            Ok(bytes) => bytes,
            Err(err) => {
                lock(&self.stats).dropped += 1;
                log::warn!("dropping payload for {}: {:#}", payload.camera, err);
                return Ok(());
            }
        };
        link.send(&bytes)?;
        lock(&self.stats).sent += 1;
        Ok(())
    }

    fn flush(&self, link: &mut dyn Link, deadline: Instant) {
        while Instant::now() < deadline {
            let Ok(payload) = self.outbox_rx.try_recv() else {
                break;
            };
            if let Err(err) = self.deliver(link, &payload) {
                log::warn!("publisher flush stopped: {:#}", err);
                break;
            }
        }
    }

    /// Sleep for `delay`, dropping payloads as they arrive. False on stop.
    fn wait_backoff(&self, delay: Duration) -> bool {
        let timer = after(delay);
        loop {
            select! {
                recv(self.outbox_rx) -> msg => {
                    if msg.is_ok() {
                        lock(&self.stats).dropped += 1;
                    }
                }
                recv(self.stop_rx) -> _ => return false,
                recv(timer) -> _ => return true,
            }
        }
    }
}
