//! Tube multiplexer
//!
//! Owns one datagram connection and every tube running over it. A single
//! receive task decodes each datagram once and routes it by tube ID; a single
//! send task is the only writer on the connection. Tubes reach the send task
//! through a cloned queue handle and never touch the connection themselves.

use super::frame::{Flags, InitiateFrame, Packet};
use super::{Opener, ReliableTube, Tube, TubeError, TubeState, TubeType, UnreliableTube};
use crate::config::Config;
use crate::protocol::MAX_TUBES_PER_ROLE;
use crate::transport::{MsgConn, TransportError};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::deadline::Deadline;

/// Which end of the connection this muxer is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Opened the connection; allocates odd tube IDs
    Client,
    /// Accepted the connection; allocates even tube IDs
    Server,
}

impl Role {
    fn first_id(self) -> u8 {
        match self {
            Role::Client => 1,
            Role::Server => 0,
        }
    }

    /// The ID belongs to this role's half of the space
    fn owns(self, id: u8) -> bool {
        id % 2 == self.first_id()
    }
}

/// Open tubes by ID
struct Registry {
    tubes: HashMap<u8, Tube>,
    next_id: u8,
}

impl Registry {
    /// Next free ID, stepping by two to stay within one role's half
    fn allocate(&mut self) -> Option<u8> {
        for _ in 0..MAX_TUBES_PER_ROLE {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(2);
            if !self.tubes.contains_key(&id) {
                return Some(id);
            }
        }
        None
    }
}

struct MuxerShared {
    role: Role,
    config: Config,
    conn: Arc<dyn MsgConn>,
    registry: Mutex<Registry>,
    outbound: mpsc::Sender<Bytes>,
    accept_tx: mpsc::Sender<Tube>,
    accept_rx: Mutex<mpsc::Receiver<Tube>>,
    accept_deadline: Deadline,
    stopping: AtomicBool,
    stopped: watch::Sender<bool>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

/// Multiplexes tubes over one datagram connection
#[derive(Clone)]
pub struct Muxer {
    shared: Arc<MuxerShared>,
}

impl Muxer {
    /// Start a muxer over `conn`. Must be called inside a tokio runtime.
    ///
    /// Fails if `config` does not validate; frames larger than the MTU would
    /// otherwise be truncated on the wire.
    pub fn new(conn: Arc<dyn MsgConn>, role: Role, config: Config) -> crate::Result<Self> {
        config.validate()?;

        let (outbound, outbound_rx) = mpsc::channel(config.muxer.outbound_queue.max(1));
        let (accept_tx, accept_rx) = mpsc::channel(config.muxer.accept_backlog.max(1));
        let (stopped, _) = watch::channel(false);

        let shared = Arc::new(MuxerShared {
            role,
            registry: Mutex::new(Registry {
                tubes: HashMap::new(),
                next_id: role.first_id(),
            }),
            conn,
            config,
            outbound,
            accept_tx,
            accept_rx: Mutex::new(accept_rx),
            accept_deadline: Deadline::new(),
            stopping: AtomicBool::new(false),
            stopped,
            tasks: std::sync::Mutex::new(Vec::new()),
        });

        let recv_task = tokio::spawn(recv_loop(Arc::clone(&shared)));
        let send_task = tokio::spawn(send_loop(Arc::clone(&shared), outbound_rx));
        if let Ok(mut tasks) = shared.tasks.lock() {
            tasks.push(recv_task);
            tasks.push(send_task);
        }

        info!("muxer started as {:?}", role);
        Ok(Self { shared })
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    /// Number of registered tubes
    pub async fn tube_count(&self) -> usize {
        self.shared.registry.lock().await.tubes.len()
    }

    pub fn is_stopped(&self) -> bool {
        *self.shared.stopped.borrow()
    }

    /// Open a reliable tube and wait for the peer to answer
    pub async fn create_reliable_tube(&self, tube_type: TubeType) -> Result<Tube, TubeError> {
        self.create_tube(tube_type, true).await
    }

    /// Open an unreliable tube and wait for the peer to answer
    pub async fn create_unreliable_tube(&self, tube_type: TubeType) -> Result<Tube, TubeError> {
        self.create_tube(tube_type, false).await
    }

    async fn create_tube(&self, tube_type: TubeType, reliable: bool) -> Result<Tube, TubeError> {
        let s = &self.shared;
        if s.is_stopping() {
            return Err(TubeError::MuxerStopped);
        }

        let tube = {
            let mut registry = s.registry.lock().await;
            // stop() drains the registry under this lock
            if s.is_stopping() {
                return Err(TubeError::MuxerStopped);
            }
            let Some(id) = registry.allocate() else {
                warn!("all {} tube IDs in use", MAX_TUBES_PER_ROLE);
                return Err(TubeError::OutOfTubes);
            };
            let tube = s.new_tube(id, tube_type, reliable, Opener::Local);
            registry.tubes.insert(id, tube.clone());
            tube
        };
        s.spawn_reaper(tube.clone());
        tube.start_initiate();

        let handshake = tokio::time::timeout(
            s.config.tube.handshake_timeout(),
            tube.wait_initiated(),
        )
        .await;

        match handshake {
            Ok(Ok(())) => {
                info!("opened tube {} ({:?}, reliable: {})", tube.id(), tube_type, reliable);
                Ok(tube)
            }
            Ok(Err(e)) => {
                tube.force_close().await;
                Err(e)
            }
            Err(_) => {
                debug!("tube {}: handshake timed out", tube.id());
                tube.force_close().await;
                Err(TubeError::DeadlineExceeded)
            }
        }
    }

    /// Wait for a tube opened by the peer
    pub async fn accept(&self) -> Result<Tube, TubeError> {
        let s = &self.shared;
        let mut stopped = s.stopped.subscribe();
        if *stopped.borrow_and_update() || s.is_stopping() {
            return Err(TubeError::MuxerStopped);
        }
        if s.accept_deadline.is_expired() {
            return Err(TubeError::DeadlineExceeded);
        }

        let mut accept_rx = s.accept_rx.lock().await;
        tokio::select! {
            tube = accept_rx.recv() => tube.ok_or(TubeError::MuxerStopped),
            _ = s.accept_deadline.expired() => Err(TubeError::DeadlineExceeded),
            _ = stopped.changed() => Err(TubeError::MuxerStopped),
        }
    }

    /// Deadline for [`Muxer::accept`]; `None` waits forever
    pub fn set_accept_deadline(&self, at: Option<Instant>) {
        self.shared.accept_deadline.set(at);
    }

    /// Close every tube, then stop both loops and the connection. Safe to
    /// call repeatedly and concurrently; later calls wait for the first.
    pub async fn stop(&self) {
        self.shared.stop(true).await;
    }
}

impl MuxerShared {
    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    fn new_tube(&self, id: u8, tube_type: TubeType, reliable: bool, opener: Opener) -> Tube {
        let outbound = self.outbound.clone();
        if reliable {
            Tube::Reliable(ReliableTube::new(
                id,
                tube_type,
                opener,
                &self.config.tube,
                outbound,
            ))
        } else {
            Tube::Unreliable(UnreliableTube::new(
                id,
                tube_type,
                opener,
                &self.config.tube,
                outbound,
            ))
        }
    }

    /// Unregister the tube once it reaches Closed
    fn spawn_reaper(self: &Arc<Self>, tube: Tube) {
        let shared = Arc::clone(self);
        let mut state_rx = tube.state_watch();
        tokio::spawn(async move {
            super::wait_state(&mut state_rx, |st| st == TubeState::Closed).await;
            let mut registry = shared.registry.lock().await;
            let registered = registry.tubes.get(&tube.id()).map_or(false, |t| t.same(&tube));
            if registered {
                registry.tubes.remove(&tube.id());
                debug!("tube {} removed, {} open", tube.id(), registry.tubes.len());
            }
        });
    }

    /// Route one decoded datagram
    async fn dispatch(self: &Arc<Self>, packet: Packet) -> Result<(), TubeError> {
        let id = packet.tube_id();
        let tube = self.registry.lock().await.tubes.get(&id).cloned();

        match (tube, packet) {
            (Some(tube), Packet::Initiate(frame)) => tube.receive_initiate(frame).await,
            (Some(tube), Packet::Data(frame)) => tube.receive(frame).await,
            (None, Packet::Initiate(frame)) if frame.has_flags(Flags::REQ) => {
                self.open_requested(frame).await
            }
            (None, packet) => {
                trace!("dropping {:?} frame for unknown tube {}", packet.flags(), id);
                Ok(())
            }
        }
    }

    /// Create and queue a tube for an open request from the peer
    async fn open_requested(self: &Arc<Self>, frame: InitiateFrame) -> Result<(), TubeError> {
        if self.is_stopping() {
            return Ok(());
        }
        if self.role.owns(frame.tube_id) {
            return Err(crate::protocol::ProtocolError::UnexpectedInitiate(format!(
                "peer requested tube {} from our ID space",
                frame.tube_id
            ))
            .into());
        }

        if self.accept_tx.capacity() == 0 {
            warn!("accept queue full, ignoring request for tube {}", frame.tube_id);
            return Ok(());
        }

        let reliable = frame.has_flags(Flags::RELIABLE);
        let tube = {
            let mut registry = self.registry.lock().await;
            if registry.tubes.contains_key(&frame.tube_id) {
                return Ok(());
            }
            let tube = self.new_tube(frame.tube_id, frame.tube_type, reliable, Opener::Peer);
            registry.tubes.insert(frame.tube_id, tube.clone());
            tube
        };
        self.spawn_reaper(tube.clone());

        let tube_type = frame.tube_type;
        if let Err(e) = tube.receive_initiate(frame).await {
            tube.force_close().await;
            return Err(e);
        }
        if self.accept_tx.try_send(tube.clone()).is_err() {
            warn!("accept queue full, dropping tube {}", tube.id());
            tube.force_close().await;
            return Ok(());
        }

        info!(
            "peer opened tube {} ({:?}, reliable: {})",
            tube.id(),
            tube_type,
            reliable
        );
        Ok(())
    }

    async fn stop(self: &Arc<Self>, graceful: bool) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            let mut stopped = self.stopped.subscribe();
            let _ = stopped.wait_for(|s| *s).await.map(|_| ());
            return;
        }
        info!("stopping muxer");

        let tubes: Vec<Tube> = self.registry.lock().await.tubes.values().cloned().collect();
        if graceful && !tubes.is_empty() {
            let mut closing = JoinSet::new();
            for tube in tubes.iter().cloned() {
                closing.spawn(async move {
                    if let Err(e) = tube.close().await {
                        trace!("tube {} close during stop: {}", tube.id(), e);
                    }
                });
            }
            let drained = tokio::time::timeout(self.config.muxer.stop_timeout(), async {
                while closing.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!("tubes still open after stop timeout, forcing");
            }
        }

        let remaining: Vec<Tube> = {
            let mut registry = self.registry.lock().await;
            registry.tubes.drain().map(|(_, tube)| tube).collect()
        };
        for tube in tubes.iter().chain(remaining.iter()) {
            tube.force_close().await;
        }

        self.stopped.send_replace(true);
        let tasks = match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(_) => Vec::new(),
        };
        for task in tasks {
            task.abort();
        }
        if let Err(e) = self.conn.close().await {
            debug!("closing connection: {}", e);
        }
        info!("muxer stopped");
    }
}

/// The only reader of the connection
async fn recv_loop(shared: Arc<MuxerShared>) {
    let mut buf = vec![0u8; shared.config.muxer.mtu];
    let idle_timeout = shared.config.muxer.idle_timeout();

    loop {
        let read = match idle_timeout {
            Some(limit) => tokio::time::timeout(limit, shared.conn.read_msg(&mut buf))
                .await
                .unwrap_or(Err(TransportError::Timeout)),
            None => shared.conn.read_msg(&mut buf).await,
        };

        let n = match read {
            Ok(n) => n,
            Err(TransportError::Timeout) => {
                warn!("no datagrams for {:?}, stopping", idle_timeout.unwrap_or_default());
                break;
            }
            Err(e) => {
                if !shared.is_stopping() {
                    warn!("connection read failed: {}", e);
                }
                break;
            }
        };

        let packet = match Packet::decode(&buf[..n]) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("dropping datagram: {}", e);
                continue;
            }
        };

        let id = packet.tube_id();
        if let Err(e) = shared.dispatch(packet).await {
            match e {
                TubeError::MuxerStopped => break,
                e => debug!("tube {}: {}", id, e),
            }
        }
    }

    // Runs detached so that stop() can abort this task
    let shared = Arc::clone(&shared);
    tokio::spawn(async move { shared.stop(false).await });
}

/// The only writer on the connection; one frame per datagram
async fn send_loop(shared: Arc<MuxerShared>, mut outbound: mpsc::Receiver<Bytes>) {
    while let Some(datagram) = outbound.recv().await {
        if let Err(e) = shared.conn.write_msg(&datagram).await {
            if !shared.is_stopping() {
                warn!("connection write failed: {}", e);
            }
            break;
        }
    }

    let shared = Arc::clone(&shared);
    tokio::spawn(async move { shared.stop(false).await });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{pair, LinkConditions};
    use std::time::Duration;

    #[test]
    fn test_role_parity() {
        assert!(Role::Client.owns(1));
        assert!(Role::Client.owns(255));
        assert!(!Role::Client.owns(0));
        assert!(Role::Server.owns(0));
        assert!(Role::Server.owns(254));
    }

    #[test]
    fn test_allocate_skips_used_ids() {
        let mut registry = Registry {
            tubes: HashMap::new(),
            next_id: Role::Client.first_id(),
        };
        let mut seen = Vec::new();
        for _ in 0..MAX_TUBES_PER_ROLE {
            seen.push(registry.allocate().unwrap());
        }
        assert_eq!(seen.len(), 128);
        assert!(seen.iter().all(|id| id % 2 == 1));
        assert_eq!(seen[127], 255);
        // Wrapped around to 1 again
        assert_eq!(registry.next_id, 1);
    }

    #[tokio::test]
    async fn test_malformed_datagram_ignored() {
        let (a, b) = pair(LinkConditions::clean());
        let mux = Muxer::new(Arc::new(a), Role::Server, Config::default()).unwrap();

        b.write_msg(&[1, 2, 3]).await.unwrap();
        b.write_msg(&[9; 40]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(!mux.is_stopped());
        assert_eq!(mux.tube_count().await, 0);
        mux.stop().await;
    }

    #[tokio::test]
    async fn test_request_from_own_id_space_rejected() {
        let (a, b) = pair(LinkConditions::clean());
        let mux = Muxer::new(Arc::new(a), Role::Server, Config::default()).unwrap();

        // Even IDs belong to the server
        let request = InitiateFrame::request(4, TubeType::EXEC, 128, true);
        b.write_msg(&request.encode()).await.unwrap();
        let request = InitiateFrame::request(5, TubeType::EXEC, 128, true);
        b.write_msg(&request.encode()).await.unwrap();

        let tube = mux.accept().await.unwrap();
        assert_eq!(tube.id(), 5);
        assert_eq!(mux.tube_count().await, 1);
        mux.stop().await;
    }

    #[tokio::test]
    async fn test_oversized_frames_rejected() {
        let (a, _b) = pair(LinkConditions::clean());
        let mut config = Config::default();
        config.tube.max_frame_payload = 2000;
        assert!(matches!(
            Muxer::new(Arc::new(a), Role::Client, config),
            Err(crate::Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_create_racing_stop() {
        let (a, _b) = pair(LinkConditions::clean());
        let mux = Muxer::new(Arc::new(a), Role::Client, Config::default()).unwrap();

        // Hold the registry so create passes its first check and then waits
        let registry = mux.shared.registry.lock().await;
        let create = {
            let mux = mux.clone();
            tokio::spawn(async move { mux.create_reliable_tube(TubeType::EXEC).await })
        };
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        mux.shared.stopping.store(true, Ordering::SeqCst);
        drop(registry);

        assert!(matches!(create.await.unwrap(), Err(TubeError::MuxerStopped)));
        assert_eq!(mux.tube_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_deadline() {
        let (a, _b) = pair(LinkConditions::clean());
        let mux = Muxer::new(Arc::new(a), Role::Server, Config::default()).unwrap();
        mux.set_accept_deadline(Some(Instant::now() + Duration::from_millis(100)));
        assert!(matches!(mux.accept().await, Err(TubeError::DeadlineExceeded)));
        mux.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout_unregisters() {
        let (a, _b) = pair(LinkConditions::clean());
        let mut config = Config::default();
        config.tube.handshake_timeout_ms = 300;
        let mux = Muxer::new(Arc::new(a), Role::Client, config).unwrap();

        let result = mux.create_reliable_tube(TubeType::EXEC).await;
        assert!(matches!(result, Err(TubeError::DeadlineExceeded)));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(mux.tube_count().await, 0);
        mux.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (a, _b) = pair(LinkConditions::clean());
        let mux = Muxer::new(Arc::new(a), Role::Client, Config::default()).unwrap();
        tokio::join!(mux.stop(), mux.stop());
        mux.stop().await;

        assert!(mux.is_stopped());
        assert!(matches!(mux.accept().await, Err(TubeError::MuxerStopped)));
        assert!(matches!(
            mux.create_reliable_tube(TubeType::EXEC).await,
            Err(TubeError::MuxerStopped)
        ));
    }

    #[tokio::test]
    async fn test_closed_link_stops_muxer() {
        let (a, _b) = pair(LinkConditions::clean());
        let a: Arc<dyn MsgConn> = Arc::new(a);
        let mux = Muxer::new(Arc::clone(&a), Role::Client, Config::default()).unwrap();
        a.close().await.unwrap();

        let mut stopped = mux.shared.stopped.subscribe();
        tokio::time::timeout(Duration::from_secs(1), stopped.wait_for(|s| *s))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_stops_muxer() {
        let (a, _b) = pair(LinkConditions::clean());
        let mut config = Config::default();
        config.muxer.idle_timeout_ms = 500;
        let mux = Muxer::new(Arc::new(a), Role::Server, config).unwrap();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(mux.is_stopped());
    }
}
