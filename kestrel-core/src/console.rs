//! Serial console hub
//!
//! Bridges the per-VM serial socket (reached through the host driver,
//! locally or over SSH) to any number of WebSocket clients. Output bytes fan
//! out to every attached client; input from any client is written straight
//! through, last writer wins, matching physical TTY semantics. Slow clients
//! are disconnected once their buffer budget is exhausted; sessions with no
//! clients are closed after an idle period. No scrollback is retained.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

// tokio's Instant (not std's) so the idle clock follows the paused test
// clock.
use tokio::time::Instant;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, RwLock};

use crate::config::ConsoleConfig;
use crate::driver::HostDriver;
use crate::error::{KestrelError, KestrelResult};
use crate::types::VmId;

/// Read chunk size; the per-client budget is expressed in these chunks.
const READ_CHUNK: usize = 1024;

struct ClientSlot {
    tx: mpsc::Sender<Bytes>,
    close_reason: Arc<parking_lot::Mutex<Option<String>>>,
}

struct SessionShared {
    vm: VmId,
    clients: parking_lot::Mutex<HashMap<u64, ClientSlot>>,
    idle_since: parking_lot::Mutex<Option<Instant>>,
    next_client: AtomicU64,
    closed: AtomicBool,
    input_tx: mpsc::Sender<Bytes>,
    client_buffer_chunks: usize,
}

impl SessionShared {
    fn detach(&self, client_id: u64) {
        let mut clients = self.clients.lock();
        clients.remove(&client_id);
        if clients.is_empty() {
            *self.idle_since.lock() = Some(Instant::now());
        }
    }

    /// Disconnect every client with the given reason and mark the session
    /// dead.
    fn close_all(&self, reason: &str) {
        self.closed.store(true, Ordering::SeqCst);
        let mut clients = self.clients.lock();
        for (_, slot) in clients.drain() {
            *slot.close_reason.lock() = Some(reason.to_string());
        }
    }
}

/// One attached console client
pub struct ConsoleClient {
    id: u64,
    rx: mpsc::Receiver<Bytes>,
    input_tx: mpsc::Sender<Bytes>,
    close_reason: Arc<parking_lot::Mutex<Option<String>>>,
    session: Arc<SessionShared>,
}

impl ConsoleClient {
    /// Next chunk of console output. `None` means the session ended; check
    /// `close_reason` for why.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Forward input bytes to the VM's serial port.
    pub async fn send_input(&self, data: Bytes) -> KestrelResult<()> {
        self.input_tx.send(data).await.map_err(|_| {
            KestrelError::conflict(
                format!("console {}", self.session.vm),
                "console session closed",
            )
        })
    }

    /// Why this client was dropped (`slow_consumer`, `disconnected`,
    /// `error:<reason>`), once it has been.
    pub fn close_reason(&self) -> Option<String> {
        self.close_reason.lock().clone()
    }
}

impl Drop for ConsoleClient {
    fn drop(&mut self) {
        self.session.detach(self.id);
    }
}

/// The hub: one live session per VM, clients attach and detach freely
pub struct ConsoleHub {
    sessions: RwLock<HashMap<VmId, Arc<SessionShared>>>,
    config: ConsoleConfig,
}

impl ConsoleHub {
    pub fn new(config: ConsoleConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Attach a client to the VM's console, opening the underlying socket
    /// through the driver if no session is live. Clients may resume by VM id
    /// at any time.
    pub async fn attach(
        &self,
        vm: VmId,
        driver: &Arc<dyn HostDriver>,
        socket_path: &str,
    ) -> KestrelResult<ConsoleClient> {
        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions.get(&vm) {
            if !existing.closed.load(Ordering::SeqCst) {
                return Ok(Self::new_client(existing));
            }
            sessions.remove(&vm);
        }

        let stream = driver.open_serial_console(socket_path).await?;
        let (input_tx, input_rx) = mpsc::channel::<Bytes>(64);
        let chunks = (self.config.client_buffer_bytes / READ_CHUNK).max(1);
        let shared = Arc::new(SessionShared {
            vm,
            clients: parking_lot::Mutex::new(HashMap::new()),
            idle_since: parking_lot::Mutex::new(Some(Instant::now())),
            next_client: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            input_tx,
            client_buffer_chunks: chunks,
        });
        sessions.insert(vm, shared.clone());
        tokio::spawn(pump(stream, input_rx, shared.clone(), self.config.idle_timeout));
        tracing::info!(vm = %vm, socket = socket_path, "console session opened");
        Ok(Self::new_client(&shared))
    }

    fn new_client(session: &Arc<SessionShared>) -> ConsoleClient {
        let id = session.next_client.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(session.client_buffer_chunks);
        let close_reason = Arc::new(parking_lot::Mutex::new(None));
        session.clients.lock().insert(
            id,
            ClientSlot {
                tx,
                close_reason: close_reason.clone(),
            },
        );
        *session.idle_since.lock() = None;
        ConsoleClient {
            id,
            rx,
            input_tx: session.input_tx.clone(),
            close_reason,
            session: session.clone(),
        }
    }

    /// Number of live sessions, for the health endpoint.
    pub async fn session_count(&self) -> usize {
        let sessions = self.sessions.read().await;
        sessions
            .values()
            .filter(|s| !s.closed.load(Ordering::SeqCst))
            .count()
    }
}

/// Session pump: owns the socket, fans output out, writes input through,
/// and enforces the idle timeout.
async fn pump(
    stream: Box<dyn crate::driver::ConsoleStream>,
    mut input_rx: mpsc::Receiver<Bytes>,
    shared: Arc<SessionShared>,
    idle_timeout: std::time::Duration,
) {
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut buf = vec![0u8; READ_CHUNK];
    let mut tick = tokio::time::interval(std::time::Duration::from_secs(1));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let reason = loop {
        tokio::select! {
            read = reader.read(&mut buf) => match read {
                Ok(0) => break "disconnected".to_string(),
                Ok(n) => fan_out(&shared, Bytes::copy_from_slice(&buf[..n])),
                Err(e) => break format!("error:{}", e),
            },
            maybe_input = input_rx.recv() => match maybe_input {
                Some(data) => {
                    if let Err(e) = writer.write_all(&data).await {
                        break format!("error:{}", e);
                    }
                }
                // All senders gone means the session itself is being torn
                // down.
                None => break "disconnected".to_string(),
            },
            _ = tick.tick() => {
                let idle = {
                    let clients_empty = shared.clients.lock().is_empty();
                    let idle_since = *shared.idle_since.lock();
                    clients_empty
                        && idle_since.map(|t| t.elapsed() >= idle_timeout).unwrap_or(false)
                };
                if idle {
                    tracing::debug!(vm = %shared.vm, "closing idle console session");
                    break "disconnected".to_string();
                }
            }
        }
    };

    shared.close_all(&reason);
    tracing::info!(vm = %shared.vm, reason = %reason, "console session closed");
}

fn fan_out(shared: &Arc<SessionShared>, data: Bytes) {
    let mut kicked: Vec<u64> = Vec::new();
    {
        let clients = shared.clients.lock();
        for (id, slot) in clients.iter() {
            match slot.tx.try_send(data.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    *slot.close_reason.lock() = Some("slow_consumer".to_string());
                    kicked.push(*id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => kicked.push(*id),
            }
        }
    }
    for id in kicked {
        shared.detach(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{HostDriver, MockDriver};
    use crate::types::Arch;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn hub(buffer_bytes: usize, idle_secs: u64) -> ConsoleHub {
        ConsoleHub::new(ConsoleConfig {
            client_buffer_bytes: buffer_bytes,
            idle_timeout: Duration::from_secs(idle_secs),
        })
    }

    #[tokio::test]
    async fn output_fans_out_to_all_clients() {
        let hub = hub(64 * 1024, 30);
        let mock = Arc::new(MockDriver::new(Arch::X86_64));
        let driver: Arc<dyn HostDriver> = mock.clone();
        let vm = VmId::new();

        let mut a = hub.attach(vm, &driver, "/run/vm.sock").await.unwrap();
        let mut b = hub.attach(vm, &driver, "/run/vm.sock").await.unwrap();
        let mut peer = mock.take_console_peer("/run/vm.sock").unwrap();

        peer.write_all(b"login: ").await.unwrap();
        assert_eq!(&a.recv().await.unwrap()[..], b"login: ");
        assert_eq!(&b.recv().await.unwrap()[..], b"login: ");
    }

    #[tokio::test]
    async fn input_from_any_client_reaches_the_socket() {
        let hub = hub(64 * 1024, 30);
        let mock = Arc::new(MockDriver::new(Arch::X86_64));
        let driver: Arc<dyn HostDriver> = mock.clone();
        let vm = VmId::new();

        let a = hub.attach(vm, &driver, "/run/vm.sock").await.unwrap();
        let b = hub.attach(vm, &driver, "/run/vm.sock").await.unwrap();
        let mut peer = mock.take_console_peer("/run/vm.sock").unwrap();

        a.send_input(Bytes::from_static(b"root\n")).await.unwrap();
        b.send_input(Bytes::from_static(b"ls\n")).await.unwrap();

        let mut got = vec![0u8; 8];
        peer.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"root\nls\n");
    }

    #[tokio::test]
    async fn disconnecting_one_client_leaves_the_other() {
        let hub = hub(64 * 1024, 30);
        let mock = Arc::new(MockDriver::new(Arch::X86_64));
        let driver: Arc<dyn HostDriver> = mock.clone();
        let vm = VmId::new();

        let a = hub.attach(vm, &driver, "/run/vm.sock").await.unwrap();
        let mut b = hub.attach(vm, &driver, "/run/vm.sock").await.unwrap();
        let mut peer = mock.take_console_peer("/run/vm.sock").unwrap();

        drop(a);
        peer.write_all(b"still here\n").await.unwrap();
        assert_eq!(&b.recv().await.unwrap()[..], b"still here\n");
    }

    #[tokio::test]
    async fn slow_consumer_is_kicked() {
        // Budget of one chunk: the second unread chunk overflows.
        let hub = hub(READ_CHUNK, 30);
        let mock = Arc::new(MockDriver::new(Arch::X86_64));
        let driver: Arc<dyn HostDriver> = mock.clone();
        let vm = VmId::new();

        let mut slow = hub.attach(vm, &driver, "/run/vm.sock").await.unwrap();
        let mut peer = mock.take_console_peer("/run/vm.sock").unwrap();

        let chunk = vec![b'x'; READ_CHUNK];
        for _ in 0..4 {
            peer.write_all(&chunk).await.unwrap();
        }
        // Give the pump a moment to overflow the client's buffer.
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Drain whatever was buffered; the channel must end.
        let mut frames = 0;
        while slow.recv().await.is_some() {
            frames += 1;
            assert!(frames < 4, "slow client was never disconnected");
        }
        assert_eq!(slow.close_reason().as_deref(), Some("slow_consumer"));
    }

    #[tokio::test]
    async fn session_reports_disconnect_on_peer_close() {
        let hub = hub(64 * 1024, 30);
        let mock = Arc::new(MockDriver::new(Arch::X86_64));
        let driver: Arc<dyn HostDriver> = mock.clone();
        let vm = VmId::new();

        let mut a = hub.attach(vm, &driver, "/run/vm.sock").await.unwrap();
        let peer = mock.take_console_peer("/run/vm.sock").unwrap();
        drop(peer);

        assert!(a.recv().await.is_none());
        assert_eq!(a.close_reason().as_deref(), Some("disconnected"));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_session_closes_after_timeout() {
        let hub = hub(64 * 1024, 1);
        let mock = Arc::new(MockDriver::new(Arch::X86_64));
        let driver: Arc<dyn HostDriver> = mock.clone();
        let vm = VmId::new();

        let client = hub.attach(vm, &driver, "/run/vm.sock").await.unwrap();
        assert_eq!(hub.session_count().await, 1);
        drop(client);

        // Advance paused time past the idle window and let the pump tick.
        tokio::time::sleep(Duration::from_secs(3)).await;
        tokio::task::yield_now().await;
        assert_eq!(hub.session_count().await, 0);
    }

    #[tokio::test]
    async fn reattach_after_close_opens_a_new_session() {
        let hub = hub(64 * 1024, 30);
        let mock = Arc::new(MockDriver::new(Arch::X86_64));
        let driver: Arc<dyn HostDriver> = mock.clone();
        let vm = VmId::new();

        let mut a = hub.attach(vm, &driver, "/run/vm.sock").await.unwrap();
        let peer = mock.take_console_peer("/run/vm.sock").unwrap();
        drop(peer);
        assert!(a.recv().await.is_none());

        let mut again = hub.attach(vm, &driver, "/run/vm.sock").await.unwrap();
        let mut peer = mock.take_console_peer("/run/vm.sock").unwrap();
        peer.write_all(b"back\n").await.unwrap();
        assert_eq!(&again.recv().await.unwrap()[..], b"back\n");
    }
}
