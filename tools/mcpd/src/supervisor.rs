//! Connection lifecycle: presence polling, the identification handshake, and
//! manifest selection.
//!
//! The supervisor is the only writer of [`ConnectionState`]. It runs on its
//! own thread because every step is blocking serial work; readers take cheap
//! snapshots and never hold it up.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use mculink_protocol::{PayloadCursor, DEVICE_ID_TAG};
use tracing::{error, info, warn};

use crate::transactor::{SerialLine, Transactor};
use mculink_manifest::Manifest;

#[derive(Debug, Clone)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Initializing,
    Ready {
        device_id: String,
        manifest: Arc<Manifest>,
    },
    Error(String),
}

impl ConnectionState {
    pub fn is_ready(&self) -> bool {
        matches!(self, ConnectionState::Ready { .. })
    }

    pub fn device_id(&self) -> Option<&str> {
        match self {
            ConnectionState::Ready { device_id, .. } => Some(device_id),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Initializing => "Initializing",
            ConnectionState::Ready { .. } => "Ready",
            ConnectionState::Error(_) => "Error",
        }
    }

    pub fn status_message(&self) -> String {
        match self {
            ConnectionState::Disconnected => {
                "device not connected - check the serial cable".to_string()
            }
            ConnectionState::Connecting => "opening the serial line".to_string(),
            ConnectionState::Connected => {
                "serial line open, waiting for the device to boot".to_string()
            }
            ConnectionState::Initializing => "identifying the device".to_string(),
            ConnectionState::Ready { device_id, .. } => {
                format!("device '{device_id}' ready")
            }
            ConnectionState::Error(msg) => format!("device error: {msg}"),
        }
    }
}

/// Shared handle on the one process-wide connection state.
#[derive(Clone)]
pub struct StateCell(Arc<RwLock<ConnectionState>>);

impl StateCell {
    pub fn new() -> Self {
        Self(Arc::new(RwLock::new(ConnectionState::Disconnected)))
    }

    pub fn snapshot(&self) -> ConnectionState {
        self.0.read().unwrap().clone()
    }

    pub(crate) fn set(&self, next: ConnectionState) {
        let mut guard = self.0.write().unwrap();
        if guard.name() != next.name() {
            info!(from = guard.name(), to = next.name(), "connection state change");
        }
        *guard = next;
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

pub type PortOpener = Box<dyn Fn(&str, u32) -> Result<Box<dyn SerialLine>> + Send>;

pub struct SupervisorConfig {
    pub line: String,
    pub baud: u32,
    pub manifest_dir: PathBuf,
    /// Presence poll cadence while disconnected.
    pub poll_interval: Duration,
    /// Opening the line toggles DTR and reboots most boards; first
    /// transaction waits this long.
    pub boot_dwell: Duration,
    pub handshake_timeout: Duration,
}

impl SupervisorConfig {
    pub fn new(line: String, baud: u32, manifest_dir: PathBuf) -> Self {
        Self {
            line,
            baud,
            manifest_dir,
            poll_interval: Duration::from_secs(5),
            boot_dwell: Duration::from_secs(3),
            handshake_timeout: Duration::from_secs(5),
        }
    }
}

pub struct Supervisor {
    config: SupervisorConfig,
    state: StateCell,
    transactor: Arc<Transactor>,
    opener: PortOpener,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig, state: StateCell, transactor: Arc<Transactor>) -> Self {
        Self::with_opener(config, state, transactor, Box::new(open_serial))
    }

    pub fn with_opener(
        config: SupervisorConfig,
        state: StateCell,
        transactor: Arc<Transactor>,
        opener: PortOpener,
    ) -> Self {
        Self {
            config,
            state,
            transactor,
            opener,
        }
    }

    /// Poll loop; exits when `running` is cleared.
    pub fn run(self, running: Arc<AtomicBool>) {
        while running.load(Ordering::SeqCst) {
            self.tick();
            // Sleep in slices so shutdown is not delayed by a full interval.
            let mut remaining = self.config.poll_interval;
            while running.load(Ordering::SeqCst) && !remaining.is_zero() {
                let slice = remaining.min(Duration::from_millis(100));
                std::thread::sleep(slice);
                remaining -= slice;
            }
        }
        self.transactor.eject();
        info!("supervisor stopped");
    }

    /// One pass of the state machine. Split out from `run` so tests can
    /// drive it without a thread.
    pub fn tick(&self) {
        if self.transactor.take_fault() {
            error!("serial transaction fault, reconnecting");
            self.transactor.eject();
            self.state
                .set(ConnectionState::Error("serial transaction failed".into()));
            return;
        }

        let present = Path::new(&self.config.line).exists();
        match self.state.snapshot() {
            ConnectionState::Disconnected => {
                if present {
                    self.connect();
                }
            }
            ConnectionState::Error(_) => {
                // Error is observable for one tick, then recovery restarts
                // from scratch.
                self.transactor.eject();
                self.state.set(ConnectionState::Disconnected);
            }
            _ => {
                if !present {
                    warn!(line = %self.config.line, "serial device disappeared");
                    self.transactor.eject();
                    self.state.set(ConnectionState::Disconnected);
                } else if !self.transactor.is_attached() {
                    self.state.set(ConnectionState::Disconnected);
                }
            }
        }
    }

    fn connect(&self) {
        info!(line = %self.config.line, "serial device present, connecting");
        self.state.set(ConnectionState::Connecting);

        let line = match (self.opener)(&self.config.line, self.config.baud) {
            Ok(line) => line,
            Err(e) => {
                error!(error = %format!("{e:#}"), "failed to open serial line");
                self.state
                    .set(ConnectionState::Error(format!("failed to open serial line: {e:#}")));
                return;
            }
        };
        self.transactor.install(line);
        self.state.set(ConnectionState::Connected);

        std::thread::sleep(self.config.boot_dwell);
        self.state.set(ConnectionState::Initializing);

        let device_id = match self.identify() {
            Ok(id) => id,
            Err(e) => {
                error!(error = %format!("{e:#}"), "device identification failed");
                self.transactor.eject();
                self.state.set(ConnectionState::Error(format!("{e:#}")));
                return;
            }
        };

        let manifest_path = self.config.manifest_dir.join(format!("{device_id}.json"));
        let manifest = match Manifest::load(&manifest_path) {
            Ok(m) => m,
            Err(e) => {
                error!(device_id = %device_id, error = %e, "manifest selection failed");
                self.transactor.eject();
                self.state.set(ConnectionState::Error(format!(
                    "no usable manifest for device '{device_id}': {e}"
                )));
                return;
            }
        };

        info!(
            device_id = %device_id,
            manifest = %manifest.name,
            version = %manifest.version,
            tools = manifest.tools.len(),
            "device ready"
        );
        for tool in &manifest.tools {
            info!(tag = tool.tag, signature = %tool.signature(), "tool");
        }
        self.state.set(ConnectionState::Ready {
            device_id,
            manifest: Arc::new(manifest),
        });
    }

    fn identify(&self) -> Result<String> {
        let payload = self
            .transactor
            .transact(DEVICE_ID_TAG, &[], self.config.handshake_timeout)
            .map_err(|e| anyhow!("identification handshake failed: {e}"))?;
        let mut cursor = PayloadCursor::new(&payload);
        let id = cursor
            .read_cstr()
            .map_err(|_| anyhow!("device id is not a valid string"))?
            .to_string();
        cursor
            .finish()
            .map_err(|_| anyhow!("trailing bytes after device id"))?;
        if id.is_empty() {
            bail!("device returned an empty id");
        }
        // The id names a manifest file; keep it from escaping the directory.
        if id.contains('/') || id.contains('\\') || id.contains("..") {
            bail!("device id '{id}' contains path separators");
        }
        Ok(id)
    }
}

fn open_serial(line: &str, baud: u32) -> Result<Box<dyn SerialLine>> {
    let port = serialport::new(line, baud)
        .data_bits(serialport::DataBits::Eight)
        .parity(serialport::Parity::None)
        .stop_bits(serialport::StopBits::One)
        .flow_control(serialport::FlowControl::None)
        .timeout(Duration::from_millis(1000))
        .open()
        .with_context(|| format!("open serial line {line}"))?;
    Ok(Box::new(port))
}
