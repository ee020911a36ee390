use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};

use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    Command, ConnectionEvent, ConnectionHandle, ConnectionSnapshot, ManagerConfig, Payload, Reply,
};
use crate::descriptor::{DeviceId, PeripheralDescriptor};
use crate::driver::{DriverPrototype, DriverRegistry, HudDriver, TransferStatus};
use crate::error::ConnectionError;
use crate::host::{ListenerGuard, PlatformEvent, PlatformReceiver, UsbHost};
use crate::state::ConnectionPhase;

/// The bound driver. Workers lock it for the duration of one blocking
/// call, so teardown waits for any transfer already in flight.
type SharedDriver = Arc<Mutex<Box<dyn HudDriver>>>;

fn lock_driver(driver: &Mutex<Box<dyn HudDriver>>) -> MutexGuard<'_, Box<dyn HudDriver>> {
    driver.lock().unwrap_or_else(PoisonError::into_inner)
}

struct ActiveDriver {
    name: String,
    /// Status captured at connect time, served while a worker holds the lock.
    status: String,
    driver: SharedDriver,
}

/// Results of blocking work, reported back to the actor.
enum Completion {
    Connected {
        attempt: u64,
        driver: Box<dyn HudDriver>,
    },
    Failed {
        attempt: u64,
        error: ConnectionError,
    },
    TornDown {
        device: DeviceId,
    },
    /// The driver of a cancelled attempt has let go of the device.
    Released {
        attempt: u64,
    },
    TransferFailed(String),
}

// ── ConnectionManager ────────────────────────────────────────────

/// Owner of the single HUD connection. Create with [`new`](Self::new),
/// then drive it with [`run`](Self::run) on its own task.
pub struct ConnectionManager {
    host: Arc<dyn UsbHost>,
    registry: DriverRegistry,

    phase: ConnectionPhase,
    /// Id of the current attempt. Completions carrying an older id
    /// belong to an abandoned attempt.
    attempt: u64,
    active: Option<ActiveDriver>,
    /// Cancelled attempt whose worker may still hold the device.
    draining: Option<u64>,
    last_error: Option<String>,
    teardown_waiters: Vec<Reply<()>>,

    commands: mpsc::Receiver<Command>,
    platform: PlatformReceiver,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions: mpsc::UnboundedReceiver<Completion>,
    events: broadcast::Sender<ConnectionEvent>,
    _listener: ListenerGuard,
}

impl ConnectionManager {
    /// Build the manager and register it as the host's platform listener.
    pub fn new(
        host: Arc<dyn UsbHost>,
        registry: DriverRegistry,
        config: &ManagerConfig,
    ) -> (Self, ConnectionHandle) {
        let (commands_tx, commands) = mpsc::channel(config.command_capacity.max(1));
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (platform_tx, platform) = mpsc::unbounded_channel();
        let (completions_tx, completions) = mpsc::unbounded_channel();
        let listener = ListenerGuard::register(Arc::clone(&host), platform_tx);

        let handle = ConnectionHandle {
            commands: commands_tx,
            events: events.clone(),
        };
        let manager = Self {
            host,
            registry,
            phase: ConnectionPhase::Idle,
            attempt: 0,
            active: None,
            draining: None,
            last_error: None,
            teardown_waiters: Vec::new(),
            commands,
            platform,
            completions_tx,
            completions,
            events,
            _listener: listener,
        };
        (manager, handle)
    }

    /// Serve commands and platform notifications until `shutdown` is
    /// cancelled or every handle is dropped, then release the device.
    pub async fn run(mut self, shutdown: CancellationToken) {
        if self.registry.is_empty() {
            warn!("connection manager started without drivers; no device will be offered");
        } else {
            info!(
                "connection manager started with {} drivers {:?}",
                self.registry.len(),
                self.registry.names()
            );
        }
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(completion) = self.completions.recv() => self.on_completion(completion),
                Some(event) = self.platform.recv() => self.on_platform(event),
                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => break,
                },
            }
        }
        self.dispose().await;
    }

    // ── Commands ─────────────────────────────────────────────────

    fn on_command(&mut self, command: Command) {
        match command {
            Command::ListAvailable(reply) => {
                let _ = reply.send(self.available());
            }
            Command::Connect { device, reply } => {
                let _ = reply.send(self.request_connection(device));
            }
            Command::Disconnect(reply) => self.disconnect(reply),
            Command::Transmit { payload, reply } => self.transmit(payload, reply),
            Command::IsReady(reply) => {
                let _ = reply.send(self.is_ready());
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    fn available(&self) -> Vec<PeripheralDescriptor> {
        let devices = self.registry.filter(self.host.enumerate());
        debug!("found {} potential HUD devices", devices.len());
        devices
    }

    fn request_connection(&mut self, device: DeviceId) -> Result<(), ConnectionError> {
        match &self.phase {
            ConnectionPhase::Idle => {}
            ConnectionPhase::Disconnecting { .. } => return Err(ConnectionError::TeardownInFlight),
            phase => return Err(ConnectionError::Busy(phase.to_string())),
        }
        let descriptor = self
            .host
            .enumerate()
            .into_iter()
            .find(|d| d.id == device)
            .ok_or_else(|| ConnectionError::InvalidSelection(device.clone()))?;

        self.attempt += 1;
        self.last_error = None;
        if self.host.has_permission(&device) {
            debug!("already have permission for {device}, connecting directly");
            self.phase.begin_connect(device)?;
            self.dispatch(descriptor);
        } else {
            info!("requesting USB permission for {device}");
            self.phase.await_permission(device)?;
            self.host.request_permission(&descriptor);
        }
        Ok(())
    }

    fn disconnect(&mut self, reply: Reply<()>) {
        match self.phase {
            ConnectionPhase::Idle => {
                let _ = reply.send(());
            }
            ConnectionPhase::PermissionPending { .. } => {
                self.fail_attempt(ConnectionError::Cancelled);
                let _ = reply.send(());
            }
            ConnectionPhase::Connecting { .. } => {
                self.teardown_waiters.push(reply);
                self.cancel_connect(ConnectionError::Cancelled);
            }
            ConnectionPhase::Connected { .. } => {
                self.teardown_waiters.push(reply);
                self.begin_teardown();
            }
            ConnectionPhase::Disconnecting { .. } => self.teardown_waiters.push(reply),
        }
    }

    fn transmit(&mut self, payload: Payload, reply: Reply<Result<TransferStatus, ConnectionError>>) {
        let active = match &self.active {
            Some(active) if self.phase.is_connected() => active,
            _ => {
                warn!("cannot send: not connected to HUD device");
                let _ = reply.send(Err(ConnectionError::NotConnected));
                return;
            }
        };
        let driver = Arc::clone(&active.driver);
        let name = active.name.clone();
        let completions = self.completions_tx.clone();

        tokio::spawn(async move {
            let work = tokio::task::spawn_blocking(move || {
                let mut guard = lock_driver(&driver);
                if !guard.is_connected() {
                    return Err(ConnectionError::NotConnected);
                }
                let sent = match payload {
                    Payload::Position(fix) => guard.send_position(&fix),
                    Payload::Cot(xml) => guard.send_cot(&xml),
                };
                sent.map_err(|source| ConnectionError::Driver {
                    driver: name,
                    source,
                })
            });
            let result = work
                .await
                .unwrap_or_else(|e| Err(ConnectionError::Worker(e.to_string())));
            if let Err(e) = &result {
                let _ = completions.send(Completion::TransferFailed(e.to_string()));
            }
            let _ = reply.send(result);
        });
    }

    fn is_ready(&self) -> bool {
        match &self.active {
            Some(active) if self.phase.is_connected() => match active.driver.try_lock() {
                Ok(driver) => driver.is_connected(),
                // A transfer holds the driver, so it was connected a moment ago.
                Err(TryLockError::WouldBlock) => true,
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().is_connected(),
            },
            _ => false,
        }
    }

    fn snapshot(&self) -> ConnectionSnapshot {
        let status = self.active.as_ref().map(|active| match active.driver.try_lock() {
            Ok(driver) => driver.status(),
            Err(_) => active.status.clone(),
        });
        ConnectionSnapshot {
            phase: self.phase.clone(),
            status,
            last_error: self.last_error.clone(),
        }
    }

    // ── Platform notifications ───────────────────────────────────

    fn on_platform(&mut self, event: PlatformEvent) {
        match event {
            PlatformEvent::Permission { device, granted } => self.on_permission(device, granted),
            PlatformEvent::Attached(descriptor) => {
                info!("USB device attached: {}", descriptor.summary());
                self.emit_devices();
            }
            PlatformEvent::Detached(device) => {
                info!("USB device detached: {device}");
                self.on_detached(&device);
                self.emit_devices();
            }
        }
    }

    fn on_permission(&mut self, device: DeviceId, granted: bool) {
        let awaited = matches!(
            &self.phase,
            ConnectionPhase::PermissionPending { device: pending } if *pending == device
        );
        if !awaited {
            debug!("ignoring permission answer for {device} while {}", self.phase);
            return;
        }
        if !granted {
            self.fail_attempt(ConnectionError::PermissionDenied(device));
            return;
        }

        info!("USB permission granted for {device}");
        // Re-read the descriptor: the one seen at request time may be stale.
        let Some(descriptor) = self.host.enumerate().into_iter().find(|d| d.id == device) else {
            self.fail_attempt(ConnectionError::DeviceDetached(device));
            return;
        };
        match self.phase.begin_connect(device) {
            Ok(()) => self.dispatch(descriptor),
            Err(e) => self.fail_attempt(e),
        }
    }

    fn on_detached(&mut self, device: &DeviceId) {
        if self.phase.device() != Some(device) {
            return;
        }
        match self.phase {
            ConnectionPhase::PermissionPending { .. } => {
                self.fail_attempt(ConnectionError::DeviceDetached(device.clone()));
            }
            ConnectionPhase::Connecting { .. } => {
                self.cancel_connect(ConnectionError::DeviceDetached(device.clone()));
            }
            ConnectionPhase::Connected { .. } => {
                warn!("connected HUD {device} was unplugged");
                self.begin_teardown();
            }
            ConnectionPhase::Idle | ConnectionPhase::Disconnecting { .. } => {}
        }
    }

    // ── Blocking work ────────────────────────────────────────────

    /// Open `descriptor` on the blocking pool with every compatible
    /// driver in registration order.
    fn dispatch(&mut self, descriptor: PeripheralDescriptor) {
        let attempt = self.attempt;
        let candidates: Vec<Arc<dyn DriverPrototype>> =
            self.registry.compatible(&descriptor).collect();
        let completions = self.completions_tx.clone();

        tokio::spawn(async move {
            let work = tokio::task::spawn_blocking(move || connect_first(&candidates, &descriptor));
            let completion = match work.await {
                Ok(Ok(driver)) => Completion::Connected { attempt, driver },
                Ok(Err(error)) => Completion::Failed { attempt, error },
                Err(e) => Completion::Failed {
                    attempt,
                    error: ConnectionError::Worker(e.to_string()),
                },
            };
            let _ = completions.send(completion);
        });
    }

    /// Move to `Disconnecting` and release the driver on the blocking pool.
    fn begin_teardown(&mut self) {
        let Some(device) = self.phase.device().cloned() else {
            return;
        };
        if let Err(e) = self.phase.begin_teardown() {
            debug!("teardown skipped: {e}");
            return;
        }
        let active = self.active.take();
        let completions = self.completions_tx.clone();

        tokio::spawn(async move {
            if let Some(ActiveDriver { name, driver, .. }) = active {
                let work = tokio::task::spawn_blocking(move || {
                    lock_driver(&driver).disconnect();
                });
                if let Err(e) = work.await {
                    error!("{name} teardown worker failed: {e}");
                }
            }
            let _ = completions.send(Completion::TornDown { device });
        });
    }

    fn on_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Connected { attempt, driver } if self.draining == Some(attempt) => {
                debug!("releasing {} driver from cancelled attempt {attempt}", driver.name());
                let completions = self.completions_tx.clone();
                tokio::spawn(async move {
                    let mut driver = driver;
                    let _ = tokio::task::spawn_blocking(move || driver.disconnect()).await;
                    let _ = completions.send(Completion::Released { attempt });
                });
            }
            Completion::Connected { attempt, driver } => self.on_connected(attempt, driver),
            Completion::Failed { attempt, error } if self.draining == Some(attempt) => {
                debug!("cancelled attempt {attempt} ended on its own: {error}");
                self.finish_drain(attempt);
            }
            Completion::Released { attempt } => self.finish_drain(attempt),
            Completion::Failed { attempt, error } => {
                if !self.is_current(attempt) {
                    debug!("ignoring failure of abandoned attempt {attempt}: {error}");
                    return;
                }
                self.fail_attempt(error);
            }
            Completion::TornDown { device } => self.on_torn_down(device),
            Completion::TransferFailed(error) => self.last_error = Some(error),
        }
    }

    fn is_current(&self, attempt: u64) -> bool {
        attempt == self.attempt && matches!(self.phase, ConnectionPhase::Connecting { .. })
    }

    fn on_connected(&mut self, attempt: u64, driver: Box<dyn HudDriver>) {
        if !self.is_current(attempt) {
            debug!("releasing {} driver from abandoned attempt {attempt}", driver.name());
            release(driver);
            return;
        }
        let name = driver.name().to_string();
        let status = driver.status();
        if let Err(e) = self.phase.complete_connect(name.clone()) {
            error!("cannot bind {name} driver: {e}");
            release(driver);
            return;
        }
        let Some(device) = self.phase.device().cloned() else {
            return;
        };

        info!("successfully connected to {device} via {name}");
        self.active = Some(ActiveDriver {
            name: name.clone(),
            status: status.clone(),
            driver: Arc::new(Mutex::new(driver)),
        });
        self.emit(ConnectionEvent::Connected {
            device,
            driver: name,
            status,
        });
    }

    fn on_torn_down(&mut self, device: DeviceId) {
        match self.phase.finish_teardown() {
            Ok(()) => {
                info!("disconnected from HUD device {device}");
                self.emit(ConnectionEvent::Disconnected { device });
            }
            Err(e) => debug!("stray teardown completion for {device}: {e}"),
        }
        for waiter in self.teardown_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }

    /// Cancelled attempt is gone: the device is free again.
    fn finish_drain(&mut self, attempt: u64) {
        if self.draining != Some(attempt) {
            return;
        }
        self.draining = None;
        match self.phase.finish_teardown() {
            Ok(()) => debug!("cancelled attempt {attempt} released the device"),
            Err(e) => debug!("stray release of attempt {attempt}: {e}"),
        }
        for waiter in self.teardown_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }

    /// End an attempt that has no worker in flight with `reason`.
    fn fail_attempt(&mut self, reason: ConnectionError) {
        let Some(device) = self.phase.device().cloned() else {
            return;
        };
        if self.phase.abandon_attempt().is_err() {
            return;
        }
        self.attempt += 1;
        self.report_failure(device, reason);
    }

    /// End a `Connecting` attempt with `reason`. The phase stays in
    /// `Disconnecting` until the worker reports back and whatever it
    /// opened is released.
    fn cancel_connect(&mut self, reason: ConnectionError) {
        let Some(device) = self.phase.device().cloned() else {
            return;
        };
        if let Err(e) = self.phase.cancel_connect() {
            debug!("cancel skipped: {e}");
            return;
        }
        self.draining = Some(self.attempt);
        self.attempt += 1;
        self.report_failure(device, reason);
    }

    fn report_failure(&mut self, device: DeviceId, reason: ConnectionError) {
        self.last_error = Some(reason.to_string());
        match reason {
            ConnectionError::Cancelled => info!("connection attempt to {device} cancelled"),
            ConnectionError::PermissionDenied(_) => warn!("{reason}"),
            _ => error!("connection to {device} failed: {reason}"),
        }
        self.emit(ConnectionEvent::ConnectionFailed { device, reason });
    }

    // ── Observers ────────────────────────────────────────────────

    fn emit(&self, event: ConnectionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn emit_devices(&self) {
        self.emit(ConnectionEvent::DevicesChanged(self.available()));
    }

    // ── Disposal ─────────────────────────────────────────────────

    async fn dispose(&mut self) {
        if matches!(self.phase, ConnectionPhase::Connecting { .. }) {
            self.cancel_connect(ConnectionError::Cancelled);
        }
        while matches!(self.phase, ConnectionPhase::Disconnecting { .. }) {
            match self.completions.recv().await {
                Some(completion) => self.on_completion(completion),
                None => break,
            }
        }

        match self.phase {
            ConnectionPhase::PermissionPending { .. } => {
                self.fail_attempt(ConnectionError::Cancelled);
            }
            ConnectionPhase::Connected { .. } => {
                if let Some(ActiveDriver { driver, .. }) = self.active.take() {
                    let _ = tokio::task::spawn_blocking(move || {
                        lock_driver(&driver).disconnect();
                    })
                    .await;
                }
                if let Some(device) = self.phase.device().cloned() {
                    self.emit(ConnectionEvent::Disconnected { device });
                }
            }
            ConnectionPhase::Idle
            | ConnectionPhase::Connecting { .. }
            | ConnectionPhase::Disconnecting { .. } => {}
        }

        self.phase.force_idle();
        for waiter in self.teardown_waiters.drain(..) {
            let _ = waiter.send(());
        }
        info!("connection manager stopped");
    }
}

/// Try each candidate until one connects. Blocking.
fn connect_first(
    candidates: &[Arc<dyn DriverPrototype>],
    descriptor: &PeripheralDescriptor,
) -> Result<Box<dyn HudDriver>, ConnectionError> {
    let mut failure = ConnectionError::NoCompatibleDriver(descriptor.id.clone());
    for prototype in candidates {
        debug!("attempting connection with {} driver", prototype.name());
        let mut driver = prototype.instantiate();
        match driver.connect(descriptor) {
            Ok(()) => return Ok(driver),
            Err(source) => {
                warn!("failed to connect with {} driver: {source}", prototype.name());
                failure = ConnectionError::Driver {
                    driver: prototype.name().to_string(),
                    source,
                };
            }
        }
    }
    Err(failure)
}

/// Disconnect a driver that never became active.
fn release(mut driver: Box<dyn HudDriver>) {
    drop(tokio::task::spawn_blocking(move || driver.disconnect()));
}

// ── Tests ────────────────────────────────────────────────────────
