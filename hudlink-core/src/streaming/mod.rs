//! Streaming scheduler.
//!
//! Keeps sending the latest position to the HUD while streaming is
//! enabled. Two producers feed one trigger channel: position-change
//! notifications pushed by the host, and a fallback timer at the
//! configured rate. A single consumer task turns every trigger into
//! the same transmit-if-ready action.
//!
//! ```text
//!   notify_position_changed ──try_send──►┐
//!                                        ├──► trigger channel ──► consumer ──► ConnectionHandle::send_position
//!   fallback timer (ScopedTask) ──send──►┘        ▲
//!                                                 │ Disconnected
//!                                  ConnectionEvent ┘
//! ```
//!
//! The consumer holds the session read lock for the whole of a
//! transmit, and `stop` takes the write lock, so once `stop` returns
//! no further transmit can begin. Timer ticks carry the session
//! generation they were armed for; ticks from an older generation are
//! dropped.

mod source;

pub use source::{LatestPosition, PositionSource};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, broadcast, mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cot::PositionFix;
use crate::driver::TransferStatus;
use crate::error::{ConnectionError, StreamError};
use crate::manager::{ConnectionEvent, ConnectionHandle};
use crate::task::ScopedTask;

const STOPPED_PREVIEW: &str = "Streaming stopped";
const NO_POSITION_PREVIEW: &str = "ERROR: Cannot get self position";

// ── UpdateRate ───────────────────────────────────────────────────

/// Fallback timer frequency.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UpdateRate {
    #[default]
    #[serde(rename = "1hz")]
    Hz1,
    #[serde(rename = "5hz")]
    Hz5,
    #[serde(rename = "10hz")]
    Hz10,
}

impl UpdateRate {
    pub fn hz(self) -> u32 {
        match self {
            Self::Hz1 => 1,
            Self::Hz5 => 5,
            Self::Hz10 => 10,
        }
    }

    pub fn period(self) -> Duration {
        Duration::from_millis(1000 / u64::from(self.hz()))
    }
}

impl fmt::Display for UpdateRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} Hz", self.hz())
    }
}

// ── StreamingConfig ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    pub rate: UpdateRate,
    /// Queued triggers before position-change notifications are dropped.
    pub trigger_capacity: usize,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            rate: UpdateRate::default(),
            trigger_capacity: 16,
        }
    }
}

// ── StreamStatus ─────────────────────────────────────────────────

/// Caller-visible streaming state, published on a watch channel.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamStatus {
    pub enabled: bool,
    pub rate: UpdateRate,
    /// Transmissions the device accepted in full.
    pub sent: u64,
    /// Transmissions the device accepted only in part.
    pub partial: u64,
    pub failed: u64,
    /// Triggers that found the connection not ready.
    pub skipped: u64,
    /// Operator preview of the last fix sent, or the last failure.
    pub preview: String,
}

impl StreamStatus {
    fn new(rate: UpdateRate) -> Self {
        Self {
            enabled: false,
            rate,
            sent: 0,
            partial: 0,
            failed: 0,
            skipped: 0,
            preview: STOPPED_PREVIEW.to_string(),
        }
    }
}

// ── Shared state ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum Trigger {
    Tick { generation: u64 },
    PositionChanged,
}

struct Session {
    enabled: bool,
    rate: UpdateRate,
    generation: u64,
    timer: Option<ScopedTask>,
}

impl Session {
    /// Invalidate outstanding ticks and re-arm the timer if enabled.
    fn rearm(&mut self, triggers: &mpsc::Sender<Trigger>) {
        self.generation += 1;
        self.timer = None;
        if self.enabled {
            let timer = fallback_timer(triggers.clone(), self.generation, self.rate.period());
            self.timer = Some(timer);
        }
    }
}

struct Shared {
    session: RwLock<Session>,
    triggers: mpsc::Sender<Trigger>,
    status: watch::Sender<StreamStatus>,
    connection: ConnectionHandle,
}

impl Shared {
    async fn start(&self, rate: Option<UpdateRate>) -> Result<(), StreamError> {
        // Checked under the write lock, so a stop for a lost connection
        // either sees this session enabled or runs after the check.
        let mut session = self.session.write().await;
        if !self.connection.is_ready().await {
            warn!("cannot start streaming: not connected to HUD device");
            return Err(StreamError::NotConnected);
        }
        if let Some(rate) = rate {
            session.rate = rate;
        }
        session.enabled = true;
        session.rearm(&self.triggers);
        let rate = session.rate;
        self.status.send_modify(|s| {
            s.enabled = true;
            s.rate = rate;
        });
        info!("started streaming to HUD with {rate} fallback timer");
        Ok(())
    }

    async fn stop(&self) {
        let mut session = self.session.write().await;
        let was_enabled = session.enabled;
        session.enabled = false;
        session.rearm(&self.triggers);
        drop(session);

        self.status.send_modify(|s| {
            s.enabled = false;
            s.preview = STOPPED_PREVIEW.to_string();
        });
        if was_enabled {
            info!("stopped streaming");
        }
    }

    async fn set_rate(&self, rate: UpdateRate) {
        let mut session = self.session.write().await;
        if session.rate == rate {
            return;
        }
        session.rate = rate;
        if session.enabled {
            session.rearm(&self.triggers);
        }
        self.status.send_modify(|s| s.rate = rate);
        debug!("streaming rate set to {rate}");
    }
}

/// Send a tick now and then every `period`, until aborted.
fn fallback_timer(
    triggers: mpsc::Sender<Trigger>,
    generation: u64,
    period: Duration,
) -> ScopedTask {
    ScopedTask::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if triggers.send(Trigger::Tick { generation }).await.is_err() {
                break;
            }
        }
    })
}

// ── StreamingHandle ──────────────────────────────────────────────

/// Cloneable controls for the [`StreamingScheduler`].
#[derive(Clone)]
pub struct StreamingHandle {
    shared: Arc<Shared>,
}

impl StreamingHandle {
    /// Enable streaming at the current rate. Rejected when the
    /// connection is not ready. The first transmission happens
    /// immediately.
    pub async fn start(&self) -> Result<(), StreamError> {
        self.shared.start(None).await
    }

    pub async fn start_at(&self, rate: UpdateRate) -> Result<(), StreamError> {
        self.shared.start(Some(rate)).await
    }

    /// Disable streaming. Idempotent. No transmission begins after
    /// this returns.
    pub async fn stop(&self) {
        self.shared.stop().await
    }

    /// Change the fallback rate, re-arming the timer if streaming.
    pub async fn set_rate(&self, rate: UpdateRate) {
        self.shared.set_rate(rate).await
    }

    pub async fn is_enabled(&self) -> bool {
        self.shared.session.read().await.enabled
    }

    /// Push trigger from the host's position-change events. Dropped
    /// when the trigger queue is full.
    pub fn notify_position_changed(&self) {
        match self.shared.triggers.try_send(Trigger::PositionChanged) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("trigger queue full, dropping position update");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    pub fn status(&self) -> StreamStatus {
        self.shared.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<StreamStatus> {
        self.shared.status.subscribe()
    }

    /// Send the fixed test fix and show it in the preview.
    pub async fn send_test(&self, callsign: &str) -> Result<TransferStatus, StreamError> {
        match self.shared.connection.send_test_position(callsign).await {
            Ok(sent) => {
                let fix = PositionFix::test_pattern(callsign);
                self.shared.status.send_modify(|s| {
                    s.preview = format!(
                        "TEST DATA SENT:\nLat: {:.1}°\nLon: {:.1}°\nAlt: {:.1} m\nHdg: {:.1}°",
                        fix.lat, fix.lon, fix.hae, fix.heading
                    );
                });
                info!("test data sent successfully ({sent})");
                Ok(sent)
            }
            Err(e) => {
                warn!("failed to send test data: {e}");
                Err(e.into())
            }
        }
    }
}

impl fmt::Debug for StreamingHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingHandle")
            .field("status", &*self.shared.status.borrow())
            .finish()
    }
}

// ── StreamingScheduler ───────────────────────────────────────────

/// The consumer side: owns the trigger queue and performs transmits.
pub struct StreamingScheduler {
    shared: Arc<Shared>,
    source: Arc<dyn PositionSource>,
    triggers: mpsc::Receiver<Trigger>,
    events: broadcast::Receiver<ConnectionEvent>,
}

impl StreamingScheduler {
    pub fn new(
        connection: ConnectionHandle,
        source: Arc<dyn PositionSource>,
        config: &StreamingConfig,
    ) -> (Self, StreamingHandle) {
        let (triggers_tx, triggers) = mpsc::channel(config.trigger_capacity.max(1));
        let (status, _) = watch::channel(StreamStatus::new(config.rate));
        let events = connection.subscribe();
        let shared = Arc::new(Shared {
            session: RwLock::new(Session {
                enabled: false,
                rate: config.rate,
                generation: 0,
                timer: None,
            }),
            triggers: triggers_tx,
            status,
            connection,
        });
        let scheduler = Self {
            shared: Arc::clone(&shared),
            source,
            triggers,
            events,
        };
        (scheduler, StreamingHandle { shared })
    }

    /// Consume triggers until `shutdown` is cancelled. Streaming stops
    /// whenever the connection reports `Disconnected`.
    pub async fn run(mut self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                event = self.events.recv() => match event {
                    Ok(ConnectionEvent::Disconnected { device }) => {
                        info!("HUD {device} disconnected, stopping stream");
                        self.shared.stop().await;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        debug!("missed {missed} connection events");
                        if !self.shared.connection.is_ready().await {
                            self.shared.stop().await;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        self.shared.stop().await;
                        break;
                    }
                },
                Some(trigger) = self.triggers.recv() => self.on_trigger(trigger).await,
            }
        }
        self.shared.stop().await;
        debug!("streaming scheduler stopped");
    }

    async fn on_trigger(&self, trigger: Trigger) {
        let session = self.shared.session.read().await;
        if !session.enabled {
            return;
        }
        if let Trigger::Tick { generation } = trigger {
            if generation != session.generation {
                return;
            }
        }

        if !self.shared.connection.is_ready().await {
            // Lost a race with detach; the Disconnected event stops us.
            self.shared.status.send_modify(|s| s.skipped += 1);
            return;
        }
        let Some(fix) = self.source.current_position().await else {
            warn!("cannot get self position");
            self.shared.status.send_modify(|s| {
                s.failed += 1;
                s.preview = NO_POSITION_PREVIEW.to_string();
            });
            return;
        };

        let result = self.shared.connection.send_position(fix.clone()).await;
        self.shared.status.send_modify(|s| match &result {
            Ok(sent) => {
                if sent.is_partial() {
                    s.partial += 1;
                } else {
                    s.sent += 1;
                }
                s.preview = fix.preview();
            }
            Err(ConnectionError::NotConnected) => s.skipped += 1,
            Err(e) => {
                s.failed += 1;
                s.preview = format!("ERROR: {e}");
            }
        });
        if let Err(e) = &result {
            debug!("stream transmit failed: {e}");
        }
        drop(session);
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{
        DeviceId, EndpointDescriptor, InterfaceDescriptor, PeripheralDescriptor, class,
    };
    use crate::driver::{DriverConfig, DriverRegistry};
    use crate::host::{SimulatedHost, UsbHost};
    use crate::manager::{ConnectionManager, ManagerConfig};

    fn idle_link(capacity: usize) -> (StreamingScheduler, StreamingHandle, CancellationToken) {
        let host: Arc<dyn UsbHost> = Arc::new(SimulatedHost::new());
        let registry = DriverRegistry::with_defaults(Arc::clone(&host), &DriverConfig::default());
        let (manager, connection) = ConnectionManager::new(host, registry, &ManagerConfig::default());
        let token = CancellationToken::new();
        tokio::spawn(manager.run(token.clone()));

        let config = StreamingConfig {
            trigger_capacity: capacity,
            ..Default::default()
        };
        let source = Arc::new(LatestPosition::with_fix(PositionFix::test_pattern("T")));
        let (scheduler, handle) = StreamingScheduler::new(connection, source, &config);
        (scheduler, handle, token)
    }

    #[test]
    fn rate_periods() {
        assert_eq!(UpdateRate::default(), UpdateRate::Hz1);
        assert_eq!(UpdateRate::Hz1.period(), Duration::from_secs(1));
        assert_eq!(UpdateRate::Hz5.period(), Duration::from_millis(200));
        assert_eq!(UpdateRate::Hz10.period(), Duration::from_millis(100));
        assert_eq!(UpdateRate::Hz10.to_string(), "10 Hz");
    }

    #[test]
    fn config_from_toml() {
        let cfg: StreamingConfig = toml::from_str(r#"rate = "5hz""#).unwrap();
        assert_eq!(cfg.rate, UpdateRate::Hz5);
        assert_eq!(cfg.trigger_capacity, 16);

        let cfg: StreamingConfig = toml::from_str("").unwrap();
        assert_eq!(cfg, StreamingConfig::default());
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_timer_ticks_now_then_every_period() {
        let (tx, mut rx) = mpsc::channel(4);
        let timer = fallback_timer(tx, 7, Duration::from_millis(200));

        assert!(matches!(rx.recv().await, Some(Trigger::Tick { generation: 7 })));
        assert!(rx.try_recv().is_err());

        tokio::time::advance(Duration::from_millis(200)).await;
        assert!(matches!(rx.recv().await, Some(Trigger::Tick { generation: 7 })));

        timer.cancel().await;
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn start_checks_readiness_after_pending_stop() {
        let host = SimulatedHost::new();
        let hud = PeripheralDescriptor::new(DeviceId::new("h"), 0x0403, 0x6015).with_interface(
            InterfaceDescriptor::new(0, class::VENDOR_SPECIFIC, 0xFF)
                .with_endpoint(EndpointDescriptor::bulk_out(0x02)),
        );
        let id = hud.id.clone();
        host.attach_permitted(hud);

        let shared: Arc<dyn UsbHost> = Arc::new(host.clone());
        let registry = DriverRegistry::with_defaults(Arc::clone(&shared), &DriverConfig::default());
        let (manager, connection) = ConnectionManager::new(shared, registry, &ManagerConfig::default());
        let token = CancellationToken::new();
        tokio::spawn(manager.run(token.clone()));
        let mut events = connection.subscribe();
        connection.request_connection(&id).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while !matches!(events.recv().await, Ok(ConnectionEvent::Connected { .. })) {}
        })
        .await
        .unwrap();

        let source = Arc::new(LatestPosition::with_fix(PositionFix::test_pattern("T")));
        let (_scheduler, handle) =
            StreamingScheduler::new(connection.clone(), source, &StreamingConfig::default());

        // A stop for the lost connection holds the session while the
        // device goes away underneath a concurrent start.
        let stopping = handle.shared.session.write().await;
        let starter = tokio::spawn({
            let handle = handle.clone();
            async move { handle.start().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        connection.disconnect().await.unwrap();
        drop(stopping);

        assert_eq!(starter.await.unwrap(), Err(StreamError::NotConnected));
        assert!(!handle.is_enabled().await);
        assert!(!handle.status().enabled);
        token.cancel();
    }

    #[tokio::test]
    async fn start_rejected_when_not_connected() {
        let (_scheduler, handle, token) = idle_link(4);
        assert_eq!(handle.start().await, Err(StreamError::NotConnected));
        assert!(!handle.is_enabled().await);
        assert!(!handle.status().enabled);
        token.cancel();
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let (_scheduler, handle, token) = idle_link(4);
        handle.stop().await;
        let once = handle.status();
        handle.stop().await;
        assert_eq!(handle.status(), once);
        assert!(!once.enabled);
        assert_eq!(once.preview, "Streaming stopped");
        token.cancel();
    }

    #[tokio::test]
    async fn position_burst_beyond_capacity_is_dropped() {
        let (mut scheduler, handle, token) = idle_link(2);
        for _ in 0..10 {
            handle.notify_position_changed();
        }
        let mut queued = 0;
        while scheduler.triggers.try_recv().is_ok() {
            queued += 1;
        }
        assert_eq!(queued, 2);
        token.cancel();
    }

    #[tokio::test]
    async fn set_rate_updates_status() {
        let (_scheduler, handle, token) = idle_link(4);
        let mut status = handle.watch_status();
        handle.set_rate(UpdateRate::Hz10).await;
        assert!(status.has_changed().unwrap());
        assert_eq!(status.borrow_and_update().rate, UpdateRate::Hz10);
        assert!(!handle.is_enabled().await);
        token.cancel();
    }
}
