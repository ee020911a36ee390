//! Scripted end-to-end run.
//!
//! Plays both sides of a HUD session against a [`SimulatedHost`]:
//! the operator (device choice, permission answer, unplugging) and the
//! host app (a moving self position with irregular change pushes).
//! Everything the simulated HUD received is decoded at the end.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rand::Rng;
use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hudlink_core::{
    ConnectionError, ConnectionEvent, CotData, DeviceId, HudLink, ScopedTask, SimBehavior,
    SimulatedHost, StreamStatus, StreamingHandle, format_for_hud,
};

use crate::config::SimConfig;
use crate::track::{self, Track};

const STEP: Duration = Duration::from_millis(100);
const OUTCOME_GRACE: Duration = Duration::from_secs(5);

// ── SimReport ────────────────────────────────────────────────────

/// What happened during a run.
#[derive(Debug, Clone)]
pub struct SimReport {
    /// Every connection event, in delivery order.
    pub events: Vec<ConnectionEvent>,
    /// Messages the HUD received that decoded as CoT.
    pub messages: Vec<CotData>,
    /// Transfers that did not decode.
    pub garbled: usize,
    /// Streaming counters just before shutdown.
    pub stream: StreamStatus,
    pub status_line: String,
}

impl SimReport {
    pub fn connected(&self) -> bool {
        self.events
            .iter()
            .any(|e| matches!(e, ConnectionEvent::Connected { .. }))
    }

    pub fn failure(&self) -> Option<&ConnectionError> {
        self.events.iter().find_map(|e| match e {
            ConnectionEvent::ConnectionFailed { reason, .. } => Some(reason),
            _ => None,
        })
    }
}

// ── SimService ───────────────────────────────────────────────────

pub struct SimService {
    config: SimConfig,
    host: SimulatedHost,
}

impl SimService {
    pub fn new(config: SimConfig) -> Self {
        Self {
            config,
            host: SimulatedHost::new(),
        }
    }

    pub fn host(&self) -> &SimulatedHost {
        &self.host
    }

    /// Run the scenario for `duration`, or until `shutdown` fires.
    pub async fn run(
        &self,
        duration: Duration,
        shutdown: CancellationToken,
    ) -> Result<SimReport, ConnectionError> {
        let scenario = &self.config.scenario;
        let descriptor = scenario.descriptor();
        let device = descriptor.id.clone();

        if scenario.pre_granted {
            self.host.attach_permitted(descriptor);
        } else {
            self.host.attach(descriptor);
        }
        if scenario.short_write > 0 {
            self.host.set_behavior(
                &device,
                SimBehavior {
                    short_write: Some(scenario.short_write),
                    ..SimBehavior::default()
                },
            );
        }

        let track = Arc::new(Track::new(&scenario.track, scenario.seed));
        let link = HudLink::start(
            Arc::new(self.host.clone()),
            track.clone(),
            &self.config.to_link_config(),
        );
        let connection = link.connection().clone();
        let streaming = link.streaming().clone();

        let events = Arc::new(Mutex::new(Vec::new()));
        let recorder = tokio::spawn(record(connection.subscribe(), Arc::clone(&events)));
        let mut outcome = connection.subscribe();

        // ── Operator picks the HUD ───────────────────────────────

        let available = connection.list_available().await?;
        for d in &available {
            info!("available: {}", d.summary());
        }
        let _prompt = if available.iter().any(|d| d.id == device) {
            connection.request_connection(&device).await?;
            (!scenario.pre_granted).then(|| self.answer_prompt(device.clone()))
        } else {
            warn!("{device} is not offered by any driver");
            None
        };

        let deadline = Duration::from_millis(scenario.grant_delay_ms) + OUTCOME_GRACE;
        let connected = tokio::select! {
            connected = wait_for_outcome(&mut outcome, &device) => connected,
            _ = tokio::time::sleep(deadline) => {
                warn!("no connection outcome within {deadline:?}");
                false
            }
            _ = shutdown.cancelled() => false,
        };

        if connected {
            match streaming.start().await {
                Ok(()) => info!("streaming at {}", streaming.status().rate),
                Err(e) => warn!("could not start streaming: {e}"),
            }
            self.walk(&track, &streaming, &device, duration, &shutdown)
                .await;
        }

        let stream = streaming.status();
        let status_line = connection
            .snapshot()
            .await
            .map(|s| s.status_line())
            .unwrap_or_else(|e| e.to_string());

        link.shutdown().await;
        drop(connection);
        drop(streaming);
        if tokio::time::timeout(Duration::from_secs(1), recorder)
            .await
            .is_err()
        {
            warn!("event recorder did not drain");
        }

        let (messages, garbled) = self.decode(&device);
        let events = std::mem::take(&mut *events.lock().unwrap_or_else(PoisonError::into_inner));
        Ok(SimReport {
            events,
            messages,
            garbled,
            stream,
            status_line,
        })
    }

    /// Answer the permission prompt after the configured delay.
    fn answer_prompt(&self, device: DeviceId) -> ScopedTask {
        let host = self.host.clone();
        let delay = Duration::from_millis(self.config.scenario.grant_delay_ms);
        let deny = self.config.scenario.deny;
        ScopedTask::spawn(async move {
            tokio::time::sleep(delay).await;
            if deny {
                info!("operator denies access to {device}");
                host.deny(&device);
            } else {
                info!("operator grants access to {device}");
                host.grant(&device);
            }
        })
    }

    /// Move the operator until `duration` elapses, pushing position
    /// changes at random and unplugging the HUD when scripted to.
    async fn walk(
        &self,
        track: &Track,
        streaming: &StreamingHandle,
        device: &DeviceId,
        duration: Duration,
        shutdown: &CancellationToken,
    ) {
        let scenario = &self.config.scenario;
        let mut rng = track::rng(scenario.seed.wrapping_add(1));
        let push_probability = scenario.push_probability.clamp(0.0, 1.0);
        let detach_at = (scenario.detach_after_secs > 0)
            .then(|| Duration::from_secs(scenario.detach_after_secs));

        let started = Instant::now();
        let mut detached = false;
        let mut ticker = tokio::time::interval(STEP);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.cancelled() => break,
            }
            let elapsed = started.elapsed();
            if elapsed >= duration {
                break;
            }

            let fix = track.step(STEP);
            if rng.gen_bool(push_probability) {
                debug!("position push: {:.6}, {:.6}", fix.lat, fix.lon);
                streaming.notify_position_changed();
            }

            if !detached && detach_at.is_some_and(|at| elapsed >= at) {
                info!("operator unplugs {device}");
                self.host.detach(device);
                detached = true;
            }
        }
    }

    fn decode(&self, device: &DeviceId) -> (Vec<CotData>, usize) {
        let mut messages = Vec::new();
        let mut garbled = 0;
        for xml in self.host.written_messages(device) {
            match CotData::parse(&xml) {
                Ok(data) => {
                    debug!("HUD shows:\n{}", format_for_hud(&data));
                    messages.push(data);
                }
                Err(e) => {
                    debug!("HUD could not decode transfer: {e}");
                    garbled += 1;
                }
            }
        }
        (messages, garbled)
    }
}

// ── Helpers ──────────────────────────────────────────────────────

async fn record(
    mut rx: broadcast::Receiver<ConnectionEvent>,
    events: Arc<Mutex<Vec<ConnectionEvent>>>,
) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                info!("event: {}", describe(&event));
                events
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(event);
            }
            Err(broadcast::error::RecvError::Lagged(n)) => warn!("event recorder lagged by {n}"),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// True on `Connected` for `device`, false on its `ConnectionFailed`.
async fn wait_for_outcome(
    rx: &mut broadcast::Receiver<ConnectionEvent>,
    device: &DeviceId,
) -> bool {
    loop {
        match rx.recv().await {
            Ok(ConnectionEvent::Connected { device: d, .. }) if &d == device => return true,
            Ok(ConnectionEvent::ConnectionFailed { device: d, .. }) if &d == device => {
                return false;
            }
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => return false,
        }
    }
}

fn describe(event: &ConnectionEvent) -> String {
    match event {
        ConnectionEvent::Connected { device, status, .. } => format!("connected {device}: {status}"),
        ConnectionEvent::Disconnected { device } => format!("disconnected {device}"),
        ConnectionEvent::ConnectionFailed { device, reason } => {
            format!("connection to {device} failed: {reason}")
        }
        ConnectionEvent::DevicesChanged(devices) => format!("{} device(s) available", devices.len()),
    }
}

// ── Tests ────────────────────────────────────────────────────────
