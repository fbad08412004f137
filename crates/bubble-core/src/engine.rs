//! The coordinator actor.
//!
//! Every piece of mutable state (links, ranging sessions, bubble state,
//! restriction decision, watchdog) is owned by a single [`Coordinator`] task.
//! Radio callbacks, ranging callbacks, timers and API requests are posted into
//! its [`Mailbox`] as [`Event`]s and handled strictly one at a time, so a
//! disconnect and a late distance update can never interleave.
//!
//! Observers read state through the `watch` channels exposed by
//! [`EngineHandle`].

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use utoipa::ToSchema;

use crate::bubble::{BubbleState, Debounce, PresenceClassifier};
use crate::config::Config;
use crate::enforcement::EnforcementSink;
use crate::error::{BubbleError, Result};
use crate::link::{LinkAction, LinkEvent, LinkSnapshot, LinkState};
use crate::policy::{RestrictionEngine, Trigger};
use crate::ranging::{RangingBackend, RangingEvent, SessionToken};
use crate::registry::{AccessoryRecord, DeviceRegistry, KnownAccessories};
use crate::scheduler::{AppPhase, BackgroundScheduler, TickKind, Watchdog, WatchdogAction, WatchdogStatus};
use crate::storage::Storage;
use crate::tasks::TaskSource;
use crate::types::{AccessoryId, Clock, PeripheralId};

// ============================================================================
// Events
// ============================================================================

/// Callbacks from the Bluetooth radio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioEvent {
    /// The adapter is powered and usable.
    PoweredOn,
    /// The adapter went away or was powered off.
    PoweredOff,
    /// A peripheral advertising the accessory service was seen.
    Discovered {
        /// Radio identifier.
        peripheral: PeripheralId,
        /// Advertised name.
        name: Option<String>,
    },
    /// A connection was established.
    Connected {
        /// Radio identifier.
        peripheral: PeripheralId,
        /// Largest frame a single write carries, if known.
        max_write_len: Option<usize>,
    },
    /// A connection attempt failed.
    ConnectFailed {
        /// Radio identifier.
        peripheral: PeripheralId,
    },
    /// The accessory service and its three characteristics were found.
    CharacteristicsResolved {
        /// Radio identifier.
        peripheral: PeripheralId,
    },
    /// A notification arrived on the outbound characteristic.
    Value {
        /// Radio identifier.
        peripheral: PeripheralId,
        /// Raw frame.
        bytes: Vec<u8>,
    },
    /// The connection was lost.
    Disconnected {
        /// Radio identifier.
        peripheral: PeripheralId,
    },
}

/// Coarse geofence transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RegionEvent {
    /// Entered the home region.
    Entered,
    /// Left the home region.
    Exited,
}

/// Everything the coordinator reacts to.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Radio callback.
    Radio(RadioEvent),
    /// Ranging session callback.
    Ranging(RangingEvent),
    /// Watchdog timer.
    Tick {
        /// Which timer.
        kind: TickKind,
        /// Epoch it was armed in.
        epoch: u64,
    },
    /// The background execution window elapsed.
    WindowExpired {
        /// Epoch it was opened in.
        epoch: u64,
    },
    /// Application moved between foreground and background.
    Lifecycle(AppPhase),
    /// Geofence transition.
    Region(RegionEvent),
    /// The task store changed.
    TasksChanged,
    /// A task was completed.
    TaskCompleted,
    /// A bubble debounce delay elapsed.
    DebounceElapsed {
        /// Debounce generation it was armed with.
        generation: u64,
    },
    /// Time to expire stale discoveries.
    Sweep,
    /// Connect to an accessory at the user's request.
    Connect(AccessoryId),
    /// Stop ranging with an accessory.
    Stop(AccessoryId),
    /// Forget an accessory and disconnect it.
    Forget(AccessoryId),
    /// Stop the coordinator.
    Shutdown,
}

/// Sending half of the coordinator inbox.
#[derive(Debug, Clone)]
pub struct Mailbox {
    tx: mpsc::UnboundedSender<Event>,
}

impl Mailbox {
    /// Post an event. Returns `false` when the coordinator has exited.
    pub fn post(&self, event: Event) -> bool {
        match self.tx.send(event) {
            Ok(()) => true,
            Err(mpsc::error::SendError(event)) => {
                debug!(?event, "Coordinator gone, dropping event");
                false
            }
        }
    }

    /// Post an event after `delay`. Must be called within a tokio runtime.
    pub fn post_after(&self, delay: Duration, event: Event) {
        let mailbox = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            mailbox.post(event);
        });
    }

    /// Whether the coordinator has exited.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Create a coordinator inbox.
#[must_use]
pub fn mailbox() -> (Mailbox, mpsc::UnboundedReceiver<Event>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Mailbox { tx }, rx)
}

// ============================================================================
// Radio
// ============================================================================

/// Bluetooth central operations.
///
/// Calls only start the operation; outcomes arrive later as
/// [`RadioEvent`]s in the mailbox the radio was built with. Writes to one
/// peripheral must be delivered in call order.
pub trait Radio: Send + Sync {
    /// Scan for peripherals advertising the accessory service.
    ///
    /// # Errors
    ///
    /// Returns an error if scanning cannot be started.
    fn start_scan(&self) -> Result<()>;

    /// Connect and resolve the accessory characteristics.
    ///
    /// # Errors
    ///
    /// Returns an error if the peripheral is unknown to the radio.
    fn connect(&self, peripheral: &PeripheralId) -> Result<()>;

    /// Drop the connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the peripheral is unknown to the radio.
    fn disconnect(&self, peripheral: &PeripheralId) -> Result<()>;

    /// Subscribe to the outbound characteristic and read the sync
    /// characteristic once to trigger pairing.
    ///
    /// # Errors
    ///
    /// Returns an error if the peripheral is not connected.
    fn subscribe_and_sync(&self, peripheral: &PeripheralId) -> Result<()>;

    /// Write one frame to the inbound characteristic.
    ///
    /// # Errors
    ///
    /// Returns an error if the peripheral is not connected.
    fn write(&self, peripheral: &PeripheralId, frame: Vec<u8>) -> Result<()>;
}

// ============================================================================
// Coordinator
// ============================================================================

/// Collaborators injected into the coordinator.
pub struct CoordinatorDeps {
    /// Validated configuration.
    pub config: Config,
    /// Bluetooth central.
    pub radio: Arc<dyn Radio>,
    /// Ranging primitive.
    pub ranging: Arc<dyn RangingBackend>,
    /// Today's tasks.
    pub tasks: Arc<dyn TaskSource>,
    /// Shield service.
    pub enforcement: Arc<dyn EnforcementSink>,
    /// Persistent store.
    pub storage: Storage,
    /// Host background wake-ups.
    pub scheduler: Arc<dyn BackgroundScheduler>,
    /// Time source.
    pub clock: Arc<dyn Clock>,
}

/// Read-only access to coordinator state plus its mailbox.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    mailbox: Mailbox,
    bubble: watch::Receiver<BubbleState>,
    restriction: watch::Receiver<bool>,
    links: watch::Receiver<Vec<LinkSnapshot>>,
    known: watch::Receiver<Vec<AccessoryRecord>>,
    watchdog: watch::Receiver<WatchdogStatus>,
    authoritative: watch::Receiver<Option<AccessoryId>>,
}

impl EngineHandle {
    /// The coordinator inbox.
    #[must_use]
    pub fn mailbox(&self) -> Mailbox {
        self.mailbox.clone()
    }

    /// Post an event.
    ///
    /// # Errors
    ///
    /// Returns [`BubbleError::EngineStopped`] if the coordinator has exited.
    pub fn post(&self, event: Event) -> Result<()> {
        if self.mailbox.post(event) {
            Ok(())
        } else {
            Err(BubbleError::EngineStopped)
        }
    }

    /// Published bubble state.
    #[must_use]
    pub fn bubble(&self) -> watch::Receiver<BubbleState> {
        self.bubble.clone()
    }

    /// Restriction decision.
    #[must_use]
    pub fn restriction_active(&self) -> watch::Receiver<bool> {
        self.restriction.clone()
    }

    /// Every live link.
    #[must_use]
    pub fn links(&self) -> watch::Receiver<Vec<LinkSnapshot>> {
        self.links.clone()
    }

    /// Remembered accessories.
    #[must_use]
    pub fn known(&self) -> watch::Receiver<Vec<AccessoryRecord>> {
        self.known.clone()
    }

    /// Phase and background window.
    #[must_use]
    pub fn watchdog(&self) -> watch::Receiver<WatchdogStatus> {
        self.watchdog.clone()
    }

    /// Accessory whose distances drive the bubble.
    #[must_use]
    pub fn authoritative(&self) -> watch::Receiver<Option<AccessoryId>> {
        self.authoritative.clone()
    }
}

struct Publishers {
    bubble: watch::Sender<BubbleState>,
    links: watch::Sender<Vec<LinkSnapshot>>,
    known: watch::Sender<Vec<AccessoryRecord>>,
    watchdog: watch::Sender<WatchdogStatus>,
    authoritative: watch::Sender<Option<AccessoryId>>,
}

/// Single owner of all engine state.
pub struct Coordinator {
    mailbox: Mailbox,
    inbox: mpsc::UnboundedReceiver<Event>,
    radio: Arc<dyn Radio>,
    ranging: Arc<dyn RangingBackend>,
    scheduler: Arc<dyn BackgroundScheduler>,
    clock: Arc<dyn Clock>,
    registry: DeviceRegistry,
    classifier: PresenceClassifier,
    debounce: Debounce,
    /// Bubble state the policy acts on; moves only when a debounce settles.
    settled: BubbleState,
    debounce_delay: Duration,
    discovery_timeout: Duration,
    policy: RestrictionEngine,
    watchdog: Watchdog,
    authoritative: Option<AccessoryId>,
    next_token: u64,
    powered: bool,
    sweep_scheduled: bool,
    publish: Publishers,
}

impl Coordinator {
    /// Build the coordinator around an inbox created with [`mailbox`].
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the known
    /// accessories cannot be loaded.
    pub fn new(
        deps: CoordinatorDeps,
        (mailbox, inbox): (Mailbox, mpsc::UnboundedReceiver<Event>),
    ) -> Result<(Self, EngineHandle)> {
        let CoordinatorDeps {
            config,
            radio,
            ranging,
            tasks,
            enforcement,
            storage,
            scheduler,
            clock,
        } = deps;
        config.validate()?;

        let classifier = PresenceClassifier::from_config(&config.bubble)?;
        let known = KnownAccessories::load(storage.clone())?;
        let registry = DeviceRegistry::new(
            known,
            config.bluetooth.default_max_write_len,
            config.bluetooth.discovery_timeout(),
        );
        let policy = RestrictionEngine::new(
            tasks,
            enforcement,
            storage,
            config.policy.targets.clone(),
            config.system.tz(),
        );
        let watchdog = Watchdog::from_config(&config.policy);

        let settled = classifier.state();
        let (bubble_tx, bubble_rx) = watch::channel(settled);
        let (links_tx, links_rx) = watch::channel(Vec::new());
        let (known_tx, known_rx) = watch::channel(registry.known().records().to_vec());
        let (watchdog_tx, watchdog_rx) = watch::channel(watchdog.status());
        let (authoritative_tx, authoritative_rx) = watch::channel(None);

        let handle = EngineHandle {
            mailbox: mailbox.clone(),
            bubble: bubble_rx,
            restriction: policy.subscribe(),
            links: links_rx,
            known: known_rx,
            watchdog: watchdog_rx,
            authoritative: authoritative_rx,
        };

        let coordinator = Self {
            mailbox,
            inbox,
            radio,
            ranging,
            scheduler,
            clock,
            registry,
            classifier,
            debounce: Debounce::default(),
            settled,
            debounce_delay: config.bubble.debounce(),
            discovery_timeout: Duration::from_secs(config.bluetooth.discovery_timeout_secs),
            policy,
            watchdog,
            authoritative: None,
            next_token: 0,
            powered: false,
            sweep_scheduled: false,
            publish: Publishers {
                bubble: bubble_tx,
                links: links_tx,
                known: known_tx,
                watchdog: watchdog_tx,
                authoritative: authoritative_tx,
            },
        };
        Ok((coordinator, handle))
    }

    /// Process events until [`Event::Shutdown`].
    pub async fn run(mut self) {
        info!("Coordinator started");
        self.evaluate(Trigger::Startup);
        let actions = self.watchdog.start();
        self.execute_watchdog(actions);

        while let Some(event) = self.inbox.recv().await {
            if matches!(event, Event::Shutdown) {
                break;
            }
            self.handle(event);
        }

        self.shutdown();
        info!("Coordinator stopped");
    }

    /// Handle one event. Exposed for deterministic tests.
    pub fn handle(&mut self, event: Event) {
        match event {
            Event::Radio(radio) => self.on_radio(radio),
            Event::Ranging(ranging) => self.on_ranging(ranging),
            Event::Tick { kind, epoch } => {
                let actions = self.watchdog.on_tick(kind, epoch);
                self.execute_watchdog(actions);
            }
            Event::WindowExpired { epoch } => {
                let actions = self.watchdog.on_window_expired(epoch);
                self.execute_watchdog(actions);
            }
            Event::Lifecycle(phase) => {
                let actions = self.watchdog.set_phase(phase);
                self.execute_watchdog(actions);
            }
            Event::Region(RegionEvent::Entered) => {
                info!("Entered home region");
                self.reconnect_known();
            }
            Event::Region(RegionEvent::Exited) => info!("Left home region"),
            Event::TasksChanged => self.evaluate(Trigger::TasksChanged),
            Event::TaskCompleted => {
                let now = self.clock.now();
                if let Err(e) = self.policy.on_task_completed(now) {
                    warn!(error = %e, "Task completion re-check failed");
                }
            }
            Event::DebounceElapsed { generation } => {
                let settled = self.debounce.settle(generation, self.classifier.state());
                if let Some(state) = settled.filter(|state| *state != self.settled) {
                    self.settled = state;
                    let now = self.clock.now();
                    if let Err(e) = self.policy.on_bubble_settled(state, now) {
                        warn!(error = %e, "Evaluation after bubble transition failed");
                    }
                }
            }
            Event::Sweep => self.sweep(),
            Event::Connect(id) => self.drive(id, LinkEvent::ConnectRequested),
            Event::Stop(id) => self.drive(id, LinkEvent::StopRequested),
            Event::Forget(id) => self.forget(id),
            Event::Shutdown => self.shutdown(),
        }
        self.publish_links();
    }

    // ------------------------------------------------------------------------
    // Radio
    // ------------------------------------------------------------------------

    fn on_radio(&mut self, event: RadioEvent) {
        match event {
            RadioEvent::PoweredOn => {
                info!("Radio powered on");
                self.powered = true;
                self.reconnect_known();
            }
            RadioEvent::PoweredOff => {
                warn!("Radio powered off");
                self.powered = false;
                for id in self.registry.ids() {
                    self.drive(id, LinkEvent::Disconnected);
                }
            }
            RadioEvent::Discovered { peripheral, name } => {
                let now = self.clock.now();
                let id = match self.registry.on_discovered(peripheral, name, now) {
                    Ok(id) => id,
                    Err(e) => {
                        error!(error = %e, "Could not register discovered accessory");
                        return;
                    }
                };
                self.schedule_sweep();
                let idle = self
                    .registry
                    .slot(id)
                    .is_some_and(|slot| slot.link.state() == LinkState::Discovered);
                if self.powered && idle && self.registry.known().contains(id) {
                    info!(accessory = %id, "Known accessory visible, reconnecting");
                    self.drive(id, LinkEvent::ConnectRequested);
                }
            }
            RadioEvent::Connected {
                peripheral,
                max_write_len,
            } => self.drive_peripheral(&peripheral, LinkEvent::Connected { max_write_len }),
            RadioEvent::ConnectFailed { peripheral } => {
                self.drive_peripheral(&peripheral, LinkEvent::ConnectFailed);
            }
            RadioEvent::CharacteristicsResolved { peripheral } => {
                self.drive_peripheral(&peripheral, LinkEvent::CharacteristicsResolved);
            }
            RadioEvent::Value { peripheral, bytes } => {
                self.drive_peripheral(&peripheral, LinkEvent::Frame(bytes));
            }
            RadioEvent::Disconnected { peripheral } => {
                self.drive_peripheral(&peripheral, LinkEvent::Disconnected);
            }
        }
    }

    fn reconnect_known(&mut self) {
        if !self.powered {
            debug!("Radio off, not reconnecting");
            return;
        }
        for id in self.registry.reconnect_candidates() {
            self.drive(id, LinkEvent::ConnectRequested);
        }
        if let Err(e) = self.radio.start_scan() {
            warn!(error = %e, "Could not start scanning");
        } else if self.registry.has_unseen_known() {
            debug!("Scanning for known accessories that are not visible yet");
        }
    }

    fn schedule_sweep(&mut self) {
        if self.sweep_scheduled || !self.registry.has_unconnected() {
            return;
        }
        self.sweep_scheduled = true;
        self.mailbox
            .post_after(self.discovery_timeout + Duration::from_secs(1), Event::Sweep);
    }

    fn sweep(&mut self) {
        self.sweep_scheduled = false;
        let now = self.clock.now();
        let expired = self.registry.expire_stale(now);
        if !expired.is_empty() {
            debug!(count = expired.len(), "Expired stale discoveries");
        }
        self.schedule_sweep();
    }

    // ------------------------------------------------------------------------
    // Ranging
    // ------------------------------------------------------------------------

    fn on_ranging(&mut self, event: RangingEvent) {
        let id = event.accessory();
        let current = self.registry.slot(id).and_then(|slot| slot.session_token());
        if current != Some(event.token()) {
            debug!(accessory = %id, token = event.token().0, "Dropping callback from stale ranging session");
            return;
        }

        match event {
            RangingEvent::ShareableConfiguration { data, .. } => {
                self.drive(id, LinkEvent::ShareableConfiguration(data));
            }
            RangingEvent::Distance { sample, .. } => {
                if self.authoritative != Some(id) {
                    return;
                }
                if let Some(transition) = self.classifier.observe(&sample) {
                    self.bubble_moved(transition.to);
                }
            }
            RangingEvent::Invalidated { error, .. } => {
                warn!(accessory = %id, kind = ?error.kind, "Ranging session invalidated: {}", error.message);
                self.drive(id, LinkEvent::RangingFailed(error.kind));
            }
        }
    }

    // ------------------------------------------------------------------------
    // Link actions
    // ------------------------------------------------------------------------

    fn drive_peripheral(&mut self, peripheral: &PeripheralId, event: LinkEvent) {
        match self.registry.id_for(peripheral) {
            Some(id) => self.drive(id, event),
            None => debug!(%peripheral, ?event, "Event for unknown peripheral"),
        }
    }

    fn drive(&mut self, id: AccessoryId, event: LinkEvent) {
        let now = self.clock.now();
        let mut queue = VecDeque::from([event]);
        while let Some(event) = queue.pop_front() {
            let Some(slot) = self.registry.slot_mut(id) else {
                debug!(accessory = %id, ?event, "Event for unknown accessory");
                return;
            };
            let peripheral = slot.link.peripheral().clone();
            let actions = slot.link.handle(event, now);
            for action in actions {
                if let Some(follow_up) = self.execute(id, &peripheral, action) {
                    queue.push_back(follow_up);
                }
            }
        }
    }

    /// Perform one link action, returning a follow-up event for the link when
    /// the action failed synchronously.
    fn execute(
        &mut self,
        id: AccessoryId,
        peripheral: &PeripheralId,
        action: LinkAction,
    ) -> Option<LinkEvent> {
        match action {
            LinkAction::Connect => {
                if let Err(e) = self.radio.connect(peripheral) {
                    warn!(accessory = %id, error = %e, "Connect failed");
                    return Some(LinkEvent::ConnectFailed);
                }
            }
            LinkAction::SubscribeAndSync => {
                if let Err(e) = self.radio.subscribe_and_sync(peripheral) {
                    warn!(accessory = %id, error = %e, "Subscribe failed, dropping connection");
                    if let Err(e) = self.radio.disconnect(peripheral) {
                        debug!(accessory = %id, error = %e, "Disconnect after failed subscribe failed");
                    }
                    return Some(LinkEvent::Disconnected);
                }
            }
            LinkAction::Write(frame) => {
                if let Err(e) = self.radio.write(peripheral, frame) {
                    warn!(accessory = %id, error = %e, "Write failed");
                }
            }
            LinkAction::StartRanging(config) => {
                self.next_token += 1;
                let token = SessionToken(self.next_token);
                match self.ranging.start(id, token, &config, self.mailbox.clone()) {
                    Ok(session) => {
                        if let Some(slot) = self.registry.slot_mut(id) {
                            slot.attach_session(token, session);
                        }
                        info!(accessory = %id, token = token.0, "Ranging session started");
                    }
                    Err(e) => {
                        warn!(accessory = %id, kind = ?e.kind, "Could not start ranging session: {}", e.message);
                        return Some(LinkEvent::RangingFailed(e.kind));
                    }
                }
            }
            LinkAction::InvalidateRanging => {
                if let Some(slot) = self.registry.slot_mut(id) {
                    slot.invalidate_session();
                }
            }
            LinkAction::Paired => {
                let now = self.clock.now();
                match self.registry.remember_paired(id, now) {
                    Ok(_) => {
                        self.publish
                            .known
                            .send_replace(self.registry.known().records().to_vec());
                    }
                    Err(e) => error!(accessory = %id, error = %e, "Could not remember accessory"),
                }
            }
            LinkAction::RangingStarted => {
                if self.authoritative.is_none() {
                    self.set_authoritative(Some(id));
                }
            }
            LinkAction::RangingStopped => {
                if self.authoritative == Some(id) {
                    let next = self.registry.ids().into_iter().find(|other| {
                        *other != id
                            && self
                                .registry
                                .slot(*other)
                                .is_some_and(|slot| slot.link.state() == LinkState::Ranging)
                    });
                    if next.is_some() {
                        self.classifier.reset_history();
                    } else if self.classifier.reset() {
                        self.bubble_moved(BubbleState::Outside);
                    }
                    self.set_authoritative(next);
                }
            }
            LinkAction::RangingError(kind) => {
                if let Some(slot) = self.registry.slot_mut(id) {
                    slot.invalidate_session();
                }
                if kind.is_user_actionable() {
                    warn!(accessory = %id, "Ranging needs a fresh permission grant");
                }
            }
        }
        None
    }

    /// Publish a new bubble state and arm the debounce in front of the policy.
    fn bubble_moved(&mut self, state: BubbleState) {
        self.publish.bubble.send_replace(state);
        let generation = self.debounce.arm(state);
        self.mailbox
            .post_after(self.debounce_delay, Event::DebounceElapsed { generation });
    }

    fn set_authoritative(&mut self, id: Option<AccessoryId>) {
        if self.authoritative == id {
            return;
        }
        self.authoritative = id;
        match id {
            Some(id) => info!(accessory = %id, "Accessory is now authoritative for the bubble"),
            None => info!("No accessory is ranging"),
        }
        self.publish.authoritative.send_replace(id);
    }

    fn forget(&mut self, id: AccessoryId) {
        let peripheral = self
            .registry
            .slot(id)
            .map(|slot| slot.link.peripheral().clone());
        if let Some(peripheral) = &peripheral {
            self.drive(id, LinkEvent::StopRequested);
            if let Err(e) = self.radio.disconnect(peripheral) {
                debug!(accessory = %id, error = %e, "Disconnect on forget failed");
            }
            self.drive(id, LinkEvent::Disconnected);
        }
        match self.registry.forget(id) {
            Ok(true) => {
                info!(accessory = %id, "Forgot accessory");
                self.publish
                    .known
                    .send_replace(self.registry.known().records().to_vec());
            }
            Ok(false) => debug!(accessory = %id, "Nothing to forget"),
            Err(e) => error!(accessory = %id, error = %e, "Could not forget accessory"),
        }
    }

    // ------------------------------------------------------------------------
    // Policy and watchdog
    // ------------------------------------------------------------------------

    fn evaluate(&mut self, trigger: Trigger) {
        let now = self.clock.now();
        if let Err(e) = self.policy.evaluate(self.settled, now, trigger) {
            warn!(?trigger, error = %e, "Restriction evaluation failed");
        }
    }

    fn execute_watchdog(&mut self, actions: Vec<WatchdogAction>) {
        for action in actions {
            match action {
                WatchdogAction::Evaluate(kind) => {
                    self.evaluate(match kind {
                        TickKind::Foreground => Trigger::ForegroundTick,
                        TickKind::Background => Trigger::BackgroundTick,
                    });
                }
                WatchdogAction::ScheduleTick { kind, epoch, after } => {
                    self.mailbox.post_after(after, Event::Tick { kind, epoch });
                }
                WatchdogAction::ScheduleWindowExpiry { epoch, after } => {
                    self.mailbox.post_after(after, Event::WindowExpired { epoch });
                }
                WatchdogAction::RequestFollowUp { epoch, after } => {
                    self.scheduler.request_follow_up(after, epoch);
                }
            }
        }
        self.publish.watchdog.send_replace(self.watchdog.status());
    }

    fn publish_links(&self) {
        let snapshots = self.registry.snapshots();
        self.publish.links.send_if_modified(|current| {
            if *current == snapshots {
                false
            } else {
                *current = snapshots;
                true
            }
        });
    }

    fn shutdown(&mut self) {
        for id in self.registry.ids() {
            let ranging = self
                .registry
                .slot(id)
                .is_some_and(|slot| slot.link.ranging_active() || slot.link.state() == LinkState::Ranging);
            if ranging {
                self.drive(id, LinkEvent::StopRequested);
            }
        }
        let now = self.clock.now();
        self.policy.flush(now);
        self.publish_links();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enforcement::{FileEnforcement, RestrictionTargets};
    use crate::mock::{FirmwareBehavior, SimulatedAccessory};
    use crate::ranging::ChannelRanging;
    use crate::scheduler::TokioBackgroundScheduler;
    use crate::storage::SessionKind;
    use crate::tasks::{InMemoryTaskSource, Task};
    use crate::types::ManualClock;
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    struct Harness {
        _dir: TempDir,
        coordinator: Coordinator,
        handle: EngineHandle,
        accessory: SimulatedAccessory,
        tags: Vec<SimulatedAccessory>,
        ranging: ChannelRanging,
        tasks: Arc<InMemoryTaskSource>,
        enforcement: FileEnforcement,
        storage: Storage,
        clock: ManualClock,
    }

    /// Radio in front of several simulated accessories.
    struct Fleet(Vec<SimulatedAccessory>);

    impl Fleet {
        fn tag(&self, peripheral: &PeripheralId) -> Result<&SimulatedAccessory> {
            self.0
                .iter()
                .find(|tag| tag.peripheral() == peripheral)
                .ok_or_else(|| BubbleError::DeviceNotFound(peripheral.to_string()))
        }
    }

    impl Radio for Fleet {
        fn start_scan(&self) -> Result<()> {
            self.0.iter().try_for_each(|tag| tag.start_scan())
        }

        fn connect(&self, peripheral: &PeripheralId) -> Result<()> {
            self.tag(peripheral)?.connect(peripheral)
        }

        fn disconnect(&self, peripheral: &PeripheralId) -> Result<()> {
            self.tag(peripheral)?.disconnect(peripheral)
        }

        fn subscribe_and_sync(&self, peripheral: &PeripheralId) -> Result<()> {
            self.tag(peripheral)?.subscribe_and_sync(peripheral)
        }

        fn write(&self, peripheral: &PeripheralId, frame: Vec<u8>) -> Result<()> {
            self.tag(peripheral)?.write(peripheral, frame)
        }
    }

    fn peripheral(index: usize) -> PeripheralId {
        PeripheralId::new(format!("AA:BB:CC:DD:EE:{:02X}", index + 1))
    }

    fn harness(behavior: FirmwareBehavior) -> Harness {
        build(vec![behavior], &[])
    }

    /// One simulated accessory per behavior; `known` seeds remembered
    /// accessories as (tag index, unique id) before the coordinator loads them.
    fn build(behaviors: Vec<FirmwareBehavior>, known: &[(usize, u32)]) -> Harness {
        let dir = TempDir::new().unwrap();
        let (mailbox, inbox) = mailbox();
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2025, 5, 5, 9, 0, 0).unwrap());
        let tags: Vec<_> = behaviors
            .into_iter()
            .enumerate()
            .map(|(index, behavior)| {
                SimulatedAccessory::new(
                    peripheral(index),
                    format!("Desk Tag {}", index + 1),
                    behavior,
                    mailbox.clone(),
                )
            })
            .collect();
        let ranging = ChannelRanging::new();
        let tasks = Arc::new(InMemoryTaskSource::new(
            vec![Task {
                id: "focus".to_string(),
                is_completed: false,
                has_explicit_time: false,
                due: clock.now(),
            }],
            chrono_tz::UTC,
        ));
        let enforcement = FileEnforcement::new(dir.path().join("shield.json"));
        let storage = Storage::new(dir.path().join("data"));

        let mut remembered = KnownAccessories::load(storage.clone()).unwrap();
        for &(index, unique_id) in known {
            remembered
                .remember(peripheral(index), AccessoryId(unique_id), None, clock.now())
                .unwrap();
        }

        let mut config = Config::default();
        config.policy.targets = RestrictionTargets {
            apps: vec!["com.example.video".to_string()],
            ..RestrictionTargets::default()
        };

        let deps = CoordinatorDeps {
            config,
            radio: Arc::new(Fleet(tags.clone())),
            ranging: Arc::new(ranging.clone()),
            tasks: tasks.clone(),
            enforcement: Arc::new(enforcement.clone()),
            storage: storage.clone(),
            scheduler: Arc::new(TokioBackgroundScheduler::new(mailbox.clone())),
            clock: Arc::new(clock.clone()),
        };
        let (coordinator, handle) = Coordinator::new(deps, (mailbox, inbox)).unwrap();
        Harness {
            _dir: dir,
            coordinator,
            handle,
            accessory: tags[0].clone(),
            tags,
            ranging,
            tasks,
            enforcement,
            storage,
            clock,
        }
    }

    impl Harness {
        /// Handle everything currently queued, including events the handlers post.
        fn pump(&mut self) {
            while let Ok(event) = self.coordinator.inbox.try_recv() {
                self.coordinator.handle(event);
            }
        }

        fn link_state(&self) -> Option<LinkState> {
            self.handle.links().borrow().first().map(|l| l.state)
        }

        fn accessory_id(&self) -> AccessoryId {
            self.handle.links().borrow()[0].accessory
        }

        fn id_of(&self, tag: usize) -> AccessoryId {
            self.coordinator.registry.id_for(self.tags[tag].peripheral()).unwrap()
        }

        fn pair(&mut self) -> AccessoryId {
            self.coordinator.handle(Event::Radio(RadioEvent::PoweredOn));
            self.pump();
            let id = self.accessory_id();
            self.coordinator.handle(Event::Connect(id));
            self.pump();
            id
        }
    }

    #[tokio::test]
    async fn test_full_handshake_reaches_ranging() {
        let mut h = harness(FirmwareBehavior::default());
        let id = h.pair();

        assert_eq!(h.link_state(), Some(LinkState::Ranging));
        assert!(h.ranging.feed().is_active(id));
        assert_eq!(*h.handle.authoritative().borrow(), Some(id));
        assert_eq!(h.handle.known().borrow().len(), 1);
        assert_eq!(
            h.accessory.received(),
            vec![vec![0x0A], {
                let mut frame = vec![0x0B];
                frame.extend(FirmwareBehavior::default().uwb_config);
                frame
            }]
        );
    }

    #[tokio::test]
    async fn test_corrupt_configuration_keeps_link_connected() {
        let mut h = harness(FirmwareBehavior {
            corrupt_configuration: true,
            ..FirmwareBehavior::default()
        });
        let id = h.pair();

        assert_eq!(h.link_state(), Some(LinkState::Connected));
        assert!(!h.ranging.feed().is_active(id));
        assert_eq!(*h.handle.authoritative().borrow(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_distance_drives_bubble_and_restriction_after_debounce() {
        let mut h = harness(FirmwareBehavior::default());
        let id = h.pair();

        assert!(h.ranging.feed().push_distance(id, 0.1));
        h.pump();
        assert_eq!(*h.handle.bubble().borrow(), BubbleState::Inside);
        assert!(!*h.handle.restriction_active().borrow());

        tokio::time::sleep(Duration::from_millis(2_100)).await;
        h.pump();
        assert!(*h.handle.restriction_active().borrow());
        assert!(h.enforcement.current().unwrap().unwrap().active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reverted_transition_is_not_acted_on() {
        let mut h = harness(FirmwareBehavior::default());
        let id = h.pair();

        h.ranging.feed().push_distance(id, 0.1);
        h.pump();
        tokio::time::sleep(Duration::from_millis(500)).await;
        h.ranging.feed().push_distance(id, 2.0);
        h.pump();

        tokio::time::sleep(Duration::from_millis(2_100)).await;
        h.pump();
        assert_eq!(*h.handle.bubble().borrow(), BubbleState::Outside);
        assert!(!*h.handle.restriction_active().borrow());
        assert!(h.enforcement.current().unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_completing_tasks_disables_and_logs() {
        let mut h = harness(FirmwareBehavior::default());
        let id = h.pair();
        h.ranging.feed().push_distance(id, 0.1);
        h.pump();
        tokio::time::sleep(Duration::from_millis(2_100)).await;
        h.pump();
        assert!(*h.handle.restriction_active().borrow());

        h.clock.advance(chrono::Duration::minutes(25));
        h.tasks.complete("focus");
        h.coordinator.handle(Event::TaskCompleted);

        assert!(!*h.handle.restriction_active().borrow());
        let sessions = h.storage.load_sessions(SessionKind::Restriction).unwrap();
        assert_eq!(sessions.len(), 1);
        assert!((sessions[0].duration_seconds - 25.0 * 60.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_disconnect_drops_session_and_stale_distances() {
        let mut h = harness(FirmwareBehavior::default());
        let id = h.pair();
        let token = h.coordinator.registry.slot(id).unwrap().session_token().unwrap();

        h.accessory.drop_connection();
        h.pump();
        assert_eq!(h.link_state(), Some(LinkState::Discovered));
        assert!(!h.ranging.feed().is_active(id));
        assert_eq!(*h.handle.authoritative().borrow(), None);

        // A callback raced with the disconnect and lands afterwards.
        h.coordinator.handle(Event::Ranging(RangingEvent::Distance {
            token,
            sample: crate::types::DistanceSample {
                accessory: id,
                distance_m: 0.05,
                timestamp: Utc::now(),
            },
        }));
        assert_eq!(*h.handle.bubble().borrow(), BubbleState::Outside);
    }

    #[tokio::test]
    async fn test_stop_sends_stop_frame_before_invalidating() {
        let mut h = harness(FirmwareBehavior::default());
        let id = h.pair();
        h.coordinator.handle(Event::Stop(id));
        h.pump();

        assert_eq!(h.accessory.received().last(), Some(&vec![0x0C]));
        assert!(!h.ranging.feed().is_active(id));
        assert_eq!(h.link_state(), Some(LinkState::Paired));
    }

    #[tokio::test]
    async fn test_known_accessory_reconnects_on_power_on() {
        let mut h = harness(FirmwareBehavior::default());
        let id = h.pair();
        h.coordinator.handle(Event::Radio(RadioEvent::PoweredOff));
        h.pump();
        assert_eq!(h.link_state(), Some(LinkState::Discovered));

        h.coordinator.handle(Event::Radio(RadioEvent::PoweredOn));
        h.pump();
        assert_eq!(h.link_state(), Some(LinkState::Ranging));
        assert_eq!(h.accessory_id(), id);
    }

    #[tokio::test]
    async fn test_permission_denied_surfaces_on_link() {
        let mut h = harness(FirmwareBehavior::default());
        h.ranging.feed().deny_permission(crate::ranging::RangingError::new(
            crate::ranging::RangingErrorKind::PermissionDenied,
            "not granted",
        ));
        h.pair();

        let links = h.handle.links().borrow().clone();
        assert_eq!(links[0].state, LinkState::Paired);
        assert_eq!(
            links[0].last_ranging_error,
            Some(crate::ranging::RangingErrorKind::PermissionDenied)
        );
    }

    #[tokio::test]
    async fn test_forget_disconnects_and_removes_record() {
        let mut h = harness(FirmwareBehavior::default());
        let id = h.pair();
        h.coordinator.handle(Event::Forget(id));
        h.pump();

        assert!(h.handle.known().borrow().is_empty());
        assert!(h.handle.links().borrow().is_empty());
        assert!(!h.ranging.feed().is_active(id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_until_shutdown() {
        let h = harness(FirmwareBehavior::default());
        let handle = h.handle.clone();
        let task = tokio::spawn(h.coordinator.run());

        handle.post(Event::Lifecycle(AppPhase::Background)).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(handle.watchdog().borrow().phase, AppPhase::Background);

        handle.post(Event::Shutdown).unwrap();
        task.await.unwrap();
        assert!(handle.post(Event::TasksChanged).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_triggers_inside_debounce_window_use_settled_state() {
        let mut h = harness(FirmwareBehavior::default());
        let id = h.pair();

        h.ranging.feed().push_distance(id, 0.1);
        h.pump();
        h.coordinator.handle(Event::TasksChanged);
        assert_eq!(*h.handle.bubble().borrow(), BubbleState::Inside);
        assert!(!*h.handle.restriction_active().borrow());

        tokio::time::sleep(Duration::from_millis(300)).await;
        h.ranging.feed().push_distance(id, 2.0);
        h.pump();
        h.coordinator.handle(Event::TasksChanged);

        tokio::time::sleep(Duration::from_millis(2_500)).await;
        h.pump();
        assert!(!*h.handle.restriction_active().borrow());
        assert!(h.enforcement.current().unwrap().is_none());
        assert!(h.storage.load_sessions(SessionKind::Restriction).unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_after_debounce_restricts() {
        let mut h = harness(FirmwareBehavior::default());
        let id = h.pair();
        h.ranging.feed().push_distance(id, 0.1);
        h.pump();
        tokio::time::sleep(Duration::from_millis(2_100)).await;
        h.pump();

        h.coordinator.handle(Event::TasksChanged);
        assert!(*h.handle.restriction_active().borrow());
    }

    #[tokio::test]
    async fn test_first_ranging_accessory_is_authoritative_until_it_stops() {
        let mut h = build(vec![FirmwareBehavior::default(); 2], &[]);
        h.coordinator.handle(Event::Radio(RadioEvent::PoweredOn));
        h.pump();
        let (first, second) = (h.id_of(0), h.id_of(1));

        h.coordinator.handle(Event::Connect(first));
        h.pump();
        h.coordinator.handle(Event::Connect(second));
        h.pump();
        assert!(h.ranging.feed().is_active(first));
        assert!(h.ranging.feed().is_active(second));
        assert_eq!(*h.handle.authoritative().borrow(), Some(first));

        h.ranging.feed().push_distance(second, 0.1);
        h.pump();
        assert_eq!(*h.handle.bubble().borrow(), BubbleState::Outside);

        h.ranging.feed().push_distance(first, 0.1);
        h.pump();
        assert_eq!(*h.handle.bubble().borrow(), BubbleState::Inside);

        h.coordinator.handle(Event::Stop(first));
        h.pump();
        assert_eq!(*h.handle.authoritative().borrow(), Some(second));
        assert!(!h.ranging.feed().push_distance(first, 2.0));
        assert_eq!(*h.handle.bubble().borrow(), BubbleState::Inside);

        h.ranging.feed().push_distance(second, 2.0);
        h.pump();
        assert_eq!(*h.handle.bubble().borrow(), BubbleState::Outside);
    }

    #[tokio::test(start_paused = true)]
    async fn test_losing_last_ranging_link_falls_back_outside() {
        let mut h = harness(FirmwareBehavior::default());
        let id = h.pair();
        h.ranging.feed().push_distance(id, 0.1);
        h.pump();
        tokio::time::sleep(Duration::from_millis(2_100)).await;
        h.pump();
        assert!(*h.handle.restriction_active().borrow());

        h.clock.advance(chrono::Duration::minutes(10));
        h.accessory.drop_connection();
        h.pump();
        assert_eq!(*h.handle.bubble().borrow(), BubbleState::Outside);
        assert_eq!(*h.handle.authoritative().borrow(), None);

        tokio::time::sleep(Duration::from_millis(2_100)).await;
        h.pump();
        assert!(!*h.handle.restriction_active().borrow());
        let sessions = h.storage.load_sessions(SessionKind::Restriction).unwrap();
        assert_eq!(sessions.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_connected_link_expires_after_discovery_timeout() {
        let mut h = harness(FirmwareBehavior::default());
        h.coordinator.handle(Event::Radio(RadioEvent::PoweredOn));
        h.pump();
        assert_eq!(h.link_state(), Some(LinkState::Discovered));

        h.clock.advance(chrono::Duration::seconds(7));
        tokio::time::sleep(Duration::from_secs(7)).await;
        h.pump();
        assert!(h.handle.links().borrow().is_empty());
        assert!(h.coordinator.registry.id_for(h.accessory.peripheral()).is_none());
    }

    #[tokio::test]
    async fn test_failed_subscribe_drops_connection() {
        let mut h = harness(FirmwareBehavior {
            reject_subscriptions: true,
            ..FirmwareBehavior::default()
        });
        let id = h.pair();

        assert_eq!(h.link_state(), Some(LinkState::Discovered));
        assert!(!h.accessory.is_connected());
        assert!(!h.ranging.feed().is_active(id));
        assert!(h.accessory.received().is_empty());
    }

    #[tokio::test]
    async fn test_connect_retries_abandoned_pairing() {
        let mut h = harness(FirmwareBehavior {
            corrupt_configuration: true,
            ..FirmwareBehavior::default()
        });
        let id = h.pair();
        assert_eq!(h.link_state(), Some(LinkState::Connected));

        h.coordinator.handle(Event::Connect(id));
        h.pump();
        let initializes = h.accessory.received().iter().filter(|f| *f == &vec![0x0A]).count();
        assert_eq!(initializes, 2);
        assert_eq!(h.link_state(), Some(LinkState::Connected));
        assert_eq!(h.accessory.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_unseen_known_accessory_is_scanned_for_then_connected() {
        let mut h = build(vec![FirmwareBehavior::default()], &[(0, 7)]);

        h.coordinator.handle(Event::Radio(RadioEvent::PoweredOn));
        assert_eq!(h.accessory.scan_count(), 1);
        assert_eq!(h.accessory.connect_count(), 0);
        assert!(h.handle.links().borrow().is_empty());

        h.pump();
        assert_eq!(h.accessory.connect_count(), 1);
        assert_eq!(h.accessory_id(), AccessoryId(7));
        assert_eq!(h.link_state(), Some(LinkState::Ranging));
    }
}
