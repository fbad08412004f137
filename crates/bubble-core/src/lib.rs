//! # bubble-core
//!
//! Core logic for the bubble proximity access-control engine.
//!
//! This crate provides:
//! - The BLE accessory protocol and per-accessory link state machine
//! - Ranging sessions that turn an accessory configuration into distances
//! - The hysteresis "secure bubble" presence classifier
//! - The restriction policy engine with its session logs
//! - A device registry for unattended reconnection
//! - A watchdog for periodic and background re-evaluation
//!
//! ## Architecture
//!
//! All mutable state is owned by a single [`engine::Coordinator`] task. Radio
//! callbacks, ranging callbacks, timers and API requests are posted into its
//! mailbox as [`engine::Event`]s and processed one at a time; results are
//! published on `watch` channels through an [`engine::EngineHandle`].
//!
//! - [`protocol`] - Wire format of accessory and app messages
//! - [`link`] - Per-accessory connection and handshake state machine
//! - [`ranging`] - Ranging session abstraction and a channel-fed backend
//! - [`bubble`] - Presence classifier and debounce gate
//! - [`policy`] - Restriction decision, enforcement and session logging
//! - [`registry`] - Known accessories and live links
//! - [`scheduler`] - Foreground ticks and background execution windows
//! - [`engine`] - The coordinator actor
//! - [`bluetooth`] - BlueZ radio (feature `bluetooth`)
//! - [`config`] - Configuration loading, saving, and validation
//! - [`storage`] - Persistent JSON stores
//! - [`tasks`] / [`enforcement`] - External collaborator interfaces
//! - [`error`] - Unified error types for the crate
//! - [`types`] - Shared identifiers, samples and clocks

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![warn(missing_docs)]

pub mod bluetooth;
pub mod bubble;
pub mod config;
pub mod enforcement;
pub mod engine;
pub mod error;
pub mod link;
#[cfg(any(test, feature = "mock-bluetooth", not(feature = "bluetooth")))]
pub mod mock;
pub mod policy;
pub mod protocol;
pub mod ranging;
pub mod registry;
pub mod scheduler;
pub mod storage;
pub mod tasks;
pub mod types;

// Re-export primary types for convenience
#[cfg(feature = "bluetooth")]
pub use bluetooth::BluerRadio;
pub use bluetooth::{BluetoothError, BluetoothResult};
pub use bubble::{BubbleState, BubbleTransition, Debounce, PresenceClassifier};
pub use config::{
    is_valid_adapter_name, BluetoothConfig, BubbleConfig, Config, ConfigError, ConfigResult,
    PolicyConfig, StorageConfig, SystemConfig,
};
pub use enforcement::{EnforcementSink, FileEnforcement, RestrictionTargets, ShieldState};
pub use engine::{
    mailbox, Coordinator, CoordinatorDeps, EngineHandle, Event, Mailbox, Radio, RadioEvent,
    RegionEvent,
};
pub use error::{BubbleError, Error, Result};
pub use link::{AccessoryLink, LinkAction, LinkEvent, LinkSnapshot, LinkState};
#[cfg(any(test, feature = "mock-bluetooth", not(feature = "bluetooth")))]
pub use mock::{FirmwareBehavior, SimulatedAccessory};
pub use policy::{should_restrict, DecisionChange, RestrictionEngine, Trigger};
pub use protocol::{AccessoryConfiguration, AccessoryMessage, AppMessage, ProtocolError};
pub use ranging::{
    probe_permission, ChannelRanging, RangingBackend, RangingError, RangingErrorKind,
    RangingEvent, RangingFeed, RangingSession, SessionToken,
};
pub use registry::{AccessoryRecord, DeviceRegistry, KnownAccessories, MAX_KNOWN_ACCESSORIES};
pub use scheduler::{
    AppPhase, BackgroundScheduler, TickKind, TokioBackgroundScheduler, Watchdog, WatchdogAction,
    WatchdogStatus,
};
pub use storage::{default_data_dir, DailySnapshot, SessionKind, SessionLogEntry, Storage};
pub use tasks::{InMemoryTaskSource, JsonTaskSource, Task, TaskSource};
pub use types::{AccessoryId, Clock, DistanceSample, HealthResponse, ManualClock, PeripheralId, SystemClock};
