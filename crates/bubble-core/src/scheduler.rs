//! Re-evaluation timers and the background execution window.
//!
//! The [`Watchdog`] is driven by the coordinator like the link state machine:
//! it receives phase changes and timer expiries and answers with
//! [`WatchdogAction`]s. Every phase change starts a new epoch so timers armed
//! in an earlier phase are recognised as stale when they fire.
//!
//! In the foreground it ticks every minute. On moving to the background it
//! evaluates once, keeps a short execution window open, and when the window
//! closes asks the host [`BackgroundScheduler`] for a follow-up wake-up about
//! five minutes later. Each follow-up opens a new window.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use utoipa::ToSchema;

use crate::config::PolicyConfig;
use crate::engine::{Event, Mailbox};

/// Whether the host application is in front of the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AppPhase {
    /// Active; the foreground timer runs.
    #[default]
    Foreground,
    /// Suspended; work happens in short execution windows.
    Background,
}

/// Which timer produced a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TickKind {
    /// The periodic foreground timer.
    Foreground,
    /// A background wake-up.
    Background,
}

/// Side effects requested by the watchdog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogAction {
    /// Re-evaluate the restriction decision now.
    Evaluate(TickKind),
    /// Post a tick after `after`.
    ScheduleTick {
        /// Timer kind.
        kind: TickKind,
        /// Epoch the timer belongs to.
        epoch: u64,
        /// Delay.
        after: Duration,
    },
    /// Close the background window after `after`.
    ScheduleWindowExpiry {
        /// Epoch the window belongs to.
        epoch: u64,
        /// Delay.
        after: Duration,
    },
    /// Ask the host for a background wake-up after `after`.
    RequestFollowUp {
        /// Epoch the wake-up belongs to.
        epoch: u64,
        /// Earliest delay.
        after: Duration,
    },
}

/// Observer view of the watchdog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
pub struct WatchdogStatus {
    /// Current application phase.
    pub phase: AppPhase,
    /// Whether background work is currently allowed.
    pub window_open: bool,
}

/// Host hook for background wake-ups. Requests are fire-and-forget; the host
/// may never honour them.
pub trait BackgroundScheduler: Send + Sync {
    /// Request a wake-up no earlier than `after`, delivered as
    /// [`Event::Tick`] with [`TickKind::Background`] and the given epoch.
    fn request_follow_up(&self, after: Duration, epoch: u64);
}

/// Background scheduler backed by tokio timers.
#[derive(Debug, Clone)]
pub struct TokioBackgroundScheduler {
    mailbox: Mailbox,
}

impl TokioBackgroundScheduler {
    /// Deliver wake-ups into `mailbox`.
    #[must_use]
    pub const fn new(mailbox: Mailbox) -> Self {
        Self { mailbox }
    }
}

impl BackgroundScheduler for TokioBackgroundScheduler {
    fn request_follow_up(&self, after: Duration, epoch: u64) {
        debug!(?after, epoch, "Scheduling background follow-up");
        self.mailbox.post_after(
            after,
            Event::Tick {
                kind: TickKind::Background,
                epoch,
            },
        );
    }
}

/// Timer policy for re-evaluating the restriction decision.
#[derive(Debug, Clone)]
pub struct Watchdog {
    foreground_period: Duration,
    background_period: Duration,
    window: Duration,
    phase: AppPhase,
    epoch: u64,
    window_open: bool,
}

impl Watchdog {
    /// Create a watchdog in the foreground phase.
    #[must_use]
    pub const fn new(foreground_period: Duration, background_period: Duration, window: Duration) -> Self {
        Self {
            foreground_period,
            background_period,
            window,
            phase: AppPhase::Foreground,
            epoch: 0,
            window_open: true,
        }
    }

    /// Build from the policy section.
    #[must_use]
    pub const fn from_config(config: &PolicyConfig) -> Self {
        Self::new(
            Duration::from_secs(config.foreground_tick_secs),
            Duration::from_secs(config.background_tick_secs),
            Duration::from_secs(config.background_window_secs),
        )
    }

    /// Current phase.
    #[must_use]
    pub const fn phase(&self) -> AppPhase {
        self.phase
    }

    /// Current epoch.
    #[must_use]
    pub const fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Tick period of the current phase.
    #[must_use]
    pub const fn period(&self) -> Duration {
        match self.phase {
            AppPhase::Foreground => self.foreground_period,
            AppPhase::Background => self.background_period,
        }
    }

    /// Whether work is currently allowed.
    #[must_use]
    pub const fn window_open(&self) -> bool {
        self.window_open
    }

    /// Observer view.
    #[must_use]
    pub const fn status(&self) -> WatchdogStatus {
        WatchdogStatus {
            phase: self.phase,
            window_open: self.window_open,
        }
    }

    /// Arm the first foreground timer.
    #[must_use]
    pub fn start(&self) -> Vec<WatchdogAction> {
        vec![self.schedule_foreground()]
    }

    /// Switch phase.
    pub fn set_phase(&mut self, phase: AppPhase) -> Vec<WatchdogAction> {
        if phase == self.phase {
            return Vec::new();
        }
        self.phase = phase;
        self.epoch = self.epoch.wrapping_add(1);
        info!(?phase, epoch = self.epoch, "Application phase changed");

        match phase {
            AppPhase::Foreground => {
                self.window_open = true;
                vec![
                    WatchdogAction::Evaluate(TickKind::Foreground),
                    self.schedule_foreground(),
                ]
            }
            AppPhase::Background => self.open_window(),
        }
    }

    /// A tick fired.
    pub fn on_tick(&mut self, kind: TickKind, epoch: u64) -> Vec<WatchdogAction> {
        if epoch != self.epoch {
            debug!(?kind, epoch, current = self.epoch, "Dropping stale tick");
            return Vec::new();
        }
        match (kind, self.phase) {
            (TickKind::Foreground, AppPhase::Foreground) => vec![
                WatchdogAction::Evaluate(TickKind::Foreground),
                self.schedule_foreground(),
            ],
            (TickKind::Background, AppPhase::Background) => self.open_window(),
            _ => Vec::new(),
        }
    }

    /// The background window elapsed.
    pub fn on_window_expired(&mut self, epoch: u64) -> Vec<WatchdogAction> {
        if epoch != self.epoch || self.phase != AppPhase::Background || !self.window_open {
            return Vec::new();
        }
        self.window_open = false;
        info!("Background execution window expired, requesting follow-up");
        vec![WatchdogAction::RequestFollowUp {
            epoch: self.epoch,
            after: self.background_period,
        }]
    }

    fn open_window(&mut self) -> Vec<WatchdogAction> {
        self.window_open = true;
        vec![
            WatchdogAction::Evaluate(TickKind::Background),
            WatchdogAction::ScheduleWindowExpiry {
                epoch: self.epoch,
                after: self.window,
            },
        ]
    }

    const fn schedule_foreground(&self) -> WatchdogAction {
        WatchdogAction::ScheduleTick {
            kind: TickKind::Foreground,
            epoch: self.epoch,
            after: self.foreground_period,
        }
    }
}
