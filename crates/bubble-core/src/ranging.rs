//! Precise-distance ranging sessions.
//!
//! A ranging session is created when an accessory delivers its
//! configuration. It answers with one shareable configuration (forwarded to the
//! accessory in `configureAndStart`) and then a continuous stream of distances.
//! The platform primitive behind it is abstracted by [`RangingBackend`]; every
//! callback is posted into the coordinator [`Mailbox`] tagged with a
//! [`SessionToken`] so that late callbacks from a destroyed session are
//! recognised and dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use utoipa::ToSchema;

use crate::engine::{Event, Mailbox};
use crate::protocol::AccessoryConfiguration;
use crate::types::{AccessoryId, DistanceSample};

/// How long a permission probe waits for the platform dialog to settle.
pub const PERMISSION_PROBE_SETTLE: Duration = Duration::from_millis(500);

/// Classification of ranging failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RangingErrorKind {
    /// The user has not granted ranging access. Needs a fresh grant.
    PermissionDenied,
    /// The platform timed out acquiring resources. Safe to retry.
    ResourceTimeout,
    /// Too many concurrent sessions. Blocked until another one is freed.
    SessionLimitExceeded,
    /// Anything else.
    Unknown,
}

impl RangingErrorKind {
    /// Whether re-running the `initialize` handshake may succeed.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::ResourceTimeout)
    }

    /// Whether the user has to act before ranging can work.
    #[must_use]
    pub const fn is_user_actionable(self) -> bool {
        matches!(self, Self::PermissionDenied)
    }
}

/// A ranging failure reported by the platform.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("ranging failed ({kind:?}): {message}")]
pub struct RangingError {
    /// Failure class.
    pub kind: RangingErrorKind,
    /// Platform-provided description.
    pub message: String,
}

impl RangingError {
    /// Build an error of the given kind.
    pub fn new(kind: RangingErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Identifies one started ranging session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionToken(pub u64);

/// Callbacks emitted by a ranging session.
#[derive(Debug, Clone, PartialEq)]
pub enum RangingEvent {
    /// The locally generated configuration to forward to the accessory.
    ShareableConfiguration {
        /// Session the callback belongs to.
        token: SessionToken,
        /// Accessory the session is bound to.
        accessory: AccessoryId,
        /// Opaque configuration bytes.
        data: Vec<u8>,
    },
    /// A new distance measurement.
    Distance {
        /// Session the callback belongs to.
        token: SessionToken,
        /// The measurement.
        sample: DistanceSample,
    },
    /// The session ended on the platform side.
    Invalidated {
        /// Session the callback belongs to.
        token: SessionToken,
        /// Accessory the session is bound to.
        accessory: AccessoryId,
        /// Why it ended.
        error: RangingError,
    },
}

impl RangingEvent {
    /// Token of the session that produced this callback.
    #[must_use]
    pub const fn token(&self) -> SessionToken {
        match self {
            Self::ShareableConfiguration { token, .. }
            | Self::Distance { token, .. }
            | Self::Invalidated { token, .. } => *token,
        }
    }

    /// Accessory the producing session is bound to.
    #[must_use]
    pub const fn accessory(&self) -> AccessoryId {
        match self {
            Self::ShareableConfiguration { accessory, .. } | Self::Invalidated { accessory, .. } => {
                *accessory
            }
            Self::Distance { sample, .. } => sample.accessory,
        }
    }
}

/// A running ranging session.
pub trait RangingSession: Send {
    /// Tear the session down. No callbacks are delivered afterwards.
    fn invalidate(&mut self);
}

/// Platform ranging primitive.
pub trait RangingBackend: Send + Sync {
    /// Start a session bound to `accessory` using its configuration.
    ///
    /// The backend posts [`RangingEvent`]s into `mailbox`.
    ///
    /// # Errors
    ///
    /// Returns a [`RangingError`] when the session cannot be created.
    fn start(
        &self,
        accessory: AccessoryId,
        token: SessionToken,
        config: &AccessoryConfiguration,
        mailbox: Mailbox,
    ) -> Result<Box<dyn RangingSession>, RangingError>;

    /// Start a session that is not bound to any accessory, purely to make the
    /// platform ask for permission. The first callback (success or failure)
    /// is delivered on the returned channel.
    ///
    /// # Errors
    ///
    /// Returns a [`RangingError`] when the probe cannot be created.
    fn start_probe(
        &self,
    ) -> Result<(Box<dyn RangingSession>, oneshot::Receiver<Result<(), RangingError>>), RangingError>;
}

/// Elicit the platform permission dialog with a short-lived, unbound session.
///
/// Waits [`PERMISSION_PROBE_SETTLE`] after creating the probe. A failure
/// reported before the wait elapses is returned; otherwise access is assumed
/// granted. The probe is invalidated in every case.
///
/// # Errors
///
/// Returns the probe's [`RangingError`], typically
/// [`RangingErrorKind::PermissionDenied`].
pub async fn probe_permission(backend: &dyn RangingBackend) -> Result<(), RangingError> {
    let (mut probe, mut first_callback) = backend.start_probe()?;

    let outcome = tokio::select! {
        result = &mut first_callback => match result {
            Ok(Err(error)) => Err(error),
            // Channel dropped or success: let the dialog settle before reporting.
            _ => {
                tokio::time::sleep(PERMISSION_PROBE_SETTLE).await;
                Ok(())
            }
        },
        () = tokio::time::sleep(PERMISSION_PROBE_SETTLE) => Ok(()),
    };

    probe.invalidate();
    match &outcome {
        Ok(()) => info!("Ranging permission probe succeeded"),
        Err(e) => warn!(kind = ?e.kind, "Ranging permission probe failed: {}", e.message),
    }
    outcome
}

// ============================================================================
// Channel-fed backend
// ============================================================================

#[derive(Debug)]
struct FeedEntry {
    token: SessionToken,
    mailbox: Mailbox,
}

#[derive(Debug, Default)]
struct FeedInner {
    active: HashMap<AccessoryId, FeedEntry>,
    probe_failure: Option<RangingError>,
}

/// Handle used by an external distance source to push measurements into
/// sessions started by [`ChannelRanging`].
#[derive(Debug, Clone, Default)]
pub struct RangingFeed {
    inner: Arc<Mutex<FeedInner>>,
}

impl RangingFeed {
    /// Push a distance for `accessory`.
    ///
    /// Returns `false` when the accessory has no live session.
    pub fn push_distance(&self, accessory: AccessoryId, distance_m: f32) -> bool {
        let Ok(inner) = self.inner.lock() else {
            return false;
        };
        let Some(entry) = inner.active.get(&accessory) else {
            debug!(%accessory, "Dropping distance for accessory without a ranging session");
            return false;
        };
        entry.mailbox.post(Event::Ranging(RangingEvent::Distance {
            token: entry.token,
            sample: DistanceSample {
                accessory,
                distance_m,
                timestamp: Utc::now(),
            },
        }))
    }

    /// Report a platform failure for `accessory`'s session.
    ///
    /// Returns `false` when the accessory has no live session.
    pub fn fail(&self, accessory: AccessoryId, error: RangingError) -> bool {
        let Ok(mut inner) = self.inner.lock() else {
            return false;
        };
        let Some(entry) = inner.active.remove(&accessory) else {
            return false;
        };
        entry.mailbox.post(Event::Ranging(RangingEvent::Invalidated {
            token: entry.token,
            accessory,
            error,
        }))
    }

    /// Make the next permission probe fail with `error`.
    pub fn deny_permission(&self, error: RangingError) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.probe_failure = Some(error);
        }
    }

    /// Clear a failure installed by [`Self::deny_permission`].
    pub fn grant_permission(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.probe_failure = None;
        }
    }

    /// Whether `accessory` currently has a live session.
    #[must_use]
    pub fn is_active(&self, accessory: AccessoryId) -> bool {
        self.inner
            .lock()
            .is_ok_and(|inner| inner.active.contains_key(&accessory))
    }
}

/// Ranging backend whose measurements come from an external driver through a
/// [`RangingFeed`].
///
/// The shareable configuration handed back to the accessory is the
/// accessory's own UWB configuration, which is what a controlee echoes in
/// the simple single-session setups this backend targets.
#[derive(Debug, Clone, Default)]
pub struct ChannelRanging {
    feed: RangingFeed,
}

impl ChannelRanging {
    /// Create a backend with a fresh feed.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The feed external producers push distances into.
    #[must_use]
    pub fn feed(&self) -> RangingFeed {
        self.feed.clone()
    }
}

struct ChannelSession {
    accessory: Option<AccessoryId>,
    token: SessionToken,
    feed: RangingFeed,
}

impl RangingSession for ChannelSession {
    fn invalidate(&mut self) {
        let Some(accessory) = self.accessory.take() else {
            return;
        };
        if let Ok(mut inner) = self.feed.inner.lock() {
            // A newer session for the same accessory must survive.
            if inner
                .active
                .get(&accessory)
                .is_some_and(|entry| entry.token == self.token)
            {
                inner.active.remove(&accessory);
            }
        }
    }
}

impl Drop for ChannelSession {
    fn drop(&mut self) {
        self.invalidate();
    }
}

impl RangingBackend for ChannelRanging {
    fn start(
        &self,
        accessory: AccessoryId,
        token: SessionToken,
        config: &AccessoryConfiguration,
        mailbox: Mailbox,
    ) -> Result<Box<dyn RangingSession>, RangingError> {
        let mut inner = self
            .feed
            .inner
            .lock()
            .map_err(|_| RangingError::new(RangingErrorKind::Unknown, "ranging feed poisoned"))?;

        if let Some(error) = inner.probe_failure.clone() {
            return Err(error);
        }

        inner.active.insert(
            accessory,
            FeedEntry {
                token,
                mailbox: mailbox.clone(),
            },
        );
        drop(inner);

        mailbox.post(Event::Ranging(RangingEvent::ShareableConfiguration {
            token,
            accessory,
            data: config.uwb_config.clone(),
        }));

        Ok(Box::new(ChannelSession {
            accessory: Some(accessory),
            token,
            feed: self.feed.clone(),
        }))
    }

    fn start_probe(
        &self,
    ) -> Result<(Box<dyn RangingSession>, oneshot::Receiver<Result<(), RangingError>>), RangingError>
    {
        let failure = self
            .feed
            .inner
            .lock()
            .map_err(|_| RangingError::new(RangingErrorKind::Unknown, "ranging feed poisoned"))?
            .probe_failure
            .clone();

        let (tx, rx) = oneshot::channel();
        let _ = tx.send(failure.map_or(Ok(()), Err));
        Ok((
            Box::new(ChannelSession {
                accessory: None,
                token: SessionToken(0),
                feed: self.feed.clone(),
            }),
            rx,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mailbox;

    fn config() -> AccessoryConfiguration {
        AccessoryConfiguration {
            major_version: 1,
            minor_version: 0,
            preferred_update_rate: 10,
            uwb_config: vec![1, 2, 3],
        }
    }

    #[test]
    fn test_error_kind_classification() {
        assert!(RangingErrorKind::ResourceTimeout.is_retryable());
        assert!(!RangingErrorKind::PermissionDenied.is_retryable());
        assert!(!RangingErrorKind::SessionLimitExceeded.is_retryable());
        assert!(RangingErrorKind::PermissionDenied.is_user_actionable());
        assert!(!RangingErrorKind::Unknown.is_user_actionable());
    }

    #[tokio::test]
    async fn test_channel_session_yields_configuration_then_distances() {
        let (mailbox, mut rx) = mailbox();
        let backend = ChannelRanging::new();
        let feed = backend.feed();

        let _session = backend
            .start(AccessoryId(1), SessionToken(9), &config(), mailbox)
            .unwrap();
        assert!(feed.push_distance(AccessoryId(1), 0.4));

        match rx.recv().await.unwrap() {
            Event::Ranging(RangingEvent::ShareableConfiguration { token, data, .. }) => {
                assert_eq!(token, SessionToken(9));
                assert_eq!(data, vec![1, 2, 3]);
            }
            other => panic!("unexpected event {other:?}"),
        }
        match rx.recv().await.unwrap() {
            Event::Ranging(RangingEvent::Distance { sample, .. }) => {
                assert!((sample.distance_m - 0.4).abs() < f32::EPSILON);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_invalidated_session_stops_accepting_distances() {
        let (mailbox, _rx) = mailbox();
        let backend = ChannelRanging::new();
        let feed = backend.feed();

        let mut session = backend
            .start(AccessoryId(1), SessionToken(1), &config(), mailbox)
            .unwrap();
        session.invalidate();

        assert!(!feed.is_active(AccessoryId(1)));
        assert!(!feed.push_distance(AccessoryId(1), 0.4));
    }

    #[tokio::test]
    async fn test_stale_session_does_not_remove_newer_one() {
        let (mailbox, _rx) = mailbox();
        let backend = ChannelRanging::new();

        let mut old = backend
            .start(AccessoryId(1), SessionToken(1), &config(), mailbox.clone())
            .unwrap();
        let _new = backend
            .start(AccessoryId(1), SessionToken(2), &config(), mailbox)
            .unwrap();
        old.invalidate();

        assert!(backend.feed().is_active(AccessoryId(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_permission_probe_waits_and_succeeds() {
        let backend = ChannelRanging::new();
        let started = tokio::time::Instant::now();
        tokio_test::assert_ok!(probe_permission(&backend).await);
        assert!(started.elapsed() >= PERMISSION_PROBE_SETTLE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permission_probe_reports_denial() {
        let backend = ChannelRanging::new();
        backend.feed().deny_permission(RangingError::new(
            RangingErrorKind::PermissionDenied,
            "user declined",
        ));
        let err = tokio_test::assert_err!(probe_permission(&backend).await);
        assert_eq!(err.kind, RangingErrorKind::PermissionDenied);
    }
}
