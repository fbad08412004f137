//! Per-accessory connection and handshake state machine.
//!
//! [`AccessoryLink`] is sans-IO: it consumes [`LinkEvent`]s produced by the
//! radio and the ranging session and returns the [`LinkAction`]s the
//! coordinator must execute, in order. Happy path:
//!
//! ```text
//! Discovered --connect--> Connecting --connected--> Connected
//!     Connected --characteristics + paired--> Paired   (send initialize)
//!     Paired --configurationData--> start ranging session
//!     ranging session --shareable configuration--> send configureAndStart
//!     Paired --uwbDidStart--> Ranging
//! ```
//!
//! Disconnects drop the link back to `Discovered` from anywhere. Protocol
//! errors abandon the pairing attempt and leave the link `Connected`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use utoipa::ToSchema;

use crate::protocol::{AccessoryConfiguration, AccessoryMessage, AppMessage, ProtocolError};
use crate::ranging::RangingErrorKind;
use crate::types::{AccessoryId, PeripheralId};

/// Connection state of one accessory link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    /// Seen advertising, not connected.
    Discovered,
    /// Connection requested.
    Connecting,
    /// Connected, handshake not complete.
    Connected,
    /// Pairing trigger acknowledged by the accessory.
    Paired,
    /// Accessory confirmed it is ranging.
    Ranging,
}

/// Inputs to the link state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Ask the radio to connect.
    ConnectRequested,
    /// The radio connected; `max_write_len` is the largest frame one write carries.
    Connected {
        /// Negotiated maximum write length, if the radio reported one.
        max_write_len: Option<usize>,
    },
    /// The connection attempt failed.
    ConnectFailed,
    /// Sync, inbound-write and outbound-notify characteristics were found.
    CharacteristicsResolved,
    /// Raw bytes received on the notify characteristic.
    Frame(Vec<u8>),
    /// The ranging session produced its shareable configuration.
    ShareableConfiguration(Vec<u8>),
    /// The ranging session ended with an error.
    RangingFailed(RangingErrorKind),
    /// Stop ranging at the user's or engine's request.
    StopRequested,
    /// The radio lost the connection.
    Disconnected,
}

/// Side effects requested by the link state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkAction {
    /// Connect to the peripheral.
    Connect,
    /// Subscribe to notifications and read the sync characteristic once.
    SubscribeAndSync,
    /// Write one encoded frame to the inbound characteristic.
    Write(Vec<u8>),
    /// Create and start a ranging session from this configuration.
    StartRanging(AccessoryConfiguration),
    /// Destroy the local ranging session.
    InvalidateRanging,
    /// Pairing completed; the accessory should be remembered.
    Paired,
    /// The accessory began ranging.
    RangingStarted,
    /// Ranging ended for this link.
    RangingStopped,
    /// The ranging session failed with this classification.
    RangingError(RangingErrorKind),
}

/// Read-only view of a link, published to observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct LinkSnapshot {
    /// Stable accessory identifier.
    pub accessory: AccessoryId,
    /// Radio identifier.
    #[schema(value_type = String, example = "AA:BB:CC:DD:EE:FF")]
    pub peripheral: PeripheralId,
    /// Advertised name.
    pub name: Option<String>,
    /// Current link state.
    pub state: LinkState,
    /// Last time the radio saw this accessory.
    pub last_seen: DateTime<Utc>,
    /// Most recent ranging failure, cleared once ranging restarts.
    pub last_ranging_error: Option<RangingErrorKind>,
}

/// Protocol state for a single accessory connection.
#[derive(Debug, Clone)]
pub struct AccessoryLink {
    id: AccessoryId,
    peripheral: PeripheralId,
    name: Option<String>,
    state: LinkState,
    characteristics_ready: bool,
    default_max_write_len: usize,
    max_write_len: usize,
    configuration: Option<AccessoryConfiguration>,
    ranging_active: bool,
    timeout_retry_available: bool,
    ever_connected: bool,
    last_seen: DateTime<Utc>,
    last_ranging_error: Option<RangingErrorKind>,
}

impl AccessoryLink {
    /// Create a link for a freshly discovered peripheral.
    #[must_use]
    pub fn new(
        id: AccessoryId,
        peripheral: PeripheralId,
        name: Option<String>,
        default_max_write_len: usize,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            peripheral,
            name,
            state: LinkState::Discovered,
            characteristics_ready: false,
            default_max_write_len,
            max_write_len: default_max_write_len,
            configuration: None,
            ranging_active: false,
            timeout_retry_available: true,
            ever_connected: false,
            last_seen: now,
            last_ranging_error: None,
        }
    }

    /// Stable accessory identifier.
    #[must_use]
    pub const fn id(&self) -> AccessoryId {
        self.id
    }

    /// Radio identifier.
    #[must_use]
    pub const fn peripheral(&self) -> &PeripheralId {
        &self.peripheral
    }

    /// Advertised name, if any.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> LinkState {
        self.state
    }

    /// Whether the link has ever reached `Connected`.
    #[must_use]
    pub const fn ever_connected(&self) -> bool {
        self.ever_connected
    }

    /// Last time the radio reported this peripheral.
    #[must_use]
    pub const fn last_seen(&self) -> DateTime<Utc> {
        self.last_seen
    }

    /// Whether a local ranging session is expected to exist.
    #[must_use]
    pub const fn ranging_active(&self) -> bool {
        self.ranging_active
    }

    /// Configuration buffered from the last `configurationData`.
    #[must_use]
    pub const fn configuration(&self) -> Option<&AccessoryConfiguration> {
        self.configuration.as_ref()
    }

    /// Record a fresh sighting, updating the advertised name when present.
    pub fn touch(&mut self, name: Option<String>, now: DateTime<Utc>) {
        self.last_seen = now;
        if name.is_some() {
            self.name = name;
        }
    }

    /// Observer view of this link.
    #[must_use]
    pub fn snapshot(&self) -> LinkSnapshot {
        LinkSnapshot {
            accessory: self.id,
            peripheral: self.peripheral.clone(),
            name: self.name.clone(),
            state: self.state,
            last_seen: self.last_seen,
            last_ranging_error: self.last_ranging_error,
        }
    }

    /// Advance the state machine.
    pub fn handle(&mut self, event: LinkEvent, now: DateTime<Utc>) -> Vec<LinkAction> {
        let before = self.state;
        let actions = match event {
            LinkEvent::ConnectRequested => self.on_connect_requested(),
            LinkEvent::Connected { max_write_len } => {
                self.on_connected(max_write_len, now);
                Vec::new()
            }
            LinkEvent::ConnectFailed => self.on_connect_failed(),
            LinkEvent::CharacteristicsResolved => self.on_characteristics_resolved(),
            LinkEvent::Frame(bytes) => {
                self.last_seen = now;
                self.on_frame(&bytes)
            }
            LinkEvent::ShareableConfiguration(data) => self.on_shareable_configuration(data),
            LinkEvent::RangingFailed(kind) => self.on_ranging_failed(kind),
            LinkEvent::StopRequested => self.stop(),
            LinkEvent::Disconnected => self.on_disconnected(),
        };

        if before != self.state {
            info!(accessory = %self.id, from = ?before, to = ?self.state, "Link state changed");
        }
        actions
    }

    /// Connect a discovered link. On a connected link whose pairing attempt
    /// was abandoned, start a fresh `initialize` cycle instead.
    fn on_connect_requested(&mut self) -> Vec<LinkAction> {
        match self.state {
            LinkState::Discovered => {
                self.state = LinkState::Connecting;
                vec![LinkAction::Connect]
            }
            LinkState::Connected if self.characteristics_ready && !self.ranging_active => {
                info!(accessory = %self.id, "Retrying pairing with a fresh initialize");
                self.state = LinkState::Paired;
                self.frame(&AppMessage::Initialize).into_iter().collect()
            }
            state => {
                debug!(accessory = %self.id, ?state, "Ignoring connect request");
                Vec::new()
            }
        }
    }

    fn on_connected(&mut self, max_write_len: Option<usize>, now: DateTime<Utc>) {
        if !matches!(self.state, LinkState::Discovered | LinkState::Connecting) {
            debug!(accessory = %self.id, state = ?self.state, "Duplicate connected event");
            return;
        }
        self.state = LinkState::Connected;
        self.ever_connected = true;
        self.last_seen = now;
        self.characteristics_ready = false;
        self.max_write_len = max_write_len.unwrap_or(self.default_max_write_len);
    }

    fn on_connect_failed(&mut self) -> Vec<LinkAction> {
        if self.state == LinkState::Connecting {
            self.state = LinkState::Discovered;
        }
        Vec::new()
    }

    fn on_characteristics_resolved(&mut self) -> Vec<LinkAction> {
        if self.state != LinkState::Connected {
            debug!(accessory = %self.id, state = ?self.state, "Characteristics resolved outside Connected");
            return Vec::new();
        }
        self.characteristics_ready = true;
        vec![LinkAction::SubscribeAndSync]
    }

    fn on_frame(&mut self, bytes: &[u8]) -> Vec<LinkAction> {
        let message = match AccessoryMessage::decode(bytes) {
            Ok(message) => message,
            Err(e) => return self.on_protocol_error(&e),
        };

        match message {
            AccessoryMessage::Paired => self.on_paired(),
            AccessoryMessage::ConfigurationData(payload) => self.on_configuration(&payload),
            AccessoryMessage::UwbDidStart => self.on_uwb_did_start(),
            AccessoryMessage::UwbDidStop => self.on_uwb_did_stop(),
            AccessoryMessage::Notify(text) => {
                info!(accessory = %self.id, message = %text, "Accessory notification");
                Vec::new()
            }
        }
    }

    fn on_paired(&mut self) -> Vec<LinkAction> {
        match self.state {
            LinkState::Connected if self.characteristics_ready => {
                self.state = LinkState::Paired;
                let mut actions = vec![LinkAction::Paired];
                actions.extend(self.frame(&AppMessage::Initialize));
                actions
            }
            LinkState::Connected => {
                warn!(accessory = %self.id, "Paired received before characteristics were resolved");
                Vec::new()
            }
            state => {
                debug!(accessory = %self.id, ?state, "Ignoring duplicate paired message");
                Vec::new()
            }
        }
    }

    fn on_configuration(&mut self, payload: &[u8]) -> Vec<LinkAction> {
        if self.state != LinkState::Paired {
            warn!(accessory = %self.id, state = ?self.state, "Configuration data outside Paired");
            return Vec::new();
        }

        let config = match AccessoryConfiguration::parse(payload) {
            Ok(config) => config,
            Err(e) => return self.on_protocol_error(&e),
        };

        let mut actions = Vec::new();
        if self.ranging_active {
            actions.push(LinkAction::InvalidateRanging);
        }
        self.configuration = Some(config.clone());
        self.ranging_active = true;
        actions.push(LinkAction::StartRanging(config));
        actions
    }

    fn on_uwb_did_start(&mut self) -> Vec<LinkAction> {
        if self.state != LinkState::Paired || !self.ranging_active {
            warn!(accessory = %self.id, state = ?self.state, "uwbDidStart without a pending session");
            return Vec::new();
        }
        self.state = LinkState::Ranging;
        self.timeout_retry_available = true;
        self.last_ranging_error = None;
        vec![LinkAction::RangingStarted]
    }

    fn on_uwb_did_stop(&mut self) -> Vec<LinkAction> {
        if self.state != LinkState::Ranging {
            debug!(accessory = %self.id, state = ?self.state, "uwbDidStop while not ranging");
            return Vec::new();
        }
        self.state = LinkState::Paired;
        self.configuration = None;
        self.ranging_active = false;
        vec![LinkAction::InvalidateRanging, LinkAction::RangingStopped]
    }

    fn on_shareable_configuration(&mut self, data: Vec<u8>) -> Vec<LinkAction> {
        if self.state != LinkState::Paired || !self.ranging_active {
            debug!(accessory = %self.id, state = ?self.state, "Dropping shareable configuration");
            return Vec::new();
        }
        match AppMessage::ConfigureAndStart(data).encode(self.max_write_len) {
            Ok(frame) => vec![LinkAction::Write(frame)],
            Err(e) => self.on_protocol_error(&e),
        }
    }

    fn on_ranging_failed(&mut self, kind: RangingErrorKind) -> Vec<LinkAction> {
        if !self.ranging_active {
            return Vec::new();
        }
        let was_ranging = self.state == LinkState::Ranging;
        self.ranging_active = false;
        self.configuration = None;
        self.last_ranging_error = Some(kind);

        let mut actions = vec![LinkAction::RangingError(kind)];
        if was_ranging {
            self.state = LinkState::Paired;
            actions.extend(self.frame(&AppMessage::Stop));
            actions.push(LinkAction::RangingStopped);
        }

        if kind.is_retryable() && self.timeout_retry_available && self.state == LinkState::Paired {
            self.timeout_retry_available = false;
            warn!(accessory = %self.id, "Ranging timed out, re-running initialize once");
            actions.extend(self.frame(&AppMessage::Initialize));
        } else if kind.is_user_actionable() {
            warn!(accessory = %self.id, "Ranging permission denied; waiting for a new grant");
        } else {
            warn!(accessory = %self.id, ?kind, "Ranging session discarded");
        }
        actions
    }

    /// Stop ranging: tell the accessory first, then drop the local session.
    pub fn stop(&mut self) -> Vec<LinkAction> {
        if !self.ranging_active && self.state != LinkState::Ranging {
            return Vec::new();
        }
        let mut actions = self.frame(&AppMessage::Stop).into_iter().collect::<Vec<_>>();
        actions.push(LinkAction::InvalidateRanging);
        actions.push(LinkAction::RangingStopped);
        self.state = LinkState::Paired;
        self.ranging_active = false;
        self.configuration = None;
        actions
    }

    fn on_disconnected(&mut self) -> Vec<LinkAction> {
        if self.state == LinkState::Discovered {
            return Vec::new();
        }
        let mut actions = Vec::new();
        if self.ranging_active {
            actions.push(LinkAction::InvalidateRanging);
        }
        if self.state == LinkState::Ranging || self.ranging_active {
            actions.push(LinkAction::RangingStopped);
        }
        self.reset();
        actions
    }

    /// Abandon the current pairing attempt. Ranging links only log: there is
    /// no attempt in flight to abandon.
    fn on_protocol_error(&mut self, error: &ProtocolError) -> Vec<LinkAction> {
        if self.state == LinkState::Ranging {
            warn!(accessory = %self.id, %error, "Protocol error while ranging, ignoring frame");
            return Vec::new();
        }

        warn!(accessory = %self.id, %error, "Protocol error, abandoning pairing attempt");
        let mut actions = Vec::new();
        if self.ranging_active {
            actions.push(LinkAction::InvalidateRanging);
        }
        if self.state == LinkState::Paired {
            self.state = LinkState::Connected;
        }
        self.ranging_active = false;
        self.configuration = None;
        actions
    }

    fn frame(&self, message: &AppMessage) -> Option<LinkAction> {
        match message.encode(self.max_write_len) {
            Ok(frame) => Some(LinkAction::Write(frame)),
            Err(e) => {
                warn!(accessory = %self.id, error = %e, "Could not encode frame");
                None
            }
        }
    }

    fn reset(&mut self) {
        self.state = LinkState::Discovered;
        self.characteristics_ready = false;
        self.configuration = None;
        self.ranging_active = false;
        self.timeout_retry_available = true;
        self.max_write_len = self.default_max_write_len;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 15, 12, 0, 0).unwrap()
    }

    fn config_frame() -> Vec<u8> {
        let mut frame = vec![0x01];
        frame.extend(
            AccessoryConfiguration {
                major_version: 1,
                minor_version: 0,
                preferred_update_rate: 10,
                uwb_config: vec![7; 8],
            }
            .to_bytes(),
        );
        frame
    }

    fn link() -> AccessoryLink {
        AccessoryLink::new(
            AccessoryId(1),
            PeripheralId::new("AA:BB:CC:DD:EE:FF"),
            Some("Tag".to_string()),
            64,
            now(),
        )
    }

    fn paired_link() -> AccessoryLink {
        let mut link = link();
        link.handle(LinkEvent::ConnectRequested, now());
        link.handle(LinkEvent::Connected { max_write_len: Some(64) }, now());
        link.handle(LinkEvent::CharacteristicsResolved, now());
        link.handle(LinkEvent::Frame(vec![0x04]), now());
        link
    }

    fn ranging_link() -> AccessoryLink {
        let mut link = paired_link();
        link.handle(LinkEvent::Frame(config_frame()), now());
        link.handle(LinkEvent::ShareableConfiguration(vec![1, 2]), now());
        link.handle(LinkEvent::Frame(vec![0x02]), now());
        link
    }

    #[test]
    fn test_happy_path_handshake() {
        let mut link = link();
        assert_eq!(link.handle(LinkEvent::ConnectRequested, now()), vec![LinkAction::Connect]);
        assert_eq!(link.state(), LinkState::Connecting);

        assert!(link
            .handle(LinkEvent::Connected { max_write_len: Some(64) }, now())
            .is_empty());
        assert_eq!(link.state(), LinkState::Connected);

        assert_eq!(
            link.handle(LinkEvent::CharacteristicsResolved, now()),
            vec![LinkAction::SubscribeAndSync]
        );

        assert_eq!(
            link.handle(LinkEvent::Frame(vec![0x04]), now()),
            vec![LinkAction::Paired, LinkAction::Write(vec![0x0A])]
        );
        assert_eq!(link.state(), LinkState::Paired);

        let actions = link.handle(LinkEvent::Frame(config_frame()), now());
        assert!(matches!(actions.as_slice(), [LinkAction::StartRanging(c)] if c.uwb_config == vec![7; 8]));

        assert_eq!(
            link.handle(LinkEvent::ShareableConfiguration(vec![5, 6]), now()),
            vec![LinkAction::Write(vec![0x0B, 5, 6])]
        );

        assert_eq!(
            link.handle(LinkEvent::Frame(vec![0x02]), now()),
            vec![LinkAction::RangingStarted]
        );
        assert_eq!(link.state(), LinkState::Ranging);
    }

    #[test]
    fn test_connect_failure_reverts_to_discovered() {
        let mut link = link();
        link.handle(LinkEvent::ConnectRequested, now());
        link.handle(LinkEvent::ConnectFailed, now());
        assert_eq!(link.state(), LinkState::Discovered);
        assert!(!link.ever_connected());
    }

    #[test]
    fn test_paired_requires_characteristics() {
        let mut link = link();
        link.handle(LinkEvent::ConnectRequested, now());
        link.handle(LinkEvent::Connected { max_write_len: None }, now());
        assert!(link.handle(LinkEvent::Frame(vec![0x04]), now()).is_empty());
        assert_eq!(link.state(), LinkState::Connected);
    }

    #[test]
    fn test_corrupt_configuration_aborts_pairing() {
        let mut link = paired_link();
        let mut frame = config_frame();
        frame.truncate(frame.len() - 3);

        let actions = link.handle(LinkEvent::Frame(frame), now());
        assert!(actions.is_empty());
        assert_eq!(link.state(), LinkState::Connected);
        assert!(!link.ranging_active());
        assert!(link.configuration().is_none());
    }

    #[test]
    fn test_connect_request_after_abandoned_pairing_reinitializes() {
        let mut link = paired_link();
        link.handle(LinkEvent::Frame(vec![0x01, 0x00]), now());
        assert_eq!(link.state(), LinkState::Connected);

        assert_eq!(
            link.handle(LinkEvent::ConnectRequested, now()),
            vec![LinkAction::Write(vec![0x0A])]
        );
        assert_eq!(link.state(), LinkState::Paired);

        let actions = link.handle(LinkEvent::Frame(config_frame()), now());
        assert!(matches!(actions.as_slice(), [LinkAction::StartRanging(_)]));
    }

    #[test]
    fn test_connect_request_before_characteristics_is_ignored() {
        let mut link = link();
        link.handle(LinkEvent::ConnectRequested, now());
        link.handle(LinkEvent::Connected { max_write_len: Some(64) }, now());

        assert!(link.handle(LinkEvent::ConnectRequested, now()).is_empty());
        assert_eq!(link.state(), LinkState::Connected);
    }

    #[test]
    fn test_unknown_message_abandons_pairing() {
        let mut link = paired_link();
        link.handle(LinkEvent::Frame(config_frame()), now());
        let actions = link.handle(LinkEvent::Frame(vec![0x55]), now());
        assert_eq!(actions, vec![LinkAction::InvalidateRanging]);
        assert_eq!(link.state(), LinkState::Connected);
    }

    #[test]
    fn test_unknown_message_while_ranging_is_ignored() {
        let mut link = ranging_link();
        assert!(link.handle(LinkEvent::Frame(vec![0x55]), now()).is_empty());
        assert_eq!(link.state(), LinkState::Ranging);
    }

    #[test]
    fn test_oversized_shareable_configuration_is_rejected() {
        let mut link = paired_link();
        link.handle(LinkEvent::Frame(config_frame()), now());
        let actions = link.handle(LinkEvent::ShareableConfiguration(vec![0; 64]), now());
        assert_eq!(actions, vec![LinkAction::InvalidateRanging]);
        assert_eq!(link.state(), LinkState::Connected);
    }

    #[test]
    fn test_stop_sends_stop_before_invalidating() {
        let mut link = ranging_link();
        assert_eq!(
            link.handle(LinkEvent::StopRequested, now()),
            vec![
                LinkAction::Write(vec![0x0C]),
                LinkAction::InvalidateRanging,
                LinkAction::RangingStopped
            ]
        );
        assert_eq!(link.state(), LinkState::Paired);
    }

    #[test]
    fn test_disconnect_clears_protocol_objects() {
        let mut link = ranging_link();
        let actions = link.handle(LinkEvent::Disconnected, now());
        assert_eq!(
            actions,
            vec![LinkAction::InvalidateRanging, LinkAction::RangingStopped]
        );
        assert_eq!(link.state(), LinkState::Discovered);
        assert!(link.configuration().is_none());
        assert!(link.ever_connected());
    }

    #[test]
    fn test_accessory_stop_drops_session() {
        let mut link = ranging_link();
        assert_eq!(
            link.handle(LinkEvent::Frame(vec![0x03]), now()),
            vec![LinkAction::InvalidateRanging, LinkAction::RangingStopped]
        );
        assert_eq!(link.state(), LinkState::Paired);
    }

    #[test]
    fn test_timeout_retries_initialize_once() {
        let mut link = paired_link();
        link.handle(LinkEvent::Frame(config_frame()), now());

        let first = link.handle(LinkEvent::RangingFailed(RangingErrorKind::ResourceTimeout), now());
        assert_eq!(
            first,
            vec![
                LinkAction::RangingError(RangingErrorKind::ResourceTimeout),
                LinkAction::Write(vec![0x0A])
            ]
        );

        link.handle(LinkEvent::Frame(config_frame()), now());
        let second = link.handle(LinkEvent::RangingFailed(RangingErrorKind::ResourceTimeout), now());
        assert_eq!(
            second,
            vec![LinkAction::RangingError(RangingErrorKind::ResourceTimeout)]
        );
    }

    #[test]
    fn test_permission_denied_is_not_retried() {
        let mut link = ranging_link();
        let actions = link.handle(
            LinkEvent::RangingFailed(RangingErrorKind::PermissionDenied),
            now(),
        );
        assert_eq!(
            actions,
            vec![
                LinkAction::RangingError(RangingErrorKind::PermissionDenied),
                LinkAction::Write(vec![0x0C]),
                LinkAction::RangingStopped
            ]
        );
        assert_eq!(
            link.snapshot().last_ranging_error,
            Some(RangingErrorKind::PermissionDenied)
        );
    }
}
