//! Known accessories and live link slots.
//!
//! [`KnownAccessories`] is the persisted list of paired accessories, capped at
//! [`MAX_KNOWN_ACCESSORIES`]. [`DeviceRegistry`] is the in-memory arena of
//! [`LinkSlot`]s (link state machine plus its ranging session) keyed by
//! [`AccessoryId`], with a secondary index by radio identifier.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use utoipa::ToSchema;

use crate::error::Result;
use crate::link::{AccessoryLink, LinkSnapshot, LinkState};
use crate::ranging::{RangingSession, SessionToken};
use crate::storage::{Storage, StoredAccessories};
use crate::types::{AccessoryId, PeripheralId};

/// How many accessories are remembered.
pub const MAX_KNOWN_ACCESSORIES: usize = 5;

/// A remembered accessory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AccessoryRecord {
    /// Radio identifier.
    #[schema(value_type = String, example = "AA:BB:CC:DD:EE:FF")]
    pub peripheral_identifier: PeripheralId,
    /// Stable identifier minted at first discovery.
    #[schema(value_type = u32)]
    pub unique_id: AccessoryId,
    /// Name shown to the user.
    pub display_name: Option<String>,
    /// When the record was last written.
    pub saved_at: DateTime<Utc>,
}

/// Persisted list of paired accessories.
#[derive(Debug)]
pub struct KnownAccessories {
    storage: Storage,
    stored: StoredAccessories,
}

impl KnownAccessories {
    /// Load the list from storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the stored list cannot be read.
    pub fn load(storage: Storage) -> Result<Self> {
        let stored = storage.load_accessories()?;
        debug!(count = stored.accessories.len(), "Loaded known accessories");
        Ok(Self { storage, stored })
    }

    /// All records, oldest first.
    #[must_use]
    pub fn records(&self) -> &[AccessoryRecord] {
        &self.stored.accessories
    }

    /// Record for a radio identifier.
    #[must_use]
    pub fn by_peripheral(&self, peripheral: &PeripheralId) -> Option<&AccessoryRecord> {
        self.stored
            .accessories
            .iter()
            .find(|r| &r.peripheral_identifier == peripheral)
    }

    /// Whether `id` is remembered.
    #[must_use]
    pub fn contains(&self, id: AccessoryId) -> bool {
        self.stored.accessories.iter().any(|r| r.unique_id == id)
    }

    /// Mint a fresh identifier and persist the counter.
    ///
    /// # Errors
    ///
    /// Returns an error if the counter cannot be persisted.
    pub fn mint_id(&mut self) -> Result<AccessoryId> {
        let id = AccessoryId(self.stored.next_unique_id);
        self.stored.next_unique_id = self.stored.next_unique_id.wrapping_add(1).max(1);
        self.storage.save_accessories(&self.stored)?;
        Ok(id)
    }

    /// Remember an accessory. A record for the same radio identifier is
    /// replaced; beyond the cap the oldest record is evicted.
    ///
    /// # Errors
    ///
    /// Returns an error if the list cannot be persisted.
    pub fn remember(
        &mut self,
        peripheral: PeripheralId,
        unique_id: AccessoryId,
        display_name: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let accessories = &mut self.stored.accessories;
        accessories.retain(|r| r.peripheral_identifier != peripheral && r.unique_id != unique_id);
        accessories.push(AccessoryRecord {
            peripheral_identifier: peripheral,
            unique_id,
            display_name,
            saved_at: now,
        });
        accessories.sort_by_key(|r| r.saved_at);
        while accessories.len() > MAX_KNOWN_ACCESSORIES {
            let evicted = accessories.remove(0);
            info!(accessory = %evicted.unique_id, "Evicted oldest known accessory");
        }
        self.storage.save_accessories(&self.stored)
    }

    /// Forget an accessory. Returns `false` if it was not remembered.
    ///
    /// # Errors
    ///
    /// Returns an error if the list cannot be persisted.
    pub fn forget(&mut self, unique_id: AccessoryId) -> Result<bool> {
        let before = self.stored.accessories.len();
        self.stored.accessories.retain(|r| r.unique_id != unique_id);
        if self.stored.accessories.len() == before {
            return Ok(false);
        }
        self.storage.save_accessories(&self.stored)?;
        Ok(true)
    }
}

struct ActiveSession {
    token: SessionToken,
    handle: Box<dyn RangingSession>,
}

/// Everything the coordinator tracks for one accessory.
pub struct LinkSlot {
    /// Protocol state machine.
    pub link: AccessoryLink,
    session: Option<ActiveSession>,
}

impl std::fmt::Debug for LinkSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkSlot")
            .field("link", &self.link)
            .field("session", &self.session_token())
            .finish()
    }
}

impl LinkSlot {
    fn new(link: AccessoryLink) -> Self {
        Self {
            link,
            session: None,
        }
    }

    /// Token of the live ranging session, if any.
    #[must_use]
    pub fn session_token(&self) -> Option<SessionToken> {
        self.session.as_ref().map(|s| s.token)
    }

    /// Install a freshly started session, invalidating any previous one.
    pub fn attach_session(&mut self, token: SessionToken, handle: Box<dyn RangingSession>) {
        self.invalidate_session();
        self.session = Some(ActiveSession { token, handle });
    }

    /// Destroy the live session. Returns `false` if there was none.
    pub fn invalidate_session(&mut self) -> bool {
        match self.session.take() {
            Some(mut session) => {
                session.handle.invalidate();
                debug!(accessory = %self.link.id(), token = session.token.0, "Invalidated ranging session");
                true
            }
            None => false,
        }
    }
}

/// Arena of live links.
#[derive(Debug)]
pub struct DeviceRegistry {
    known: KnownAccessories,
    slots: HashMap<AccessoryId, LinkSlot>,
    by_peripheral: HashMap<PeripheralId, AccessoryId>,
    default_max_write_len: usize,
    discovery_timeout: Duration,
}

impl DeviceRegistry {
    /// Create an empty arena over a loaded known-accessory list.
    #[must_use]
    pub fn new(
        known: KnownAccessories,
        default_max_write_len: usize,
        discovery_timeout: Duration,
    ) -> Self {
        Self {
            known,
            slots: HashMap::new(),
            by_peripheral: HashMap::new(),
            default_max_write_len,
            discovery_timeout,
        }
    }

    /// The persisted list.
    #[must_use]
    pub const fn known(&self) -> &KnownAccessories {
        &self.known
    }

    /// Register a sighting. Known peripherals keep their identifier; new ones
    /// get a freshly minted one.
    ///
    /// # Errors
    ///
    /// Returns an error if a new identifier cannot be persisted.
    pub fn on_discovered(
        &mut self,
        peripheral: PeripheralId,
        name: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<AccessoryId> {
        if let Some(id) = self.by_peripheral.get(&peripheral).copied() {
            if let Some(slot) = self.slots.get_mut(&id) {
                slot.link.touch(name, now);
                return Ok(id);
            }
        }

        let (id, name) = match self.known.by_peripheral(&peripheral) {
            Some(record) => (record.unique_id, name.or_else(|| record.display_name.clone())),
            None => (self.known.mint_id()?, name),
        };
        info!(accessory = %id, %peripheral, "Discovered accessory");
        let link = AccessoryLink::new(
            id,
            peripheral.clone(),
            name,
            self.default_max_write_len,
            now,
        );
        self.slots.insert(id, LinkSlot::new(link));
        self.by_peripheral.insert(peripheral, id);
        Ok(id)
    }

    /// Slot by accessory id.
    #[must_use]
    pub fn slot(&self, id: AccessoryId) -> Option<&LinkSlot> {
        self.slots.get(&id)
    }

    /// Mutable slot by accessory id.
    pub fn slot_mut(&mut self, id: AccessoryId) -> Option<&mut LinkSlot> {
        self.slots.get_mut(&id)
    }

    /// Accessory id for a radio identifier.
    #[must_use]
    pub fn id_for(&self, peripheral: &PeripheralId) -> Option<AccessoryId> {
        self.by_peripheral.get(peripheral).copied()
    }

    /// Mutable slot by radio identifier.
    pub fn slot_by_peripheral(&mut self, peripheral: &PeripheralId) -> Option<&mut LinkSlot> {
        let id = self.by_peripheral.get(peripheral)?;
        self.slots.get_mut(id)
    }

    /// Ids of every live link, ascending.
    #[must_use]
    pub fn ids(&self) -> Vec<AccessoryId> {
        let mut ids: Vec<_> = self.slots.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Remember the accessory behind a link that just paired.
    ///
    /// # Errors
    ///
    /// Returns an error if the list cannot be persisted.
    pub fn remember_paired(&mut self, id: AccessoryId, now: DateTime<Utc>) -> Result<bool> {
        let Some(slot) = self.slots.get(&id) else {
            return Ok(false);
        };
        let peripheral = slot.link.peripheral().clone();
        let name = slot.link.name().map(str::to_owned);
        self.known.remember(peripheral, id, name, now)?;
        Ok(true)
    }

    /// Forget an accessory and drop its slot. The caller disconnects it first.
    ///
    /// # Errors
    ///
    /// Returns an error if the list cannot be persisted.
    pub fn forget(&mut self, id: AccessoryId) -> Result<bool> {
        let remembered = self.known.forget(id)?;
        if let Some(mut slot) = self.slots.remove(&id) {
            slot.invalidate_session();
            self.by_peripheral.remove(slot.link.peripheral());
            return Ok(true);
        }
        Ok(remembered)
    }

    /// Known accessories that are visible and idle, ready to auto-connect.
    #[must_use]
    pub fn reconnect_candidates(&self) -> Vec<AccessoryId> {
        let mut ids: Vec<_> = self
            .slots
            .iter()
            .filter(|(id, slot)| {
                self.known.contains(**id) && slot.link.state() == LinkState::Discovered
            })
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Whether some known accessory has no live link yet.
    #[must_use]
    pub fn has_unseen_known(&self) -> bool {
        self.known
            .records()
            .iter()
            .any(|r| !self.slots.contains_key(&r.unique_id))
    }

    /// Whether some link has never connected and may expire.
    #[must_use]
    pub fn has_unconnected(&self) -> bool {
        self.slots.values().any(|slot| !slot.link.ever_connected())
    }

    /// Destroy never-connected links unseen for longer than the discovery
    /// timeout. Returns the ids removed.
    pub fn expire_stale(&mut self, now: DateTime<Utc>) -> Vec<AccessoryId> {
        let timeout = self.discovery_timeout;
        let stale: Vec<_> = self
            .slots
            .iter()
            .filter(|(_, slot)| {
                !slot.link.ever_connected()
                    && slot.link.state() == LinkState::Discovered
                    && now - slot.link.last_seen() > timeout
            })
            .map(|(id, _)| *id)
            .collect();

        for id in &stale {
            if let Some(mut slot) = self.slots.remove(id) {
                slot.invalidate_session();
                self.by_peripheral.remove(slot.link.peripheral());
                debug!(accessory = %id, "Expired stale discovery");
            }
        }
        stale
    }

    /// Observer view of every link, ordered by id.
    #[must_use]
    pub fn snapshots(&self) -> Vec<LinkSnapshot> {
        self.ids()
            .into_iter()
            .filter_map(|id| self.slots.get(&id))
            .map(|slot| slot.link.snapshot())
            .collect()
    }
}
