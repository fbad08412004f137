//! In-process accessory simulation.
//!
//! [`SimulatedAccessory`] implements [`Radio`] by answering every command the
//! way the accessory firmware does, posting the replies into the coordinator
//! mailbox. It backs the `mock-bluetooth` feature (and builds without the
//! `bluetooth` feature) and the engine tests.

use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::engine::{Event, Mailbox, Radio, RadioEvent};
use crate::error::{BubbleError, Result};
use crate::protocol::AccessoryConfiguration;
use crate::types::PeripheralId;

/// How the simulated firmware behaves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareBehavior {
    /// UWB configuration returned in `configurationData`.
    pub uwb_config: Vec<u8>,
    /// Answer `initialize` with a truncated configuration.
    pub corrupt_configuration: bool,
    /// Fail every connection attempt.
    pub refuse_connections: bool,
    /// Fail enabling notifications after a successful connect.
    pub reject_subscriptions: bool,
    /// Negotiated write size reported on connect.
    pub max_write_len: Option<usize>,
}

impl Default for FirmwareBehavior {
    fn default() -> Self {
        Self {
            uwb_config: vec![0x01, 0x02, 0x03, 0x04, 0x05, 0x06],
            corrupt_configuration: false,
            refuse_connections: false,
            reject_subscriptions: false,
            max_write_len: Some(128),
        }
    }
}

#[derive(Debug, Default)]
struct SimState {
    connected: bool,
    received: Vec<Vec<u8>>,
    scans: usize,
    connects: usize,
}

/// A single accessory reachable over a simulated radio.
#[derive(Debug, Clone)]
pub struct SimulatedAccessory {
    peripheral: PeripheralId,
    name: String,
    behavior: FirmwareBehavior,
    mailbox: Mailbox,
    state: Arc<Mutex<SimState>>,
}

impl SimulatedAccessory {
    /// Create an accessory that answers into `mailbox`.
    pub fn new(
        peripheral: PeripheralId,
        name: impl Into<String>,
        behavior: FirmwareBehavior,
        mailbox: Mailbox,
    ) -> Self {
        Self {
            peripheral,
            name: name.into(),
            behavior,
            mailbox,
            state: Arc::new(Mutex::new(SimState::default())),
        }
    }

    /// Radio identifier.
    #[must_use]
    pub const fn peripheral(&self) -> &PeripheralId {
        &self.peripheral
    }

    /// Every frame written to the accessory, in order.
    #[must_use]
    pub fn received(&self) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .map(|state| state.received.clone())
            .unwrap_or_default()
    }

    /// How many scans were started.
    #[must_use]
    pub fn scan_count(&self) -> usize {
        self.state.lock().map(|state| state.scans).unwrap_or_default()
    }

    /// How many connection attempts reached the accessory.
    #[must_use]
    pub fn connect_count(&self) -> usize {
        self.state.lock().map(|state| state.connects).unwrap_or_default()
    }

    /// Whether the accessory believes it is connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state.lock().is_ok_and(|state| state.connected)
    }

    /// Simulate the accessory walking out of range.
    pub fn drop_connection(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.connected = false;
        }
        self.emit(RadioEvent::Disconnected {
            peripheral: self.peripheral.clone(),
        });
    }

    fn check(&self, peripheral: &PeripheralId) -> Result<()> {
        if *peripheral == self.peripheral {
            Ok(())
        } else {
            Err(BubbleError::DeviceNotFound(peripheral.to_string()))
        }
    }

    fn require_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(BubbleError::BluetoothFailed(format!(
                "{} is not connected",
                self.peripheral
            )))
        }
    }

    fn emit(&self, event: RadioEvent) {
        self.mailbox.post(Event::Radio(event));
    }

    fn notify(&self, bytes: Vec<u8>) {
        self.emit(RadioEvent::Value {
            peripheral: self.peripheral.clone(),
            bytes,
        });
    }

    fn configuration_frame(&self) -> Vec<u8> {
        let config = AccessoryConfiguration {
            major_version: 1,
            minor_version: 0,
            preferred_update_rate: 10,
            uwb_config: self.behavior.uwb_config.clone(),
        };
        let mut frame = vec![0x01];
        let mut payload = config.to_bytes();
        if self.behavior.corrupt_configuration {
            payload.truncate(5);
        }
        frame.extend(payload);
        frame
    }
}

impl Radio for SimulatedAccessory {
    fn start_scan(&self) -> Result<()> {
        if let Ok(mut state) = self.state.lock() {
            state.scans += 1;
        }
        self.emit(RadioEvent::Discovered {
            peripheral: self.peripheral.clone(),
            name: Some(self.name.clone()),
        });
        Ok(())
    }

    fn connect(&self, peripheral: &PeripheralId) -> Result<()> {
        self.check(peripheral)?;
        if let Ok(mut state) = self.state.lock() {
            state.connects += 1;
        }
        if self.behavior.refuse_connections {
            self.emit(RadioEvent::ConnectFailed {
                peripheral: peripheral.clone(),
            });
            return Ok(());
        }
        if let Ok(mut state) = self.state.lock() {
            state.connected = true;
        }
        self.emit(RadioEvent::Connected {
            peripheral: peripheral.clone(),
            max_write_len: self.behavior.max_write_len,
        });
        self.emit(RadioEvent::CharacteristicsResolved {
            peripheral: peripheral.clone(),
        });
        Ok(())
    }

    fn disconnect(&self, peripheral: &PeripheralId) -> Result<()> {
        self.check(peripheral)?;
        if let Ok(mut state) = self.state.lock() {
            state.connected = false;
        }
        Ok(())
    }

    fn subscribe_and_sync(&self, peripheral: &PeripheralId) -> Result<()> {
        self.check(peripheral)?;
        self.require_connected()?;
        if self.behavior.reject_subscriptions {
            return Err(BubbleError::BluetoothFailed(format!(
                "{} refused notifications",
                self.peripheral
            )));
        }
        self.notify(vec![0x04]);
        Ok(())
    }

    fn write(&self, peripheral: &PeripheralId, frame: Vec<u8>) -> Result<()> {
        self.check(peripheral)?;
        self.require_connected()?;
        if let Ok(mut state) = self.state.lock() {
            state.received.push(frame.clone());
        }
        match frame.first() {
            Some(0x0A) => self.notify(self.configuration_frame()),
            Some(0x0B) => self.notify(vec![0x02]),
            Some(0x0C) => self.notify(vec![0x03]),
            other => debug!(?other, "Simulated firmware ignoring frame"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mailbox;
    use crate::protocol::AccessoryMessage;

    fn accessory(behavior: FirmwareBehavior) -> (SimulatedAccessory, tokio::sync::mpsc::UnboundedReceiver<Event>) {
        let (mailbox, rx) = mailbox();
        let acc = SimulatedAccessory::new(PeripheralId::new("sim-1"), "Sim", behavior, mailbox);
        (acc, rx)
    }

    #[test]
    fn test_connect_reports_connected_then_characteristics() {
        let (acc, mut rx) = accessory(FirmwareBehavior::default());
        acc.connect(acc.peripheral()).unwrap();
        assert!(matches!(
            rx.try_recv().unwrap(),
            Event::Radio(RadioEvent::Connected { max_write_len: Some(128), .. })
        ));
        assert!(matches!(
            rx.try_recv().unwrap(),
            Event::Radio(RadioEvent::CharacteristicsResolved { .. })
        ));
    }

    #[test]
    fn test_initialize_answers_with_parseable_configuration() {
        let (acc, mut rx) = accessory(FirmwareBehavior::default());
        acc.connect(acc.peripheral()).unwrap();
        while rx.try_recv().is_ok() {}

        acc.write(acc.peripheral(), vec![0x0A]).unwrap();
        let Event::Radio(RadioEvent::Value { bytes, .. }) = rx.try_recv().unwrap() else {
            panic!("expected a notification");
        };
        match AccessoryMessage::decode(&bytes).unwrap() {
            AccessoryMessage::ConfigurationData(payload) => {
                let config = AccessoryConfiguration::parse(&payload).unwrap();
                assert_eq!(config.uwb_config, FirmwareBehavior::default().uwb_config);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn test_corrupt_configuration_fails_to_parse() {
        let (acc, mut rx) = accessory(FirmwareBehavior {
            corrupt_configuration: true,
            ..FirmwareBehavior::default()
        });
        acc.connect(acc.peripheral()).unwrap();
        while rx.try_recv().is_ok() {}

        acc.write(acc.peripheral(), vec![0x0A]).unwrap();
        let Event::Radio(RadioEvent::Value { bytes, .. }) = rx.try_recv().unwrap() else {
            panic!("expected a notification");
        };
        let AccessoryMessage::ConfigurationData(payload) = AccessoryMessage::decode(&bytes).unwrap() else {
            panic!("expected configuration data");
        };
        assert!(AccessoryConfiguration::parse(&payload).is_err());
    }

    #[test]
    fn test_write_requires_connection() {
        let (acc, _rx) = accessory(FirmwareBehavior::default());
        assert!(acc.write(acc.peripheral(), vec![0x0A]).is_err());
        assert!(acc
            .connect(&PeripheralId::new("someone-else"))
            .unwrap_err()
            .is_transport_error());
    }

    #[test]
    fn test_refused_connection() {
        let (acc, mut rx) = accessory(FirmwareBehavior {
            refuse_connections: true,
            ..FirmwareBehavior::default()
        });
        acc.connect(acc.peripheral()).unwrap();
        assert!(matches!(
            rx.try_recv().unwrap(),
            Event::Radio(RadioEvent::ConnectFailed { .. })
        ));
        assert!(!acc.is_connected());
    }
}
