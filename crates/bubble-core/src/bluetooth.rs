//! Bluetooth Low Energy central backed by BlueZ.
//!
//! [`BluerRadio`] implements [`Radio`](crate::engine::Radio) on Linux through
//! the `bluer` crate. Commands are queued to a driver task that owns the
//! adapter; each connected accessory gets its own task so writes to one
//! peripheral go out in order while a slow peripheral never blocks another.
//! Outcomes are posted back to the coordinator as
//! [`RadioEvent`](crate::engine::RadioEvent)s.

use thiserror::Error;

use crate::error::BubbleError;

/// Errors raised by the Bluetooth layer.
#[derive(Debug, Error)]
pub enum BluetoothError {
    /// No usable adapter.
    #[error("Bluetooth adapter not found")]
    AdapterNotFound,

    /// The adapter is present but powered off.
    #[error("Bluetooth adapter is powered off")]
    AdapterPoweredOff,

    /// The peripheral identifier does not name a known device.
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// The accessory does not expose a required characteristic.
    #[error("characteristic {0} not found")]
    CharacteristicNotFound(uuid::Uuid),

    /// The driver task has exited.
    #[error("Bluetooth driver stopped")]
    DriverStopped,

    /// BlueZ reported an error.
    #[cfg(feature = "bluetooth")]
    #[error("BlueZ error: {0}")]
    Bluez(#[from] bluer::Error),
}

/// Result type for Bluetooth operations.
pub type BluetoothResult<T> = std::result::Result<T, BluetoothError>;

impl From<BluetoothError> for BubbleError {
    fn from(err: BluetoothError) -> Self {
        match err {
            BluetoothError::AdapterNotFound => Self::BluetoothAdapterNotFound,
            BluetoothError::AdapterPoweredOff => Self::BluetoothAdapterPoweredOff,
            BluetoothError::DeviceNotFound(id) => Self::DeviceNotFound(id),
            other => Self::BluetoothFailed(other.to_string()),
        }
    }
}

#[cfg(feature = "bluetooth")]
pub use bluez::BluerRadio;

#[cfg(feature = "bluetooth")]
mod bluez {
    use std::collections::{HashMap, HashSet};
    use std::pin::Pin;

    use anyhow::Context;
    use bluer::gatt::remote::Characteristic;
    use bluer::{
        Adapter, AdapterEvent, AdapterProperty, Address, Device, DeviceEvent, DeviceProperty,
        DiscoveryFilter, DiscoveryTransport,
    };
    use futures::{Stream, StreamExt};
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;
    use tracing::{debug, info, warn};

    use super::{BluetoothError, BluetoothResult};
    use crate::config::BluetoothConfig;
    use crate::engine::{Event, Mailbox, Radio, RadioEvent};
    use crate::error::Result;
    use crate::types::PeripheralId;

    type Notifications = Pin<Box<dyn Stream<Item = Vec<u8>> + Send>>;

    #[derive(Debug)]
    enum Command {
        Scan,
        Connect(PeripheralId),
        Disconnect(PeripheralId),
        SubscribeAndSync(PeripheralId),
        Write(PeripheralId, Vec<u8>),
    }

    #[derive(Debug)]
    enum LinkCommand {
        SubscribeAndSync,
        Write(Vec<u8>),
        Disconnect,
    }

    /// BlueZ-backed radio.
    #[derive(Debug, Clone)]
    pub struct BluerRadio {
        commands: mpsc::UnboundedSender<Command>,
    }

    impl BluerRadio {
        /// Open the configured adapter and start the driver task.
        ///
        /// Posts [`RadioEvent::PoweredOn`] or [`RadioEvent::PoweredOff`] once
        /// the adapter state is known, and again on every power change.
        ///
        /// # Errors
        ///
        /// Returns an error if BlueZ is unreachable or the adapter is missing.
        pub async fn start(config: BluetoothConfig, mailbox: Mailbox) -> BluetoothResult<Self> {
            let session = bluer::Session::new().await?;
            let adapter = match &config.adapter_name {
                Some(name) => session
                    .adapter(name)
                    .map_err(|_| BluetoothError::AdapterNotFound)?,
                None => session
                    .default_adapter()
                    .await
                    .map_err(|_| BluetoothError::AdapterNotFound)?,
            };
            let powered = adapter.is_powered().await?;
            info!(adapter = adapter.name(), powered, "Using Bluetooth adapter");

            let power_events = adapter.events().await?;
            tokio::spawn(watch_power(power_events, mailbox.clone()));
            mailbox.post(Event::Radio(if powered {
                RadioEvent::PoweredOn
            } else {
                RadioEvent::PoweredOff
            }));

            let (tx, rx) = mpsc::unbounded_channel();
            let driver = Driver {
                adapter,
                config,
                mailbox,
                links: HashMap::new(),
                scan: None,
            };
            tokio::spawn(driver.run(rx));
            Ok(Self { commands: tx })
        }

        fn send(&self, command: Command) -> Result<()> {
            self.commands
                .send(command)
                .map_err(|_| BluetoothError::DriverStopped.into())
        }
    }

    impl Radio for BluerRadio {
        fn start_scan(&self) -> Result<()> {
            self.send(Command::Scan)
        }

        fn connect(&self, peripheral: &PeripheralId) -> Result<()> {
            self.send(Command::Connect(peripheral.clone()))
        }

        fn disconnect(&self, peripheral: &PeripheralId) -> Result<()> {
            self.send(Command::Disconnect(peripheral.clone()))
        }

        fn subscribe_and_sync(&self, peripheral: &PeripheralId) -> Result<()> {
            self.send(Command::SubscribeAndSync(peripheral.clone()))
        }

        fn write(&self, peripheral: &PeripheralId, frame: Vec<u8>) -> Result<()> {
            self.send(Command::Write(peripheral.clone(), frame))
        }
    }

    async fn watch_power(
        events: impl Stream<Item = AdapterEvent> + Send + 'static,
        mailbox: Mailbox,
    ) {
        let mut events = Box::pin(events);
        while let Some(event) = events.next().await {
            if let AdapterEvent::PropertyChanged(AdapterProperty::Powered(powered)) = event {
                let event = if powered {
                    RadioEvent::PoweredOn
                } else {
                    RadioEvent::PoweredOff
                };
                if !mailbox.post(Event::Radio(event)) {
                    break;
                }
            }
        }
    }

    struct Driver {
        adapter: Adapter,
        config: BluetoothConfig,
        mailbox: Mailbox,
        links: HashMap<PeripheralId, mpsc::UnboundedSender<LinkCommand>>,
        scan: Option<JoinHandle<()>>,
    }

    impl Driver {
        async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
            while let Some(command) = commands.recv().await {
                self.links.retain(|_, tx| !tx.is_closed());
                match command {
                    Command::Scan => self.scan().await,
                    Command::Connect(peripheral) => self.connect(peripheral),
                    Command::Disconnect(peripheral) => self.forward(&peripheral, LinkCommand::Disconnect),
                    Command::SubscribeAndSync(peripheral) => {
                        self.forward(&peripheral, LinkCommand::SubscribeAndSync);
                    }
                    Command::Write(peripheral, frame) => {
                        self.forward(&peripheral, LinkCommand::Write(frame));
                    }
                }
            }
            if let Some(scan) = self.scan.take() {
                scan.abort();
            }
            debug!("Bluetooth driver stopped");
        }

        async fn scan(&mut self) {
            if self.scan.as_ref().is_some_and(|task| !task.is_finished()) {
                return;
            }
            let filter = DiscoveryFilter {
                uuids: HashSet::from([self.config.service_uuid]),
                transport: DiscoveryTransport::Le,
                ..DiscoveryFilter::default()
            };
            if let Err(e) = self.adapter.set_discovery_filter(filter).await {
                warn!(error = %e, "Could not set discovery filter");
            }
            match self.adapter.discover_devices().await {
                Ok(events) => {
                    info!("Scanning for accessories");
                    self.scan = Some(tokio::spawn(report_discoveries(
                        self.adapter.clone(),
                        events,
                        self.mailbox.clone(),
                    )));
                }
                Err(e) => warn!(error = %e, "Could not start discovery"),
            }
        }

        fn connect(&mut self, peripheral: PeripheralId) {
            if self.links.contains_key(&peripheral) {
                debug!(%peripheral, "Connection task already running");
                return;
            }
            let device = match device_for(&self.adapter, &peripheral) {
                Ok(device) => device,
                Err(e) => {
                    warn!(%peripheral, error = %e, "Cannot connect");
                    self.mailbox
                        .post(Event::Radio(RadioEvent::ConnectFailed { peripheral }));
                    return;
                }
            };
            let (tx, rx) = mpsc::unbounded_channel();
            self.links.insert(peripheral.clone(), tx);
            tokio::spawn(
                Connection {
                    peripheral,
                    device,
                    config: self.config.clone(),
                    mailbox: self.mailbox.clone(),
                }
                .run(rx),
            );
        }

        fn forward(&self, peripheral: &PeripheralId, command: LinkCommand) {
            match self.links.get(peripheral) {
                Some(tx) => {
                    if tx.send(command).is_err() {
                        debug!(%peripheral, "Connection task gone");
                    }
                }
                None => debug!(%peripheral, ?command, "No connection for command"),
            }
        }
    }

    fn device_for(adapter: &Adapter, peripheral: &PeripheralId) -> BluetoothResult<Device> {
        let address: Address = peripheral
            .as_str()
            .parse()
            .map_err(|_| BluetoothError::DeviceNotFound(peripheral.to_string()))?;
        Ok(adapter.device(address)?)
    }

    async fn report_discoveries(
        adapter: Adapter,
        events: impl Stream<Item = AdapterEvent> + Send + 'static,
        mailbox: Mailbox,
    ) {
        let mut events = Box::pin(events);
        while let Some(event) = events.next().await {
            let AdapterEvent::DeviceAdded(address) = event else {
                continue;
            };
            let name = match adapter.device(address) {
                Ok(device) => device.name().await.ok().flatten(),
                Err(_) => None,
            };
            debug!(%address, ?name, "Discovered accessory");
            let posted = mailbox.post(Event::Radio(RadioEvent::Discovered {
                peripheral: PeripheralId::new(address.to_string()),
                name,
            }));
            if !posted {
                break;
            }
        }
    }

    struct Characteristics {
        sync: Characteristic,
        rx: Characteristic,
        tx: Characteristic,
    }

    struct Connection {
        peripheral: PeripheralId,
        device: Device,
        config: BluetoothConfig,
        mailbox: Mailbox,
    }

    impl Connection {
        async fn run(self, mut commands: mpsc::UnboundedReceiver<LinkCommand>) {
            if let Err(e) = self.device.connect().await {
                warn!(peripheral = %self.peripheral, error = %e, "Connect failed");
                self.emit(RadioEvent::ConnectFailed {
                    peripheral: self.peripheral.clone(),
                });
                return;
            }

            let chars = match self.resolve().await {
                Ok(chars) => chars,
                Err(e) => {
                    warn!(peripheral = %self.peripheral, "Accessory service incomplete: {e:#}");
                    self.emit(RadioEvent::Connected {
                        peripheral: self.peripheral.clone(),
                        max_write_len: None,
                    });
                    self.close().await;
                    return;
                }
            };
            let max_write_len = match chars.rx.write_io().await {
                Ok(writer) => Some(writer.mtu()),
                Err(e) => {
                    debug!(peripheral = %self.peripheral, error = %e, "MTU unavailable");
                    None
                }
            };
            self.emit(RadioEvent::Connected {
                peripheral: self.peripheral.clone(),
                max_write_len,
            });
            self.emit(RadioEvent::CharacteristicsResolved {
                peripheral: self.peripheral.clone(),
            });

            let mut device_events = match self.device.events().await {
                Ok(events) => Box::pin(events),
                Err(e) => {
                    warn!(peripheral = %self.peripheral, error = %e, "Cannot watch connection");
                    self.close().await;
                    return;
                }
            };
            let mut notifications: Option<Notifications> = None;

            loop {
                tokio::select! {
                    command = commands.recv() => match command {
                        Some(LinkCommand::SubscribeAndSync) => {
                            match self.subscribe_and_sync(&chars).await {
                                Ok(stream) => notifications = Some(stream),
                                Err(e) => {
                                    warn!(peripheral = %self.peripheral, "Subscribe failed: {e:#}");
                                    self.close().await;
                                    return;
                                }
                            }
                        }
                        Some(LinkCommand::Write(frame)) => {
                            if let Err(e) = chars.rx.write(&frame).await {
                                warn!(peripheral = %self.peripheral, error = %e, "Write failed");
                            }
                        }
                        Some(LinkCommand::Disconnect) | None => {
                            if let Err(e) = self.device.disconnect().await {
                                debug!(peripheral = %self.peripheral, error = %e, "Disconnect failed");
                            }
                            return;
                        }
                    },
                    bytes = next_notification(&mut notifications) => match bytes {
                        Some(bytes) => self.emit(RadioEvent::Value {
                            peripheral: self.peripheral.clone(),
                            bytes,
                        }),
                        None => {
                            debug!(peripheral = %self.peripheral, "Notification stream ended");
                            notifications = None;
                        }
                    },
                    event = device_events.next() => match event {
                        Some(DeviceEvent::PropertyChanged(DeviceProperty::Connected(false))) | None => {
                            info!(peripheral = %self.peripheral, "Accessory disconnected");
                            self.emit(RadioEvent::Disconnected {
                                peripheral: self.peripheral.clone(),
                            });
                            return;
                        }
                        Some(_) => {}
                    },
                }
            }
        }

        async fn resolve(&self) -> anyhow::Result<Characteristics> {
            let mut found = HashMap::new();
            for service in self.device.services().await.context("listing services")? {
                if service.uuid().await.context("reading service uuid")? != self.config.service_uuid {
                    continue;
                }
                for characteristic in service
                    .characteristics()
                    .await
                    .context("listing characteristics")?
                {
                    let uuid = characteristic
                        .uuid()
                        .await
                        .context("reading characteristic uuid")?;
                    found.insert(uuid, characteristic);
                }
            }
            let mut take = |uuid| {
                found
                    .remove(&uuid)
                    .ok_or(BluetoothError::CharacteristicNotFound(uuid))
            };
            Ok(Characteristics {
                sync: take(self.config.sync_characteristic_uuid)?,
                rx: take(self.config.rx_characteristic_uuid)?,
                tx: take(self.config.tx_characteristic_uuid)?,
            })
        }

        async fn subscribe_and_sync(&self, chars: &Characteristics) -> anyhow::Result<Notifications> {
            let stream = chars
                .tx
                .notify()
                .await
                .context("subscribing to accessory notifications")?;
            chars
                .sync
                .read()
                .await
                .context("reading sync characteristic")?;
            Ok(Box::pin(stream))
        }

        async fn close(&self) {
            if let Err(e) = self.device.disconnect().await {
                debug!(peripheral = %self.peripheral, error = %e, "Disconnect failed");
            }
            self.emit(RadioEvent::Disconnected {
                peripheral: self.peripheral.clone(),
            });
        }

        fn emit(&self, event: RadioEvent) {
            self.mailbox.post(Event::Radio(event));
        }
    }

    async fn next_notification(notifications: &mut Option<Notifications>) -> Option<Vec<u8>> {
        match notifications {
            Some(stream) => stream.next().await,
            None => std::future::pending().await,
        }
    }
}
