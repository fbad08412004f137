//! Application state shared across handlers.
//!
//! The engine itself runs as a [`Coordinator`] task; handlers only read its
//! published snapshots and post events through the [`EngineHandle`].

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use bubble_core::{
    mailbox, ChannelRanging, Config, Coordinator, CoordinatorDeps, EngineHandle, Event,
    FileEnforcement, InMemoryTaskSource, JsonTaskSource, Mailbox, Radio, RangingFeed, Storage,
    SystemClock, TaskSource, TokioBackgroundScheduler,
};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::info;

/// Shared application state.
pub type SharedState = Arc<AppState>;

/// Everything the handlers need.
#[derive(Debug)]
pub struct AppState {
    /// Validated configuration the engine was started with.
    pub config: Config,
    /// Handle to the running coordinator.
    pub engine: EngineHandle,
    /// Session logs and snapshots.
    pub storage: Storage,
    /// Ranging backend, used for permission probes.
    pub ranging: ChannelRanging,
    /// Where externally measured distances are pushed.
    pub feed: RangingFeed,
    started_at: Instant,
}

/// A started engine plus the task running it.
pub struct Running {
    /// State for the router.
    pub state: SharedState,
    /// The coordinator task; completes after [`Event::Shutdown`].
    pub coordinator: JoinHandle<()>,
}

impl AppState {
    /// Open the radio selected at build time and start the engine.
    ///
    /// # Errors
    ///
    /// Returns an error if the radio, storage or configuration is unusable.
    pub async fn start(config: Config) -> anyhow::Result<Running> {
        let (mailbox, inbox) = mailbox();
        let radio = open_radio(&config, mailbox.clone()).await?;
        Self::start_with_radio(config, radio, (mailbox, inbox))
    }

    /// Start the engine around an already opened radio.
    ///
    /// # Errors
    ///
    /// Returns an error if storage or configuration is unusable.
    pub fn start_with_radio(
        config: Config,
        radio: Arc<dyn Radio>,
        (mailbox, inbox): (Mailbox, UnboundedReceiver<Event>),
    ) -> anyhow::Result<Running> {
        let storage = Storage::from_config(&config.storage).context("resolving data directory")?;
        let tz = config.system.tz();

        let tasks: Arc<dyn TaskSource> = match &config.policy.tasks_path {
            Some(path) => {
                info!(path = %path.display(), "Reading tasks from export file");
                Arc::new(JsonTaskSource::new(path, tz))
            }
            None => Arc::new(InMemoryTaskSource::new(Vec::new(), tz)),
        };
        let enforcement_path = config
            .policy
            .enforcement_path
            .clone()
            .unwrap_or_else(|| storage.data_dir().join("shield.json"));
        let ranging = ChannelRanging::new();

        let deps = CoordinatorDeps {
            config: config.clone(),
            radio,
            ranging: Arc::new(ranging.clone()),
            tasks,
            enforcement: Arc::new(FileEnforcement::new(enforcement_path)),
            storage: storage.clone(),
            scheduler: Arc::new(TokioBackgroundScheduler::new(mailbox.clone())),
            clock: Arc::new(SystemClock),
        };
        let (coordinator, engine) =
            Coordinator::new(deps, (mailbox, inbox)).context("building coordinator")?;
        let coordinator = tokio::spawn(coordinator.run());

        let feed = ranging.feed();
        Ok(Running {
            state: Arc::new(Self {
                config,
                engine,
                storage,
                ranging,
                feed,
                started_at: Instant::now(),
            }),
            coordinator,
        })
    }

    /// Seconds since the engine started.
    #[must_use]
    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

#[cfg(feature = "bluetooth")]
#[cfg(not(feature = "mock-bluetooth"))]
async fn open_radio(config: &Config, mailbox: Mailbox) -> anyhow::Result<Arc<dyn Radio>> {
    let radio = bubble_core::BluerRadio::start(config.bluetooth.clone(), mailbox)
        .await
        .context("opening Bluetooth adapter")?;
    Ok(Arc::new(radio))
}

#[cfg(any(feature = "mock-bluetooth", not(feature = "bluetooth")))]
#[allow(clippy::unused_async)]
async fn open_radio(_config: &Config, mailbox: Mailbox) -> anyhow::Result<Arc<dyn Radio>> {
    use bubble_core::{FirmwareBehavior, PeripheralId, RadioEvent, SimulatedAccessory};

    info!("Using simulated accessory radio");
    let radio = SimulatedAccessory::new(
        PeripheralId::new("00:00:00:00:B0:B0"),
        "Simulated Tag",
        FirmwareBehavior::default(),
        mailbox.clone(),
    );
    mailbox.post(Event::Radio(RadioEvent::PoweredOn));
    Ok(Arc::new(radio))
}
