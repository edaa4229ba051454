use crate::engine::EngineGateway;
use crate::error::ErrorKind;
use crate::model::{
    Container, Image, Network, ResourceClass, SystemInfo, SystemUsageReading, VersionInfo, Volume,
    filter_items,
};
use chrono::{DateTime, Local};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub enum LoadState {
    #[default]
    Idle,
    Refreshing,
    Error,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClassState {
    pub status: LoadState,
    pub last_error: Option<ErrorKind>,
    pub last_refresh: Option<DateTime<Local>>,
}

impl ClassState {
    pub fn loading(&self) -> bool {
        self.status == LoadState::Refreshing
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StoreAction {
    RefreshStarted(ResourceClass),
    ContainersLoaded(Vec<Container>),
    ImagesLoaded(Vec<Image>),
    VolumesLoaded(Vec<Volume>),
    NetworksLoaded(Vec<Network>),
    RefreshFailed {
        class: ResourceClass,
        error: ErrorKind,
    },
    /// A refresh was dropped before its fetch finished; restores the status
    /// the class had before it started.
    RefreshAbandoned {
        class: ResourceClass,
        previous: LoadState,
    },
    SetSearchTerm(String),
    SystemInfoLoaded {
        info: SystemInfo,
        version: Option<VersionInfo>,
    },
    SystemUsageSampled(SystemUsageReading),
}

impl StoreAction {
    pub fn class(&self) -> Option<ResourceClass> {
        match self {
            Self::RefreshStarted(class)
            | Self::RefreshFailed { class, .. }
            | Self::RefreshAbandoned { class, .. } => Some(*class),
            Self::ContainersLoaded(_) => Some(ResourceClass::Containers),
            Self::ImagesLoaded(_) => Some(ResourceClass::Images),
            Self::VolumesLoaded(_) => Some(ResourceClass::Volumes),
            Self::NetworksLoaded(_) => Some(ResourceClass::Networks),
            Self::SetSearchTerm(_)
            | Self::SystemInfoLoaded { .. }
            | Self::SystemUsageSampled(_) => None,
        }
    }
}

/// One class's items after the search term is applied.
#[derive(Debug, Clone, PartialEq)]
pub enum Collection {
    Containers(Vec<Container>),
    Images(Vec<Image>),
    Volumes(Vec<Volume>),
    Networks(Vec<Network>),
}

impl Collection {
    pub fn len(&self) -> usize {
        match self {
            Self::Containers(items) => items.len(),
            Self::Images(items) => items.len(),
            Self::Volumes(items) => items.len(),
            Self::Networks(items) => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreState {
    pub containers: Vec<Container>,
    pub images: Vec<Image>,
    pub volumes: Vec<Volume>,
    pub networks: Vec<Network>,
    pub connected: bool,
    pub search_term: String,
    pub system_info: Option<SystemInfo>,
    pub version: Option<VersionInfo>,
    pub system_usage: Option<SystemUsageReading>,
    classes: [ClassState; 4],
}

impl StoreState {
    pub fn reduce(&mut self, action: StoreAction) {
        match action {
            StoreAction::RefreshStarted(class) => {
                self.classes[class.index()].status = LoadState::Refreshing;
            }
            StoreAction::ContainersLoaded(items) => {
                self.containers = items;
                self.connected = true;
                self.mark_loaded(ResourceClass::Containers);
            }
            StoreAction::ImagesLoaded(items) => {
                self.images = items;
                self.mark_loaded(ResourceClass::Images);
            }
            StoreAction::VolumesLoaded(items) => {
                self.volumes = items;
                self.mark_loaded(ResourceClass::Volumes);
            }
            StoreAction::NetworksLoaded(items) => {
                self.networks = items;
                self.mark_loaded(ResourceClass::Networks);
            }
            StoreAction::RefreshFailed { class, error } => {
                let state = &mut self.classes[class.index()];
                state.status = LoadState::Error;
                state.last_error = Some(error);
                if class == ResourceClass::Containers {
                    self.connected = false;
                }
            }
            StoreAction::RefreshAbandoned { class, previous } => {
                let state = &mut self.classes[class.index()];
                if state.status == LoadState::Refreshing {
                    state.status = previous;
                }
            }
            StoreAction::SetSearchTerm(term) => self.search_term = term,
            StoreAction::SystemInfoLoaded { info, version } => {
                self.system_info = Some(info);
                if version.is_some() {
                    self.version = version;
                }
            }
            StoreAction::SystemUsageSampled(reading) => self.system_usage = Some(reading),
        }
    }

    fn mark_loaded(&mut self, class: ResourceClass) {
        let state = &mut self.classes[class.index()];
        state.status = LoadState::Idle;
        state.last_error = None;
        state.last_refresh = Some(Local::now());
    }

    pub fn class_state(&self, class: ResourceClass) -> &ClassState {
        &self.classes[class.index()]
    }

    pub fn loading(&self) -> bool {
        self.classes.iter().any(ClassState::loading)
    }

    /// First class error in display order, for a single status line.
    pub fn last_error(&self) -> Option<&ErrorKind> {
        ResourceClass::ALL
            .iter()
            .find_map(|class| self.classes[class.index()].last_error.as_ref())
    }

    pub fn count(&self, class: ResourceClass) -> usize {
        match class {
            ResourceClass::Containers => self.containers.len(),
            ResourceClass::Images => self.images.len(),
            ResourceClass::Volumes => self.volumes.len(),
            ResourceClass::Networks => self.networks.len(),
        }
    }

    pub fn running_containers(&self) -> usize {
        self.containers
            .iter()
            .filter(|container| container.is_running())
            .count()
    }

    pub fn filter(&self, class: ResourceClass, term: &str) -> Collection {
        match class {
            ResourceClass::Containers => Collection::Containers(filter_items(&self.containers, term)),
            ResourceClass::Images => Collection::Images(filter_items(&self.images, term)),
            ResourceClass::Volumes => Collection::Volumes(filter_items(&self.volumes, term)),
            ResourceClass::Networks => Collection::Networks(filter_items(&self.networks, term)),
        }
    }

    pub fn filtered(&self, class: ResourceClass) -> Collection {
        self.filter(class, &self.search_term)
    }
}

#[derive(Default)]
struct RefreshGate {
    lock: Mutex<()>,
    started: AtomicU64,
}

/// Canonical mirror of engine state. Every write goes through `StoreAction`;
/// readers take snapshots or subscribe to changes.
pub struct ResourceStore {
    gateway: EngineGateway,
    state: watch::Sender<StoreState>,
    gates: [RefreshGate; 4],
}

impl ResourceStore {
    pub fn new(gateway: EngineGateway) -> Arc<Self> {
        let (state, _) = watch::channel(StoreState::default());
        Arc::new(Self {
            gateway,
            state,
            gates: Default::default(),
        })
    }

    pub fn gateway(&self) -> &EngineGateway {
        &self.gateway
    }

    pub fn snapshot(&self) -> StoreState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<StoreState> {
        self.state.subscribe()
    }

    pub(crate) fn dispatch(&self, action: StoreAction) {
        self.state.send_modify(|state| state.reduce(action));
    }

    pub fn set_search_term(&self, term: impl Into<String>) {
        self.dispatch(StoreAction::SetSearchTerm(term.into()));
    }

    pub fn record_usage(&self, reading: SystemUsageReading) {
        self.dispatch(StoreAction::SystemUsageSampled(reading));
    }

    pub fn filtered(&self, class: ResourceClass) -> Collection {
        self.state.borrow().filtered(class)
    }

    /// Fetches one class and replaces it wholesale. Calls for the same class
    /// never overlap; a caller that queued behind a refresh which started
    /// after its own request returns without fetching again.
    pub async fn refresh(&self, class: ResourceClass) {
        let gate = &self.gates[class.index()];
        let requested = gate.started.load(Ordering::SeqCst);
        let _guard = gate.lock.lock().await;
        if gate.started.load(Ordering::SeqCst) > requested {
            debug!("{class} refresh already covered by a newer fetch");
            return;
        }
        gate.started.fetch_add(1, Ordering::SeqCst);

        let previous = self.state.borrow().class_state(class).status;
        self.dispatch(StoreAction::RefreshStarted(class));
        let mut in_flight = InFlight {
            store: self,
            class,
            previous,
            settled: false,
        };
        let action = match self.fetch(class).await {
            Ok(action) => action,
            Err(error) => {
                warn!("{class} refresh failed: {error}");
                StoreAction::RefreshFailed { class, error }
            }
        };
        in_flight.settled = true;
        self.dispatch(action);
    }

    async fn fetch(&self, class: ResourceClass) -> Result<StoreAction, ErrorKind> {
        let action = match class {
            ResourceClass::Containers => {
                StoreAction::ContainersLoaded(self.gateway.list_containers(true).await?)
            }
            ResourceClass::Images => StoreAction::ImagesLoaded(self.gateway.list_images().await?),
            ResourceClass::Volumes => {
                StoreAction::VolumesLoaded(self.gateway.list_volumes().await?)
            }
            ResourceClass::Networks => {
                StoreAction::NetworksLoaded(self.gateway.list_networks().await?)
            }
        };
        debug!("{class} refreshed");
        Ok(action)
    }

    pub async fn refresh_all(&self) {
        for class in ResourceClass::ALL {
            self.refresh(class).await;
        }
    }

    /// Re-syncs the class a successful command touched. The command's own
    /// outcome is already decided; a failed refresh only lands in `last_error`.
    pub async fn apply_mutation_result(&self, class: ResourceClass) {
        self.refresh(class).await;
    }

    pub async fn refresh_system_info(&self) -> Result<SystemInfo, ErrorKind> {
        let info = self.gateway.system_info().await?;
        let version = match self.gateway.version().await {
            Ok(version) => Some(version),
            Err(error) => {
                debug!("version lookup failed: {error}");
                None
            }
        };
        self.dispatch(StoreAction::SystemInfoLoaded {
            info: info.clone(),
            version,
        });
        Ok(info)
    }

    /// Refreshes every class on a fixed cadence, starting immediately.
    pub fn spawn_poller(self: &Arc<Self>, every: Duration) -> PollerHandle {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let store = Arc::clone(self);

        let task = tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    _ = cancelled.cancelled() => break,
                    _ = ticker.tick() => store.refresh_all().await,
                }
            }
            debug!("store poller stopped");
        });

        PollerHandle::new(token, task)
    }
}

#[derive(Debug)]
pub struct PollerHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl PollerHandle {
    pub(crate) fn new(token: CancellationToken, task: JoinHandle<()>) -> Self {
        Self { token, task }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub async fn stopped(self) {
        self.token.cancel();
        if let Err(error) = self.task.await {
            debug!("poller ended abnormally: {error}");
        }
    }
}

/// Resets a class out of `Refreshing` when the refresh future is dropped
/// mid-fetch.
struct InFlight<'a> {
    store: &'a ResourceStore,
    class: ResourceClass,
    previous: LoadState,
    settled: bool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.settled {
            debug!("{} refresh dropped before completion", self.class);
            self.store.dispatch(StoreAction::RefreshAbandoned {
                class: self.class,
                previous: self.previous,
            });
        }
    }
}
