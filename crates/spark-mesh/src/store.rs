//! # 清单存储（DescriptionStore）
//!
//! ## 定位（Why）
//! - 保存已知对端的清单，是路由表与依赖跟踪的唯一数据来源；
//! - 同时记录本地会话的域名、会话 ID 与安全模式，供地址构造使用。
//!
//! ## 契约（What）
//! - [`DescriptionStore::ensure_loaded`]：未连接时返回 `NotConnected`；已加载时立即返回；
//!   否则并发调用合并为一次加载（见 [`SingleFlight`]）；
//! - 独立会话：拉取一份清单，标记为 `is_self` 并作为唯一条目；
//! - 集群：并行拉取每个对端的清单后汇合；本对端的清单只用于确定域名，不作为条目插入，
//!   因为出站调用按域名寻址集群，而非按对端身份；
//! - 清单报告 `initializing: true` 时按固定间隔重试，直到变为 `false`；
//! - 本地重连：清空清单、路由表与会话信息，并以 `SessionReset` 拒绝排队的加载等待者；
//! - 对端到达/离开：只增量维护该对端的条目与路由候选，不触碰无关缓存；
//! - 完整加载提交时清空路由表，加载完成前 [`DescriptionStore::resolve`] 不构建任何缓存条目。
//!
//! ## 并发（How）
//! - 清单与会话信息由 `parking_lot::RwLock` 保护，任何 `.await` 前释放；
//! - `epoch` 在每次失效时递增，失效前发起的加载或对端拉取在提交时发现世代不符即丢弃结果；
//! - 每次对端离开记录一个递增的离开序号；加载与对端拉取在开始时记下当前序号，提交时丢弃
//!   在此之后离开的对端的清单。

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::join_all;
use parking_lot::RwLock;
use tracing::Instrument;

use crate::address::SecurityMode;
use crate::config::{ClientConfig, ClientProfile};
use crate::dependency::DependencyTracker;
use crate::description::{Description, ImplementationReference};
use crate::error::MeshError;
use crate::observability::discovery_span;
use crate::routing::{DescriptionSource, RoutingTable};
use crate::single_flight::SingleFlight;
use crate::transport::{DESCRIPTION_PATH, DataClient, MeshConnection, PeerHandle, Topology};

/// 本地会话的寻址信息。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SessionInfo {
    pub domain: String,
    pub session_id: String,
    pub mode: SecurityMode,
    pub username: Option<String>,
}

impl SessionInfo {
    /// 地址构造所需的作用域。
    pub fn scope(&self) -> crate::address::ExchangeScope<'_> {
        crate::address::ExchangeScope {
            domain: &self.domain,
            session_id: &self.session_id,
            mode: self.mode,
        }
    }
}

#[derive(Default)]
struct StoreState {
    descriptions: Vec<Arc<Description>>,
    session: Option<SessionInfo>,
    /// 对端名 → 最近一次离开时的序号。
    departures: HashMap<String, u64>,
    departure_seq: u64,
}

impl StoreState {
    fn departed_since(&self, name: &str, mark: u64) -> bool {
        self.departures.get(name).is_some_and(|seq| *seq > mark)
    }
}

/// 一次完整加载的结果，提交前不可见。
struct Loaded {
    descriptions: Vec<Arc<Description>>,
    session: SessionInfo,
}

/// 对端清单存储。
pub struct DescriptionStore {
    connection: Arc<dyn MeshConnection>,
    config: ClientConfig,
    state: RwLock<StoreState>,
    load: Arc<SingleFlight<MeshError>>,
    epoch: AtomicU64,
    routing: RoutingTable,
    tracker: Arc<DependencyTracker>,
}

impl DescriptionStore {
    pub fn new(
        connection: Arc<dyn MeshConnection>,
        config: ClientConfig,
        tracker: Arc<DependencyTracker>,
    ) -> Self {
        let routing = match config.profile() {
            ClientProfile::Standard => RoutingTable::new(config.version_matching()),
            ClientProfile::Light => RoutingTable::local_only(),
        };
        Self {
            connection,
            config,
            state: RwLock::new(StoreState::default()),
            load: Arc::new(SingleFlight::new()),
            epoch: AtomicU64::new(0),
            routing,
            tracker,
        }
    }

    /// 确保清单已加载。
    pub async fn ensure_loaded(self: &Arc<Self>) -> Result<(), MeshError> {
        if !self.connection.is_connected() {
            return Err(MeshError::NotConnected);
        }
        if self.config.profile() == ClientProfile::Light {
            return self.seed_light_session();
        }
        let this = Arc::clone(self);
        self.load
            .run(move || this.load_all(), MeshError::SessionReset)
            .await
    }

    /// 清单是否已完成加载。
    pub fn is_loaded(&self) -> bool {
        self.load.is_done()
    }

    /// 解析下一个实现（轮询）。
    ///
    /// 清单尚未加载完成（例如刚被重连清空）时返回 `SessionReset`，不缓存空结果。
    pub fn resolve(
        &self,
        component: &str,
        version_range: &str,
        method: &str,
    ) -> Result<ImplementationReference, MeshError> {
        if self.config.profile() == ClientProfile::Standard && !self.load.is_done() {
            return Err(MeshError::SessionReset);
        }
        self.routing.resolve(component, version_range, method, self)
    }

    pub fn routing(&self) -> &RoutingTable {
        &self.routing
    }

    /// 当前会话寻址信息；加载完成前为 `None`。
    pub fn session(&self) -> Option<SessionInfo> {
        self.state.read().session.clone()
    }

    pub fn domain(&self) -> Option<String> {
        self.state.read().session.as_ref().map(|session| session.domain.clone())
    }

    fn seed_light_session(&self) -> Result<(), MeshError> {
        if self.state.read().session.is_some() {
            return Ok(());
        }
        let domain = self.config.domain().ok_or(MeshError::NotConnected)?.to_owned();
        let session = self.local_session(domain)?;
        tracing::debug!(domain = %session.domain, session = %session.session_id, "light session seeded");
        self.state.write().session = Some(session);
        Ok(())
    }

    fn local_session(&self, domain: String) -> Result<SessionInfo, MeshError> {
        let descriptor = self
            .connection
            .client()
            .and_then(|client| client.session())
            .ok_or(MeshError::NotConnected)?;
        Ok(SessionInfo {
            domain,
            session_id: descriptor.id,
            mode: SecurityMode::from_secure_flag(descriptor.secure),
            username: descriptor.username,
        })
    }

    fn departure_mark(&self) -> u64 {
        self.state.read().departure_seq
    }

    async fn load_all(self: Arc<Self>) -> Result<(), MeshError> {
        let epoch = self.epoch.load(Ordering::SeqCst);
        let mark = self.departure_mark();
        let loaded = match self.connection.topology() {
            Topology::Standalone => {
                self.load_standalone()
                    .instrument(discovery_span("standalone"))
                    .await?
            }
            Topology::Cluster(peers) => {
                self.load_cluster(peers)
                    .instrument(discovery_span("cluster"))
                    .await?
            }
        };

        let Loaded {
            mut descriptions,
            session,
        } = loaded;
        let (snapshot, departed) = {
            let mut state = self.state.write();
            if self.epoch.load(Ordering::SeqCst) != epoch {
                tracing::debug!("discarding descriptions loaded before session reset");
                return Err(MeshError::SessionReset);
            }
            let fetched = descriptions.len();
            descriptions.retain(|description| {
                !description
                    .mesh_name
                    .as_deref()
                    .is_some_and(|name| state.departed_since(name, mark))
            });
            let departed = fetched - descriptions.len();
            state.descriptions = descriptions;
            state.session = Some(session);
            (state.descriptions.clone(), departed)
        };
        // 提交前构建的条目可能基于空清单，一律丢弃后按需重建。
        self.routing.clear();
        tracing::info!(descriptions = snapshot.len(), departed, "descriptions loaded");
        self.tracker.recheck(&snapshot);
        Ok(())
    }

    async fn load_standalone(&self) -> Result<Loaded, MeshError> {
        let client = self.connection.client().ok_or(MeshError::NotConnected)?;
        let descriptor = client.session().ok_or(MeshError::NotConnected)?;
        let description = self
            .fetch_description(client.as_ref(), &descriptor.name)
            .await?
            .with_peer(descriptor.name.clone(), None, true);
        let session = self.local_session(description.domain.clone())?;
        Ok(Loaded {
            descriptions: vec![Arc::new(description)],
            session,
        })
    }

    async fn load_cluster(&self, peers: Vec<PeerHandle>) -> Result<Loaded, MeshError> {
        let fetched = join_all(peers.iter().map(|peer| self.fetch_peer(peer))).await;

        let mut descriptions = Vec::with_capacity(fetched.len());
        let mut domain = None;
        for description in fetched {
            let description = description?;
            if description.is_self {
                domain = Some(description.domain);
                continue;
            }
            descriptions.push(Arc::new(description));
        }
        let domain = match domain {
            Some(domain) => domain,
            None => descriptions
                .first()
                .map(|description| description.domain.clone())
                .unwrap_or_default(),
        };
        let session = self.local_session(domain)?;
        Ok(Loaded {
            descriptions,
            session,
        })
    }

    async fn fetch_peer(&self, peer: &PeerHandle) -> Result<Description, MeshError> {
        let description = self.fetch_description(peer.client.as_ref(), &peer.name).await?;
        Ok(description.with_peer(peer.name.clone(), peer.url.clone(), peer.is_self))
    }

    /// 拉取单个清单；`initializing` 时按配置间隔重试。
    async fn fetch_description(
        &self,
        client: &dyn DataClient,
        peer: &str,
    ) -> Result<Description, MeshError> {
        let interval = self.config.initializing_retry_interval();
        loop {
            let manifest = client.get(DESCRIPTION_PATH).await?;
            let description = Description::from_manifest(manifest, peer)?;
            if !description.initializing {
                return Ok(description);
            }
            tracing::debug!(peer, retry_in = ?interval, "peer still initializing");
            tokio::time::sleep(interval).await;
        }
    }

    /// 对端到达：拉取其清单，追加到存储并扩展已缓存的路由键。
    ///
    /// 尚未发起过加载时不做任何事，后续的按需加载会从拓扑中读到该对端；
    /// 加载在途时先等待其完成，再以替换方式写入，避免与完整加载重复。
    pub async fn add_peer(self: &Arc<Self>, name: &str) -> Result<(), MeshError> {
        if self.config.profile() == ClientProfile::Light {
            return Ok(());
        }
        if !self.load.is_done() && !self.load.is_in_flight() {
            tracing::debug!(peer = name, "peer arrived before first load");
            return Ok(());
        }
        self.ensure_loaded().await?;

        let Some(peer) = self.connection.peer(name) else {
            tracing::warn!(peer = name, "arrived peer is no longer in the topology");
            return Ok(());
        };
        if peer.is_self {
            return Ok(());
        }
        let epoch = self.epoch.load(Ordering::SeqCst);
        let mark = self.departure_mark();
        let description = Arc::new(self.fetch_peer(&peer).await?);

        let snapshot = {
            let mut state = self.state.write();
            if self.epoch.load(Ordering::SeqCst) != epoch {
                return Err(MeshError::SessionReset);
            }
            if state.departed_since(name, mark) {
                tracing::debug!(peer = name, "peer departed while its description was fetched");
                return Ok(());
            }
            state
                .descriptions
                .retain(|known| known.mesh_name.as_deref() != Some(name));
            state.descriptions.push(Arc::clone(&description));
            state.descriptions.clone()
        };
        let appended = self.routing.extend_for_description(&description);
        tracing::info!(peer = name, appended, "peer description added");
        self.tracker.recheck(&snapshot);
        Ok(())
    }

    /// 对端离开：移除其清单并从路由候选中剔除。
    pub fn remove_peer(&self, name: &str) {
        let removed = {
            let mut state = self.state.write();
            state.departure_seq += 1;
            let seq = state.departure_seq;
            state.departures.insert(name.to_owned(), seq);
            let before = state.descriptions.len();
            state
                .descriptions
                .retain(|known| known.mesh_name.as_deref() != Some(name));
            before - state.descriptions.len()
        };
        let stripped = self.routing.strip_peer(name);
        tracing::info!(peer = name, removed, stripped, "peer description removed");
    }

    /// 本地会话失效：清空全部状态，拒绝排队的加载等待者。
    pub fn invalidate(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let rejected = self.load.reset(MeshError::SessionReset);
        {
            let mut state = self.state.write();
            state.descriptions.clear();
            state.session = None;
            state.departures.clear();
        }
        self.routing.clear();
        tracing::info!(rejected, "description cache invalidated");
    }
}

impl DescriptionSource for DescriptionStore {
    fn descriptions(&self) -> Vec<Arc<Description>> {
        self.state.read().descriptions.clone()
    }
}
