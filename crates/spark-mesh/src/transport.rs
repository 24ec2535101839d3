//! # 传输协作方契约
//!
//! ## 定位（Why）
//! - 本 crate 不实现传输：连接、认证与原始发布/订阅由外部的路径寻址数据同步客户端提供；
//! - 这里仅声明所消费的最窄接口，发现、路由与应答关联全部建立在它之上。
//!
//! ## 契约（What）
//! - [`DataClient`]：单个会话上的 `get`/`set`/`on`/`off`/`offPath` 原语与会话描述；
//! - [`MeshConnection`]：本地会话、集群拓扑（独立会话或对端集合）以及连接状态/成员变更通知；
//! - 通知采用显式注册 [`MeshConnection::add_listener`] 与对称注销
//!   [`MeshConnection::remove_listener`]，客户端停止时必须注销。
//!
//! ## 注意事项（Trade-offs）
//! - [`ConnectionListener::on_event`] 为同步回调，实现方可在任意线程调用；需要 I/O 的后续动作
//!   由监听者自行派生异步任务。

use core::fmt;
use core::time::Duration;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::TransportError;

/// 对端清单的固定路径。
pub const DESCRIPTION_PATH: &str = "/mesh/schema/description";

/// 会话描述（对应传输层的 `session`）。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SessionDescriptor {
    /// 会话 ID，用于应答路径与请求来源。
    pub id: String,
    /// 会话所在服务端的网格成员名（`happn.name`）。
    pub name: String,
    /// 服务端是否启用安全模式（`happn.secure`）。
    pub secure: bool,
    /// 安全模式下的登录用户名。
    pub username: Option<String>,
}

/// `set` 选项。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SetOptions {
    /// 传输层确认超时。
    pub timeout: Duration,
    /// 为 `true` 时服务端不持久化该值，仅转发给订阅者。
    pub no_store: bool,
}

/// 订阅关注的事件类型。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EventType {
    Set,
}

/// `on` 选项。
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SubscribeOptions {
    pub event_type: Option<EventType>,
    /// 订阅方声明的组件版本范围，随订阅元数据下发。
    pub component_version: Option<String>,
}

/// 投递给订阅处理器的事件元数据。
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct EventMeta {
    /// 事件实际到达的路径。
    pub path: String,
    /// 发送方组件盖上的版本标签；缺失表示未标注。
    pub component_version: Option<String>,
}

/// 订阅处理器。
pub type EventHandler = Arc<dyn Fn(Value, EventMeta) + Send + Sync>;

/// 传输层分配的订阅标识。
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct SubscriptionId(pub String);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SubscriptionId {
    fn from(value: &str) -> Self {
        SubscriptionId(value.to_owned())
    }
}

/// 单个会话上的发布/订阅原语。
#[async_trait]
pub trait DataClient: Send + Sync + 'static {
    /// 当前会话描述；未建立会话时返回 `None`。
    fn session(&self) -> Option<SessionDescriptor>;

    /// 读取路径上的值。
    async fn get(&self, path: &str) -> Result<Value, TransportError>;

    /// 向路径写入值。
    async fn set(&self, path: &str, value: Value, options: SetOptions)
    -> Result<(), TransportError>;

    /// 订阅路径（可含 `*` 通配）。
    async fn on(
        &self,
        path: &str,
        options: SubscribeOptions,
        handler: EventHandler,
    ) -> Result<SubscriptionId, TransportError>;

    /// 按订阅标识退订。
    async fn off(&self, id: &SubscriptionId) -> Result<(), TransportError>;

    /// 退订某路径上的全部订阅。
    async fn off_path(&self, path: &str) -> Result<(), TransportError>;
}

/// 集群中的一个对端。
#[derive(Clone)]
pub struct PeerHandle {
    /// 网格成员名（`meshName`）。
    pub name: String,
    /// 是否为本地会话所在的对端。
    pub is_self: bool,
    pub url: Option<String>,
    pub client: Arc<dyn DataClient>,
}

impl fmt::Debug for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerHandle")
            .field("name", &self.name)
            .field("is_self", &self.is_self)
            .field("url", &self.url)
            .finish()
    }
}

/// 连接的拓扑形态。
#[derive(Clone, Debug)]
pub enum Topology {
    /// 单一独立会话：清单从 [`MeshConnection::client`] 拉取。
    Standalone,
    /// 对端集合：清单从每个对端并行拉取。
    Cluster(Vec<PeerHandle>),
}

/// 连接状态与成员变更通知。
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
    Reconnecting,
    /// 本地会话重连成功，会话 ID 可能已变化。
    Reconnected,
    PeerAdded(String),
    PeerRemoved(String),
}

/// 连接事件监听者。
pub trait ConnectionListener: Send + Sync + 'static {
    fn on_event(&self, event: &ConnectionEvent);
}

/// 监听者注册标识，用于对称注销。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ListenerId(pub u64);

/// 网格连接。
pub trait MeshConnection: Send + Sync + 'static {
    /// 底层会话当前是否已连接。
    fn is_connected(&self) -> bool;

    /// 本地会话的数据客户端；用于发布请求与订阅应答/事件。
    fn client(&self) -> Option<Arc<dyn DataClient>>;

    /// 当前拓扑快照。
    fn topology(&self) -> Topology;

    /// 按成员名查找对端。
    fn peer(&self, name: &str) -> Option<PeerHandle>;

    fn add_listener(&self, listener: Arc<dyn ConnectionListener>) -> ListenerId;

    fn remove_listener(&self, id: ListenerId);
}
