//! # 网格客户端门面
//!
//! ## 定位（Why）
//! - 把清单存储、路由、依赖跟踪、请求分发、应答关联与事件路由组装为一个对象；
//! - 负责把连接层的状态/成员通知翻译为缓存维护动作，并向应用广播。
//!
//! ## 生命周期（How）
//! - [`MeshClient::start`] 在连接上注册监听者，[`MeshClient::stop`] 对称注销并清空缓存；
//! - 停止时不主动完成挂起的调用，它们由各自的应答计时器收尾；
//! - 监听者只持有弱引用，连接对象不会延长客户端的生命周期。

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::broadcast;

use crate::config::ClientConfig;
use crate::dependency::DependencyTracker;
use crate::dispatcher::RequestDispatcher;
use crate::error::{ConfigError, MeshError};
use crate::events::EventRouter;
use crate::notification::{MeshNotification, NOTIFICATION_CAPACITY};
use crate::response::{PendingTable, ResponseRouter};
use crate::routing::DescriptionSource;
use crate::store::DescriptionStore;
use crate::transport::{
    ConnectionEvent, ConnectionListener, EventHandler, ListenerId, MeshConnection,
    SubscriptionId,
};

/// 通用调用参数（不经模型声明，直接按名称调用）。
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CallParameters {
    pub component: String,
    /// 版本范围；缺省为 `*`。
    pub version: Option<String>,
    pub method: String,
    pub arguments: Vec<Value>,
}

impl CallParameters {
    pub fn new(component: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            method: method.into(),
            ..Self::default()
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_arguments(mut self, arguments: Vec<Value>) -> Self {
        self.arguments = arguments;
        self
    }
}

/// 网格客户端。
pub struct MeshClient {
    inner: Arc<Inner>,
    listener: Mutex<Option<ListenerId>>,
}

struct Inner {
    connection: Arc<dyn MeshConnection>,
    store: Arc<DescriptionStore>,
    responses: Arc<ResponseRouter>,
    dispatcher: RequestDispatcher,
    events: EventRouter,
    tracker: Arc<DependencyTracker>,
    notifications: broadcast::Sender<MeshNotification>,
}

impl MeshClient {
    /// 按配置组装客户端；配置非法时返回错误。
    pub fn new(connection: Arc<dyn MeshConnection>, config: ClientConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        let tracker = Arc::new(DependencyTracker::new(
            config.version_matching(),
            notifications.clone(),
        ));
        let store = Arc::new(DescriptionStore::new(
            Arc::clone(&connection),
            config.clone(),
            Arc::clone(&tracker),
        ));
        let responses = Arc::new(ResponseRouter::new(Arc::new(PendingTable::new())));
        let dispatcher = RequestDispatcher::new(
            Arc::clone(&connection),
            Arc::clone(&store),
            Arc::clone(&responses),
            config.clone(),
        );
        let events = EventRouter::new(
            Arc::clone(&connection),
            Arc::clone(&store),
            config.version_matching(),
        );
        Ok(Self {
            inner: Arc::new(Inner {
                connection,
                store,
                responses,
                dispatcher,
                events,
                tracker,
                notifications,
            }),
            listener: Mutex::new(None),
        })
    }

    /// 注册连接监听者。需在 Tokio 运行时内调用；重复调用无副作用。
    pub fn start(&self) -> Result<(), MeshError> {
        let runtime = Handle::try_current().map_err(|err| MeshError::Runtime {
            detail: err.to_string(),
        })?;
        let mut listener = self.listener.lock();
        if listener.is_some() {
            return Ok(());
        }
        let observer = Arc::new(ClientListener {
            inner: Arc::downgrade(&self.inner),
            runtime,
        });
        *listener = Some(self.inner.connection.add_listener(observer));
        tracing::debug!("mesh client started");
        Ok(())
    }

    /// 注销连接监听者并清空缓存。
    pub fn stop(&self) {
        if let Some(id) = self.listener.lock().take() {
            self.inner.connection.remove_listener(id);
        }
        self.inner.store.invalidate();
        self.inner.responses.reset();
        tracing::debug!("mesh client stopped");
    }

    pub fn is_started(&self) -> bool {
        self.listener.lock().is_some()
    }

    /// 调用远端方法。
    pub async fn request(
        &self,
        component: &str,
        version_range: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Vec<Value>, MeshError> {
        self.inner
            .dispatcher
            .request(component, version_range, method, args)
            .await
    }

    /// 通用调用。
    pub async fn call(&self, parameters: CallParameters) -> Result<Vec<Value>, MeshError> {
        let CallParameters {
            component,
            version,
            method,
            arguments,
        } = parameters;
        let version = version.as_deref().unwrap_or("*");
        self.request(&component, version, &method, arguments).await
    }

    pub async fn subscribe(
        &self,
        component: &str,
        version_range: &str,
        key: &str,
        handler: EventHandler,
    ) -> Result<SubscriptionId, MeshError> {
        self.inner
            .events
            .subscribe(component, version_range, key, handler)
            .await
    }

    pub async fn unsubscribe(&self, id: &SubscriptionId) -> Result<(), MeshError> {
        self.inner.events.unsubscribe(id).await
    }

    pub async fn unsubscribe_path(&self, component: &str, key: &str) -> Result<(), MeshError> {
        self.inner.events.unsubscribe_path(component, key).await
    }

    /// 为依赖方追加一条需求，并用当前已知清单重新评估。
    pub fn register_dependency(&self, dependant: &str, component: &str, version_range: &str) {
        self.inner
            .tracker
            .register_dependency(dependant, component, version_range);
        self.inner.tracker.recheck(&self.inner.store.descriptions());
    }

    /// 注册一组需求并返回是否已全部满足。
    pub fn register_and_check<I, C, V>(&self, dependant: &str, requirements: I) -> bool
    where
        I: IntoIterator<Item = (C, V)>,
        C: Into<String>,
        V: Into<String>,
    {
        let descriptions = self.inner.store.descriptions();
        self.inner
            .tracker
            .register_and_check(dependant, requirements, &descriptions)
    }

    /// 订阅客户端通知。
    pub fn notifications(&self) -> broadcast::Receiver<MeshNotification> {
        self.inner.notifications.subscribe()
    }

    pub fn store(&self) -> &Arc<DescriptionStore> {
        &self.inner.store
    }

    pub fn responses(&self) -> &Arc<ResponseRouter> {
        &self.inner.responses
    }
}

impl Drop for MeshClient {
    fn drop(&mut self) {
        if let Some(id) = self.listener.get_mut().take() {
            self.inner.connection.remove_listener(id);
        }
    }
}

struct ClientListener {
    inner: Weak<Inner>,
    runtime: Handle,
}

impl ConnectionListener for ClientListener {
    fn on_event(&self, event: &ConnectionEvent) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let notification = match event {
            ConnectionEvent::Connected => MeshNotification::Connected,
            ConnectionEvent::Disconnected => MeshNotification::Disconnected,
            ConnectionEvent::Reconnecting => MeshNotification::Reconnecting,
            ConnectionEvent::Reconnected => {
                inner.store.invalidate();
                inner.responses.reset();
                MeshNotification::Reconnected
            }
            ConnectionEvent::PeerAdded(name) => {
                let store = Arc::clone(&inner.store);
                let peer = name.clone();
                self.runtime.spawn(async move {
                    if let Err(err) = store.add_peer(&peer).await {
                        tracing::warn!(peer = %peer, error = %err, "failed to add peer description");
                    }
                });
                MeshNotification::PeerArrived { name: name.clone() }
            }
            ConnectionEvent::PeerRemoved(name) => {
                inner.store.remove_peer(name);
                MeshNotification::PeerDeparted { name: name.clone() }
            }
        };
        let _ = inner.notifications.send(notification);
    }
}
