//! 内存传输桩，供单元测试、集成测试与示例复用。
//!
//! # 设计定位（Why）
//! - 发现、路由与应答关联的行为都取决于传输层的时序；内存实现让测试可以精确脚本化清单返回、
//!   注入失败、手动投递回复与连接事件，而无需真实服务端；
//! - 统一出口避免每个测试文件重复编写桩对象，接口演进时只需修改一处。
//!
//! # 使用方式（How）
//! - [`MemoryClient::new`] 创建会话；[`MemoryClient::push_description`] 依次排入清单响应，
//!   最后一份在耗尽后重复返回；
//! - [`MemoryClient::deliver`] 把载荷投递给所有匹配路径的订阅（支持末尾 `*` 通配）；
//! - [`MemoryConnection::emit`] 向已注册的监听者同步广播连接事件。
//!
//! # 契约说明（What）
//! - 所有操作均被记录，可通过 `sets()`、`subscriptions()`、`offs()`、`off_paths()` 断言；
//! - [`MemoryClient::fail`] 让指定原语（`get`、`set`、`on`、`off`、`offPath`）持续失败，直到
//!   [`MemoryClient::clear_failure`]；
//! - [`MemoryClient::stall_sets`] 让 `set` 在记录后永不完成，模拟发布阶段卡住的服务端。

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value, json};

use crate::error::TransportError;
use crate::transport::{
    ConnectionEvent, ConnectionListener, DataClient, EventHandler, EventMeta, ListenerId,
    MeshConnection, PeerHandle, SessionDescriptor, SetOptions, SubscribeOptions, SubscriptionId,
    Topology,
};

/// 构造清单文档：`components` 为 (组件, 版本, 方法列表)。
pub fn manifest(domain: &str, components: &[(&str, &str, &[&str])]) -> Value {
    let components: Map<String, Value> = components
        .iter()
        .map(|(name, version, methods)| {
            let methods: Map<String, Value> = methods
                .iter()
                .map(|method| ((*method).to_owned(), json!({})))
                .collect();
            (
                (*name).to_owned(),
                json!({"name": name, "version": version, "methods": methods}),
            )
        })
        .collect();
    json!({"name": domain, "initializing": false, "components": components})
}

/// 一次被记录的 `set`。
#[derive(Clone, Debug, PartialEq)]
pub struct RecordedSet {
    pub path: String,
    pub value: Value,
    pub options: SetOptions,
}

/// 一条被记录的订阅。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedSubscription {
    pub id: SubscriptionId,
    pub path: String,
    pub options: SubscribeOptions,
}

struct Subscription {
    record: RecordedSubscription,
    handler: EventHandler,
}

/// 内存会话。
pub struct MemoryClient {
    session: Mutex<SessionDescriptor>,
    descriptions: Mutex<VecDeque<Value>>,
    gets: AtomicUsize,
    sets: Mutex<Vec<RecordedSet>>,
    subscriptions: Mutex<Vec<Subscription>>,
    offs: Mutex<Vec<SubscriptionId>>,
    off_paths: Mutex<Vec<String>>,
    failures: Mutex<HashMap<String, String>>,
    stall_sets: AtomicBool,
    next_subscription: AtomicU64,
}

impl MemoryClient {
    /// 创建会话：`name` 为会话所在服务端的成员名。
    pub fn new(session_id: &str, name: &str, secure: bool) -> Arc<Self> {
        Arc::new(Self {
            session: Mutex::new(SessionDescriptor {
                id: session_id.to_owned(),
                name: name.to_owned(),
                secure,
                username: None,
            }),
            descriptions: Mutex::new(VecDeque::new()),
            gets: AtomicUsize::new(0),
            sets: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
            offs: Mutex::new(Vec::new()),
            off_paths: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            stall_sets: AtomicBool::new(false),
            next_subscription: AtomicU64::new(0),
        })
    }

    pub fn set_username(&self, username: &str) {
        self.session.lock().username = Some(username.to_owned());
    }

    /// 模拟重连后的新会话 ID。
    pub fn set_session_id(&self, session_id: &str) {
        self.session.lock().id = session_id.to_owned();
    }

    /// 排入一份清单响应。
    pub fn push_description(&self, description: Value) {
        self.descriptions.lock().push_back(description);
    }

    /// `get` 被调用的次数。
    pub fn get_count(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn fail(&self, operation: &str, detail: &str) {
        self.failures
            .lock()
            .insert(operation.to_owned(), detail.to_owned());
    }

    pub fn clear_failure(&self, operation: &str) {
        self.failures.lock().remove(operation);
    }

    pub fn stall_sets(&self, stall: bool) {
        self.stall_sets.store(stall, Ordering::SeqCst);
    }

    pub fn sets(&self) -> Vec<RecordedSet> {
        self.sets.lock().clone()
    }

    pub fn last_set(&self) -> Option<RecordedSet> {
        self.sets.lock().last().cloned()
    }

    pub fn subscriptions(&self) -> Vec<RecordedSubscription> {
        self.subscriptions
            .lock()
            .iter()
            .map(|subscription| subscription.record.clone())
            .collect()
    }

    pub fn offs(&self) -> Vec<SubscriptionId> {
        self.offs.lock().clone()
    }

    pub fn off_paths(&self) -> Vec<String> {
        self.off_paths.lock().clone()
    }

    /// 投递载荷到 `path`，返回被调用的处理器数量。
    pub fn deliver(&self, path: &str, payload: Value, component_version: Option<&str>) -> usize {
        let handlers: Vec<EventHandler> = self
            .subscriptions
            .lock()
            .iter()
            .filter(|subscription| path_matches(&subscription.record.path, path))
            .map(|subscription| Arc::clone(&subscription.handler))
            .collect();
        for handler in &handlers {
            handler(
                payload.clone(),
                EventMeta {
                    path: path.to_owned(),
                    component_version: component_version.map(str::to_owned),
                },
            );
        }
        handlers.len()
    }

    /// 以 `{status: "ok", args: [null, ...results]}` 回复最近一次请求。
    pub fn reply_ok(&self, results: Vec<Value>) -> usize {
        let mut args = vec![Value::Null];
        args.extend(results);
        self.reply(json!({"status": "ok", "args": args}))
    }

    /// 以 `{status: "error", args: [{message, name}]}` 回复最近一次请求。
    pub fn reply_error(&self, name: &str, message: &str) -> usize {
        self.reply(json!({"status": "error", "args": [{"message": message, "name": name}]}))
    }

    fn reply(&self, payload: Value) -> usize {
        let callback = self.last_set().and_then(|set| {
            set.value
                .get("callbackAddress")
                .and_then(Value::as_str)
                .map(str::to_owned)
        });
        match callback {
            Some(callback) => self.deliver(&callback, payload, None),
            None => 0,
        }
    }

    fn check(&self, operation: &str) -> Result<(), TransportError> {
        match self.failures.lock().get(operation) {
            Some(detail) => Err(TransportError::new(operation, detail.clone())),
            None => Ok(()),
        }
    }
}

fn path_matches(pattern: &str, path: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => path.starts_with(prefix),
        None => pattern == path,
    }
}

#[async_trait]
impl DataClient for MemoryClient {
    fn session(&self) -> Option<SessionDescriptor> {
        Some(self.session.lock().clone())
    }

    async fn get(&self, path: &str) -> Result<Value, TransportError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.check("get")?;
        let mut descriptions = self.descriptions.lock();
        let next = if descriptions.len() > 1 {
            descriptions.pop_front()
        } else {
            descriptions.front().cloned()
        };
        next.ok_or_else(|| TransportError::new("get", format!("nothing stored at {path}")))
    }

    async fn set(
        &self,
        path: &str,
        value: Value,
        options: SetOptions,
    ) -> Result<(), TransportError> {
        self.check("set")?;
        self.sets.lock().push(RecordedSet {
            path: path.to_owned(),
            value,
            options,
        });
        if self.stall_sets.load(Ordering::SeqCst) {
            futures::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn on(
        &self,
        path: &str,
        options: SubscribeOptions,
        handler: EventHandler,
    ) -> Result<SubscriptionId, TransportError> {
        self.check("on")?;
        let id = SubscriptionId(format!(
            "sub-{}",
            self.next_subscription.fetch_add(1, Ordering::SeqCst) + 1
        ));
        self.subscriptions.lock().push(Subscription {
            record: RecordedSubscription {
                id: id.clone(),
                path: path.to_owned(),
                options,
            },
            handler,
        });
        Ok(id)
    }

    async fn off(&self, id: &SubscriptionId) -> Result<(), TransportError> {
        self.check("off")?;
        self.subscriptions
            .lock()
            .retain(|subscription| &subscription.record.id != id);
        self.offs.lock().push(id.clone());
        Ok(())
    }

    async fn off_path(&self, path: &str) -> Result<(), TransportError> {
        self.check("offPath")?;
        self.subscriptions
            .lock()
            .retain(|subscription| subscription.record.path != path);
        self.off_paths.lock().push(path.to_owned());
        Ok(())
    }
}

/// 内存连接。
pub struct MemoryConnection {
    connected: AtomicBool,
    client: Arc<MemoryClient>,
    peers: Mutex<Option<Vec<PeerHandle>>>,
    listeners: Mutex<Vec<(ListenerId, Arc<dyn ConnectionListener>)>>,
    next_listener: AtomicU64,
}

impl MemoryConnection {
    /// 单一独立会话。
    pub fn standalone(client: Arc<MemoryClient>) -> Arc<Self> {
        Arc::new(Self {
            connected: AtomicBool::new(true),
            client,
            peers: Mutex::new(None),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(0),
        })
    }

    /// 集群：`client` 为本地会话，`peers` 中应有一个 `is_self` 的对端。
    pub fn cluster(client: Arc<MemoryClient>, peers: Vec<PeerHandle>) -> Arc<Self> {
        Arc::new(Self {
            connected: AtomicBool::new(true),
            client,
            peers: Mutex::new(Some(peers)),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(0),
        })
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// 加入对端（不广播事件）。
    pub fn insert_peer(&self, peer: PeerHandle) {
        if let Some(peers) = self.peers.lock().as_mut() {
            peers.retain(|known| known.name != peer.name);
            peers.push(peer);
        }
    }

    /// 移除对端（不广播事件）。
    pub fn drop_peer(&self, name: &str) {
        if let Some(peers) = self.peers.lock().as_mut() {
            peers.retain(|known| known.name != name);
        }
    }

    /// 同步广播连接事件。
    pub fn emit(&self, event: ConnectionEvent) {
        let listeners: Vec<_> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener.on_event(&event);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }
}

/// 构造指向内存会话的对端。
pub fn memory_peer(name: &str, is_self: bool, client: &Arc<MemoryClient>) -> PeerHandle {
    let client: Arc<dyn DataClient> = Arc::clone(client) as Arc<dyn DataClient>;
    PeerHandle {
        name: name.to_owned(),
        is_self,
        url: Some(format!("http://{name}.mesh.local:55000")),
        client,
    }
}

impl MeshConnection for MemoryConnection {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn client(&self) -> Option<Arc<dyn DataClient>> {
        Some(Arc::clone(&self.client) as Arc<dyn DataClient>)
    }

    fn topology(&self) -> Topology {
        match self.peers.lock().as_ref() {
            Some(peers) => Topology::Cluster(peers.clone()),
            None => Topology::Standalone,
        }
    }

    fn peer(&self, name: &str) -> Option<PeerHandle> {
        self.peers
            .lock()
            .as_ref()?
            .iter()
            .find(|peer| peer.name == name)
            .cloned()
    }

    fn add_listener(&self, listener: Arc<dyn ConnectionListener>) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::SeqCst) + 1);
        self.listeners.lock().push((id, listener));
        id
    }

    fn remove_listener(&self, id: ListenerId) {
        self.listeners.lock().retain(|(known, _)| *known != id);
    }
}
