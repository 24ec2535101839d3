//! # 应答关联
//!
//! ## 定位（Why）
//! - 所有远程调用的回复都经由共享的通配订阅到达，需要按序号分发回对应的调用方；
//! - 每个挂起调用带独立的应答计时器，回复与超时互斥，先到者生效，后到者无副作用。
//!
//! ## 契约（What）
//! - [`PendingTable`]：序号 → 挂起条目；条目先 [`reserve`](PendingTable::reserve)，请求发布成功后
//!   再经 [`Reservation::arm`] 启动计时器；未启动计时器的 [`Reservation`] 被丢弃时（发布失败，
//!   或调用方放弃了请求）条目随之撤销，表中不会残留没有计时器的条目；
//! - [`ResponseRouter::ensure_subscribed`]：每条通配路径只订阅一次，并发调用合并；订阅成功后
//!   该路径在本会话内永久有效；
//! - [`PendingTable::dispatch`]：取路径末段为序号；未命中（已超时、重复或无关消息）静默忽略；
//!   `{status: "ok", args: [null, ...]}` 以首个占位之后的参数完成调用，
//!   `{status: "error", args: [{message, name}]}` 以同名远端错误完成调用。
//!
//! ## 取舍（Trade-offs）
//! - 应答订阅按会话（及安全模式下的组件/方法）划分，与对端无关；对端离开不会产生“悬空”的
//!   应答订阅，因此不做按对端的清理，重连时整体重置。

use core::time::Duration;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

use crate::address::{ExchangeScope, response_wildcard, sequence_from_path};
use crate::error::MeshError;
use crate::single_flight::SingleFlight;
use crate::transport::{DataClient, EventHandler, EventMeta, SubscribeOptions};

/// 调用方等待的结果：成功时为远端返回的参数列表。
pub type Reply = Result<Vec<Value>, MeshError>;

struct PendingResponse {
    component: String,
    method: String,
    reply: oneshot::Sender<Reply>,
    timer: Option<AbortHandle>,
}

/// 挂起调用表。
#[derive(Default)]
pub struct PendingTable {
    entries: DashMap<u64, PendingResponse>,
}

#[derive(Deserialize)]
struct ResponseEnvelope {
    status: String,
    #[serde(default)]
    args: Vec<Value>,
}

#[derive(Deserialize)]
struct RemoteFailure {
    #[serde(default)]
    message: String,
    #[serde(default = "default_error_name")]
    name: String,
}

fn default_error_name() -> String {
    "Error".to_owned()
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为序号登记挂起条目，返回登记凭据与调用方等待的接收端。计时器尚未启动。
    pub fn reserve(
        self: &Arc<Self>,
        sequence: u64,
        component: &str,
        method: &str,
    ) -> (Reservation, oneshot::Receiver<Reply>) {
        let (reply, receiver) = oneshot::channel();
        self.entries.insert(
            sequence,
            PendingResponse {
                component: component.to_owned(),
                method: method.to_owned(),
                reply,
                timer: None,
            },
        );
        let reservation = Reservation {
            table: Arc::clone(self),
            sequence,
            armed: false,
        };
        (reservation, receiver)
    }

    /// 启动应答计时器；到期时移除条目并以超时错误完成调用。
    fn arm(self: &Arc<Self>, sequence: u64, timeout: Duration) -> Result<(), MeshError> {
        let handle = tokio::runtime::Handle::try_current().map_err(|err| {
            self.cancel(sequence);
            MeshError::Runtime {
                detail: err.to_string(),
            }
        })?;
        let table: Weak<Self> = Arc::downgrade(self);
        let timer = handle.spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(table) = table.upgrade() {
                table.expire(sequence);
            }
        });
        match self.entries.get_mut(&sequence) {
            Some(mut entry) => entry.timer = Some(timer.abort_handle()),
            // 回复已先于计时器到达。
            None => timer.abort(),
        }
        Ok(())
    }

    /// 放弃挂起条目（发布失败时）。
    pub fn cancel(&self, sequence: u64) -> bool {
        match self.entries.remove(&sequence) {
            Some((_, entry)) => {
                if let Some(timer) = entry.timer {
                    timer.abort();
                }
                true
            }
            None => false,
        }
    }

    fn expire(&self, sequence: u64) {
        let Some((_, entry)) = self.entries.remove(&sequence) else {
            return;
        };
        tracing::warn!(
            component = %entry.component,
            method = %entry.method,
            sequence,
            "timed out awaiting response"
        );
        let _ = entry.reply.send(Err(MeshError::ResponseTimeout {
            component: entry.component,
            method: entry.method,
            sequence,
        }));
    }

    /// 把到达 `path` 的回复分发给对应调用方。返回是否命中挂起条目。
    pub fn dispatch(&self, payload: Value, path: &str) -> bool {
        let Some(sequence) = sequence_from_path(path) else {
            tracing::debug!(path, "response path has no sequence");
            return false;
        };
        let Some((_, entry)) = self.entries.remove(&sequence) else {
            tracing::debug!(path, sequence, "dropping response with no pending request");
            return false;
        };
        if let Some(timer) = &entry.timer {
            timer.abort();
        }
        let outcome = decode_reply(payload, sequence);
        tracing::debug!(
            component = %entry.component,
            method = %entry.method,
            sequence,
            ok = outcome.is_ok(),
            "response dispatched"
        );
        let _ = entry.reply.send(outcome);
        true
    }

    pub fn contains(&self, sequence: u64) -> bool {
        self.entries.contains_key(&sequence)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// 已登记、尚未启动计时器的挂起条目。
///
/// 在 [`arm`](Reservation::arm) 之前被丢弃时撤销条目。
pub struct Reservation {
    table: Arc<PendingTable>,
    sequence: u64,
    armed: bool,
}

impl Reservation {
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// 启动应答计时器，之后条目由回复或超时收尾。
    pub fn arm(mut self, timeout: Duration) -> Result<(), MeshError> {
        self.armed = true;
        self.table.arm(self.sequence, timeout)
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.armed && self.table.cancel(self.sequence) {
            tracing::debug!(sequence = self.sequence, "pending response abandoned before publish completed");
        }
    }
}

fn decode_reply(payload: Value, sequence: u64) -> Reply {
    let malformed = |detail: String| MeshError::MalformedResponse { sequence, detail };
    let envelope: ResponseEnvelope =
        serde_json::from_value(payload).map_err(|err| malformed(err.to_string()))?;
    match envelope.status.as_str() {
        "ok" => Ok(envelope.args.into_iter().skip(1).collect()),
        "error" => {
            let failure = envelope
                .args
                .into_iter()
                .next()
                .ok_or_else(|| malformed("error response carries no error".to_owned()))?;
            let failure: RemoteFailure =
                serde_json::from_value(failure).map_err(|err| malformed(err.to_string()))?;
            Err(MeshError::Remote {
                name: failure.name,
                message: failure.message,
            })
        }
        other => Err(malformed(format!("unknown status `{other}`"))),
    }
}

/// 应答通配订阅的建立与分发。
pub struct ResponseRouter {
    pending: Arc<PendingTable>,
    subscriptions: Mutex<HashMap<String, Arc<SingleFlight<MeshError>>>>,
}

impl ResponseRouter {
    pub fn new(pending: Arc<PendingTable>) -> Self {
        Self {
            pending,
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    pub fn pending(&self) -> &Arc<PendingTable> {
        &self.pending
    }

    /// 确保 (组件, 方法) 对应的通配路径已订阅。
    pub async fn ensure_subscribed(
        &self,
        client: Arc<dyn DataClient>,
        scope: ExchangeScope<'_>,
        component: &str,
        method: &str,
    ) -> Result<(), MeshError> {
        let path = response_wildcard(scope, component, method);
        let flight = Arc::clone(self.subscriptions.lock().entry(path.clone()).or_default());
        let pending = Arc::downgrade(&self.pending);
        flight
            .run(
                move || async move {
                    let handler: EventHandler = Arc::new(move |payload: Value, meta: EventMeta| {
                        if let Some(pending) = pending.upgrade() {
                            pending.dispatch(payload, &meta.path);
                        }
                    });
                    client
                        .on(&path, SubscribeOptions::default(), handler)
                        .await
                        .map_err(|err| MeshError::Subscribe {
                            path: path.clone(),
                            detail: err.detail,
                        })?;
                    tracing::debug!(path = %path, "response path subscribed");
                    Ok(())
                },
                MeshError::SessionReset,
            )
            .await
    }

    /// 路径是否已处于永久订阅状态。
    pub fn is_subscribed(&self, path: &str) -> bool {
        self.subscriptions
            .lock()
            .get(path)
            .is_some_and(|flight| flight.is_done())
    }

    /// 会话重置：丢弃全部订阅状态，拒绝排队者。
    pub fn reset(&self) {
        let flights: Vec<_> = self.subscriptions.lock().drain().map(|(_, flight)| flight).collect();
        for flight in flights {
            flight.reset(MeshError::SessionReset);
        }
    }
}
