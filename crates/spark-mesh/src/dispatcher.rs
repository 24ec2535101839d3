//! # 请求分发
//!
//! 一次调用依次经过：连接检查 → 清单加载 → 路由解析 → 应答订阅 → 发布请求 → 挂起等待。
//! 任一步失败即短路返回，后续步骤不执行。
//!
//! 序号在单个分发器内单调递增，越过 `2^53 - 1` 前回绕到 1，与网格中其他语言实现
//! 可安全表示的整数范围保持一致。

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::Instrument;

use crate::address::build_request;
use crate::config::ClientConfig;
use crate::error::{MeshError, TransportError};
use crate::observability::exchange_span;
use crate::response::{PendingTable, ResponseRouter};
use crate::store::DescriptionStore;
use crate::transport::{MeshConnection, SetOptions};

/// 序号上限（不含）。
pub const MAX_SEQUENCE: u64 = (1 << 53) - 1;

/// 请求分发器。
pub struct RequestDispatcher {
    connection: Arc<dyn MeshConnection>,
    store: Arc<DescriptionStore>,
    responses: Arc<ResponseRouter>,
    config: ClientConfig,
    last_sequence: Mutex<u64>,
}

impl RequestDispatcher {
    pub fn new(
        connection: Arc<dyn MeshConnection>,
        store: Arc<DescriptionStore>,
        responses: Arc<ResponseRouter>,
        config: ClientConfig,
    ) -> Self {
        Self {
            connection,
            store,
            responses,
            config,
            last_sequence: Mutex::new(0),
        }
    }

    /// 分配下一个序号。
    pub fn next_sequence(&self) -> u64 {
        let mut last = self.last_sequence.lock();
        *last += 1;
        if *last >= MAX_SEQUENCE {
            *last = 1;
        }
        *last
    }

    /// 调用远端方法，返回远端给出的结果参数。
    pub async fn request(
        &self,
        component: &str,
        version_range: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Vec<Value>, MeshError> {
        self.exchange(component, version_range, method, args)
            .instrument(exchange_span(component, version_range, method))
            .await
    }

    async fn exchange(
        &self,
        component: &str,
        version_range: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Vec<Value>, MeshError> {
        if !self.connection.is_connected() {
            return Err(MeshError::NotConnected);
        }
        self.store.ensure_loaded().await?;
        let implementation = self.store.resolve(component, version_range, method)?;

        let session = self.store.session().ok_or(MeshError::NotConnected)?;
        let client = self.connection.client().ok_or(MeshError::NotConnected)?;
        self.responses
            .ensure_subscribed(Arc::clone(&client), session.scope(), component, method)
            .await?;

        if !self.connection.is_connected() {
            return Err(MeshError::NotConnected);
        }
        let sequence = self.next_sequence();
        let request = build_request(
            session.scope(),
            session.username.as_deref(),
            component,
            method,
            sequence,
            args,
        );
        let payload = serde_json::to_value(&request.payload)
            .map_err(|err| TransportError::new("encode", err.to_string()))?;
        let options = SetOptions {
            timeout: self.config.request_timeout(),
            no_store: true,
        };

        let pending: &Arc<PendingTable> = self.responses.pending();
        // 发布失败或本 future 在发布期间被丢弃时，`reservation` 撤销条目。
        let (reservation, reply) = pending.reserve(sequence, component, method);
        client.set(&request.request_path, payload, options).await?;
        reservation.arm(self.config.response_timeout())?;
        tracing::debug!(
            sequence,
            peer = implementation.peer_name.as_deref().unwrap_or("local"),
            path = %request.request_path,
            "request published"
        );

        reply.await.unwrap_or(Err(MeshError::SessionReset))
    }
}
