//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 为发现、路由、请求分发与事件订阅集中定义错误语义，调用方只需面对一个 [`MeshError`]；
//! - 本地产生的错误携带组件/版本/方法三元组，运维无需翻查内部状态即可定位路由缺口。
//!
//! ## 设计要求（What）
//! - 所有错误实现 `thiserror::Error`，并可 `Clone`：单飞（single-flight）原语会把同一个结果
//!   扇出给所有排队的调用方；
//! - 远端错误保留原始 `name` 与 `message`；
//! - [`MeshError::code`] 返回稳定的点分错误码，便于告警聚合。

use thiserror::Error;

/// 网格客户端错误域。
///
/// # 契约（What）
/// - `NotConnected`、`NotImplemented` 等本地错误立即返回，不做自动重试；
/// - `ResponseTimeout` 表示应答计时器先于回复触发，挂起条目已被移除；
/// - `Remote` 由远端 `{status: "error"}` 应答重建；
/// - `SessionReset` 仅出现在本地重连丢弃排队等待者时。
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum MeshError {
    /// 底层会话未连接。
    #[error("Not connected")]
    NotConnected,

    /// 当前没有任何已知对端满足 (组件, 版本范围, 方法)。
    ///
    /// 该结果会被路由表缓存，直到对端到达事件追加新的候选。
    #[error("Not implemented {component}:{version}:{method}")]
    NotImplemented {
        component: String,
        version: String,
        method: String,
    },

    /// 应答超时。
    #[error("Timeout awaiting response from {component}/{method} (sequence {sequence})")]
    ResponseTimeout {
        component: String,
        method: String,
        sequence: u64,
    },

    /// 远端被调方报告失败。
    #[error("{name}: {message}")]
    Remote { name: String, message: String },

    /// 传输层拒绝建立应答或事件订阅。
    #[error("subscribe to `{path}` failed: {detail}")]
    Subscribe { path: String, detail: String },

    /// 其他传输层失败，例如 `get`/`set`/`off`。
    #[error("transport `{operation}` failed: {detail}")]
    Transport { operation: String, detail: String },

    /// 对端清单无法解码。
    #[error("description from peer `{peer}` is malformed: {detail}")]
    Description { peer: String, detail: String },

    /// 本地重连丢弃了尚未完成的加载/订阅等待者。
    #[error("session was reset while the operation was pending")]
    SessionReset,

    /// 无可用的异步运行时，无法派生计时器或对端拉取任务。
    #[error("async runtime unavailable: {detail}")]
    Runtime { detail: String },

    /// 应答载荷不符合 `{status, args}` 信封格式。
    #[error("malformed response for sequence {sequence}: {detail}")]
    MalformedResponse { sequence: u64, detail: String },
}

impl MeshError {
    /// 构造 `NotImplemented`。
    pub fn not_implemented(component: &str, version: &str, method: &str) -> Self {
        MeshError::NotImplemented {
            component: component.to_owned(),
            version: version.to_owned(),
            method: method.to_owned(),
        }
    }

    /// 远端错误的名称；本地错误返回稳定的类型名。
    ///
    /// 与远端 `{message, name}` 对齐，调用方可以按 `name` 分支处理而不区分错误来源。
    pub fn name(&self) -> &str {
        match self {
            MeshError::Remote { name, .. } => name,
            MeshError::NotImplemented { .. } => "NotImplementedError",
            MeshError::ResponseTimeout { .. } => "TimeoutError",
            _ => "Error",
        }
    }

    /// 稳定的点分错误码。
    pub fn code(&self) -> &'static str {
        match self {
            MeshError::NotConnected => "mesh.not_connected",
            MeshError::NotImplemented { .. } => "mesh.not_implemented",
            MeshError::ResponseTimeout { .. } => "mesh.response_timeout",
            MeshError::Remote { .. } => "mesh.remote",
            MeshError::Subscribe { .. } => "mesh.subscribe",
            MeshError::Transport { .. } => "mesh.transport",
            MeshError::Description { .. } => "mesh.description",
            MeshError::SessionReset => "mesh.session_reset",
            MeshError::Runtime { .. } => "mesh.runtime",
            MeshError::MalformedResponse { .. } => "mesh.malformed_response",
        }
    }

    /// 是否为远端报告的错误。
    pub fn is_remote(&self) -> bool {
        matches!(self, MeshError::Remote { .. })
    }
}

/// 传输实现返回的错误。
///
/// - `operation`：失败的原语（`get`、`set`、`on`、`off`、`offPath`）；
/// - `detail`：人类可读描述，原样透传给 [`MeshError`]。
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("{operation}: {detail}")]
pub struct TransportError {
    pub operation: String,
    pub detail: String,
}

impl TransportError {
    pub fn new(operation: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            detail: detail.into(),
        }
    }
}

impl From<TransportError> for MeshError {
    fn from(value: TransportError) -> Self {
        MeshError::Transport {
            operation: value.operation,
            detail: value.detail,
        }
    }
}

/// 配置解析或校验失败。
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// TOML 文本无法解析为 [`ClientConfig`](crate::config::ClientConfig)。
    #[error("invalid client configuration: {0}")]
    Parse(String),

    /// 某个超时被设置为零。
    #[error("`{field}` must be greater than zero")]
    ZeroDuration { field: &'static str },

    /// `light` 档案缺少域名。
    #[error("the light profile requires `domain` to be set")]
    MissingDomain,
}

/// 本 crate 的 `Result` 别名。
pub type Result<T, E = MeshError> = core::result::Result<T, E>;
