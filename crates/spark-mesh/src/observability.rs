//! 日志与追踪接入。
//!
//! # 教案式说明
//! - **意图（Why）**：库本身只通过 `tracing` 宏发出结构化事件，由宿主决定输出方式；对没有现成
//!   Subscriber 的宿主（命令行工具、集成测试）提供一键安装入口。
//! - **逻辑（How）**：[`install_fmt_subscriber`] 组装 `fmt + EnvFilter`；过滤规则优先取 `RUST_LOG`，
//!   缺省时使用调用方给出的指令。
//! - **契约（What）**：全局 Subscriber 已存在时返回 [`ObservabilityError::SubscriberAlreadySet`]，
//!   绝不覆盖宿主的设置。
//!
//! 结构化字段统一使用 `component`、`version`、`method`、`sequence`、`peer`、`path` 等名称，
//! 由 [`exchange_span`] 与 [`discovery_span`] 承载公共上下文。

use thiserror::Error;
use tracing::Span;
use tracing_subscriber::EnvFilter;

/// 安装日志输出时可能出现的错误。
#[derive(Debug, Error)]
pub enum ObservabilityError {
    /// 外部已设置全局 `tracing` Subscriber。
    #[error("a global tracing subscriber is already installed")]
    SubscriberAlreadySet,
    /// 过滤指令无法解析。
    #[error("invalid filter directive `{directive}`: {detail}")]
    InvalidDirective { directive: String, detail: String },
}

/// 构造过滤器：`RUST_LOG` 优先，否则使用 `default_directive`。
pub fn build_env_filter(default_directive: &str) -> Result<EnvFilter, ObservabilityError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    parse_directive(default_directive)
}

fn parse_directive(directive: &str) -> Result<EnvFilter, ObservabilityError> {
    EnvFilter::try_new(directive).map_err(|err| ObservabilityError::InvalidDirective {
        directive: directive.to_owned(),
        detail: err.to_string(),
    })
}

/// 安装 `fmt` Subscriber。
pub fn install_fmt_subscriber(default_directive: &str) -> Result<(), ObservabilityError> {
    if tracing::dispatcher::has_been_set() {
        return Err(ObservabilityError::SubscriberAlreadySet);
    }
    let filter = build_env_filter(default_directive)?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|_| ObservabilityError::SubscriberAlreadySet)
}

/// 一次远程调用的 span。
pub fn exchange_span(component: &str, version: &str, method: &str) -> Span {
    tracing::debug_span!("mesh.exchange", component, version, method)
}

/// 一次清单加载的 span。
pub fn discovery_span(topology: &'static str) -> Span {
    tracing::debug_span!("mesh.discovery", topology)
}
