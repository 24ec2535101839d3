//! 交换（exchange）与事件路径的规范化构造。
//!
//! 纯函数，无状态。路径格式：
//!
//! | 用途 | 安全模式 | 非安全模式 |
//! |------|----------|------------|
//! | 请求 | `/_exchange/requests/{domain}/{component}/{method}` | 同左 |
//! | 应答 | `/_exchange/responses/{domain}/{component}/{method}/{session}/{seq}` | `/_exchange/responses/{session}/{domain}/{component}/{method}/{seq}` |
//! | 应答订阅 | `/_exchange/responses/{domain}/{component}/{method}/{session}/*` | `/_exchange/responses/{session}/*` |
//! | 事件 | `/_events/{domain}/{component}/{key}` | 同左 |
//!
//! 安全模式下授权按路径生效，因此应答订阅按 (组件, 方法) 划分；非安全模式一条通配订阅
//! 覆盖本会话的全部应答。

use serde::Serialize;
use serde_json::Value;

const REQUESTS_PREFIX: &str = "/_exchange/requests";
const RESPONSES_PREFIX: &str = "/_exchange/responses";
const EVENTS_PREFIX: &str = "/_events";

/// 会话的安全模式，决定应答路径布局与请求来源字段。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum SecurityMode {
    Secure,
    Insecure,
}

impl SecurityMode {
    pub fn from_secure_flag(secure: bool) -> Self {
        if secure {
            SecurityMode::Secure
        } else {
            SecurityMode::Insecure
        }
    }
}

/// 构造一次调用地址所需的会话上下文。
#[derive(Clone, Copy, Debug)]
pub struct ExchangeScope<'a> {
    pub domain: &'a str,
    pub session_id: &'a str,
    pub mode: SecurityMode,
}

/// 请求发布路径。
pub fn request_path(domain: &str, component: &str, method: &str) -> String {
    format!("{REQUESTS_PREFIX}/{domain}/{component}/{method}")
}

/// 单次调用的应答路径。
pub fn response_path(scope: ExchangeScope<'_>, component: &str, method: &str, sequence: u64) -> String {
    let ExchangeScope {
        domain,
        session_id,
        mode,
    } = scope;
    match mode {
        SecurityMode::Secure => {
            format!("{RESPONSES_PREFIX}/{domain}/{component}/{method}/{session_id}/{sequence}")
        }
        SecurityMode::Insecure => {
            format!("{RESPONSES_PREFIX}/{session_id}/{domain}/{component}/{method}/{sequence}")
        }
    }
}

/// 应答通配订阅路径。
pub fn response_wildcard(scope: ExchangeScope<'_>, component: &str, method: &str) -> String {
    let ExchangeScope {
        domain,
        session_id,
        mode,
    } = scope;
    match mode {
        SecurityMode::Secure => {
            format!("{RESPONSES_PREFIX}/{domain}/{component}/{method}/{session_id}/*")
        }
        SecurityMode::Insecure => format!("{RESPONSES_PREFIX}/{session_id}/*"),
    }
}

/// 事件路径。
pub fn event_path(domain: &str, component: &str, key: &str) -> String {
    format!("{EVENTS_PREFIX}/{domain}/{component}/{key}")
}

/// 从应答路径末段提取序号；末段非数字时返回 `None`。
pub fn sequence_from_path(path: &str) -> Option<u64> {
    path.rsplit('/').next()?.parse().ok()
}

/// 请求来源；`username` 仅在安全模式出现。
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct RequestOrigin {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

/// 发布到请求路径的载荷。
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestPayload {
    pub callback_address: String,
    pub args: Vec<Value>,
    pub origin: RequestOrigin,
}

/// 已寻址的一次请求：发布路径与载荷。
#[derive(Clone, Debug, PartialEq)]
pub struct AddressedRequest {
    pub request_path: String,
    pub payload: RequestPayload,
}

/// 组装一次调用的请求路径与载荷。
pub fn build_request(
    scope: ExchangeScope<'_>,
    username: Option<&str>,
    component: &str,
    method: &str,
    sequence: u64,
    args: Vec<Value>,
) -> AddressedRequest {
    let callback_address = response_path(scope, component, method, sequence);
    let username = match scope.mode {
        SecurityMode::Secure => username.map(str::to_owned),
        SecurityMode::Insecure => None,
    };
    AddressedRequest {
        request_path: request_path(scope.domain, component, method),
        payload: RequestPayload {
            callback_address,
            args,
            origin: RequestOrigin {
                id: scope.session_id.to_owned(),
                username,
            },
        },
    }
}
