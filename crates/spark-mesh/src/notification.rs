//! 客户端对外广播的通知。
//!
//! 连接状态变化、成员变更与依赖就绪统一经由一个 `tokio::sync::broadcast` 通道发出，
//! 订阅方通过 [`MeshClient::notifications`](crate::client::MeshClient::notifications) 获取接收端。
//! 慢速订阅方可能收到 `Lagged`，通知本身不参与任何路由决策。

use std::sync::Arc;

use crate::description::Description;

/// 广播通道默认容量。
pub const NOTIFICATION_CAPACITY: usize = 64;

/// 某个依赖需求第一次被满足。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DependencyMatch {
    /// 声明依赖的一方。
    pub dependant: String,
    pub component: String,
    pub version_range: String,
    /// 当前满足该需求的清单数量。
    pub match_count: usize,
    /// 触发满足的清单（同时满足时取最近加入的一份）。
    pub description: Arc<Description>,
    pub peer_name: Option<String>,
    pub url: Option<String>,
}

/// 客户端通知。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MeshNotification {
    Connected,
    Disconnected,
    Reconnecting,
    Reconnected,
    PeerArrived { name: String },
    PeerDeparted { name: String },
    DependencyMatched(DependencyMatch),
    /// 依赖方的全部需求首次同时满足；每个依赖方至多一次。
    DependantReady { dependant: String },
}
