#![deny(unsafe_code)]
#![doc = "spark-mesh: 网格 RPC 客户端的服务发现、请求路由与应答关联层。"]
#![doc = ""]
#![doc = "== 定位 =="]
#![doc = "应用声明远端组件（带语义化版本与方法集合的服务门面），本 crate 负责把每次调用解析到某个提供该组件的对端、"]
#![doc = "把异步回复关联回对应调用，并把事件订阅按版本过滤。连接、认证与原始发布/订阅由外部传输实现，"]
#![doc = "经 [`transport::DataClient`] 与 [`transport::MeshConnection`] 这两个最窄接口接入。"]
#![doc = ""]
#![doc = "== 模块分层（叶子在前） =="]
#![doc = "1. [`address`]：请求、应答与事件路径的纯函数构造；"]
#![doc = "2. [`store`]：对端清单的拉取、合并与增量维护；"]
#![doc = "3. [`routing`]：(组件, 版本范围, 方法) → 候选列表的按需缓存与轮询；"]
#![doc = "4. [`dependency`]：依赖方需求的评估与就绪通知；"]
#![doc = "5. [`dispatcher`] / [`response`]：请求发布、序号分配、挂起表与超时；"]
#![doc = "6. [`events`]：事件订阅与版本过滤；"]
#![doc = "7. [`client`]：把以上部件组装为 [`MeshClient`]。"]

pub mod address;
pub mod client;
pub mod config;
pub mod dependency;
pub mod description;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod notification;
pub mod observability;
pub mod response;
pub mod routing;
pub mod single_flight;
pub mod store;
/// 内存传输桩，供测试与示例复用。
///
/// # 使用方式（How）
/// - `use spark_mesh::test_stubs::{MemoryClient, MemoryConnection};`；
/// - 桩对象记录全部传输调用，并允许手动投递回复与连接事件。
pub mod test_stubs;
pub mod transport;
pub mod version;

pub use client::{CallParameters, MeshClient};
pub use config::{ClientConfig, ClientProfile};
pub use description::{ComponentDescription, Description, ImplementationReference};
pub use error::{ConfigError, MeshError, Result, TransportError};
pub use notification::{DependencyMatch, MeshNotification};
pub use transport::{
    ConnectionEvent, DataClient, EventHandler, EventMeta, MeshConnection, PeerHandle,
    SessionDescriptor, SubscriptionId,
};
pub use version::VersionMatching;
