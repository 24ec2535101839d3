//! # 事件路由
//!
//! 订阅 `/_events/{domain}/{component}/{key}`，并在传输层处理器外包一层版本过滤：
//! 事件元数据带有 `componentVersion` 标签时，只有满足订阅方声明范围的事件才会投递；
//! 未带标签的事件原样放行。多个客户端版本因此可以共享同一事件路径而互不串扰。

use std::sync::Arc;

use serde_json::Value;

use crate::address::event_path;
use crate::error::MeshError;
use crate::store::DescriptionStore;
use crate::transport::{
    DataClient, EventHandler, EventMeta, EventType, MeshConnection, SubscribeOptions,
    SubscriptionId,
};
use crate::version::{VersionMatching, VersionRange};

/// 事件订阅入口。
pub struct EventRouter {
    connection: Arc<dyn MeshConnection>,
    store: Arc<DescriptionStore>,
    matching: VersionMatching,
}

impl EventRouter {
    pub fn new(
        connection: Arc<dyn MeshConnection>,
        store: Arc<DescriptionStore>,
        matching: VersionMatching,
    ) -> Self {
        Self {
            connection,
            store,
            matching,
        }
    }

    /// 订阅组件事件。
    pub async fn subscribe(
        &self,
        component: &str,
        version_range: &str,
        key: &str,
        handler: EventHandler,
    ) -> Result<SubscriptionId, MeshError> {
        let (client, path) = self.locate(component, key).await?;
        let options = SubscribeOptions {
            event_type: Some(EventType::Set),
            component_version: Some(version_range.to_owned()),
        };
        let filtered = version_filter(version_range, self.matching, handler);
        let id = client
            .on(&path, options, filtered)
            .await
            .map_err(|err| MeshError::Subscribe {
                path: path.clone(),
                detail: err.detail,
            })?;
        tracing::debug!(path = %path, subscription = %id, "event path subscribed");
        Ok(id)
    }

    /// 按订阅标识退订。
    pub async fn unsubscribe(&self, id: &SubscriptionId) -> Result<(), MeshError> {
        if !self.connection.is_connected() {
            return Err(MeshError::NotConnected);
        }
        let client = self.connection.client().ok_or(MeshError::NotConnected)?;
        client.off(id).await?;
        Ok(())
    }

    /// 退订某事件路径上的全部订阅。
    pub async fn unsubscribe_path(&self, component: &str, key: &str) -> Result<(), MeshError> {
        let (client, path) = self.locate(component, key).await?;
        client.off_path(&path).await?;
        tracing::debug!(path = %path, "event path unsubscribed");
        Ok(())
    }

    async fn locate(
        &self,
        component: &str,
        key: &str,
    ) -> Result<(Arc<dyn DataClient>, String), MeshError> {
        if !self.connection.is_connected() {
            return Err(MeshError::NotConnected);
        }
        self.store.ensure_loaded().await?;
        let domain = self.store.domain().ok_or(MeshError::NotConnected)?;
        let client = self.connection.client().ok_or(MeshError::NotConnected)?;
        Ok((client, event_path(&domain, component, key)))
    }
}

/// 包装处理器：丢弃版本标签不满足 `version_range` 的事件。
///
/// 范围本身无法解析时，所有带标签的事件都被丢弃。
pub fn version_filter(
    version_range: &str,
    matching: VersionMatching,
    handler: EventHandler,
) -> EventHandler {
    let range = VersionRange::parse(version_range).ok();
    Arc::new(move |data: Value, meta: EventMeta| {
        if let Some(tag) = meta.component_version.as_deref() {
            let accepted = range
                .as_ref()
                .is_some_and(|range| range.matches_str(tag, matching));
            if !accepted {
                tracing::trace!(path = %meta.path, version = tag, "event filtered by version");
                return;
            }
        }
        handler(data, meta);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    fn recorder() -> (EventHandler, Arc<Mutex<Vec<Value>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler: EventHandler = Arc::new(move |data, _meta| sink.lock().push(data));
        (handler, seen)
    }

    fn meta(version: Option<&str>) -> EventMeta {
        EventMeta {
            path: "/_events/DOMAIN_NAME/component1/event/name".into(),
            component_version: version.map(str::to_owned),
        }
    }

    #[test]
    fn filter_passes_in_range_and_untagged_events() {
        let (handler, seen) = recorder();
        let filtered = version_filter("^1.0.0", VersionMatching::Coerced, handler);

        filtered(json!(1), meta(Some("1.4.0")));
        filtered(json!(2), meta(Some("2.0.0")));
        filtered(json!(3), meta(None));

        assert_eq!(*seen.lock(), vec![json!(1), json!(3)]);
    }

    #[test]
    fn unparseable_range_drops_tagged_events_only() {
        let (handler, seen) = recorder();
        let filtered = version_filter("not a range", VersionMatching::Coerced, handler);

        filtered(json!(1), meta(Some("1.0.0")));
        filtered(json!(2), meta(None));

        assert_eq!(*seen.lock(), vec![json!(2)]);
    }
}
