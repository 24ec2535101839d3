//! # 依赖跟踪
//!
//! ## 契约（What）
//! - 每个依赖方声明一组 `组件 → 版本范围` 需求，注册后保持不变，可逐条追加；
//! - 需求从未满足变为满足时发出一次 [`MeshNotification::DependencyMatched`]，已满足的需求不再重复通知；
//! - 依赖方的全部需求首次同时满足时发出恰好一次 [`MeshNotification::DependantReady`]；
//! - 零需求的依赖方在注册时即视为满足。
//!
//! ## 取舍（Trade-offs）
//! - 满足状态是粘性的：对端离开后不会撤销已满足的需求，也不会再次发出就绪通知。
//!   就绪通知语义上是“曾经可用”，撤销需要调用方自行结合对端离开通知判断。

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::description::Description;
use crate::notification::{DependencyMatch, MeshNotification};
use crate::version::{VersionMatching, VersionRange};

#[derive(Debug, Default)]
struct DependantState {
    requirements: BTreeMap<String, String>,
    satisfied: BTreeSet<String>,
    ready: bool,
}

impl DependantState {
    fn all_satisfied(&self) -> bool {
        self.requirements
            .keys()
            .all(|component| self.satisfied.contains(component))
    }
}

/// 依赖跟踪器。
pub struct DependencyTracker {
    dependants: Mutex<BTreeMap<String, DependantState>>,
    matching: VersionMatching,
    notifications: broadcast::Sender<MeshNotification>,
}

impl DependencyTracker {
    pub fn new(matching: VersionMatching, notifications: broadcast::Sender<MeshNotification>) -> Self {
        Self {
            dependants: Mutex::new(BTreeMap::new()),
            matching,
            notifications,
        }
    }

    /// 为依赖方追加一条需求，不立即评估。同一组件重复声明时以最后一次为准。
    pub fn register_dependency(&self, dependant: &str, component: &str, version_range: &str) {
        let mut dependants = self.dependants.lock();
        let state = dependants.entry(dependant.to_owned()).or_default();
        state
            .requirements
            .insert(component.to_owned(), version_range.to_owned());
        state.satisfied.remove(component);
    }

    /// 注册一组需求并立即对 `descriptions` 评估，返回该依赖方是否已全部满足。
    pub fn register_and_check<I, C, V>(
        &self,
        dependant: &str,
        requirements: I,
        descriptions: &[Arc<Description>],
    ) -> bool
    where
        I: IntoIterator<Item = (C, V)>,
        C: Into<String>,
        V: Into<String>,
    {
        let (satisfied, events) = {
            let mut dependants = self.dependants.lock();
            let state = dependants.entry(dependant.to_owned()).or_default();
            for (component, version_range) in requirements {
                let component = component.into();
                state.satisfied.remove(&component);
                state.requirements.insert(component, version_range.into());
            }
            let mut events = Vec::new();
            self.evaluate(dependant, state, descriptions, &mut events);
            (state.all_satisfied(), events)
        };
        self.publish(events);
        satisfied
    }

    /// 对全部依赖方重新评估，返回是否所有依赖方都已满足。
    pub fn recheck(&self, descriptions: &[Arc<Description>]) -> bool {
        let (satisfied, events) = {
            let mut dependants = self.dependants.lock();
            let mut events = Vec::new();
            let mut satisfied = true;
            for (dependant, state) in dependants.iter_mut() {
                self.evaluate(dependant, state, descriptions, &mut events);
                satisfied &= state.all_satisfied();
            }
            (satisfied, events)
        };
        self.publish(events);
        satisfied
    }

    /// 依赖方当前是否全部满足；未注册的依赖方返回 `false`。
    pub fn is_satisfied(&self, dependant: &str) -> bool {
        self.dependants
            .lock()
            .get(dependant)
            .is_some_and(DependantState::all_satisfied)
    }

    fn evaluate(
        &self,
        dependant: &str,
        state: &mut DependantState,
        descriptions: &[Arc<Description>],
        events: &mut Vec<MeshNotification>,
    ) {
        for (component, version_range) in &state.requirements {
            if state.satisfied.contains(component) {
                continue;
            }
            let Ok(range) = VersionRange::parse(version_range) else {
                continue;
            };
            let matched: Vec<&Arc<Description>> = descriptions
                .iter()
                .filter(|description| {
                    description
                        .matching_component(component, &range, self.matching)
                        .is_some()
                })
                .collect();
            let Some(latest) = matched.last() else {
                continue;
            };
            tracing::debug!(
                dependant,
                component = %component,
                version = %version_range,
                matches = matched.len(),
                "dependency matched"
            );
            events.push(MeshNotification::DependencyMatched(DependencyMatch {
                dependant: dependant.to_owned(),
                component: component.clone(),
                version_range: version_range.clone(),
                match_count: matched.len(),
                description: Arc::clone(latest),
                peer_name: latest.mesh_name.clone(),
                url: latest.url.clone(),
            }));
            state.satisfied.insert(component.clone());
        }

        if !state.ready && state.all_satisfied() {
            state.ready = true;
            tracing::info!(dependant, "dependant ready");
            events.push(MeshNotification::DependantReady {
                dependant: dependant.to_owned(),
            });
        }
    }

    fn publish(&self, events: Vec<MeshNotification>) {
        for event in events {
            // 没有订阅者时发送失败，通知可以丢弃。
            let _ = self.notifications.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::description::ComponentDescription;

    fn tracker() -> (DependencyTracker, broadcast::Receiver<MeshNotification>) {
        let (tx, rx) = broadcast::channel(16);
        (DependencyTracker::new(VersionMatching::Coerced, tx), rx)
    }

    fn drain(rx: &mut broadcast::Receiver<MeshNotification>) -> Vec<MeshNotification> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn description(peer: &str, component: &str, version: &str) -> Arc<Description> {
        Arc::new(
            Description::default()
                .with_peer(peer, Some(format!("https://{peer}.local")), false)
                .with_component(component, ComponentDescription::new(version, ["method1"])),
        )
    }

    #[test]
    fn satisfied_dependant_is_ready_exactly_once() {
        let (tracker, mut rx) = tracker();
        let descriptions = vec![description("SERVER_1", "component1", "1.2.0")];

        assert!(tracker.register_and_check("app", [("component1", "^1.0.0")], &descriptions));
        assert!(tracker.recheck(&descriptions));
        assert!(tracker.recheck(&descriptions));

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        match &events[0] {
            MeshNotification::DependencyMatched(matched) => {
                assert_eq!(matched.dependant, "app");
                assert_eq!(matched.component, "component1");
                assert_eq!(matched.match_count, 1);
                assert_eq!(matched.peer_name.as_deref(), Some("SERVER_1"));
                assert_eq!(matched.url.as_deref(), Some("https://SERVER_1.local"));
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(
            events[1],
            MeshNotification::DependantReady {
                dependant: "app".into()
            }
        );
    }

    #[test]
    fn zero_requirements_are_trivially_satisfied() {
        let (tracker, mut rx) = tracker();
        let none: [(&str, &str); 0] = [];
        assert!(tracker.register_and_check("empty", none, &[]));
        assert_eq!(
            drain(&mut rx),
            vec![MeshNotification::DependantReady {
                dependant: "empty".into()
            }]
        );
    }

    #[test]
    fn arrival_satisfies_remaining_requirement() {
        let (tracker, mut rx) = tracker();
        let mut descriptions = vec![description("SERVER_1", "component1", "1.0.0")];
        tracker.register_dependency("app", "component1", "^1.0.0");
        tracker.register_dependency("app", "component2", "^2.0.0");

        assert!(!tracker.recheck(&descriptions));
        assert!(!tracker.is_satisfied("app"));
        assert_eq!(drain(&mut rx).len(), 1);

        descriptions.push(description("SERVER_2", "component2", "2.1.0"));
        assert!(tracker.recheck(&descriptions));
        let events = drain(&mut rx);
        assert!(matches!(
            &events[0],
            MeshNotification::DependencyMatched(matched) if matched.peer_name.as_deref() == Some("SERVER_2")
        ));
        assert_eq!(
            events[1],
            MeshNotification::DependantReady {
                dependant: "app".into()
            }
        );
    }

    #[test]
    fn satisfaction_is_sticky_after_departure() {
        let (tracker, mut rx) = tracker();
        let descriptions = vec![description("SERVER_1", "component1", "1.0.0")];
        assert!(tracker.register_and_check("app", [("component1", "^1.0.0")], &descriptions));
        drain(&mut rx);

        assert!(tracker.recheck(&[]));
        assert!(drain(&mut rx).is_empty());
    }
}
