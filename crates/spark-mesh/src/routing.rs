//! # 路由表
//!
//! ## 定位（Why）
//! - 把 (组件, 版本范围, 方法) 映射到一组可路由的实现引用，并在其上做轮询选择；
//! - 首次查询时按需构建（just-in-time），之后直接命中缓存，不再扫描清单。
//!
//! ## 契约（What）
//! - 键为结构体 [`RouteKey`]，按字段结构化比较，名称中含 `/` 不会产生歧义；
//! - 空候选列表同样被缓存，代表“确认未实现”，与“尚未解析”（键不存在）区分；
//!   只有对端到达事件（[`RoutingTable::extend_for_description`]）能改变它；
//! - 候选顺序即清单的插入顺序，不做负载感知。
//!
//! ## 并发（How）
//! - 整张表由一把 `parking_lot::Mutex` 保护；构建缓存时持锁扫描清单，保证同一键只构建一次；
//! - 锁顺序固定为“路由表 → 清单”，清单侧任何路径都不得在持有清单锁时进入路由表。

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::description::{Description, ImplementationReference};
use crate::error::MeshError;
use crate::version::{VersionMatching, VersionRange};

/// 路由缓存键。
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct RouteKey {
    pub component: String,
    pub version_range: String,
    pub method: String,
}

impl RouteKey {
    pub fn new(component: &str, version_range: &str, method: &str) -> Self {
        Self {
            component: component.to_owned(),
            version_range: version_range.to_owned(),
            method: method.to_owned(),
        }
    }

    fn not_implemented(&self) -> MeshError {
        MeshError::not_implemented(&self.component, &self.version_range, &self.method)
    }
}

/// 单个键的候选列表与轮询游标。
///
/// 不变式：列表非空时 `cursor < candidates.len()`。
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RoutingEntry {
    candidates: Vec<ImplementationReference>,
    cursor: usize,
}

impl RoutingEntry {
    pub fn new(candidates: Vec<ImplementationReference>) -> Self {
        Self {
            candidates,
            cursor: 0,
        }
    }

    /// 返回游标处的候选后再前移；首次调用返回第 0 个。
    pub fn next_candidate(&mut self) -> Option<ImplementationReference> {
        let picked = self.candidates.get(self.cursor).cloned()?;
        self.cursor = (self.cursor + 1) % self.candidates.len();
        Some(picked)
    }

    pub fn candidates(&self) -> &[ImplementationReference] {
        &self.candidates
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    fn push(&mut self, candidate: ImplementationReference) {
        self.candidates.push(candidate);
    }

    fn retain_peers_other_than(&mut self, peer_name: &str) -> usize {
        let before = self.candidates.len();
        self.candidates
            .retain(|candidate| candidate.peer_name.as_deref() != Some(peer_name));
        if self.cursor >= self.candidates.len() {
            self.cursor = 0;
        }
        before - self.candidates.len()
    }
}

/// 构建缓存时读取清单的来源。
///
/// 路由表不持有清单；由 [`DescriptionStore`](crate::store::DescriptionStore) 实现，测试中可替换为计数桩。
pub trait DescriptionSource: Send + Sync {
    /// 按插入顺序返回当前已知清单的快照。
    fn descriptions(&self) -> Vec<Arc<Description>>;
}

/// 路由表的构建策略。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Strategy {
    /// 扫描清单、按版本范围筛选。
    Described(VersionMatching),
    /// 每个键都只有一个本地候选（`light` 档案）。
    LocalOnly,
}

/// (组件, 版本范围, 方法) → 候选列表的缓存。
pub struct RoutingTable {
    entries: Mutex<HashMap<RouteKey, RoutingEntry>>,
    strategy: Strategy,
}

impl RoutingTable {
    pub fn new(matching: VersionMatching) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            strategy: Strategy::Described(matching),
        }
    }

    /// 所有调用都路由到本地会话的路由表。
    pub fn local_only() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            strategy: Strategy::LocalOnly,
        }
    }

    /// 解析下一个实现。
    ///
    /// # 逻辑（How）
    /// 1. 命中缓存：非空则轮询返回，空列表立即返回 `NotImplemented`；
    /// 2. 未命中：扫描 `source` 的全部清单构建候选列表（可能为空）并缓存，再走步骤 1。
    pub fn resolve(
        &self,
        component: &str,
        version_range: &str,
        method: &str,
        source: &dyn DescriptionSource,
    ) -> Result<ImplementationReference, MeshError> {
        let key = RouteKey::new(component, version_range, method);
        let mut entries = self.entries.lock();
        if !entries.contains_key(&key) {
            let entry = self.build(&key, source);
            tracing::debug!(
                component,
                version = version_range,
                method,
                candidates = entry.candidates.len(),
                "routing entry built"
            );
            entries.insert(key.clone(), entry);
        }
        entries
            .get_mut(&key)
            .and_then(RoutingEntry::next_candidate)
            .ok_or_else(|| key.not_implemented())
    }

    fn build(&self, key: &RouteKey, source: &dyn DescriptionSource) -> RoutingEntry {
        let matching = match self.strategy {
            Strategy::LocalOnly => return RoutingEntry::new(vec![ImplementationReference::local()]),
            Strategy::Described(matching) => matching,
        };
        let Ok(range) = VersionRange::parse(&key.version_range) else {
            tracing::warn!(version = %key.version_range, "unparseable version range matches nothing");
            return RoutingEntry::default();
        };
        let candidates = source
            .descriptions()
            .iter()
            .filter(|description| {
                description.implements(&key.component, &range, &key.method, matching)
            })
            .map(|description| description.implementation())
            .collect();
        RoutingEntry::new(candidates)
    }

    /// 对端到达：把新清单满足的候选追加到 **已缓存** 的键，不触碰其他键。返回追加数量。
    pub fn extend_for_description(&self, description: &Description) -> usize {
        let Strategy::Described(matching) = self.strategy else {
            return 0;
        };
        let candidate = description.implementation();
        let mut appended = 0;
        for (key, entry) in self.entries.lock().iter_mut() {
            let Ok(range) = VersionRange::parse(&key.version_range) else {
                continue;
            };
            if !description.implements(&key.component, &range, &key.method, matching) {
                continue;
            }
            if entry.candidates.contains(&candidate) {
                continue;
            }
            entry.push(candidate.clone());
            appended += 1;
        }
        appended
    }

    /// 对端离开：从所有缓存键中剔除该对端的候选，键本身保留。返回剔除数量。
    pub fn strip_peer(&self, peer_name: &str) -> usize {
        self.entries
            .lock()
            .values_mut()
            .map(|entry| entry.retain_peers_other_than(peer_name))
            .sum()
    }

    /// 清空全部缓存（重连或停止时）。
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// 某键当前缓存的候选；未解析过时返回 `None`。
    pub fn candidates(&self, component: &str, version_range: &str, method: &str) -> Option<Vec<ImplementationReference>> {
        self.entries
            .lock()
            .get(&RouteKey::new(component, version_range, method))
            .map(|entry| entry.candidates().to_vec())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::description::ComponentDescription;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSource {
        descriptions: Vec<Arc<Description>>,
        scans: AtomicUsize,
    }

    impl CountingSource {
        fn new(descriptions: Vec<Description>) -> Self {
            Self {
                descriptions: descriptions.into_iter().map(Arc::new).collect(),
                scans: AtomicUsize::new(0),
            }
        }
    }

    impl DescriptionSource for CountingSource {
        fn descriptions(&self) -> Vec<Arc<Description>> {
            self.scans.fetch_add(1, Ordering::SeqCst);
            self.descriptions.clone()
        }
    }

    fn peer(name: &str, version: &str, methods: &[&str]) -> Description {
        Description::default()
            .with_peer(name, None, false)
            .with_component("component1", ComponentDescription::new(version, methods.iter().copied()))
    }

    #[test]
    fn round_robin_visits_candidates_in_declaration_order() {
        let source = CountingSource::new(vec![
            peer("SERVER_1", "1.0.0", &["method1"]),
            peer("SERVER_2", "1.2.0", &["method1"]),
            peer("SERVER_3", "1.9.9", &["method1"]),
        ]);
        let table = RoutingTable::new(VersionMatching::Strict);

        let picks: Vec<_> = (0..4)
            .map(|_| {
                table
                    .resolve("component1", "^1.0.0", "method1", &source)
                    .expect("implemented")
                    .peer_name
                    .expect("remote")
            })
            .collect();
        assert_eq!(picks, ["SERVER_1", "SERVER_2", "SERVER_3", "SERVER_1"]);
        assert_eq!(source.scans.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn empty_result_is_cached_and_fails_fast() {
        let source = CountingSource::new(vec![peer("SERVER_1", "2.0.0", &["method1"])]);
        let table = RoutingTable::new(VersionMatching::Strict);

        for _ in 0..3 {
            let err = table
                .resolve("component1", "^1.0.0", "method1", &source)
                .expect_err("version mismatch");
            assert_eq!(err, MeshError::not_implemented("component1", "^1.0.0", "method1"));
        }
        assert_eq!(source.scans.load(Ordering::SeqCst), 1);
        assert_eq!(table.candidates("component1", "^1.0.0", "method1"), Some(vec![]));
    }

    #[test]
    fn arrival_extends_only_matching_cached_keys() {
        let source = CountingSource::new(vec![peer("SERVER_1", "1.0.0", &["method1"])]);
        let table = RoutingTable::new(VersionMatching::Strict);
        table.resolve("component1", "^1.0.0", "method1", &source).expect("implemented");
        table
            .resolve("component1", "^1.0.0", "method2", &source)
            .expect_err("method2 missing");

        let appended = table.extend_for_description(&peer("SERVER_2", "1.1.0", &["method2"]));
        assert_eq!(appended, 1);
        assert_eq!(
            table.candidates("component1", "^1.0.0", "method2"),
            Some(vec![ImplementationReference::remote("SERVER_2")])
        );
        assert_eq!(
            table.candidates("component1", "^1.0.0", "method1"),
            Some(vec![ImplementationReference::remote("SERVER_1")])
        );
        assert_eq!(table.candidates("component1", "^2.0.0", "method2"), None);
    }

    #[test]
    fn departure_strips_only_that_peer_and_keeps_cursor_in_range() {
        let source = CountingSource::new(vec![
            peer("SERVER_1", "1.0.0", &["method1"]),
            peer("SERVER_2", "1.0.0", &["method1"]),
        ]);
        let table = RoutingTable::new(VersionMatching::Strict);
        table.resolve("component1", "^1.0.0", "method1", &source).expect("first");

        assert_eq!(table.strip_peer("SERVER_2"), 1);
        for _ in 0..3 {
            let picked = table
                .resolve("component1", "^1.0.0", "method1", &source)
                .expect("SERVER_1 remains");
            assert_eq!(picked.peer_name.as_deref(), Some("SERVER_1"));
        }
        assert_eq!(source.scans.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn local_only_table_never_reads_descriptions() {
        let source = CountingSource::new(vec![]);
        let table = RoutingTable::local_only();
        let picked = table
            .resolve("anything", "*", "method", &source)
            .expect("always local");
        assert_eq!(picked, ImplementationReference::local());
        assert_eq!(source.scans.load(Ordering::SeqCst), 0);
    }
}
