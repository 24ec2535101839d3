//! 对端清单（description）数据模型。
//!
//! 清单文档位于 [`DESCRIPTION_PATH`](crate::transport::DESCRIPTION_PATH)：
//!
//! ```json
//! {"name": "DOMAIN", "initializing": false,
//!  "components": {"component1": {"version": "1.2.4", "methods": {"method1": {}}}}}
//! ```
//!
//! 拉取方在解码后补上对端身份（`meshName`、`url`、`isSelf`）。

use std::collections::{BTreeMap, BTreeSet};

use serde::Deserialize;
use serde::de::IgnoredAny;
use serde_json::Value;

use crate::error::MeshError;
use crate::version::{VersionMatching, VersionRange};

/// 清单中的单个组件。
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ComponentDescription {
    pub version: String,
    pub methods: BTreeSet<String>,
}

impl ComponentDescription {
    pub fn new<I, S>(version: impl Into<String>, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            version: version.into(),
            methods: methods.into_iter().map(Into::into).collect(),
        }
    }

    /// 组件版本是否落在范围内。
    pub fn satisfies(&self, range: &VersionRange, matching: VersionMatching) -> bool {
        range.matches_str(&self.version, matching)
    }
}

/// 一个对端发布的清单。
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Description {
    /// 网格域名（清单中的 `name`）。
    pub domain: String,
    /// 发布该清单的对端成员名。
    pub mesh_name: Option<String>,
    pub url: Option<String>,
    /// 是否为本地会话所在对端的清单。
    pub is_self: bool,
    /// 对端启动尚未完成时为 `true`。
    pub initializing: bool,
    pub components: BTreeMap<String, ComponentDescription>,
}

#[derive(Deserialize)]
struct RawDescription {
    #[serde(default)]
    name: String,
    #[serde(default)]
    initializing: bool,
    #[serde(default)]
    components: BTreeMap<String, RawComponent>,
}

#[derive(Deserialize)]
struct RawComponent {
    #[serde(default)]
    version: String,
    #[serde(default)]
    methods: BTreeMap<String, IgnoredAny>,
}

impl Description {
    /// 解码清单文档；`peer` 仅用于错误上下文。
    pub fn from_manifest(value: Value, peer: &str) -> Result<Self, MeshError> {
        let raw: RawDescription =
            serde_json::from_value(value).map_err(|err| MeshError::Description {
                peer: peer.to_owned(),
                detail: err.to_string(),
            })?;
        let components = raw
            .components
            .into_iter()
            .map(|(name, component)| {
                (
                    name,
                    ComponentDescription {
                        version: component.version,
                        methods: component.methods.into_keys().collect(),
                    },
                )
            })
            .collect();
        Ok(Self {
            domain: raw.name,
            initializing: raw.initializing,
            components,
            ..Self::default()
        })
    }

    /// 标注对端身份。
    pub fn with_peer(mut self, mesh_name: impl Into<String>, url: Option<String>, is_self: bool) -> Self {
        self.mesh_name = Some(mesh_name.into());
        self.url = url;
        self.is_self = is_self;
        self
    }

    pub fn with_component(mut self, name: impl Into<String>, component: ComponentDescription) -> Self {
        self.components.insert(name.into(), component);
        self
    }

    /// 返回版本满足范围的组件条目。
    pub fn matching_component(
        &self,
        component: &str,
        range: &VersionRange,
        matching: VersionMatching,
    ) -> Option<&ComponentDescription> {
        self.components
            .get(component)
            .filter(|entry| entry.satisfies(range, matching))
    }

    /// 清单是否以满足范围的版本实现了 `component.method`。
    pub fn implements(
        &self,
        component: &str,
        range: &VersionRange,
        method: &str,
        matching: VersionMatching,
    ) -> bool {
        self.matching_component(component, range, matching)
            .is_some_and(|entry| entry.methods.contains(method))
    }

    /// 由该清单产生的实现引用。
    pub fn implementation(&self) -> ImplementationReference {
        ImplementationReference {
            is_local: self.is_self,
            peer_name: self.mesh_name.clone(),
        }
    }
}

/// (组件, 方法) 的一个可路由目标。
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ImplementationReference {
    pub is_local: bool,
    pub peer_name: Option<String>,
}

impl ImplementationReference {
    /// 本地会话目标（`light` 档案使用）。
    pub fn local() -> Self {
        Self {
            is_local: true,
            peer_name: None,
        }
    }

    pub fn remote(peer_name: impl Into<String>) -> Self {
        Self {
            is_local: false,
            peer_name: Some(peer_name.into()),
        }
    }
}
