//! 客户端配置。
//!
//! # 契约说明（What）
//! - 请求超时：`set` 发布请求时交给传输层的确认超时；
//! - 应答超时：请求发布成功后等待回复的最长时间，到期即移除挂起条目并向调用方报告超时；
//! - 两个超时均有档案默认值（`standard` 为 10 s / 20 s，`light` 为 60 s / 120 s），显式值优先；
//! - `initializing_retry_interval`：对端清单仍处于 `initializing` 时的固定重试间隔（默认 1 s）。
//!
//! # 加载方式（How）
//! - 代码内通过 `ClientConfig::default()` + `with_*` 方法构造；
//! - 或通过 [`ClientConfig::from_toml_str`] 解析 TOML，时长字段以毫秒表示：
//!
//! ```toml
//! profile = "light"
//! domain = "DOMAIN_NAME"
//! request_timeout_ms = 5000
//! version_matching = "strict"
//! ```

use core::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::version::VersionMatching;

/// 部署档案，决定默认超时与发现方式。
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ClientProfile {
    /// 拉取对端清单、按版本范围路由。
    #[default]
    Standard,
    /// 不拉取清单；域名来自配置，所有调用均路由到本地会话。
    Light,
}

impl ClientProfile {
    fn default_request_timeout(self) -> Duration {
        match self {
            ClientProfile::Standard => Duration::from_secs(10),
            ClientProfile::Light => Duration::from_secs(60),
        }
    }

    fn default_response_timeout(self) -> Duration {
        match self {
            ClientProfile::Standard => Duration::from_secs(20),
            ClientProfile::Light => Duration::from_secs(120),
        }
    }
}

const DEFAULT_INITIALIZING_RETRY: Duration = Duration::from_secs(1);

/// 网格客户端配置。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientConfig {
    profile: ClientProfile,
    request_timeout: Option<Duration>,
    response_timeout: Option<Duration>,
    initializing_retry_interval: Duration,
    version_matching: VersionMatching,
    domain: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            profile: ClientProfile::Standard,
            request_timeout: None,
            response_timeout: None,
            initializing_retry_interval: DEFAULT_INITIALIZING_RETRY,
            version_matching: VersionMatching::default(),
            domain: None,
        }
    }
}

/// TOML 载体；时长以毫秒表示。
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawClientConfig {
    profile: ClientProfile,
    request_timeout_ms: Option<u64>,
    response_timeout_ms: Option<u64>,
    initializing_retry_interval_ms: Option<u64>,
    version_matching: VersionMatching,
    domain: Option<String>,
}

impl ClientConfig {
    /// 构造 `light` 档案配置。
    pub fn light(domain: impl Into<String>) -> Self {
        Self {
            profile: ClientProfile::Light,
            domain: Some(domain.into()),
            ..Self::default()
        }
    }

    /// 解析 TOML 文本并校验。
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let raw: RawClientConfig =
            toml::from_str(text).map_err(|err| ConfigError::Parse(err.to_string()))?;
        let config = Self {
            profile: raw.profile,
            request_timeout: raw.request_timeout_ms.map(Duration::from_millis),
            response_timeout: raw.response_timeout_ms.map(Duration::from_millis),
            initializing_retry_interval: raw
                .initializing_retry_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_INITIALIZING_RETRY),
            version_matching: raw.version_matching,
            domain: raw.domain,
        };
        config.validate()?;
        Ok(config)
    }

    /// 校验配置的一致性。
    pub fn validate(&self) -> Result<(), ConfigError> {
        let durations = [
            ("request_timeout", self.request_timeout()),
            ("response_timeout", self.response_timeout()),
            (
                "initializing_retry_interval",
                self.initializing_retry_interval,
            ),
        ];
        for (field, value) in durations {
            if value.is_zero() {
                return Err(ConfigError::ZeroDuration { field });
            }
        }
        if self.profile == ClientProfile::Light && self.domain.is_none() {
            return Err(ConfigError::MissingDomain);
        }
        Ok(())
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = Some(timeout);
        self
    }

    pub fn with_initializing_retry_interval(mut self, interval: Duration) -> Self {
        self.initializing_retry_interval = interval;
        self
    }

    pub fn with_version_matching(mut self, matching: VersionMatching) -> Self {
        self.version_matching = matching;
        self
    }

    pub fn profile(&self) -> ClientProfile {
        self.profile
    }

    /// 生效的请求超时（显式值优先于档案默认值）。
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
            .unwrap_or_else(|| self.profile.default_request_timeout())
    }

    /// 生效的应答超时（显式值优先于档案默认值）。
    pub fn response_timeout(&self) -> Duration {
        self.response_timeout
            .unwrap_or_else(|| self.profile.default_response_timeout())
    }

    pub fn initializing_retry_interval(&self) -> Duration {
        self.initializing_retry_interval
    }

    pub fn version_matching(&self) -> VersionMatching {
        self.version_matching
    }

    /// `light` 档案下的网格域名。
    pub fn domain(&self) -> Option<&str> {
        self.domain.as_deref()
    }
}
