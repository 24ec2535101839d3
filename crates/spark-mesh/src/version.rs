//! 语义化版本范围匹配。
//!
//! # 契约说明（What）
//! - 范围语法遵循网格内通用的 npm 风格：`^1.0.0`、`~1.2`、`1.2.x`、`*`、`>=1.0.0 <2.0.0`、
//!   `1.0.0 - 2.0.0`、`^1.0.0 || ^2.0.0`，裸版本 `1.2.3` 表示精确匹配；
//! - [`VersionMatching::Strict`] 只接受合法的语义化版本字符串；
//! - [`VersionMatching::Coerced`] 在严格解析失败时，从字符串中提取首个 `主.次.修订` 数字序列
//!   再参与比较（`v2` → `2.0.0`，`1.2.3.4` → `1.2.3`）。
//!
//! # 实现策略（How）
//! - 将 npm 风格的比较器序列转换为 [`semver::VersionReq`] 的逗号分隔语法；
//! - `||` 分隔的每个备选分支独立转换，任一分支命中即视为满足。

use semver::{Version, VersionReq};
use serde::Deserialize;

/// 版本字符串的解析模式。
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum VersionMatching {
    /// 只接受合法的语义化版本。
    Strict,
    /// 严格解析失败时回退到强制提取。
    #[default]
    Coerced,
}

/// 已解析的版本范围。
#[derive(Clone, Debug)]
pub struct VersionRange {
    alternatives: Vec<VersionReq>,
}

impl VersionRange {
    /// 解析 npm 风格的版本范围。
    pub fn parse(range: &str) -> Result<Self, semver::Error> {
        let alternatives = range
            .split("||")
            .map(|alternative| VersionReq::parse(&translate_alternative(alternative)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { alternatives })
    }

    /// 判断已解析的版本是否落在范围内。
    pub fn matches(&self, version: &Version) -> bool {
        self.alternatives.iter().any(|req| req.matches(version))
    }

    /// 按给定模式解析版本字符串并判断。无法解析的版本视为不满足。
    pub fn matches_str(&self, version: &str, matching: VersionMatching) -> bool {
        parse_version(version, matching).is_some_and(|version| self.matches(&version))
    }
}

/// 单次判断 `version` 是否满足 `range`；范围非法时返回 `false`。
pub fn satisfies(version: &str, range: &str, matching: VersionMatching) -> bool {
    match VersionRange::parse(range) {
        Ok(range) => range.matches_str(version, matching),
        Err(_) => false,
    }
}

/// 按模式解析版本字符串。
pub fn parse_version(version: &str, matching: VersionMatching) -> Option<Version> {
    let trimmed = version.trim();
    let cleaned = trimmed
        .strip_prefix('=')
        .unwrap_or(trimmed)
        .trim_start_matches(['v', 'V']);
    match Version::parse(cleaned) {
        Ok(version) => Some(version),
        Err(_) if matching == VersionMatching::Coerced => coerce(trimmed),
        Err(_) => None,
    }
}

/// 从任意字符串中提取首个 `主[.次[.修订]]` 数字序列。
pub fn coerce(text: &str) -> Option<Version> {
    let start = text.find(|c: char| c.is_ascii_digit())?;
    let mut parts = [0u64; 3];
    let mut filled = 0;
    for segment in text[start..].split('.') {
        if filled == parts.len() {
            break;
        }
        let digits: &str = {
            let end = segment
                .find(|c: char| !c.is_ascii_digit())
                .unwrap_or(segment.len());
            &segment[..end]
        };
        if digits.is_empty() {
            break;
        }
        parts[filled] = digits.parse().ok()?;
        filled += 1;
        if digits.len() != segment.len() {
            break;
        }
    }
    Some(Version::new(parts[0], parts[1], parts[2]))
}

fn translate_alternative(alternative: &str) -> String {
    let alternative = alternative.trim();
    if alternative.is_empty() {
        return "*".to_owned();
    }

    if let Some((low, high)) = alternative.split_once(" - ") {
        return format!(
            ">={}, <={}",
            strip_v(low.trim()),
            strip_v(high.trim())
        );
    }

    let mut comparators = Vec::new();
    let mut pending_operator: Option<&str> = None;
    for token in alternative.split_whitespace() {
        if token.chars().all(|c| matches!(c, '<' | '>' | '=' | '^' | '~')) {
            pending_operator = Some(token);
            continue;
        }
        let comparator = match pending_operator.take() {
            Some(operator) => format!("{operator}{}", strip_v(token)),
            None => translate_comparator(token),
        };
        comparators.push(comparator);
    }
    if comparators.is_empty() {
        return "*".to_owned();
    }
    comparators.join(", ")
}

fn translate_comparator(token: &str) -> String {
    let operator_len = token
        .find(|c: char| !matches!(c, '<' | '>' | '=' | '^' | '~'))
        .unwrap_or(token.len());
    let (operator, version) = token.split_at(operator_len);
    let version = strip_v(version);
    if !operator.is_empty() {
        return format!("{operator}{version}");
    }
    let wildcard = version
        .split('.')
        .any(|part| matches!(part, "x" | "X" | "*"));
    if wildcard {
        version.to_owned()
    } else {
        // 裸版本为精确匹配；不完整的版本（如 `1.2`）由 `=` 展开为前缀区间。
        format!("={version}")
    }
}

fn strip_v(version: &str) -> &str {
    version.trim_start_matches(['v', 'V'])
}
