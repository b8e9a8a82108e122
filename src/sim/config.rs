//! 控制器配置
//!
//! 可从 JSON 加载，所有字段都有默认值。

use super::error::SimResult;
use super::time::SimTime;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// 无人等待的失败如何处理。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// 报告后立即终止运行，`run` 返回 `SimError::Uncaught`。
    #[default]
    Abort,
    /// 报告后继续处理剩余事件。
    Continue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub failure_policy: FailurePolicy,
    /// 晚于此时刻的 record 不再分派，运行停在 `Halted`。
    pub end_time: Option<SimTime>,
    /// 是否把未捕获失败的因果追踪写入 trace sink。
    pub trace_uncaught: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            failure_policy: FailurePolicy::Abort,
            end_time: None,
            trace_uncaught: true,
        }
    }
}

impl ControllerConfig {
    pub fn from_json_str(raw: &str) -> SimResult<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> SimResult<Self> {
        let raw = fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }
}
