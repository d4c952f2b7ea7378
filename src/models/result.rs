use serde::{Deserialize, Serialize};
use std::fmt;

/// Classification of a non-success outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AbnormalStatus {
    Failed,
    Crashed,
    Expired,
    TimedOut,
    Rejected,
    Missing,
    ResultMalformed,
    Cancelled,
}

impl AbnormalStatus {
    /// Only these kinds are subject to a quest's retry policy.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Failed | Self::Crashed | Self::Expired | Self::TimedOut
        )
    }
}

impl fmt::Display for AbnormalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Failed => "FAILED",
            Self::Crashed => "CRASHED",
            Self::Expired => "EXPIRED",
            Self::TimedOut => "TIMED_OUT",
            Self::Rejected => "REJECTED",
            Self::Missing => "MISSING",
            Self::ResultMalformed => "RESULT_MALFORMED",
            Self::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbnormalFinish {
    pub status: AbnormalStatus,
    pub reason: String,
}

/// Terminal outcome of an execution (and of the attempt that adopts it).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abnormal_finish: Option<AbnormalFinish>,
}

impl ExecutionResult {
    pub fn success(data: serde_json::Value) -> Self {
        Self {
            data: Some(data),
            abnormal_finish: None,
        }
    }

    pub fn abnormal(status: AbnormalStatus, reason: impl Into<String>) -> Self {
        Self {
            data: None,
            abnormal_finish: Some(AbnormalFinish {
                status,
                reason: reason.into(),
            }),
        }
    }

    pub fn is_abnormal(&self) -> bool {
        self.abnormal_finish.is_some()
    }
}
