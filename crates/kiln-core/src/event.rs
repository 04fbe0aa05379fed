//! Repository events that may trigger a pipeline run.

use crate::pipeline::EventKind;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// An incoming repository event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerEvent {
    Push {
        branch: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sha: Option<String>,
    },
    PullRequest {
        base_branch: String,
        head_branch: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sha: Option<String>,
    },
    /// An event kind the engine does not recognise. Never matches a rule.
    Other { name: String },
}

impl TriggerEvent {
    pub fn push(branch: impl Into<String>) -> Self {
        TriggerEvent::Push {
            branch: branch.into(),
            sha: None,
        }
    }

    pub fn pull_request(base_branch: impl Into<String>, head_branch: impl Into<String>) -> Self {
        TriggerEvent::PullRequest {
            base_branch: base_branch.into(),
            head_branch: head_branch.into(),
            sha: None,
        }
    }

    /// Attach a commit sha. No-op for unrecognised events.
    pub fn with_sha(mut self, commit: impl Into<String>) -> Self {
        match &mut self {
            TriggerEvent::Push { sha, .. } | TriggerEvent::PullRequest { sha, .. } => {
                *sha = Some(commit.into());
            }
            TriggerEvent::Other { .. } => {}
        }
        self
    }

    /// Build an event from command-line style input.
    ///
    /// For pull requests `branch` is the head branch and `base` the target;
    /// when `base` is absent the head branch is used for both.
    pub fn parse(kind: &str, branch: Option<&str>, base: Option<&str>) -> Result<Self> {
        match kind {
            "push" => {
                let branch = branch
                    .filter(|b| !b.is_empty())
                    .ok_or_else(|| Error::InvalidEvent("push events require a branch".into()))?;
                Ok(Self::push(branch))
            }
            "pull_request" | "pull-request" | "pr" => {
                let head = branch.or(base).filter(|b| !b.is_empty()).ok_or_else(|| {
                    Error::InvalidEvent("pull_request events require a branch or base".into())
                })?;
                Ok(Self::pull_request(base.unwrap_or(head), head))
            }
            "" => Err(Error::InvalidEvent("event kind is empty".into())),
            other => Ok(TriggerEvent::Other {
                name: other.to_string(),
            }),
        }
    }

    /// The recognised kind of this event, if any.
    pub fn kind(&self) -> Option<EventKind> {
        match self {
            TriggerEvent::Push { .. } => Some(EventKind::Push),
            TriggerEvent::PullRequest { .. } => Some(EventKind::PullRequest),
            TriggerEvent::Other { .. } => None,
        }
    }

    pub fn kind_name(&self) -> &str {
        match self {
            TriggerEvent::Other { name } => name,
            _ => self.kind().map(|k| k.as_str()).unwrap_or_default(),
        }
    }

    /// The branch the event's commits live on (push target or PR head).
    pub fn branch(&self) -> Option<&str> {
        match self {
            TriggerEvent::Push { branch, .. } => Some(branch),
            TriggerEvent::PullRequest { head_branch, .. } => Some(head_branch),
            TriggerEvent::Other { .. } => None,
        }
    }

    /// The branch branch filters are evaluated against (push target or PR base).
    pub fn filter_branch(&self) -> Option<&str> {
        match self {
            TriggerEvent::Push { branch, .. } => Some(branch),
            TriggerEvent::PullRequest { base_branch, .. } => Some(base_branch),
            TriggerEvent::Other { .. } => None,
        }
    }

    pub fn sha(&self) -> Option<&str> {
        match self {
            TriggerEvent::Push { sha, .. } | TriggerEvent::PullRequest { sha, .. } => sha.as_deref(),
            TriggerEvent::Other { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_push() {
        let event = TriggerEvent::parse("push", Some("main"), None).unwrap();
        assert_eq!(event, TriggerEvent::push("main"));
        assert_eq!(event.kind(), Some(EventKind::Push));
        assert_eq!(event.filter_branch(), Some("main"));
    }

    #[test]
    fn test_parse_push_requires_branch() {
        assert!(matches!(
            TriggerEvent::parse("push", None, None),
            Err(Error::InvalidEvent(_))
        ));
    }

    #[test]
    fn test_parse_pull_request() {
        let event = TriggerEvent::parse("pull_request", Some("feature/x"), Some("main")).unwrap();
        assert_eq!(event.branch(), Some("feature/x"));
        assert_eq!(event.filter_branch(), Some("main"));
        assert_eq!(event.kind_name(), "pull_request");
    }

    #[test]
    fn test_parse_unknown_kind() {
        let event = TriggerEvent::parse("release", Some("main"), None).unwrap();
        assert_eq!(event.kind(), None);
        assert_eq!(event.kind_name(), "release");
        assert_eq!(event.branch(), None);
    }

    #[test]
    fn test_with_sha() {
        let event = TriggerEvent::push("main").with_sha("abc123");
        assert_eq!(event.sha(), Some("abc123"));
    }

    #[test]
    fn test_serialized_shape() {
        let json = serde_json::to_value(TriggerEvent::push("main")).unwrap();
        assert_eq!(json["kind"], "push");
        assert_eq!(json["branch"], "main");
    }
}
