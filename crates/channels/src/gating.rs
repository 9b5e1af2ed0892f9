//! DM and group admission policies, evaluated per inbound message.

use serde::{Deserialize, Serialize};

use qiao_common::ChatType;

/// DM access policy.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DmPolicy {
    /// Anyone can DM the bot.
    #[default]
    Open,
    /// Unknown senders are admitted; the host runs its pairing flow.
    Pairing,
    /// Only senders on the allowlist.
    Allowlist,
    /// DMs disabled.
    Disabled,
}

/// Group access policy.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GroupPolicy {
    /// Bot responds in all groups.
    #[default]
    Open,
    /// Only groups on the allowlist.
    Allowlist,
    /// Groups disabled.
    Disabled,
}

/// Per-account admission policy, immutable for one message evaluation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Policy {
    pub dm_policy: DmPolicy,
    pub group_policy: GroupPolicy,
    pub require_mention: bool,
    pub allow_from: Vec<String>,
    pub group_allow_from: Vec<String>,
}

impl Policy {
    /// The documented default: groups require a mention.
    #[must_use]
    pub fn standard() -> Self {
        Self {
            require_mention: true,
            ..Self::default()
        }
    }
}

/// Outcome of a policy evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyDecision {
    pub allowed: bool,
    pub reason: &'static str,
}

impl PolicyDecision {
    const fn allow() -> Self {
        Self {
            allowed: true,
            reason: "allowed",
        }
    }

    const fn deny(reason: &'static str) -> Self {
        Self {
            allowed: false,
            reason,
        }
    }
}

/// Case-insensitive exact match against an allowlist.
///
/// An empty list matches nothing here; policies that treat "no list" as
/// open must check emptiness themselves. An explicit allowlist policy
/// with an empty list denies everyone rather than silently opening up.
#[must_use]
pub fn is_listed(id: &str, allowlist: &[String]) -> bool {
    let id = id.trim();
    allowlist.iter().any(|entry| entry.trim().eq_ignore_ascii_case(id))
}

/// Evaluate the admission policy for one inbound message.
#[must_use]
pub fn evaluate(
    chat_type: ChatType,
    sender_id: &str,
    peer_id: &str,
    was_mentioned: bool,
    policy: &Policy,
) -> PolicyDecision {
    match chat_type {
        ChatType::Direct => match policy.dm_policy {
            DmPolicy::Disabled => PolicyDecision::deny("dms disabled"),
            DmPolicy::Open => PolicyDecision::allow(),
            // Admitted here; the host decides whether the sender is paired.
            DmPolicy::Pairing => PolicyDecision::allow(),
            DmPolicy::Allowlist => {
                if is_listed(sender_id, &policy.allow_from) {
                    PolicyDecision::allow()
                } else {
                    PolicyDecision::deny("sender not on allowlist")
                }
            },
        },
        ChatType::Group => {
            match policy.group_policy {
                GroupPolicy::Disabled => return PolicyDecision::deny("groups disabled"),
                GroupPolicy::Allowlist => {
                    if !is_listed(peer_id, &policy.group_allow_from) {
                        return PolicyDecision::deny("group not on allowlist");
                    }
                },
                GroupPolicy::Open => {},
            }
            if policy.require_mention && !was_mentioned {
                return PolicyDecision::deny("mention required");
            }
            PolicyDecision::allow()
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> Policy {
        Policy::standard()
    }

    #[test]
    fn open_dm_allows_anyone() {
        let decision = evaluate(ChatType::Direct, "anyone", "anyone", false, &policy());
        assert!(decision.allowed);
    }

    #[test]
    fn disabled_dm_rejects() {
        let mut p = policy();
        p.dm_policy = DmPolicy::Disabled;
        let decision = evaluate(ChatType::Direct, "u1", "u1", false, &p);
        assert_eq!(decision.reason, "dms disabled");
    }

    #[test]
    fn pairing_dm_admits_unknown_senders() {
        let mut p = policy();
        p.dm_policy = DmPolicy::Pairing;
        assert!(evaluate(ChatType::Direct, "stranger", "stranger", false, &p).allowed);
    }

    #[test]
    fn allowlist_dm_matches_case_insensitively() {
        let mut p = policy();
        p.dm_policy = DmPolicy::Allowlist;
        p.allow_from = vec!["Alice".into()];
        assert!(evaluate(ChatType::Direct, "alice", "alice", false, &p).allowed);
        assert!(!evaluate(ChatType::Direct, "bob", "bob", false, &p).allowed);
    }

    #[test]
    fn group_requires_mention_by_default() {
        let p = policy();
        assert!(!evaluate(ChatType::Group, "u1", "g1", false, &p).allowed);
        assert!(evaluate(ChatType::Group, "u1", "g1", true, &p).allowed);
    }

    #[test]
    fn group_mention_not_required_when_disabled() {
        let mut p = policy();
        p.require_mention = false;
        assert!(evaluate(ChatType::Group, "u1", "g1", false, &p).allowed);
    }

    #[test]
    fn group_allowlist_checks_peer_not_sender() {
        let mut p = policy();
        p.group_policy = GroupPolicy::Allowlist;
        p.group_allow_from = vec!["g1".into()];
        assert!(evaluate(ChatType::Group, "u1", "g1", true, &p).allowed);
        assert!(!evaluate(ChatType::Group, "g1", "g2", true, &p).allowed);
    }

    #[test]
    fn group_disabled_beats_mention() {
        let mut p = policy();
        p.group_policy = GroupPolicy::Disabled;
        assert_eq!(
            evaluate(ChatType::Group, "u1", "g1", true, &p).reason,
            "groups disabled"
        );
    }

    /// Security regression: removing the last allowlist entry must not
    /// silently switch an explicit allowlist policy to open access.
    #[test]
    fn security_empty_allowlist_under_allowlist_policy_denies() {
        let mut p = policy();
        p.dm_policy = DmPolicy::Allowlist;
        p.allow_from = vec!["alice".into()];
        assert!(evaluate(ChatType::Direct, "alice", "alice", false, &p).allowed);

        p.allow_from.clear();
        assert!(!evaluate(ChatType::Direct, "alice", "alice", false, &p).allowed);
        assert!(!evaluate(ChatType::Direct, "eve", "eve", false, &p).allowed);

        let mut g = policy();
        g.group_policy = GroupPolicy::Allowlist;
        g.group_allow_from.clear();
        assert!(!evaluate(ChatType::Group, "u1", "g1", true, &g).allowed);
    }

    #[test]
    fn policy_deserializes_from_camel_free_json() {
        let json = r#"{
            "dm_policy": "pairing",
            "group_policy": "allowlist",
            "require_mention": true,
            "group_allow_from": ["g9"]
        }"#;
        let p: Policy = serde_json::from_str(json).unwrap();
        assert_eq!(p.dm_policy, DmPolicy::Pairing);
        assert_eq!(p.group_policy, GroupPolicy::Allowlist);
        assert_eq!(p.group_allow_from, vec!["g9"]);
    }
}
