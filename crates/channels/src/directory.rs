//! Resolve host-supplied target strings to `{channel, account, peer}`.
//!
//! Accepted forms, most qualified first:
//! `wecom-app:user:alice@work`, `dingtalk:group:cid42`, `user:alice`,
//! `alice@work`, `cid42`. A channel prefix belonging to another channel
//! makes the target unresolvable for this one.

use qiao_common::ChannelKind;

pub const DEFAULT_ACCOUNT_ID: &str = "default";

/// Peer type carried by an explicit `user:`/`group:` prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    User,
    Group,
    Unspecified,
}

/// A fully resolved outbound target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetRef {
    pub channel: ChannelKind,
    pub account_id: String,
    pub to: String,
    pub kind: TargetKind,
}

impl TargetRef {
    /// The `to` string channel senders consume, with the peer-type
    /// prefix restored when one was given.
    #[must_use]
    pub fn send_to(&self) -> String {
        match self.kind {
            TargetKind::Group => format!("group:{}", self.to),
            TargetKind::User => format!("user:{}", self.to),
            TargetKind::Unspecified => self.to.clone(),
        }
    }
}

/// Whether `raw` could belong to `channel`: it either carries this
/// channel's prefix or no channel prefix at all.
#[must_use]
pub fn can_resolve(channel: ChannelKind, raw: &str) -> bool {
    match channel_prefix(raw) {
        Some(prefixed) => prefixed == channel,
        None => true,
    }
}

/// Parse a target string for `channel`. Returns `None` when the target
/// names another channel or reduces to an empty peer id.
#[must_use]
pub fn parse_target(channel: ChannelKind, raw: &str) -> Option<TargetRef> {
    let mut rest = raw.trim();
    if rest.is_empty() {
        return None;
    }

    if let Some(prefixed) = channel_prefix(rest) {
        if prefixed != channel {
            return None;
        }
        rest = &rest[prefixed.as_str().len() + 1..];
    }

    // `@accountId` suffix, only when the suffix is a plain id
    let (rest, account_id) = match rest.rsplit_once('@') {
        Some((head, suffix))
            if !head.is_empty() && !suffix.is_empty() && !suffix.contains([':', '/']) =>
        {
            (head, suffix.to_string())
        },
        _ => (rest, DEFAULT_ACCOUNT_ID.to_string()),
    };

    let (kind, to) = if let Some(id) = rest.strip_prefix("user:") {
        (TargetKind::User, id)
    } else if let Some(id) = rest.strip_prefix("group:") {
        (TargetKind::Group, id)
    } else {
        (TargetKind::Unspecified, rest)
    };
    let to = to.trim();
    if to.is_empty() {
        return None;
    }

    Some(TargetRef {
        channel,
        account_id,
        to: to.to_string(),
        kind,
    })
}

fn channel_prefix(raw: &str) -> Option<ChannelKind> {
    let head = raw.split(':').next()?;
    ChannelKind::parse(head)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("alice", "default", "alice")]
    #[case("user:alice", "default", "alice")]
    #[case("group:cid42", "default", "cid42")]
    #[case("alice@work", "work", "alice")]
    #[case("wecom-app:user:alice@work", "work", "alice")]
    #[case("wecom-app:group:wr77", "default", "wr77")]
    fn parses_target_forms(#[case] raw: &str, #[case] account: &str, #[case] to: &str) {
        let target = parse_target(ChannelKind::WecomApp, raw).unwrap();
        assert_eq!(target.account_id, account);
        assert_eq!(target.to, to);
        assert_eq!(target.channel, ChannelKind::WecomApp);
    }

    #[test]
    fn rejects_other_channels_prefix() {
        assert!(parse_target(ChannelKind::WecomApp, "dingtalk:user:u1").is_none());
        assert!(!can_resolve(ChannelKind::WecomApp, "dingtalk:user:u1"));
        assert!(can_resolve(ChannelKind::Dingtalk, "dingtalk:user:u1"));
        assert!(can_resolve(ChannelKind::Qqbot, "group:g1"));
    }

    #[test]
    fn account_suffix_with_path_or_colon_is_part_of_the_peer() {
        let target = parse_target(ChannelKind::Feishu, "oc_x@sub:part").unwrap();
        assert_eq!(target.account_id, "default");
        assert_eq!(target.to, "oc_x@sub:part");

        let target = parse_target(ChannelKind::Feishu, "file@a/b").unwrap();
        assert_eq!(target.account_id, "default");
        assert_eq!(target.to, "file@a/b");
    }

    #[test]
    fn empty_targets_do_not_resolve() {
        assert!(parse_target(ChannelKind::Qqbot, "").is_none());
        assert!(parse_target(ChannelKind::Qqbot, "user:").is_none());
        assert!(parse_target(ChannelKind::Qqbot, "qqbot:").is_none());
    }

    #[test]
    fn unknown_prefix_is_treated_as_peer_id() {
        let target = parse_target(ChannelKind::Feishu, "oc:group-like").unwrap();
        assert_eq!(target.to, "oc:group-like");
        assert_eq!(target.kind, TargetKind::Unspecified);
    }

    #[test]
    fn peer_kind_survives_resolution() {
        let group = parse_target(ChannelKind::Qqbot, "qqbot:group:g1@main").unwrap();
        assert_eq!(group.kind, TargetKind::Group);
        assert_eq!(group.send_to(), "group:g1");

        let user = parse_target(ChannelKind::Qqbot, "user:u1").unwrap();
        assert_eq!(user.send_to(), "user:u1");

        let bare = parse_target(ChannelKind::Qqbot, "u1").unwrap();
        assert_eq!(bare.send_to(), "u1");
    }
}
