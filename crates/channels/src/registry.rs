use std::collections::HashMap;

use qiao_common::ChannelKind;

use crate::plugin::ChannelPlugin;

/// Registry of all loaded channel plugins.
pub struct ChannelRegistry {
    plugins: HashMap<ChannelKind, Box<dyn ChannelPlugin>>,
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            plugins: HashMap::new(),
        }
    }

    pub fn register(&mut self, plugin: Box<dyn ChannelPlugin>) {
        self.plugins.insert(plugin.id(), plugin);
    }

    #[must_use]
    pub fn get(&self, id: ChannelKind) -> Option<&dyn ChannelPlugin> {
        self.plugins.get(&id).map(|p| p.as_ref())
    }

    pub fn get_mut(&mut self, id: ChannelKind) -> Option<&mut Box<dyn ChannelPlugin>> {
        self.plugins.get_mut(&id)
    }

    #[must_use]
    pub fn list(&self) -> Vec<ChannelKind> {
        let mut ids: Vec<ChannelKind> = self.plugins.keys().copied().collect();
        ids.sort_by_key(|id| id.as_str());
        ids
    }

    /// The plugin that owns this target string. An explicit channel prefix
    /// wins; an unprefixed target only resolves when a single plugin is
    /// registered.
    #[must_use]
    pub fn resolve_target_owner(&self, target: &str) -> Option<&dyn ChannelPlugin> {
        let prefixed = ChannelKind::parse(target.split(':').next().unwrap_or(""));
        if let Some(kind) = prefixed {
            return self.get(kind).filter(|p| p.resolve_target(target).is_some());
        }
        if self.plugins.len() == 1 {
            return self
                .plugins
                .values()
                .map(|p| p.as_ref())
                .find(|p| p.resolve_target(target).is_some());
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use {anyhow::Result, async_trait::async_trait, serde_json::Value};

    use qiao_common::ChatType;

    use {
        super::*,
        crate::plugin::{Capabilities, ChannelMeta, ChannelOutbound},
    };

    struct FakePlugin(ChannelKind);

    #[async_trait]
    impl ChannelPlugin for FakePlugin {
        fn id(&self) -> ChannelKind {
            self.0
        }

        fn meta(&self) -> ChannelMeta {
            ChannelMeta {
                label: "fake",
                description: "fake plugin",
            }
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities {
                chat_types: &[ChatType::Direct],
                media: false,
                reply: false,
                active_send: false,
            }
        }

        fn config_schema(&self) -> Value {
            Value::Null
        }

        async fn start_account(&mut self, _account_id: &str, _config: Value) -> Result<()> {
            Ok(())
        }

        async fn stop_account(&mut self, _account_id: &str) -> Result<()> {
            Ok(())
        }

        fn outbound(&self) -> Option<&dyn ChannelOutbound> {
            None
        }
    }

    #[test]
    fn register_and_list_sorted() {
        let mut registry = ChannelRegistry::new();
        registry.register(Box::new(FakePlugin(ChannelKind::Wecom)));
        registry.register(Box::new(FakePlugin(ChannelKind::Dingtalk)));
        assert_eq!(
            registry.list(),
            vec![ChannelKind::Dingtalk, ChannelKind::Wecom]
        );
        assert!(registry.get(ChannelKind::Dingtalk).is_some());
        assert!(registry.get(ChannelKind::Qqbot).is_none());
    }

    #[test]
    fn prefixed_target_resolves_to_its_channel() {
        let mut registry = ChannelRegistry::new();
        registry.register(Box::new(FakePlugin(ChannelKind::Wecom)));
        registry.register(Box::new(FakePlugin(ChannelKind::Qqbot)));
        let owner = registry.resolve_target_owner("qqbot:user:u1").unwrap();
        assert_eq!(owner.id(), ChannelKind::Qqbot);
        assert!(registry.resolve_target_owner("user:u1").is_none());
    }

    #[test]
    fn unprefixed_target_resolves_only_with_single_plugin() {
        let mut registry = ChannelRegistry::new();
        registry.register(Box::new(FakePlugin(ChannelKind::Feishu)));
        let owner = registry.resolve_target_owner("user:u1").unwrap();
        assert_eq!(owner.id(), ChannelKind::Feishu);
    }
}
