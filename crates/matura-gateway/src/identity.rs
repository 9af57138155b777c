//! Config-backed identity and script lookup.

use anyhow::Result;
use async_trait::async_trait;
use matura_core::{Identity, IdentityResolver, ResolveError, ScriptSource};
use std::collections::HashMap;

use crate::config::Config;

/// Identities and scripts loaded from `[[identities]]` and `[[scripts]]`.
#[derive(Debug, Default)]
pub(crate) struct ConfigDirectory {
    identities: HashMap<String, Identity>,
    scripts: HashMap<String, Vec<String>>,
}

impl ConfigDirectory {
    pub(crate) fn from_config(config: &Config) -> Self {
        Self {
            identities: config
                .identities
                .iter()
                .map(|i| (i.name.clone(), i.to_identity()))
                .collect(),
            scripts: config
                .scripts
                .iter()
                .map(|s| (s.id.clone(), s.messages.clone()))
                .collect(),
        }
    }
}

#[async_trait]
impl IdentityResolver for ConfigDirectory {
    async fn resolve(&self, name: &str) -> Result<Identity, ResolveError> {
        self.identities
            .get(name)
            .cloned()
            .ok_or_else(|| ResolveError::NotFound(name.to_owned()))
    }
}

#[async_trait]
impl ScriptSource for ConfigDirectory {
    async fn messages(&self, script_id: &str) -> Result<Option<Vec<String>>> {
        Ok(self.scripts.get(script_id).cloned())
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use matura_core::Behavior;

    fn directory() -> ConfigDirectory {
        let config: Config = toml::from_str(
            r#"
[[identities]]
name = "alice"
address = "5511987654321"
instance = "chip-a"
prompt = "You are Alice."

[[scripts]]
id = "intro"
messages = ["oi", "tudo bem?"]
"#,
        )
        .unwrap();
        ConfigDirectory::from_config(&config)
    }

    #[tokio::test]
    async fn resolves_configured_identity() {
        let dir = directory();
        let alice = dir.resolve("alice").await.unwrap();
        assert_eq!(alice.instance.as_deref(), Some("chip-a"));
        assert_eq!(alice.behavior, Behavior::Prompt("You are Alice.".to_owned()));
    }

    #[tokio::test]
    async fn unknown_identity_is_not_found() {
        let err = directory().resolve("mallory").await.unwrap_err();
        assert_eq!(err, ResolveError::NotFound("mallory".to_owned()));
    }

    #[tokio::test]
    async fn serves_scripts() {
        let dir = directory();
        assert_eq!(
            dir.messages("intro").await.unwrap().unwrap(),
            ["oi", "tudo bem?"]
        );
        assert!(dir.messages("outro").await.unwrap().is_none());
    }
}
