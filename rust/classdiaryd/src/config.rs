use crate::calc::SchoolVariant;
use anyhow::anyhow;
use std::path::PathBuf;

pub const ENV_WORKSPACE: &str = "CLASSDIARY_WORKSPACE";
pub const ENV_VARIANT: &str = "CLASSDIARY_VARIANT";
pub const ENV_LOG: &str = "CLASSDIARY_LOG";

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Opened before the request loop starts; failure to open it is fatal.
    pub workspace: Option<PathBuf>,
    /// Pinned into workspaces that have no variant recorded yet.
    pub default_variant: SchoolVariant,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let workspace = lookup(ENV_WORKSPACE)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);

        let default_variant = match lookup(ENV_VARIANT) {
            None => SchoolVariant::BasicEducation,
            Some(raw) if raw.trim().is_empty() => SchoolVariant::BasicEducation,
            Some(raw) => SchoolVariant::parse(&raw).ok_or_else(|| {
                anyhow!(
                    "{} must be 'basic' or 'higher', got {:?}",
                    ENV_VARIANT,
                    raw
                )
            })?,
        };

        Ok(Self {
            workspace,
            default_variant,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_with(vars: &[(&str, &str)]) -> anyhow::Result<Config> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_to_basic_without_workspace() {
        let cfg = config_with(&[]).expect("config");
        assert_eq!(cfg.workspace, None);
        assert_eq!(cfg.default_variant, SchoolVariant::BasicEducation);
    }

    #[test]
    fn reads_workspace_and_variant() {
        let cfg = config_with(&[(ENV_WORKSPACE, " /tmp/diary "), (ENV_VARIANT, "Higher")])
            .expect("config");
        assert_eq!(cfg.workspace, Some(PathBuf::from("/tmp/diary")));
        assert_eq!(cfg.default_variant, SchoolVariant::HigherEducation);
    }

    #[test]
    fn rejects_unknown_variant() {
        assert!(config_with(&[(ENV_VARIANT, "college")]).is_err());
    }
}
