use std::path::Path;

use serde::Deserialize;
use tracing::warn;

use crate::store::SecretSource;

/// Value stored for secrets that were registered but never filled in.
const SECRET_PLACEHOLDER: &str = "REPLACE_ME";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEnvVar {
    pub name: String,
    pub required: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecretInjection {
    pub env_pairs: Vec<(String, String)>,
    pub missing: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ToolManifest {
    #[serde(default)]
    env: Option<ManifestEnv>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ManifestEnv {
    Defs(Vec<ManifestEnvDef>),
    Names(Vec<String>),
}

#[derive(Debug, Deserialize)]
struct ManifestEnvDef {
    #[serde(default)]
    name: String,
    #[serde(default)]
    required: Option<bool>,
}

/// Parses the `env` list of a tool manifest. Accepts `["NAME"]` or
/// `[{"name": "NAME", "required": false}]`; unparseable manifests declare nothing.
pub fn parse_manifest_env(text: &str) -> Vec<ManifestEnvVar> {
    let Ok(manifest) = serde_json::from_str::<ToolManifest>(text) else {
        return Vec::new();
    };
    let mut out: Vec<ManifestEnvVar> = Vec::new();
    let mut push = |name: &str, required: bool| {
        let name = name.trim();
        if !name.is_empty() && !out.iter().any(|existing| existing.name == name) {
            out.push(ManifestEnvVar {
                name: name.to_owned(),
                required,
            });
        }
    };
    match manifest.env {
        Some(ManifestEnv::Defs(defs)) => {
            for def in defs {
                push(&def.name, def.required.unwrap_or(true));
            }
        }
        Some(ManifestEnv::Names(names)) => {
            for name in names {
                push(&name, true);
            }
        }
        None => {}
    }
    out
}

pub async fn read_manifest_env(path: &Path) -> Vec<ManifestEnvVar> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => parse_manifest_env(&text),
        Err(_) => Vec::new(),
    }
}

pub async fn resolve_secrets(
    tool_id: &str,
    defs: &[ManifestEnvVar],
    source: &dyn SecretSource,
) -> SecretInjection {
    let mut injection = SecretInjection::default();
    for def in defs {
        let value = match source.lookup_secret(&def.name).await {
            Ok(value) => value,
            Err(err) => {
                warn!(
                    "failed to resolve secret {} for tool {}: {err:#}",
                    def.name, tool_id
                );
                None
            }
        };
        match value {
            Some(value) if value != SECRET_PLACEHOLDER => {
                injection.env_pairs.push((def.name.clone(), value));
            }
            _ => {
                if def.required {
                    injection.missing.push(def.name.clone());
                }
            }
        }
    }
    injection
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use anyhow::Result;
    use async_trait::async_trait;

    use super::*;

    struct MapSecrets(HashMap<String, String>);

    #[async_trait]
    impl SecretSource for MapSecrets {
        async fn lookup_secret(&self, name: &str) -> Result<Option<String>> {
            Ok(self.0.get(name).cloned())
        }
    }

    #[test]
    fn parses_both_manifest_env_shapes() {
        assert_eq!(
            parse_manifest_env(r#"{"env": ["API_KEY", " ", "API_KEY", "REGION"]}"#),
            vec![
                ManifestEnvVar {
                    name: "API_KEY".to_owned(),
                    required: true
                },
                ManifestEnvVar {
                    name: "REGION".to_owned(),
                    required: true
                },
            ]
        );
        assert_eq!(
            parse_manifest_env(
                r#"{"name": "weather", "env": [{"name": "API_KEY"}, {"name": "UNITS", "required": false}]}"#
            ),
            vec![
                ManifestEnvVar {
                    name: "API_KEY".to_owned(),
                    required: true
                },
                ManifestEnvVar {
                    name: "UNITS".to_owned(),
                    required: false
                },
            ]
        );
        assert!(parse_manifest_env(r#"{"name": "no-env"}"#).is_empty());
        assert!(parse_manifest_env("not json").is_empty());
    }

    #[tokio::test]
    async fn placeholder_and_absent_required_secrets_are_missing() {
        let source = MapSecrets(HashMap::from([
            ("API_KEY".to_owned(), "k-123".to_owned()),
            ("TOKEN".to_owned(), "REPLACE_ME".to_owned()),
        ]));
        let defs = vec![
            ManifestEnvVar {
                name: "API_KEY".to_owned(),
                required: true,
            },
            ManifestEnvVar {
                name: "TOKEN".to_owned(),
                required: true,
            },
            ManifestEnvVar {
                name: "OPTIONAL".to_owned(),
                required: false,
            },
            ManifestEnvVar {
                name: "REGION".to_owned(),
                required: true,
            },
        ];
        let injection = resolve_secrets("weather", &defs, &source).await;
        assert_eq!(
            injection.env_pairs,
            vec![("API_KEY".to_owned(), "k-123".to_owned())]
        );
        assert_eq!(
            injection.missing,
            vec!["TOKEN".to_owned(), "REGION".to_owned()]
        );
    }
}
