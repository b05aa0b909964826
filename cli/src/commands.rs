//! Configuration resolution and value rendering for the CLI

use anyhow::Context;
use std::path::{Path, PathBuf};
use stowage_core::{BackendKind, StoreConfig, Ttl};

/// `<config dir>/stowage/config.json`, when the platform has a config dir
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("stowage").join("config.json"))
}

/// Flag values that take precedence over the configuration file
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub backend: Option<BackendKind>,
    pub path: Option<PathBuf>,
}

/// Load the explicit file, else the default file if present, else defaults,
/// then apply flag overrides and validate the result
pub fn resolve_config(explicit: Option<&Path>, overrides: &Overrides) -> anyhow::Result<StoreConfig> {
    let mut config = match explicit {
        Some(path) => StoreConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => match default_config_path().filter(|p| p.is_file()) {
            Some(path) => StoreConfig::load(&path)
                .with_context(|| format!("loading configuration from {}", path.display()))?,
            None => StoreConfig::default(),
        },
    };

    if let Some(backend) = overrides.backend {
        config.backend = backend;
    }
    if let Some(path) = &overrides.path {
        config.embedded.path = path.clone();
    }

    config.validate()?;
    Ok(config)
}

/// Text form of a stored value; non-UTF-8 payloads print as `0x`-prefixed hex
pub fn render_value(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => format!("0x{}", hex::encode(bytes)),
    }
}

pub fn value_json(bytes: &[u8]) -> serde_json::Value {
    serde_json::Value::String(render_value(bytes))
}

pub fn render_ttl(ttl: Ttl) -> String {
    match ttl {
        Ttl::Remaining(secs) => format!("{}s", secs),
        Ttl::NoExpiry => "no expiry (-1)".to_string(),
        Ttl::Missing => "missing (-2)".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_render_value() {
        assert_eq!(render_value(b"hello"), "hello");
        assert_eq!(render_value(&[0xff, 0x00, 0x10]), "0xff0010");
        assert_eq!(value_json(b"x"), serde_json::json!("x"));
    }

    #[test]
    fn test_render_ttl() {
        assert_eq!(render_ttl(Ttl::Remaining(30)), "30s");
        assert_eq!(render_ttl(Ttl::NoExpiry), "no expiry (-1)");
        assert_eq!(render_ttl(Ttl::Missing), "missing (-2)");
    }

    #[test]
    fn test_explicit_file_with_overrides() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("config.json");
        std::fs::write(
            &file,
            r#"{ "backend": "external", "external": { "key_prefix": "cli:" } }"#,
        )
        .unwrap();

        let config = resolve_config(Some(&file), &Overrides::default()).unwrap();
        assert_eq!(config.backend, BackendKind::External);
        assert_eq!(config.external.key_prefix, "cli:");

        let overrides = Overrides {
            backend: Some(BackendKind::Embedded),
            path: Some(tmp.path().join("local.db")),
        };
        let config = resolve_config(Some(&file), &overrides).unwrap();
        assert_eq!(config.backend, BackendKind::Embedded);
        assert_eq!(config.embedded.path, tmp.path().join("local.db"));
    }

    #[test]
    fn test_missing_explicit_file_fails() {
        let tmp = TempDir::new().unwrap();
        let err = resolve_config(Some(&tmp.path().join("absent.json")), &Overrides::default());
        assert!(err.is_err());
    }

    #[test]
    fn test_override_is_validated() {
        let overrides = Overrides {
            backend: Some(BackendKind::Embedded),
            path: Some(PathBuf::new()),
        };
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("config.json");
        std::fs::write(&file, "{}").unwrap();
        assert!(resolve_config(Some(&file), &overrides).is_err());
    }
}
