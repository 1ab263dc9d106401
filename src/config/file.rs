//! JSON file configuration provider.
//!
//! Nested objects map to dotted keys: `{"billing": {"api_base": "..."}}`
//! answers `billing.api_base`. A missing file is an empty configuration.

use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tokio::sync::RwLock;

use super::provider::ConfigProvider;
use super::{ConfigError, ConfigResult};

pub struct FileConfigProvider {
    path: PathBuf,
    data: RwLock<Option<Map<String, Value>>>,
}

impl FileConfigProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            data: RwLock::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> ConfigResult<Map<String, Value>> {
        if !tokio::fs::try_exists(&self.path).await? {
            return Ok(Map::new());
        }
        let content = tokio::fs::read_to_string(&self.path).await?;
        match serde_json::from_str(&content)? {
            Value::Object(map) => Ok(map),
            _ => Err(ConfigError::Provider {
                message: format!("{} must contain a JSON object", self.path.display()),
            }),
        }
    }

    async fn save(&self, data: &Map<String, Value>) -> ConfigResult<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, serde_json::to_string_pretty(data)?).await?;
        Ok(())
    }

    /// Re-read the file on next access.
    pub async fn reload(&self) -> ConfigResult<()> {
        let fresh = self.load().await?;
        *self.data.write().await = Some(fresh);
        Ok(())
    }

    async fn snapshot(&self) -> ConfigResult<Map<String, Value>> {
        if let Some(map) = self.data.read().await.as_ref() {
            return Ok(map.clone());
        }
        let mut data = self.data.write().await;
        if data.is_none() {
            *data = Some(self.load().await?);
        }
        Ok(data.clone().unwrap_or_default())
    }
}

fn lookup<'a>(map: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    // A literal dotted key wins over the nested path.
    if let Some(value) = map.get(key) {
        return Some(value);
    }
    let mut parts = key.split('.');
    let first = map.get(parts.next()?)?;
    parts.try_fold(first, |value, part| value.get(part))
}

fn insert_path(map: &mut Map<String, Value>, key: &str, value: Value) {
    match key.split_once('.') {
        None => {
            map.insert(key.to_string(), value);
        }
        Some((head, rest)) => {
            let child = map
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !child.is_object() {
                *child = Value::Object(Map::new());
            }
            if let Value::Object(child) = child {
                insert_path(child, rest, value);
            }
        }
    }
}

fn remove_path(map: &mut Map<String, Value>, key: &str) -> bool {
    if map.remove(key).is_some() {
        return true;
    }
    match key.split_once('.') {
        Some((head, rest)) => match map.get_mut(head) {
            Some(Value::Object(child)) => remove_path(child, rest),
            _ => false,
        },
        None => false,
    }
}

fn flatten(prefix: &str, map: &Map<String, Value>, out: &mut Vec<String>) {
    for (k, v) in map {
        let key = if prefix.is_empty() {
            k.clone()
        } else {
            format!("{}.{}", prefix, k)
        };
        match v {
            Value::Object(child) => flatten(&key, child, out),
            _ => out.push(key),
        }
    }
}

#[async_trait::async_trait]
impl ConfigProvider for FileConfigProvider {
    fn name(&self) -> &str {
        "file"
    }

    async fn get_raw(&self, key: &str) -> ConfigResult<Option<String>> {
        let map = self.snapshot().await?;
        Ok(match lookup(&map, key) {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Null) | None => None,
            Some(v) => Some(v.to_string()),
        })
    }

    /// Values that parse as JSON are stored as JSON, anything else as a string.
    async fn set_raw(&self, key: &str, value: &str) -> ConfigResult<()> {
        let mut map = self.snapshot().await?;
        let parsed = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.into()));
        insert_path(&mut map, key, parsed);
        self.save(&map).await?;
        *self.data.write().await = Some(map);
        Ok(())
    }

    async fn delete(&self, key: &str) -> ConfigResult<bool> {
        let mut map = self.snapshot().await?;
        let removed = remove_path(&mut map, key);
        if removed {
            self.save(&map).await?;
            *self.data.write().await = Some(map);
        }
        Ok(removed)
    }

    async fn list_keys(&self, prefix: &str) -> ConfigResult<Vec<String>> {
        let map = self.snapshot().await?;
        let mut keys = Vec::new();
        flatten("", &map, &mut keys);
        keys.retain(|k| k.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }
}

impl std::fmt::Debug for FileConfigProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileConfigProvider")
            .field("path", &self.path)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_file_provider_nested_keys() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("voicemeter.json");
        let config = serde_json::json!({
            "server": {"bind": "127.0.0.1:9000"},
            "tokens": {"pro": 300},
            "log.json": true,
        });
        tokio::fs::write(&path, config.to_string()).await.unwrap();

        let provider = FileConfigProvider::new(&path);
        assert_eq!(
            provider.get_raw("server.bind").await.unwrap().as_deref(),
            Some("127.0.0.1:9000")
        );
        assert_eq!(provider.get_raw("tokens.pro").await.unwrap().as_deref(), Some("300"));
        assert_eq!(provider.get_raw("log.json").await.unwrap().as_deref(), Some("true"));
        assert_eq!(provider.get_raw("tokens.free").await.unwrap(), None);
        assert_eq!(
            provider.list_keys("").await.unwrap(),
            vec!["log.json", "server.bind", "tokens.pro"]
        );
    }

    #[tokio::test]
    async fn test_file_provider_missing_file_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let provider = FileConfigProvider::new(temp_dir.path().join("absent.json"));
        assert_eq!(provider.get_raw("server.bind").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_file_provider_rejects_non_object() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("list.json");
        tokio::fs::write(&path, "[1, 2]").await.unwrap();
        assert!(FileConfigProvider::new(&path).get_raw("a").await.is_err());
    }

    #[tokio::test]
    async fn test_file_provider_write_and_delete_nested() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("conf").join("voicemeter.json");
        let provider = FileConfigProvider::new(&path);

        provider.set_raw("quota.reset_period_days", "14").await.unwrap();
        provider.set_raw("auth.tenant_header", "x-user").await.unwrap();
        assert!(path.exists());

        let reread = FileConfigProvider::new(&path);
        assert_eq!(
            reread.get_raw("quota.reset_period_days").await.unwrap().as_deref(),
            Some("14")
        );

        assert!(provider.delete("auth.tenant_header").await.unwrap());
        assert!(!provider.delete("auth.tenant_header").await.unwrap());
        reread.reload().await.unwrap();
        assert_eq!(reread.get_raw("auth.tenant_header").await.unwrap(), None);
    }
}
