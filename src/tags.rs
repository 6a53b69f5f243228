//! Tag registry shared by all tasks.
//!
//! Tags are identified by `(dimension, value)` with case-insensitive values. The Tagger
//! prompt is seeded with the most referenced tags of each dimension, and every tag a
//! finished tagging result carries is recorded back here.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::util::now_string;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagDimension {
    Knowledge,
    Error,
    Meta,
    Custom,
}

impl TagDimension {
    pub fn as_str(&self) -> &'static str {
        match self {
            TagDimension::Knowledge => "knowledge",
            TagDimension::Error => "error",
            TagDimension::Meta => "meta",
            TagDimension::Custom => "custom",
        }
    }
}

impl std::str::FromStr for TagDimension {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "knowledge" => Ok(TagDimension::Knowledge),
            "error" => Ok(TagDimension::Error),
            "meta" => Ok(TagDimension::Meta),
            "custom" => Ok(TagDimension::Custom),
            other => Err(format!("unknown tag dimension: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagItem {
    pub id: String,
    pub dimension: TagDimension,
    pub value: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub ref_count: u64,
    pub created_at: String,
}

impl TagItem {
    fn matches(&self, dimension: TagDimension, value: &str) -> bool {
        self.dimension == dimension && self.value.to_lowercase() == value.to_lowercase()
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TagFile {
    #[serde(default)]
    items: Vec<TagItem>,
}

pub struct TagStore {
    items: RwLock<Vec<TagItem>>,
    path: Option<PathBuf>,
}

impl TagStore {
    /// Registry that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self {
            items: RwLock::new(Vec::new()),
            path: None,
        }
    }

    /// Registry persisted as a JSON file; a missing file starts empty.
    pub async fn open(path: PathBuf) -> Result<Self, String> {
        let items = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                serde_json::from_slice::<TagFile>(&bytes)
                    .map_err(|e| format!("Failed to parse tag file {}: {}", path.display(), e))?
                    .items
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(format!("Failed to read tag file: {}", err)),
        };
        tracing::debug!(path = %path.display(), count = items.len(), "Loaded tag registry");
        Ok(Self {
            items: RwLock::new(items),
            path: Some(path),
        })
    }

    async fn save(&self, items: &[TagItem]) -> Result<(), String> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| format!("Failed to create tag dir: {}", e))?;
        }
        let data = serde_json::to_vec_pretty(&TagFile {
            items: items.to_vec(),
        })
        .map_err(|e| format!("Failed to serialize tags: {}", e))?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, data)
            .await
            .map_err(|e| format!("Failed to write tags: {}", e))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| format!("Failed to finalize tags: {}", e))
    }

    /// Record each value once per call, creating missing tags. Returns the tags created.
    pub async fn ensure(
        &self,
        dimension: TagDimension,
        values: &[String],
    ) -> Result<Vec<TagItem>, String> {
        let mut items = self.items.write().await;
        let mut created = Vec::new();
        let mut seen: Vec<String> = Vec::new();
        for value in values.iter().map(|v| v.trim()).filter(|v| !v.is_empty()) {
            let key = value.to_lowercase();
            if seen.contains(&key) {
                continue;
            }
            seen.push(key);
            match items.iter_mut().find(|t| t.matches(dimension, value)) {
                Some(item) => item.ref_count += 1,
                None => {
                    let item = TagItem {
                        id: Uuid::new_v4().simple().to_string(),
                        dimension,
                        value: value.to_string(),
                        aliases: Vec::new(),
                        ref_count: 1,
                        created_at: now_string(),
                    };
                    created.push(item.clone());
                    items.push(item);
                }
            }
        }
        if !seen.is_empty() {
            self.save(&items).await?;
        }
        Ok(created)
    }

    /// Most referenced values of a dimension, ties broken alphabetically.
    pub async fn top(&self, dimension: TagDimension, limit: usize) -> Vec<String> {
        let items = self.items.read().await;
        let mut ranked: Vec<&TagItem> = items.iter().filter(|t| t.dimension == dimension).collect();
        ranked.sort_by(|a, b| b.ref_count.cmp(&a.ref_count).then_with(|| a.value.cmp(&b.value)));
        ranked
            .into_iter()
            .take(limit)
            .map(|t| t.value.clone())
            .collect()
    }

    pub async fn list(&self, dimension: Option<TagDimension>) -> Vec<TagItem> {
        let items = self.items.read().await;
        let mut listed: Vec<TagItem> = items
            .iter()
            .filter(|t| dimension.map_or(true, |d| t.dimension == d))
            .cloned()
            .collect();
        listed.sort_by(|a, b| a.value.cmp(&b.value));
        listed
    }
}
