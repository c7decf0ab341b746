//! Asset Loading
//!
//! Templates are resolved by asset path through an [`AssetLoader`]. Loading is
//! the only suspension point of the runtime: the async path is used for runtime
//! instancing, the blocking path for immediate needs such as reading a nested
//! template's custom pins at edit time or reattaching saved instances.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use flow_types::FlowAsset;
use tracing::debug;

use crate::{FlowError, FlowResult};

// ─────────────────────────────────────────────────────────────────────────────
// Asset Loader Trait
// ─────────────────────────────────────────────────────────────────────────────

/// Source of flow templates
#[async_trait]
pub trait AssetLoader: Send + Sync {
    /// Load a template, blocking the caller
    fn load_sync(&self, path: &str) -> FlowResult<Arc<FlowAsset>>;

    /// Load a template asynchronously
    async fn load(&self, path: &str) -> FlowResult<Arc<FlowAsset>> {
        self.load_sync(path)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// In-Memory Loader
// ─────────────────────────────────────────────────────────────────────────────

/// Loader backed by templates registered in memory
#[derive(Default)]
pub struct InMemoryAssetLoader {
    assets: DashMap<String, Arc<FlowAsset>>,
}

impl InMemoryAssetLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a template under its own path
    pub fn insert(&self, asset: FlowAsset) -> Arc<FlowAsset> {
        let asset = Arc::new(asset);
        self.assets.insert(asset.path.clone(), Arc::clone(&asset));
        asset
    }

    /// Check whether a template is registered
    pub fn contains(&self, path: &str) -> bool {
        self.assets.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }
}

#[async_trait]
impl AssetLoader for InMemoryAssetLoader {
    fn load_sync(&self, path: &str) -> FlowResult<Arc<FlowAsset>> {
        self.assets
            .get(path)
            .map(|a| Arc::clone(a.value()))
            .ok_or_else(|| FlowError::AssetNotFound(path.to_string()))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Directory Loader
// ─────────────────────────────────────────────────────────────────────────────

const ASSET_EXTENSIONS: [&str; 2] = ["json", "toml"];

/// Loader reading `<root>/<path>.json` or `<root>/<path>.toml`
///
/// The requested path becomes the template's identity, whatever the file says.
pub struct DirectoryAssetLoader {
    root: PathBuf,
}

impl DirectoryAssetLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// List the asset paths of every template file under the root
    pub async fn discover(&self) -> FlowResult<Vec<String>> {
        let mut found = Vec::new();
        let mut dirs = vec![self.root.clone()];
        while let Some(dir) = dirs.pop() {
            let mut entries = tokio::fs::read_dir(&dir)
                .await
                .map_err(|e| io_error(&dir, e))?;
            while let Some(entry) = entries.next_entry().await.map_err(|e| io_error(&dir, e))? {
                let path = entry.path();
                let is_dir = entry
                    .file_type()
                    .await
                    .map_err(|e| io_error(&path, e))?
                    .is_dir();
                if is_dir {
                    dirs.push(path);
                    continue;
                }
                let is_asset = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| ASSET_EXTENSIONS.contains(&e));
                if !is_asset {
                    continue;
                }
                if let Ok(relative) = path.with_extension("").strip_prefix(&self.root) {
                    found.push(relative.to_string_lossy().replace('\\', "/"));
                }
            }
        }
        found.sort();
        Ok(found)
    }

    fn resolve(&self, path: &str) -> FlowResult<PathBuf> {
        ASSET_EXTENSIONS
            .iter()
            .map(|ext| self.root.join(format!("{}.{}", path, ext)))
            .find(|candidate| candidate.is_file())
            .ok_or_else(|| FlowError::AssetNotFound(path.to_string()))
    }

    fn parse(&self, path: &str, file: &Path, content: &str) -> FlowResult<Arc<FlowAsset>> {
        let parsed: Result<FlowAsset, String> =
            match file.extension().and_then(|e| e.to_str()) {
                Some("toml") => toml::from_str(content).map_err(|e| e.to_string()),
                _ => serde_json::from_str(content).map_err(|e| e.to_string()),
            };
        let mut asset = parsed.map_err(|message| FlowError::AssetParse {
            path: path.to_string(),
            message,
        })?;

        asset.path = path.to_string();
        if asset.name.is_empty() {
            asset.name = asset.asset_name().to_string();
        }

        debug!(path, nodes = asset.nodes.len(), "Loaded flow asset");
        Ok(Arc::new(asset))
    }
}

fn io_error(path: &Path, error: std::io::Error) -> FlowError {
    FlowError::Io {
        path: path.display().to_string(),
        message: error.to_string(),
    }
}

#[async_trait]
impl AssetLoader for DirectoryAssetLoader {
    fn load_sync(&self, path: &str) -> FlowResult<Arc<FlowAsset>> {
        let file = self.resolve(path)?;
        let content = std::fs::read_to_string(&file).map_err(|e| io_error(&file, e))?;
        self.parse(path, &file, &content)
    }

    async fn load(&self, path: &str) -> FlowResult<Arc<FlowAsset>> {
        let file = self.resolve(path)?;
        let content = tokio::fs::read_to_string(&file)
            .await
            .map_err(|e| io_error(&file, e))?;
        self.parse(path, &file, &content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const INTRO_JSON: &str = r#"{
        "path": "something-else",
        "nodes": [
            {"guid": "6f9619ff-8b86-d011-b42d-00c04fc964ff", "type": "Flow/Start"}
        ]
    }"#;

    #[test]
    fn test_in_memory_loader() {
        let loader = InMemoryAssetLoader::new();
        assert!(loader.is_empty());

        loader.insert(FlowAsset::new("quests/intro"));
        assert!(loader.contains("quests/intro"));
        assert_eq!(loader.load_sync("quests/intro").unwrap().name, "intro");
        assert!(matches!(
            loader.load_sync("quests/missing"),
            Err(FlowError::AssetNotFound(_))
        ));
    }

    #[test]
    fn test_in_memory_async_load_defaults_to_sync() {
        let loader = InMemoryAssetLoader::new();
        loader.insert(FlowAsset::new("quests/intro"));

        let asset = tokio_test::block_on(loader.load("quests/intro")).unwrap();
        assert_eq!(asset.path, "quests/intro");
        assert!(tokio_test::block_on(loader.load("quests/other")).is_err());
    }

    #[tokio::test]
    async fn test_directory_loader_json_and_toml() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("quests")).unwrap();
        std::fs::write(dir.path().join("quests/intro.json"), INTRO_JSON).unwrap();
        std::fs::write(
            dir.path().join("outro.toml"),
            "name = \"Outro\"\ncustom_outputs = [\"Done\"]\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let loader = DirectoryAssetLoader::new(dir.path());
        assert_eq!(loader.discover().await.unwrap(), vec!["outro", "quests/intro"]);

        let intro = loader.load("quests/intro").await.unwrap();
        assert_eq!(intro.path, "quests/intro");
        assert_eq!(intro.name, "intro");
        assert_eq!(intro.nodes.len(), 1);

        let outro = loader.load_sync("outro").unwrap();
        assert_eq!(outro.name, "Outro");
        assert!(outro.has_custom_output("Done"));
    }

    #[tokio::test]
    async fn test_directory_loader_reports_parse_errors() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("broken.json"), "{ nodes: ").unwrap();

        let loader = DirectoryAssetLoader::new(dir.path());
        assert!(matches!(
            loader.load("broken").await,
            Err(FlowError::AssetParse { .. })
        ));
        assert!(matches!(
            loader.load("absent").await,
            Err(FlowError::AssetNotFound(_))
        ));

        let missing = DirectoryAssetLoader::new(dir.path().join("nowhere"));
        assert!(matches!(missing.discover().await, Err(FlowError::Io { .. })));
    }
}
