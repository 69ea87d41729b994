use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use models::{Dataset, Shardset};
use serde::Deserialize;

/// The dataset/shardset catalog. The persistent relational catalog is an
/// external collaborator; this trait is the seam it plugs into. The
/// bundled implementation holds registrations in memory and can seed
/// itself from a JSON fixture file at startup.
#[async_trait::async_trait]
pub trait Catalog: Send + Sync {
    async fn dataset(&self, id: &str) -> anyhow::Result<Option<Dataset>>;
    async fn dataset_by_name(&self, name: &str) -> anyhow::Result<Option<Dataset>>;
    /// Shardsets of a dataset, optionally restricted to the given ids.
    async fn shardsets(
        &self,
        dataset_id: &str,
        ids: Option<&[String]>,
    ) -> anyhow::Result<Vec<Shardset>>;
}

#[derive(Default)]
struct Inner {
    datasets: HashMap<String, Dataset>,
    shardsets: HashMap<String, Vec<Shardset>>,
}

#[derive(Default)]
pub struct MemoryCatalog {
    inner: RwLock<Inner>,
}

#[derive(Deserialize)]
struct CatalogFixture {
    #[serde(default)]
    datasets: Vec<Dataset>,
    #[serde(default)]
    shardsets: Vec<Shardset>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_dataset(&self, dataset: Dataset) {
        self.inner
            .write()
            .unwrap()
            .datasets
            .insert(dataset.id.clone(), dataset);
    }

    pub fn add_shardset(&self, shardset: Shardset) {
        self.inner
            .write()
            .unwrap()
            .shardsets
            .entry(shardset.dataset_id.clone())
            .or_default()
            .push(shardset);
    }

    /// Seed from a JSON file of `{"datasets": [...], "shardsets": [...]}`.
    pub fn load_fixture(&self, path: &Path) -> anyhow::Result<usize> {
        let raw = std::fs::read(path)?;
        let fixture: CatalogFixture = serde_json::from_slice(&raw)?;
        let count = fixture.datasets.len() + fixture.shardsets.len();
        for dataset in fixture.datasets {
            self.add_dataset(dataset);
        }
        for shardset in fixture.shardsets {
            self.add_shardset(shardset);
        }
        Ok(count)
    }
}

#[async_trait::async_trait]
impl Catalog for MemoryCatalog {
    async fn dataset(&self, id: &str) -> anyhow::Result<Option<Dataset>> {
        Ok(self.inner.read().unwrap().datasets.get(id).cloned())
    }

    async fn dataset_by_name(&self, name: &str) -> anyhow::Result<Option<Dataset>> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .datasets
            .values()
            .find(|d| d.name == name)
            .cloned())
    }

    async fn shardsets(
        &self,
        dataset_id: &str,
        ids: Option<&[String]>,
    ) -> anyhow::Result<Vec<Shardset>> {
        let inner = self.inner.read().unwrap();
        let all = inner.shardsets.get(dataset_id).cloned().unwrap_or_default();
        Ok(match ids {
            Some(ids) if !ids.is_empty() => all
                .into_iter()
                .filter(|s| ids.contains(&s.id))
                .collect(),
            _ => all,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use models::Column;

    fn dataset() -> Dataset {
        Dataset {
            id: "ds-1".to_string(),
            name: "images".to_string(),
            uid_column_name: "uid".to_string(),
        }
    }

    fn shardset(id: &str) -> Shardset {
        Shardset {
            id: id.to_string(),
            dataset_id: "ds-1".to_string(),
            location: "file:///tmp".to_string(),
            columns: vec![Column {
                name: "uid".to_string(),
                type_: "int".to_string(),
            }],
            shards: vec![],
        }
    }

    #[tokio::test]
    async fn test_lookup_and_filtering() {
        let catalog = MemoryCatalog::new();
        catalog.add_dataset(dataset());
        catalog.add_shardset(shardset("ss-1"));
        catalog.add_shardset(shardset("ss-2"));

        assert!(catalog.dataset("ds-1").await.unwrap().is_some());
        assert!(catalog.dataset("ds-404").await.unwrap().is_none());
        assert!(catalog.dataset_by_name("images").await.unwrap().is_some());

        assert_eq!(catalog.shardsets("ds-1", None).await.unwrap().len(), 2);
        let only = catalog
            .shardsets("ds-1", Some(&["ss-2".to_string()]))
            .await
            .unwrap();
        assert_eq!(only.len(), 1);
        assert_eq!(only[0].id, "ss-2");
    }
}
