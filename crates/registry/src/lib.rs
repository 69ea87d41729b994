use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use batch::{Batch, Sample, Value};
use models::RegistryRef;

mod loader;
pub use loader::{ModuleLoader, ModuleScanner, ScanReport};

mod preprocessor;
pub use preprocessor::plan_layers;

/// Per-invocation parameters of a registry item, as configured on the
/// iteration that references it.
pub type Params = serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unknown {kind} '{name}'")]
    UnknownRegistryItem { kind: &'static str, name: String },
    #[error("preprocessor '{name}' depends on '{dependency}' which is not included")]
    UnknownDependency { name: String, dependency: String },
}

/// Decides whether a sample participates in the iteration.
pub trait Filter: Send + Sync {
    fn name(&self) -> &str;
    fn filter(&self, sample: &Sample, params: &Params) -> anyhow::Result<bool>;
}

/// Assigns a sample to a named category.
pub trait Categorizer: Send + Sync {
    fn name(&self) -> &str;
    fn categorize(&self, sample: &Sample, params: &Params) -> anyhow::Result<String>;
}

/// Stacks a list of samples into one batch.
pub trait Collater: Send + Sync {
    fn name(&self) -> &str;
    fn collate(&self, samples: Vec<Sample>, params: &Params) -> anyhow::Result<Batch>;
}

/// Transforms a batch, possibly adding or replacing columns. Preprocessors
/// declaring dependencies run after the named preprocessors have finished.
pub trait Preprocessor: Send + Sync {
    fn name(&self) -> &str;
    fn depends_on(&self) -> Vec<String> {
        Vec::new()
    }
    fn process(&self, batch: Batch, params: &Params) -> anyhow::Result<Batch>;
}

/// A named registry of one capability kind. Registration replaces any
/// previous binding of the same name, which is how module reloads take
/// effect.
pub struct Registry<T: ?Sized> {
    kind: &'static str,
    items: RwLock<HashMap<String, Arc<T>>>,
}

impl<T: ?Sized> Registry<T> {
    fn new(kind: &'static str) -> Self {
        Registry {
            kind,
            items: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, name: &str, item: Arc<T>) {
        self.items.write().unwrap().insert(name.to_string(), item);
    }

    pub fn get(&self, name: &str) -> Result<Arc<T>, Error> {
        self.items
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownRegistryItem {
                kind: self.kind,
                name: name.to_string(),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.items.read().unwrap().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.items.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }
}

/// All four registries, as wired into the server and worker pool.
pub struct Registries {
    pub filters: Registry<dyn Filter>,
    pub categorizers: Registry<dyn Categorizer>,
    pub collaters: Registry<dyn Collater>,
    pub preprocessors: Registry<dyn Preprocessor>,
}

impl Registries {
    /// An empty set of registries with the built-in items registered.
    pub fn with_builtins() -> Self {
        let registries = Registries {
            filters: Registry::new("filter"),
            categorizers: Registry::new("categorizer"),
            collaters: Registry::new("collater"),
            preprocessors: Registry::new("preprocessor"),
        };
        registries
            .collaters
            .register("default", Arc::new(DefaultCollater));
        registries
    }

    /// Resolve the iteration's collater reference, falling back to the
    /// default stacker.
    pub fn collater_for(
        &self,
        reference: Option<&RegistryRef>,
    ) -> Result<(Arc<dyn Collater>, Params), Error> {
        match reference {
            Some(r) => Ok((self.collaters.get(&r.name)?, r.params.clone())),
            None => Ok((self.collaters.get("default")?, Params::Null)),
        }
    }
}

/// The default collater stacks records into a dict-of-lists: every column
/// becomes a list with one element per sample, in sample order.
struct DefaultCollater;

impl Collater for DefaultCollater {
    fn name(&self) -> &str {
        "default"
    }

    fn collate(&self, samples: Vec<Sample>, _params: &Params) -> anyhow::Result<Batch> {
        let mut batch = Batch::new();
        for (at, sample) in samples.into_iter().enumerate() {
            for (column, value) in sample {
                match batch
                    .entry(column)
                    .or_insert_with(|| Value::List(Vec::new()))
                {
                    Value::List(list) => {
                        // Pad columns absent from earlier samples.
                        while list.len() < at {
                            list.push(Value::Null);
                        }
                        list.push(value);
                    }
                    _ => unreachable!(),
                }
            }
        }
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    struct ModFilter;
    impl Filter for ModFilter {
        fn name(&self) -> &str {
            "mod"
        }
        fn filter(&self, sample: &Sample, params: &Params) -> anyhow::Result<bool> {
            let modulo = params.get("mod").and_then(|v| v.as_i64()).unwrap_or(2);
            let id = sample.get("id").and_then(Value::as_i64).unwrap_or(0);
            Ok(id % modulo == 0)
        }
    }

    struct AspectRatioCategorizer;
    impl Categorizer for AspectRatioCategorizer {
        fn name(&self) -> &str {
            "aspect_ratio"
        }
        fn categorize(&self, sample: &Sample, _params: &Params) -> anyhow::Result<String> {
            let width = sample.get("width").and_then(Value::as_i64).unwrap_or(0);
            let height = sample.get("height").and_then(Value::as_i64).unwrap_or(0);
            Ok(format!("{width}x{height}"))
        }
    }

    fn sample(id: i64) -> Sample {
        let mut sample = BTreeMap::new();
        sample.insert("id".to_string(), Value::Int(id));
        sample
    }

    #[test]
    fn test_get_unknown_item() {
        let registries = Registries::with_builtins();
        let err = match registries.filters.get("nope") {
            Err(e) => e,
            Ok(_) => panic!("expected error"),
        };
        assert!(matches!(err, Error::UnknownRegistryItem { kind: "filter", .. }));
    }

    #[test]
    fn test_filter_and_categorizer() {
        let registries = Registries::with_builtins();
        registries.filters.register("mod", Arc::new(ModFilter));
        registries
            .categorizers
            .register("aspect_ratio", Arc::new(AspectRatioCategorizer));

        let filter = registries.filters.get("mod").unwrap();
        let params = serde_json::json!({"mod": 2});
        assert!(filter.filter(&sample(4), &params).unwrap());
        assert!(!filter.filter(&sample(5), &params).unwrap());

        let categorizer = registries.categorizers.get("aspect_ratio").unwrap();
        let mut s = Sample::new();
        s.insert("width".to_string(), Value::Int(1280));
        s.insert("height".to_string(), Value::Int(720));
        assert_eq!(
            categorizer.categorize(&s, &Params::Null).unwrap(),
            "1280x720"
        );
    }

    #[test]
    fn test_default_collater_stacks() {
        let registries = Registries::with_builtins();
        let (collater, params) = registries.collater_for(None).unwrap();

        let batch = collater
            .collate(vec![sample(1), sample(2), sample(3)], &params)
            .unwrap();
        assert_eq!(
            batch.get("id").unwrap(),
            &Value::List(vec![Value::Int(1), Value::Int(2), Value::Int(3)])
        );
    }

    #[test]
    fn test_register_replaces() {
        let registries = Registries::with_builtins();
        registries.filters.register("mod", Arc::new(ModFilter));
        registries.filters.register("mod", Arc::new(ModFilter));
        assert_eq!(registries.filters.names(), vec!["mod"]);
    }
}
