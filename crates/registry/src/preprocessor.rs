use std::sync::Arc;

use models::RegistryRef;

use crate::{Error, Params, Preprocessor, Registry};

/// Order the iteration's preprocessors into topological layers using
/// their declared dependencies. All preprocessors within a layer may run
/// concurrently; layers run in sequence. A dependency naming a
/// preprocessor that is not part of the iteration's list is an error.
pub fn plan_layers(
    references: &[RegistryRef],
    registry: &Registry<dyn Preprocessor>,
) -> Result<Vec<Vec<(Arc<dyn Preprocessor>, Params)>>, Error> {
    let mut remaining: Vec<(Arc<dyn Preprocessor>, Params)> = references
        .iter()
        .map(|r| Ok((registry.get(&r.name)?, r.params.clone())))
        .collect::<Result<_, Error>>()?;

    let included: Vec<String> = remaining.iter().map(|(p, _)| p.name().to_string()).collect();

    let mut done: Vec<String> = Vec::new();
    let mut layers = Vec::new();

    while !remaining.is_empty() {
        let mut layer = Vec::new();
        let mut deferred = Vec::new();

        for (preprocessor, params) in remaining {
            let depends_on = preprocessor.depends_on();
            if let Some(dependency) = depends_on.iter().find(|d| !included.contains(d)) {
                return Err(Error::UnknownDependency {
                    name: preprocessor.name().to_string(),
                    dependency: dependency.clone(),
                });
            }
            if depends_on.iter().all(|d| done.contains(d)) {
                layer.push((preprocessor, params));
            } else {
                deferred.push((preprocessor, params));
            }
        }

        // Every remaining preprocessor waits on another remaining one:
        // a dependency cycle.
        if layer.is_empty() {
            let name = deferred[0].0.name().to_string();
            let dependency = deferred[0]
                .0
                .depends_on()
                .into_iter()
                .find(|d| !done.contains(d))
                .unwrap_or_default();
            return Err(Error::UnknownDependency { name, dependency });
        }

        for (preprocessor, _) in &layer {
            done.push(preprocessor.name().to_string());
        }
        remaining = deferred;
        layers.push(layer);
    }

    Ok(layers)
}
