use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::info;

use crate::error::ServiceError;
use crate::scorer::{AnomalyScorer, EfficientAd};

type ScorerLoader = Box<dyn Fn() -> Result<Arc<dyn AnomalyScorer>, ServiceError> + Send + Sync>;

/// Name → scorer catalog with a process-wide cache of loaded models.
///
/// Lookups are case-insensitive. Loading happens on first use and the
/// loaded scorer lives for the process lifetime. The write lock is held
/// across a load, so at most one load runs per name even under concurrent
/// requests, and a failed load leaves no cache entry behind.
pub struct ModelRegistry {
    loaders: HashMap<String, ScorerLoader>,
    cache: RwLock<HashMap<String, Arc<dyn AnomalyScorer>>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self {
            loaders: HashMap::new(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Registry with every model family this service ships, resolving
    /// weight files under `model_dir`.
    pub fn with_default_models(model_dir: &Path, cuda: bool) -> Self {
        let mut registry = Self::new();
        let dir: PathBuf = model_dir.to_path_buf();
        registry.register("efficientad", move || {
            Ok(Arc::new(EfficientAd::load(&dir, cuda)?) as Arc<dyn AnomalyScorer>)
        });
        registry
    }

    /// Register a lazy loader under a (case-folded) model name.
    pub fn register<F>(&mut self, name: &str, loader: F)
    where
        F: Fn() -> Result<Arc<dyn AnomalyScorer>, ServiceError> + Send + Sync + 'static,
    {
        self.loaders
            .insert(name.to_ascii_lowercase(), Box::new(loader));
    }

    /// Names of all registered models (for the error message on a miss).
    pub fn model_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.loaders.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Resolve a model name to a ready-to-run scorer, loading it on first
    /// use.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn AnomalyScorer>, ServiceError> {
        let key = name.to_ascii_lowercase();

        {
            let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(scorer) = cache.get(&key) {
                return Ok(Arc::clone(scorer));
            }
        }

        let loader = self
            .loaders
            .get(&key)
            .ok_or_else(|| ServiceError::UnknownModel(name.to_string()))?;

        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        // Another request may have finished loading while we waited.
        if let Some(scorer) = cache.get(&key) {
            return Ok(Arc::clone(scorer));
        }
        let scorer = loader()?;
        cache.insert(key.clone(), Arc::clone(&scorer));
        info!(model = %key, "scorer loaded and cached");
        Ok(scorer)
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use ndarray::{Array2, Array4};

    struct StubScorer;

    impl AnomalyScorer for StubScorer {
        fn standardized_input(&self) -> bool {
            false
        }

        fn score(&self, input: &Array4<f32>) -> Result<Array2<f32>, ServiceError> {
            let (h, w) = (input.shape()[2], input.shape()[3]);
            Ok(Array2::zeros((h, w)))
        }
    }

    fn stub_registry(loads: Arc<AtomicUsize>) -> ModelRegistry {
        let mut registry = ModelRegistry::new();
        registry.register("EfficientAD", move || {
            loads.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(StubScorer) as Arc<dyn AnomalyScorer>)
        });
        registry
    }

    #[test]
    fn lookup_is_case_insensitive_and_cached() {
        let loads = Arc::new(AtomicUsize::new(0));
        let registry = stub_registry(Arc::clone(&loads));

        let a = registry.resolve("EfficientAD").unwrap();
        let b = registry.resolve("efficientad").unwrap();
        let c = registry.resolve("EFFICIENTAD").unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&b, &c));
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unknown_model_fails_with_its_name() {
        let registry = ModelRegistry::new();
        let err = match registry.resolve("nonexistent-model") {
            Ok(_) => panic!("resolve of an unregistered name must fail"),
            Err(err) => err,
        };
        match err {
            ServiceError::UnknownModel(name) => assert_eq!(name, "nonexistent-model"),
            other => panic!("expected UnknownModel, got {other}"),
        }
    }

    #[test]
    fn failed_load_leaves_no_cache_entry() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let mut registry = ModelRegistry::new();
        let counter = Arc::clone(&attempts);
        registry.register("flaky", move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                Err(ServiceError::Inference("first load fails".into()))
            } else {
                Ok(Arc::new(StubScorer) as Arc<dyn AnomalyScorer>)
            }
        });

        assert!(registry.resolve("flaky").is_err());
        // Second resolve retries the loader instead of hitting a poisoned
        // half-initialized entry.
        assert!(registry.resolve("flaky").is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn concurrent_resolves_load_once() {
        let loads = Arc::new(AtomicUsize::new(0));
        let registry = Arc::new(stub_registry(Arc::clone(&loads)));

        std::thread::scope(|scope| {
            for _ in 0..8 {
                let registry = Arc::clone(&registry);
                scope.spawn(move || registry.resolve("efficientad").unwrap());
            }
        });
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }
}
