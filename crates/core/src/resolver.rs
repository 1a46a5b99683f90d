use std::collections::BTreeMap;
use std::fmt;

use tracing::info;

use crate::error::CoreError;
use crate::resolvers::{AppendBytes, CommentFile};

/// A merge strategy for incremental ("vN") file changes.
///
/// `merge` receives the currently stored content and every queued change for
/// one file, in submission order, and must produce the next version
/// deterministically. It is called at most once per file per Uploader pass.
pub trait ChangeResolver: Send {
    fn name(&self) -> &str;

    /// Rejects a change payload before it is ever queued.
    fn validate(&self, _change: &[u8]) -> Result<(), CoreError> {
        Ok(())
    }

    /// Rejects a version 0 upload whose content `merge` could not later use
    /// as the current file.
    fn validate_v0(&self, _content: &[u8]) -> Result<(), CoreError> {
        Ok(())
    }

    fn merge(&self, current: &[u8], changes: &[&[u8]]) -> Result<Vec<u8>, CoreError>;
}

type ResolverFactory = Box<dyn Fn() -> Box<dyn ChangeResolver> + Send + Sync>;

/// Name-keyed registry of resolver factories. The name stored with a file in
/// the catalog selects its resolver.
pub struct ResolverRegistry {
    factories: BTreeMap<String, ResolverFactory>,
}

impl Default for ResolverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ResolverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.factories.keys()).finish()
    }
}

impl ResolverRegistry {
    pub fn new() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Registry preloaded with `AppendBytes` and `CommentFile`.
    pub fn with_builtins() -> Self {
        let builtins: [(&str, ResolverFactory); 2] = [
            (AppendBytes::NAME, Box::new(|| Box::new(AppendBytes) as Box<dyn ChangeResolver>)),
            (CommentFile::NAME, Box::new(|| Box::new(CommentFile) as Box<dyn ChangeResolver>)),
        ];
        Self {
            factories: builtins
                .into_iter()
                .map(|(name, factory)| (name.to_string(), factory))
                .collect(),
        }
    }

    pub fn register<F>(&mut self, name: &str, factory: F) -> Result<(), CoreError>
    where
        F: Fn() -> Box<dyn ChangeResolver> + Send + Sync + 'static,
    {
        if self.factories.contains_key(name) {
            return Err(CoreError::DuplicateResolver(name.to_string()));
        }
        info!(resolver = name, "registered change resolver");
        self.factories.insert(name.to_string(), Box::new(factory));
        Ok(())
    }

    pub fn register_type<R>(&mut self) -> Result<(), CoreError>
    where
        R: ChangeResolver + Default + 'static,
    {
        let name = R::default().name().to_string();
        self.register(&name, || Box::new(R::default()))
    }

    pub fn resolver(&self, name: &str) -> Result<Box<dyn ChangeResolver>, CoreError> {
        self.factories
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| CoreError::UnknownResolver(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Reverse;

    impl ChangeResolver for Reverse {
        fn name(&self) -> &str {
            "Reverse"
        }

        fn merge(&self, current: &[u8], _changes: &[&[u8]]) -> Result<Vec<u8>, CoreError> {
            Ok(current.iter().rev().copied().collect())
        }
    }

    #[test]
    fn builtins_are_registered() {
        let registry = ResolverRegistry::with_builtins();
        assert!(registry.contains("AppendBytes"));
        assert!(registry.contains("CommentFile"));
        assert_eq!(registry.names().count(), 2);
    }

    #[test]
    fn duplicate_name_is_rejected() {
        let mut registry = ResolverRegistry::with_builtins();
        let err = registry.register_type::<AppendBytes>().unwrap_err();
        assert!(matches!(err, CoreError::DuplicateResolver(name) if name == "AppendBytes"));
    }

    #[test]
    fn custom_resolver_is_selected_by_name() {
        let mut registry = ResolverRegistry::new();
        registry.register_type::<Reverse>().unwrap();
        let resolver = registry.resolver("Reverse").unwrap();
        assert_eq!(resolver.merge(b"abc", &[]).unwrap(), b"cba");
    }

    #[test]
    fn unknown_name_fails_lookup() {
        let registry = ResolverRegistry::new();
        assert!(matches!(
            registry.resolver("Nope"),
            Err(CoreError::UnknownResolver(_))
        ));
    }
}
