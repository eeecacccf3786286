//! The action-provider boundary.
//!
//! Language handlers live outside the core. To the core they are opaque
//! planners: given a target, a provider emits the actions that build it,
//! and the core neither knows nor cares about compiler flags.

use std::{collections::BTreeMap, path::PathBuf};

use crate::{
    action::Action,
    error::Result,
    orchestrator::BuildContext,
    target::{LanguageTag, Target},
};

/// A language handler, opaque to the core.
pub trait ActionProvider: Send + Sync {
    /// The language tag this provider handles.
    fn language(&self) -> LanguageTag;

    /// Plan the actions that build `target`, in execution order.
    fn plan(&self, target: &Target, ctx: &BuildContext) -> Result<Vec<Action>>;

    /// Whether the provider demands re-execution regardless of cache
    /// state. Most providers leave fingerprinting to the core.
    fn needs_rebuild(&self, _target: &Target, _ctx: &BuildContext) -> bool {
        false
    }

    /// The output paths `target` produces, for consumers that need them
    /// without planning.
    fn outputs(&self, target: &Target, ctx: &BuildContext) -> Vec<PathBuf>;
}

/// Registry mapping language tags to their providers.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<LanguageTag, Box<dyn ActionProvider>>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("languages", &self.providers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider under its own language tag. The last
    /// registration for a tag wins.
    pub fn register(&mut self, provider: Box<dyn ActionProvider>) {
        self.providers.insert(provider.language(), provider);
    }

    pub fn get(&self, language: &LanguageTag) -> Option<&dyn ActionProvider> {
        self.providers.get(language).map(Box::as_ref)
    }

    pub fn languages(&self) -> impl Iterator<Item = &LanguageTag> {
        self.providers.keys()
    }
}
