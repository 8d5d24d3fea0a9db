//! The set of provider implementations the sync loop can reach.
//!
//! Provider implementations (Git working trees, Drive clients, peer HTTP
//! clients) are supplied by the embedding application and registered per
//! project:
//!
//! ```rust
//! use docmesh::providers::ProviderSet;
//!
//! let providers = ProviderSet::new();
//! // providers.register(project_name, Arc::new(MyDriveProvider::new(...)));
//! assert!(providers.is_empty());
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use docmesh_core::identity::{ProjectName, ProviderKind};
use docmesh_core::provider::Provider;

#[derive(Default, Clone)]
pub struct ProviderSet {
    providers: HashMap<(ProjectName, ProviderKind), Arc<dyn Provider>>,
}

impl ProviderSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider for a project. Replaces any earlier provider of
    /// the same kind.
    pub fn register(&mut self, project: ProjectName, provider: Arc<dyn Provider>) {
        self.providers.insert((project, provider.kind()), provider);
    }

    pub fn get(&self, project: &ProjectName, kind: ProviderKind) -> Option<Arc<dyn Provider>> {
        self.providers.get(&(project.clone(), kind)).cloned()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}
