//! Content-addressed cache of compiled artifacts.
//!
//! Entries are keyed by the hash of their logical name and versioned by the
//! hash of their source. Each category has its own lock, held only for map
//! access; artifacts are built and dropped outside of it.

use crate::gpu::Backend;
use crate::hash::{Digest, hash_str};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// A published artifact together with its identity and version.
pub struct Resource<T> {
    pub name: String,
    pub name_hash: Digest,
    pub hash: Digest,
    pub artifact: Arc<T>,
}

impl<T> Resource<T> {
    /// Builds a resource whose identity is derived from `name`.
    pub fn new(name: impl Into<String>, hash: Digest, artifact: T) -> Self {
        let name = name.into();
        Self {
            name_hash: hash_str(&name),
            name,
            hash,
            artifact: Arc::new(artifact),
        }
    }
}

impl<T> Clone for Resource<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            name_hash: self.name_hash,
            hash: self.hash,
            artifact: self.artifact.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Resource<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resource")
            .field("name", &self.name)
            .field("name_hash", &self.name_hash)
            .field("hash", &self.hash)
            .finish_non_exhaustive()
    }
}

pub type ResourceMap<T> = Mutex<HashMap<Digest, Resource<T>>>;

/// Selects one of the registry's maps.
pub trait Category<S, P, T> {
    type Artifact;
    const NAME: &'static str;

    fn map(registry: &ResourceRegistry<S, P, T>) -> &ResourceMap<Self::Artifact>;
}

pub enum Shaders {}
pub enum Programs {}
pub enum Textures {}

impl<S, P, T> Category<S, P, T> for Shaders {
    type Artifact = S;
    const NAME: &'static str = "shader";

    fn map(registry: &ResourceRegistry<S, P, T>) -> &ResourceMap<S> {
        &registry.shaders
    }
}

impl<S, P, T> Category<S, P, T> for Programs {
    type Artifact = P;
    const NAME: &'static str = "program";

    fn map(registry: &ResourceRegistry<S, P, T>) -> &ResourceMap<P> {
        &registry.programs
    }
}

impl<S, P, T> Category<S, P, T> for Textures {
    type Artifact = T;
    const NAME: &'static str = "texture";

    fn map(registry: &ResourceRegistry<S, P, T>) -> &ResourceMap<T> {
        &registry.textures
    }
}

pub struct ResourceRegistry<S, P, T> {
    shaders: ResourceMap<S>,
    programs: ResourceMap<P>,
    textures: ResourceMap<T>,
}

/// Registry holding the artifact types of backend `G`.
pub type BackendRegistry<G> =
    ResourceRegistry<<G as Backend>::Shader, <G as Backend>::Program, <G as Backend>::Texture>;

impl<S, P, T> Default for ResourceRegistry<S, P, T> {
    fn default() -> Self {
        Self {
            shaders: Mutex::new(HashMap::new()),
            programs: Mutex::new(HashMap::new()),
            textures: Mutex::new(HashMap::new()),
        }
    }
}

impl<S, P, T> ResourceRegistry<S, P, T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes `resource`, replacing any entry with the same name hash.
    ///
    /// The replaced entry is handed back so its artifact is released outside
    /// the category lock.
    pub fn add<C: Category<S, P, T>>(
        &self,
        resource: Resource<C::Artifact>,
    ) -> Option<Resource<C::Artifact>> {
        C::map(self).lock().insert(resource.name_hash, resource)
    }

    pub fn get<C: Category<S, P, T>>(&self, name_hash: Digest) -> Option<Resource<C::Artifact>> {
        C::map(self).lock().get(&name_hash).cloned()
    }

    pub fn get_by_name<C: Category<S, P, T>>(&self, name: &str) -> Option<Resource<C::Artifact>> {
        self.get::<C>(hash_str(name))
    }

    /// True only if `name_hash` is present with exactly `hash` as its version.
    pub fn exists<C: Category<S, P, T>>(&self, name_hash: Digest, hash: Digest) -> bool {
        C::map(self)
            .lock()
            .get(&name_hash)
            .is_some_and(|resource| resource.hash == hash)
    }

    pub fn len<C: Category<S, P, T>>(&self) -> usize {
        C::map(self).lock().len()
    }
}
