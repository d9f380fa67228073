extern crate thiserror;

pub mod common;
pub mod coordinator;
pub mod directory;
pub mod image;
pub mod loader;
pub mod logging;
pub mod lookup_path;
pub mod metadata;
pub mod module;
pub mod progress;
pub mod query;
pub mod reader;
pub mod render;
pub mod resolver;
pub mod system;

#[cfg(test)]
mod testutil;

pub use common::{decanonicalize, path_to_string, readable_canonical_path};
pub use common::{ImageError, LookupError};
pub use image::BinaryImage;
pub use loader::{FileSystemLoader, LoadedModule, ModuleLoader};
pub use lookup_path::LookupPath;
pub use query::{LookupQuery, ResolveOptions};
pub use resolver::{DependencyGraph, ModuleNode, NodeId, Resolver};

#[cfg(windows)]
pub use loader::WindowsLoader;

/// Resolve the dependency graph of `root` through `loader`
pub fn resolve(
    root: &str,
    options: ResolveOptions,
    loader: &dyn ModuleLoader,
) -> Result<DependencyGraph, LookupError> {
    Resolver::new(loader, options).resolve(root)
}

/// Resolve the target of `query`, locating modules on disk with the simulated DLL search order
pub fn lookup(query: LookupQuery) -> Result<DependencyGraph, LookupError> {
    let options = query.parameters.clone();
    let root = path_to_string(&query.target.target_exe);
    let loader = FileSystemLoader::new(LookupPath::new(query));
    resolve(&root, options, &loader)
}
