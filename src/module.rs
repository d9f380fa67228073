use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::common::ImageError;
use crate::directory::TableWalker;
use crate::image::BinaryImage;
use crate::loader::{LoadedModule, ModuleImage, ModuleLoader};
use crate::metadata::{AssemblyName, ReferenceEnumerator};

/// Where a dependency was declared
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DependencySource {
    Root,
    ImportTable,
    DelayLoadTable,
    ManagedReference,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DependencyEntry {
    pub name: String,
    pub source: DependencySource,
}

/// De-duplication key of a module name.
///
/// Assembly display names are kept verbatim; file and import names compare ASCII case-insensitively,
/// like the Windows loader does.
pub fn canonical_key(name: &str) -> String {
    if AssemblyName::is_display_name(name) {
        name.to_owned()
    } else {
        name.to_ascii_lowercase()
    }
}

/// Display name of a requested module: the file name when a path was given
fn display_name(requested: &str) -> String {
    let path = Path::new(requested);
    if path.components().count() > 1 {
        if let Some(file_name) = path.file_name() {
            return file_name.to_string_lossy().into_owned();
        }
    }
    requested.to_owned()
}

/// Outcome of loading one module and reading its dependency tables
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedModule {
    /// Name as it was asked for
    pub requested_name: String,
    /// Canonical name: assembly full name for managed modules, file or import name otherwise
    pub name: String,
    /// Absent when the loader could not find the module
    pub path: Option<PathBuf>,
    /// Whether the dependency tables could be read
    pub loaded: bool,
    pub is_managed: bool,
    pub failure: Option<String>,
    pub dependencies: Vec<DependencyEntry>,
}

impl ResolvedModule {
    pub(crate) fn unresolved(requested: &str, failure: String) -> Self {
        Self {
            requested_name: requested.to_owned(),
            name: display_name(requested),
            path: None,
            loaded: false,
            is_managed: false,
            failure: Some(failure),
            dependencies: vec![],
        }
    }

    /// Key under which this module is de-duplicated
    pub fn key(&self) -> String {
        canonical_key(&self.name)
    }
}

/// Loads modules and extracts their dependency lists
pub struct ModuleInspector<'a> {
    loader: &'a dyn ModuleLoader,
    references: &'a dyn ReferenceEnumerator,
}

impl<'a> ModuleInspector<'a> {
    pub fn new(loader: &'a dyn ModuleLoader, references: &'a dyn ReferenceEnumerator) -> Self {
        Self { loader, references }
    }

    /// Never fails: loader and image errors are recorded on the returned module
    pub fn inspect(&self, name: &str) -> ResolvedModule {
        let loaded = match self.loader.load(name) {
            Ok(loaded) => loaded,
            Err(e) => {
                tracing::debug!(module = name, error = %e, "module could not be loaded");
                return ResolvedModule::unresolved(name, e.to_string());
            }
        };

        match self.read_dependencies(name, &loaded) {
            Ok(module) => module,
            Err(e) => {
                tracing::warn!(module = name, path = %loaded.resolved_path.display(), error = %e, "unreadable image");
                ResolvedModule {
                    path: Some(loaded.resolved_path),
                    ..ResolvedModule::unresolved(name, e.to_string())
                }
            }
        }
    }

    fn read_dependencies(
        &self,
        requested: &str,
        loaded: &LoadedModule,
    ) -> Result<ResolvedModule, ImageError> {
        let bytes = loaded.image.bytes();
        let image = match &loaded.image {
            ModuleImage::File(b) => BinaryImage::parse_bytes(b)?,
            ModuleImage::Mapped(v) => BinaryImage::parse_mapped(v.bytes())?,
        };

        let tables = TableWalker::from_bytes(&image, bytes)?.imported_modules()?;
        let mut name = display_name(requested);
        let mut dependencies: Vec<DependencyEntry> = tables
            .imports
            .into_iter()
            .map(|name| DependencyEntry {
                name,
                source: DependencySource::ImportTable,
            })
            .chain(tables.delay_imports.into_iter().map(|name| DependencyEntry {
                name,
                source: DependencySource::DelayLoadTable,
            }))
            .collect();

        let mut is_managed = false;
        if image.is_managed() {
            if let Some(manifest) = self.references.manifest(&image, bytes)? {
                is_managed = true;
                if let Some(identity) = manifest.identity {
                    name = identity.to_string();
                }
                dependencies.extend(manifest.references.iter().map(|r| DependencyEntry {
                    name: r.to_string(),
                    source: DependencySource::ManagedReference,
                }));
            }
        }

        let file_name = loaded
            .resolved_path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned());
        dependencies.retain(|d| {
            !(d.name.eq_ignore_ascii_case(&name)
                || d.name.eq_ignore_ascii_case(requested)
                || file_name
                    .as_deref()
                    .is_some_and(|f| d.name.eq_ignore_ascii_case(f)))
        });

        Ok(ResolvedModule {
            requested_name: requested.to_owned(),
            name,
            path: Some(loaded.resolved_path.clone()),
            loaded: true,
            is_managed,
            failure: None,
            dependencies,
        })
    }
}
