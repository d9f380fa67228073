//! Recursive expansion of a root module into its dependency graph

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::ops::Index;
use std::path::PathBuf;
use std::sync::Arc;

use crate::common::LookupError;
use crate::coordinator::Coordinator;
use crate::loader::ModuleLoader;
use crate::metadata::{MetadataReader, ReferenceEnumerator};
use crate::module::{canonical_key, DependencyEntry, DependencySource, ModuleInspector, ResolvedModule};
use crate::progress::{NoProgress, ProgressSink};
use crate::query::ResolveOptions;

/// Identity of a node within one [`DependencyGraph`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// One occurrence of a module in the resolved graph
#[derive(Debug, Clone, Serialize)]
pub struct ModuleNode {
    pub id: NodeId,
    /// Canonical name: assembly full name for managed modules, file or import name otherwise
    pub name: String,
    pub parent: Option<NodeId>,
    /// Empty for the root
    pub parent_name: String,
    /// The root is at depth 0
    pub depth: usize,
    pub path: Option<PathBuf>,
    pub loaded: bool,
    pub failure: Option<String>,
    pub is_managed: bool,
    pub source: DependencySource,
    /// Loaded and has dependencies, but sits at the depth limit
    pub truncated: bool,
    /// Set on non-unique copies: the node whose children describe this module
    pub duplicate_of: Option<NodeId>,
    pub children: Vec<NodeId>,
}

impl ModuleNode {
    /// Resolved path when loaded, failure detail otherwise
    pub fn status_text(&self) -> String {
        match (&self.failure, &self.path) {
            (Some(failure), _) => failure.clone(),
            (None, Some(path)) => path.display().to_string(),
            (None, None) => String::new(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

/// Arena of the nodes produced by one resolution run
#[derive(Debug, Clone, Serialize)]
pub struct DependencyGraph {
    root: NodeId,
    unique: bool,
    nodes: Vec<ModuleNode>,
}

impl Index<NodeId> for DependencyGraph {
    type Output = ModuleNode;

    fn index(&self, id: NodeId) -> &ModuleNode {
        &self.nodes[id.0]
    }
}

impl DependencyGraph {
    pub fn root(&self) -> &ModuleNode {
        &self[self.root]
    }

    pub fn get(&self, id: NodeId) -> Option<&ModuleNode> {
        self.nodes.get(id.0)
    }

    pub fn nodes(&self) -> &[ModuleNode] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn is_unique(&self) -> bool {
        self.unique
    }

    pub fn children<'a>(&'a self, node: &'a ModuleNode) -> impl Iterator<Item = &'a ModuleNode> + 'a {
        node.children.iter().map(move |&c| &self[c])
    }

    /// Pre-order walk from the root, visiting every identity once; `level` is the nesting depth of
    /// the occurrence being visited
    pub fn visit_depth_first<F: FnMut(&ModuleNode, usize)>(&self, mut visit: F) {
        let mut seen = HashSet::new();
        let mut stack = vec![(self.root, 0usize)];
        while let Some((id, level)) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            let node = &self[id];
            visit(node, level);
            stack.extend(node.children.iter().rev().map(|&c| (c, level + 1)));
        }
    }

    /// Nodes that carry a module's resolution (not copies), in creation order
    pub fn canonical_nodes(&self) -> impl Iterator<Item = &ModuleNode> {
        self.nodes.iter().filter(|n| n.duplicate_of.is_none())
    }

    /// Modules that could not be loaded, each listed once
    pub fn failed(&self, managed_only: bool) -> Vec<&ModuleNode> {
        self.canonical_nodes()
            .filter(|n| !n.loaded)
            .filter(|n| !managed_only || n.source == DependencySource::ManagedReference)
            .collect()
    }

    /// Names of all distinct modules, in discovery order
    pub fn unique_names(&self) -> Vec<&str> {
        self.canonical_nodes().map(|n| n.name.as_str()).collect()
    }

    /// Canonical node of a module, looked up by name
    pub fn find(&self, name: &str) -> Option<&ModuleNode> {
        let key = canonical_key(name);
        self.canonical_nodes().find(|n| canonical_key(&n.name) == key)
    }
}

/// Supplies resolved modules to the graph builder
pub trait ModuleSource {
    fn fetch(&self, name: &str) -> Arc<ResolvedModule>;

    /// One record per name, in order; implementations may load them concurrently
    fn fetch_all(&self, names: &[&str]) -> Vec<Arc<ResolvedModule>> {
        names.iter().map(|name| self.fetch(name)).collect()
    }
}

impl ModuleSource for ModuleInspector<'_> {
    fn fetch(&self, name: &str) -> Arc<ResolvedModule> {
        Arc::new(self.inspect(name))
    }
}

/// Mutable state of one resolution run
struct ResolutionContext<'s> {
    source: &'s dyn ModuleSource,
    unique: bool,
    max_depth: Option<usize>,
    /// Canonical key to the first node created for it
    canonical: HashMap<String, NodeId>,
    /// Keys whose children have been expanded
    visited: HashSet<String>,
    nodes: Vec<ModuleNode>,
}

impl<'s> ResolutionContext<'s> {
    fn new(source: &'s dyn ModuleSource, options: &ResolveOptions) -> Self {
        Self {
            source,
            unique: options.unique,
            max_depth: options.max_depth,
            canonical: HashMap::new(),
            visited: HashSet::new(),
            nodes: vec![],
        }
    }

    fn push_node(
        &mut self,
        module: &ResolvedModule,
        parent: Option<NodeId>,
        depth: usize,
        source: DependencySource,
    ) -> NodeId {
        let id = NodeId(self.nodes.len());
        let parent_name = parent.map(|p| self.nodes[p.0].name.clone()).unwrap_or_default();
        self.nodes.push(ModuleNode {
            id,
            name: module.name.clone(),
            parent,
            parent_name,
            depth,
            path: module.path.clone(),
            loaded: module.loaded,
            failure: module.failure.clone(),
            is_managed: module.is_managed,
            source,
            truncated: false,
            duplicate_of: None,
            children: vec![],
        });
        id
    }

    fn copy_node(&mut self, canonical: NodeId, parent: NodeId, source: DependencySource) -> NodeId {
        let id = NodeId(self.nodes.len());
        let original = &self.nodes[canonical.0];
        let parent_node = &self.nodes[parent.0];
        let copy = ModuleNode {
            id,
            parent: Some(parent),
            parent_name: parent_node.name.clone(),
            depth: parent_node.depth + 1,
            source,
            truncated: false,
            duplicate_of: Some(canonical),
            children: vec![],
            ..original.clone()
        };
        self.nodes.push(copy);
        id
    }

    fn register(&mut self, key: String, id: NodeId) {
        self.canonical.entry(key).or_insert(id);
    }

    /// Dependency names without a node yet, first spelling of each key
    fn unseen<'d>(&self, dependencies: &'d [DependencyEntry]) -> Vec<&'d str> {
        let mut keys = HashSet::new();
        dependencies
            .iter()
            .filter(|entry| {
                let key = canonical_key(&entry.name);
                !self.canonical.contains_key(&key) && keys.insert(key)
            })
            .map(|entry| entry.name.as_str())
            .collect()
    }

    /// Creates the child node for `entry`; returns the module to expand when it was not seen before
    fn attach(
        &mut self,
        parent: NodeId,
        entry: &DependencyEntry,
        fetched: &mut HashMap<String, Arc<ResolvedModule>>,
    ) -> Option<(NodeId, Arc<ResolvedModule>)> {
        let key = canonical_key(&entry.name);
        if let Some(&existing) = self.canonical.get(&key) {
            let child = if self.unique {
                existing
            } else {
                self.copy_node(existing, parent, entry.source)
            };
            self.nodes[parent.0].children.push(child);
            return None;
        }

        let module = fetched
            .remove(&key)
            .unwrap_or_else(|| self.source.fetch(&entry.name));
        let depth = self.nodes[parent.0].depth + 1;
        let child = self.push_node(&module, Some(parent), depth, entry.source);
        self.register(key, child);
        // a managed reference may resolve to a differently spelled identity
        self.register(module.key(), child);
        self.nodes[parent.0].children.push(child);
        Some((child, module))
    }

    /// Expands `id` with all its siblings loaded and registered before any of them recurses
    fn expand(&mut self, id: NodeId, module: &ResolvedModule) {
        if !module.loaded || module.dependencies.is_empty() {
            return;
        }
        let depth = self.nodes[id.0].depth;
        if self.max_depth.is_some_and(|max| depth >= max) {
            self.nodes[id.0].truncated = true;
            return;
        }
        if !self.visited.insert(module.key()) {
            return;
        }

        let unseen = self.unseen(&module.dependencies);
        let mut fetched: HashMap<_, _> = unseen
            .iter()
            .map(|name| canonical_key(name))
            .zip(self.source.fetch_all(&unseen))
            .collect();
        let fresh: Vec<_> = module
            .dependencies
            .iter()
            .filter_map(|entry| self.attach(id, entry, &mut fetched))
            .collect();
        for (child, child_module) in fresh {
            self.expand(child, &child_module);
        }
    }

    fn into_graph(self, root: NodeId) -> DependencyGraph {
        DependencyGraph {
            root,
            unique: self.unique,
            nodes: self.nodes,
        }
    }
}

/// Builds the dependency graph of a root module
pub struct Resolver<'a> {
    loader: &'a dyn ModuleLoader,
    references: &'a dyn ReferenceEnumerator,
    progress: &'a dyn ProgressSink,
    options: ResolveOptions,
}

impl<'a> Resolver<'a> {
    pub fn new(loader: &'a dyn ModuleLoader, options: ResolveOptions) -> Self {
        Self {
            loader,
            references: &MetadataReader,
            progress: &NoProgress,
            options,
        }
    }

    pub fn with_references(mut self, references: &'a dyn ReferenceEnumerator) -> Self {
        self.references = references;
        self
    }

    pub fn with_progress(mut self, progress: &'a dyn ProgressSink) -> Self {
        self.progress = progress;
        self
    }

    pub fn options(&self) -> &ResolveOptions {
        &self.options
    }

    /// Resolve `root_name` and everything it transitively depends on.
    ///
    /// Fails only when the root itself cannot be found; every other failure is recorded on its node.
    pub fn resolve(&self, root_name: &str) -> Result<DependencyGraph, LookupError> {
        let inspector = ModuleInspector::new(self.loader, self.references);
        self.progress.report("Resolving", root_name);
        let root = Arc::new(inspector.inspect(root_name));
        if root.path.is_none() {
            return Err(LookupError::RootUnresolvable {
                name: root_name.to_owned(),
                detail: root.failure.clone().unwrap_or_default(),
            });
        }

        let workers = self.options.workers();
        if workers > 1 {
            Coordinator::new(&inspector, self.progress, workers)
                .run(|source| self.build(&root, source))
        } else {
            Ok(self.build(&root, &Inline { inspector: &inspector, progress: self.progress }))
        }
    }

    fn build(&self, root: &Arc<ResolvedModule>, source: &dyn ModuleSource) -> DependencyGraph {
        let mut context = ResolutionContext::new(source, &self.options);
        let root_id = context.push_node(root, None, 0, DependencySource::Root);
        context.register(root.key(), root_id);
        context.register(canonical_key(&root.requested_name), root_id);
        if let Some(file_name) = root.path.as_ref().and_then(|p| p.file_name()) {
            context.register(canonical_key(&file_name.to_string_lossy()), root_id);
        }
        context.expand(root_id, root);
        tracing::debug!(nodes = context.nodes.len(), "resolution complete");
        context.into_graph(root_id)
    }
}

/// Loads modules on the calling thread, as the graph builder asks for them
struct Inline<'i, 'a> {
    inspector: &'i ModuleInspector<'a>,
    progress: &'i dyn ProgressSink,
}

impl ModuleSource for Inline<'_, '_> {
    fn fetch(&self, name: &str) -> Arc<ResolvedModule> {
        self.progress.report("Resolving", name);
        self.inspector.fetch(name)
    }
}
