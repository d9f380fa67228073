//! Text listings of resolved graphs and decoded headers, as printed by the binaries

use crate::common::{decanonicalize, path_to_string};
use crate::image::BinaryImage;
use crate::resolver::{DependencyGraph, ModuleNode};

const TRUNCATED_TAG: &str = " [not expanded: depth limit]";

fn chain_line(node: &ModuleNode, level: usize) -> String {
    let status = match (&node.failure, &node.path) {
        (None, Some(path)) => decanonicalize(&path_to_string(path)),
        _ => node.status_text(),
    };
    format!(
        "{}{} (Loaded: {}): {}{}",
        "  ".repeat(level),
        node.name,
        node.loaded,
        status,
        if node.truncated { TRUNCATED_TAG } else { "" }
    )
}

/// Indented tree, two spaces per level, each node identity listed once
pub fn render_chain(graph: &DependencyGraph) -> String {
    let mut lines = vec![];
    graph.visit_depth_first(|node, level| lines.push(chain_line(node, level)));
    lines.join("\n")
}

/// One line per module that could not be loaded, with the module that asked for it
pub fn render_failed(graph: &DependencyGraph, managed_only: bool) -> String {
    graph
        .failed(managed_only)
        .into_iter()
        .map(|node| {
            let requested_by = if node.is_root() {
                String::new()
            } else {
                format!(" (required by {})", node.parent_name)
            };
            format!("{}{}: {}", node.name, requested_by, node.status_text())
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Flat listing in the style of `ldd`: every dependency once, in discovery order, except the
/// ones `hide` selects
pub fn render_ldd<F: Fn(&ModuleNode) -> bool>(graph: &DependencyGraph, hide: F) -> String {
    let prefix = " ".repeat(8); // as ldd
    graph
        .canonical_nodes()
        .filter(|node| !node.is_root() && !hide(node))
        .map(|node| match &node.path {
            Some(path) => format!(
                "{}{} => {}",
                prefix,
                node.name,
                decanonicalize(&path_to_string(path))
            ),
            None => format!("{}{} => not found", prefix, node.name),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Human-readable summary of the decoded headers
pub fn render_headers(image: &BinaryImage) -> String {
    let coff = image.coff_header();
    let mut lines = vec![
        format!("Layout: {:?}", image.layout()),
        format!(
            "COFF header at {:#x}: machine {:#06x}, {} sections, characteristics {:#06x}",
            image.coff_header_offset(),
            coff.machine,
            coff.number_of_sections,
            coff.characteristics
        ),
    ];

    let kind = if image.is_dll() {
        "DLL"
    } else if image.is_exe() {
        "executable"
    } else {
        "object"
    };
    lines.push(format!(
        "Kind: {}{}{}",
        kind,
        if image.is_console_application() { ", console" } else { "" },
        if image.is_managed() { ", managed" } else { "" }
    ));

    if let (Some(offset), Some(optional)) = (image.optional_header_offset(), image.optional_header()) {
        lines.push(format!(
            "Optional header at {:#x}: {:?}, image base {:#x}, entry point {:#x}, subsystem {}",
            offset,
            optional.magic,
            optional.image_base,
            optional.address_of_entry_point,
            optional.subsystem
        ));
        let directories = [
            ("import", &optional.directories.import_table),
            ("delay import", &optional.directories.delay_import_table),
            ("runtime header", &optional.directories.runtime_header_table),
        ];
        for (name, entry) in directories.into_iter().filter(|(_, e)| e.is_present()) {
            lines.push(format!(
                "  {} directory: RVA {:#x}, size {:#x}",
                name, entry.virtual_address, entry.size
            ));
        }
    }

    lines.push("Sections:".to_owned());
    for section in image.section_headers() {
        lines.push(format!(
            "  {:<8} RVA {:#010x} size {:#010x} raw {:#010x}+{:#x}",
            section.name,
            section.virtual_address,
            section.virtual_size,
            section.pointer_to_raw_data,
            section.size_of_raw_data
        ));
    }

    if let Some(runtime) = image.runtime_header() {
        lines.push(format!(
            "Runtime header: version {}.{}, flags {:#x}",
            runtime.major_runtime_version, runtime.minor_runtime_version, runtime.flags
        ));
    }
    if let Some(region) = image.metadata_region() {
        lines.push(format!(
            "Metadata: {:#x} bytes at {:#x}",
            region.size, region.start
        ));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::LookupError;
    use crate::query::ResolveOptions;
    use crate::resolver::Resolver;
    use crate::testutil::{MemoryLoader, PeBuilder};

    fn loader() -> MemoryLoader {
        MemoryLoader::new()
            .with(
                "app.exe",
                PeBuilder::new().import("A.dll").import("gone.dll").import("a.dll"),
            )
            .with("a.dll", PeBuilder::new().dll().import("B.dll"))
            .with("b.dll", PeBuilder::new().dll().import("C.dll"))
    }

    #[test]
    fn chain_is_indented_by_depth() -> Result<(), LookupError> {
        let loader = loader();
        let graph = Resolver::new(
            &loader,
            ResolveOptions {
                max_depth: Some(2),
                ..Default::default()
            },
        )
        .resolve("app.exe")?;
        let listing = render_chain(&graph);
        let lines: Vec<&str> = listing.lines().collect();
        assert_eq!(lines.len(), 5);
        assert_eq!(lines[0], "app.exe (Loaded: true): /virtual/app.exe");
        assert_eq!(lines[1], "  A.dll (Loaded: true): /virtual/a.dll");
        assert_eq!(
            lines[2],
            "    B.dll (Loaded: true): /virtual/b.dll [not expanded: depth limit]"
        );
        assert!(lines[3].starts_with("  gone.dll (Loaded: false): Could not load gone.dll"));
        // the copy made for the repeated import
        assert_eq!(lines[4], "  a.dll (Loaded: true): /virtual/a.dll");
        Ok(())
    }

    #[test]
    fn failed_and_ldd_listings() -> Result<(), LookupError> {
        let loader = loader();
        let graph = Resolver::new(&loader, ResolveOptions::default()).resolve("app.exe")?;

        let failed = render_failed(&graph, false);
        let failed: Vec<&str> = failed.lines().collect();
        assert_eq!(failed.len(), 2);
        assert!(failed[0].starts_with("gone.dll (required by app.exe): "));
        assert!(failed[1].starts_with("C.dll (required by B.dll): "));
        assert!(render_failed(&graph, true).is_empty());

        assert_eq!(
            render_ldd(&graph, |_| false),
            [
                "        A.dll => /virtual/a.dll",
                "        gone.dll => not found",
                "        B.dll => /virtual/b.dll",
                "        C.dll => not found",
            ]
            .join("\n")
        );
        assert_eq!(
            render_ldd(&graph, |n| !n.loaded),
            ["        A.dll => /virtual/a.dll", "        B.dll => /virtual/b.dll"].join("\n")
        );
        Ok(())
    }

    #[test]
    fn headers_summary() -> Result<(), crate::common::ImageError> {
        let image = BinaryImage::parse_bytes(&PeBuilder::new().dll().import("x.dll").build_file())?;
        let summary = render_headers(&image);
        assert!(summary.contains("Kind: DLL"));
        assert!(summary.contains("import directory: RVA 0x2000"));
        assert!(summary.contains(".text"));
        assert!(summary.contains(".rdata"));
        assert!(!summary.contains("Runtime header"));
        Ok(())
    }
}
