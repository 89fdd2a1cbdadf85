//! File tree of an indexed repository, built from the recorded source files.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde::Serialize;

use crate::languages::Lang;
use crate::metadata::FileRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Folder,
    File,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TreeNode {
    pub name: String,
    /// Repository-relative path; empty for the root.
    pub path: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    /// File size, or the sum over all descendants for folders.
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<Lang>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_count: Option<usize>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TreeNode>,
}

#[derive(Default)]
struct Folder {
    folders: BTreeMap<String, Folder>,
    files: BTreeMap<String, FileRecord>,
}

impl Folder {
    fn insert(&mut self, parts: &[&str], record: &FileRecord) {
        match parts {
            [] => {}
            [file] => {
                self.files.insert((*file).to_owned(), record.clone());
            }
            [dir, rest @ ..] => self
                .folders
                .entry((*dir).to_owned())
                .or_default()
                .insert(rest, record),
        }
    }

    fn into_node(self, name: String, path: String) -> TreeNode {
        let mut children: Vec<TreeNode> = Vec::with_capacity(self.folders.len() + self.files.len());
        for (child, folder) in self.folders {
            let child_path = join(&path, &child);
            children.push(folder.into_node(child, child_path));
        }
        for (child, record) in self.files {
            children.push(TreeNode {
                name: child,
                size: record.size,
                language: Some(record.language),
                line_count: Some(record.line_count),
                chunk_count: Some(record.chunk_count),
                path: record.path,
                kind: NodeKind::File,
                children: Vec::new(),
            });
        }
        children.sort_by(|a, b| a.name.cmp(&b.name));

        TreeNode {
            name,
            path,
            kind: NodeKind::Folder,
            size: children.iter().map(|c| c.size).sum(),
            language: None,
            line_count: None,
            chunk_count: None,
            children,
        }
    }
}

fn join(parent: &str, child: &str) -> String {
    if parent.is_empty() {
        child.to_owned()
    } else {
        format!("{parent}/{child}")
    }
}

/// Nest flat file records into a folder tree rooted at `root_name`.
/// Children are sorted by name at every level.
#[must_use]
pub fn build_tree(root_name: &str, files: &[FileRecord]) -> TreeNode {
    let mut root = Folder::default();
    for record in files {
        let parts: Vec<&str> = record.path.split('/').filter(|p| !p.is_empty()).collect();
        root.insert(&parts, record);
    }
    root.into_node(root_name.to_owned(), String::new())
}

/// Plain-text rendering used by the CLI.
#[must_use]
pub fn render_tree(node: &TreeNode) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{} ({} bytes)", node.name, node.size);
    render_children(&node.children, "", &mut out);
    out
}

fn render_children(children: &[TreeNode], prefix: &str, out: &mut String) {
    for (i, child) in children.iter().enumerate() {
        let last = i + 1 == children.len();
        let branch = if last { "└── " } else { "├── " };
        let _ = match child.kind {
            NodeKind::Folder => writeln!(out, "{prefix}{branch}{}/", child.name),
            NodeKind::File => writeln!(
                out,
                "{prefix}{branch}{} [{}, {} bytes, {} chunks]",
                child.name,
                child.language.map_or("text", Lang::id),
                child.size,
                child.chunk_count.unwrap_or(0)
            ),
        };
        let next = format!("{prefix}{}", if last { "    " } else { "│   " });
        render_children(&child.children, &next, out);
    }
}
