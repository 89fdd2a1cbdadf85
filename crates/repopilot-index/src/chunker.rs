//! Line-exact chunking via tree-sitter, with a line-window fallback.
//!
//! On the syntax-tree path every line of the file lands in exactly one chunk:
//! definitions (with their leading comments and attributes) become
//! function/class/method chunks, and everything between them becomes
//! bounded filler blocks. Containers (classes, impls, traits) are always
//! descended: their header becomes a chunk of the container's kind, each
//! nested definition gets its own chunk named `Container.member`, and the
//! lines between members are filler scoped to the container. Blank runs are
//! folded into a neighbouring chunk.
//!
//! Files without a grammar, with syntax errors, or without any definitions
//! are cut into overlapping fixed-size line windows instead. Windows cover
//! every non-blank line; a window holding only whitespace is dropped.

use serde::{Deserialize, Serialize};
use tree_sitter::{Language, Node, Parser};

use crate::chunk::{Chunk, ChunkKind};
use crate::error::{IndexError, Result};
use crate::languages::Lang;

/// Chunker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkerConfig {
    /// Maximum lines per filler block (default: 60).
    pub max_block_lines: usize,
    /// Leaf definitions longer than this are cut into consecutive parts
    /// (default: 200).
    pub max_definition_lines: usize,
    /// Fallback window size in lines (default: 40).
    pub window_lines: usize,
    /// Lines shared by consecutive fallback windows (default: 5).
    pub window_overlap: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            max_block_lines: 60,
            max_definition_lines: 200,
            window_lines: 40,
            window_overlap: 5,
        }
    }
}

/// Split a file into chunks. Pure and deterministic.
///
/// Empty and whitespace-only files produce no chunks.
#[must_use]
pub fn chunk_file(source: &str, file_path: &str, lang: Lang, config: &ChunkerConfig) -> Vec<Chunk> {
    let lines = Lines::new(source);
    if lines.is_empty() || source.trim().is_empty() {
        return Vec::new();
    }

    let Some(grammar) = lang.grammar_for(file_path) else {
        return window_chunks(&lines, file_path, lang, config);
    };

    match parse_definitions(source, &grammar, lang, lines.len()) {
        Ok(defs) if !defs.is_empty() => {
            let mut emitter = Emitter {
                lines: &lines,
                file_path,
                lang,
                config,
                out: Vec::new(),
                pending_from: None,
            };
            emitter.emit_range(0, lines.len() - 1, &defs, None, None);
            emitter.out
        }
        Ok(_) => window_chunks(&lines, file_path, lang, config),
        Err(e) => {
            tracing::debug!(file = %file_path, "falling back to line windows: {e}");
            window_chunks(&lines, file_path, lang, config)
        }
    }
}

/// Byte offsets of each line, where a line keeps its trailing `\n`.
struct Lines<'a> {
    source: &'a str,
    starts: Vec<usize>,
}

impl<'a> Lines<'a> {
    fn new(source: &'a str) -> Self {
        let mut starts = Vec::new();
        let mut offset = 0;
        for line in source.split_inclusive('\n') {
            starts.push(offset);
            offset += line.len();
        }
        Self { source, starts }
    }

    fn len(&self) -> usize {
        self.starts.len()
    }

    fn is_empty(&self) -> bool {
        self.starts.is_empty()
    }

    fn line_end(&self, row: usize) -> usize {
        self.starts.get(row + 1).copied().unwrap_or(self.source.len())
    }

    /// Text of rows `start..=end` (0-based).
    fn text(&self, start: usize, end: usize) -> &'a str {
        &self.source[self.starts[start]..self.line_end(end)]
    }

    fn is_blank(&self, start: usize, end: usize) -> bool {
        self.text(start, end).trim().is_empty()
    }
}

#[derive(Debug)]
struct Definition {
    start: usize,
    end: usize,
    kind: ChunkKind,
    name: Option<String>,
    children: Vec<Definition>,
}

fn parse_definitions(
    source: &str,
    grammar: &Language,
    lang: Lang,
    line_count: usize,
) -> Result<Vec<Definition>> {
    let mut parser = Parser::new();
    parser
        .set_language(grammar)
        .map_err(|e| IndexError::Parse(format!("set_language failed: {e}")))?;

    let tree = parser
        .parse(source, None)
        .ok_or_else(|| IndexError::Parse("parser returned no tree".into()))?;

    let root = tree.root_node();
    if root.has_error() {
        return Err(IndexError::Parse("syntax errors in source".into()));
    }

    let mut defs = Vec::new();
    collect_definitions(&root, source, lang, line_count, false, &mut defs);
    Ok(defs)
}

fn collect_definitions(
    parent: &Node<'_>,
    source: &str,
    lang: Lang,
    line_count: usize,
    in_container: bool,
    out: &mut Vec<Definition>,
) {
    let mut cursor = parent.walk();
    let children: Vec<Node<'_>> = parent.named_children(&mut cursor).collect();

    for (i, child) in children.iter().enumerate() {
        let Some((kind, target)) = classify(child, lang) else {
            if child.end_position().row > child.start_position().row {
                collect_definitions(child, source, lang, line_count, in_container, out);
            }
            continue;
        };

        let kind = if in_container && kind == ChunkKind::Function {
            ChunkKind::Method
        } else {
            kind
        };

        let start = leading_start(&children, i, lang);
        let end = end_row(child).min(line_count - 1);

        let mut nested = Vec::new();
        if lang.container_kinds().contains(&target.kind()) {
            let body = target.child_by_field_name("body").unwrap_or(target);
            collect_definitions(&body, source, lang, line_count, true, &mut nested);
        }

        out.push(Definition {
            start: start.min(end),
            end,
            kind,
            name: entity_name(&target, source),
            children: nested,
        });
    }
}

/// Map a node to its chunk kind. The returned node is the one that carries
/// the name and body (the inner declaration for wrapper nodes).
fn classify<'t>(node: &Node<'t>, lang: Lang) -> Option<(ChunkKind, Node<'t>)> {
    let kind = node.kind();

    if let Some((_, field)) = lang.wrapper_kinds().iter().find(|(k, _)| *k == kind) {
        let inner = node.child_by_field_name(field)?;
        return classify(&inner, lang);
    }

    if lang.binding_kinds().contains(&kind) {
        let mut cursor = node.walk();
        let is_function = node.named_children(&mut cursor).any(|decl| {
            decl.kind() == "variable_declarator"
                && decl.child_by_field_name("value").is_some_and(|v| {
                    matches!(
                        v.kind(),
                        "arrow_function" | "function_expression" | "function" | "generator_function"
                    )
                })
        });
        return is_function.then_some((ChunkKind::Function, *node));
    }

    lang.definition_kinds()
        .iter()
        .find(|(k, _)| *k == kind)
        .map(|(_, chunk_kind)| (*chunk_kind, *node))
}

/// First row of the definition at `children[idx]`, extended upwards over
/// contiguous comment/attribute siblings that start on their own line.
fn leading_start(children: &[Node<'_>], idx: usize, lang: Lang) -> usize {
    let mut start = children[idx].start_position().row;
    let mut j = idx;
    while j > 0 {
        let prev = &children[j - 1];
        if !lang.leading_kinds().contains(&prev.kind()) || end_row(prev) + 1 < start {
            break;
        }
        if j >= 2 && end_row(&children[j - 2]) >= prev.start_position().row {
            break;
        }
        start = prev.start_position().row;
        j -= 1;
    }
    start
}

/// Last row a node occupies. Nodes that end at column 0 stop on the previous row.
fn end_row(node: &Node<'_>) -> usize {
    let end = node.end_position();
    if end.column == 0 && end.row > node.start_position().row {
        end.row - 1
    } else {
        end.row
    }
}

fn entity_name(node: &Node<'_>, source: &str) -> Option<String> {
    // tree-sitter-rust: impl_item uses "type" field, most others use "name";
    // Go type_declaration and JS bindings keep the name one level down.
    let name_node = node
        .child_by_field_name("name")
        .or_else(|| node.child_by_field_name("type"))
        .or_else(|| {
            let mut cursor = node.walk();
            node.named_children(&mut cursor)
                .find_map(|child| child.child_by_field_name("name"))
        })?;
    let name = source[name_node.byte_range()].lines().next()?.trim();
    (!name.is_empty()).then(|| name.to_owned())
}

/// A definition clamped into its parent's range, after overlap resolution.
struct Span<'d> {
    start: usize,
    end: usize,
    def: &'d Definition,
    leaf: bool,
}

/// Order definitions and resolve overlaps (same-line definitions): a span
/// contained in the previous one is dropped, a partial overlap extends the
/// previous span, which then stops being descended into.
fn resolve_overlaps(defs: &[Definition], lo: usize, hi: usize) -> Vec<Span<'_>> {
    let mut sorted: Vec<&Definition> = defs.iter().collect();
    sorted.sort_by(|a, b| a.start.cmp(&b.start).then(b.end.cmp(&a.end)));

    let mut spans: Vec<Span<'_>> = Vec::with_capacity(sorted.len());
    for def in sorted {
        let start = def.start.max(lo);
        let end = def.end.min(hi);
        if start > end {
            continue;
        }
        if let Some(prev) = spans.last_mut()
            && start <= prev.end
        {
            if end > prev.end {
                prev.end = end;
                prev.leaf = true;
            }
            continue;
        }
        spans.push(Span {
            start,
            end,
            def,
            leaf: def.children.is_empty(),
        });
    }
    spans
}

struct Emitter<'a> {
    lines: &'a Lines<'a>,
    file_path: &'a str,
    lang: Lang,
    config: &'a ChunkerConfig,
    out: Vec<Chunk>,
    /// Start of a blank run at the top of the file, owed to the next chunk.
    pending_from: Option<usize>,
}

impl Emitter<'_> {
    /// Emit rows `lo..=hi`. When `header` is set, the filler before the first
    /// nested definition is the container's own chunk and takes that kind.
    fn emit_range(
        &mut self,
        lo: usize,
        hi: usize,
        defs: &[Definition],
        scope: Option<&str>,
        mut header: Option<ChunkKind>,
    ) {
        let mut cursor = lo;
        for span in resolve_overlaps(defs, lo, hi) {
            if span.start > cursor {
                self.filler(cursor, span.start - 1, scope, header.take());
            }
            header = None;
            self.definition(&span, scope);
            cursor = span.end + 1;
        }
        if cursor <= hi {
            self.filler(cursor, hi, scope, header);
        }
    }

    fn definition(&mut self, span: &Span<'_>, scope: Option<&str>) {
        let def = span.def;
        let name = qualified_name(scope, def.name.as_deref());

        if !span.leaf {
            self.emit_range(span.start, span.end, &def.children, name.as_deref(), Some(def.kind));
            return;
        }

        let max = self.config.max_definition_lines.max(1);
        for part_start in (span.start..=span.end).step_by(max) {
            let part_end = (part_start + max - 1).min(span.end);
            self.push(part_start, part_end, def.kind, name.clone());
        }
    }

    fn filler(&mut self, start: usize, end: usize, scope: Option<&str>, mut header: Option<ChunkKind>) {
        let max = self.config.max_block_lines.max(1);
        for part_start in (start..=end).step_by(max) {
            let part_end = (part_start + max - 1).min(end);
            if self.lines.is_blank(part_start, part_end) {
                self.absorb_blank(part_start, part_end);
            } else {
                let kind = header.take().unwrap_or(ChunkKind::Block);
                self.push(part_start, part_end, kind, scope.map(str::to_owned));
            }
        }
    }

    fn push(&mut self, start: usize, end: usize, kind: ChunkKind, name: Option<String>) {
        let start = self.pending_from.take().unwrap_or(start);
        self.out.push(Chunk::new(
            self.file_path,
            self.lang,
            kind,
            name,
            start + 1,
            end + 1,
            self.lines.text(start, end).to_owned(),
        ));
    }

    fn absorb_blank(&mut self, start: usize, end: usize) {
        match self.out.pop() {
            Some(last) => {
                let first = last.start_line - 1;
                self.out.push(Chunk::new(
                    self.file_path,
                    self.lang,
                    last.kind,
                    last.entity_name,
                    last.start_line,
                    end + 1,
                    self.lines.text(first, end).to_owned(),
                ));
            }
            None => {
                self.pending_from.get_or_insert(start);
            }
        }
    }
}

fn qualified_name(scope: Option<&str>, name: Option<&str>) -> Option<String> {
    match (scope, name) {
        (Some(scope), Some(name)) => Some(format!("{scope}.{name}")),
        (None, name) => name.map(str::to_owned),
        (Some(_), None) => None,
    }
}

fn window_chunks(lines: &Lines<'_>, file_path: &str, lang: Lang, config: &ChunkerConfig) -> Vec<Chunk> {
    let size = config.window_lines.max(1);
    let step = size.saturating_sub(config.window_overlap).max(1);
    let last = lines.len() - 1;

    let mut chunks = Vec::new();
    let mut start = 0;
    loop {
        let end = (start + size - 1).min(last);
        if !lines.is_blank(start, end) {
            chunks.push(Chunk::new(
                file_path,
                lang,
                ChunkKind::Block,
                None,
                start + 1,
                end + 1,
                lines.text(start, end).to_owned(),
            ));
        }
        if end == last {
            break;
        }
        start += step;
    }
    chunks
}
