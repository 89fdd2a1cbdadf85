//! Language detection and tree-sitter grammar registry.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::chunk::ChunkKind;

/// Language tag attached to every scanned file and chunk.
///
/// Only some tags have a registered grammar; everything else is chunked by
/// line windows. Unknown extensions map to [`Lang::Text`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lang {
    Rust,
    Python,
    JavaScript,
    TypeScript,
    Go,
    Java,
    Kotlin,
    C,
    Cpp,
    CSharp,
    Ruby,
    Php,
    Swift,
    Scala,
    Bash,
    Sql,
    Html,
    Css,
    Markdown,
    Json,
    Yaml,
    Toml,
    Text,
}

impl Lang {
    pub const ALL: [Lang; 23] = [
        Self::Rust,
        Self::Python,
        Self::JavaScript,
        Self::TypeScript,
        Self::Go,
        Self::Java,
        Self::Kotlin,
        Self::C,
        Self::Cpp,
        Self::CSharp,
        Self::Ruby,
        Self::Php,
        Self::Swift,
        Self::Scala,
        Self::Bash,
        Self::Sql,
        Self::Html,
        Self::Css,
        Self::Markdown,
        Self::Json,
        Self::Yaml,
        Self::Toml,
        Self::Text,
    ];

    /// Identifier used in vector payloads, metadata rows and config.
    #[must_use]
    pub fn id(self) -> &'static str {
        match self {
            Self::Rust => "rust",
            Self::Python => "python",
            Self::JavaScript => "javascript",
            Self::TypeScript => "typescript",
            Self::Go => "go",
            Self::Java => "java",
            Self::Kotlin => "kotlin",
            Self::C => "c",
            Self::Cpp => "cpp",
            Self::CSharp => "csharp",
            Self::Ruby => "ruby",
            Self::Php => "php",
            Self::Swift => "swift",
            Self::Scala => "scala",
            Self::Bash => "bash",
            Self::Sql => "sql",
            Self::Html => "html",
            Self::Css => "css",
            Self::Markdown => "markdown",
            Self::Json => "json",
            Self::Yaml => "yaml",
            Self::Toml => "toml",
            Self::Text => "text",
        }
    }

    /// Inverse of [`Lang::id`]. Unknown identifiers become [`Lang::Text`].
    #[must_use]
    pub fn from_id(id: &str) -> Self {
        Self::parse_id(id).unwrap_or(Self::Text)
    }

    /// Strict inverse of [`Lang::id`].
    #[must_use]
    pub fn parse_id(id: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|l| l.id() == id)
    }

    /// Get the tree-sitter grammar. Returns `None` if the language has no
    /// grammar or the corresponding feature is not enabled.
    #[must_use]
    pub fn grammar(self) -> Option<tree_sitter::Language> {
        match self {
            #[cfg(feature = "lang-rust")]
            Self::Rust => Some(tree_sitter_rust::LANGUAGE.into()),
            #[cfg(feature = "lang-python")]
            Self::Python => Some(tree_sitter_python::LANGUAGE.into()),
            #[cfg(feature = "lang-js")]
            Self::JavaScript => Some(tree_sitter_javascript::LANGUAGE.into()),
            #[cfg(feature = "lang-js")]
            Self::TypeScript => Some(tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into()),
            #[cfg(feature = "lang-go")]
            Self::Go => Some(tree_sitter_go::LANGUAGE.into()),
            #[allow(unreachable_patterns)]
            _ => None,
        }
    }

    /// Grammar for a concrete file. `.tsx` sources need the TSX dialect, which
    /// rejects `<T>expr` assertions that plain TypeScript accepts.
    #[must_use]
    pub fn grammar_for(self, path: &str) -> Option<tree_sitter::Language> {
        #[cfg(feature = "lang-js")]
        if self == Self::TypeScript
            && Path::new(path)
                .extension()
                .is_some_and(|e| e.eq_ignore_ascii_case("tsx"))
        {
            return Some(tree_sitter_typescript::LANGUAGE_TSX.into());
        }
        let _ = path;
        self.grammar()
    }

    /// Node kinds that become definition-level chunks, with the chunk kind
    /// they map to before method promotion.
    #[must_use]
    pub(crate) fn definition_kinds(self) -> &'static [(&'static str, ChunkKind)] {
        match self {
            Self::Rust => &[
                ("function_item", ChunkKind::Function),
                ("function_signature_item", ChunkKind::Function),
                ("macro_definition", ChunkKind::Function),
                ("struct_item", ChunkKind::Class),
                ("enum_item", ChunkKind::Class),
                ("union_item", ChunkKind::Class),
                ("trait_item", ChunkKind::Class),
                ("impl_item", ChunkKind::Class),
                ("mod_item", ChunkKind::Class),
            ],
            Self::Python => &[
                ("function_definition", ChunkKind::Function),
                ("class_definition", ChunkKind::Class),
            ],
            Self::JavaScript | Self::TypeScript => &[
                ("function_declaration", ChunkKind::Function),
                ("generator_function_declaration", ChunkKind::Function),
                ("class_declaration", ChunkKind::Class),
                ("abstract_class_declaration", ChunkKind::Class),
                ("interface_declaration", ChunkKind::Class),
                ("enum_declaration", ChunkKind::Class),
                ("method_definition", ChunkKind::Method),
                ("abstract_method_signature", ChunkKind::Method),
            ],
            Self::Go => &[
                ("function_declaration", ChunkKind::Function),
                ("method_declaration", ChunkKind::Method),
                ("type_declaration", ChunkKind::Class),
            ],
            _ => &[],
        }
    }

    /// Definitions whose body may hold nested definitions (methods).
    #[must_use]
    pub(crate) fn container_kinds(self) -> &'static [&'static str] {
        match self {
            Self::Rust => &["impl_item", "trait_item", "mod_item"],
            Self::Python => &["class_definition"],
            Self::JavaScript | Self::TypeScript => &["class_declaration", "abstract_class_declaration"],
            _ => &[],
        }
    }

    /// Wrapper nodes classified by the node found under the given field
    /// (`export function f() {}`, `@decorator def f(): ...`).
    #[must_use]
    pub(crate) fn wrapper_kinds(self) -> &'static [(&'static str, &'static str)] {
        match self {
            Self::Python => &[("decorated_definition", "definition")],
            Self::JavaScript | Self::TypeScript => &[("export_statement", "declaration")],
            _ => &[],
        }
    }

    /// `const f = () => {}` style declarations that count as functions when
    /// their value is a function expression.
    #[must_use]
    pub(crate) fn binding_kinds(self) -> &'static [&'static str] {
        match self {
            Self::JavaScript | Self::TypeScript => &["lexical_declaration", "variable_declaration"],
            _ => &[],
        }
    }

    /// Sibling nodes that attach to the definition that follows them.
    #[must_use]
    pub(crate) fn leading_kinds(self) -> &'static [&'static str] {
        match self {
            Self::Rust => &["line_comment", "block_comment", "attribute_item"],
            Self::JavaScript | Self::TypeScript => &["comment", "decorator"],
            Self::Python | Self::Go => &["comment"],
            _ => &[],
        }
    }
}

impl std::fmt::Display for Lang {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id())
    }
}

/// Detect language from file extension (or a few well-known file names).
#[must_use]
pub fn detect_language(path: &Path) -> Lang {
    let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    match file_name {
        "Dockerfile" | "Makefile" | "CMakeLists.txt" => return Lang::Text,
        "Gemfile" | "Rakefile" => return Lang::Ruby,
        _ => {}
    }
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
        return Lang::Text;
    };
    match ext.to_ascii_lowercase().as_str() {
        "rs" => Lang::Rust,
        "py" | "pyi" | "pyw" => Lang::Python,
        "js" | "jsx" | "mjs" | "cjs" => Lang::JavaScript,
        "ts" | "tsx" | "mts" | "cts" => Lang::TypeScript,
        "go" => Lang::Go,
        "java" => Lang::Java,
        "kt" | "kts" => Lang::Kotlin,
        "c" | "h" => Lang::C,
        "cc" | "cpp" | "cxx" | "hpp" | "hh" | "hxx" => Lang::Cpp,
        "cs" => Lang::CSharp,
        "rb" => Lang::Ruby,
        "php" => Lang::Php,
        "swift" => Lang::Swift,
        "scala" | "sc" => Lang::Scala,
        "sh" | "bash" | "zsh" => Lang::Bash,
        "sql" => Lang::Sql,
        "html" | "htm" => Lang::Html,
        "css" | "scss" | "sass" | "less" => Lang::Css,
        "md" | "markdown" => Lang::Markdown,
        "json" | "jsonc" => Lang::Json,
        "yml" | "yaml" => Lang::Yaml,
        "toml" => Lang::Toml,
        _ => Lang::Text,
    }
}
