//! Contextualized embedding text generation.
//!
//! Embedding raw code alone gives poor retrieval quality. The file path,
//! language and entity name are prepended so that conceptual queries
//! ("where is the retry policy?") can match a chunk whose body never
//! spells those words out. The stored and cited text stays the raw chunk.

use crate::chunk::Chunk;

/// Generate text optimized for embedding (not for display).
#[must_use]
pub fn contextualize_for_embedding(chunk: &Chunk) -> String {
    let mut text = String::with_capacity(chunk.text.len() + 128);

    text.push_str("# ");
    text.push_str(&chunk.file_path);
    text.push('\n');

    text.push_str("# Language: ");
    text.push_str(chunk.language.id());
    text.push('\n');

    if let Some(name) = &chunk.entity_name {
        text.push_str("# ");
        text.push_str(chunk.kind.as_str());
        text.push_str(": ");
        text.push_str(name);
        text.push('\n');
    }

    text.push_str(&chunk.text);
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkKind;
    use crate::languages::Lang;

    fn sample_chunk(name: Option<&str>) -> Chunk {
        Chunk::new(
            "src/lib.rs",
            Lang::Rust,
            ChunkKind::Function,
            name.map(str::to_owned),
            1,
            1,
            "fn hello() { 42 }\n".to_owned(),
        )
    }

    #[test]
    fn includes_path_language_and_code() {
        let text = contextualize_for_embedding(&sample_chunk(Some("hello")));
        assert!(text.starts_with("# src/lib.rs\n"));
        assert!(text.contains("# Language: rust\n"));
        assert!(text.contains("# function: hello\n"));
        assert!(text.ends_with("fn hello() { 42 }\n"));
    }

    #[test]
    fn omits_entity_line_when_unnamed() {
        let text = contextualize_for_embedding(&sample_chunk(None));
        assert!(!text.contains("function:"));
    }
}
