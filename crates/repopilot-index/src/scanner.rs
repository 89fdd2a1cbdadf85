//! File selection: walk a repository and yield indexable source files.

use std::collections::HashSet;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::languages::{Lang, detect_language};

/// Bytes inspected for a null byte when deciding whether a file is binary.
const BINARY_SNIFF_LEN: usize = 8192;

pub const DEFAULT_MAX_FILE_SIZE: u64 = 5 * 1024 * 1024;

const DEFAULT_IGNORE_DIRS: &[&str] = &[
    ".git",
    ".svn",
    ".hg",
    "node_modules",
    "__pycache__",
    ".pytest_cache",
    "venv",
    ".venv",
    "env",
    ".env",
    "dist",
    "build",
    "target",
    ".next",
    ".nuxt",
    ".cache",
    "coverage",
    ".idea",
    ".vscode",
    "__MACOSX",
];

const DEFAULT_BINARY_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "bmp", "ico", "webp", "svg", "pdf", "zip", "tar", "gz", "tgz",
    "bz2", "xz", "7z", "rar", "jar", "war", "class", "exe", "dll", "so", "dylib", "a", "o", "obj",
    "lib", "bin", "dat", "db", "sqlite", "wasm", "pyc", "pyo", "woff", "woff2", "ttf", "otf",
    "eot", "mp3", "mp4", "wav", "ogg", "avi", "mov", "webm", "lock",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    pub max_file_size: u64,
    /// Directory names skipped wherever they appear in the tree.
    pub ignore_dirs: Vec<String>,
    /// Extensions (without dot, lowercase) treated as binary without reading.
    pub binary_extensions: Vec<String>,
    pub respect_gitignore: bool,
    pub include_hidden: bool,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            ignore_dirs: DEFAULT_IGNORE_DIRS.iter().map(|s| (*s).to_owned()).collect(),
            binary_extensions: DEFAULT_BINARY_EXTENSIONS
                .iter()
                .map(|s| (*s).to_owned())
                .collect(),
            respect_gitignore: true,
            include_hidden: false,
        }
    }
}

/// A file accepted by the selector, not yet read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedFile {
    /// Path relative to the repository root, `/`-separated.
    pub path: String,
    pub abs_path: PathBuf,
    pub language: Lang,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    TooLarge,
    Binary,
    /// Links are never followed; the target may live outside the root.
    Symlink,
}

/// An entry that could not be inspected. Recorded, never fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanWarning {
    pub path: String,
    pub message: String,
}

impl std::fmt::Display for ScanWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEntry {
    File(ScannedFile),
    Skipped { path: String, reason: SkipReason },
    Warning(ScanWarning),
}

/// Applies inclusion rules to a repository tree.
#[derive(Debug, Clone)]
pub struct FileSelector {
    config: SelectorConfig,
    ignore_dirs: Arc<HashSet<String>>,
}

impl FileSelector {
    #[must_use]
    pub fn new(config: SelectorConfig) -> Self {
        let ignore_dirs = Arc::new(config.ignore_dirs.iter().cloned().collect());
        Self {
            config,
            ignore_dirs,
        }
    }

    /// Start a fresh lazy walk of `root`. Each call restarts from the top.
    #[must_use]
    pub fn scan(&self, root: &Path) -> Scan<'_> {
        let ignore_dirs = Arc::clone(&self.ignore_dirs);
        let walk = ignore::WalkBuilder::new(root)
            .hidden(!self.config.include_hidden)
            .git_ignore(self.config.respect_gitignore)
            .git_exclude(self.config.respect_gitignore)
            .git_global(false)
            .ignore(self.config.respect_gitignore)
            .require_git(false)
            .follow_links(false)
            .sort_by_file_name(|a, b| a.cmp(b))
            .filter_entry(move |entry| {
                let is_dir = entry.file_type().is_some_and(|ft| ft.is_dir());
                !(is_dir
                    && entry.depth() > 0
                    && entry
                        .file_name()
                        .to_str()
                        .is_some_and(|name| ignore_dirs.contains(name)))
            })
            .build();

        Scan {
            selector: self,
            root: root.to_path_buf(),
            walk,
        }
    }

    fn inspect(&self, root: &Path, abs_path: &Path) -> ScanEntry {
        let path = relative_path(root, abs_path);

        let metadata = match std::fs::symlink_metadata(abs_path) {
            Ok(m) => m,
            Err(e) => {
                return ScanEntry::Warning(ScanWarning {
                    path,
                    message: e.to_string(),
                });
            }
        };
        if metadata.file_type().is_symlink() {
            return ScanEntry::Skipped {
                path,
                reason: SkipReason::Symlink,
            };
        }
        if !metadata.is_file() {
            return ScanEntry::Warning(ScanWarning {
                path,
                message: "not a regular file".into(),
            });
        }

        let size = metadata.len();
        if size > self.config.max_file_size {
            return ScanEntry::Skipped {
                path,
                reason: SkipReason::TooLarge,
            };
        }

        if self.has_binary_extension(abs_path) {
            return ScanEntry::Skipped {
                path,
                reason: SkipReason::Binary,
            };
        }

        match sniff_binary(abs_path) {
            Ok(true) => ScanEntry::Skipped {
                path,
                reason: SkipReason::Binary,
            },
            Ok(false) => ScanEntry::File(ScannedFile {
                language: detect_language(abs_path),
                abs_path: abs_path.to_path_buf(),
                path,
                size,
            }),
            Err(e) => ScanEntry::Warning(ScanWarning {
                path,
                message: e.to_string(),
            }),
        }
    }

    fn has_binary_extension(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| {
                let ext = ext.to_ascii_lowercase();
                self.config.binary_extensions.iter().any(|b| *b == ext)
            })
    }
}

/// Lazy iterator over one walk of a repository.
pub struct Scan<'a> {
    selector: &'a FileSelector,
    root: PathBuf,
    walk: ignore::Walk,
}

impl Iterator for Scan<'_> {
    type Item = ScanEntry;

    fn next(&mut self) -> Option<ScanEntry> {
        loop {
            let entry = match self.walk.next()? {
                Ok(entry) => entry,
                Err(e) => {
                    let path = walk_error_path(&e)
                        .map(|p| relative_path(&self.root, p))
                        .unwrap_or_default();
                    tracing::warn!(path = %path, "scan error: {e}");
                    return Some(ScanEntry::Warning(ScanWarning {
                        path,
                        message: e.to_string(),
                    }));
                }
            };

            let Some(file_type) = entry.file_type() else {
                continue;
            };
            if file_type.is_dir() {
                continue;
            }

            let result = self.selector.inspect(&self.root, entry.path());
            if let ScanEntry::Warning(w) = &result {
                tracing::warn!(path = %w.path, "skipping unreadable file: {}", w.message);
            }
            return Some(result);
        }
    }
}

fn walk_error_path(err: &ignore::Error) -> Option<&Path> {
    match err {
        ignore::Error::WithPath { path, .. } => Some(path),
        ignore::Error::WithDepth { err, .. } | ignore::Error::WithLineNumber { err, .. } => {
            walk_error_path(err)
        }
        ignore::Error::Loop { child, .. } => Some(child),
        _ => None,
    }
}

fn sniff_binary(path: &Path) -> std::io::Result<bool> {
    let mut buf = [0u8; BINARY_SNIFF_LEN];
    let mut file = File::open(path)?;
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(buf[..filled].contains(&0))
}

/// `/`-separated path of `path` relative to `root`.
#[must_use]
pub fn relative_path(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn files(entries: &[ScanEntry]) -> Vec<&str> {
        entries
            .iter()
            .filter_map(|e| match e {
                ScanEntry::File(f) => Some(f.path.as_str()),
                _ => None,
            })
            .collect()
    }

    fn write(root: &Path, rel: &str, content: &[u8]) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn skips_ignored_dirs_and_detects_languages() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "src/main.rs", b"fn main() {}\n");
        write(dir.path(), "node_modules/pkg/index.js", b"module.exports = 1;\n");
        write(dir.path(), "target/debug/out.rs", b"fn x() {}\n");
        write(dir.path(), "README.md", b"# hi\n");
        write(dir.path(), "notes.weird", b"plain\n");

        let selector = FileSelector::new(SelectorConfig::default());
        let entries: Vec<_> = selector.scan(dir.path()).collect();
        assert_eq!(files(&entries), vec!["README.md", "notes.weird", "src/main.rs"]);

        let langs: Vec<_> = entries
            .iter()
            .filter_map(|e| match e {
                ScanEntry::File(f) => Some(f.language),
                _ => None,
            })
            .collect();
        assert_eq!(langs, vec![Lang::Markdown, Lang::Text, Lang::Rust]);
    }

    #[test]
    fn skips_large_and_binary_files() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "big.txt", &vec![b'a'; 2048]);
        write(dir.path(), "blob.dat2", b"abc\0def");
        write(dir.path(), "logo.png", b"not really a png");
        write(dir.path(), "ok.py", b"x = 1\n");

        let selector = FileSelector::new(SelectorConfig {
            max_file_size: 1024,
            ..SelectorConfig::default()
        });
        let entries: Vec<_> = selector.scan(dir.path()).collect();
        assert_eq!(files(&entries), vec!["ok.py"]);
        assert!(entries.contains(&ScanEntry::Skipped {
            path: "big.txt".into(),
            reason: SkipReason::TooLarge,
        }));
        assert!(entries.contains(&ScanEntry::Skipped {
            path: "blob.dat2".into(),
            reason: SkipReason::Binary,
        }));
        assert!(entries.contains(&ScanEntry::Skipped {
            path: "logo.png".into(),
            reason: SkipReason::Binary,
        }));
    }

    #[test]
    fn honours_gitignore_without_git_dir() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), ".gitignore", b"generated/\n");
        write(dir.path(), "generated/out.py", b"x = 1\n");
        write(dir.path(), "app.py", b"y = 2\n");

        let selector = FileSelector::new(SelectorConfig::default());
        let entries: Vec<_> = selector.scan(dir.path()).collect();
        assert_eq!(files(&entries), vec!["app.py"]);
    }

    #[cfg(unix)]
    #[test]
    fn broken_symlink_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "real.py", b"x = 1\n");
        std::os::unix::fs::symlink(dir.path().join("missing.py"), dir.path().join("dangling.py"))
            .unwrap();

        let selector = FileSelector::new(SelectorConfig::default());
        let entries: Vec<_> = selector.scan(dir.path()).collect();
        assert_eq!(files(&entries), vec!["real.py"]);
        assert!(entries.contains(&ScanEntry::Skipped {
            path: "dangling.py".into(),
            reason: SkipReason::Symlink,
        }));
    }

    #[cfg(unix)]
    #[test]
    fn symlink_to_file_outside_root_is_not_selected() {
        let outside = tempfile::tempdir().unwrap();
        write(outside.path(), "creds.txt", b"token=secret\n");
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "main.py", b"print(1)\n");
        std::os::unix::fs::symlink(outside.path().join("creds.txt"), dir.path().join("creds.txt"))
            .unwrap();
        std::os::unix::fs::symlink(dir.path().join("main.py"), dir.path().join("alias.py"))
            .unwrap();

        let selector = FileSelector::new(SelectorConfig::default());
        let entries: Vec<_> = selector.scan(dir.path()).collect();
        assert_eq!(files(&entries), vec!["main.py"]);
        for link in ["creds.txt", "alias.py"] {
            assert!(entries.contains(&ScanEntry::Skipped {
                path: link.into(),
                reason: SkipReason::Symlink,
            }));
        }
    }

    #[test]
    fn scan_is_restartable() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.py", b"a = 1\n");
        write(dir.path(), "b.py", b"b = 1\n");

        let selector = FileSelector::new(SelectorConfig::default());
        let mut first = selector.scan(dir.path());
        assert!(first.next().is_some());
        let again: Vec<_> = selector.scan(dir.path()).collect();
        assert_eq!(files(&again), vec!["a.py", "b.py"]);
    }

    #[test]
    fn relative_path_uses_forward_slashes() {
        let root = Path::new("/repo");
        assert_eq!(relative_path(root, Path::new("/repo/src/a/b.rs")), "src/a/b.rs");
    }
}
