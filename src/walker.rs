//! Checkout walker: lists indexable files and digests their contents.
//!
//! Pruning rules, applied in order:
//! - directories named in the built-in skip list or `indexing.skip_dirs`
//! - hidden files (leading `.`)
//! - paths matching `indexing.exclude_globs`
//! - extensions outside the known source/text set
//! - files larger than `indexing.max_file_size_bytes`
//!
//! Results are sorted by path so the walk order is stable across runs.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use tracing::warn;
use walkdir::WalkDir;

use repo_indexer_core::models::{content_digest, WalkedFile};

use crate::config::IndexingConfig;

const SKIP_DIRS: &[&str] = &[
    "node_modules", "vendor", "dist", "build", "target", "__pycache__", ".git", ".svn", ".hg",
    "coverage", ".idea", ".vscode", "bin", "obj", ".cache", ".pytest_cache", ".mypy_cache",
    "venv", ".venv", "env", ".env", "deps", "_deps", "third_party", "external", "packages",
    ".nuget", ".gradle", ".cargo", "cmake-build", "out", "output", ".terraform", ".next",
    ".turbo",
];

/// Indexable extensions (lowercase, no dot) and their language tags.
const LANGUAGES: &[(&str, &str)] = &[
    ("go", "go"),
    ("py", "python"),
    ("js", "javascript"),
    ("jsx", "javascript"),
    ("ts", "typescript"),
    ("tsx", "typescript"),
    ("rs", "rust"),
    ("java", "java"),
    ("kt", "kotlin"),
    ("scala", "scala"),
    ("c", "c"),
    ("h", "c"),
    ("cpp", "cpp"),
    ("cc", "cpp"),
    ("cxx", "cpp"),
    ("hpp", "cpp"),
    ("cs", "csharp"),
    ("rb", "ruby"),
    ("php", "php"),
    ("swift", "swift"),
    ("m", "objective-c"),
    ("mm", "objective-c"),
    ("lua", "lua"),
    ("pl", "perl"),
    ("pm", "perl"),
    ("r", "r"),
    ("jl", "julia"),
    ("ex", "elixir"),
    ("exs", "elixir"),
    ("erl", "erlang"),
    ("hrl", "erlang"),
    ("clj", "clojure"),
    ("cljs", "clojure"),
    ("hs", "haskell"),
    ("ml", "ocaml"),
    ("mli", "ocaml"),
    ("fs", "fsharp"),
    ("fsx", "fsharp"),
    ("dart", "dart"),
    ("elm", "elm"),
    ("vue", "vue"),
    ("svelte", "svelte"),
    ("astro", "astro"),
    ("sql", "sql"),
    ("sh", "shell"),
    ("bash", "shell"),
    ("zsh", "shell"),
    ("fish", "shell"),
    ("ps1", "powershell"),
    ("bat", "batch"),
    ("cmd", "batch"),
    ("yaml", "yaml"),
    ("yml", "yaml"),
    ("toml", "toml"),
    ("json", "json"),
    ("xml", "xml"),
    ("html", "html"),
    ("htm", "html"),
    ("css", "css"),
    ("scss", "scss"),
    ("sass", "sass"),
    ("less", "less"),
    ("md", "markdown"),
    ("mdx", "markdown"),
    ("rst", "rst"),
    ("txt", "text"),
    ("proto", "protobuf"),
    ("graphql", "graphql"),
    ("gql", "graphql"),
    ("tf", "terraform"),
    ("tfvars", "terraform"),
    ("nix", "nix"),
    ("zig", "zig"),
    ("nim", "nim"),
    ("v", "vlang"),
    ("sol", "solidity"),
    ("move", "move"),
];

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
}

/// Language tag for `path`, or `"unknown"`.
pub fn detect_language(path: &Path) -> &'static str {
    extension(path)
        .and_then(|ext| {
            LANGUAGES
                .iter()
                .find(|(known, _)| *known == ext)
                .map(|(_, lang)| *lang)
        })
        .unwrap_or("unknown")
}

pub fn is_indexable(path: &Path) -> bool {
    detect_language(path) != "unknown"
}

#[derive(Debug, Clone)]
pub struct WalkOptions {
    pub max_file_size: u64,
    skip_dirs: HashSet<String>,
    exclude: GlobSet,
}

impl WalkOptions {
    pub fn from_config(config: &IndexingConfig) -> Result<Self> {
        let mut skip_dirs: HashSet<String> = SKIP_DIRS.iter().map(|s| s.to_string()).collect();
        skip_dirs.extend(config.skip_dirs.iter().cloned());
        Ok(Self {
            max_file_size: config.max_file_size_bytes,
            skip_dirs,
            exclude: build_globset(&config.exclude_globs)?,
        })
    }

    fn skips_dir(&self, name: &str) -> bool {
        self.skip_dirs.contains(name)
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("invalid glob: {}", pattern))?);
    }
    Ok(builder.build()?)
}

/// `/`-separated path of `path` relative to `root`.
fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().to_string()),
            _ => None,
        })
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// Walk `root` synchronously. Only a missing or unreadable root is an
/// error; individual entries that cannot be read are logged and skipped.
pub fn walk_checkout(root: &Path, options: &WalkOptions) -> Result<Vec<WalkedFile>> {
    if !root.is_dir() {
        bail!("checkout root does not exist: {}", root.display());
    }

    let mut files = Vec::new();
    let walker = WalkDir::new(root).follow_links(false).into_iter();
    let entries = walker.filter_entry(|entry| {
        entry.depth() == 0
            || !entry.file_type().is_dir()
            || !options.skips_dir(&entry.file_name().to_string_lossy())
    });

    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                if err.depth() == 0 {
                    bail!("cannot read checkout root {}: {}", root.display(), err);
                }
                warn!(error = %err, "skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }

        let path = entry.path();
        let Some(rel) = relative_path(root, path) else {
            continue;
        };
        if options.exclude.is_match(&rel) || !is_indexable(path) {
            continue;
        }

        let size = match entry.metadata() {
            Ok(meta) => meta.len(),
            Err(err) => {
                warn!(path = %rel, error = %err, "skipping file without metadata");
                continue;
            }
        };
        if size > options.max_file_size {
            continue;
        }

        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(path = %rel, error = %err, "skipping unreadable file");
                continue;
            }
        };

        files.push(WalkedFile {
            content_hash: content_digest(&bytes),
            language: detect_language(path).to_string(),
            size_bytes: bytes.len() as i64,
            path: rel,
        });
    }

    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(files)
}

/// [`walk_checkout`] on the blocking pool.
pub async fn walk(root: PathBuf, options: Arc<WalkOptions>) -> Result<Vec<WalkedFile>> {
    tokio::task::spawn_blocking(move || walk_checkout(&root, &options))
        .await
        .context("walker task panicked")?
}
