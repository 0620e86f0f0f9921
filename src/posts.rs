//! Markdown source of blog posts.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PostError {
    #[error("invalid post slug `{0}`")]
    BadSlug(String),
    #[error("post `{0}` not found")]
    NotFound(String),
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Slugs are single path segments of `[A-Za-z0-9_-]`.
pub fn is_valid_slug(slug: &str) -> bool {
    !slug.is_empty()
        && slug
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// Drop a leading `---` delimited frontmatter block.
pub fn strip_frontmatter(source: &str) -> &str {
    let Some(rest) = source
        .strip_prefix("---\n")
        .or_else(|| source.strip_prefix("---\r\n"))
    else {
        return source;
    };

    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        offset += line.len();
        if line.trim_end() == "---" {
            return rest[offset..].trim_start_matches(['\r', '\n']);
        }
    }
    source
}

/// Raw Markdown body of `{dir}/{slug}.md`.
pub fn load_body(dir: &Path, slug: &str) -> Result<String, PostError> {
    if !is_valid_slug(slug) {
        return Err(PostError::BadSlug(slug.to_string()));
    }
    let path = dir.join(format!("{}.md", slug));
    match fs::read_to_string(&path) {
        Ok(source) => Ok(strip_frontmatter(&source).to_string()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Err(PostError::NotFound(slug.to_string())),
        Err(source) => Err(PostError::Io { path, source }),
    }
}
