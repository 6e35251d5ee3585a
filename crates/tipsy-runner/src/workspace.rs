//! `contents.xcworkspacedata` handling.
//!
//! The descriptor is kept as raw text; only the `location` attribute values
//! of matching `FileRef` elements are spliced, so every other byte survives a
//! rewrite unchanged.

use std::fs;
use std::io;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;
use tracing::debug;

const CONTENTS_FILE: &str = "contents.xcworkspacedata";

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// One `<FileRef location="...">` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileLocation {
    /// Unescaped attribute value, e.g. `group:App.xcodeproj`.
    pub location: String,
    span: Range<usize>,
}

#[derive(Debug, Clone)]
pub struct WorkspaceDescriptor {
    text: String,
    entries: Vec<FileLocation>,
}

fn file_ref_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"<FileRef\s+location\s*=\s*"([^"]*)""#).expect("valid FileRef pattern")
    })
}

impl WorkspaceDescriptor {
    /// Loads `<bundle>/contents.xcworkspacedata`.
    pub fn load(path: &Path) -> Result<Self, WorkspaceError> {
        let file = contents_file(path);
        let text = fs::read_to_string(&file).map_err(|source| WorkspaceError::Read {
            path: file.clone(),
            source,
        })?;
        Ok(Self::parse(text))
    }

    pub fn parse(text: String) -> Self {
        let entries = file_ref_pattern()
            .captures_iter(&text)
            .filter_map(|caps| caps.get(1))
            .map(|m| FileLocation {
                location: xml_unescape(m.as_str()),
                span: m.range(),
            })
            .collect();
        Self { text, entries }
    }

    pub fn entries(&self) -> &[FileLocation] {
        &self.entries
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Points every entry whose location contains `original` at `isolated`
    /// (as `group:<isolated>`). Returns how many entries changed.
    pub fn rewrite_project_location(&mut self, original: &str, isolated: &str) -> usize {
        let replacement = xml_escape(&format!("group:{}", isolated));
        let matching: Vec<usize> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.location.contains(original))
            .map(|(i, _)| i)
            .collect();
        // Splice back to front so earlier spans stay valid.
        for &i in matching.iter().rev() {
            let span = self.entries[i].span.clone();
            self.text.replace_range(span, &replacement);
        }
        let rewritten = matching.len();
        if rewritten > 0 {
            *self = Self::parse(std::mem::take(&mut self.text));
        }
        debug!(original, isolated, rewritten, "workspace locations rewritten");
        rewritten
    }

    /// Writes the descriptor into `<bundle>/contents.xcworkspacedata`.
    pub fn save(&self, path: &Path) -> Result<(), WorkspaceError> {
        let file = contents_file(path);
        fs::write(&file, &self.text).map_err(|source| WorkspaceError::Write {
            path: file.clone(),
            source,
        })
    }
}

fn contents_file(path: &Path) -> PathBuf {
    if path.extension().and_then(|e| e.to_str()) == Some("xcworkspacedata") {
        path.to_path_buf()
    } else {
        path.join(CONTENTS_FILE)
    }
}

fn xml_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' => out.push_str("&apos;"),
            other => out.push(other),
        }
    }
    out
}

fn xml_unescape(s: &str) -> String {
    s.replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}
