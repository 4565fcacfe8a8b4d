//! File upload configs and per-entry progress, validation and cancellation.
//!
//! Only metadata lives here; the bytes travel out of band. An entry ends in
//! exactly one terminal state: done, cancelled or errored.

use std::collections::BTreeMap;

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const TOO_MANY_FILES: &str = "Too many files";
pub const TOO_LARGE: &str = "Too large";
pub const NOT_ALLOWED: &str = "Not allowed";

const DEFAULT_MAX_FILE_SIZE: u64 = 10 * 1024 * 1024;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UploadError {
    #[error("invalid accept pattern {0}")]
    InvalidAccept(String),

    #[error("no upload named {0}")]
    UnknownConfig(String),
}

/// Options passed to `allow_upload`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadOptions {
    /// Extensions (`.png`) or MIME globs (`image/*`). Empty accepts anything.
    #[serde(default)]
    pub accept: Vec<String>,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
}

fn default_max_entries() -> usize {
    1
}

fn default_max_file_size() -> u64 {
    DEFAULT_MAX_FILE_SIZE
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            accept: Vec::new(),
            max_entries: default_max_entries(),
            max_file_size: default_max_file_size(),
        }
    }
}

/// File metadata reported by the client on selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientFile {
    #[serde(rename = "ref")]
    pub entry_ref: String,
    pub name: String,
    pub size: u64,
    #[serde(rename = "type", default)]
    pub mime: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadEntry {
    #[serde(rename = "ref")]
    pub entry_ref: String,
    pub name: String,
    pub size: u64,
    #[serde(rename = "type")]
    pub mime: String,
    pub progress: u8,
    pub done: bool,
    pub cancelled: bool,
    pub errors: Vec<String>,
}

impl UploadEntry {
    fn new(file: ClientFile) -> Self {
        Self {
            entry_ref: file.entry_ref,
            name: file.name,
            size: file.size,
            mime: file.mime,
            progress: 0,
            done: false,
            cancelled: false,
            errors: Vec::new(),
        }
    }

    pub fn is_errored(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn is_terminal(&self) -> bool {
        self.done || self.cancelled || self.is_errored()
    }
}

#[derive(Debug, Clone)]
struct AcceptMatcher {
    any: bool,
    names: GlobSet,
    mimes: GlobSet,
}

impl AcceptMatcher {
    fn new(patterns: &[String]) -> Result<Self, UploadError> {
        let mut names = GlobSetBuilder::new();
        let mut mimes = GlobSetBuilder::new();
        for pattern in patterns {
            let pattern = pattern.trim();
            let (builder, glob) = if pattern.starts_with('.') {
                (&mut names, format!("*{}", pattern))
            } else {
                (&mut mimes, pattern.to_string())
            };
            let glob = GlobBuilder::new(&glob)
                .case_insensitive(true)
                .literal_separator(false)
                .build()
                .map_err(|_| UploadError::InvalidAccept(pattern.to_string()))?;
            builder.add(glob);
        }
        let build = |builder: GlobSetBuilder| {
            builder
                .build()
                .map_err(|e| UploadError::InvalidAccept(e.to_string()))
        };
        Ok(Self {
            any: patterns.is_empty(),
            names: build(names)?,
            mimes: build(mimes)?,
        })
    }

    fn accepts(&self, name: &str, mime: &str) -> bool {
        self.any || self.names.is_match(name) || (!mime.is_empty() && self.mimes.is_match(mime))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadConfig {
    pub name: String,
    pub accept: Vec<String>,
    pub max_entries: usize,
    pub max_file_size: u64,
    pub entries: Vec<UploadEntry>,
    /// Config-level errors, e.g. [`TOO_MANY_FILES`].
    pub errors: Vec<String>,
    #[serde(skip)]
    matcher: AcceptMatcher,
}

impl UploadConfig {
    pub fn new(name: impl Into<String>, options: UploadOptions) -> Result<Self, UploadError> {
        let matcher = AcceptMatcher::new(&options.accept)?;
        Ok(Self {
            name: name.into(),
            accept: options.accept,
            max_entries: options.max_entries,
            max_file_size: options.max_file_size,
            entries: Vec::new(),
            errors: Vec::new(),
            matcher,
        })
    }

    /// Register client-selected files, validating each against size and type.
    pub fn add_entries(&mut self, files: impl IntoIterator<Item = ClientFile>) {
        for file in files {
            if self.entry(&file.entry_ref).is_some() {
                continue;
            }
            let mut entry = UploadEntry::new(file);
            if entry.size > self.max_file_size {
                entry.errors.push(TOO_LARGE.to_string());
            }
            if !self.matcher.accepts(&entry.name, &entry.mime) {
                entry.errors.push(NOT_ALLOWED.to_string());
            }
            debug!(upload = %self.name, entry_ref = %entry.entry_ref, errors = entry.errors.len(), "upload entry added");
            self.entries.push(entry);
        }
        self.check_entry_count();
    }

    /// Progress only moves forward; 100 marks the entry done. Returns whether
    /// anything changed.
    pub fn update_progress(&mut self, entry_ref: &str, percent: u8) -> bool {
        let Some(entry) = self.entries.iter_mut().find(|e| e.entry_ref == entry_ref) else {
            return false;
        };
        let percent = percent.min(100);
        if entry.is_terminal() || percent <= entry.progress {
            return false;
        }
        entry.progress = percent;
        if percent == 100 {
            entry.done = true;
        }
        true
    }

    /// Remove an in-flight entry and return it marked cancelled.
    ///
    /// Unknown refs and done entries are left alone. An errored entry is
    /// dismissed: removed and returned with its errors, but never flagged
    /// cancelled, so it keeps exactly one terminal state.
    pub fn cancel(&mut self, entry_ref: &str) -> Option<UploadEntry> {
        let index = self
            .entries
            .iter()
            .position(|e| e.entry_ref == entry_ref && !e.done)?;
        let mut entry = self.entries.remove(index);
        if !entry.is_errored() {
            entry.cancelled = true;
        }
        debug!(upload = %self.name, entry_ref = %entry.entry_ref, cancelled = entry.cancelled, "upload entry removed");
        self.check_entry_count();
        Some(entry)
    }

    /// Take every finished entry out of the config.
    pub fn consume_done(&mut self) -> Vec<UploadEntry> {
        let (done, pending): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.entries).into_iter().partition(|e| e.done);
        self.entries = pending;
        self.check_entry_count();
        done
    }

    pub fn entry(&self, entry_ref: &str) -> Option<&UploadEntry> {
        self.entries.iter().find(|e| e.entry_ref == entry_ref)
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty() && self.entries.iter().all(|e| !e.is_errored())
    }

    fn check_entry_count(&mut self) {
        self.errors.retain(|e| e != TOO_MANY_FILES);
        if self.entries.len() > self.max_entries {
            self.errors.push(TOO_MANY_FILES.to_string());
        }
    }
}

/// All upload configs registered on one socket, by name.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct Uploads {
    configs: BTreeMap<String, UploadConfig>,
}

impl Uploads {
    /// Register (or replace) an upload config.
    pub fn allow(&mut self, name: &str, options: UploadOptions) -> Result<&UploadConfig, UploadError> {
        let config = UploadConfig::new(name, options)?;
        self.configs.insert(name.to_string(), config);
        self.get(name).ok_or_else(|| UploadError::UnknownConfig(name.to_string()))
    }

    pub fn get(&self, name: &str) -> Option<&UploadConfig> {
        self.configs.get(name)
    }

    fn get_mut(&mut self, name: &str) -> Result<&mut UploadConfig, UploadError> {
        self.configs
            .get_mut(name)
            .ok_or_else(|| UploadError::UnknownConfig(name.to_string()))
    }

    pub fn add_entries(&mut self, name: &str, files: Vec<ClientFile>) -> Result<(), UploadError> {
        self.get_mut(name)?.add_entries(files);
        Ok(())
    }

    pub fn update_progress(&mut self, name: &str, entry_ref: &str, percent: u8) -> Result<bool, UploadError> {
        Ok(self.get_mut(name)?.update_progress(entry_ref, percent))
    }

    /// Cancelling against an unknown config or ref is a no-op.
    pub fn cancel(&mut self, name: &str, entry_ref: &str) -> Option<UploadEntry> {
        self.configs.get_mut(name)?.cancel(entry_ref)
    }

    pub fn consume_done(&mut self, name: &str) -> Vec<UploadEntry> {
        self.configs
            .get_mut(name)
            .map(UploadConfig::consume_done)
            .unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = &UploadConfig> {
        self.configs.values()
    }
}
