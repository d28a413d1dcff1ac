//! JSON-array profile file, loaded once and rewritten whole on every change.

use super::{now_millis, UserProfile};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{info, info_span, warn, Span};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    Io(String),
    Serialize(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(msg) => write!(f, "profile store IO error: {msg}"),
            Self::Serialize(msg) => write!(f, "profile store encode error: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

pub struct UserStore {
    path: PathBuf,
    profiles: BTreeMap<String, UserProfile>,
    span: Span,
}

impl UserStore {
    /// Load `path`; a missing file starts empty, bad entries are skipped.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let span = info_span!("user_store", path = %path.display());
        let profiles = {
            let _entered = span.enter();
            let profiles = load_profiles(&path);
            info!(count = profiles.len(), "profiles loaded");
            profiles
        };
        Self {
            path,
            profiles,
            span,
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    pub fn get(&self, user_id: &str) -> Option<&UserProfile> {
        self.profiles.get(user_id)
    }

    /// Case-insensitive linear scan; empty names never match.
    pub fn find_by_name(&self, name: &str) -> Option<&UserProfile> {
        let wanted = name.trim().to_lowercase();
        if wanted.is_empty() {
            return None;
        }
        self.profiles
            .values()
            .find(|profile| profile.name.to_lowercase() == wanted)
    }

    pub fn profiles(&self) -> impl Iterator<Item = &UserProfile> {
        self.profiles.values()
    }

    /// `user_{epoch-ms}_{count}`; collisions are tolerated, not prevented.
    pub fn generate_id(&self) -> String {
        format!("user_{}_{}", now_millis(), self.profiles.len())
    }

    /// Insert and persist. Memory is updated even when the write fails.
    pub fn add(&mut self, profile: UserProfile) -> Result<(), StoreError> {
        self.upsert(profile, "profile added")
    }

    pub fn update(&mut self, profile: UserProfile) -> Result<(), StoreError> {
        self.upsert(profile, "profile updated")
    }

    fn upsert(&mut self, mut profile: UserProfile, event: &str) -> Result<(), StoreError> {
        let _entered = self.span.enter();
        profile.normalize();
        info!(
            user_id = %profile.user_id,
            name = %profile.name,
            interactions = profile.interaction_count(),
            tier = %profile.closeness(),
            "{event}"
        );
        self.profiles.insert(profile.user_id.clone(), profile);
        self.save()
    }

    fn save(&self) -> Result<(), StoreError> {
        let list: Vec<&UserProfile> = self.profiles.values().collect();
        let json = serde_json::to_string_pretty(&list)
            .map_err(|err| StoreError::Serialize(err.to_string()))?;
        write_replacing(&self.path, json.as_bytes()).map_err(|err| {
            warn!(error = %err, "profile write failed; keeping in-memory state");
            StoreError::Io(format!("{}: {err}", self.path.display()))
        })
    }
}

fn write_replacing(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)
}

fn load_profiles(path: &Path) -> BTreeMap<String, UserProfile> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return BTreeMap::new(),
        Err(err) => {
            warn!(error = %err, "profile file unreadable; starting empty");
            return BTreeMap::new();
        }
    };
    if raw.trim().is_empty() {
        return BTreeMap::new();
    }
    let entries: Vec<serde_json::Value> = match serde_json::from_str(&raw) {
        Ok(entries) => entries,
        Err(err) => {
            warn!(error = %err, "profile file is not a JSON array; starting empty");
            return BTreeMap::new();
        }
    };

    let mut profiles = BTreeMap::new();
    for (index, entry) in entries.into_iter().enumerate() {
        match serde_json::from_value::<UserProfile>(entry) {
            Ok(mut profile) if !profile.user_id.is_empty() => {
                profile.normalize();
                profiles.insert(profile.user_id.clone(), profile);
            }
            Ok(_) => warn!(index, "skipping profile without userId"),
            Err(err) => warn!(index, error = %err, "skipping malformed profile"),
        }
    }
    profiles
}
