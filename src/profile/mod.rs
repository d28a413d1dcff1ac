//! User profiles and the closeness tier derived from interaction count.

pub mod store;

pub use store::{StoreError, UserStore};

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Bound on the rolling conversation memory kept per person.
pub const MAX_SUMMARY_CHARS: usize = 500;
pub const SUMMARY_SEPARATOR: &str = " | ";

/// Relationship level, a pure function of the interaction count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Closeness {
    Stranger,
    Acquaintance,
    Friendly,
    Close,
}

impl Closeness {
    pub const ALL: [Closeness; 4] = [
        Closeness::Stranger,
        Closeness::Acquaintance,
        Closeness::Friendly,
        Closeness::Close,
    ];

    pub fn for_count(interaction_count: u32) -> Self {
        match interaction_count {
            0 => Closeness::Stranger,
            1..=4 => Closeness::Acquaintance,
            5..=14 => Closeness::Friendly,
            _ => Closeness::Close,
        }
    }

    /// Smallest interaction count at which this tier applies.
    pub fn min_interactions(self) -> u32 {
        match self {
            Closeness::Stranger => 0,
            Closeness::Acquaintance => 1,
            Closeness::Friendly => 5,
            Closeness::Close => 15,
        }
    }

    pub fn next(self) -> Option<Self> {
        match self {
            Closeness::Stranger => Some(Closeness::Acquaintance),
            Closeness::Acquaintance => Some(Closeness::Friendly),
            Closeness::Friendly => Some(Closeness::Close),
            Closeness::Close => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Closeness::Stranger => "stranger",
            Closeness::Acquaintance => "acquaintance",
            Closeness::Friendly => "friendly",
            Closeness::Close => "close",
        }
    }
}

impl std::fmt::Display for Closeness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// How much an origin guess is trusted; higher sources replace lower ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum OriginSource {
    FaceAttribute,
    LanguageInference,
    SpokenAnswer,
}

pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserProfile {
    pub user_id: String,
    pub name: String,
    pub estimated_age: i32,
    pub gender: String,
    pub origin: String,
    pub detected_language: String,
    pub preferred_language: String,
    pub cultural_context: String,
    interaction_count: u32,
    pub last_interaction_time: i64,
    /// Persisted copy of the tier; never read back as truth.
    social_state: String,
    pub short_memory_summary: String,
    #[serde(skip)]
    origin_source: Option<OriginSource>,
}

impl Default for UserProfile {
    fn default() -> Self {
        Self {
            user_id: String::new(),
            name: String::new(),
            estimated_age: 0,
            gender: "unknown".to_string(),
            origin: String::new(),
            detected_language: String::new(),
            preferred_language: String::new(),
            cultural_context: String::new(),
            interaction_count: 0,
            last_interaction_time: 0,
            social_state: Closeness::Stranger.label().to_string(),
            short_memory_summary: String::new(),
            origin_source: None,
        }
    }
}

impl UserProfile {
    pub fn new(user_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn interaction_count(&self) -> u32 {
        self.interaction_count
    }

    /// Tier recomputed from the count; the stored label is ignored.
    pub fn closeness(&self) -> Closeness {
        Closeness::for_count(self.interaction_count)
    }

    pub fn stored_social_state(&self) -> &str {
        &self.social_state
    }

    pub(crate) fn normalize(&mut self) {
        self.social_state = self.closeness().label().to_string();
        if self.gender.is_empty() {
            self.gender = "unknown".to_string();
        }
    }

    /// Count one completed encounter.
    pub fn record_interaction(&mut self) {
        self.record_interaction_at(now_millis());
    }

    pub fn record_interaction_at(&mut self, timestamp_ms: i64) {
        self.interaction_count = self.interaction_count.saturating_add(1);
        self.last_interaction_time = timestamp_ms;
        self.social_state = self.closeness().label().to_string();
    }

    /// Only fills an empty value; once set it sticks.
    pub fn set_preferred_language(&mut self, language: &str) {
        if self.preferred_language.is_empty() && !language.is_empty() {
            self.preferred_language = language.to_string();
        }
    }

    /// Replace the origin unless a more trusted source already set it.
    pub fn offer_origin(&mut self, origin: &str, source: OriginSource) -> bool {
        let origin = origin.trim();
        if origin.is_empty() {
            return false;
        }
        let current = match (&self.origin_source, self.origin.is_empty()) {
            (Some(current), _) => Some(*current),
            (None, true) => None,
            (None, false) => Some(OriginSource::SpokenAnswer),
        };
        if current.is_some_and(|current| current > source) {
            return false;
        }
        self.origin = origin.to_string();
        self.origin_source = Some(source);
        true
    }

    pub fn origin_source(&self) -> Option<OriginSource> {
        self.origin_source
    }

    /// Append a conversation summary, keeping the most recent text within the bound.
    pub fn append_summary(&mut self, summary: &str) {
        let summary = summary.trim();
        if summary.is_empty() {
            return;
        }
        let combined = if self.short_memory_summary.is_empty() {
            summary.to_string()
        } else {
            format!("{}{SUMMARY_SEPARATOR}{summary}", self.short_memory_summary)
        };
        let total = combined.chars().count();
        self.short_memory_summary = if total > MAX_SUMMARY_CHARS {
            combined.chars().skip(total - MAX_SUMMARY_CHARS).collect()
        } else {
            combined
        };
    }
}

/// Remaining encounters before the next tier, or `None` at the top tier.
pub fn interactions_until_next(interaction_count: u32) -> Option<u32> {
    Closeness::for_count(interaction_count)
        .next()
        .map(|next| next.min_interactions().saturating_sub(interaction_count))
}

/// One-line relationship context suitable for prompts and logs.
pub fn relationship_description(profile: &UserProfile) -> String {
    let name = &profile.name;
    let count = profile.interaction_count();
    match profile.closeness() {
        Closeness::Stranger => "This is a new person you've never met before.".to_string(),
        Closeness::Acquaintance => format!(
            "You've met {name} a few times. You know their name but are still getting to know them."
        ),
        Closeness::Friendly => format!(
            "You and {name} are becoming good friends. You've had {count} conversations together."
        ),
        Closeness::Close => format!(
            "You and {name} are close friends. You've shared many conversations ({count} interactions) and know each other well."
        ),
    }
}

#[cfg(test)]
pub(crate) fn profile_with_count(name: &str, interaction_count: u32) -> UserProfile {
    let mut profile = UserProfile::new(format!("user_test_{name}"), name);
    profile.interaction_count = interaction_count;
    profile.normalize();
    profile
}
