//! Text heuristics and fixed lines the engine speaks or sends to the chat model.

use crate::profile::{Closeness, UserProfile};
use crate::services::ChatMessage;

pub const ROBOT_NAME: &str = "Sota";
pub const DEFAULT_NAME: &str = "Friend";
pub const ASK_NAME: &str = "What's your name?";
pub const ASK_NAME_AGAIN: &str = "Sorry, I couldn't hear that. Could you tell me your name again?";
pub const SILENCE_REPROMPT: &str = "I can't hear you. Could you say that again?";
pub const APOLOGY: &str = "Sorry, I had trouble thinking about that.";

pub const SUMMARY_SYSTEM_PROMPT: &str =
    "You are a helpful assistant that creates brief conversation summaries.";

const NAME_PREFIXES: [&str; 9] = [
    "my name is ",
    "i'm ",
    "i am ",
    "it's ",
    "call me ",
    "this is ",
    "the name is ",
    "私は",
    "僕は",
];
const NAME_SUFFIXES: [&str; 3] = ["と申します", "といいます", "です"];
const NAME_TRAILING: [char; 5] = ['.', ',', '!', '。', '、'];

const ORIGIN_PREFIXES: [&str; 7] = [
    "i'm from ",
    "i am from ",
    "i come from ",
    "i came from ",
    "from ",
    "it's ",
    "it is ",
];
const ORIGIN_SUFFIXES: [&str; 5] = ["から来ました", "から来た", "出身です", "出身", "です"];
const ORIGIN_TRAILING: [char; 4] = ['.', ',', '!', '。'];

const GOODBYE_WORDS: [&str; 13] = [
    "goodbye",
    "good bye",
    "bye bye",
    "bye-bye",
    "bye",
    "see you",
    "see ya",
    "gotta go",
    "i have to go",
    "talk to you later",
    "catch you later",
    "farewell",
    "take care",
];
const GOODBYE_JA: [&str; 5] = ["さようなら", "またね", "じゃあね", "バイバイ", "失礼します"];

const HALLUCINATION_PHRASES: [&str; 20] = [
    "thank you for watching",
    "thanks for watching",
    "please subscribe",
    "like and subscribe",
    "subtitles by",
    "captions by",
    "translated by",
    "copyright",
    "all rights reserved",
    "www.",
    "http",
    ".com",
    ".org",
    "the end",
    "to be continued",
    "ご視聴ありがとう",
    "字幕",
    "チャンネル登録",
    "続く",
    "お疎いしました",
];

/// Case-insensitive ASCII prefix strip that never splits a char.
fn strip_prefix_ignore_case<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let head = text.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix)
        .then(|| &text[prefix.len()..])
}

fn strip_first_prefix<'a>(text: &'a str, prefixes: &[&str]) -> &'a str {
    prefixes
        .iter()
        .find_map(|prefix| strip_prefix_ignore_case(text, prefix))
        .map(str::trim)
        .unwrap_or(text)
}

fn strip_first_suffix<'a>(text: &'a str, suffixes: &[&str]) -> &'a str {
    suffixes
        .iter()
        .find_map(|suffix| text.strip_suffix(suffix))
        .map(str::trim)
        .unwrap_or(text)
}

/// Pull a name out of an answer like "My name is Alice." or "アリスです".
pub fn extract_name(answer: &str) -> Option<String> {
    let cleaned = strip_first_prefix(answer.trim(), &NAME_PREFIXES);
    let cleaned = cleaned.trim_end_matches(NAME_TRAILING).trim();
    let cleaned = strip_first_suffix(cleaned, &NAME_SUFFIXES);
    let cleaned = cleaned.trim_end_matches(NAME_TRAILING).trim();
    (!cleaned.is_empty()).then(|| cleaned.to_string())
}

/// Pull a place out of an answer like "I'm from canada!" (becomes "Canada").
pub fn extract_origin(answer: &str) -> Option<String> {
    let bare = answer.trim().trim_end_matches(ORIGIN_TRAILING).trim_end();
    if ORIGIN_PREFIXES
        .iter()
        .any(|prefix| prefix.trim_end().eq_ignore_ascii_case(bare))
    {
        return None;
    }
    let cleaned = strip_first_prefix(answer.trim(), &ORIGIN_PREFIXES);
    let cleaned = cleaned.trim_end_matches(ORIGIN_TRAILING).trim();
    let cleaned = strip_first_suffix(cleaned, &ORIGIN_SUFFIXES);
    let cleaned = cleaned.trim_end_matches(ORIGIN_TRAILING).trim();
    let mut chars = cleaned.chars();
    let first = chars.next()?;
    Some(first.to_uppercase().chain(chars).collect())
}

/// Country guess from a spoken-language code. English is too ambiguous.
pub fn language_to_country(code: &str) -> Option<&'static str> {
    Some(match code {
        "zh" => "China",
        "ja" => "Japan",
        "ko" => "Korea",
        "id" => "Indonesia",
        "ms" => "Malaysia",
        "th" => "Thailand",
        "vi" => "Vietnam",
        "hi" => "India",
        "ar" => "the Middle East",
        "fr" => "France",
        "de" => "Germany",
        "es" => "Spain",
        "pt" => "Brazil",
        "ru" => "Russia",
        "it" => "Italy",
        "nl" => "the Netherlands",
        "tr" => "Turkey",
        "pl" => "Poland",
        "sv" => "Sweden",
        "fi" => "Finland",
        _ => return None,
    })
}

pub fn language_name(code: &str) -> &str {
    match code {
        "ja" => "Japanese",
        "en" => "English",
        "id" => "Indonesian",
        "ko" => "Korean",
        "zh" => "Chinese",
        "fr" => "French",
        "de" => "German",
        "es" => "Spanish",
        "pt" => "Portuguese",
        "ar" => "Arabic",
        "hi" => "Hindi",
        "th" => "Thai",
        "vi" => "Vietnamese",
        "ru" => "Russian",
        "ms" => "Malay",
        "tr" => "Turkish",
        other => other,
    }
}

pub fn face_label_to_origin(label: &str) -> Option<&'static str> {
    Some(match label.trim().to_lowercase().as_str() {
        "asian" => "Asia",
        "white" => "Europe or America",
        "middle eastern" => "the Middle East",
        "indian" => "South Asia",
        "latino hispanic" => "Latin America",
        "black" => "Africa or America",
        _ => return None,
    })
}

fn contains_word(haystack: &str, phrase: &str) -> bool {
    haystack.match_indices(phrase).any(|(start, matched)| {
        let before = haystack[..start].chars().next_back();
        let after = haystack[start + matched.len()..].chars().next();
        !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
    })
}

/// Goodbye in English (word-bounded) or Japanese, in either transcript.
pub fn is_goodbye(text_en: &str, text: &str) -> bool {
    [text_en, text].iter().any(|candidate| {
        let lower = candidate.trim().to_lowercase();
        GOODBYE_WORDS.iter().any(|phrase| contains_word(&lower, phrase))
            || GOODBYE_JA.iter().any(|phrase| lower.contains(phrase))
    })
}

/// Typical transcription artifacts produced from silence or noise.
pub fn is_hallucination(text: &str) -> bool {
    let lower = text.trim().to_lowercase();
    let total = lower.chars().count();
    if total < 3 {
        return true;
    }
    if total >= 6 {
        let max_len = (total / 3).min(10);
        for len in 1..=max_len {
            let unit: String = lower.chars().take(len).collect();
            let rest = lower
                .replace(&unit, "")
                .chars()
                .filter(|c| !c.is_whitespace() && *c != ',' && *c != '.')
                .count();
            if rest < total / 4 {
                return true;
            }
        }
    }
    HALLUCINATION_PHRASES
        .iter()
        .any(|phrase| lower.contains(phrase))
}

fn memory_reference(profile: &UserProfile) -> String {
    if !profile.short_memory_summary.is_empty() {
        " Last time we talked about some interesting things!".to_string()
    } else if profile.interaction_count() > 1 {
        format!(" We've met {} times now!", profile.interaction_count())
    } else {
        String::new()
    }
}

/// Opening line for a new encounter.
pub fn greeting(profile: Option<&UserProfile>, is_new: bool) -> String {
    let remembered = profile.filter(|profile| !is_new && !profile.name.is_empty());
    let Some(profile) = remembered else {
        let mut line = format!("Hello! I'm {ROBOT_NAME}, a friendly robot. Nice to meet you!");
        if let Some(origin) = profile.map(|p| p.origin.as_str()).filter(|o| !o.is_empty()) {
            line.push_str(&format!(" Are you from {origin}?"));
        }
        return line;
    };
    let name = &profile.name;
    let mem = memory_reference(profile);
    match profile.closeness() {
        Closeness::Close => format!("Hey {name}! Great to see you again!{mem} How's your day going?"),
        Closeness::Friendly => format!("Hi {name}! Nice to see you again!{mem} What's up?"),
        _ => format!("Hello {name}! I remember you! Welcome back!{mem} How are you?"),
    }
}

pub fn ask_origin(name: &str) -> String {
    format!("Nice to meet you, {name}! Where are you from?")
}

pub fn acknowledge_origin(origin: &str) -> String {
    format!("Oh, {origin}! That's wonderful!")
}

pub fn closing_line(name: Option<&str>, language: &str) -> String {
    let name = name.filter(|name| !name.is_empty());
    match (name, language == "ja") {
        (Some(name), true) => format!("{name}さん、楽しかったよ！またね！"),
        (None, true) => "楽しかったよ！またね！".to_string(),
        (Some(name), false) => format!("It was great talking to you, {name}! See you next time!"),
        (None, false) => "It was nice talking to you! See you later!".to_string(),
    }
}

/// Inputs for the conversational system prompt.
#[derive(Debug, Clone, Copy)]
pub struct PromptContext<'a> {
    pub profile: Option<&'a UserProfile>,
    pub no_memory: bool,
    pub language: &'a str,
}

pub fn system_prompt(ctx: PromptContext<'_>) -> String {
    let mut prompt = format!("You are {ROBOT_NAME}, a friendly social robot. ");
    if let Some(profile) = ctx.profile.filter(|profile| !profile.name.is_empty()) {
        let name = &profile.name;
        prompt.push_str(&format!("You are talking to {name}. "));
        if !profile.origin.is_empty() {
            prompt.push_str(&format!("{name} is from {}. ", profile.origin));
        }
        if ctx.no_memory {
            prompt.push_str("This is your first time meeting this person. ");
        } else {
            if profile.interaction_count() > 1 {
                prompt.push_str(&format!(
                    "You have met {} times before. ",
                    profile.interaction_count()
                ));
            }
            if !profile.short_memory_summary.is_empty() {
                prompt.push_str(&format!(
                    "Previous conversations: {} ",
                    profile.short_memory_summary
                ));
            }
        }
    }
    prompt.push_str(&format!(
        "The user spoke in {} (detected: {}). ",
        language_name(ctx.language),
        ctx.language
    ));
    prompt.push_str("IMPORTANT: You can ONLY speak Japanese or English (robot TTS limitation). ");
    if ctx.language == "ja" {
        prompt.push_str("The user spoke Japanese, so respond in Japanese. ");
    } else {
        prompt.push_str("Respond in English. ");
    }
    prompt.push_str("Keep your response under 2 sentences. ");
    prompt.push_str("Be warm, friendly, and natural. ");
    prompt.push_str("Show genuine interest in the user's culture and background.");
    prompt
}

pub fn summary_prompt(transcript: &[ChatMessage]) -> String {
    let mut prompt = String::from(
        "Summarize this conversation in 1-2 short sentences for future reference. \
         Focus on key topics discussed, user interests, and any personal information shared. \
         Be concise.\n\nConversation:\n",
    );
    for message in transcript {
        prompt.push_str(message.role.as_str());
        prompt.push_str(": ");
        prompt.push_str(&message.content);
        prompt.push('\n');
    }
    prompt
}
