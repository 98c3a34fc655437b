//! Pure functions that build, window and trim a chat's message sequence.
//!
//! Nothing here touches storage or the network; callers persist whatever
//! these functions return.

use crate::error::{ChatError, ChatResult};
use crate::models::{ApiRole, Character, Chat, Message, Role, SeedMessage, TranscriptEntry};

/// Every character introduction starts with this text.
pub const INTRO_PREFIX: &str = "Role play as, Character Name:";

/// The slice of a chat shown to the user, plus where it starts in the full content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VisibleWindow<'a> {
    pub start: usize,
    pub messages: &'a [Message],
}

/// Skips everything up to and including the character-introduction pair.
pub fn compute_visible_window(messages: &[Message]) -> VisibleWindow<'_> {
    let start = messages
        .iter()
        .position(|m| m.role == Role::User && m.txt.starts_with(INTRO_PREFIX))
        .map(|p| (p + 2).min(messages.len()))
        .unwrap_or(0);

    VisibleWindow {
        start,
        messages: &messages[start..],
    }
}

/// The user/ai pair that tells the model which character to play.
pub fn character_intro(character: &Character) -> [Message; 2] {
    [
        Message::user(format!(
            "{} {}.\nCharacter description: {}.\nExample dialogue: {}",
            INTRO_PREFIX, character.name, character.description, character.prompt
        )),
        Message::ai(format!(
            "Understood, I'll play as {} from now on.",
            character.name
        )),
    ]
}

/// Builds the opening sequence for a chat whose content is still empty.
/// A chat that already has content is returned as-is.
pub fn seed_if_empty(
    chat: &Chat,
    predefined_seeds: &[SeedMessage],
    character: Option<&Character>,
) -> Vec<Message> {
    if !chat.content.is_empty() {
        return chat.content.clone();
    }

    let mut content: Vec<Message> = predefined_seeds
        .iter()
        .filter(|seed| !seed.message.is_empty())
        .map(|seed| Message::new(seed.role, seed.message.clone()))
        .collect();

    // No associated character means no introduction pair.
    if let (Some(_), Some(character)) = (chat.character_id, character) {
        content.extend(character_intro(character));
    }

    content
}

pub fn append_message(content: &[Message], role: Role, text: impl Into<String>) -> Vec<Message> {
    let mut next = Vec::with_capacity(content.len() + 1);
    next.extend_from_slice(content);
    next.push(Message::new(role, text));
    next
}

/// Keeps `content[..index]`. `index == content.len()` is allowed and copies everything.
pub fn truncate_to(content: &[Message], index: usize) -> ChatResult<Vec<Message>> {
    if index > content.len() {
        return Err(ChatError::IndexOutOfRange {
            index,
            len: content.len(),
        });
    }
    Ok(content[..index].to_vec())
}

/// Maps chat messages to API role tags, dropping messages with no text.
pub fn build_api_transcript(content: &[Message]) -> Vec<TranscriptEntry> {
    content
        .iter()
        .filter(|m| !m.txt.is_empty())
        .map(|m| TranscriptEntry {
            role: ApiRole::from(m.role),
            text: m.txt.clone(),
        })
        .collect()
}

/// Removes a middle segment so that at most `max_length` entries remain,
/// keeping the first `max(seed_count, 1)` entries and the final entry.
/// `max_length == 0` disables the cap.
pub fn apply_history_cap(
    mut transcript: Vec<TranscriptEntry>,
    max_length: usize,
    seed_count: usize,
) -> Vec<TranscriptEntry> {
    if max_length == 0 || transcript.len() <= max_length {
        return transcript;
    }

    let excess = transcript.len() - max_length;
    let start = seed_count.max(1);
    let last = transcript.len() - 1;
    if start >= last {
        return transcript;
    }

    let remove = excess.min(last - start);
    log::debug!(
        "Capping transcript: removing {} entries starting at {} ({} -> {})",
        remove,
        start,
        transcript.len(),
        transcript.len() - remove
    );
    transcript.drain(start..start + remove);
    transcript
}

/// Length of the chat's hidden prefix: the introduction pair and anything
/// before it, or else the configured seed messages.
pub fn seed_prefix_len(content: &[Message], predefined_seeds: &[SeedMessage]) -> usize {
    let window = compute_visible_window(content);
    if window.start > 0 {
        return window.start;
    }
    predefined_seeds
        .iter()
        .filter(|seed| !seed.message.is_empty())
        .count()
        .min(content.len())
}
