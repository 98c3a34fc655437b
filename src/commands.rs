// Conversation workflows and record commands used by the front end.

use crate::api;
use crate::config::{self, AppSettings};
use crate::error::{ChatError, ChatResult};
use crate::history;
use crate::models::{Character, CharacterDraft, Chat, ChatView, Message, Role};
use crate::state::{AppState, SessionState};
use crate::storage::ChatStore;
use crate::transfer;
use std::collections::HashMap;
use std::path::Path;
use uuid::Uuid;

/// Result of a regenerate request.
#[derive(Debug, Clone)]
pub enum RegenerateOutcome {
    Regenerated(ChatView),
    /// The message before the regenerated one was not a user message; nothing changed.
    NoOp,
}

// --- Settings ---

pub async fn load_settings(store: &dyn ChatStore) -> ChatResult<AppSettings> {
    let keys = [
        config::KEY_AI_MODEL,
        config::KEY_MAX_OUTPUT_TOKENS,
        config::KEY_TEMPERATURE,
        config::KEY_SAFETY_SETTINGS,
        config::KEY_MAX_CHAT_LENGTH,
        config::KEY_INITIAL_MESSAGES,
        config::KEY_API_KEY_REF,
    ];
    let mut stored = HashMap::new();
    for key in keys {
        if let Some(value) = store.get_setting(key).await.map_err(ChatError::store)? {
            stored.insert(key, value);
        }
    }
    Ok(AppSettings::from_stored(|key| stored.get(key).cloned()))
}

pub async fn save_settings(state: &AppState, settings: &AppSettings) -> ChatResult<()> {
    log::info!("Saving application settings");
    for (key, value) in settings.to_stored().map_err(ChatError::store)? {
        state
            .store
            .put_setting(key, &value)
            .await
            .map_err(ChatError::store)?;
    }
    Ok(())
}

/// Stores the key in the OS keyring and points the settings at it.
pub async fn set_api_key(state: &AppState, api_key: &str) -> ChatResult<()> {
    if api_key.trim().is_empty() {
        return Err(ChatError::MissingCredential);
    }
    config::set_api_key_in_keyring(api_key).map_err(ChatError::store)?;
    let mut settings = load_settings(state.store.as_ref()).await?;
    settings.api_key_ref = Some("keyring".to_string());
    save_settings(state, &settings).await
}

pub async fn clear_api_key(state: &AppState) -> ChatResult<()> {
    config::remove_api_key_from_keyring().map_err(ChatError::store)?;
    let mut settings = load_settings(state.store.as_ref()).await?;
    settings.api_key_ref = None;
    save_settings(state, &settings).await
}

// --- Characters ---

fn validated(draft: CharacterDraft) -> ChatResult<CharacterDraft> {
    let name = draft.name.trim();
    let prompt = draft.prompt.trim();
    if name.is_empty() || prompt.is_empty() {
        return Err(ChatError::InvalidCharacter(
            "Character name and prompt are required.".to_string(),
        ));
    }
    Ok(CharacterDraft {
        name: name.to_string(),
        description: draft.description.trim().to_string(),
        prompt: prompt.to_string(),
    })
}

pub async fn list_characters(state: &AppState) -> ChatResult<Vec<Character>> {
    state.store.list_characters().await.map_err(ChatError::store)
}

pub async fn get_character(state: &AppState, character_id: Uuid) -> ChatResult<Character> {
    state
        .store
        .get_character(character_id)
        .await
        .map_err(ChatError::store)?
        .ok_or(ChatError::CharacterNotFound(character_id))
}

pub async fn add_character(state: &AppState, draft: CharacterDraft) -> ChatResult<Character> {
    let draft = validated(draft)?;
    let character = Character {
        id: Uuid::new_v4(),
        name: draft.name,
        description: draft.description,
        prompt: draft.prompt,
    };
    state
        .store
        .add_character(&character)
        .await
        .map_err(ChatError::store)?;
    Ok(character)
}

pub async fn update_character(
    state: &AppState,
    character_id: Uuid,
    draft: CharacterDraft,
) -> ChatResult<Character> {
    let draft = validated(draft)?;
    let mut character = get_character(state, character_id).await?;
    character.name = draft.name;
    character.description = draft.description;
    character.prompt = draft.prompt;
    state
        .store
        .put_character(&character)
        .await
        .map_err(ChatError::store)?;
    Ok(character)
}

/// Deletes a character together with every chat linked to it. Nothing is deleted
/// if any of those chats has an operation in flight.
pub async fn delete_character(state: &AppState, character_id: Uuid) -> ChatResult<()> {
    log::warn!("Deleting character {} and its chats", character_id);
    let chats = state
        .store
        .chats_by_character(character_id)
        .await
        .map_err(ChatError::store)?;
    let _guards = chats
        .iter()
        .map(|chat| state.begin(chat.id, SessionState::Deleting))
        .collect::<Result<Vec<_>, _>>()?;

    for chat in &chats {
        state.store.delete_chat(chat.id).await.map_err(ChatError::store)?;
        state.clear_error(chat.id);
    }
    state
        .store
        .delete_character(character_id)
        .await
        .map_err(ChatError::store)
}

// --- Chats ---

pub async fn list_chats(state: &AppState) -> ChatResult<Vec<Chat>> {
    state.store.list_chats().await.map_err(ChatError::store)
}

pub async fn create_chat(
    state: &AppState,
    title: &str,
    character_id: Option<Uuid>,
) -> ChatResult<Chat> {
    let title = match title.trim() {
        "" => "New Chat",
        t => t,
    };
    let chat = Chat::new(title, character_id);
    state.store.add_chat(&chat).await.map_err(ChatError::store)?;
    Ok(chat)
}

/// Returns the first chat linked to the character, creating one if none exists.
pub async fn open_character_chat(state: &AppState, character_id: Uuid) -> ChatResult<Chat> {
    let character = get_character(state, character_id).await?;
    let existing = state
        .store
        .chats_by_character(character_id)
        .await
        .map_err(ChatError::store)?;
    match existing.into_iter().next() {
        Some(chat) => Ok(chat),
        None => create_chat(state, &character.name, Some(character_id)).await,
    }
}

pub async fn delete_chat(state: &AppState, chat_id: Uuid) -> ChatResult<()> {
    let _guard = state.begin(chat_id, SessionState::Deleting)?;
    state.store.delete_chat(chat_id).await.map_err(ChatError::store)?;
    state.clear_error(chat_id);
    Ok(())
}

/// Replaces a chat's messages wholesale.
pub async fn update_messages(
    state: &AppState,
    chat_id: Uuid,
    messages: Vec<Message>,
) -> ChatResult<ChatView> {
    if state.is_generating(chat_id) {
        return Err(ChatError::Busy);
    }
    let mut chat = load_chat(state, chat_id).await?;
    chat.content = messages;
    persist(state, &chat).await?;
    Ok(chat_view(state, &chat))
}

pub async fn get_chat_view(state: &AppState, chat_id: Uuid) -> ChatResult<ChatView> {
    let chat = load_chat(state, chat_id).await?;
    Ok(chat_view(state, &chat))
}

pub async fn export_chat(state: &AppState, chat_id: Uuid, path: &Path) -> ChatResult<()> {
    let chat = load_chat(state, chat_id).await?;
    let json = transfer::export_chat(&chat).map_err(ChatError::store)?;
    tokio::fs::write(path, json)
        .await
        .map_err(|e| ChatError::Store(format!("Failed to write {}: {}", path.display(), e)))?;
    log::info!("Exported chat {} to {}", chat_id, path.display());
    Ok(())
}

pub async fn import_chat(state: &AppState, raw: &str) -> ChatResult<Chat> {
    let chat = transfer::parse_import(raw)?;
    state.store.add_chat(&chat).await.map_err(ChatError::store)?;
    log::info!("Imported chat '{}' as {}", chat.title, chat.id);
    Ok(chat)
}

pub async fn import_chat_file(state: &AppState, path: &Path) -> ChatResult<Chat> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| {
            ChatError::InvalidImportFormat(format!("cannot read {}: {}", path.display(), e))
        })?;
    import_chat(state, &raw).await
}

// --- Conversation workflows ---

/// Appends a user message (seeding an empty chat first), persists, then asks the model.
pub async fn send_message(state: &AppState, chat_id: Uuid, text: &str) -> ChatResult<ChatView> {
    log::info!("Send requested for chat {}", chat_id);
    let result = run_send(state, chat_id, text).await;
    finish(state, chat_id, result).map(|chat| chat_view(state, &chat))
}

/// Replaces the visible message at `index` (and everything after it) with `new_text`.
pub async fn edit_message(
    state: &AppState,
    chat_id: Uuid,
    index: usize,
    new_text: &str,
) -> ChatResult<ChatView> {
    log::info!("Edit requested for chat {} at visible index {}", chat_id, index);
    let result = run_edit(state, chat_id, index, new_text).await;
    finish(state, chat_id, result).map(|chat| chat_view(state, &chat))
}

/// Drops the visible message at `index` and everything after it, then asks for a new reply
/// to the user message left at the end.
pub async fn regenerate_response(
    state: &AppState,
    chat_id: Uuid,
    index: usize,
) -> ChatResult<RegenerateOutcome> {
    log::info!("Regenerate requested for chat {} at visible index {}", chat_id, index);
    let result = run_regenerate(state, chat_id, index).await;
    match finish(state, chat_id, result)? {
        Some(chat) => Ok(RegenerateOutcome::Regenerated(chat_view(state, &chat))),
        None => Ok(RegenerateOutcome::NoOp),
    }
}

async fn run_send(state: &AppState, chat_id: Uuid, text: &str) -> ChatResult<Chat> {
    if text.trim().is_empty() {
        return Err(ChatError::EmptyMessage);
    }
    let _guard = state.begin(chat_id, SessionState::Sending)?;
    let settings = load_settings(state.store.as_ref()).await?;
    let chat = load_chat(state, chat_id).await?;

    let chat = push_user_message(state, chat, &settings, text).await?;
    complete_turn(state, chat, &settings, text).await
}

async fn run_edit(
    state: &AppState,
    chat_id: Uuid,
    index: usize,
    new_text: &str,
) -> ChatResult<Chat> {
    if new_text.trim().is_empty() {
        return Err(ChatError::EmptyMessage);
    }
    let _guard = state.begin(chat_id, SessionState::Editing(index))?;
    let settings = load_settings(state.store.as_ref()).await?;
    let mut chat = load_chat(state, chat_id).await?;

    let absolute = history::compute_visible_window(&chat.content).start + index;
    chat.content = history::truncate_to(&chat.content, absolute)?;

    let chat = push_user_message(state, chat, &settings, new_text).await?;
    complete_turn(state, chat, &settings, new_text).await
}

// Ok(None) when the truncated content does not end with a user message.
async fn run_regenerate(
    state: &AppState,
    chat_id: Uuid,
    index: usize,
) -> ChatResult<Option<Chat>> {
    let _guard = state.begin(chat_id, SessionState::Regenerating(index))?;
    let settings = load_settings(state.store.as_ref()).await?;
    let mut chat = load_chat(state, chat_id).await?;

    let absolute = history::compute_visible_window(&chat.content).start + index;
    let truncated = history::truncate_to(&chat.content, absolute)?;
    let prompt = match truncated.last() {
        Some(last) if last.role == Role::User => last.txt.clone(),
        _ => {
            log::warn!("Cannot regenerate chat {} without a preceding user message", chat_id);
            return Ok(None);
        }
    };

    chat.content = truncated;
    persist(state, &chat).await?;
    complete_turn(state, chat, &settings, &prompt).await.map(Some)
}

// --- Helpers ---

async fn load_chat(state: &AppState, chat_id: Uuid) -> ChatResult<Chat> {
    state
        .store
        .get_chat(chat_id)
        .await
        .map_err(ChatError::store)?
        .ok_or(ChatError::ChatNotFound(chat_id))
}

// Workflow writes never re-create a chat deleted while the operation ran.
async fn persist(state: &AppState, chat: &Chat) -> ChatResult<()> {
    let updated = state.store.update_chat(chat).await.map_err(ChatError::store)?;
    if !updated {
        return Err(ChatError::ChatNotFound(chat.id));
    }
    Ok(())
}

async fn push_user_message(
    state: &AppState,
    mut chat: Chat,
    settings: &AppSettings,
    text: &str,
) -> ChatResult<Chat> {
    let character = match chat.character_id {
        Some(character_id) => state
            .store
            .get_character(character_id)
            .await
            .map_err(ChatError::store)?,
        None => None,
    };

    let seeded = history::seed_if_empty(&chat, &settings.initial_messages, character.as_ref());
    chat.content = history::append_message(&seeded, Role::User, text);
    persist(state, &chat).await?;
    log::info!("User message saved to chat {} ({} messages)", chat.id, chat.content.len());
    Ok(chat)
}

async fn complete_turn(
    state: &AppState,
    mut chat: Chat,
    settings: &AppSettings,
    prompt: &str,
) -> ChatResult<Chat> {
    let transcript = history::build_api_transcript(&chat.content);
    let seed_count = history::seed_prefix_len(&chat.content, &settings.initial_messages);
    let api_key = config::resolve_credential(settings.api_key_ref.as_deref());

    let reply = api::generate_reply(
        state.api_provider.as_ref(),
        api_key.as_deref(),
        &settings.generation_config(),
        transcript,
        prompt,
        seed_count,
    )
    .await?;

    if reply.is_empty() {
        return Err(ChatError::GenerationFailed(
            "the model returned an empty reply".to_string(),
        ));
    }

    chat.content = history::append_message(&chat.content, Role::Ai, reply);
    persist(state, &chat).await?;
    log::info!("Reply saved to chat {}", chat.id);
    Ok(chat)
}

fn chat_view(state: &AppState, chat: &Chat) -> ChatView {
    let window = history::compute_visible_window(&chat.content);
    ChatView {
        chat_id: chat.id,
        title: chat.title.clone(),
        window_start: window.start,
        messages: window.messages.to_vec(),
        generating: state.is_generating(chat.id),
        last_error: state.last_error(chat.id),
    }
}

// Error boundary for the workflows: failures are logged and kept as the chat's last error.
fn finish<T>(state: &AppState, chat_id: Uuid, result: ChatResult<T>) -> ChatResult<T> {
    if let Err(e) = &result {
        log::error!("Operation on chat {} failed: {}", chat_id, e);
        if !matches!(e, ChatError::Busy) {
            state.record_error(chat_id, e);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::tests::ScriptedApi;
    use crate::api::{DeltaStream, GenerationApi};
    use crate::config::GenerationConfig;
    use crate::history::INTRO_PREFIX;
    use crate::models::{ApiRole, SeedMessage, TranscriptEntry};
    use crate::storage::StorageManager;
    use std::sync::Arc;

    const TEST_KEY_VAR: &str = "ROLECHAT_COMMANDS_TEST_KEY";

    async fn setup(api: ScriptedApi) -> (AppState, Arc<ScriptedApi>) {
        std::env::set_var(TEST_KEY_VAR, "test-key");
        let store = StorageManager::in_memory().await.unwrap();
        let api = Arc::new(api);
        let state = AppState::new(Arc::new(store), api.clone());
        let settings = AppSettings {
            api_key_ref: Some(format!("env:{}", TEST_KEY_VAR)),
            ..Default::default()
        };
        save_settings(&state, &settings).await.unwrap();
        (state, api)
    }

    async fn aria_chat(state: &AppState) -> Chat {
        let character = add_character(
            state,
            CharacterDraft {
                name: "Aria".to_string(),
                description: "a pirate".to_string(),
                prompt: "Arr!".to_string(),
            },
        )
        .await
        .unwrap();
        open_character_chat(state, character.id).await.unwrap()
    }

    async fn stored_content(state: &AppState, chat_id: Uuid) -> Vec<Message> {
        state.store.get_chat(chat_id).await.unwrap().unwrap().content
    }

    #[tokio::test]
    async fn first_send_seeds_character_intro() {
        let (state, api) = setup(ScriptedApi::replying(&["Ahoy!"])).await;
        let chat = aria_chat(&state).await;

        let view = send_message(&state, chat.id, "Hello").await.unwrap();

        let content = stored_content(&state, chat.id).await;
        assert_eq!(content.len(), 4);
        assert!(content[0].txt.starts_with(INTRO_PREFIX));
        assert_eq!(content[1], Message::ai("Understood, I'll play as Aria from now on."));
        assert_eq!(content[2], Message::user("Hello"));
        assert_eq!(content[3], Message::ai("Ahoy!"));

        assert_eq!(view.window_start, 2);
        assert_eq!(view.messages, vec![Message::user("Hello"), Message::ai("Ahoy!")]);
        assert!(!view.generating);

        let calls = api.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0.len(), 2, "session history holds only the intro pair");
        assert_eq!(calls[0].1, "Hello");
    }

    #[tokio::test]
    async fn history_cap_keeps_character_intro() {
        let (state, api) = setup(ScriptedApi::replying(&["Ahoy!", "Aye."])).await;
        let mut settings = load_settings(state.store.as_ref()).await.unwrap();
        settings.max_chat_length = 3;
        save_settings(&state, &settings).await.unwrap();
        let chat = aria_chat(&state).await;

        send_message(&state, chat.id, "Hello").await.unwrap();
        send_message(&state, chat.id, "Again").await.unwrap();

        let calls = api.calls.lock().unwrap();
        let (history, prompt) = &calls[1];
        assert_eq!(prompt, "Again");
        assert_eq!(history.len(), 2, "older turns are dropped, the intro pair is not");
        assert_eq!(history[0].role, ApiRole::User);
        assert!(history[0].text.starts_with(INTRO_PREFIX));
        assert_eq!(history[1].role, ApiRole::Model);
        assert_eq!(history[1].text, "Understood, I'll play as Aria from now on.");

        // The stored chat keeps everything; only the request is capped.
        drop(calls);
        assert_eq!(stored_content(&state, chat.id).await.len(), 6);
    }

    #[tokio::test]
    async fn predefined_seeds_precede_intro_on_first_send_only() {
        let (state, _api) = setup(ScriptedApi::replying(&["one", "two"])).await;
        let mut settings = load_settings(state.store.as_ref()).await.unwrap();
        settings.initial_messages = vec![
            SeedMessage {
                role: Role::User,
                message: "Keep replies short.".to_string(),
            },
            SeedMessage {
                role: Role::Ai,
                message: String::new(),
            },
        ];
        save_settings(&state, &settings).await.unwrap();
        let chat = aria_chat(&state).await;

        send_message(&state, chat.id, "Hello").await.unwrap();
        let view = send_message(&state, chat.id, "Again").await.unwrap();

        let content = stored_content(&state, chat.id).await;
        assert_eq!(content[0], Message::user("Keep replies short."));
        assert!(content[1].txt.starts_with(INTRO_PREFIX));
        assert_eq!(content.len(), 7);
        assert_eq!(view.window_start, 3);
        assert_eq!(view.messages.len(), 4);
    }

    #[tokio::test]
    async fn chat_without_character_skips_intro() {
        let (state, _api) = setup(ScriptedApi::replying(&["Hi"])).await;
        let chat = create_chat(&state, "Plain", None).await.unwrap();

        let view = send_message(&state, chat.id, "Hello").await.unwrap();
        assert_eq!(view.window_start, 0);
        assert_eq!(view.messages, vec![Message::user("Hello"), Message::ai("Hi")]);
    }

    #[tokio::test]
    async fn edit_truncates_from_visible_index() {
        let (state, api) = setup(ScriptedApi::replying(&["Ahoy!", "Well met!"])).await;
        let chat = aria_chat(&state).await;
        send_message(&state, chat.id, "Hello").await.unwrap();

        let view = edit_message(&state, chat.id, 0, "Hi there").await.unwrap();

        assert_eq!(view.messages, vec![Message::user("Hi there"), Message::ai("Well met!")]);
        let content = stored_content(&state, chat.id).await;
        assert_eq!(content.len(), 4);
        assert!(content[0].txt.starts_with(INTRO_PREFIX));
        assert_eq!(api.calls.lock().unwrap()[1].1, "Hi there");
    }

    #[tokio::test]
    async fn regenerate_replaces_ai_reply() {
        let (state, api) = setup(ScriptedApi::replying(&["Ahoy!", "Yo ho!"])).await;
        let chat = aria_chat(&state).await;
        send_message(&state, chat.id, "Hello").await.unwrap();

        let outcome = regenerate_response(&state, chat.id, 1).await.unwrap();

        match outcome {
            RegenerateOutcome::Regenerated(view) => {
                assert_eq!(view.messages, vec![Message::user("Hello"), Message::ai("Yo ho!")]);
            }
            RegenerateOutcome::NoOp => panic!("expected a regenerated reply"),
        }
        assert_eq!(api.calls.lock().unwrap()[1].1, "Hello");
    }

    #[tokio::test]
    async fn regenerate_without_preceding_user_message_is_noop() {
        let (state, api) = setup(ScriptedApi::replying(&["Ahoy!"])).await;
        let chat = aria_chat(&state).await;
        send_message(&state, chat.id, "Hello").await.unwrap();
        let before = stored_content(&state, chat.id).await;

        // Visible index 0 is the user message; the message before it is the intro acknowledgment.
        let outcome = regenerate_response(&state, chat.id, 0).await.unwrap();

        assert!(matches!(outcome, RegenerateOutcome::NoOp));
        assert_eq!(stored_content(&state, chat.id).await, before);
        assert_eq!(api.call_count(), 1);
    }

    #[tokio::test]
    async fn failed_generation_keeps_user_message_and_records_error() {
        let (state, _api) = setup(ScriptedApi::failing("upstream unavailable")).await;
        let chat = aria_chat(&state).await;

        let result = send_message(&state, chat.id, "Hello").await;
        assert!(matches!(result, Err(ChatError::GenerationFailed(_))));

        let content = stored_content(&state, chat.id).await;
        assert_eq!(content.last(), Some(&Message::user("Hello")));

        let view = get_chat_view(&state, chat.id).await.unwrap();
        assert_eq!(view.messages, vec![Message::user("Hello")]);
        assert!(view.last_error.unwrap().contains("upstream unavailable"));
        assert!(matches!(state.session_state(chat.id), SessionState::Error(_)));
    }

    #[tokio::test]
    async fn missing_credential_surfaces_after_user_message_is_saved() {
        let (state, api) = setup(ScriptedApi::default()).await;
        let mut settings = load_settings(state.store.as_ref()).await.unwrap();
        settings.api_key_ref = Some("env:ROLECHAT_COMMANDS_TEST_KEY_UNSET".to_string());
        save_settings(&state, &settings).await.unwrap();
        let chat = create_chat(&state, "Plain", None).await.unwrap();

        let result = send_message(&state, chat.id, "Hello").await;

        assert!(matches!(result, Err(ChatError::MissingCredential)));
        assert_eq!(stored_content(&state, chat.id).await, vec![Message::user("Hello")]);
        assert_eq!(api.call_count(), 0);
    }

    #[tokio::test]
    async fn busy_chat_rejects_new_operations() {
        let (state, api) = setup(ScriptedApi::default()).await;
        let chat = create_chat(&state, "Plain", None).await.unwrap();

        let _guard = state.begin(chat.id, SessionState::Sending).unwrap();
        assert!(matches!(send_message(&state, chat.id, "Hi").await, Err(ChatError::Busy)));
        assert!(matches!(regenerate_response(&state, chat.id, 0).await, Err(ChatError::Busy)));
        assert!(stored_content(&state, chat.id).await.is_empty());
        assert_eq!(api.call_count(), 0);
    }

    #[tokio::test]
    async fn out_of_range_edit_is_rejected() {
        let (state, _api) = setup(ScriptedApi::replying(&["Ahoy!"])).await;
        let chat = aria_chat(&state).await;
        send_message(&state, chat.id, "Hello").await.unwrap();

        let result = edit_message(&state, chat.id, 5, "nope").await;
        assert!(matches!(result, Err(ChatError::IndexOutOfRange { index: 7, len: 4 })));
    }

    #[tokio::test]
    async fn empty_text_is_rejected() {
        let (state, _api) = setup(ScriptedApi::default()).await;
        let chat = create_chat(&state, "Plain", None).await.unwrap();
        assert!(matches!(
            send_message(&state, chat.id, "   ").await,
            Err(ChatError::EmptyMessage)
        ));
    }

    #[tokio::test]
    async fn deleting_character_removes_its_chats() {
        let (state, _api) = setup(ScriptedApi::default()).await;
        let chat = aria_chat(&state).await;
        let other = create_chat(&state, "Plain", None).await.unwrap();
        let character_id = chat.character_id.unwrap();

        delete_character(&state, character_id).await.unwrap();

        assert!(state.store.get_chat(chat.id).await.unwrap().is_none());
        assert!(state.store.get_chat(other.id).await.unwrap().is_some());
        assert!(matches!(
            get_character(&state, character_id).await,
            Err(ChatError::CharacterNotFound(_))
        ));
    }

    #[tokio::test]
    async fn busy_chat_blocks_whole_character_deletion() {
        let (state, _api) = setup(ScriptedApi::default()).await;
        let first = aria_chat(&state).await;
        let character_id = first.character_id.unwrap();
        let mut second = Chat::new("Aria again", Some(character_id));
        second.timestamp = first.timestamp + chrono::Duration::seconds(1);
        state.store.add_chat(&second).await.unwrap();

        let guard = state.begin(second.id, SessionState::Sending).unwrap();
        let result = delete_character(&state, character_id).await;

        assert!(matches!(result, Err(ChatError::Busy)));
        assert!(state.store.get_chat(first.id).await.unwrap().is_some());
        assert!(state.store.get_chat(second.id).await.unwrap().is_some());
        assert!(get_character(&state, character_id).await.is_ok());
        assert!(!state.is_generating(first.id));

        drop(guard);
        delete_character(&state, character_id).await.unwrap();
        assert!(list_chats(&state).await.unwrap().is_empty());
    }

    /// Removes the chat from the store while its reply is being produced.
    struct DeletingApi {
        store: Arc<dyn ChatStore>,
        chat_id: Uuid,
    }

    #[async_trait::async_trait]
    impl GenerationApi for DeletingApi {
        async fn send_chat_stream_request(
            &self,
            _config: &GenerationConfig,
            _api_key: &str,
            _history: &[TranscriptEntry],
            _prompt: &str,
        ) -> anyhow::Result<DeltaStream> {
            self.store.delete_chat(self.chat_id).await?;
            Ok(Box::pin(futures::stream::iter(vec![Ok("late".to_string())])))
        }
    }

    #[tokio::test]
    async fn reply_does_not_resurrect_chat_deleted_mid_send() {
        std::env::set_var(TEST_KEY_VAR, "test-key");
        let store: Arc<dyn ChatStore> = Arc::new(StorageManager::in_memory().await.unwrap());
        let chat = Chat::new("Plain", None);
        store.add_chat(&chat).await.unwrap();
        let api = DeletingApi {
            store: store.clone(),
            chat_id: chat.id,
        };
        let state = AppState::new(store, Arc::new(api));
        let settings = AppSettings {
            api_key_ref: Some(format!("env:{}", TEST_KEY_VAR)),
            ..Default::default()
        };
        save_settings(&state, &settings).await.unwrap();

        let result = send_message(&state, chat.id, "Hello").await;

        assert!(matches!(result, Err(ChatError::ChatNotFound(id)) if id == chat.id));
        assert!(state.store.get_chat(chat.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn open_character_chat_reuses_existing_chat() {
        let (state, _api) = setup(ScriptedApi::default()).await;
        let chat = aria_chat(&state).await;
        let again = open_character_chat(&state, chat.character_id.unwrap()).await.unwrap();
        assert_eq!(again.id, chat.id);
    }

    #[tokio::test]
    async fn character_requires_name_and_prompt() {
        let (state, _api) = setup(ScriptedApi::default()).await;
        let result = add_character(
            &state,
            CharacterDraft {
                name: "Aria".to_string(),
                description: String::new(),
                prompt: " ".to_string(),
            },
        )
        .await;
        assert!(matches!(result, Err(ChatError::InvalidCharacter(_))));
    }

    #[tokio::test]
    async fn imported_chat_gets_new_id() {
        let (state, _api) = setup(ScriptedApi::default()).await;
        let raw = r#"{"title": "Saved", "content": [{"role": "you", "txt": "hi"}],
                     "timestamp": 1700000000000}"#;

        let chat = import_chat(&state, raw).await.unwrap();

        let stored = state.store.get_chat(chat.id).await.unwrap().unwrap();
        assert_eq!(stored.content, vec![Message::user("hi")]);
        assert!(matches!(
            import_chat(&state, r#"{"content": []}"#).await,
            Err(ChatError::InvalidImportFormat(_))
        ));
        assert_eq!(list_chats(&state).await.unwrap().len(), 1);
    }
}
