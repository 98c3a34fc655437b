use crate::api::GenerationApi;
use crate::error::ChatError;
use crate::storage::ChatStore;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use uuid::Uuid;

/// What a chat session is doing right now. Indices are relative to the visible window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Sending,
    Editing(usize),
    Regenerating(usize),
    Deleting,
    Error(String),
}

// Core application state shared by every workflow
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ChatStore>,
    pub api_provider: Arc<dyn GenerationApi>,
    in_flight: Arc<DashMap<Uuid, SessionState>>,
    last_errors: Arc<DashMap<Uuid, String>>,
}

impl AppState {
    pub fn new(store: Arc<dyn ChatStore>, api_provider: Arc<dyn GenerationApi>) -> Self {
        Self {
            store,
            api_provider,
            in_flight: Arc::new(DashMap::new()),
            last_errors: Arc::new(DashMap::new()),
        }
    }

    /// Marks `chat_id` busy with `activity`. Fails with `Busy` if another operation holds it.
    pub fn begin(&self, chat_id: Uuid, activity: SessionState) -> Result<InFlightGuard, ChatError> {
        match self.in_flight.entry(chat_id) {
            Entry::Occupied(current) => {
                log::warn!(
                    "Rejecting operation on chat {}: already {:?}",
                    chat_id,
                    current.get()
                );
                Err(ChatError::Busy)
            }
            Entry::Vacant(slot) => {
                slot.insert(activity);
                self.last_errors.remove(&chat_id);
                Ok(InFlightGuard {
                    chat_id,
                    in_flight: self.in_flight.clone(),
                })
            }
        }
    }

    pub fn session_state(&self, chat_id: Uuid) -> SessionState {
        if let Some(activity) = self.in_flight.get(&chat_id) {
            return activity.clone();
        }
        match self.last_errors.get(&chat_id) {
            Some(message) => SessionState::Error(message.clone()),
            None => SessionState::Idle,
        }
    }

    pub fn is_generating(&self, chat_id: Uuid) -> bool {
        self.in_flight.contains_key(&chat_id)
    }

    pub fn record_error(&self, chat_id: Uuid, error: &ChatError) {
        self.last_errors.insert(chat_id, error.to_string());
    }

    pub fn last_error(&self, chat_id: Uuid) -> Option<String> {
        self.last_errors.get(&chat_id).map(|e| e.clone())
    }

    pub fn clear_error(&self, chat_id: Uuid) {
        self.last_errors.remove(&chat_id);
    }
}

/// Releases the chat's in-flight slot when dropped.
pub struct InFlightGuard {
    chat_id: Uuid,
    in_flight: Arc<DashMap<Uuid, SessionState>>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.remove(&self.chat_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::tests::ScriptedApi;
    use crate::storage::StorageManager;

    #[tokio::test]
    async fn second_operation_on_same_chat_is_rejected() {
        let store = StorageManager::in_memory().await.unwrap();
        let state = AppState::new(Arc::new(store), Arc::new(ScriptedApi::default()));
        let chat_id = Uuid::new_v4();

        let guard = state.begin(chat_id, SessionState::Sending).unwrap();
        assert!(matches!(
            state.begin(chat_id, SessionState::Regenerating(1)),
            Err(ChatError::Busy)
        ));
        assert!(state.begin(Uuid::new_v4(), SessionState::Sending).is_ok());
        assert_eq!(state.session_state(chat_id), SessionState::Sending);

        drop(guard);
        assert_eq!(state.session_state(chat_id), SessionState::Idle);
        assert!(state.begin(chat_id, SessionState::Editing(0)).is_ok());
    }

    #[tokio::test]
    async fn recorded_error_is_reported_until_next_operation() {
        let store = StorageManager::in_memory().await.unwrap();
        let state = AppState::new(Arc::new(store), Arc::new(ScriptedApi::default()));
        let chat_id = Uuid::new_v4();

        state.record_error(chat_id, &ChatError::MissingCredential);
        assert!(matches!(state.session_state(chat_id), SessionState::Error(_)));

        let _guard = state.begin(chat_id, SessionState::Sending).unwrap();
        assert!(state.last_error(chat_id).is_none());
    }
}
