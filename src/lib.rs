// Declare the modules
pub mod api;
pub mod commands;
pub mod config;
pub mod error;
pub mod history;
pub mod models;
pub mod state;
pub mod storage;
pub mod transfer;

use crate::api::{GeminiProvider, GenerationApi};
use crate::commands::RegenerateOutcome;
use crate::models::{CharacterDraft, ChatView};
use crate::state::AppState;
use crate::storage::{ChatStore, StorageManager};
use anyhow::Context;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use uuid::Uuid;

const DB_ENV_VAR: &str = "ROLECHAT_DB";

const HELP: &str = "\
Commands:
  /chars                                  list characters
  /char add <name> | <description> | <prompt>
  /char del <name>                        delete a character and its chats
  /chat <name>                            open the chat for a character
  /new [title]                            start a chat without a character
  /chats                                  list chats
  /open <n>                               open chat number n from /chats
  /show                                   print the current chat
  /edit <i> <text>                        replace message i and regenerate
  /regen <i>                              regenerate message i
  /export <path> | /import <path>
  /key <api key> | /logout
  /quit
Anything else is sent to the current chat.";

fn database_path() -> anyhow::Result<PathBuf> {
    if let Ok(path) = std::env::var(DB_ENV_VAR) {
        return Ok(PathBuf::from(path));
    }
    let base = dirs::data_local_dir().context("Could not determine a local data directory")?;
    Ok(base.join("rolechat").join("rolechat.sqlite"))
}

pub fn run() -> anyhow::Result<()> {
    // Initialize logging
    let _ = env_logger::try_init();

    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    runtime.block_on(start())
}

async fn start() -> anyhow::Result<()> {
    let db_path = database_path()?;
    let storage_manager = StorageManager::open(&db_path).await?;

    let store: Arc<dyn ChatStore> = Arc::new(storage_manager);
    let api_provider: Arc<dyn GenerationApi> = Arc::new(GeminiProvider::new());
    let app_state = AppState::new(store, api_provider);

    repl(&app_state).await
}

fn print_view(view: &ChatView) {
    println!("== {} ==", view.title);
    for (i, message) in view.messages.iter().enumerate() {
        println!("[{}] {:>3}: {}", i, message.role.as_str(), message.txt);
    }
    if let Some(error) = &view.last_error {
        println!("! {}", error);
    }
}

async fn repl(state: &AppState) -> anyhow::Result<()> {
    println!("{}", HELP);
    let mut current: Option<Uuid> = None;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            break;
        }
        if let Err(e) = handle_line(state, &mut current, line).await {
            println!("! {}", e);
        }
    }
    Ok(())
}

async fn handle_line(
    state: &AppState,
    current: &mut Option<Uuid>,
    line: &str,
) -> anyhow::Result<()> {
    let (command, rest) = match line.split_once(' ') {
        Some((c, r)) => (c, r.trim()),
        None => (line, ""),
    };

    match command {
        "/help" => println!("{}", HELP),
        "/chars" => {
            for character in commands::list_characters(state).await? {
                println!("- {}: {}", character.name, character.description);
            }
        }
        "/char" => {
            let (action, args) = rest.split_once(' ').unwrap_or((rest, ""));
            match action {
                "add" => {
                    let mut parts = args.splitn(3, '|').map(str::trim);
                    let draft = CharacterDraft {
                        name: parts.next().unwrap_or_default().to_string(),
                        description: parts.next().unwrap_or_default().to_string(),
                        prompt: parts.next().unwrap_or_default().to_string(),
                    };
                    let character = commands::add_character(state, draft).await?;
                    println!("Added {}", character.name);
                }
                "del" => {
                    let id = find_character(state, args.trim()).await?;
                    commands::delete_character(state, id).await?;
                    if let Some(chat_id) = *current {
                        if state.store.get_chat(chat_id).await?.is_none() {
                            *current = None;
                        }
                    }
                    println!("Deleted {}", args.trim());
                }
                _ => println!("Usage: /char add|del ..."),
            }
        }
        "/chat" => {
            let id = find_character(state, rest).await?;
            let chat = commands::open_character_chat(state, id).await?;
            *current = Some(chat.id);
            print_view(&commands::get_chat_view(state, chat.id).await?);
        }
        "/new" => {
            let chat = commands::create_chat(state, rest, None).await?;
            *current = Some(chat.id);
            println!("Started '{}'", chat.title);
        }
        "/chats" => {
            for (i, chat) in commands::list_chats(state).await?.iter().enumerate() {
                println!("{}. {} ({} messages)", i, chat.title, chat.content.len());
            }
        }
        "/open" => {
            let n: usize = rest.parse().context("Usage: /open <n>")?;
            let chats = commands::list_chats(state).await?;
            let chat = chats.get(n).context("No chat with that number")?;
            *current = Some(chat.id);
            print_view(&commands::get_chat_view(state, chat.id).await?);
        }
        "/show" => {
            let chat_id = require_chat(current)?;
            print_view(&commands::get_chat_view(state, chat_id).await?);
        }
        "/edit" => {
            let chat_id = require_chat(current)?;
            let (index, text) = rest.split_once(' ').context("Usage: /edit <i> <text>")?;
            let index: usize = index.parse().context("Message index must be a number")?;
            print_view(&commands::edit_message(state, chat_id, index, text).await?);
        }
        "/regen" => {
            let chat_id = require_chat(current)?;
            let index: usize = rest.parse().context("Usage: /regen <i>")?;
            match commands::regenerate_response(state, chat_id, index).await? {
                RegenerateOutcome::Regenerated(view) => print_view(&view),
                RegenerateOutcome::NoOp => println!("Nothing to regenerate there."),
            }
        }
        "/export" => {
            let chat_id = require_chat(current)?;
            commands::export_chat(state, chat_id, Path::new(rest)).await?;
            println!("Exported to {}", rest);
        }
        "/import" => {
            let chat = commands::import_chat_file(state, Path::new(rest)).await?;
            *current = Some(chat.id);
            println!("Imported '{}'", chat.title);
        }
        "/key" => {
            commands::set_api_key(state, rest).await?;
            println!("API key saved.");
        }
        "/logout" => {
            commands::clear_api_key(state).await?;
            println!("API key removed.");
        }
        _ if command.starts_with('/') => println!("Unknown command. Try /help"),
        _ => {
            let chat_id = require_chat(current)?;
            print_view(&commands::send_message(state, chat_id, line).await?);
        }
    }
    Ok(())
}

fn require_chat(current: &Option<Uuid>) -> anyhow::Result<Uuid> {
    (*current).context("Open a chat first (/chat <name> or /new)")
}

async fn find_character(state: &AppState, name: &str) -> anyhow::Result<Uuid> {
    commands::list_characters(state)
        .await?
        .into_iter()
        .find(|c| c.name.eq_ignore_ascii_case(name))
        .map(|c| c.id)
        .with_context(|| format!("No character named '{}'", name))
}
