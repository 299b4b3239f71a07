//! Session pipeline: the state machine behind one open conversation.
//!
//! Orchestrates: load history, subscribe to the store's change stream,
//! accept user input, optimistic placeholder insertion, provider
//! completion, and reconciliation of temporary and authoritative records.
//! The backing store stays the single source of truth throughout: the
//! in-memory sequence is a rendering of it, repaired by identifier-based
//! idempotent merges whenever the two drift.
//!
//! Concurrency shape: one logical thread of control. Pipeline steps are
//! awaited in sequence; only the availability monitor and the change
//! subscription run on their own tasks, and both touch strictly bounded
//! state (a cached flag, the shared message list).

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::capability;
use crate::config::{
    Settings, DEFAULT_CONVERSATION_TITLE, PREF_CHAT_MODE, PROBE_INTERVAL_SECS, TITLE_MAX_CHARS,
};
use crate::content;
use crate::models::{ChatMode, Conversation, Message, MessageRole, NewMessage};
use crate::monitor::{AvailabilityMonitor, SelectedModel};
use crate::providers::{
    ChatTurn, CompletionProvider, LocalClient, ProviderError, ProviderKind, RemoteClient,
};
use crate::store::{ConversationStore, StoreError};

/// Errors surfaced by session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("A message is already being sent — wait for it to finish")]
    Busy,

    #[error("Cannot send an empty message")]
    EmptyMessage,

    #[error("No conversation is open")]
    NoConversation,

    #[error("The local AI provider is not available — make sure it is running to use offline mode")]
    LocalUnavailable,

    #[error("Attached image is too large ({0} bytes)")]
    ImageTooLarge(usize),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Persistence error: {0}")]
    Store(#[from] StoreError),
}

/// Where the pipeline currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Loading,
    Ready,
    Sending(SendPhase),
    Resetting,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendPhase {
    /// User input accepted, optimistic placeholder up, persist in flight.
    PersistingUser,
    /// User turn persisted, completion call in flight.
    AwaitingCompletion,
}

/// One entry of the rendered message sequence.
///
/// `key` is a client-generated identity, stable from optimistic insertion
/// through replacement by the authoritative record: placeholder
/// replacement is a keyed lookup, never reference equality or content
/// comparison. `id` is set once the store has assigned one.
#[derive(Debug, Clone)]
pub struct SessionMessage {
    pub key: Uuid,
    pub id: Option<Uuid>,
    pub role: MessageRole,
    pub content: String,
    pub model: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Not yet confirmed by the store.
    pub pending: bool,
    /// Transient assistant "thinking" marker: never persisted.
    pub thinking: bool,
}

impl SessionMessage {
    fn from_record(record: Message) -> Self {
        Self {
            key: Uuid::new_v4(),
            id: Some(record.id),
            role: record.role,
            content: record.content,
            model: record.model,
            created_at: record.created_at,
            pending: false,
            thinking: false,
        }
    }

    fn pending_user(key: Uuid, content: String) -> Self {
        Self {
            key,
            id: None,
            role: MessageRole::User,
            content,
            model: None,
            created_at: Utc::now(),
            pending: true,
            thinking: false,
        }
    }

    fn thinking_marker(key: Uuid) -> Self {
        Self {
            key,
            id: None,
            role: MessageRole::Assistant,
            content: String::new(),
            model: None,
            created_at: Utc::now(),
            pending: true,
            thinking: true,
        }
    }

    pub fn is_persisted(&self) -> bool {
        self.id.is_some()
    }

    /// Decoded view of the content string.
    pub fn rich_content(&self) -> content::RichContent {
        content::decode(&self.content)
    }
}

/// Provider selection as a pure function of mode and availability.
pub fn route_provider(mode: ChatMode, local_available: bool) -> Result<ProviderKind, SessionError> {
    match mode {
        ChatMode::Online => Ok(ProviderKind::Remote),
        ChatMode::Offline if local_available => Ok(ProviderKind::Local),
        ChatMode::Offline => Err(SessionError::LocalUnavailable),
    }
}

/// Derive a conversation title from the first user message.
/// Truncates at [`TITLE_MAX_CHARS`] characters with "..." if longer.
pub fn derive_title(first_message: &str) -> String {
    let trimmed = first_message.trim();
    if trimmed.is_empty() {
        return DEFAULT_CONVERSATION_TITLE.to_string();
    }

    let mut chars = trimmed.char_indices();
    match chars.nth(TITLE_MAX_CHARS) {
        // Within the limit: keep as is.
        None => trimmed.to_string(),
        Some((boundary, _)) => format!("{}...", &trimmed[..boundary]),
    }
}

/// Merge a freshly inserted record into the sequence, keyed on the store
/// identifier. Duplicate delivery is a no-op; returns whether the record
/// was actually added.
fn merge_insert(messages: &Mutex<Vec<SessionMessage>>, record: Message) -> bool {
    let Ok(mut list) = messages.lock() else {
        return false;
    };
    if list.iter().any(|m| m.id == Some(record.id)) {
        return false;
    }
    list.push(SessionMessage::from_record(record));
    list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    true
}

/// RAII send serialization: acquired with a compare-exchange, released on
/// drop. A second send while one is in flight is rejected, not queued.
struct SendGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> SendGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for SendGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// One open conversational session.
pub struct ChatSession {
    store: Arc<dyn ConversationStore>,
    remote: Arc<dyn CompletionProvider>,
    local: Arc<dyn CompletionProvider>,
    monitor: AvailabilityMonitor,
    mode: Mutex<ChatMode>,
    state: Mutex<SessionState>,
    conversation: Mutex<Option<Conversation>>,
    messages: Arc<Mutex<Vec<SessionMessage>>>,
    sending: AtomicBool,
    subscription: Mutex<Option<JoinHandle<()>>>,
}

impl ChatSession {
    /// Build a session against real provider clients and start the
    /// availability monitor.
    pub fn new(
        store: Arc<dyn ConversationStore>,
        settings: &Settings,
    ) -> Result<Self, SessionError> {
        let selected = SelectedModel::new(&settings.local_model);
        let remote = Arc::new(RemoteClient::from_settings(settings));
        let local = Arc::new(LocalClient::new(&settings.local_base_url, selected.clone())?);
        let monitor = AvailabilityMonitor::start(
            settings.local_base_url.clone(),
            selected,
            std::time::Duration::from_secs(PROBE_INTERVAL_SECS),
        );
        Ok(Self::with_parts(store, remote, local, monitor, settings.mode))
    }

    /// Assemble a session from parts. Providers and monitor are injected;
    /// this is also the test seam.
    pub fn with_parts(
        store: Arc<dyn ConversationStore>,
        remote: Arc<dyn CompletionProvider>,
        local: Arc<dyn CompletionProvider>,
        monitor: AvailabilityMonitor,
        mode: ChatMode,
    ) -> Self {
        Self {
            store,
            remote,
            local,
            monitor,
            mode: Mutex::new(mode),
            state: Mutex::new(SessionState::Idle),
            conversation: Mutex::new(None),
            messages: Arc::new(Mutex::new(Vec::new())),
            sending: AtomicBool::new(false),
            subscription: Mutex::new(None),
        }
    }

    // ── Accessors ───────────────────────────────────────────

    pub fn state(&self) -> SessionState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(SessionState::Closed)
    }

    pub fn mode(&self) -> ChatMode {
        self.mode.lock().map(|m| *m).unwrap_or(ChatMode::Online)
    }

    pub fn conversation(&self) -> Option<Conversation> {
        self.conversation.lock().ok().and_then(|c| c.clone())
    }

    /// Snapshot of the rendered message sequence.
    pub fn messages(&self) -> Vec<SessionMessage> {
        self.messages.lock().map(|m| m.clone()).unwrap_or_default()
    }

    pub fn monitor(&self) -> &AvailabilityMonitor {
        &self.monitor
    }

    /// Should the input surface offer image attachments right now?
    pub fn image_input_allowed(&self) -> bool {
        capability::image_input_allowed(self.mode(), &self.remote.descriptor().model)
    }

    // ── Lifecycle ───────────────────────────────────────────

    /// Load a conversation: replace the in-memory sequence wholesale and
    /// move the change subscription over. Any prior subscription is torn
    /// down first: at most one is active per open session.
    pub async fn open_conversation(&self, conversation_id: Uuid) -> Result<(), SessionError> {
        self.set_state(SessionState::Loading);
        self.drop_subscription();

        let result = self.load_and_subscribe(conversation_id).await;
        match &result {
            Ok(()) => self.set_state(SessionState::Ready),
            Err(_) => self.set_state(SessionState::Idle),
        }
        result
    }

    async fn load_and_subscribe(&self, conversation_id: Uuid) -> Result<(), SessionError> {
        let conversation = self
            .store
            .get_conversation(conversation_id)
            .await?
            .ok_or(SessionError::NoConversation)?;
        let history = self.store.list_messages(conversation_id).await?;

        if let Ok(mut list) = self.messages.lock() {
            *list = history.into_iter().map(SessionMessage::from_record).collect();
        }
        if let Ok(mut slot) = self.conversation.lock() {
            *slot = Some(conversation);
        }

        let mut events = self.store.subscribe(conversation_id);
        let messages = Arc::clone(&self.messages);
        let handle = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let merged = merge_insert(&messages, event.message);
                if merged {
                    tracing::debug!("change event merged into session");
                }
            }
        });
        if let Ok(mut slot) = self.subscription.lock() {
            *slot = Some(handle);
        }

        tracing::info!(conversation_id = %conversation_id, "conversation opened");
        Ok(())
    }

    /// Create a fresh conversation and open it.
    pub async fn start_conversation(&self) -> Result<Uuid, SessionError> {
        let conversation = self
            .store
            .create_conversation(DEFAULT_CONVERSATION_TITLE)
            .await?;
        self.open_conversation(conversation.id).await?;
        Ok(conversation.id)
    }

    /// Open the most recently updated conversation, creating one on demand
    /// when none is active.
    pub async fn open_latest_or_create(&self) -> Result<Uuid, SessionError> {
        let existing = self.store.list_conversations().await?;
        match existing.first() {
            Some(conversation) => {
                let id = conversation.id;
                self.open_conversation(id).await?;
                Ok(id)
            }
            None => self.start_conversation().await,
        }
    }

    /// Apply the persisted mode preference, if any. Availability is not
    /// consulted here: a restored offline mode simply fails sends until
    /// the local provider shows up.
    pub async fn restore_mode(&self) -> Result<(), SessionError> {
        if let Some(raw) = self.store.get_preference(PREF_CHAT_MODE).await? {
            if let Ok(mode) = ChatMode::from_str(&raw) {
                if let Ok(mut slot) = self.mode.lock() {
                    *slot = mode;
                }
            }
        }
        Ok(())
    }

    /// Tear down the change subscription and the probe task. An in-flight
    /// send is not cancelled: it completes and writes its result even if
    /// no longer observed.
    pub fn close(&self) {
        self.drop_subscription();
        self.monitor.stop();
        self.set_state(SessionState::Closed);
        tracing::debug!("session closed");
    }

    // ── Send ────────────────────────────────────────────────

    /// Send a user turn: optimistic insert, persist, complete, reconcile.
    ///
    /// Provider failures after the user turn was persisted resolve to
    /// `Ok(())`: the failure is recorded as a synthetic assistant message
    /// in the history. Failures before that point return the error and
    /// persist nothing further.
    pub async fn send(&self, text: &str, images: Vec<String>) -> Result<(), SessionError> {
        let text = text.trim();
        if text.is_empty() && images.is_empty() {
            return Err(SessionError::EmptyMessage);
        }
        let conversation = self.conversation().ok_or(SessionError::NoConversation)?;

        let _guard = SendGuard::acquire(&self.sending).ok_or(SessionError::Busy)?;
        self.set_state(SessionState::Sending(SendPhase::PersistingUser));
        let result = self.run_send(conversation, text, images).await;
        self.set_state(SessionState::Ready);
        result
    }

    async fn run_send(
        &self,
        conversation: Conversation,
        text: &str,
        images: Vec<String>,
    ) -> Result<(), SessionError> {
        let mode = self.mode();
        let availability = self.monitor.snapshot();
        let kind = route_provider(mode, availability.available)?;

        content::validate_image_sizes(&images).map_err(SessionError::ImageTooLarge)?;
        let encoded = content::encode(text, &images);

        // 1. Optimistic placeholder: rendered immediately.
        let user_key = Uuid::new_v4();
        self.push_message(SessionMessage::pending_user(user_key, encoded.clone()));

        // 2. Persist the user turn. On failure the placeholder stays in
        //    place and no provider call is made.
        let record = match self
            .store
            .insert_message(NewMessage {
                conversation_id: conversation.id,
                role: MessageRole::User,
                content: encoded,
                model: None,
            })
            .await
        {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(error = %e, "user message persist failed, keeping placeholder");
                return Err(e.into());
            }
        };
        self.splice_record(user_key, record);

        // 3. Authoritative history, decoded to plain text for the provider.
        //    Only this turn's images are forwarded.
        let history = self.store.list_messages(conversation.id).await?;
        let turns: Vec<ChatTurn> = history
            .iter()
            .map(|m| ChatTurn {
                role: m.role,
                text: content::decode(&m.content).text,
            })
            .collect();

        // 4. Thinking marker for the assistant turn.
        let thinking_key = Uuid::new_v4();
        self.push_message(SessionMessage::thinking_marker(thinking_key));
        self.set_state(SessionState::Sending(SendPhase::AwaitingCompletion));

        // 5. Complete via the routed provider. Unsupported images are
        //    dropped for the call, never an error.
        let provider = self.provider_for(kind);
        let descriptor = provider.descriptor();
        let images = if descriptor.supports_vision {
            images
        } else {
            Vec::new()
        };
        let outcome = provider.complete(&turns, &images).await;

        // 6/7. The thinking marker never survives the send, whatever the
        //      outcome.
        self.remove_by_key(thinking_key);

        match outcome {
            Ok(reply) => {
                tracing::info!(
                    provider = %descriptor.kind,
                    model = %descriptor.model,
                    chars = reply.len(),
                    "completion succeeded"
                );
                let record = self
                    .store
                    .insert_message(NewMessage {
                        conversation_id: conversation.id,
                        role: MessageRole::Assistant,
                        content: content::encode(&reply, &[]),
                        model: Some(descriptor.model.clone()),
                    })
                    .await?;
                merge_insert(&self.messages, record);
            }
            Err(e) => {
                tracing::warn!(
                    provider = %descriptor.kind,
                    model = %descriptor.model,
                    error = %e,
                    "completion failed, recording error turn"
                );
                let record = self
                    .store
                    .insert_message(NewMessage {
                        conversation_id: conversation.id,
                        role: MessageRole::Assistant,
                        content: format!("Something went wrong while generating a response: {e}"),
                        model: Some(descriptor.model.clone()),
                    })
                    .await?;
                merge_insert(&self.messages, record);
            }
        }

        // 8. First exchange: derive the title from the user's text, once.
        if history.len() <= 2 && conversation.title == DEFAULT_CONVERSATION_TITLE {
            let title = derive_title(text);
            if title != DEFAULT_CONVERSATION_TITLE {
                match self.store.rename_conversation(conversation.id, &title).await {
                    Ok(()) => {
                        if let Ok(mut slot) = self.conversation.lock() {
                            if let Some(c) = slot.as_mut() {
                                c.title = title;
                            }
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "title rename failed"),
                }
            }
        }

        Ok(())
    }

    // ── Reset / mode / rename ───────────────────────────────

    /// Bulk-delete every message of the open conversation, then clear the
    /// rendered sequence. The conversation row itself stays.
    pub async fn reset(&self) -> Result<(), SessionError> {
        let conversation = self.conversation().ok_or(SessionError::NoConversation)?;
        self.set_state(SessionState::Resetting);
        let result = self.store.clear_messages(conversation.id).await;
        self.set_state(SessionState::Ready);
        result?;

        if let Ok(mut list) = self.messages.lock() {
            list.clear();
        }
        tracing::info!(conversation_id = %conversation.id, "conversation reset");
        Ok(())
    }

    /// Switch between online and offline mode. Switching into offline mode
    /// is rejected while the local provider is unavailable. A failed
    /// preference persist is logged but does not revert the in-memory
    /// mode.
    pub async fn set_mode(&self, mode: ChatMode) -> Result<(), SessionError> {
        if mode == ChatMode::Offline && !self.monitor.snapshot().available {
            return Err(SessionError::LocalUnavailable);
        }
        if let Ok(mut slot) = self.mode.lock() {
            *slot = mode;
        }
        if let Err(e) = self.store.set_preference(PREF_CHAT_MODE, mode.as_str()).await {
            tracing::warn!(error = %e, "mode preference persist failed");
        }
        Ok(())
    }

    /// Explicit user-initiated rename of the open conversation.
    pub async fn rename(&self, title: &str) -> Result<(), SessionError> {
        let conversation = self.conversation().ok_or(SessionError::NoConversation)?;
        self.store
            .rename_conversation(conversation.id, title)
            .await?;
        if let Ok(mut slot) = self.conversation.lock() {
            if let Some(c) = slot.as_mut() {
                c.title = title.to_string();
            }
        }
        Ok(())
    }

    // ── Internal ────────────────────────────────────────────

    fn provider_for(&self, kind: ProviderKind) -> &Arc<dyn CompletionProvider> {
        match kind {
            ProviderKind::Remote => &self.remote,
            ProviderKind::Local => &self.local,
        }
    }

    fn set_state(&self, state: SessionState) {
        if let Ok(mut slot) = self.state.lock() {
            *slot = state;
        }
    }

    fn push_message(&self, message: SessionMessage) {
        if let Ok(mut list) = self.messages.lock() {
            list.push(message);
        }
    }

    /// Replace the placeholder identified by `key` with the authoritative
    /// record. If a change event for the same row already merged it, the
    /// placeholder is simply dropped.
    fn splice_record(&self, key: Uuid, record: Message) {
        let Ok(mut list) = self.messages.lock() else {
            return;
        };
        if list.iter().any(|m| m.id == Some(record.id)) {
            list.retain(|m| m.key != key);
            return;
        }
        if let Some(slot) = list.iter_mut().find(|m| m.key == key) {
            *slot = SessionMessage::from_record(record);
        } else {
            list.push(SessionMessage::from_record(record));
            list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        }
    }

    fn remove_by_key(&self, key: Uuid) {
        if let Ok(mut list) = self.messages.lock() {
            list.retain(|m| m.key != key);
        }
    }

    fn drop_subscription(&self) {
        if let Ok(mut slot) = self.subscription.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        self.drop_subscription();
        self.monitor.stop();
    }
}
