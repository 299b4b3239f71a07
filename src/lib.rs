//! Colloquy: conversational session engine.
//!
//! Exchanges messages with one of two interchangeable completion
//! providers (a hosted multimodal endpoint or a local inference server),
//! persists history through a pluggable store, and keeps the rendered
//! message list consistent with the store's change stream under
//! concurrent writers.
//!
//! The pieces, leaf to root: [`content`] encodes mixed text+image
//! messages into one persisted string; [`capability`] answers which
//! provider/model pairs accept images; [`providers`] hides the two
//! transports behind one contract; [`monitor`] keeps a cached view of the
//! local provider's reachability; [`store`] is the persistence
//! collaborator boundary; [`session`] orchestrates the whole pipeline.

pub mod capability;
pub mod config;
pub mod content;
pub mod db;
pub mod models;
pub mod monitor;
pub mod providers;
pub mod session;
pub mod store;

pub use content::RichContent;
pub use models::{ChatMode, Conversation, Message, MessageRole, NewMessage};
pub use monitor::{AvailabilityMonitor, LocalAvailability, SelectedModel};
pub use providers::{
    ChatTurn, CompletionProvider, LocalClient, MockProvider, ProviderDescriptor, ProviderError,
    ProviderKind, RemoteClient,
};
pub use session::{ChatSession, SendPhase, SessionError, SessionMessage, SessionState};
pub use store::{ChangeEvent, ChangeEvents, ConversationStore, SqliteStore, StoreError};

use tracing_subscriber::EnvFilter;

/// Initialize tracing for an embedding application.
///
/// Honors `RUST_LOG` when set, otherwise falls back to the crate default.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter())),
        )
        .init();

    tracing::info!("{} starting v{}", config::APP_NAME, config::APP_VERSION);
}
