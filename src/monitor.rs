//! Availability monitor: periodic reachability probe for the local
//! provider.
//!
//! The remote provider has no probe; its reachability is inferred from
//! call outcomes. The local provider is probed once at session start and
//! every 30 seconds after that, for as long as the session is open. Probe
//! failures never surface as errors: they only flip the cached
//! availability flag consumed by mode-switch and send logic.

use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;

use crate::config::PROBE_TIMEOUT_SECS;
use crate::providers::local::fetch_installed_models;

/// The currently selected local model, shared between the session, the
/// local client, and the monitor's silent reselection.
#[derive(Clone)]
pub struct SelectedModel(Arc<Mutex<String>>);

impl SelectedModel {
    pub fn new(model: &str) -> Self {
        Self(Arc::new(Mutex::new(model.to_string())))
    }

    pub fn get(&self) -> String {
        self.0.lock().map(|m| m.clone()).unwrap_or_default()
    }

    pub fn set(&self, model: String) {
        if let Ok(mut slot) = self.0.lock() {
            *slot = model;
        }
    }
}

/// Cached result of the latest probe.
#[derive(Debug, Clone, Default)]
pub struct LocalAvailability {
    pub available: bool,
    /// Installed model identifiers, in server order.
    pub models: Vec<String>,
}

/// Probe the local provider once. Any failure maps to unavailable.
pub async fn probe(client: &reqwest::Client, base_url: &str) -> LocalAvailability {
    match fetch_installed_models(client, base_url).await {
        Ok(models) => LocalAvailability {
            available: true,
            models,
        },
        Err(e) => {
            tracing::debug!(error = %e, "local provider probe failed");
            LocalAvailability::default()
        }
    }
}

/// Owned periodic probe task. Exactly one exists per open session; the
/// session owns the handle and stops it on teardown (Drop aborts as a
/// backstop).
pub struct AvailabilityMonitor {
    state: Arc<Mutex<LocalAvailability>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl AvailabilityMonitor {
    /// Start probing `base_url` immediately and then on every tick of
    /// `interval`. When a probe succeeds and the selected model is not
    /// among the installed ones, the first installed model is silently
    /// reselected.
    pub fn start(
        base_url: String,
        selected: SelectedModel,
        interval: std::time::Duration,
    ) -> Self {
        let state = Arc::new(Mutex::new(LocalAvailability::default()));
        let task_state = Arc::clone(&state);

        let handle = tokio::spawn(async move {
            let client = reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(PROBE_TIMEOUT_SECS))
                .build()
                .expect("Failed to create HTTP client");
            let mut ticker = tokio::time::interval(interval);

            loop {
                // First tick fires immediately: the session-start probe.
                ticker.tick().await;
                let availability = probe(&client, &base_url).await;
                reselect_if_missing(&availability, &selected);
                if let Ok(mut slot) = task_state.lock() {
                    *slot = availability;
                }
            }
        });

        Self {
            state,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// A monitor that never probes and reports unavailable. Used when a
    /// session runs strictly online or when probing is wired up later.
    pub fn idle() -> Self {
        Self {
            state: Arc::new(Mutex::new(LocalAvailability::default())),
            handle: Mutex::new(None),
        }
    }

    /// Latest cached probe result. Never blocks on the probe itself.
    pub fn snapshot(&self) -> LocalAvailability {
        self.state
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// Stop the probe task. Idempotent.
    pub fn stop(&self) {
        if let Ok(mut slot) = self.handle.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn set_snapshot_for_tests(&self, availability: LocalAvailability) {
        *self.state.lock().unwrap() = availability;
    }
}

impl Drop for AvailabilityMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Best effort, never block on an exact model match: when the selected
/// model disappeared from the installed set, move to the first one.
fn reselect_if_missing(availability: &LocalAvailability, selected: &SelectedModel) {
    if !availability.available || availability.models.is_empty() {
        return;
    }
    let current = selected.get();
    let present = availability.models.iter().any(|m| m.starts_with(&current));
    if !present {
        if let Some(first) = availability.models.first() {
            tracing::info!(
                previous = %current,
                reselected = %first,
                "selected local model no longer installed, reselecting"
            );
            selected.set(first.clone());
        }
    }
}
