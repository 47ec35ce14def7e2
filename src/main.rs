//! `messaging-engine` - boots the scheduling and dispatch engine as a
//! long-running process, pairing to a chat provider and serving scheduled
//! sends until interrupted.
//!
//! Mirrors `cli/daemon.rs`'s run loop in the teacher repo: a `tokio::select!`
//! between the engine's own lifetime and `ctrl_c`, with an explicit drain on
//! the way out rather than letting the process die mid-send.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::Mutex;

use messaging_engine_core::config::EngineConfig;
use messaging_engine_core::connection::{ChatClient, ConnectionStream, SocketFactory};
use messaging_engine_core::contacts::{ContactStore, ResolvedContact};
use messaging_engine_core::Engine;

mod paths;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = EngineConfig::load().await.context("loading configuration")?;
    let data_dir = paths::data_dir()?;
    tokio::fs::create_dir_all(&data_dir)
        .await
        .context("creating data directory")?;

    let passphrase =
        std::env::var("MESSAGING_ENGINE_PASSPHRASE").context("MESSAGING_ENGINE_PASSPHRASE must be set")?;
    let contacts: Arc<dyn ContactStore> = Arc::new(InMemoryContactStore::default());

    let engine = Engine::boot(config, &data_dir, passphrase, contacts)
        .await
        .context("booting engine")?;
    engine.start(Arc::new(StdinSocketFactory));

    tracing::info!("engine running, awaiting pairing or reconnect");

    tokio::select! {
        _ = std::future::pending::<()>() => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    engine.shutdown().await;
    Ok(())
}

/// Trivial in-process contact resolution for a single operator running the
/// engine against their own contact list; a real deployment replaces this
/// with whatever store owns contact/label/template CRUD (out of scope here).
#[derive(Default)]
struct InMemoryContactStore {
    by_id: Mutex<HashMap<String, ResolvedContact>>,
}

#[async_trait]
impl ContactStore for InMemoryContactStore {
    async fn resolve_by_id(&self, contact_id: &str) -> messaging_engine_core::error::Result<Option<ResolvedContact>> {
        Ok(self.by_id.lock().await.get(contact_id).cloned())
    }

    async fn resolve_or_create_by_phone(
        &self,
        phone: &str,
        name: Option<&str>,
    ) -> messaging_engine_core::error::Result<ResolvedContact> {
        let mut map = self.by_id.lock().await;
        if let Some(existing) = map.get(phone) {
            return Ok(existing.clone());
        }
        let contact = ResolvedContact {
            contact_id: phone.to_string(),
            address: format!("{phone}@s.whatsapp.net"),
            name: name.map(str::to_string),
        };
        map.insert(phone.to_string(), contact.clone());
        Ok(contact)
    }
}

/// Placeholder `SocketFactory`: a real binary wires this to the provider's
/// actual client library. Left unimplemented here since that library is an
/// external integration outside this crate's scope, not a core operation.
struct StdinSocketFactory;

#[async_trait]
impl SocketFactory for StdinSocketFactory {
    async fn create(
        &self,
        _credentials: Option<Vec<u8>>,
    ) -> messaging_engine_core::error::Result<(Arc<dyn ChatClient>, Box<dyn ConnectionStream>)> {
        Err(messaging_engine_core::error::EngineError::Internal {
            message: "no provider socket implementation wired into this binary".to_string(),
        })
    }
}

