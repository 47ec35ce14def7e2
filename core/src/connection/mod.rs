//! Connection Manager
//!
//! Owns the chat-socket lifecycle: pairing, connecting, connected,
//! disconnected, with jittered-backoff reconnection and credential
//! persistence through the vault. All socket-mutating operations happen on
//! this manager's own control loop (spawned by `start`); external callers
//! interact only through hook registration and `current_client`.

mod policy;

pub use policy::{backoff_delay, DisconnectPolicy};

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::config::EngineConfig;
use crate::event_bus::{ConnectionAccount, ConnectionStatus, Event, EventBus, LastDisconnect};
use crate::error::{EngineError, Result};
use crate::model::MediaKind;
use crate::vault::CredentialVault;

/// The provider payload shapes the Dispatcher builds per `MediaKind`
/// (spec step 6 of the dispatch flow).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SendPayload {
    Text { text: String },
    Media { kind: MediaKind, url: String, caption: Option<String>, file_name: Option<String> },
}

/// `ChatClient.Send(address, payload) -> (providerMessageID, error)`.
#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn send(&self, address: &str, payload: SendPayload) -> Result<String>;
    async fn stop(&self);
}

/// Events the upstream socket implementation reports.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Connected { account_phone: Option<String>, account_name: Option<String> },
    Disconnected { code: i32, reason: String },
    PairingCode(String),
    DeliveryAck { provider_message_id: String },
    CredentialsUpdated(Vec<u8>),
}

/// Yields lifecycle events for a single socket instance.
#[async_trait]
pub trait ConnectionStream: Send {
    async fn next(&mut self) -> Option<StreamEvent>;
}

/// Creates a fresh socket (client + event stream) from decrypted
/// credentials, or `None` credentials to start a fresh pairing.
#[async_trait]
pub trait SocketFactory: Send + Sync {
    async fn create(
        &self,
        credentials: Option<Vec<u8>>,
    ) -> Result<(Arc<dyn ChatClient>, Box<dyn ConnectionStream>)>;
}

/// Invoked with the live client on every successful connect, including
/// reconnects, and on every delivery ack the stream reports. The Delivery
/// Listener is one such hook.
#[async_trait]
pub trait ConnectionHook: Send + Sync {
    async fn on_connected(&self, client: Arc<dyn ChatClient>);

    /// Default no-op so hooks that only care about reconnects (none yet,
    /// but the seam exists for them) don't need to implement this.
    async fn on_delivery_ack(&self, _provider_message_id: &str) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Pairing,
    Connecting,
    Connected,
    Disconnected,
}

struct SharedState {
    state: RwLock<ConnectionState>,
    client: RwLock<Option<Arc<dyn ChatClient>>>,
    connected_at: RwLock<Option<DateTime<Utc>>>,
    started_at: Instant,
    last_disconnect: RwLock<Option<LastDisconnect>>,
    account: RwLock<Option<ConnectionAccount>>,
    reconnect_attempts: AtomicU32,
    retry_started_at: RwLock<Option<Instant>>,
}

pub struct ConnectionManager {
    shared: Arc<SharedState>,
    vault: CredentialVault,
    events: EventBus,
    hooks: RwLock<Vec<Arc<dyn ConnectionHook>>>,
    config: EngineConfig,
}

const CREDENTIAL_KEY: &str = "creds";

impl ConnectionManager {
    pub fn new(vault: CredentialVault, events: EventBus, config: EngineConfig) -> Self {
        Self {
            shared: Arc::new(SharedState {
                state: RwLock::new(ConnectionState::Pairing),
                client: RwLock::new(None),
                connected_at: RwLock::new(None),
                started_at: Instant::now(),
                last_disconnect: RwLock::new(None),
                account: RwLock::new(None),
                reconnect_attempts: AtomicU32::new(0),
                retry_started_at: RwLock::new(None),
            }),
            vault,
            events,
            hooks: RwLock::new(Vec::new()),
            config,
        }
    }

    pub async fn register_hook(&self, hook: Arc<dyn ConnectionHook>) {
        self.hooks.write().await.push(hook);
    }

    /// Test-only seam: drives the manager straight to `Connected` with a
    /// given client, without running the control loop or a real socket.
    #[cfg(test)]
    pub(crate) async fn set_connected_for_test(&self, client: Arc<dyn ChatClient>) {
        *self.shared.client.write().await = Some(client);
        *self.shared.state.write().await = ConnectionState::Connected;
    }

    /// The live socket, or `None` when not connected — callers (the
    /// Dispatcher) must re-check on every send rather than caching it.
    pub async fn current_client(&self) -> Option<Arc<dyn ChatClient>> {
        if *self.shared.state.read().await == ConnectionState::Connected {
            self.shared.client.read().await.clone()
        } else {
            None
        }
    }

    pub async fn status(&self) -> ConnectionStatus {
        let state = *self.shared.state.read().await;
        ConnectionStatus {
            status: format!("{state:?}").to_lowercase(),
            uptime_secs: self.shared.started_at.elapsed().as_secs(),
            connected_at: *self.shared.connected_at.read().await,
            last_disconnect: self.shared.last_disconnect.read().await.clone(),
            reconnect_attempts: self.shared.reconnect_attempts.load(Ordering::SeqCst),
            account: self.shared.account.read().await.clone(),
        }
    }

    /// Starts the control loop on a background task. Reconnects for as
    /// long as policy allows; the task exits only on a terminal
    /// disconnect (`ReplacedByAnotherClient`) or `destroy`.
    pub fn start(self: &Arc<Self>, store: crate::store::StateStore, factory: Arc<dyn SocketFactory>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.run(store, factory).await;
        });
    }

    async fn run(&self, store: crate::store::StateStore, factory: Arc<dyn SocketFactory>) {
        loop {
            *self.shared.state.write().await = ConnectionState::Connecting;

            let creds = match store.get_credential(CREDENTIAL_KEY).await {
                Ok(Some(ciphertext)) => match self.vault.decrypt(&ciphertext.clone().into()) {
                    Ok(plain) => Some(plain),
                    Err(e) => {
                        tracing::warn!(error = %e, "stored credentials failed integrity check");
                        None
                    }
                },
                _ => None,
            };

            let (client, mut stream) = match factory.create(creds).await {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::error!(error = %e, "failed to create socket");
                    tokio::time::sleep(std::time::Duration::from_millis(self.config.backoff_base_ms)).await;
                    continue;
                }
            };
            if let Some(old) = self.shared.client.write().await.take() {
                old.stop().await;
            }
            *self.shared.client.write().await = Some(client.clone());

            let terminal = self.drain_stream(&store, &client, stream.as_mut()).await;
            if terminal {
                break;
            }
        }
    }

    /// Processes events from one socket's stream until it disconnects or
    /// reports a terminal condition; returns `true` if the manager should
    /// stop entirely.
    async fn drain_stream(
        &self,
        store: &crate::store::StateStore,
        client: &Arc<dyn ChatClient>,
        stream: &mut dyn ConnectionStream,
    ) -> bool {
        while let Some(event) = stream.next().await {
            match event {
                StreamEvent::PairingCode(code) => {
                    *self.shared.state.write().await = ConnectionState::Pairing;
                    self.events.publish(Event::PairingCode {
                        rendered_for_cli: code.clone(),
                        data_url: format!("data:text/plain;base64,{}", base64_encode(&code)),
                        code,
                    });
                }
                StreamEvent::Connected { account_phone, account_name } => {
                    self.shared.reconnect_attempts.store(0, Ordering::SeqCst);
                    *self.shared.retry_started_at.write().await = None;
                    *self.shared.state.write().await = ConnectionState::Connected;
                    *self.shared.connected_at.write().await = Some(Utc::now());
                    *self.shared.account.write().await = account_phone.map(|phone| ConnectionAccount {
                        phone_number: phone,
                        name: account_name,
                    });

                    for hook in self.hooks.read().await.iter() {
                        hook.on_connected(client.clone()).await;
                    }
                    self.events.publish(Event::ConnectionStatus(self.status().await));
                }
                StreamEvent::CredentialsUpdated(plain) => {
                    if let Ok(blob) = self.vault.encrypt(&plain) {
                        let _ = store.set_credential(CREDENTIAL_KEY, blob.as_str()).await;
                    }
                }
                StreamEvent::DeliveryAck { provider_message_id } => {
                    for hook in self.hooks.read().await.iter() {
                        hook.on_delivery_ack(&provider_message_id).await;
                    }
                }
                StreamEvent::Disconnected { code, reason } => {
                    *self.shared.last_disconnect.write().await = Some(LastDisconnect {
                        reason: reason.clone(),
                        code,
                        at: Utc::now(),
                    });
                    *self.shared.state.write().await = ConnectionState::Disconnected;
                    self.events.publish(Event::ConnectionStatus(self.status().await));

                    return self.handle_disconnect(store, code).await;
                }
            }
        }
        false
    }

    /// Returns `true` if the manager should stop entirely (terminal
    /// disconnect), `false` to create a fresh socket and keep running.
    async fn handle_disconnect(&self, store: &crate::store::StateStore, code: i32) -> bool {
        match DisconnectPolicy::classify(code) {
            DisconnectPolicy::PermanentLoggedOut | DisconnectPolicy::Forbidden => {
                let _ = store.clear_credentials().await;
                *self.shared.state.write().await = ConnectionState::Pairing;
                false
            }
            DisconnectPolicy::ReplacedByAnotherClient => true,
            DisconnectPolicy::RestartRequired => false,
            DisconnectPolicy::TransientDefault => {
                let attempt = self.shared.reconnect_attempts.fetch_add(1, Ordering::SeqCst);
                let started = {
                    let mut guard = self.shared.retry_started_at.write().await;
                    *guard.get_or_insert(Instant::now())
                };

                if started.elapsed().as_secs() > self.config.max_retry_window_secs {
                    tracing::warn!("max retry window exceeded, giving up and resetting to pairing");
                    let _ = store.clear_credentials().await;
                    self.shared.reconnect_attempts.store(0, Ordering::SeqCst);
                    *self.shared.retry_started_at.write().await = None;
                    *self.shared.state.write().await = ConnectionState::Pairing;
                    return false;
                }

                let delay = backoff_delay(
                    attempt,
                    self.config.backoff_base_ms,
                    self.config.backoff_max_ms,
                    self.config.backoff_jitter,
                );
                tokio::time::sleep(delay).await;
                false
            }
        }
    }

    /// Stops timers and the socket without clearing credentials.
    pub async fn destroy(&self) {
        if let Some(client) = self.shared.client.write().await.take() {
            client.stop().await;
        }
        *self.shared.state.write().await = ConnectionState::Disconnected;
    }
}

fn base64_encode(s: &str) -> String {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    STANDARD.encode(s.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery_listener::DeliveryListener;
    use crate::model::{Intent, IntentStatus, Recipient};
    use crate::store::StateStore;
    use tokio::sync::Mutex as AsyncMutex;

    struct StubChatClient;

    #[async_trait]
    impl ChatClient for StubChatClient {
        async fn send(&self, _address: &str, _payload: SendPayload) -> Result<String> {
            Ok("unused".into())
        }
        async fn stop(&self) {}
    }

    struct StubStream {
        events: AsyncMutex<std::vec::IntoIter<StreamEvent>>,
    }

    impl StubStream {
        fn new(events: Vec<StreamEvent>) -> Self {
            Self { events: AsyncMutex::new(events.into_iter()) }
        }
    }

    #[async_trait]
    impl ConnectionStream for StubStream {
        async fn next(&mut self) -> Option<StreamEvent> {
            self.events.get_mut().next()
        }
    }

    #[tokio::test]
    async fn delivery_ack_through_drain_stream_promotes_intent_to_delivered() {
        let store = StateStore::open_in_memory().await.unwrap();
        let events = EventBus::new();

        let mut intent =
            Intent::new_pending(Recipient::Contact("c1".into()), "hi".into(), None, Utc::now());
        intent.status = IntentStatus::Sent;
        intent.provider_message_id = Some("wamid-1".into());
        intent.sent_at = Some(Utc::now());
        let id = intent.id.clone();
        store.create_intent(intent).await.unwrap();

        let vault = CredentialVault::new("passphrase");
        let config = EngineConfig::default();
        let manager = ConnectionManager::new(vault, events, config);
        let listener = Arc::new(DeliveryListener::new(store.clone(), manager.events.clone()));
        manager.register_hook(listener).await;

        let client: Arc<dyn ChatClient> = Arc::new(StubChatClient);
        let mut stream = StubStream::new(vec![StreamEvent::DeliveryAck {
            provider_message_id: "wamid-1".into(),
        }]);

        let terminal = manager.drain_stream(&store, &client, &mut stream).await;
        assert!(!terminal);

        let updated = store.find_intent(&id).await.unwrap().unwrap();
        assert_eq!(updated.status, IntentStatus::Delivered);
    }
}
