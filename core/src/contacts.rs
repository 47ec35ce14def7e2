//! `ContactStore` collaborator interface
//!
//! Out of scope per the system's purpose (contact/label/template CRUD and
//! ingest live outside the core). The core only ever consumes this small
//! resolution surface — defined here as an `async_trait` the way
//! `core/src/agent/contract/transport.rs` defines `EventTransport` for its
//! own out-of-process collaborator.

use async_trait::async_trait;

use crate::error::Result;

/// A resolved contact: its canonical provider address and an optional
/// display name for template substitution (e.g. birthday messages).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedContact {
    pub contact_id: String,
    pub address: String,
    pub name: Option<String>,
}

/// Either half of the exactly-one-of reference the Scheduling Service
/// accepts when resolving a recipient.
#[derive(Debug, Clone)]
pub enum ContactRef {
    Id(String),
    Phone { phone: String, name: Option<String> },
}

#[async_trait]
pub trait ContactStore: Send + Sync {
    /// Resolve a contact id to its address, or `None` if unknown.
    async fn resolve_by_id(&self, contact_id: &str) -> Result<Option<ResolvedContact>>;

    /// Resolve (and auto-create if unknown) a contact by phone number,
    /// optionally updating a missing display name.
    async fn resolve_or_create_by_phone(
        &self,
        phone: &str,
        name: Option<&str>,
    ) -> Result<ResolvedContact>;

    /// Format a group id as a send address directly (no lookup needed).
    fn group_address(&self, group_id: &str) -> String {
        format!("{group_id}@g.us")
    }
}
