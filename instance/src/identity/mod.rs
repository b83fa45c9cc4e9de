//! Instance identity reconciliation
//!
//! Every instance owns a persistent token and a human-readable logical name.
//! The shared store keeps exactly one live token per logical name. Each time
//! storage connects, the local (token, name) pair is reconciled against it:
//!
//! | Stored state | Action |
//! |---|---|
//! | token known, same name | nothing |
//! | token known, other name | rename mapping and retag historical records |
//! | token unknown, name free | insert mapping |
//! | token unknown, name taken | adopt the name with the new token |

pub mod sqlite;
pub mod token;

pub use sqlite::SqliteIdentityStore;
pub use token::{load_or_create, SyncToken};

use log::info;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("logical name `{0}` is already mapped to another token")]
    NameTaken(String),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("storage unavailable after {attempts} attempts: {source}")]
    Unavailable {
        attempts: u32,
        #[source]
        source: rusqlite::Error,
    },
}

/// Storage operations the reconciler relies on
pub trait IdentityStore {
    /// Validates the connection
    fn test(&self) -> Result<(), StoreError>;

    /// Logical name currently mapped to `token`
    fn token_name(&self, token: &SyncToken) -> Result<Option<String>, StoreError>;

    /// Inserts a new mapping. Fails with `NameTaken` if `name` already has a token.
    fn insert_identity(&self, token: &SyncToken, name: &str) -> Result<(), StoreError>;

    /// Moves `token` from `old_name` to `new_name` and retags historical
    /// records, atomically. Returns the number of records retagged.
    fn rename_identity(
        &self,
        token: &SyncToken,
        old_name: &str,
        new_name: &str,
    ) -> Result<usize, StoreError>;

    /// Replaces the token mapped to `name`
    fn reassign_token(&self, name: &str, token: &SyncToken) -> Result<(), StoreError>;

    /// Number of distinct logical names known to the store
    fn distinct_names(&self) -> Result<usize, StoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Unchanged,
    Renamed { from: String, retagged: usize },
    Registered,
    Reregistered,
}

pub struct IdentityReconciler<S> {
    store: S,
}

impl<S: IdentityStore> IdentityReconciler<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    pub fn reconcile(&self, token: &SyncToken, name: &str) -> Result<ReconcileOutcome, StoreError> {
        match self.store.token_name(token)? {
            Some(stored) if stored == name => Ok(ReconcileOutcome::Unchanged),

            Some(stored) => {
                let retagged = self.store.rename_identity(token, &stored, name)?;
                info!(
                    "Instance renamed from {} to {}, {} historical reports updated",
                    stored, name, retagged
                );
                Ok(ReconcileOutcome::Renamed {
                    from: stored,
                    retagged,
                })
            }

            None => match self.store.insert_identity(token, name) {
                Ok(()) => {
                    info!("Registered instance {}", name);
                    Ok(ReconcileOutcome::Registered)
                }
                // A regenerated token file reclaiming its old name
                Err(StoreError::NameTaken(_)) => {
                    self.store.reassign_token(name, token)?;
                    info!("Re-registered instance {} with a new token", name);
                    Ok(ReconcileOutcome::Reregistered)
                }
                Err(e) => Err(e),
            },
        }
    }

    /// True when more than one logical name shares the store
    pub fn has_multiple_instances(&self) -> Result<bool, StoreError> {
        Ok(self.store.distinct_names()? > 1)
    }
}
