//! The transaction coordinator.
//!
//! Participation is recorded lazily at a table's first write. Commit is
//! sync-then-commit across every participant; any failure turns the
//! whole transaction into a rollback and surfaces the original error.
//! Savepoints fan out by index, and tables that join the transaction
//! after a savepoint opened replay the open savepoint stack so a later
//! `rollback_to` reaches them too.

use crate::connection::ConnInner;
use async_trait::async_trait;
use indexmap::IndexMap;
use std::sync::Arc;
use stratadb_exec::TxHook;
use stratadb_plan::TableRef;
use stratadb_vtab::{EngineError, Result, VirtualTable};

type Key = (String, String);

#[derive(Default)]
pub(crate) struct TxnState {
    pub participants: IndexMap<Key, Arc<dyn VirtualTable>>,
    /// Open savepoint indices, ascending.
    pub savepoints: Vec<usize>,
    pub next_savepoint: usize,
    /// An explicit BEGIN is open; statements stop auto-committing.
    pub explicit: bool,
}

impl TxnState {
    fn take_participants(&mut self) -> Vec<(Key, Arc<dyn VirtualTable>)> {
        self.savepoints.clear();
        self.next_savepoint = 0;
        self.participants.drain(..).collect()
    }
}

/// The [`TxHook`] a connection hands to the executor.
pub(crate) struct ConnTxHook(pub Arc<ConnInner>);

#[async_trait]
impl TxHook for ConnTxHook {
    async fn register_write(&self, table: &TableRef, handle: &Arc<dyn VirtualTable>) -> Result<()> {
        let key: Key = (table.schema_name.clone(), table.name.clone());
        let open_savepoints = {
            let txn = self.0.txn.lock();
            if txn.participants.contains_key(&key) {
                return Ok(());
            }
            txn.savepoints.clone()
        };
        handle.begin().await?;
        // Late joiner: bring it level with the open savepoint stack.
        for index in open_savepoints {
            handle.savepoint(index).await?;
        }
        self.0.txn.lock().participants.insert(key, handle.clone());
        Ok(())
    }

    async fn rollback_all(&self) -> Result<()> {
        rollback_participants(&self.0).await?;
        self.0.discard_overlay().await?;
        self.0.txn.lock().explicit = false;
        Ok(())
    }
}

/// Commit every participant: `sync` all first, then `commit` all. Any
/// failure rolls everything back and surfaces the first error.
#[tracing::instrument(skip_all)]
pub(crate) async fn commit_participants(conn: &Arc<ConnInner>) -> Result<()> {
    let participants = conn.txn.lock().take_participants();
    for (key, handle) in &participants {
        if let Err(err) = handle.sync().await {
            log::warn!("sync failed for table `{}`, rolling back: {err}", key.1);
            for (_, other) in &participants {
                let _ = other.rollback().await;
            }
            return Err(err);
        }
    }
    for (key, handle) in &participants {
        if let Err(err) = handle.commit().await {
            log::warn!("commit failed for table `{}`, rolling back: {err}", key.1);
            for (_, other) in &participants {
                let _ = other.rollback().await;
            }
            return Err(err);
        }
    }
    Ok(())
}

pub(crate) async fn rollback_participants(conn: &Arc<ConnInner>) -> Result<()> {
    let participants = conn.txn.lock().take_participants();
    let mut first_err = None;
    for (_, handle) in participants {
        if let Err(err) = handle.rollback().await {
            first_err.get_or_insert(err);
        }
    }
    match first_err {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

pub(crate) async fn open_savepoint(conn: &Arc<ConnInner>) -> Result<usize> {
    let (index, participants) = {
        let mut txn = conn.txn.lock();
        let index = txn.next_savepoint;
        txn.next_savepoint += 1;
        txn.savepoints.push(index);
        (index, txn.participants.values().cloned().collect::<Vec<_>>())
    };
    for handle in participants {
        handle.savepoint(index).await?;
    }
    Ok(index)
}

pub(crate) async fn release_savepoint(conn: &Arc<ConnInner>, index: usize) -> Result<()> {
    let participants = {
        let mut txn = conn.txn.lock();
        if !txn.savepoints.contains(&index) {
            return Err(EngineError::misuse(format!("no such savepoint: {index}")));
        }
        txn.savepoints.retain(|&i| i < index);
        txn.participants.values().cloned().collect::<Vec<_>>()
    };
    for handle in participants {
        handle.release(index).await?;
    }
    Ok(())
}

pub(crate) async fn rollback_savepoint(conn: &Arc<ConnInner>, index: usize) -> Result<()> {
    let participants = {
        let mut txn = conn.txn.lock();
        if !txn.savepoints.contains(&index) {
            return Err(EngineError::misuse(format!("no such savepoint: {index}")));
        }
        // The savepoint itself stays open.
        txn.savepoints.retain(|&i| i <= index);
        txn.participants.values().cloned().collect::<Vec<_>>()
    };
    for handle in participants {
        handle.rollback_to(index).await?;
    }
    Ok(())
}
