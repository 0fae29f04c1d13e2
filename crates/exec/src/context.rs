//! The runtime context a statement executes under.
//!
//! One [`ExecCtx`] lives per statement execution. It carries the database
//! facade, the bound parameter values, the cancellation flag and the
//! row-context: a LIFO stack of `(descriptor, row)` frames operators
//! install around per-row expression evaluation. Exactly one frame per
//! descriptor is live at a time within a scope, and every install is
//! paired with a removal on all exit paths via [`FrameGuard`].

use crate::func::FuncRegistry;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use stratadb_catalog::TableSchema;
use stratadb_plan::{DescriptorId, TableRef};
use stratadb_value::{Row, SqlValue};
use stratadb_vtab::{EngineError, Result, VirtualTable};

/// What the executor needs from the database: table resolution at
/// emission time, catalog mutation at DDL time.
#[async_trait]
pub trait EngineDb: Send + Sync {
    fn resolve_table(&self, table: &TableRef) -> Result<Arc<dyn VirtualTable>>;

    async fn create_table(
        &self,
        schema: TableSchema,
        options: BTreeMap<String, SqlValue>,
    ) -> Result<()>;

    async fn drop_table(&self, table: &TableRef) -> Result<()>;
}

/// Transaction participation hook. The coordinator implements this to
/// learn which tables a statement writes; the default ignores it, which
/// suits standalone executor tests.
#[async_trait]
pub trait TxHook: Send + Sync {
    /// Called by DML operators before the first write to `table`.
    async fn register_write(&self, table: &TableRef, handle: &Arc<dyn VirtualTable>) -> Result<()>;

    /// Abandon the whole transaction; invoked when a write fails under
    /// `ConflictPolicy::Rollback`.
    async fn rollback_all(&self) -> Result<()> {
        Ok(())
    }
}

pub struct NoopTxHook;

#[async_trait]
impl TxHook for NoopTxHook {
    async fn register_write(&self, _: &TableRef, handle: &Arc<dyn VirtualTable>) -> Result<()> {
        handle.begin().await
    }
}

/// The bound parameter values, one slot per distinct parameter. Slot
/// layout comes from the emitted program's parameter table.
#[derive(Debug, Default, Clone)]
pub struct Params {
    slots: Vec<SqlValue>,
}

impl Params {
    pub fn with_slots(n: usize) -> Self {
        Params { slots: vec![SqlValue::Null; n] }
    }

    pub fn set(&mut self, slot: usize, value: SqlValue) -> Result<()> {
        match self.slots.get_mut(slot) {
            Some(s) => {
                *s = value;
                Ok(())
            }
            None => Err(EngineError::range(format!("parameter slot {slot} out of range"))),
        }
    }

    pub fn get(&self, slot: usize) -> Result<&SqlValue> {
        self.slots
            .get(slot)
            .ok_or_else(|| EngineError::range(format!("parameter slot {slot} out of range")))
    }

    pub fn clear(&mut self) {
        for s in &mut self.slots {
            *s = SqlValue::Null;
        }
    }
}

pub struct ExecCtx {
    pub db: Arc<dyn EngineDb>,
    pub registry: Arc<FuncRegistry>,
    pub params: Params,
    pub tx: Arc<dyn TxHook>,
    frames: Mutex<Vec<(DescriptorId, Arc<Row>)>>,
    cancelled: AtomicBool,
}

impl ExecCtx {
    pub fn new(
        db: Arc<dyn EngineDb>,
        registry: Arc<FuncRegistry>,
        params: Params,
        tx: Arc<dyn TxHook>,
    ) -> Arc<Self> {
        Arc::new(ExecCtx {
            db,
            registry,
            params,
            tx,
            frames: Mutex::new(Vec::new()),
            cancelled: AtomicBool::new(false),
        })
    }

    /// Install the current row for `descriptor`. The frame is removed
    /// when the guard drops, on every exit path.
    pub fn install_row(self: &Arc<Self>, descriptor: DescriptorId, row: Arc<Row>) -> FrameGuard {
        self.frames.lock().push((descriptor, row));
        FrameGuard { ctx: self.clone(), descriptor }
    }

    /// The row currently installed for `descriptor`; the most recent
    /// frame wins.
    pub fn current_row(&self, descriptor: DescriptorId) -> Result<Arc<Row>> {
        self.frames
            .lock()
            .iter()
            .rev()
            .find(|(d, _)| *d == descriptor)
            .map(|(_, row)| row.clone())
            .ok_or_else(|| {
                EngineError::internal(format!("no row installed for descriptor {descriptor}"))
            })
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancelled.load(Ordering::Relaxed) {
            Err(EngineError::misuse("statement interrupted"))
        } else {
            Ok(())
        }
    }
}

/// Scoped removal of a row-context frame.
pub struct FrameGuard {
    ctx: Arc<ExecCtx>,
    descriptor: DescriptorId,
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        let mut frames = self.ctx.frames.lock();
        // Remove the most recent frame for this descriptor; guards drop
        // in LIFO order, so this is the one we pushed.
        if let Some(pos) = frames.iter().rposition(|(d, _)| *d == self.descriptor) {
            frames.remove(pos);
        }
    }
}
