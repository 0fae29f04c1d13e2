//! The statement lifecycle: prepare, bind, step, run, reset, finalize.

use crate::connection::ConnInner;
use crate::txn::{commit_participants, rollback_participants, ConnTxHook};
use futures::stream::BoxStream;
use futures::StreamExt;
use std::sync::Arc;
use stratadb_exec::{execute, explain, DmlSummary, ExecCtx, InstrGraph, Params, RootKind, StatementOutput};
use stratadb_value::{Row, SqlValue};
use stratadb_vtab::{EngineError, Result};

/// One `step` outcome: a row, or the end of the statement.
#[derive(Debug)]
pub enum StepResult {
    Row(Row),
    Done,
}

enum StmtState {
    Ready,
    Streaming { stream: BoxStream<'static, Result<Row>> },
    Done,
    Finalized,
}

/// A prepared statement: an emitted instruction graph plus this
/// statement's parameter bindings and cursor state. Reusable across
/// executions via [`Statement::reset`].
pub struct Statement {
    conn: Arc<ConnInner>,
    graph: Arc<InstrGraph>,
    params: Params,
    state: StmtState,
    ctx: Option<Arc<ExecCtx>>,
    last_summary: DmlSummary,
}

impl std::fmt::Debug for Statement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Statement").finish_non_exhaustive()
    }
}

impl Statement {
    pub(crate) fn new(conn: Arc<ConnInner>, graph: Arc<InstrGraph>) -> Self {
        let params = Params::with_slots(graph.params.total_slots());
        Statement { conn, graph, params, state: StmtState::Ready, ctx: None, last_summary: DmlSummary::default() }
    }

    fn check_not_finalized(&self) -> Result<()> {
        if matches!(self.state, StmtState::Finalized) {
            return Err(EngineError::misuse("statement is finalized"));
        }
        Ok(())
    }

    fn check_bindable(&self) -> Result<()> {
        self.check_not_finalized()?;
        if matches!(self.state, StmtState::Streaming { .. }) {
            return Err(EngineError::misuse("cannot bind while the statement is running"));
        }
        Ok(())
    }

    /// Bind by 1-based ordinal.
    pub fn bind(&mut self, ordinal: usize, value: impl Into<SqlValue>) -> Result<()> {
        self.check_bindable()?;
        let slot = self
            .graph
            .params
            .ordinal_slot(ordinal)
            .ok_or_else(|| EngineError::range(format!("no parameter ?{ordinal}")))?;
        self.params.set(slot, value.into())
    }

    /// Bind by name, with or without the `:`/`@`/`$` prefix. The same
    /// name always refers to the same slot wherever it appears.
    pub fn bind_named(&mut self, name: &str, value: impl Into<SqlValue>) -> Result<()> {
        self.check_bindable()?;
        let slot = self
            .graph
            .params
            .name_slot(name)
            .ok_or_else(|| EngineError::range(format!("no parameter named {name}")))?;
        self.params.set(slot, value.into())
    }

    pub fn clear_bindings(&mut self) -> Result<()> {
        self.check_bindable()?;
        self.params.clear();
        Ok(())
    }

    /// Number of columns in result rows; zero for DML/DDL statements.
    pub fn column_count(&self) -> usize {
        match self.graph.root_kind {
            RootKind::Rows { arity } => arity,
            RootKind::Dml | RootKind::Ddl => 0,
        }
    }

    /// The instruction program, rendered as the canonical explain dump.
    pub fn explain(&self) -> String {
        explain(&self.graph)
    }

    /// Summary of the most recent completed DML execution.
    pub fn summary(&self) -> DmlSummary {
        self.last_summary
    }

    /// Interrupt the running execution, if any. The next `step` surfaces
    /// the cancellation.
    pub fn cancel(&self) {
        if let Some(ctx) = &self.ctx {
            ctx.cancel();
        }
    }

    fn fresh_ctx(&mut self) -> Arc<ExecCtx> {
        let ctx = ExecCtx::new(
            self.conn.clone(),
            self.conn.db.registry.clone(),
            self.params.clone(),
            Arc::new(ConnTxHook(self.conn.clone())),
        );
        self.ctx = Some(ctx.clone());
        ctx
    }

    /// Statement-end handling: outside an explicit transaction the
    /// statement's participants commit (or roll back on error).
    async fn autocommit(&self, failed: bool) -> Result<()> {
        if self.conn.txn.lock().explicit {
            return Ok(());
        }
        if failed {
            rollback_participants(&self.conn).await?;
            self.conn.discard_overlay().await?;
            Ok(())
        } else {
            commit_participants(&self.conn).await?;
            self.conn.publish_overlay().await
        }
    }

    async fn fail(&mut self, err: EngineError) -> EngineError {
        self.state = StmtState::Done;
        if let Err(cleanup) = self.autocommit(true).await {
            log::warn!("rollback after statement failure also failed: {cleanup}");
        }
        err
    }

    /// Advance the statement: the next row, or `Done` once exhausted.
    /// DML and DDL statements perform their work on the first step and
    /// report `Done` immediately.
    pub async fn step(&mut self) -> Result<StepResult> {
        self.check_not_finalized()?;
        loop {
            match &mut self.state {
                StmtState::Done => return Ok(StepResult::Done),
                StmtState::Ready => {
                    let ctx = self.fresh_ctx();
                    match execute(self.graph.clone(), ctx).await {
                        Ok(StatementOutput::Rows(stream)) => {
                            self.state = StmtState::Streaming { stream };
                        }
                        Ok(StatementOutput::Summary(summary)) => {
                            self.last_summary = summary;
                            self.state = StmtState::Done;
                            self.autocommit(false).await?;
                            return Ok(StepResult::Done);
                        }
                        Err(err) => return Err(self.fail(err).await),
                    }
                }
                StmtState::Streaming { stream } => match stream.next().await {
                    Some(Ok(row)) => return Ok(StepResult::Row(row)),
                    Some(Err(err)) => return Err(self.fail(err).await),
                    None => {
                        self.state = StmtState::Done;
                        self.autocommit(false).await?;
                        return Ok(StepResult::Done);
                    }
                },
                StmtState::Finalized => unreachable!("checked above"),
            }
        }
    }

    /// Run the statement to completion and return the DML summary.
    /// Row-producing statements are drained; their summary is empty.
    pub async fn run(&mut self) -> Result<DmlSummary> {
        while let StepResult::Row(_) = self.step().await? {}
        Ok(self.last_summary)
    }

    /// Return the statement to its pre-execution state, keeping the
    /// bindings.
    pub fn reset(&mut self) -> Result<()> {
        self.check_not_finalized()?;
        // Dropping the stream closes its cursors.
        self.state = StmtState::Ready;
        self.ctx = None;
        self.last_summary = DmlSummary::default();
        Ok(())
    }

    /// Release the statement. Further calls report `Misuse`.
    pub fn finalize(&mut self) {
        self.state = StmtState::Finalized;
        self.ctx = None;
    }
}
