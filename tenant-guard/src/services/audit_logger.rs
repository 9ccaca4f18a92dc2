//! Buffered audit logging.
//!
//! `log` appends to an in-memory queue and returns immediately. A background
//! task flushes on a fixed interval; critical actions trigger an immediate
//! flush. Failed inserts put the batch back at the head of the queue so the
//! next flush retries it.
//!
//! Reads go through the request's [`TenantConnection`]. Export walks every
//! page of the match, so the rendered rows always add up to the reported total.

use crate::config::AuditConfig;
use crate::models::{
    AuditActor, AuditEvent, AuditFilters, AuditLog, AuditPage, AuditResult, ExportFormat,
};
use crate::services::error::TenancyError;
use crate::services::store::AuditSink;
use crate::services::tenant_connection::TenantConnection;
use chrono::Utc;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const SHUTDOWN_FLUSH_ATTEMPTS: usize = 3;

const EXPORT_PAGE_SIZE: i64 = 1000;

const CSV_HEADERS: [&str; 13] = [
    "id",
    "created_at",
    "organization_id",
    "actor_id",
    "actor_type",
    "action",
    "resource_type",
    "resource_id",
    "resource_name",
    "result",
    "error_message",
    "ip_address",
    "user_agent",
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AuditStats {
    pub pending: usize,
    pub flushed: u64,
    pub failed_batches: u64,
}

struct Inner {
    sink: Arc<dyn AuditSink>,
    config: AuditConfig,
    queue: Mutex<VecDeque<AuditLog>>,
    flush_gate: tokio::sync::Mutex<()>,
    shutdown_token: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
    flushed: AtomicU64,
    failed_batches: AtomicU64,
}

impl Inner {
    fn queue(&self) -> MutexGuard<'_, VecDeque<AuditLog>> {
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn flush(&self) -> Result<usize, TenancyError> {
        let _gate = self.flush_gate.lock().await;
        let mut written = 0;

        loop {
            let batch: Vec<AuditLog> = {
                let mut queue = self.queue();
                let take = queue.len().min(self.config.max_batch_size.max(1));
                queue.drain(..take).collect()
            };
            if batch.is_empty() {
                return Ok(written);
            }

            if let Err(e) = self.sink.insert_batch(&batch).await {
                let size = batch.len();
                {
                    let mut queue = self.queue();
                    for log in batch.into_iter().rev() {
                        queue.push_front(log);
                    }
                }
                self.failed_batches.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    batch_size = size,
                    error = %e,
                    "Audit batch insert failed, requeued for next flush"
                );
                return Err(TenancyError::Durability(e.to_string()));
            }

            written += batch.len();
            self.flushed.fetch_add(batch.len() as u64, Ordering::Relaxed);
            tracing::debug!(batch_size = batch.len(), "Flushed audit batch");
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let pending = self.queue().len();
        if pending > 0 {
            tracing::error!(pending, "Audit logger dropped without shutdown; events lost");
        }
    }
}

/// Cloneable handle; all clones share one queue.
#[derive(Clone)]
pub struct AuditLogger {
    inner: Arc<Inner>,
}

impl AuditLogger {
    pub fn new(sink: Arc<dyn AuditSink>, config: AuditConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                sink,
                config,
                queue: Mutex::new(VecDeque::new()),
                flush_gate: tokio::sync::Mutex::new(()),
                shutdown_token: CancellationToken::new(),
                worker: Mutex::new(None),
                flushed: AtomicU64::new(0),
                failed_batches: AtomicU64::new(0),
            }),
        }
    }

    /// Spawn the periodic flush task. Calling it twice is a no-op.
    pub fn start(&self) {
        let mut worker = self
            .inner
            .worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if worker.is_some() {
            return;
        }

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let shutdown = self.inner.shutdown_token.clone();
        let period = self.inner.config.flush_interval();

        tracing::info!(flush_interval_ms = period.as_millis() as u64, "Starting audit flush task");

        *worker = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("Audit flush task shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        if let Err(e) = inner.flush().await {
                            tracing::warn!(error = %e, "Scheduled audit flush failed");
                        }
                    }
                }
            }
        }));
    }

    pub fn log(&self, actor: &AuditActor, event: AuditEvent) -> Uuid {
        self.record(actor, event, AuditResult::Success, None)
    }

    pub fn log_failure(
        &self,
        actor: &AuditActor,
        event: AuditEvent,
        error: impl Into<String>,
    ) -> Uuid {
        self.record(actor, event, AuditResult::Failure, Some(error.into()))
    }

    /// Enrich and enqueue. Never blocks on I/O.
    pub fn record(
        &self,
        actor: &AuditActor,
        event: AuditEvent,
        result: AuditResult,
        error_message: Option<String>,
    ) -> Uuid {
        let critical = event.is_critical();
        let log = AuditLog::from_event(actor, event, result, error_message);
        let id = log.id;

        let depth = {
            let mut queue = self.inner.queue();
            queue.push_back(log);
            queue.len()
        };
        if depth > self.inner.config.max_queue_size {
            tracing::warn!(
                pending = depth,
                max_queue_size = self.inner.config.max_queue_size,
                "Audit queue above capacity"
            );
        }

        if critical {
            self.flush_in_background();
        }
        id
    }

    fn flush_in_background(&self) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let inner = self.inner.clone();
                handle.spawn(async move {
                    if let Err(e) = inner.flush().await {
                        tracing::warn!(error = %e, "Critical audit flush failed");
                    }
                });
            }
            Err(_) => {
                tracing::warn!("No runtime for critical audit flush; event stays queued");
            }
        }
    }

    /// Drain the queue in batches. Returns the number of rows written.
    pub async fn flush(&self) -> Result<usize, TenancyError> {
        self.inner.flush().await
    }

    pub async fn query(
        &self,
        connection: &TenantConnection,
        filters: AuditFilters,
    ) -> Result<AuditPage, TenancyError> {
        connection.query_audit_logs(filters).await
    }

    /// Every row matching `filters`, newest first. Pagination in `filters`
    /// is ignored.
    pub async fn export(
        &self,
        connection: &TenantConnection,
        format: ExportFormat,
        filters: AuditFilters,
    ) -> Result<String, TenancyError> {
        let filters = AuditFilters {
            organization_id: Some(connection.organization_id().to_string()),
            limit: EXPORT_PAGE_SIZE,
            offset: 0,
            ..filters
        };

        let mut logs: Vec<AuditLog> = Vec::new();
        let mut total: i64;
        loop {
            let page = connection
                .query_audit_logs(AuditFilters {
                    offset: logs.len() as i64,
                    ..filters.clone()
                })
                .await?;
            total = page.total;
            if page.logs.is_empty() {
                break;
            }
            logs.extend(page.logs);
            if logs.len() as i64 >= total {
                break;
            }
        }
        tracing::debug!(
            organization_id = %connection.organization_id(),
            rows = logs.len(),
            total,
            "Audit export assembled"
        );

        match format {
            ExportFormat::Json => {
                let body = serde_json::json!({
                    "data": logs,
                    "metadata": {
                        "total": total,
                        "exported_at": Utc::now(),
                        "filters": filters,
                    }
                });
                serde_json::to_string_pretty(&body)
                    .map_err(|e| TenancyError::Store(anyhow::anyhow!("JSON export failed: {}", e)))
            }
            ExportFormat::Csv => render_csv(&logs),
        }
    }

    pub fn pending(&self) -> usize {
        self.inner.queue().len()
    }

    pub fn stats(&self) -> AuditStats {
        AuditStats {
            pending: self.pending(),
            flushed: self.inner.flushed.load(Ordering::Relaxed),
            failed_batches: self.inner.failed_batches.load(Ordering::Relaxed),
        }
    }

    /// Stop the flush task and drain everything still queued.
    pub async fn shutdown(&self) -> Result<usize, TenancyError> {
        tracing::info!(pending = self.pending(), "Shutting down audit logger");
        self.inner.shutdown_token.cancel();

        let worker = self
            .inner
            .worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = worker {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Audit flush task ended abnormally");
            }
        }

        let mut last_err = None;
        for attempt in 1..=SHUTDOWN_FLUSH_ATTEMPTS {
            match self.flush().await {
                Ok(written) => return Ok(written),
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "Final audit flush failed");
                    last_err = Some(e);
                }
            }
        }

        tracing::error!(
            pending = self.pending(),
            "Audit events remain queued after shutdown"
        );
        Err(last_err.unwrap_or_else(|| TenancyError::Durability("flush failed".to_string())))
    }
}

fn render_csv(logs: &[AuditLog]) -> Result<String, TenancyError> {
    let csv_err = |e: csv::Error| TenancyError::Store(anyhow::anyhow!("CSV export failed: {}", e));

    let mut wtr = csv::Writer::from_writer(Vec::new());
    wtr.write_record(CSV_HEADERS).map_err(csv_err)?;

    for log in logs {
        let created_at = log.created_at.to_rfc3339();
        wtr.write_record([
            log.id.to_string().as_str(),
            created_at.as_str(),
            log.organization_id.as_deref().unwrap_or(""),
            log.actor_id.as_deref().unwrap_or(""),
            log.actor_type.as_str(),
            log.action.as_str(),
            log.resource_type.as_str(),
            log.resource_id.as_deref().unwrap_or(""),
            log.resource_name.as_deref().unwrap_or(""),
            log.result.as_str(),
            log.error_message.as_deref().unwrap_or(""),
            log.ip_address.as_deref().unwrap_or(""),
            log.user_agent.as_deref().unwrap_or(""),
        ])
        .map_err(csv_err)?;
    }

    let bytes = wtr
        .into_inner()
        .map_err(|e| TenancyError::Store(anyhow::anyhow!("CSV export failed: {}", e)))?;
    String::from_utf8(bytes)
        .map_err(|e| TenancyError::Store(anyhow::anyhow!("CSV export failed: {}", e)))
}
