//! # Request Batching
//!
//! Single-product lookups (`products/{id}`) and small `include=` lists that
//! arrive close together are coalesced into one `GET wc/v3/products?include=…`
//! call. Each caller gets back only its own entities.
//!
//! Windows are keyed by the request's non-identifier parameters, so members
//! only share a call when they asked for the same projection. The timer is
//! armed once, at the first arrival, and never pushed back; a window that is
//! full, or that a newcomer would overflow, flushes immediately.
//!
//! Lock order is map, then window. Flushes run in spawned tasks so a caller
//! that goes away never cancels a call other members are waiting on.

use super::window::{BatchMember, BatchWindow, FlushBatch, PendingMember};
use crate::caching::key_generator::canonical_query;
use crate::core::config::BatchingSettings;
use crate::core::error::{ProxyError, ProxyResult};
use crate::observability::metrics;
use crate::upstream::{
    FallbackRoute, FetchSource, FetchedBody, NormalizeKind, ResolvedEndpoint, ResponseShape,
    RetryPolicy, UpstreamFetcher, UpstreamRequest,
};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Parameters that change which page of results comes back; requests
/// carrying them are never batched
const PAGINATION_PARAMS: &[&str] = &["page", "per_page", "offset", "orderby", "order"];

/// WooCommerce caps `per_page` at 100
const MAX_PER_PAGE: usize = 100;

/// How a request joins a batch
#[derive(Debug, Clone, PartialEq)]
pub struct BatchPlan {
    pub group_key: String,
    pub shared_params: Vec<(String, String)>,
    pub member: BatchMember,
}

/// Decide whether a read can be batched, and with whom
pub fn plan_batch(
    endpoint: &ResolvedEndpoint,
    params: &[(String, String)],
    max_size: usize,
) -> Option<BatchPlan> {
    if !endpoint.batchable {
        return None;
    }

    let mut shared: Vec<(String, String)> = Vec::with_capacity(params.len());
    let mut include = None;
    for (name, value) in params {
        if name == "include" {
            include = Some(value.as_str());
        } else {
            shared.push((name.clone(), value.clone()));
        }
    }

    if shared.iter().any(|(name, _)| PAGINATION_PARAMS.contains(&name.as_str())) {
        return None;
    }

    // Demultiplexing matches on `id`, so a projection has to keep it
    if let Some((_, fields)) = shared.iter().find(|(name, _)| name == "_fields") {
        if !fields.split(',').any(|f| f.trim() == "id") {
            return None;
        }
    }

    let member = match (endpoint.entity_id, include) {
        (Some(id), None) => BatchMember::Single(id),
        (None, Some(list)) => {
            let mut ids: Vec<u64> = Vec::new();
            for raw in list.split(',') {
                let id = raw.trim().parse::<u64>().ok().filter(|id| *id > 0)?;
                if !ids.contains(&id) {
                    ids.push(id);
                }
            }
            if ids.is_empty() || ids.len() > max_size.min(MAX_PER_PAGE) {
                return None;
            }
            BatchMember::Multiple(ids)
        }
        _ => return None,
    };

    shared.sort();
    Some(BatchPlan {
        group_key: format!("products?{}", canonical_query(&shared)),
        shared_params: shared,
        member,
    })
}

/// Performs the coalesced upstream call
#[async_trait]
pub trait BatchExecutor: Send + Sync {
    async fn fetch_batch(
        &self,
        shared_params: &[(String, String)],
        ids: &[u64],
    ) -> ProxyResult<FetchedBody>;
}

/// Batch executor going through the retrying fetcher
pub struct UpstreamBatchExecutor {
    fetcher: Arc<UpstreamFetcher>,
    policy: RetryPolicy,
    timeout: Duration,
    fallback_enabled: bool,
}

impl UpstreamBatchExecutor {
    pub fn new(
        fetcher: Arc<UpstreamFetcher>,
        policy: RetryPolicy,
        timeout: Duration,
        fallback_enabled: bool,
    ) -> Self {
        Self {
            fetcher,
            policy,
            timeout,
            fallback_enabled,
        }
    }
}

#[async_trait]
impl BatchExecutor for UpstreamBatchExecutor {
    async fn fetch_batch(
        &self,
        shared_params: &[(String, String)],
        ids: &[u64],
    ) -> ProxyResult<FetchedBody> {
        let include = ids.iter().map(u64::to_string).collect::<Vec<_>>().join(",");
        let mut query = shared_params.to_vec();
        query.push(("include".to_string(), include));
        query.push(("per_page".to_string(), ids.len().min(MAX_PER_PAGE).to_string()));

        let request = UpstreamRequest::get("products", "wc/v3/products", self.timeout)
            .with_query(query.clone())
            .expecting(ResponseShape::List);
        let fallback = FallbackRoute {
            path: "wc/store/v1/products".to_string(),
            query,
            kind: NormalizeKind::Product,
        };

        self.fetcher
            .fetch_with_retry(&request, &self.policy, self.fallback_enabled.then_some(&fallback))
            .await
    }
}

struct BatcherInner {
    executor: Arc<dyn BatchExecutor>,
    max_size: usize,
    max_wait: Duration,
    windows: Mutex<HashMap<String, Arc<BatchWindow>>>,
}

impl BatcherInner {
    /// Remove a window from the map unless a newer one has replaced it
    fn detach(&self, window: &Arc<BatchWindow>) {
        let mut windows = self.windows.lock();
        if windows
            .get(window.group_key())
            .map_or(false, |current| Arc::ptr_eq(current, window))
        {
            windows.remove(window.group_key());
        }
    }
}

/// Coalesces batchable reads into shared upstream calls
#[derive(Clone)]
pub struct RequestBatcher {
    inner: Arc<BatcherInner>,
}

impl RequestBatcher {
    pub fn new(executor: Arc<dyn BatchExecutor>, settings: &BatchingSettings) -> Self {
        Self {
            inner: Arc::new(BatcherInner {
                executor,
                max_size: settings.max_size.max(1),
                max_wait: settings.max_wait,
                windows: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn max_size(&self) -> usize {
        self.inner.max_size
    }

    /// Windows currently accepting members
    pub fn open_windows(&self) -> usize {
        self.inner.windows.lock().len()
    }

    /// Join (or open) the window for `plan` and wait for this member's result
    pub async fn submit(&self, plan: BatchPlan) -> ProxyResult<FetchedBody> {
        let (reply, rx) = oneshot::channel();
        let pending = PendingMember {
            member: plan.member,
            reply,
        };

        let mut flush_now: Vec<(Arc<BatchWindow>, &'static str)> = Vec::new();
        let mut opened = None;
        {
            let mut windows = self.inner.windows.lock();
            let existing = windows.get(&plan.group_key).cloned();

            let pending = match existing {
                Some(window) => match window.try_add(pending) {
                    Ok(full) => {
                        if full {
                            windows.remove(&plan.group_key);
                            flush_now.push((window, "size"));
                        }
                        None
                    }
                    Err(returned) => {
                        windows.remove(&plan.group_key);
                        if window.is_open() {
                            flush_now.push((window, "overflow"));
                        }
                        Some(returned)
                    }
                },
                None => Some(pending),
            };

            if let Some(pending) = pending {
                let (window, full) = BatchWindow::open(
                    plan.group_key.clone(),
                    plan.shared_params,
                    self.inner.max_size,
                    pending,
                );
                let window = Arc::new(window);
                if full {
                    flush_now.push((window, "size"));
                } else {
                    windows.insert(plan.group_key.clone(), window.clone());
                    opened = Some(window);
                }
            }
        }

        for (window, trigger) in flush_now {
            flush(&self.inner, &window, trigger);
        }

        if let Some(window) = opened {
            let inner = self.inner.clone();
            tokio::spawn(async move {
                tokio::time::sleep(inner.max_wait).await;
                flush(&inner, &window, "timer");
            });
        }

        rx.await
            .map_err(|_| ProxyError::internal("batch flush ended without a result"))?
    }
}

/// Claim the window's flush and run it in the background
fn flush(inner: &Arc<BatcherInner>, window: &Arc<BatchWindow>, trigger: &'static str) {
    let Some(batch) = window.try_begin_flush() else {
        return;
    };
    inner.detach(window);

    let executor = inner.executor.clone();
    let window = window.clone();
    tokio::spawn(async move {
        run_flush(executor.as_ref(), batch, trigger).await;
        window.close();
    });
}

async fn run_flush(executor: &dyn BatchExecutor, batch: FlushBatch, trigger: &'static str) {
    metrics::record_batch_flush(trigger, batch.ids.len());
    debug!(
        group = %batch.group_key,
        ids = batch.ids.len(),
        members = batch.members.len(),
        waited_ms = batch.waited.as_millis() as u64,
        trigger,
        "Flushing batch"
    );

    let result = executor.fetch_batch(&batch.shared_params, &batch.ids).await;

    match result {
        Err(e) => {
            for pending in batch.members {
                let _ = pending.reply.send(Err(e.clone()));
            }
        }
        Ok(body) => {
            let entities = if body.is_success() && !body.degraded {
                index_by_id(&body)
            } else {
                None
            };

            if entities.is_none() && body.is_success() && !body.degraded {
                warn!(group = %batch.group_key, "Batch response was not a list of entities");
            }

            for pending in batch.members {
                let reply = match &entities {
                    Some(found) => member_result(&pending.member, found, &body),
                    None => Ok(unsplit_result(&pending.member, &body)),
                };
                let _ = pending.reply.send(reply);
            }
        }
    }
}

fn index_by_id(body: &FetchedBody) -> Option<HashMap<u64, Value>> {
    let items: Vec<Value> = serde_json::from_slice(&body.body).ok()?;
    Some(
        items
            .into_iter()
            .filter_map(|item| item.get("id").and_then(Value::as_u64).map(|id| (id, item)))
            .collect(),
    )
}

fn member_result(
    member: &BatchMember,
    found: &HashMap<u64, Value>,
    batch: &FetchedBody,
) -> ProxyResult<FetchedBody> {
    let (payload, total) = match member {
        BatchMember::Single(id) => {
            let entity = found
                .get(id)
                .ok_or_else(|| ProxyError::not_found("products", id.to_string()))?;
            (serde_json::to_vec(entity)?, None)
        }
        BatchMember::Multiple(ids) => {
            let entities: Vec<&Value> = ids.iter().filter_map(|id| found.get(id)).collect();
            let count = entities.len() as u64;
            (serde_json::to_vec(&entities)?, Some(count))
        }
    };

    Ok(FetchedBody {
        status: 200,
        body: Bytes::from(payload),
        source: batch.source,
        attempts: batch.attempts,
        degraded: false,
        total,
        total_pages: total.map(|_| 1),
    })
}

/// Result for members when the batch body can't be split: soft-fail
/// placeholders stay placeholders in the member's shape, pass-through
/// statuses are handed on as they are
fn unsplit_result(member: &BatchMember, batch: &FetchedBody) -> FetchedBody {
    if batch.is_success() {
        let shape = match member {
            BatchMember::Single(_) => ResponseShape::Object,
            BatchMember::Multiple(_) => ResponseShape::List,
        };
        FetchedBody {
            status: 200,
            body: Bytes::from_static(shape.empty_payload().as_bytes()),
            source: batch.source,
            attempts: batch.attempts,
            degraded: true,
            total: None,
            total_pages: None,
        }
    } else {
        FetchedBody {
            source: FetchSource::Primary,
            ..batch.clone()
        }
    }
}
