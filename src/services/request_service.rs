// Privacy Request Service
//
// Entry point for callers. Plans a request against the current dataset
// graph, runs it either in memory or through the checkpoint store, and turns
// the final node states into a RequestOutcome.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::models::{
    CollectionAddress, CollectionRows, Dataset, ExecutionPlan, Identity, Policy, PrivacyRequest, RequestStatus,
};
use crate::services::connection_pool::ConnectionPoolManager;
use crate::services::connector::{ConnectionConfig, ConnectorRegistry};
use crate::services::execution::{
    persist_plan, resume_plan, CancelFlag, CheckpointLedger, ExecutionManifest, ExecutionOptions, ExecutionReport,
    GraphExecutor, InMemoryLedger,
};
use crate::services::graph::TraversalPlanner;
use crate::services::graph_cache::{GraphCache, SchemaGeneration};
use crate::services::manual_task_service::ManualTaskService;
use crate::services::result_filter::{filter_results_by_rule, FieldCategoryIndex};
use crate::storage::SqliteStorage;

/// What a caller gets back once a run ends
#[derive(Debug, Clone, Serialize)]
pub struct RequestOutcome {
    pub request_id: String,
    pub status: RequestStatus,
    /// Raw rows per collection whose access completed
    pub access_results: CollectionRows,
    /// Access results filtered once per access rule, keyed by rule key
    pub filtered_results: BTreeMap<String, CollectionRows>,
    pub rows_masked: BTreeMap<CollectionAddress, usize>,
    pub manifest: ExecutionManifest,
}

impl RequestOutcome {
    fn from_report(request: &PrivacyRequest, plan: &ExecutionPlan, report: &ExecutionReport) -> Self {
        let index = FieldCategoryIndex::from_plan(plan);
        let access_results = report.access_results();
        let filtered_results = filter_results_by_rule(&access_results, &request.policy, &index);
        Self {
            request_id: request.id.clone(),
            status: report.status(),
            access_results,
            filtered_results,
            rows_masked: report.rows_masked(),
            manifest: report.manifest(),
        }
    }
}

pub struct PrivacyRequestService {
    storage: Arc<SqliteStorage>,
    graph_cache: Arc<GraphCache>,
    manual_tasks: Arc<ManualTaskService>,
    executor: GraphExecutor,
    /// Lock owner id of this service instance
    owner: String,
    lock_stale_after: Duration,
    cancel_flags: Mutex<HashMap<String, CancelFlag>>,
}

impl PrivacyRequestService {
    pub fn new(
        storage: Arc<SqliteStorage>,
        manual_tasks: Arc<ManualTaskService>,
        registry: ConnectorRegistry,
        options: ExecutionOptions,
    ) -> Self {
        Self {
            storage,
            graph_cache: Arc::new(GraphCache::default()),
            manual_tasks,
            executor: GraphExecutor::new(registry, options),
            owner: uuid::Uuid::new_v4().to_string(),
            lock_stale_after: Duration::from_secs(3600),
            cancel_flags: Mutex::new(HashMap::new()),
        }
    }

    /// Open storage and build every configured connector
    pub async fn from_config(config: &EngineConfig, connections: &[ConnectionConfig]) -> Result<Self> {
        let storage = Arc::new(SqliteStorage::new(&config.storage.url).await?);
        let manual_tasks = Arc::new(ManualTaskService::new(Arc::clone(&storage)));
        let pools = Arc::new(ConnectionPoolManager::new());
        let registry = ConnectorRegistry::from_configs(connections, pools, Some(Arc::clone(&manual_tasks))).await?;
        tracing::info!(
            "Privacy request service ready with {} connectors (storage: {})",
            registry.len(),
            config.storage.url
        );
        Ok(Self::new(storage, manual_tasks, registry, config.execution_options())
            .with_graph_cache(Arc::new(GraphCache::new(config.execution.graph_cache_entries)))
            .with_lock_stale_after(config.lock_stale_after()))
    }

    /// Share a graph cache with other services
    pub fn with_graph_cache(mut self, cache: Arc<GraphCache>) -> Self {
        self.graph_cache = cache;
        self
    }

    pub fn with_lock_stale_after(mut self, stale_after: Duration) -> Self {
        self.lock_stale_after = stale_after;
        self
    }

    pub fn graph_cache(&self) -> &Arc<GraphCache> {
        &self.graph_cache
    }

    pub fn manual_tasks(&self) -> &Arc<ManualTaskService> {
        &self.manual_tasks
    }

    /// Plan a traversal for `identity` over the graph of `generation`
    pub fn plan(&self, generation: &SchemaGeneration, datasets: &[Dataset], identity: &Identity) -> Result<ExecutionPlan> {
        validate_identity(identity)?;
        let graph = self.graph_cache.get_or_build(generation, datasets)?;
        TraversalPlanner::new(&graph).plan(identity)
    }

    /// Plan and run a request without touching the checkpoint store
    pub async fn run_in_memory(
        &self,
        generation: &SchemaGeneration,
        datasets: &[Dataset],
        policy: Policy,
        identity: Identity,
    ) -> Result<RequestOutcome> {
        policy.validate()?;
        let plan = self.plan(generation, datasets, &identity)?;
        let request = PrivacyRequest::new(policy, identity);
        tracing::info!("Running request {} in memory over {} collections", request.id, plan.len());

        let report = self
            .executor
            .execute(&request, &plan, &InMemoryLedger::new(), &CancelFlag::new())
            .await?;
        let outcome = RequestOutcome::from_report(&request, &plan, &report);
        tracing::info!("Request {} finished with status {}", request.id, outcome.status.as_str());
        Ok(outcome)
    }

    /// Plan a request and persist it with its task graph; nothing runs yet
    pub async fn submit(
        &self,
        generation: &SchemaGeneration,
        datasets: &[Dataset],
        policy: Policy,
        identity: Identity,
    ) -> Result<PrivacyRequest> {
        policy.validate()?;
        let plan = self.plan(generation, datasets, &identity)?;
        let request = PrivacyRequest::new(policy, identity);
        self.storage.save_request(&request).await?;
        persist_plan(&self.storage, &request, &plan).await?;
        tracing::info!("Submitted request {} (policy {})", request.id, request.policy.key);
        Ok(request)
    }

    pub async fn get_request(&self, request_id: &str) -> Result<PrivacyRequest> {
        self.storage
            .get_request(request_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("Privacy request {}", request_id)))
    }

    /// The persisted plan of a submitted request
    pub async fn resume_plan(&self, request_id: &str) -> Result<ExecutionPlan> {
        resume_plan(&self.storage, request_id).await
    }

    /// Run (or resume) a submitted request under its single-writer lock
    pub async fn execute(&self, request_id: &str) -> Result<RequestOutcome> {
        if !self
            .storage
            .try_acquire_lock(request_id, &self.owner, self.lock_stale_after)
            .await?
        {
            tracing::warn!("Request {} is already executing elsewhere", request_id);
            return Err(EngineError::AlreadyExecuting(request_id.to_string()));
        }
        tracing::info!("Acquired execution lock for request {}", request_id);

        let cancel = CancelFlag::new();
        self.flags().insert(request_id.to_string(), cancel.clone());
        let result = self.execute_locked(request_id, &cancel).await;
        self.flags().remove(request_id);

        match self.storage.release_lock(request_id, &self.owner).await {
            Ok(true) => tracing::info!("Released execution lock for request {}", request_id),
            Ok(false) => tracing::warn!("Execution lock for request {} was no longer ours", request_id),
            Err(e) => tracing::error!("Failed to release execution lock for request {}: {}", request_id, e),
        }
        result
    }

    async fn execute_locked(&self, request_id: &str, cancel: &CancelFlag) -> Result<RequestOutcome> {
        let mut request = self.get_request(request_id).await?;
        if request.status == RequestStatus::Canceled
            || !self
                .storage
                .update_request_status_unless_canceled(request_id, RequestStatus::InProcessing)
                .await?
        {
            return Err(EngineError::Canceled(request_id.to_string()));
        }

        let plan = resume_plan(&self.storage, request_id).await?;
        let ledger = CheckpointLedger::new(
            Arc::clone(&self.storage),
            request_id,
            self.executor.options().max_task_attempts,
        )
        .with_lock_owner(self.owner.as_str());
        let report = match self.executor.execute(&request, &plan, &ledger, cancel).await {
            Ok(report) => report,
            // The new lock holder owns the request status now
            Err(e @ EngineError::AlreadyExecuting(_)) => return Err(e),
            Err(e) => {
                tracing::error!("Execution of request {} failed: {}", request_id, e);
                if let Err(status_err) = self
                    .storage
                    .update_request_status_unless_canceled(request_id, RequestStatus::Error)
                    .await
                {
                    tracing::error!("Could not mark request {} as errored: {}", request_id, status_err);
                }
                return Err(e);
            }
        };

        request.status = report.status();
        if !self
            .storage
            .update_request_status_unless_canceled(request_id, request.status)
            .await?
        {
            tracing::info!("Request {} was canceled while running", request_id);
            request.status = RequestStatus::Canceled;
        }
        tracing::info!("Request {} finished with status {}", request_id, request.status.as_str());
        let mut outcome = RequestOutcome::from_report(&request, &plan, &report);
        outcome.status = request.status;
        Ok(outcome)
    }

    /// Persist `canceled` and stop a run of this request in this process
    pub async fn cancel(&self, request_id: &str) -> Result<()> {
        let request = self.get_request(request_id).await?;
        if request.status == RequestStatus::Complete {
            return Err(EngineError::InvalidTransition {
                from: request.status.as_str().to_string(),
                to: RequestStatus::Canceled.as_str().to_string(),
            });
        }
        self.storage
            .update_request_status(request_id, RequestStatus::Canceled)
            .await?;
        if let Some(flag) = self.flags().get(request_id) {
            flag.cancel();
        }
        tracing::warn!("Request {} canceled", request_id);
        Ok(())
    }

    fn flags(&self) -> MutexGuard<'_, HashMap<String, CancelFlag>> {
        self.cancel_flags.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn validate_identity(identity: &Identity) -> Result<()> {
    if identity.is_empty() {
        return Err(EngineError::Validation("Identity has no values".to_string()));
    }
    if let Some((kind, _)) = identity.iter().find(|(_, v)| v.is_null()) {
        return Err(EngineError::Validation(format!("Identity '{}' has no value", kind)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DataType, Field, ManualTaskField, MaskingStrategy, Rule, TaskStatus};
    use crate::error::ConnectorError;
    use crate::models::ActionType;
    use crate::services::connector::{
        Connector, ConnectorType, FetchOutcome, FetchRequest, ManualTaskConnector, MaskOutcome, MaskRequest,
        SqliteConnector,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use crate::services::execution::RetryPolicy;
    use crate::services::graph::builder::tests::{collection, crm_and_billing, dataset};
    use serde_json::json;

    fn identity() -> Identity {
        Identity::from([("email".to_string(), json!("a@example.com"))])
    }

    fn options() -> ExecutionOptions {
        ExecutionOptions {
            max_concurrency: 4,
            max_task_attempts: 3,
            retry: RetryPolicy::none(),
        }
    }

    async fn crm_connector() -> SqliteConnector {
        let crm = SqliteConnector::in_memory().unwrap();
        crm.execute_batch(
            "CREATE TABLE customers (id INTEGER PRIMARY KEY, email TEXT, name TEXT);
             INSERT INTO customers VALUES (1, 'a@example.com', 'Ada');",
        )
        .await
        .unwrap();
        crm
    }

    async fn billing_connector() -> SqliteConnector {
        let billing = SqliteConnector::in_memory().unwrap();
        billing
            .execute_batch(
                "CREATE TABLE invoices (id INTEGER PRIMARY KEY, customer_email TEXT, amount REAL);
                 INSERT INTO invoices VALUES (10, 'a@example.com', 12.5);
                 INSERT INTO invoices VALUES (11, 'b@example.com', 99.0);",
            )
            .await
            .unwrap();
        billing
    }

    async fn crm_and_billing_registry() -> ConnectorRegistry {
        let mut registry = ConnectorRegistry::new();
        registry.register("crm", Arc::new(crm_connector().await));
        registry.register("billing", Arc::new(billing_connector().await));
        registry
    }

    /// What a wrapped connector does before each fetch
    enum Interference {
        None,
        FailFirst(usize),
        CancelVia(Arc<PrivacyRequestService>),
        StealLock(Arc<SqliteStorage>),
    }

    /// Counts fetches and interferes with the run before delegating
    struct WrappedConnector {
        inner: SqliteConnector,
        fetches: Arc<AtomicUsize>,
        interference: Interference,
    }

    impl WrappedConnector {
        fn new(inner: SqliteConnector, interference: Interference) -> (Arc<Self>, Arc<AtomicUsize>) {
            let fetches = Arc::new(AtomicUsize::new(0));
            let connector = Arc::new(Self {
                inner,
                fetches: Arc::clone(&fetches),
                interference,
            });
            (connector, fetches)
        }
    }

    #[async_trait::async_trait]
    impl Connector for WrappedConnector {
        fn connector_type(&self) -> ConnectorType {
            ConnectorType::Sqlite
        }

        async fn fetch_rows(&self, request: &FetchRequest) -> std::result::Result<FetchOutcome, ConnectorError> {
            let count = self.fetches.fetch_add(1, Ordering::SeqCst) + 1;
            match &self.interference {
                Interference::None => {}
                Interference::FailFirst(n) => {
                    if count <= *n {
                        return Err(ConnectorError::from_status(401, "bad token", None));
                    }
                }
                Interference::CancelVia(other) => other.cancel(&request.request_id).await.unwrap(),
                Interference::StealLock(storage) => {
                    assert!(storage
                        .try_acquire_lock(&request.request_id, "other-worker", Duration::ZERO)
                        .await
                        .unwrap());
                }
            }
            self.inner.fetch_rows(request).await
        }

        async fn mask_rows(&self, request: &MaskRequest) -> std::result::Result<MaskOutcome, ConnectorError> {
            self.inner.mask_rows(request).await
        }

        async fn test_connection(&self) -> std::result::Result<(), ConnectorError> {
            self.inner.test_connection().await
        }
    }

    /// Registry whose crm connector interferes; returns both fetch counters
    async fn wrapped_registry(crm: Interference) -> (ConnectorRegistry, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let (crm, crm_fetches) = WrappedConnector::new(crm_connector().await, crm);
        let (billing, billing_fetches) = WrappedConnector::new(billing_connector().await, Interference::None);
        let mut registry = ConnectorRegistry::new();
        registry.register("crm", crm);
        registry.register("billing", billing);
        (registry, crm_fetches, billing_fetches)
    }

    async fn service() -> PrivacyRequestService {
        let storage = Arc::new(SqliteStorage::in_memory().await.unwrap());
        let manual_tasks = Arc::new(ManualTaskService::new(Arc::clone(&storage)));
        PrivacyRequestService::new(storage, manual_tasks, crm_and_billing_registry().await, options())
    }

    fn access_all() -> Policy {
        Policy::new("access", vec![Rule::access("all", ["user"])])
    }

    #[tokio::test]
    async fn test_run_in_memory_filters_financial_fields() {
        let service = service().await;
        let policy = Policy::new("finance", vec![Rule::access("financial", ["user.financial"])]);
        let outcome = service
            .run_in_memory(&SchemaGeneration::new("v1"), &crm_and_billing(), policy, identity())
            .await
            .unwrap();

        let customers = CollectionAddress::new("crm", "customers");
        let invoices = CollectionAddress::new("billing", "invoices");
        assert_eq!(outcome.status, RequestStatus::Complete);
        assert_eq!(outcome.access_results[&customers][0]["name"], json!("Ada"));
        assert_eq!(outcome.access_results[&invoices].len(), 1);

        let financial = &outcome.filtered_results["financial"];
        assert!(!financial.contains_key(&customers));
        assert_eq!(financial[&invoices], vec![json!({"amount": 12.5}).as_object().unwrap().clone()]);
        assert_eq!(outcome.manifest.completed.len(), 2);
    }

    #[tokio::test]
    async fn test_plan_reuses_cached_graph() {
        let service = service().await;
        let generation = SchemaGeneration::new("v1");
        let first = service.plan(&generation, &crm_and_billing(), &identity()).unwrap();
        // A cached generation is not rebuilt from the datasets passed in
        let second = service.plan(&generation, &[], &identity()).unwrap();
        assert_eq!(first, second);
        assert_eq!(service.graph_cache().size(), 1);
    }

    #[tokio::test]
    async fn test_submit_rejects_empty_identity() {
        let service = service().await;
        let result = service
            .submit(&SchemaGeneration::new("v1"), &crm_and_billing(), access_all(), Identity::new())
            .await;
        assert!(matches!(result, Err(EngineError::Validation(_))));
    }

    #[tokio::test]
    async fn test_submit_then_execute_checkpoints_every_task() {
        let service = service().await;
        let generation = SchemaGeneration::new("v1");
        let request = service
            .submit(&generation, &crm_and_billing(), access_all(), identity())
            .await
            .unwrap();
        assert_eq!(request.status, RequestStatus::Pending);
        assert_eq!(
            service.resume_plan(&request.id).await.unwrap(),
            service.plan(&generation, &crm_and_billing(), &identity()).unwrap()
        );

        let outcome = service.execute(&request.id).await.unwrap();
        assert_eq!(outcome.status, RequestStatus::Complete);
        assert_eq!(
            service.get_request(&request.id).await.unwrap().status,
            RequestStatus::Complete
        );
        let tasks = service
            .storage
            .get_tasks(&request.id, ActionType::Access)
            .await
            .unwrap();
        assert!(tasks.iter().all(|t| t.status == TaskStatus::Complete && t.attempts == 1));

        // Completed tasks are not re-run; their stored rows come back as-is
        let again = service.execute(&request.id).await.unwrap();
        assert_eq!(again.access_results, outcome.access_results);
        let tasks = service
            .storage
            .get_tasks(&request.id, ActionType::Access)
            .await
            .unwrap();
        assert!(tasks.iter().all(|t| t.attempts == 1));
    }

    #[tokio::test]
    async fn test_erasure_masks_matching_fields() {
        let service = service().await;
        let policy = Policy::new(
            "erase",
            vec![
                Rule::access("all", ["user"]),
                Rule::erasure("names", ["user.name"], MaskingStrategy::NullRewrite),
            ],
        );
        let request = service
            .submit(&SchemaGeneration::new("v1"), &crm_and_billing(), policy, identity())
            .await
            .unwrap();
        let outcome = service.execute(&request.id).await.unwrap();
        assert_eq!(outcome.status, RequestStatus::Complete);
        assert_eq!(outcome.rows_masked[&CollectionAddress::new("crm", "customers")], 1);
        // No erasure target matched on invoices
        assert!(!outcome.rows_masked.contains_key(&CollectionAddress::new("billing", "invoices")));
    }

    #[tokio::test]
    async fn test_execute_refuses_while_locked() {
        let service = service().await;
        let request = service
            .submit(&SchemaGeneration::new("v1"), &crm_and_billing(), access_all(), identity())
            .await
            .unwrap();
        assert!(service
            .storage
            .try_acquire_lock(&request.id, "other-worker", Duration::from_secs(600))
            .await
            .unwrap());

        let result = service.execute(&request.id).await;
        assert!(matches!(result, Err(EngineError::AlreadyExecuting(_))));

        service.storage.release_lock(&request.id, "other-worker").await.unwrap();
        assert!(service.execute(&request.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_canceled_request_does_not_run() {
        let service = service().await;
        let request = service
            .submit(&SchemaGeneration::new("v1"), &crm_and_billing(), access_all(), identity())
            .await
            .unwrap();
        service.cancel(&request.id).await.unwrap();
        assert_eq!(
            service.get_request(&request.id).await.unwrap().status,
            RequestStatus::Canceled
        );

        let result = service.execute(&request.id).await;
        assert!(matches!(result, Err(EngineError::Canceled(_))));
        // The lock went away with the failed run
        assert!(service
            .storage
            .try_acquire_lock(&request.id, "other-worker", Duration::from_secs(600))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_cancel_unknown_request() {
        let service = service().await;
        assert!(matches!(service.cancel("missing").await, Err(EngineError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_manual_task_suspends_and_resumes() {
        let storage = Arc::new(SqliteStorage::in_memory().await.unwrap());
        let manual_tasks = Arc::new(ManualTaskService::new(Arc::clone(&storage)));
        let mut registry = crm_and_billing_registry().await;
        registry.register("paper", Arc::new(ManualTaskConnector::new(Arc::clone(&manual_tasks))));
        let service = PrivacyRequestService::new(storage, Arc::clone(&manual_tasks), registry, options());

        let records = CollectionAddress::new("paper", "records");
        manual_tasks
            .save_config(
                &records,
                vec![ManualTaskField {
                    key: "box".to_string(),
                    label: "Archive box".to_string(),
                    required: true,
                }],
            )
            .await
            .unwrap();

        let mut datasets = crm_and_billing();
        datasets.push(dataset(
            "paper",
            vec![collection(
                "records",
                vec![
                    Field::leaf("email", DataType::String).with_identity("email"),
                    Field::leaf("box", DataType::String).with_categories(["user.records"]),
                ],
            )],
        ));
        let request = service
            .submit(&SchemaGeneration::new("v1"), &datasets, access_all(), identity())
            .await
            .unwrap();

        let suspended = service.execute(&request.id).await.unwrap();
        assert_eq!(suspended.status, RequestStatus::RequiresInput);
        assert_eq!(suspended.manifest.completed.len(), 2);
        let awaiting = &suspended.manifest.awaiting_input[0];
        assert_eq!(awaiting.collection, records);
        let task_id = awaiting.task.as_ref().unwrap().task_id.clone();

        manual_tasks.submit(&task_id, "box", json!("B-12")).await.unwrap();
        manual_tasks.complete(&task_id).await.unwrap();

        let resumed = service.execute(&request.id).await.unwrap();
        assert_eq!(resumed.status, RequestStatus::Complete);
        assert_eq!(resumed.access_results[&records][0]["box"], json!("B-12"));
    }

    #[tokio::test]
    async fn test_retry_after_failure_runs_skipped_descendants() {
        let storage = Arc::new(SqliteStorage::in_memory().await.unwrap());
        let manual_tasks = Arc::new(ManualTaskService::new(Arc::clone(&storage)));
        let (registry, crm_fetches, billing_fetches) = wrapped_registry(Interference::FailFirst(1)).await;
        let service = PrivacyRequestService::new(Arc::clone(&storage), manual_tasks, registry, options());
        let invoices = CollectionAddress::new("billing", "invoices");

        let request = service
            .submit(&SchemaGeneration::new("v1"), &crm_and_billing(), access_all(), identity())
            .await
            .unwrap();
        let failed = service.execute(&request.id).await.unwrap();
        assert_eq!(failed.status, RequestStatus::Error);
        assert_eq!(failed.manifest.skipped[0].collection, invoices);
        assert_eq!(billing_fetches.load(Ordering::SeqCst), 0);

        let retried = service.execute(&request.id).await.unwrap();
        assert_eq!(retried.status, RequestStatus::Complete);
        assert_eq!(crm_fetches.load(Ordering::SeqCst), 2);
        assert_eq!(billing_fetches.load(Ordering::SeqCst), 1);
        assert_eq!(retried.access_results[&invoices].len(), 1);
        let tasks = storage.get_tasks(&request.id, ActionType::Access).await.unwrap();
        assert!(tasks.iter().all(|t| t.status == TaskStatus::Complete));

        // Same rows as a run that never failed
        let healthy = self::service().await;
        let in_memory = healthy
            .run_in_memory(&SchemaGeneration::new("v1"), &crm_and_billing(), access_all(), identity())
            .await
            .unwrap();
        assert_eq!(retried.access_results, in_memory.access_results);
    }

    #[tokio::test]
    async fn test_cancel_from_another_instance_stops_run() {
        let storage = Arc::new(SqliteStorage::in_memory().await.unwrap());
        let manual_tasks = Arc::new(ManualTaskService::new(Arc::clone(&storage)));
        let other = Arc::new(PrivacyRequestService::new(
            Arc::clone(&storage),
            Arc::clone(&manual_tasks),
            ConnectorRegistry::new(),
            options(),
        ));
        let (registry, crm_fetches, billing_fetches) = wrapped_registry(Interference::CancelVia(other)).await;
        let service = PrivacyRequestService::new(Arc::clone(&storage), manual_tasks, registry, options());

        let request = service
            .submit(&SchemaGeneration::new("v1"), &crm_and_billing(), access_all(), identity())
            .await
            .unwrap();
        let outcome = service.execute(&request.id).await.unwrap();

        assert_eq!(outcome.status, RequestStatus::Canceled);
        assert_eq!(crm_fetches.load(Ordering::SeqCst), 1);
        assert_eq!(billing_fetches.load(Ordering::SeqCst), 0);
        assert!(!outcome
            .access_results
            .contains_key(&CollectionAddress::new("billing", "invoices")));
        assert_eq!(outcome.manifest.pending.len(), 1);
        assert_eq!(
            service.get_request(&request.id).await.unwrap().status,
            RequestStatus::Canceled
        );
    }

    #[tokio::test]
    async fn test_run_stops_when_lock_is_taken_over() {
        let storage = Arc::new(SqliteStorage::in_memory().await.unwrap());
        let manual_tasks = Arc::new(ManualTaskService::new(Arc::clone(&storage)));
        let (registry, _, billing_fetches) =
            wrapped_registry(Interference::StealLock(Arc::clone(&storage))).await;
        let service = PrivacyRequestService::new(Arc::clone(&storage), manual_tasks, registry, options());

        let request = service
            .submit(&SchemaGeneration::new("v1"), &crm_and_billing(), access_all(), identity())
            .await
            .unwrap();
        let result = service.execute(&request.id).await;

        assert!(matches!(result, Err(EngineError::AlreadyExecuting(_))));
        assert_eq!(billing_fetches.load(Ordering::SeqCst), 0);
        // The status is left to the new holder, whose lock survives
        assert_eq!(
            service.get_request(&request.id).await.unwrap().status,
            RequestStatus::InProcessing
        );
        assert!(!storage
            .try_acquire_lock(&request.id, "third-worker", Duration::from_secs(600))
            .await
            .unwrap());
    }
}
