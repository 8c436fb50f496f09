//! Operator configuration
//!
//! [`OperatorArgs`] is the clap surface (flags with environment fallbacks);
//! [`OperatorConfig`] is the validated value the rest of the crate consumes.

use std::time::Duration;

use clap::Args;

/// Default image repository for scheduler pods
pub const DEFAULT_SCHEDULER_REPOSITORY: &str = "ghcr.io/apache/datafusion-ballista-scheduler";

/// Default image repository for executor pods
pub const DEFAULT_EXECUTOR_REPOSITORY: &str = "ghcr.io/apache/datafusion-ballista-executor";

/// Runtime configuration of the controller
#[derive(Clone, Debug, PartialEq)]
pub struct OperatorConfig {
    /// Repository for scheduler images; tagged with `ballistaVersion`
    pub default_scheduler_repository: String,
    /// Repository for executor images; tagged with `ballistaVersion`
    pub default_executor_repository: String,
    /// Maximum number of clusters reconciled in parallel
    pub concurrency: u16,
    /// Deadline for a single reconciliation run
    pub reconcile_timeout: Duration,
    /// How long the index may be out of sync before queries fail
    pub staleness_window: Duration,
    /// Requeue delay while a cluster is converging
    pub requeue_pending: Duration,
    /// Base delay for error backoff
    pub backoff_base: Duration,
    /// Upper bound for error backoff
    pub backoff_max: Duration,
    /// Attempts per write when the API server reports a conflict
    pub conflict_retries: u32,
    /// Permanent action failures tolerated before reconciliation is suspended
    pub max_action_failures: u32,
    /// Restrict the controller to one namespace; None watches all namespaces
    pub watch_namespace: Option<String>,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            default_scheduler_repository: DEFAULT_SCHEDULER_REPOSITORY.to_string(),
            default_executor_repository: DEFAULT_EXECUTOR_REPOSITORY.to_string(),
            concurrency: 16,
            reconcile_timeout: Duration::from_secs(30),
            staleness_window: Duration::from_secs(60),
            requeue_pending: Duration::from_secs(5),
            backoff_base: Duration::from_secs(5),
            backoff_max: Duration::from_secs(300),
            conflict_retries: 3,
            max_action_failures: 5,
            watch_namespace: None,
        }
    }
}

impl OperatorConfig {
    /// Reject settings the controller cannot run with
    pub fn validate(&self) -> Result<(), crate::Error> {
        let invalid = |msg: &str| Err(crate::Error::internal_with_context("config", msg));

        if self.concurrency == 0 {
            return invalid("concurrency must be at least 1");
        }
        if self.reconcile_timeout.is_zero() {
            return invalid("reconcile timeout must be greater than zero");
        }
        if self.staleness_window.is_zero() {
            return invalid("staleness window must be greater than zero");
        }
        if self.backoff_base.is_zero() {
            return invalid("backoff base must be greater than zero");
        }
        if self.backoff_max < self.backoff_base {
            return invalid("backoff max must not be smaller than backoff base");
        }
        if self.default_scheduler_repository.is_empty()
            || self.default_executor_repository.is_empty()
        {
            return invalid("default image repositories must not be empty");
        }
        Ok(())
    }
}

/// Controller flags
#[derive(Args, Debug, Clone)]
pub struct OperatorArgs {
    /// Image repository used for schedulers without an image override
    #[arg(
        long,
        env = "BALLISTA_SCHEDULER_IMAGE_REPOSITORY",
        default_value = DEFAULT_SCHEDULER_REPOSITORY
    )]
    pub scheduler_image_repository: String,

    /// Image repository used for executors without an image override
    #[arg(
        long,
        env = "BALLISTA_EXECUTOR_IMAGE_REPOSITORY",
        default_value = DEFAULT_EXECUTOR_REPOSITORY
    )]
    pub executor_image_repository: String,

    /// Maximum number of clusters reconciled in parallel
    #[arg(long, env = "BALLISTA_OPERATOR_CONCURRENCY", default_value = "16")]
    pub concurrency: u16,

    /// Deadline for a single reconciliation run, in seconds
    #[arg(long, default_value = "30")]
    pub reconcile_timeout_secs: u64,

    /// How long the pod index may be out of sync before clusters go Unknown
    #[arg(long, default_value = "60")]
    pub staleness_window_secs: u64,

    /// Requeue delay while a cluster is converging, in seconds
    #[arg(long, default_value = "5")]
    pub pending_requeue_secs: u64,

    /// Base delay for error backoff, in seconds
    #[arg(long, default_value = "5")]
    pub backoff_base_secs: u64,

    /// Upper bound for error backoff, in seconds
    #[arg(long, default_value = "300")]
    pub backoff_max_secs: u64,

    /// Attempts per write when the API server reports a conflict
    #[arg(long, default_value = "3")]
    pub conflict_retries: u32,

    /// Permanent action failures tolerated before a cluster is suspended
    #[arg(long, default_value = "5")]
    pub max_action_failures: u32,

    /// Only watch this namespace (default: all namespaces)
    #[arg(long = "namespace", env = "BALLISTA_WATCH_NAMESPACE")]
    pub watch_namespace: Option<String>,
}

impl From<OperatorArgs> for OperatorConfig {
    fn from(args: OperatorArgs) -> Self {
        Self {
            default_scheduler_repository: args.scheduler_image_repository,
            default_executor_repository: args.executor_image_repository,
            concurrency: args.concurrency,
            reconcile_timeout: Duration::from_secs(args.reconcile_timeout_secs),
            staleness_window: Duration::from_secs(args.staleness_window_secs),
            requeue_pending: Duration::from_secs(args.pending_requeue_secs),
            backoff_base: Duration::from_secs(args.backoff_base_secs),
            backoff_max: Duration::from_secs(args.backoff_max_secs),
            conflict_retries: args.conflict_retries,
            max_action_failures: args.max_action_failures,
            watch_namespace: args.watch_namespace.filter(|ns| !ns.is_empty()),
        }
    }
}
