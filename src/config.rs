use clap::Parser;
use std::time::Duration;

#[derive(Parser, Clone, Debug, PartialEq)]
#[command(author, version)]
pub struct ConfigContext {
    #[arg(
        short = 'c',
        long = "connect_url",
        help = "PostgreSQL Connection URL for run history (in-memory when omitted)"
    )]
    pub connect_url: Option<String>,

    #[arg(
        short = 'i',
        long = "import_url",
        help = "Base URL of the ERP import service",
        default_value = "http://127.0.0.1:8080/efr"
    )]
    pub import_url: String,

    #[arg(
        short = 's',
        long = "sds_url",
        help = "Base URL of the content service that performs SDS synchronization",
        default_value = "http://127.0.0.1:8080/content"
    )]
    pub sds_url: String,

    #[arg(
        long = "tick_ms",
        help = "Milliseconds between scheduler wake-ups",
        default_value = "1000"
    )]
    pub tick_ms: u64,

    #[arg(
        long = "poll_interval_ms",
        help = "Milliseconds between import progress polls",
        default_value = "2000"
    )]
    pub poll_interval_ms: u64,

    #[arg(
        long = "poll_budget_secs",
        help = "Seconds an import may keep polling before it is timed out",
        default_value = "18000"
    )]
    pub poll_budget_secs: u64,

    #[arg(
        long = "failure_budget",
        help = "Consecutive failed progress polls that abort an import",
        default_value = "2"
    )]
    pub failure_budget: u32,

    #[arg(
        long = "cooldown_secs",
        help = "Seconds to wait after a successful import when a cooldown was requested",
        default_value = "15"
    )]
    pub cooldown_secs: u64,

    #[arg(
        long = "request_timeout_secs",
        help = "Seconds before a single call to an external service is abandoned",
        default_value = "30"
    )]
    pub request_timeout_secs: u64,

    #[arg(long = "jaeger_endpoint", help = "Jaeger collector endpoint")]
    pub jaeger_endpoint: Option<String>,

    #[arg(long = "erp_import", help = "Project ids to submit an ERP import for on start-up")]
    pub erp_import: Vec<String>,

    #[arg(long = "sds_sync", help = "Project ids to submit an SDS sync for on start-up")]
    pub sds_sync: Vec<String>,
}

impl ConfigContext {
    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            tick: Duration::from_millis(self.tick_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            poll_budget: Duration::from_secs(self.poll_budget_secs),
            failure_budget: self.failure_budget.max(1),
            cooldown: Duration::from_secs(self.cooldown_secs),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
        }
    }
}

/// Timings and budgets that drive the scheduler and the import state machine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OrchestratorConfig {
    pub tick: Duration,
    pub poll_interval: Duration,
    pub poll_budget: Duration,
    pub failure_budget: u32,
    pub cooldown: Duration,
    pub request_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        OrchestratorConfig {
            tick: Duration::from_secs(1),
            poll_interval: Duration::from_secs(2),
            poll_budget: Duration::from_secs(5 * 60 * 60),
            failure_budget: 2,
            cooldown: Duration::from_secs(15),
            request_timeout: Duration::from_secs(30),
        }
    }
}
