// Test code patterns:
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! LessonLoop Background Worker
//!
//! Handles scheduled jobs:
//! - Billing consistency audit (hourly by default, `INVARIANT_CHECK_CRON`)
//! - Repair of drifted invoice figures from the ledger (`INVARIANT_REPAIR`)
//! - Heartbeat (every 5 minutes)

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Context;
use lessonloop_billing::{
    InvariantCheckSummary, InvariantChecker, LedgerStore, PgLedgerStore, ViolationSeverity,
};
use lessonloop_shared::create_pool;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

const DEFAULT_AUDIT_CRON: &str = "0 0 * * * *";

/// Checks whose violations are fixed by recomputing the invoice
const REPAIRABLE_CHECKS: [&str; 2] = ["invoice_paid_matches_ledger", "paid_status_consistency"];

struct AuditJob {
    checker: InvariantChecker,
    store: PgLedgerStore,
    repair: bool,
}

impl AuditJob {
    async fn run(&self) {
        info!("Running billing invariant audit");

        let summary = match self.checker.run_all_checks().await {
            Ok(summary) => summary,
            Err(e) => {
                error!(error = %e, "Invariant audit failed");
                return;
            }
        };
        log_summary(&summary);

        if !self.repair || summary.healthy {
            return;
        }

        let invoice_ids = repairable_invoices(&summary);
        let mut repaired = 0;
        let mut errors = 0;
        for invoice_id in &invoice_ids {
            match self.store.recompute_invoice(*invoice_id).await {
                Ok(invoice) => {
                    repaired += 1;
                    info!(
                        invoice_id = %invoice.id,
                        paid_minor = invoice.paid_minor,
                        status = %invoice.status,
                        "Invoice recomputed from ledger"
                    );
                }
                Err(e) => {
                    errors += 1;
                    error!(invoice_id = %invoice_id, error = %e, "Failed to repair invoice");
                }
            }
        }

        info!(
            candidates = invoice_ids.len(),
            repaired = repaired,
            errors = errors,
            "Invoice repair complete"
        );
    }
}

fn log_summary(summary: &InvariantCheckSummary) {
    info!(
        checks_run = summary.checks_run,
        checks_passed = summary.checks_passed,
        checks_failed = summary.checks_failed,
        violations = summary.violations.len(),
        healthy = summary.healthy,
        "Invariant audit complete"
    );

    for violation in &summary.violations {
        match violation.severity {
            ViolationSeverity::Critical | ViolationSeverity::High => error!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                org_ids = ?violation.org_ids,
                context = %violation.context,
                "{}",
                violation.description
            ),
            ViolationSeverity::Medium => warn!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                org_ids = ?violation.org_ids,
                "{}",
                violation.description
            ),
        }
    }
}

/// Invoice ids named by violations that a recompute fixes
fn repairable_invoices(summary: &InvariantCheckSummary) -> Vec<Uuid> {
    summary
        .violations
        .iter()
        .filter(|v| REPAIRABLE_CHECKS.contains(&v.invariant.as_str()))
        .filter_map(|v| v.context.get("invoice_id")?.as_str()?.parse().ok())
        .collect::<BTreeSet<Uuid>>()
        .into_iter()
        .collect()
}

fn env_flag(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => true,
            "false" | "0" | "no" => false,
            other => {
                warn!(key, value = other, default, "Unrecognised flag value, using default");
                default
            }
        },
        Err(_) => default,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("info,lessonloop_billing=debug")
            }),
        )
        .init();

    info!("Starting LessonLoop Worker");

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let pool = create_pool(&database_url).await?;
    info!("Database pool created");

    let audit_cron =
        std::env::var("INVARIANT_CHECK_CRON").unwrap_or_else(|_| DEFAULT_AUDIT_CRON.to_string());
    let audit = Arc::new(AuditJob {
        checker: InvariantChecker::new(pool.clone()),
        store: PgLedgerStore::new(pool.clone()),
        repair: env_flag("INVARIANT_REPAIR", true),
    });

    let scheduler = JobScheduler::new().await?;

    // Job 1: Billing invariant audit
    let audit_job = audit.clone();
    scheduler
        .add(Job::new_async(audit_cron.as_str(), move |_uuid, _l| {
            let audit = audit_job.clone();
            Box::pin(async move {
                audit.run().await;
            })
        })?)
        .await?;
    info!(cron = %audit_cron, repair = audit.repair, "Scheduled: Billing invariant audit");

    // Job 2: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    scheduler.start().await?;
    info!("Worker started, waiting for jobs...");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down worker");

    Ok(())
}
