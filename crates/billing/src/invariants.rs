//! Billing Invariants Module
//!
//! Runnable consistency checks over the ledger tables. They only read; the
//! worker repairs drifted invoice figures separately through
//! [`crate::store::LedgerStore::recompute_invoice`].

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::plans::CANCELLED_LIMITS;

/// Payments stuck in `processing` longer than this are reported
pub const STALE_PROCESSING_DAYS: i32 = 14;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Organisation(s) affected
    pub org_ids: Vec<Uuid>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Critical - invoice balances disagree with the ledger
    Critical,
    /// High - data inconsistency that needs attention
    High,
    /// Medium - potential issue, should investigate
    Medium,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

impl InvariantCheckSummary {
    pub fn from_violations(
        checked_at: OffsetDateTime,
        checks_run: usize,
        violations: Vec<InvariantViolation>,
    ) -> Self {
        let checks_failed = violations
            .iter()
            .map(|v| v.invariant.as_str())
            .collect::<HashSet<_>>()
            .len();

        Self {
            checked_at,
            checks_run,
            checks_passed: checks_run.saturating_sub(checks_failed),
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        }
    }
}

/// Invoice whose stored `paid_minor` differs from its ledger rows
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DriftedInvoice {
    pub invoice_id: Uuid,
    pub org_id: Uuid,
    pub invoice_number: String,
    pub stored_paid_minor: i64,
    pub ledger_paid_minor: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct PaidStatusRow {
    invoice_id: Uuid,
    org_id: Uuid,
    invoice_number: String,
    status: String,
    paid_minor: i64,
    total_minor: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct StaleProcessingRow {
    payment_id: Uuid,
    invoice_id: Uuid,
    org_id: Uuid,
    provider_reference: String,
    amount_minor: i64,
    created_at: OffsetDateTime,
}

#[derive(Debug, sqlx::FromRow)]
struct SeatFloorRow {
    org_id: Uuid,
    org_name: String,
    max_students: i32,
    max_teachers: i32,
}

/// Service for running billing invariant checks
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_invoice_paid_matches_ledger().await?);
        violations.extend(self.check_paid_status_consistency().await?);
        violations.extend(self.check_stale_processing_payments().await?);
        violations.extend(self.check_cancelled_seat_floor().await?);

        Ok(InvariantCheckSummary::from_violations(
            now,
            Self::available_checks().len(),
            violations,
        ))
    }

    /// Invoices whose derived `paid_minor` no longer matches their rows
    pub async fn drifted_invoices(&self) -> BillingResult<Vec<DriftedInvoice>> {
        let rows: Vec<DriftedInvoice> = sqlx::query_as(
            r#"
            WITH ledger AS (
                SELECT
                    i.id,
                    i.org_id,
                    i.invoice_number,
                    i.paid_minor,
                    (
                        (SELECT COALESCE(SUM(p.amount_minor), 0)::BIGINT FROM payments p
                          WHERE p.invoice_id = i.id AND p.status = 'succeeded')
                      - (SELECT COALESCE(SUM(r.amount_minor), 0)::BIGINT FROM refunds r
                          WHERE r.invoice_id = i.id AND r.status = 'succeeded')
                      - (SELECT COALESCE(SUM(d.amount_minor), 0)::BIGINT FROM disputes d
                          WHERE d.invoice_id = i.id AND d.status = 'lost')
                    ) AS ledger_paid_minor
                FROM invoices i
            )
            SELECT
                id AS invoice_id,
                org_id,
                invoice_number,
                paid_minor AS stored_paid_minor,
                ledger_paid_minor
            FROM ledger
            WHERE paid_minor <> ledger_paid_minor
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Invariant 1: stored `paid_minor` equals the recomputed figure
    async fn check_invoice_paid_matches_ledger(&self) -> BillingResult<Vec<InvariantViolation>> {
        Ok(self
            .drifted_invoices()
            .await?
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "invoice_paid_matches_ledger".to_string(),
                org_ids: vec![row.org_id],
                description: format!(
                    "Invoice {} stores paid_minor {} but its ledger sums to {}",
                    row.invoice_number, row.stored_paid_minor, row.ledger_paid_minor
                ),
                context: serde_json::json!({
                    "invoice_id": row.invoice_id,
                    "stored_paid_minor": row.stored_paid_minor,
                    "ledger_paid_minor": row.ledger_paid_minor,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 2: `paid` status agrees with the paid amount
    async fn check_paid_status_consistency(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<PaidStatusRow> = sqlx::query_as(
            r#"
            SELECT id AS invoice_id, org_id, invoice_number, status, paid_minor, total_minor
            FROM invoices
            WHERE (status = 'paid' AND paid_minor < total_minor)
               OR (status IN ('sent', 'overdue') AND paid_minor > 0 AND paid_minor >= total_minor)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "paid_status_consistency".to_string(),
                org_ids: vec![row.org_id],
                description: format!(
                    "Invoice {} is '{}' with {} of {} paid",
                    row.invoice_number, row.status, row.paid_minor, row.total_minor
                ),
                context: serde_json::json!({
                    "invoice_id": row.invoice_id,
                    "status": row.status,
                    "paid_minor": row.paid_minor,
                    "total_minor": row.total_minor,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 3: delayed payments eventually settle
    async fn check_stale_processing_payments(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<StaleProcessingRow> = sqlx::query_as(
            r#"
            SELECT
                p.id AS payment_id,
                p.invoice_id,
                i.org_id,
                p.provider_reference,
                p.amount_minor,
                p.created_at
            FROM payments p
            JOIN invoices i ON i.id = p.invoice_id
            WHERE p.status = 'processing'
              AND p.created_at < NOW() - make_interval(days => $1)
            "#,
        )
        .bind(STALE_PROCESSING_DAYS)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "stale_processing_payments".to_string(),
                org_ids: vec![row.org_id],
                description: format!(
                    "Payment {} has been processing since {}",
                    row.provider_reference, row.created_at
                ),
                context: serde_json::json!({
                    "payment_id": row.payment_id,
                    "invoice_id": row.invoice_id,
                    "amount_minor": row.amount_minor,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Invariant 4: cancelled organisations sit at or below the seat floor
    async fn check_cancelled_seat_floor(&self) -> BillingResult<Vec<InvariantViolation>> {
        let floor_students = i32::try_from(CANCELLED_LIMITS.max_students).unwrap_or(i32::MAX);
        let floor_teachers = i32::try_from(CANCELLED_LIMITS.max_teachers).unwrap_or(i32::MAX);

        let rows: Vec<SeatFloorRow> = sqlx::query_as(
            r#"
            SELECT id AS org_id, name AS org_name, max_students, max_teachers
            FROM organisations
            WHERE subscription_status = 'cancelled'
              AND (max_students > $1 OR max_teachers > $2)
            "#,
        )
        .bind(floor_students)
        .bind(floor_teachers)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "cancelled_seat_floor".to_string(),
                org_ids: vec![row.org_id],
                description: format!(
                    "Cancelled organisation '{}' still allows {} students and {} teachers",
                    row.org_name, row.max_students, row.max_teachers
                ),
                context: serde_json::json!({
                    "org_name": row.org_name,
                    "max_students": row.max_students,
                    "max_teachers": row.max_teachers,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "invoice_paid_matches_ledger" => self.check_invoice_paid_matches_ledger().await,
            "paid_status_consistency" => self.check_paid_status_consistency().await,
            "stale_processing_payments" => self.check_stale_processing_payments().await,
            "cancelled_seat_floor" => self.check_cancelled_seat_floor().await,
            _ => Ok(vec![]),
        }
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "invoice_paid_matches_ledger",
            "paid_status_consistency",
            "stale_processing_payments",
            "cancelled_seat_floor",
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn violation(invariant: &str) -> InvariantViolation {
        InvariantViolation {
            invariant: invariant.to_string(),
            org_ids: vec![Uuid::new_v4()],
            description: String::new(),
            context: serde_json::Value::Null,
            severity: ViolationSeverity::High,
        }
    }

    #[test]
    fn test_violation_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::High.to_string(), "HIGH");
        assert_eq!(ViolationSeverity::Medium.to_string(), "MEDIUM");
    }

    #[test]
    fn test_available_checks() {
        let checks = InvariantChecker::available_checks();
        assert_eq!(checks.len(), 4);
        assert!(checks.contains(&"invoice_paid_matches_ledger"));
        assert!(checks.contains(&"cancelled_seat_floor"));
    }

    #[test]
    fn test_summary_counts_failed_checks_once() {
        let summary = InvariantCheckSummary::from_violations(
            OffsetDateTime::now_utc(),
            4,
            vec![
                violation("paid_status_consistency"),
                violation("paid_status_consistency"),
                violation("cancelled_seat_floor"),
            ],
        );
        assert_eq!(summary.checks_failed, 2);
        assert_eq!(summary.checks_passed, 2);
        assert!(!summary.healthy);
    }

    #[test]
    fn test_empty_summary_is_healthy() {
        let summary = InvariantCheckSummary::from_violations(OffsetDateTime::now_utc(), 4, vec![]);
        assert!(summary.healthy);
        assert_eq!(summary.checks_passed, 4);
    }
}
