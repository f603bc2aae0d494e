//! Postgres-backed ledger store.
//!
//! Every query filters on `tenant_id`. Row locks are `SELECT ... FOR UPDATE`
//! inside the transaction; versioned rows are additionally updated with a
//! `WHERE version = $n` guard.
//!
//! ## Error mapping
//!
//! | SQLSTATE | meaning | LedgerError |
//! |----------|---------|-------------|
//! | `23505` on `payments_receipt_number` | receipt collision | `DuplicateReceipt` |
//! | `23505` elsewhere | concurrent insert of the same key | `Concurrency` |
//! | `40001` / `40P01` | serialization failure / deadlock | `Concurrency` |
//! | anything else | storage failure | `Persistence` |

use std::str::FromStr;

use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{error, instrument};

use bursar_billing::{
    AdjustmentKind, BillingPeriod, Invoice, InvoiceAdjustment, InvoiceKind, InvoiceStatus,
    LineItem, Payment, PaymentAllocation, PaymentMethod, PaymentStatus, format_receipt_number,
};
use bursar_core::{
    AdjustmentId, AllocationId, BasisPoints, ClassId, Entity, ExpectedVersion, InvoiceId, LedgerError,
    LedgerResult, Money, PaymentId, PayoutRuleId, StudentId, TeacherId, TenantId, UserId,
};
use bursar_payouts::{PayoutRule, RateSchedule};
use bursar_reconciliation::DailyClose;

use super::{LedgerStore, LedgerTx};

const SCHEMA: &str = include_str!("../../migrations/0001_ledger.sql");

const INVOICE_COLUMNS: &str = "id, tenant_id, student_id, class_id, kind, status, issue_date, \
    due_date, period_start, period_end, parent_invoice_id, line_items, subtotal, discount, \
    late_fee, adjustments_total, total, amount_paid, balance_due, version, created_at, updated_at";

const PAYMENT_COLUMNS: &str = "id, tenant_id, receipt_number, student_id, invoice_id, amount, \
    method, received_by, payment_date, notes, status, refunded_at, refunded_by, version, created_at";

const ALLOCATION_COLUMNS: &str =
    "id, tenant_id, payment_id, invoice_id, amount, allocated_on, allocated_at, reversed_at";

const CLOSE_COLUMNS: &str = "tenant_id, close_date, expected_cash, expected_bank, actual_cash, \
    actual_bank, variance, is_locked, saved_by, closed_by, closed_at, notes, version, created_at, updated_at";

const RULE_COLUMNS: &str = "id, tenant_id, teacher_id, is_fixed, fixed_percentage_bp, \
    tier1_percentage_bp, tier1_threshold, tier2_percentage_bp, effective_from, is_active, \
    superseded_from, created_by, created_at";

#[derive(Debug, Clone)]
pub struct PostgresLedgerStore {
    pool: PgPool,
}

impl PostgresLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> LedgerResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Create the ledger tables if they do not exist yet.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> LedgerResult<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for PostgresLedgerStore {
    async fn begin(&self, tenant_id: TenantId) -> LedgerResult<Box<dyn LedgerTx>> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        Ok(Box::new(PostgresLedgerTx { tenant_id, tx }))
    }
}

pub struct PostgresLedgerTx {
    tenant_id: TenantId,
    tx: Transaction<'static, Postgres>,
}

impl PostgresLedgerTx {
    async fn fetch_invoices(&mut self, sql: &str, operation: &str) -> LedgerResult<Vec<Invoice>> {
        let rows = sqlx::query(sql)
            .bind(self.tenant_id.as_uuid())
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        rows.iter()
            .map(|row| invoice_from_row(row).map_err(|e| map_sqlx_error(operation, e)))
            .collect()
    }
}

#[async_trait]
impl LedgerTx for PostgresLedgerTx {
    fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    async fn next_receipt_number(&mut self, date: NaiveDate) -> LedgerResult<String> {
        let seq: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO receipt_counters (tenant_id, last_seq)
            VALUES ($1, 1)
            ON CONFLICT (tenant_id)
            DO UPDATE SET last_seq = receipt_counters.last_seq + 1
            RETURNING last_seq
            "#,
        )
        .bind(self.tenant_id.as_uuid())
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("next_receipt_number", e))?;
        Ok(format_receipt_number(date, seq as u64))
    }

    #[instrument(skip(self, invoice), fields(invoice_id = %invoice.id), err)]
    async fn insert_invoice(&mut self, invoice: &Invoice) -> LedgerResult<()> {
        invoice.ensure_tenant(self.tenant_id)?;
        invoice.check_invariants()?;
        let (period_start, period_end) = split_period(invoice.billing_period);
        sqlx::query(
            r#"
            INSERT INTO invoices (
                id, tenant_id, student_id, class_id, kind, status, issue_date, due_date,
                period_start, period_end, parent_invoice_id, line_items, subtotal, discount,
                late_fee, adjustments_total, total, amount_paid, balance_due, version,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                    $17, $18, $19, $20, $21, $22)
            "#,
        )
        .bind(invoice.id.as_uuid())
        .bind(self.tenant_id.as_uuid())
        .bind(invoice.student_id.as_uuid())
        .bind(invoice.class_id.map(|c| *c.as_uuid()))
        .bind(invoice.kind.as_str())
        .bind(invoice.status.as_str())
        .bind(invoice.issue_date)
        .bind(invoice.due_date)
        .bind(period_start)
        .bind(period_end)
        .bind(invoice.parent_invoice_id.map(|p| *p.as_uuid()))
        .bind(Json(&invoice.line_items))
        .bind(invoice.subtotal.minor_units())
        .bind(invoice.discount.minor_units())
        .bind(invoice.late_fee.minor_units())
        .bind(invoice.adjustments_total.minor_units())
        .bind(invoice.total.minor_units())
        .bind(invoice.amount_paid.minor_units())
        .bind(invoice.balance_due.minor_units())
        .bind(invoice.version as i64)
        .bind(invoice.created_at)
        .bind(invoice.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_invoice", e))?;
        Ok(())
    }

    async fn get_invoice(&mut self, id: InvoiceId) -> LedgerResult<Option<Invoice>> {
        let sql = format!("SELECT {INVOICE_COLUMNS} FROM invoices WHERE tenant_id = $1 AND id = $2");
        let row = sqlx::query(&sql)
            .bind(self.tenant_id.as_uuid())
            .bind(id.as_uuid())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("get_invoice", e))?;
        row.map(|r| invoice_from_row(&r))
            .transpose()
            .map_err(|e| map_sqlx_error("get_invoice", e))
    }

    async fn lock_invoice(&mut self, id: InvoiceId) -> LedgerResult<Option<Invoice>> {
        let sql = format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices WHERE tenant_id = $1 AND id = $2 FOR UPDATE"
        );
        let row = sqlx::query(&sql)
            .bind(self.tenant_id.as_uuid())
            .bind(id.as_uuid())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("lock_invoice", e))?;
        row.map(|r| invoice_from_row(&r))
            .transpose()
            .map_err(|e| map_sqlx_error("lock_invoice", e))
    }

    async fn lock_open_invoices(&mut self, student_id: StudentId) -> LedgerResult<Vec<Invoice>> {
        let sql = format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices \
             WHERE tenant_id = $1 AND student_id = $2 AND status <> 'draft' AND balance_due > 0 \
             ORDER BY due_date, issue_date, id FOR UPDATE"
        );
        let rows = sqlx::query(&sql)
            .bind(self.tenant_id.as_uuid())
            .bind(student_id.as_uuid())
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("lock_open_invoices", e))?;
        rows.iter()
            .map(|row| invoice_from_row(row).map_err(|e| map_sqlx_error("lock_open_invoices", e)))
            .collect()
    }

    async fn lock_invoices(&mut self, ids: &[InvoiceId]) -> LedgerResult<Vec<Invoice>> {
        let uuids: Vec<uuid::Uuid> = ids.iter().map(|id| *id.as_uuid()).collect();
        // Lock in id order so concurrent writers never deadlock on each other.
        let sql = format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices WHERE tenant_id = $1 AND id = ANY($2) \
             ORDER BY id FOR UPDATE"
        );
        let rows = sqlx::query(&sql)
            .bind(self.tenant_id.as_uuid())
            .bind(&uuids)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("lock_invoices", e))?;
        let invoices = rows
            .iter()
            .map(|row| invoice_from_row(row).map_err(|e| map_sqlx_error("lock_invoices", e)))
            .collect::<LedgerResult<Vec<_>>>()?;
        for id in ids {
            if !invoices.iter().any(|i| i.id == *id) {
                return Err(LedgerError::not_found("invoice", id));
            }
        }
        Ok(invoices)
    }

    async fn lock_overdue_candidates(&mut self, today: NaiveDate) -> LedgerResult<Vec<Invoice>> {
        let sql = format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices \
             WHERE tenant_id = $1 AND status = 'sent' AND balance_due > 0 AND due_date < $2 \
             ORDER BY due_date, issue_date, id FOR UPDATE"
        );
        let rows = sqlx::query(&sql)
            .bind(self.tenant_id.as_uuid())
            .bind(today)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("lock_overdue_candidates", e))?;
        rows.iter()
            .map(|row| invoice_from_row(row).map_err(|e| map_sqlx_error("lock_overdue_candidates", e)))
            .collect()
    }

    #[instrument(skip(self, invoice), fields(invoice_id = %invoice.id, expected = ?expected), err)]
    async fn update_invoice(&mut self, invoice: &Invoice, expected: ExpectedVersion) -> LedgerResult<()> {
        invoice.check_invariants()?;
        let guard = match expected {
            ExpectedVersion::Any => None,
            ExpectedVersion::Exact(v) => Some(v as i64),
        };
        let result = sqlx::query(
            r#"
            UPDATE invoices SET
                status = $3, discount = $4, late_fee = $5, adjustments_total = $6, total = $7,
                amount_paid = $8, balance_due = $9, version = $10, updated_at = $11
            WHERE tenant_id = $1 AND id = $2 AND ($12::BIGINT IS NULL OR version = $12)
            "#,
        )
        .bind(self.tenant_id.as_uuid())
        .bind(invoice.id.as_uuid())
        .bind(invoice.status.as_str())
        .bind(invoice.discount.minor_units())
        .bind(invoice.late_fee.minor_units())
        .bind(invoice.adjustments_total.minor_units())
        .bind(invoice.total.minor_units())
        .bind(invoice.amount_paid.minor_units())
        .bind(invoice.balance_due.minor_units())
        .bind(invoice.version as i64)
        .bind(invoice.updated_at)
        .bind(guard)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("update_invoice", e))?;
        if result.rows_affected() == 0 {
            return Err(LedgerError::concurrency(format!(
                "invoice {} changed concurrently (expected {expected:?})",
                invoice.id
            )));
        }
        Ok(())
    }

    async fn list_invoices(&mut self, student_id: Option<StudentId>) -> LedgerResult<Vec<Invoice>> {
        match student_id {
            Some(student_id) => {
                let sql = format!(
                    "SELECT {INVOICE_COLUMNS} FROM invoices WHERE tenant_id = $1 AND student_id = $2 \
                     ORDER BY issue_date, id"
                );
                let rows = sqlx::query(&sql)
                    .bind(self.tenant_id.as_uuid())
                    .bind(student_id.as_uuid())
                    .fetch_all(&mut *self.tx)
                    .await
                    .map_err(|e| map_sqlx_error("list_invoices", e))?;
                rows.iter()
                    .map(|row| invoice_from_row(row).map_err(|e| map_sqlx_error("list_invoices", e)))
                    .collect()
            }
            None => {
                let sql = format!(
                    "SELECT {INVOICE_COLUMNS} FROM invoices WHERE tenant_id = $1 ORDER BY issue_date, id"
                );
                self.fetch_invoices(&sql, "list_invoices").await
            }
        }
    }

    #[instrument(skip(self, payment), fields(payment_id = %payment.id, receipt = %payment.receipt_number), err)]
    async fn insert_payment(&mut self, payment: &Payment) -> LedgerResult<()> {
        payment.ensure_tenant(self.tenant_id)?;
        sqlx::query(
            r#"
            INSERT INTO payments (
                id, tenant_id, receipt_number, student_id, invoice_id, amount, method,
                received_by, payment_date, notes, status, refunded_at, refunded_by, version, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(payment.id.as_uuid())
        .bind(self.tenant_id.as_uuid())
        .bind(&payment.receipt_number)
        .bind(payment.student_id.as_uuid())
        .bind(payment.invoice_id.map(|i| *i.as_uuid()))
        .bind(payment.amount.minor_units())
        .bind(payment.method.as_str())
        .bind(payment.received_by.as_uuid())
        .bind(payment.payment_date)
        .bind(&payment.notes)
        .bind(payment.status.as_str())
        .bind(payment.refunded_at)
        .bind(payment.refunded_by.map(|u| *u.as_uuid()))
        .bind(payment.version as i64)
        .bind(payment.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| {
            if is_unique_violation_on(&e, "payments_receipt_number") {
                LedgerError::DuplicateReceipt(payment.receipt_number.clone())
            } else {
                map_sqlx_error("insert_payment", e)
            }
        })?;
        Ok(())
    }

    async fn get_payment(&mut self, id: PaymentId) -> LedgerResult<Option<Payment>> {
        let sql = format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE tenant_id = $1 AND id = $2");
        let row = sqlx::query(&sql)
            .bind(self.tenant_id.as_uuid())
            .bind(id.as_uuid())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("get_payment", e))?;
        row.map(|r| payment_from_row(&r))
            .transpose()
            .map_err(|e| map_sqlx_error("get_payment", e))
    }

    async fn lock_payment(&mut self, id: PaymentId) -> LedgerResult<Option<Payment>> {
        let sql = format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE tenant_id = $1 AND id = $2 FOR UPDATE"
        );
        let row = sqlx::query(&sql)
            .bind(self.tenant_id.as_uuid())
            .bind(id.as_uuid())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("lock_payment", e))?;
        row.map(|r| payment_from_row(&r))
            .transpose()
            .map_err(|e| map_sqlx_error("lock_payment", e))
    }

    async fn lock_student_payments(&mut self, student_id: StudentId) -> LedgerResult<Vec<Payment>> {
        let sql = format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments \
             WHERE tenant_id = $1 AND student_id = $2 AND status = 'completed' \
             ORDER BY payment_date, created_at, id FOR UPDATE"
        );
        let rows = sqlx::query(&sql)
            .bind(self.tenant_id.as_uuid())
            .bind(student_id.as_uuid())
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("lock_student_payments", e))?;
        rows.iter()
            .map(|row| payment_from_row(row).map_err(|e| map_sqlx_error("lock_student_payments", e)))
            .collect()
    }

    async fn update_payment(&mut self, payment: &Payment, expected: ExpectedVersion) -> LedgerResult<()> {
        let guard = match expected {
            ExpectedVersion::Any => None,
            ExpectedVersion::Exact(v) => Some(v as i64),
        };
        let result = sqlx::query(
            r#"
            UPDATE payments SET status = $3, refunded_at = $4, refunded_by = $5, version = $6
            WHERE tenant_id = $1 AND id = $2 AND ($7::BIGINT IS NULL OR version = $7)
            "#,
        )
        .bind(self.tenant_id.as_uuid())
        .bind(payment.id.as_uuid())
        .bind(payment.status.as_str())
        .bind(payment.refunded_at)
        .bind(payment.refunded_by.map(|u| *u.as_uuid()))
        .bind(payment.version as i64)
        .bind(guard)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("update_payment", e))?;
        if result.rows_affected() == 0 {
            return Err(LedgerError::concurrency(format!(
                "payment {} changed concurrently (expected {expected:?})",
                payment.id
            )));
        }
        Ok(())
    }

    async fn payments_on(&mut self, date: NaiveDate) -> LedgerResult<Vec<Payment>> {
        let sql = format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE tenant_id = $1 AND payment_date = $2 ORDER BY id"
        );
        let rows = sqlx::query(&sql)
            .bind(self.tenant_id.as_uuid())
            .bind(date)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("payments_on", e))?;
        rows.iter()
            .map(|row| payment_from_row(row).map_err(|e| map_sqlx_error("payments_on", e)))
            .collect()
    }

    async fn insert_allocations(&mut self, rows: &[PaymentAllocation]) -> LedgerResult<()> {
        for row in rows {
            row.ensure_tenant(self.tenant_id)?;
            sqlx::query(
                r#"
                INSERT INTO payment_allocations (
                    id, tenant_id, payment_id, invoice_id, amount, allocated_on, allocated_at, reversed_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(row.id.as_uuid())
            .bind(self.tenant_id.as_uuid())
            .bind(row.payment_id.as_uuid())
            .bind(row.invoice_id.as_uuid())
            .bind(row.amount.minor_units())
            .bind(row.allocated_on)
            .bind(row.allocated_at)
            .bind(row.reversed_at)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("insert_allocation", e))?;
        }
        Ok(())
    }

    async fn allocations_for_payments(&mut self, ids: &[PaymentId]) -> LedgerResult<Vec<PaymentAllocation>> {
        let uuids: Vec<uuid::Uuid> = ids.iter().map(|id| *id.as_uuid()).collect();
        let sql = format!(
            "SELECT {ALLOCATION_COLUMNS} FROM payment_allocations \
             WHERE tenant_id = $1 AND payment_id = ANY($2) ORDER BY allocated_at, id"
        );
        let rows = sqlx::query(&sql)
            .bind(self.tenant_id.as_uuid())
            .bind(&uuids)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("allocations_for_payments", e))?;
        rows.iter()
            .map(|row| allocation_from_row(row).map_err(|e| map_sqlx_error("allocations_for_payments", e)))
            .collect()
    }

    async fn allocations_for_invoice(&mut self, id: InvoiceId) -> LedgerResult<Vec<PaymentAllocation>> {
        let sql = format!(
            "SELECT {ALLOCATION_COLUMNS} FROM payment_allocations \
             WHERE tenant_id = $1 AND invoice_id = $2 ORDER BY allocated_at, id"
        );
        let rows = sqlx::query(&sql)
            .bind(self.tenant_id.as_uuid())
            .bind(id.as_uuid())
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("allocations_for_invoice", e))?;
        rows.iter()
            .map(|row| allocation_from_row(row).map_err(|e| map_sqlx_error("allocations_for_invoice", e)))
            .collect()
    }

    async fn mark_allocations_reversed(&mut self, rows: &[PaymentAllocation]) -> LedgerResult<()> {
        for row in rows {
            let result = sqlx::query(
                r#"
                UPDATE payment_allocations SET reversed_at = $3
                WHERE tenant_id = $1 AND id = $2 AND reversed_at IS NULL
                "#,
            )
            .bind(self.tenant_id.as_uuid())
            .bind(row.id.as_uuid())
            .bind(row.reversed_at)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("reverse_allocation", e))?;
            if result.rows_affected() == 0 {
                return Err(LedgerError::concurrency(format!(
                    "allocation {} already reversed",
                    row.id
                )));
            }
        }
        Ok(())
    }

    async fn revenue_allocations(
        &mut self,
        class_ids: &[ClassId],
        start: NaiveDate,
        end: NaiveDate,
    ) -> LedgerResult<Vec<PaymentAllocation>> {
        let uuids: Vec<uuid::Uuid> = class_ids.iter().map(|id| *id.as_uuid()).collect();
        let rows = sqlx::query(
            r#"
            SELECT a.id, a.tenant_id, a.payment_id, a.invoice_id, a.amount, a.allocated_on,
                   a.allocated_at, a.reversed_at
            FROM payment_allocations a
            JOIN invoices i ON i.tenant_id = a.tenant_id AND i.id = a.invoice_id
            WHERE a.tenant_id = $1
              AND i.class_id = ANY($2)
              AND a.reversed_at IS NULL
              AND a.allocated_on BETWEEN $3 AND $4
            ORDER BY a.allocated_on, a.id
            "#,
        )
        .bind(self.tenant_id.as_uuid())
        .bind(&uuids)
        .bind(start)
        .bind(end)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("revenue_allocations", e))?;
        rows.iter()
            .map(|row| allocation_from_row(row).map_err(|e| map_sqlx_error("revenue_allocations", e)))
            .collect()
    }

    async fn insert_adjustment(&mut self, adjustment: &InvoiceAdjustment) -> LedgerResult<()> {
        adjustment.ensure_tenant(self.tenant_id)?;
        sqlx::query(
            r#"
            INSERT INTO invoice_adjustments (
                id, tenant_id, invoice_id, kind, amount, reason, applied_by, applied_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(adjustment.id.as_uuid())
        .bind(self.tenant_id.as_uuid())
        .bind(adjustment.invoice_id.as_uuid())
        .bind(adjustment.kind.as_str())
        .bind(adjustment.amount.minor_units())
        .bind(&adjustment.reason)
        .bind(adjustment.applied_by.as_uuid())
        .bind(adjustment.applied_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_adjustment", e))?;
        Ok(())
    }

    async fn adjustments_for_invoice(&mut self, id: InvoiceId) -> LedgerResult<Vec<InvoiceAdjustment>> {
        let rows = sqlx::query(
            r#"
            SELECT id, tenant_id, invoice_id, kind, amount, reason, applied_by, applied_at
            FROM invoice_adjustments
            WHERE tenant_id = $1 AND invoice_id = $2
            ORDER BY applied_at, id
            "#,
        )
        .bind(self.tenant_id.as_uuid())
        .bind(id.as_uuid())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("adjustments_for_invoice", e))?;
        rows.iter()
            .map(|row| adjustment_from_row(row).map_err(|e| map_sqlx_error("adjustments_for_invoice", e)))
            .collect()
    }

    async fn get_daily_close(&mut self, date: NaiveDate) -> LedgerResult<Option<DailyClose>> {
        let sql = format!(
            "SELECT {CLOSE_COLUMNS} FROM daily_closes WHERE tenant_id = $1 AND close_date = $2"
        );
        let row = sqlx::query(&sql)
            .bind(self.tenant_id.as_uuid())
            .bind(date)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("get_daily_close", e))?;
        row.map(|r| close_from_row(&r))
            .transpose()
            .map_err(|e| map_sqlx_error("get_daily_close", e))
    }

    async fn lock_daily_close(&mut self, date: NaiveDate) -> LedgerResult<Option<DailyClose>> {
        let sql = format!(
            "SELECT {CLOSE_COLUMNS} FROM daily_closes WHERE tenant_id = $1 AND close_date = $2 FOR UPDATE"
        );
        let row = sqlx::query(&sql)
            .bind(self.tenant_id.as_uuid())
            .bind(date)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("lock_daily_close", e))?;
        row.map(|r| close_from_row(&r))
            .transpose()
            .map_err(|e| map_sqlx_error("lock_daily_close", e))
    }

    #[instrument(skip(self, close), fields(close_date = %close.close_date, locked = close.is_locked), err)]
    async fn insert_daily_close(&mut self, close: &DailyClose) -> LedgerResult<()> {
        close.ensure_tenant(self.tenant_id)?;
        sqlx::query(
            r#"
            INSERT INTO daily_closes (
                tenant_id, close_date, expected_cash, expected_bank, actual_cash, actual_bank,
                variance, is_locked, saved_by, closed_by, closed_at, notes, version, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(self.tenant_id.as_uuid())
        .bind(close.close_date)
        .bind(close.expected_cash.minor_units())
        .bind(close.expected_bank.minor_units())
        .bind(close.actual_cash.minor_units())
        .bind(close.actual_bank.minor_units())
        .bind(close.variance.minor_units())
        .bind(close.is_locked)
        .bind(close.saved_by.as_uuid())
        .bind(close.closed_by.map(|u| *u.as_uuid()))
        .bind(close.closed_at)
        .bind(&close.notes)
        .bind(close.version as i64)
        .bind(close.created_at)
        .bind(close.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_daily_close", e))?;
        Ok(())
    }

    #[instrument(skip(self, close), fields(close_date = %close.close_date, locked = close.is_locked), err)]
    async fn update_daily_close(&mut self, close: &DailyClose, expected: ExpectedVersion) -> LedgerResult<()> {
        let guard = match expected {
            ExpectedVersion::Any => None,
            ExpectedVersion::Exact(v) => Some(v as i64),
        };
        // Compare-and-set on is_locked: a row that is already locked never matches.
        let result = sqlx::query(
            r#"
            UPDATE daily_closes SET
                expected_cash = $3, expected_bank = $4, actual_cash = $5, actual_bank = $6,
                variance = $7, is_locked = $8, saved_by = $9, closed_by = $10, closed_at = $11,
                notes = $12, version = $13, updated_at = $14
            WHERE tenant_id = $1 AND close_date = $2 AND is_locked = FALSE
              AND ($15::BIGINT IS NULL OR version = $15)
            "#,
        )
        .bind(self.tenant_id.as_uuid())
        .bind(close.close_date)
        .bind(close.expected_cash.minor_units())
        .bind(close.expected_bank.minor_units())
        .bind(close.actual_cash.minor_units())
        .bind(close.actual_bank.minor_units())
        .bind(close.variance.minor_units())
        .bind(close.is_locked)
        .bind(close.saved_by.as_uuid())
        .bind(close.closed_by.map(|u| *u.as_uuid()))
        .bind(close.closed_at)
        .bind(&close.notes)
        .bind(close.version as i64)
        .bind(close.updated_at)
        .bind(guard)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("update_daily_close", e))?;
        if result.rows_affected() == 1 {
            return Ok(());
        }
        match self.get_daily_close(close.close_date).await? {
            Some(stored) if stored.is_locked => Err(LedgerError::AlreadyFinalized(close.close_date)),
            Some(_) => Err(LedgerError::concurrency(format!(
                "daily close for {} changed concurrently (expected {expected:?})",
                close.close_date
            ))),
            None => Err(LedgerError::not_found("daily close", close.close_date)),
        }
    }

    async fn insert_payout_rule(&mut self, rule: &PayoutRule) -> LedgerResult<()> {
        rule.ensure_tenant(self.tenant_id)?;
        let cols = ScheduleColumns::from(&rule.schedule);
        sqlx::query(
            r#"
            INSERT INTO payout_rules (
                id, tenant_id, teacher_id, is_fixed, fixed_percentage_bp, tier1_percentage_bp,
                tier1_threshold, tier2_percentage_bp, effective_from, is_active, superseded_from,
                created_by, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(rule.id.as_uuid())
        .bind(self.tenant_id.as_uuid())
        .bind(rule.teacher_id.as_uuid())
        .bind(cols.is_fixed)
        .bind(cols.fixed_percentage_bp)
        .bind(cols.tier1_percentage_bp)
        .bind(cols.tier1_threshold)
        .bind(cols.tier2_percentage_bp)
        .bind(rule.effective_from)
        .bind(rule.is_active)
        .bind(rule.superseded_from)
        .bind(rule.created_by.as_uuid())
        .bind(rule.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_payout_rule", e))?;
        Ok(())
    }

    async fn lock_payout_rules(&mut self, teacher_id: TeacherId) -> LedgerResult<Vec<PayoutRule>> {
        let sql = format!(
            "SELECT {RULE_COLUMNS} FROM payout_rules WHERE tenant_id = $1 AND teacher_id = $2 \
             ORDER BY effective_from, created_at, id FOR UPDATE"
        );
        let rows = sqlx::query(&sql)
            .bind(self.tenant_id.as_uuid())
            .bind(teacher_id.as_uuid())
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("lock_payout_rules", e))?;
        rows.iter()
            .map(|row| rule_from_row(row).map_err(|e| map_sqlx_error("lock_payout_rules", e)))
            .collect()
    }

    async fn update_payout_rule(&mut self, rule: &PayoutRule) -> LedgerResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE payout_rules SET is_active = $3, superseded_from = $4
            WHERE tenant_id = $1 AND id = $2
            "#,
        )
        .bind(self.tenant_id.as_uuid())
        .bind(rule.id.as_uuid())
        .bind(rule.is_active)
        .bind(rule.superseded_from)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("update_payout_rule", e))?;
        if result.rows_affected() == 0 {
            return Err(LedgerError::not_found("payout rule", rule.id));
        }
        Ok(())
    }

    async fn payout_rules(&mut self, teacher_id: TeacherId) -> LedgerResult<Vec<PayoutRule>> {
        let sql = format!(
            "SELECT {RULE_COLUMNS} FROM payout_rules WHERE tenant_id = $1 AND teacher_id = $2 \
             ORDER BY effective_from, created_at, id"
        );
        let rows = sqlx::query(&sql)
            .bind(self.tenant_id.as_uuid())
            .bind(teacher_id.as_uuid())
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("payout_rules", e))?;
        rows.iter()
            .map(|row| rule_from_row(row).map_err(|e| map_sqlx_error("payout_rules", e)))
            .collect()
    }

    async fn assign_class_teacher(&mut self, class_id: ClassId, teacher_id: TeacherId) -> LedgerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO class_teachers (tenant_id, class_id, teacher_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (tenant_id, class_id) DO UPDATE SET teacher_id = EXCLUDED.teacher_id
            "#,
        )
        .bind(self.tenant_id.as_uuid())
        .bind(class_id.as_uuid())
        .bind(teacher_id.as_uuid())
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("assign_class_teacher", e))?;
        Ok(())
    }

    async fn classes_for_teacher(&mut self, teacher_id: TeacherId) -> LedgerResult<Vec<ClassId>> {
        let ids: Vec<uuid::Uuid> = sqlx::query_scalar(
            "SELECT class_id FROM class_teachers WHERE tenant_id = $1 AND teacher_id = $2 ORDER BY class_id",
        )
        .bind(self.tenant_id.as_uuid())
        .bind(teacher_id.as_uuid())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("classes_for_teacher", e))?;
        Ok(ids.into_iter().map(ClassId::from_uuid).collect())
    }

    async fn commit(self: Box<Self>) -> LedgerResult<()> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> LedgerError {
    match &err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {operation}: {}", db_err.message());
            match db_err.code().as_deref() {
                Some("23505") | Some("40001") | Some("40P01") => LedgerError::concurrency(msg),
                _ => {
                    error!(operation, error = %err, "persistence failure");
                    LedgerError::persistence(msg)
                }
            }
        }
        _ => {
            error!(operation, error = %err, "persistence failure");
            LedgerError::persistence(format!("{operation}: {err}"))
        }
    }
}

fn is_unique_violation_on(err: &sqlx::Error, constraint: &str) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        return db_err.code().as_deref() == Some("23505") && db_err.constraint() == Some(constraint);
    }
    false
}

fn decode_err(err: LedgerError) -> sqlx::Error {
    sqlx::Error::Decode(Box::new(err))
}

fn parse_column<T>(row: &PgRow, column: &str) -> Result<T, sqlx::Error>
where
    T: FromStr<Err = LedgerError>,
{
    let raw: String = row.try_get(column)?;
    raw.parse().map_err(decode_err)
}

fn split_period(period: Option<BillingPeriod>) -> (Option<NaiveDate>, Option<NaiveDate>) {
    match period {
        Some(p) => (Some(p.start), Some(p.end)),
        None => (None, None),
    }
}

fn money(row: &PgRow, column: &str) -> Result<Money, sqlx::Error> {
    Ok(Money::new(row.try_get::<i64, _>(column)?))
}

fn invoice_from_row(row: &PgRow) -> Result<Invoice, sqlx::Error> {
    let period_start: Option<NaiveDate> = row.try_get("period_start")?;
    let period_end: Option<NaiveDate> = row.try_get("period_end")?;
    let billing_period = match (period_start, period_end) {
        (Some(start), Some(end)) => Some(BillingPeriod::new(start, end).map_err(decode_err)?),
        _ => None,
    };
    let line_items: Json<Vec<LineItem>> = row.try_get("line_items")?;
    Ok(Invoice {
        id: InvoiceId::from_uuid(row.try_get("id")?),
        tenant_id: TenantId::from_uuid(row.try_get("tenant_id")?),
        student_id: StudentId::from_uuid(row.try_get("student_id")?),
        class_id: row.try_get::<Option<uuid::Uuid>, _>("class_id")?.map(ClassId::from_uuid),
        kind: parse_column::<InvoiceKind>(row, "kind")?,
        status: parse_column::<InvoiceStatus>(row, "status")?,
        issue_date: row.try_get("issue_date")?,
        due_date: row.try_get("due_date")?,
        billing_period,
        parent_invoice_id: row
            .try_get::<Option<uuid::Uuid>, _>("parent_invoice_id")?
            .map(InvoiceId::from_uuid),
        line_items: line_items.0,
        subtotal: money(row, "subtotal")?,
        discount: money(row, "discount")?,
        late_fee: money(row, "late_fee")?,
        adjustments_total: money(row, "adjustments_total")?,
        total: money(row, "total")?,
        amount_paid: money(row, "amount_paid")?,
        balance_due: money(row, "balance_due")?,
        version: row.try_get::<i64, _>("version")? as u64,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn payment_from_row(row: &PgRow) -> Result<Payment, sqlx::Error> {
    Ok(Payment {
        id: PaymentId::from_uuid(row.try_get("id")?),
        tenant_id: TenantId::from_uuid(row.try_get("tenant_id")?),
        receipt_number: row.try_get("receipt_number")?,
        student_id: StudentId::from_uuid(row.try_get("student_id")?),
        invoice_id: row.try_get::<Option<uuid::Uuid>, _>("invoice_id")?.map(InvoiceId::from_uuid),
        amount: money(row, "amount")?,
        method: parse_column::<PaymentMethod>(row, "method")?,
        received_by: UserId::from_uuid(row.try_get("received_by")?),
        payment_date: row.try_get("payment_date")?,
        notes: row.try_get("notes")?,
        status: parse_column::<PaymentStatus>(row, "status")?,
        refunded_at: row.try_get("refunded_at")?,
        refunded_by: row.try_get::<Option<uuid::Uuid>, _>("refunded_by")?.map(UserId::from_uuid),
        version: row.try_get::<i64, _>("version")? as u64,
        created_at: row.try_get("created_at")?,
    })
}

fn allocation_from_row(row: &PgRow) -> Result<PaymentAllocation, sqlx::Error> {
    Ok(PaymentAllocation {
        id: AllocationId::from_uuid(row.try_get("id")?),
        tenant_id: TenantId::from_uuid(row.try_get("tenant_id")?),
        payment_id: PaymentId::from_uuid(row.try_get("payment_id")?),
        invoice_id: InvoiceId::from_uuid(row.try_get("invoice_id")?),
        amount: money(row, "amount")?,
        allocated_on: row.try_get("allocated_on")?,
        allocated_at: row.try_get("allocated_at")?,
        reversed_at: row.try_get("reversed_at")?,
    })
}

fn adjustment_from_row(row: &PgRow) -> Result<InvoiceAdjustment, sqlx::Error> {
    Ok(InvoiceAdjustment {
        id: AdjustmentId::from_uuid(row.try_get("id")?),
        tenant_id: TenantId::from_uuid(row.try_get("tenant_id")?),
        invoice_id: InvoiceId::from_uuid(row.try_get("invoice_id")?),
        kind: parse_column::<AdjustmentKind>(row, "kind")?,
        amount: money(row, "amount")?,
        reason: row.try_get("reason")?,
        applied_by: UserId::from_uuid(row.try_get("applied_by")?),
        applied_at: row.try_get("applied_at")?,
    })
}

fn close_from_row(row: &PgRow) -> Result<DailyClose, sqlx::Error> {
    Ok(DailyClose {
        tenant_id: TenantId::from_uuid(row.try_get("tenant_id")?),
        close_date: row.try_get("close_date")?,
        expected_cash: money(row, "expected_cash")?,
        expected_bank: money(row, "expected_bank")?,
        actual_cash: money(row, "actual_cash")?,
        actual_bank: money(row, "actual_bank")?,
        variance: money(row, "variance")?,
        is_locked: row.try_get("is_locked")?,
        saved_by: UserId::from_uuid(row.try_get("saved_by")?),
        closed_by: row.try_get::<Option<uuid::Uuid>, _>("closed_by")?.map(UserId::from_uuid),
        closed_at: row.try_get("closed_at")?,
        notes: row.try_get("notes")?,
        version: row.try_get::<i64, _>("version")? as u64,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Flat column view of a [`RateSchedule`].
struct ScheduleColumns {
    is_fixed: bool,
    fixed_percentage_bp: Option<i32>,
    tier1_percentage_bp: Option<i32>,
    tier1_threshold: Option<i64>,
    tier2_percentage_bp: Option<i32>,
}

impl From<&RateSchedule> for ScheduleColumns {
    fn from(schedule: &RateSchedule) -> Self {
        match *schedule {
            RateSchedule::Fixed { percentage } => Self {
                is_fixed: true,
                fixed_percentage_bp: Some(percentage.get() as i32),
                tier1_percentage_bp: None,
                tier1_threshold: None,
                tier2_percentage_bp: None,
            },
            RateSchedule::Tiered {
                tier1_percentage,
                tier1_threshold,
                tier2_percentage,
            } => Self {
                is_fixed: false,
                fixed_percentage_bp: None,
                tier1_percentage_bp: Some(tier1_percentage.get() as i32),
                tier1_threshold: Some(tier1_threshold.minor_units()),
                tier2_percentage_bp: Some(tier2_percentage.get() as i32),
            },
        }
    }
}

fn basis_points(row: &PgRow, column: &str) -> Result<BasisPoints, sqlx::Error> {
    let raw: Option<i32> = row.try_get(column)?;
    let raw = raw.ok_or_else(|| decode_err(LedgerError::invariant(format!("{column} is null"))))?;
    let raw = u32::try_from(raw)
        .map_err(|_| decode_err(LedgerError::invariant(format!("{column} is negative"))))?;
    BasisPoints::new(raw).map_err(decode_err)
}

fn rule_from_row(row: &PgRow) -> Result<PayoutRule, sqlx::Error> {
    let is_fixed: bool = row.try_get("is_fixed")?;
    let schedule = if is_fixed {
        RateSchedule::Fixed {
            percentage: basis_points(row, "fixed_percentage_bp")?,
        }
    } else {
        let threshold: Option<i64> = row.try_get("tier1_threshold")?;
        RateSchedule::Tiered {
            tier1_percentage: basis_points(row, "tier1_percentage_bp")?,
            tier1_threshold: Money::new(threshold.ok_or_else(|| {
                decode_err(LedgerError::invariant("tier1_threshold is null"))
            })?),
            tier2_percentage: basis_points(row, "tier2_percentage_bp")?,
        }
    };
    Ok(PayoutRule {
        id: PayoutRuleId::from_uuid(row.try_get("id")?),
        tenant_id: TenantId::from_uuid(row.try_get("tenant_id")?),
        teacher_id: TeacherId::from_uuid(row.try_get("teacher_id")?),
        schedule,
        effective_from: row.try_get("effective_from")?,
        is_active: row.try_get("is_active")?,
        superseded_from: row.try_get("superseded_from")?,
        created_by: UserId::from_uuid(row.try_get("created_by")?),
        created_at: row.try_get("created_at")?,
    })
}
