use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use bursar_billing::{
    AdjustmentKind, BillingPeriod, InvoiceKind, LineItem, NewAdjustment, NewInvoice, NewPayment,
    PaymentMethod,
};
use bursar_core::{
    BasisPoints, ClassId, InvoiceId, LedgerResult, Money, PayoutRuleId, StudentId, TeacherId, UserId,
};
use bursar_payouts::{NewPayoutRule, PayoutRule, PayoutStatement, RateSchedule};

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct BillingPeriodRequest {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

#[derive(Debug, Deserialize)]
pub struct CreateInvoiceRequest {
    pub student_id: StudentId,
    pub class_id: Option<ClassId>,
    #[serde(default = "default_kind")]
    pub kind: InvoiceKind,
    pub issue_date: Option<NaiveDate>,
    pub due_date: NaiveDate,
    pub billing_period: Option<BillingPeriodRequest>,
    pub parent_invoice_id: Option<InvoiceId>,
    pub line_items: Vec<LineItem>,
    #[serde(default)]
    pub discount: Money,
    #[serde(default)]
    pub late_fee: Money,
    #[serde(default)]
    pub as_draft: bool,
}

fn default_kind() -> InvoiceKind {
    InvoiceKind::OneOff
}

impl CreateInvoiceRequest {
    pub fn into_command(self) -> LedgerResult<NewInvoice> {
        let billing_period = self
            .billing_period
            .map(|p| BillingPeriod::new(p.start, p.end))
            .transpose()?;
        Ok(NewInvoice {
            student_id: self.student_id,
            class_id: self.class_id,
            kind: self.kind,
            issue_date: self.issue_date,
            due_date: self.due_date,
            billing_period,
            parent_invoice_id: self.parent_invoice_id,
            line_items: self.line_items,
            discount: self.discount,
            late_fee: self.late_fee,
            as_draft: self.as_draft,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct ListInvoicesQuery {
    pub student_id: Option<StudentId>,
}

#[derive(Debug, Deserialize)]
pub struct RecordPaymentRequest {
    pub student_id: StudentId,
    pub invoice_id: Option<InvoiceId>,
    pub amount: Money,
    pub method: PaymentMethod,
    pub payment_date: Option<NaiveDate>,
    pub notes: Option<String>,
}

impl From<RecordPaymentRequest> for NewPayment {
    fn from(req: RecordPaymentRequest) -> Self {
        NewPayment {
            student_id: req.student_id,
            invoice_id: req.invoice_id,
            amount: req.amount,
            method: req.method,
            payment_date: req.payment_date,
            notes: req.notes,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AdjustmentRequest {
    pub kind: AdjustmentKind,
    pub amount: Money,
    pub reason: String,
}

impl From<AdjustmentRequest> for NewAdjustment {
    fn from(req: AdjustmentRequest) -> Self {
        NewAdjustment {
            kind: req.kind,
            amount: req.amount,
            reason: req.reason,
        }
    }
}

/// Rates arrive as decimal percentages (`62.5`), stored as basis points.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RateRequest {
    Fixed {
        percentage: f64,
    },
    Tiered {
        tier1_percentage: f64,
        tier1_threshold: Money,
        tier2_percentage: f64,
    },
}

#[derive(Debug, Deserialize)]
pub struct PayoutRuleRequest {
    pub effective_from: NaiveDate,
    #[serde(flatten)]
    pub rate: RateRequest,
}

impl PayoutRuleRequest {
    pub fn into_command(self, teacher_id: TeacherId) -> LedgerResult<NewPayoutRule> {
        let schedule = match self.rate {
            RateRequest::Fixed { percentage } => RateSchedule::Fixed {
                percentage: BasisPoints::from_percent(percentage)?,
            },
            RateRequest::Tiered {
                tier1_percentage,
                tier1_threshold,
                tier2_percentage,
            } => RateSchedule::Tiered {
                tier1_percentage: BasisPoints::from_percent(tier1_percentage)?,
                tier1_threshold,
                tier2_percentage: BasisPoints::from_percent(tier2_percentage)?,
            },
        };
        Ok(NewPayoutRule {
            teacher_id,
            schedule,
            effective_from: self.effective_from,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct PayoutQuery {
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
}

#[derive(Debug, Deserialize)]
pub struct AssignTeacherRequest {
    pub teacher_id: TeacherId,
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RateResponse {
    Fixed {
        percentage: f64,
    },
    Tiered {
        tier1_percentage: f64,
        tier1_threshold: Money,
        tier2_percentage: f64,
    },
}

impl From<&RateSchedule> for RateResponse {
    fn from(schedule: &RateSchedule) -> Self {
        match *schedule {
            RateSchedule::Fixed { percentage } => RateResponse::Fixed {
                percentage: percentage.as_percent(),
            },
            RateSchedule::Tiered {
                tier1_percentage,
                tier1_threshold,
                tier2_percentage,
            } => RateResponse::Tiered {
                tier1_percentage: tier1_percentage.as_percent(),
                tier1_threshold,
                tier2_percentage: tier2_percentage.as_percent(),
            },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PayoutRuleResponse {
    pub id: PayoutRuleId,
    pub teacher_id: TeacherId,
    pub effective_from: NaiveDate,
    pub is_active: bool,
    pub superseded_from: Option<NaiveDate>,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub rate: RateResponse,
}

impl From<&PayoutRule> for PayoutRuleResponse {
    fn from(rule: &PayoutRule) -> Self {
        Self {
            id: rule.id,
            teacher_id: rule.teacher_id,
            effective_from: rule.effective_from,
            is_active: rule.is_active,
            superseded_from: rule.superseded_from,
            created_by: rule.created_by,
            created_at: rule.created_at,
            rate: RateResponse::from(&rule.schedule),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PayoutResponse {
    pub teacher_id: TeacherId,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub revenue_base: Money,
    pub payout: Money,
    pub rule_applied: PayoutRuleResponse,
    pub warnings: Vec<String>,
}

impl From<PayoutStatement> for PayoutResponse {
    fn from(statement: PayoutStatement) -> Self {
        Self {
            teacher_id: statement.teacher_id,
            period_start: statement.period.start,
            period_end: statement.period.end,
            revenue_base: statement.revenue_base,
            payout: statement.payout,
            rule_applied: PayoutRuleResponse::from(&statement.rule_applied),
            warnings: statement.warnings,
        }
    }
}
