use chrono::NaiveDate;
use tracing::{info, instrument, warn};

use bursar_core::{ClassId, LedgerError, LedgerResult, PayoutRuleId, TeacherId};
use bursar_payouts::{
    NewPayoutRule, PayoutPeriod, PayoutRule, PayoutStatement, revenue_base, select_rule,
    supersede_rules,
};

use crate::config::LedgerConfig;
use crate::store::LedgerStore;

use super::OperationContext;

/// Teacher payout rules and period payouts.
#[derive(Debug, Clone, Default)]
pub struct PayoutService {
    config: LedgerConfig,
}

impl PayoutService {
    pub fn new(config: LedgerConfig) -> Self {
        Self { config }
    }

    /// Insert a new rule and retire the active rules it replaces. Old rows are
    /// kept so past periods still price with the rate that applied then.
    #[instrument(
        skip_all,
        fields(tenant_id = %ctx.tenant_id, teacher_id = %cmd.teacher_id, effective_from = %cmd.effective_from),
        err
    )]
    pub async fn upsert_payout_rule(
        &self,
        store: &dyn LedgerStore,
        ctx: OperationContext,
        cmd: NewPayoutRule,
    ) -> LedgerResult<PayoutRule> {
        let rule = PayoutRule::create(PayoutRuleId::new(), ctx.tenant_id, cmd, ctx.actor, ctx.now)?;

        let mut tx = store.begin(ctx.tenant_id).await?;
        let mut existing = tx.lock_payout_rules(rule.teacher_id).await?;
        let superseded = supersede_rules(&mut existing, rule.effective_from);
        for old in existing.iter().filter(|r| superseded.contains(&r.id)) {
            tx.update_payout_rule(old).await?;
        }
        tx.insert_payout_rule(&rule).await?;
        tx.commit().await?;

        info!(rule_id = %rule.id, superseded = superseded.len(), "payout rule upserted");
        Ok(rule)
    }

    pub async fn payout_rules(
        &self,
        store: &dyn LedgerStore,
        ctx: OperationContext,
        teacher_id: TeacherId,
    ) -> LedgerResult<Vec<PayoutRule>> {
        let mut tx = store.begin(ctx.tenant_id).await?;
        tx.payout_rules(teacher_id).await
    }

    #[instrument(skip_all, fields(tenant_id = %ctx.tenant_id, %class_id, %teacher_id), err)]
    pub async fn assign_class_teacher(
        &self,
        store: &dyn LedgerStore,
        ctx: OperationContext,
        class_id: ClassId,
        teacher_id: TeacherId,
    ) -> LedgerResult<()> {
        let mut tx = store.begin(ctx.tenant_id).await?;
        tx.assign_class_teacher(class_id, teacher_id).await?;
        tx.commit().await?;
        info!("class teacher assigned");
        Ok(())
    }

    /// Cash-basis payout for `teacher_id` over `[period_start, period_end]`.
    #[instrument(skip_all, fields(tenant_id = %ctx.tenant_id, %teacher_id, %period_start, %period_end), err)]
    pub async fn get_payout(
        &self,
        store: &dyn LedgerStore,
        ctx: OperationContext,
        teacher_id: TeacherId,
        period_start: NaiveDate,
        period_end: NaiveDate,
    ) -> LedgerResult<PayoutStatement> {
        let period = PayoutPeriod::new(period_start, period_end)?;
        let mut tx = store.begin(ctx.tenant_id).await?;
        let classes = tx.classes_for_teacher(teacher_id).await?;
        let rules = tx.payout_rules(teacher_id).await?;
        if classes.is_empty() && rules.is_empty() {
            return Err(LedgerError::not_found("teacher", teacher_id));
        }

        let selection = select_rule(&rules, period.end)
            .ok_or_else(|| LedgerError::not_found("payout rule", teacher_id))?;
        if selection.is_ambiguous() {
            warn!(
                chosen = %selection.rule.id,
                overlapping = ?selection.overlapping,
                "overlapping active payout rules"
            );
        }

        let allocations = if classes.is_empty() {
            Vec::new()
        } else {
            tx.revenue_allocations(&classes, period.start, period.end).await?
        };
        let base = revenue_base(period, &allocations)?;
        PayoutStatement::build(
            teacher_id,
            period,
            base,
            selection,
            self.config.reject_ambiguous_payout_rules,
        )
    }
}
