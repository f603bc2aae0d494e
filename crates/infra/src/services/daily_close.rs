use chrono::NaiveDate;
use tracing::{info, instrument};

use bursar_core::{ExpectedVersion, LedgerResult};
use bursar_reconciliation::{
    CloseEntry, DailyClose, DailyCloseView, ExpectedTotals, check_close_date,
};

use crate::config::LedgerConfig;
use crate::store::{LedgerStore, LedgerTx};

use super::OperationContext;

/// Daily reconciliation of counted cash and bank totals.
#[derive(Debug, Clone, Default)]
pub struct DailyCloseService {
    config: LedgerConfig,
}

impl DailyCloseService {
    pub fn new(config: LedgerConfig) -> Self {
        Self { config }
    }

    /// The record for `close_date`, or a preview of the expected totals when
    /// nobody has saved one yet. Drafts show live expected totals.
    #[instrument(skip_all, fields(tenant_id = %ctx.tenant_id, %close_date), err)]
    pub async fn get(
        &self,
        store: &dyn LedgerStore,
        ctx: OperationContext,
        close_date: NaiveDate,
    ) -> LedgerResult<DailyCloseView> {
        let mut tx = store.begin(ctx.tenant_id).await?;
        let expected = expected_totals(tx.as_mut(), close_date).await?;
        Ok(match tx.get_daily_close(close_date).await? {
            Some(mut record) => {
                record.refresh_expected(expected)?;
                DailyCloseView::of(record)
            }
            None => DailyCloseView::preview(close_date, expected),
        })
    }

    /// `NoRecord → Draft` or `Draft → Draft`.
    #[instrument(skip_all, fields(tenant_id = %ctx.tenant_id, %close_date), err)]
    pub async fn save(
        &self,
        store: &dyn LedgerStore,
        ctx: OperationContext,
        close_date: NaiveDate,
        entry: CloseEntry,
    ) -> LedgerResult<DailyClose> {
        let today = self.config.business_date(ctx.now);
        check_close_date(close_date, today)?;
        let mut tx = store.begin(ctx.tenant_id).await?;
        let existing = tx.lock_daily_close(close_date).await?;
        let expected = expected_totals(tx.as_mut(), close_date).await?;

        let close = match existing {
            Some(mut record) => {
                let read = record.version;
                record.revise(entry, expected, ctx.actor, ctx.now)?;
                tx.update_daily_close(&record, ExpectedVersion::Exact(read)).await?;
                record
            }
            None => {
                let record = DailyClose::open_draft(
                    ctx.tenant_id,
                    close_date,
                    entry,
                    expected,
                    ctx.actor,
                    today,
                    ctx.now,
                )?;
                tx.insert_daily_close(&record).await?;
                record
            }
        };
        tx.commit().await?;

        info!(variance = %close.variance, "daily close draft saved");
        Ok(close)
    }

    /// `Draft → Locked` (or straight from `NoRecord`). Expected totals are
    /// frozen at lock time.
    #[instrument(skip_all, fields(tenant_id = %ctx.tenant_id, %close_date), err)]
    pub async fn lock(
        &self,
        store: &dyn LedgerStore,
        ctx: OperationContext,
        close_date: NaiveDate,
        entry: CloseEntry,
    ) -> LedgerResult<DailyClose> {
        let today = self.config.business_date(ctx.now);
        check_close_date(close_date, today)?;
        let mut tx = store.begin(ctx.tenant_id).await?;
        let existing = tx.lock_daily_close(close_date).await?;
        let expected = expected_totals(tx.as_mut(), close_date).await?;

        let close = match existing {
            Some(mut record) => {
                let read = record.version;
                record.finalize(entry, expected, ctx.actor, ctx.now)?;
                tx.update_daily_close(&record, ExpectedVersion::Exact(read)).await?;
                record
            }
            None => {
                let mut record = DailyClose::open_draft(
                    ctx.tenant_id,
                    close_date,
                    entry.clone(),
                    expected,
                    ctx.actor,
                    today,
                    ctx.now,
                )?;
                record.finalize(entry, expected, ctx.actor, ctx.now)?;
                tx.insert_daily_close(&record).await?;
                record
            }
        };
        tx.commit().await?;

        info!(
            expected_cash = %close.expected_cash,
            expected_bank = %close.expected_bank,
            variance = %close.variance,
            "daily close locked"
        );
        Ok(close)
    }
}

async fn expected_totals(tx: &mut dyn LedgerTx, close_date: NaiveDate) -> LedgerResult<ExpectedTotals> {
    let payments = tx.payments_on(close_date).await?;
    ExpectedTotals::from_payments(close_date, &payments)
}
