//! End-to-end ledger scenarios against the in-memory store.
//!
//! Verifies:
//! - Payments allocate, refund and reconcile with money conserved
//! - Daily close locking is final, including under concurrent requests
//! - Payouts use the rule in force and cash-basis revenue
//! - Tenant isolation and rollback on failure

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{DateTime, NaiveDate, TimeZone, Utc};

    use bursar_billing::{
        AdjustmentKind, BillingPeriod, InvoiceKind, InvoiceStatus, LineItem, NewAdjustment,
        NewInvoice, NewPayment, OverpaymentPolicy, PaymentMethod, PaymentStatus,
    };
    use bursar_core::{
        BasisPoints, ClassId, InvoiceId, LedgerError, Money, StudentId, TeacherId, TenantId,
        UserId,
    };
    use bursar_payouts::{NewPayoutRule, RateSchedule};
    use bursar_reconciliation::{CloseEntry, DailyCloseState};

    use crate::config::LedgerConfig;
    use crate::services::{DailyCloseService, LedgerService, OperationContext, PayoutService};
    use crate::store::{InMemoryLedgerStore, LedgerStore, LedgerTx};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn noon(day: NaiveDate) -> DateTime<Utc> {
        Utc.from_utc_datetime(&day.and_hms_opt(12, 0, 0).unwrap())
    }

    fn ctx(tenant_id: TenantId, day: NaiveDate) -> OperationContext {
        OperationContext::new(tenant_id, UserId::new()).at(noon(day))
    }

    fn invoice_cmd(student_id: StudentId, total: i64, due: NaiveDate) -> NewInvoice {
        NewInvoice {
            student_id,
            class_id: None,
            kind: InvoiceKind::OneOff,
            issue_date: Some(date(2024, 1, 1)),
            due_date: due,
            billing_period: None,
            parent_invoice_id: None,
            line_items: vec![LineItem {
                description: "Tuition".to_string(),
                quantity: 1,
                unit_price: Money::new(total),
            }],
            discount: Money::ZERO,
            late_fee: Money::ZERO,
            as_draft: false,
        }
    }

    fn pay(student_id: StudentId, amount: i64) -> NewPayment {
        NewPayment {
            student_id,
            invoice_id: None,
            amount: Money::new(amount),
            method: PaymentMethod::Cash,
            payment_date: None,
            notes: None,
        }
    }

    fn entry(cash: i64, bank: i64) -> CloseEntry {
        CloseEntry {
            actual_cash: Money::new(cash),
            actual_bank: Money::new(bank),
            notes: None,
        }
    }

    fn setup() -> (InMemoryLedgerStore, LedgerService, TenantId) {
        (
            InMemoryLedgerStore::new(),
            LedgerService::new(LedgerConfig::default()),
            TenantId::new(),
        )
    }

    #[tokio::test]
    async fn single_payment_settles_single_invoice() {
        let (store, ledger, tenant) = setup();
        let student = StudentId::new();
        let today = ctx(tenant, date(2024, 1, 10));

        let invoice = ledger
            .create_invoice(&store, today, invoice_cmd(student, 9_000, date(2024, 1, 31)))
            .await
            .unwrap();
        let receipt = ledger.record_payment(&store, today, pay(student, 9_000)).await.unwrap();

        assert_eq!(receipt.payment.receipt_number, "RCPT-20240110-000001");
        assert_eq!(receipt.allocations.len(), 1);
        assert_eq!(receipt.allocations[0].invoice_id, invoice.id);
        assert_eq!(receipt.allocations[0].amount, Money::new(9_000));
        assert_eq!(receipt.unapplied, Money::ZERO);

        let details = ledger.get_invoice(&store, today, invoice.id).await.unwrap();
        assert_eq!(details.invoice.balance_due, Money::ZERO);
        assert_eq!(details.invoice.status, InvoiceStatus::Paid);
        assert_eq!(details.allocations.len(), 1);
    }

    #[tokio::test]
    async fn untargeted_payment_goes_to_earliest_due_invoice_first() {
        let (store, ledger, tenant) = setup();
        let student = StudentId::new();
        let today = ctx(tenant, date(2024, 1, 8));

        let b = ledger
            .create_invoice(&store, today, invoice_cmd(student, 3_000, date(2024, 1, 10)))
            .await
            .unwrap();
        let a = ledger
            .create_invoice(&store, today, invoice_cmd(student, 5_000, date(2024, 1, 5)))
            .await
            .unwrap();

        let receipt = ledger.record_payment(&store, today, pay(student, 6_000)).await.unwrap();
        let split: Vec<(InvoiceId, Money)> =
            receipt.allocations.iter().map(|a| (a.invoice_id, a.amount)).collect();
        assert_eq!(split, vec![(a.id, Money::new(5_000)), (b.id, Money::new(1_000))]);

        let a = ledger.get_invoice(&store, today, a.id).await.unwrap().invoice;
        let b = ledger.get_invoice(&store, today, b.id).await.unwrap().invoice;
        assert_eq!(a.status, InvoiceStatus::Paid);
        assert_eq!(b.balance_due, Money::new(2_000));
        assert_eq!(b.status, InvoiceStatus::Sent);
    }

    #[tokio::test]
    async fn refund_reverses_allocations_and_reopens_invoice() {
        let (store, ledger, tenant) = setup();
        let student = StudentId::new();
        let today = ctx(tenant, date(2024, 1, 10));
        let invoice = ledger
            .create_invoice(&store, today, invoice_cmd(student, 9_000, date(2024, 1, 31)))
            .await
            .unwrap();
        let receipt = ledger.record_payment(&store, today, pay(student, 9_000)).await.unwrap();

        let refund = ledger
            .refund_payment(&store, today, receipt.payment.id)
            .await
            .unwrap();
        assert_eq!(refund.payment.status, PaymentStatus::Refunded);
        assert_eq!(refund.reversed_allocations.len(), 1);
        assert!(refund.reversed_allocations[0].reversed_at.is_some());
        assert_eq!(refund.voided_credit, Money::ZERO);

        let details = ledger.get_invoice(&store, today, invoice.id).await.unwrap();
        assert_eq!(details.invoice.balance_due, Money::new(9_000));
        assert_eq!(details.invoice.amount_paid, Money::ZERO);
        assert_eq!(details.invoice.status, InvoiceStatus::Sent);
        // Reversed rows stay for audit.
        assert_eq!(details.allocations.len(), 1);

        let err = ledger
            .refund_payment(&store, today, receipt.payment.id)
            .await
            .unwrap_err();
        assert_eq!(err, LedgerError::AlreadyRefunded(receipt.payment.id));
    }

    #[tokio::test]
    async fn strict_policy_rejects_overpayment_and_writes_nothing() {
        let (store, ledger, tenant) = setup();
        let student = StudentId::new();
        let today = ctx(tenant, date(2024, 1, 10));
        let invoice = ledger
            .create_invoice(&store, today, invoice_cmd(student, 5_000, date(2024, 1, 31)))
            .await
            .unwrap();

        let mut cmd = pay(student, 6_000);
        cmd.invoice_id = Some(invoice.id);
        let err = ledger.record_payment(&store, today, cmd).await.unwrap_err();
        assert_eq!(
            err,
            LedgerError::Overpayment {
                amount: Money::new(6_000),
                allocatable: Money::new(5_000)
            }
        );

        let details = ledger.get_invoice(&store, today, invoice.id).await.unwrap();
        assert_eq!(details.invoice.balance_due, Money::new(5_000));
        assert!(details.allocations.is_empty());

        // The receipt counter rolled back with the rejected payment.
        let ok = ledger.record_payment(&store, today, pay(student, 5_000)).await.unwrap();
        assert_eq!(ok.payment.receipt_number, "RCPT-20240110-000001");
    }

    #[tokio::test]
    async fn payment_validation_errors() {
        let (store, ledger, tenant) = setup();
        let student = StudentId::new();
        let today = ctx(tenant, date(2024, 1, 10));

        let err = ledger.record_payment(&store, today, pay(student, 0)).await.unwrap_err();
        assert!(matches!(err, LedgerError::InvalidAmount(_)));

        let mut cmd = pay(student, 100);
        cmd.invoice_id = Some(InvoiceId::new());
        let err = ledger.record_payment(&store, today, cmd).await.unwrap_err();
        assert!(matches!(err, LedgerError::NotFound { entity: "invoice", .. }));

        let other = ledger
            .create_invoice(&store, today, invoice_cmd(StudentId::new(), 1_000, date(2024, 1, 31)))
            .await
            .unwrap();
        let mut cmd = pay(student, 100);
        cmd.invoice_id = Some(other.id);
        let err = ledger.record_payment(&store, today, cmd).await.unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
    }

    #[tokio::test]
    async fn credit_policy_keeps_and_later_applies_student_credit() {
        let store = InMemoryLedgerStore::new();
        let ledger = LedgerService::new(LedgerConfig {
            overpayment_policy: OverpaymentPolicy::Credit,
            ..LedgerConfig::default()
        });
        let tenant = TenantId::new();
        let student = StudentId::new();
        let jan = ctx(tenant, date(2024, 1, 10));

        ledger
            .create_invoice(&store, jan, invoice_cmd(student, 9_000, date(2024, 1, 31)))
            .await
            .unwrap();
        let receipt = ledger.record_payment(&store, jan, pay(student, 12_000)).await.unwrap();
        assert_eq!(receipt.unapplied, Money::new(3_000));
        assert_eq!(
            ledger.student_credit(&store, jan, student).await.unwrap().unapplied,
            Money::new(3_000)
        );

        let feb = ctx(tenant, date(2024, 2, 1));
        let mut next = invoice_cmd(student, 2_000, date(2024, 2, 28));
        next.issue_date = Some(date(2024, 2, 1));
        let next = ledger.create_invoice(&store, feb, next).await.unwrap();

        let applied = ledger.apply_student_credit(&store, feb, student).await.unwrap();
        assert_eq!(applied.allocations.len(), 1);
        assert_eq!(applied.allocations[0].invoice_id, next.id);
        assert_eq!(applied.allocations[0].payment_id, receipt.payment.id);
        assert_eq!(applied.allocations[0].allocated_on, date(2024, 2, 1));
        assert_eq!(applied.remaining_credit, Money::new(1_000));

        let invoice = ledger.get_invoice(&store, feb, next.id).await.unwrap().invoice;
        assert_eq!(invoice.status, InvoiceStatus::Paid);
        assert_eq!(
            ledger.student_credit(&store, feb, student).await.unwrap().unapplied,
            Money::new(1_000)
        );

        let refund = ledger.refund_payment(&store, feb, receipt.payment.id).await.unwrap();
        assert_eq!(refund.reversed_allocations.len(), 2);
        assert_eq!(refund.voided_credit, Money::new(1_000));
        assert_eq!(
            ledger.student_credit(&store, feb, student).await.unwrap().unapplied,
            Money::ZERO
        );
    }

    #[tokio::test]
    async fn credit_that_would_overflow_the_money_range_is_rejected() {
        let store = InMemoryLedgerStore::new();
        let ledger = LedgerService::new(LedgerConfig {
            overpayment_policy: OverpaymentPolicy::Credit,
            ..LedgerConfig::default()
        });
        let tenant = TenantId::new();
        let student = StudentId::new();
        let today = ctx(tenant, date(2024, 1, 10));
        let large = i64::MAX / 2 + 1;

        let first = ledger.record_payment(&store, today, pay(student, large)).await.unwrap();
        assert_eq!(first.unapplied, Money::new(large));

        let err = ledger
            .record_payment(&store, today, pay(student, large))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));

        assert_eq!(
            ledger.student_credit(&store, today, student).await.unwrap().unapplied,
            Money::new(large)
        );
        let next = ledger.record_payment(&store, today, pay(student, 1)).await.unwrap();
        assert_eq!(next.payment.receipt_number, "RCPT-20240110-000002");
    }

    #[tokio::test]
    async fn adjustments_change_totals_and_status() {
        let (store, ledger, tenant) = setup();
        let student = StudentId::new();
        let today = ctx(tenant, date(2024, 1, 10));
        let invoice = ledger
            .create_invoice(&store, today, invoice_cmd(student, 9_000, date(2024, 1, 31)))
            .await
            .unwrap();
        ledger.record_payment(&store, today, pay(student, 4_000)).await.unwrap();

        let late = ledger
            .apply_adjustment(
                &store,
                today,
                invoice.id,
                NewAdjustment {
                    kind: AdjustmentKind::LateFee,
                    amount: Money::new(500),
                    reason: "paid late last term".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(late.total, Money::new(9_500));
        assert_eq!(late.balance_due, Money::new(5_500));

        let written_off = ledger
            .apply_adjustment(
                &store,
                today,
                invoice.id,
                NewAdjustment {
                    kind: AdjustmentKind::WriteOff,
                    amount: Money::new(-5_500),
                    reason: "hardship".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(written_off.balance_due, Money::ZERO);
        assert_eq!(written_off.status, InvoiceStatus::Paid);

        let err = ledger
            .apply_adjustment(
                &store,
                today,
                invoice.id,
                NewAdjustment {
                    kind: AdjustmentKind::CreditNote,
                    amount: Money::new(-1),
                    reason: "below what was paid".to_string(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));

        let details = ledger.get_invoice(&store, today, invoice.id).await.unwrap();
        assert_eq!(details.adjustments.len(), 2);
    }

    #[tokio::test]
    async fn drafts_take_no_payments_until_issued() {
        let (store, ledger, tenant) = setup();
        let student = StudentId::new();
        let today = ctx(tenant, date(2024, 1, 10));
        let mut cmd = invoice_cmd(student, 1_000, date(2024, 1, 31));
        cmd.as_draft = true;
        let draft = ledger.create_invoice(&store, today, cmd).await.unwrap();
        assert_eq!(draft.status, InvoiceStatus::Draft);

        let err = ledger.record_payment(&store, today, pay(student, 1_000)).await.unwrap_err();
        assert!(matches!(err, LedgerError::Overpayment { .. }));

        let issued = ledger.issue_invoice(&store, today, draft.id).await.unwrap();
        assert_eq!(issued.status, InvoiceStatus::Sent);
        ledger.record_payment(&store, today, pay(student, 1_000)).await.unwrap();
    }

    #[tokio::test]
    async fn refresh_overdue_flags_past_due_invoices() {
        let (store, ledger, tenant) = setup();
        let student = StudentId::new();
        let early = ctx(tenant, date(2024, 1, 2));
        let due_soon = ledger
            .create_invoice(&store, early, invoice_cmd(student, 1_000, date(2024, 1, 5)))
            .await
            .unwrap();
        ledger
            .create_invoice(&store, early, invoice_cmd(student, 1_000, date(2024, 2, 5)))
            .await
            .unwrap();

        let changed = ledger
            .refresh_overdue(&store, ctx(tenant, date(2024, 1, 6)))
            .await
            .unwrap();
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].id, due_soon.id);
        assert_eq!(changed[0].status, InvoiceStatus::Overdue);
    }

    #[tokio::test]
    async fn recurring_chain_walks_root_first_and_is_bounded() {
        let store = InMemoryLedgerStore::new();
        let ledger = LedgerService::new(LedgerConfig {
            max_invoice_chain_len: 3,
            ..LedgerConfig::default()
        });
        let tenant = TenantId::new();
        let student = StudentId::new();
        let today = ctx(tenant, date(2024, 1, 10));

        let mut parent = None;
        let mut ids = Vec::new();
        for _ in 0..3 {
            let mut cmd = invoice_cmd(student, 1_000, date(2024, 1, 31));
            cmd.kind = InvoiceKind::Recurring;
            cmd.billing_period = Some(BillingPeriod::new(date(2024, 1, 1), date(2024, 1, 31)).unwrap());
            cmd.parent_invoice_id = parent;
            let invoice = ledger.create_invoice(&store, today, cmd).await.unwrap();
            parent = Some(invoice.id);
            ids.push(invoice.id);
        }

        let chain = ledger.invoice_chain(&store, today, ids[2]).await.unwrap();
        assert_eq!(chain.iter().map(|i| i.id).collect::<Vec<_>>(), ids);

        let mut fourth = invoice_cmd(student, 1_000, date(2024, 1, 31));
        fourth.kind = InvoiceKind::Recurring;
        fourth.billing_period = Some(BillingPeriod::new(date(2024, 1, 1), date(2024, 1, 31)).unwrap());
        fourth.parent_invoice_id = parent;
        let err = ledger.create_invoice(&store, today, fourth).await.unwrap_err();
        assert!(matches!(err, LedgerError::InvariantViolation(_)));
    }

    #[tokio::test]
    async fn daily_close_shortage_lock_and_immutability() {
        let (store, ledger, tenant) = setup();
        let closes = DailyCloseService::new(LedgerConfig::default());
        let student = StudentId::new();
        let day = date(2024, 3, 5);
        let today = ctx(tenant, day);

        ledger
            .create_invoice(&store, today, invoice_cmd(student, 10_000, date(2024, 3, 31)))
            .await
            .unwrap();
        let receipt = ledger.record_payment(&store, today, pay(student, 10_000)).await.unwrap();

        let preview = closes.get(&store, today, day).await.unwrap();
        assert_eq!(preview.state, DailyCloseState::NoRecord);
        assert_eq!(preview.expected.cash, Money::new(10_000));
        assert_eq!(preview.expected.bank, Money::ZERO);

        let draft = closes.save(&store, today, day, entry(9_800, 0)).await.unwrap();
        assert_eq!(draft.variance, Money::new(-200));
        assert!(!draft.is_locked);

        let locked = closes.lock(&store, today, day, entry(9_800, 0)).await.unwrap();
        assert!(locked.is_locked);
        assert_eq!(locked.variance, Money::new(-200));
        assert_eq!(locked.closed_by, Some(today.actor));

        let err = closes.save(&store, today, day, entry(10_000, 0)).await.unwrap_err();
        assert_eq!(err, LedgerError::AlreadyFinalized(day));
        let err = closes.lock(&store, today, day, entry(10_000, 0)).await.unwrap_err();
        assert_eq!(err, LedgerError::AlreadyFinalized(day));

        // A later refund must not move the finalized day.
        ledger.refund_payment(&store, today, receipt.payment.id).await.unwrap();
        let view = closes.get(&store, today, day).await.unwrap();
        assert_eq!(view.state, DailyCloseState::Locked);
        assert_eq!(view.record, Some(locked));
    }

    #[tokio::test]
    async fn draft_close_reads_live_expected_totals() {
        let (store, ledger, tenant) = setup();
        let closes = DailyCloseService::new(LedgerConfig::default());
        let student = StudentId::new();
        let day = date(2024, 3, 5);
        let today = ctx(tenant, day);
        ledger
            .create_invoice(&store, today, invoice_cmd(student, 10_000, date(2024, 3, 31)))
            .await
            .unwrap();

        closes.save(&store, today, day, entry(500, 0)).await.unwrap();
        let mut bank = pay(student, 500);
        bank.method = PaymentMethod::BankTransfer;
        ledger.record_payment(&store, today, bank).await.unwrap();

        let view = closes.get(&store, today, day).await.unwrap();
        assert_eq!(view.state, DailyCloseState::Draft);
        assert_eq!(view.expected.bank, Money::new(500));
        assert_eq!(view.record.unwrap().variance, Money::ZERO);
    }

    #[tokio::test]
    async fn daily_close_rejects_future_dates() {
        let (store, _, tenant) = setup();
        let closes = DailyCloseService::new(LedgerConfig::default());
        let today = ctx(tenant, date(2024, 3, 5));

        let err = closes.save(&store, today, date(2024, 3, 6), entry(0, 0)).await.unwrap_err();
        assert!(matches!(err, LedgerError::FutureDate { .. }));
        let err = closes.lock(&store, today, date(2024, 3, 6), entry(0, 0)).await.unwrap_err();
        assert!(matches!(err, LedgerError::FutureDate { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_locks_only_one_wins() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let closes = Arc::new(DailyCloseService::new(LedgerConfig::default()));
        let tenant = TenantId::new();
        let day = date(2024, 3, 5);

        let mut handles = Vec::new();
        for _ in 0..2 {
            let store = store.clone();
            let closes = closes.clone();
            handles.push(tokio::spawn(async move {
                closes
                    .lock(&*store, ctx(tenant, day), day, entry(100, 0))
                    .await
            }));
        }
        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results.iter().any(|r| matches!(
            r,
            Err(LedgerError::AlreadyFinalized(_)) | Err(LedgerError::Concurrency(_))
        )));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_payments_on_one_invoice_never_overdraw_it() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let ledger = Arc::new(LedgerService::new(LedgerConfig::default()));
        let tenant = TenantId::new();
        let student = StudentId::new();
        let today = ctx(tenant, date(2024, 1, 10));
        let invoice = ledger
            .create_invoice(&*store, today, invoice_cmd(student, 9_000, date(2024, 1, 31)))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..2 {
            let store = store.clone();
            let ledger = ledger.clone();
            let mut cmd = pay(student, 6_000);
            cmd.invoice_id = Some(invoice.id);
            handles.push(tokio::spawn(async move {
                ledger.record_payment(&*store, today, cmd).await
            }));
        }
        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        let details = ledger.get_invoice(&*store, today, invoice.id).await.unwrap();
        assert_eq!(details.invoice.amount_paid, Money::new(6_000));
        assert_eq!(details.invoice.balance_due, Money::new(3_000));
    }

    #[tokio::test]
    async fn fixed_and_tiered_payouts_from_collected_revenue() {
        let (store, ledger, tenant) = setup();
        let payouts = PayoutService::new(LedgerConfig::default());
        let jan = ctx(tenant, date(2024, 1, 15));

        for (percentage_rule, revenue, expected) in [
            (
                RateSchedule::Fixed {
                    percentage: BasisPoints::from_whole_percent(70).unwrap(),
                },
                21_000,
                14_700,
            ),
            (
                RateSchedule::Tiered {
                    tier1_percentage: BasisPoints::from_whole_percent(70).unwrap(),
                    tier1_threshold: Money::new(15_000),
                    tier2_percentage: BasisPoints::from_whole_percent(60).unwrap(),
                },
                20_000,
                13_500,
            ),
        ] {
            let teacher = TeacherId::new();
            let class = ClassId::new();
            let student = StudentId::new();
            payouts.assign_class_teacher(&store, jan, class, teacher).await.unwrap();
            payouts
                .upsert_payout_rule(
                    &store,
                    jan,
                    NewPayoutRule {
                        teacher_id: teacher,
                        schedule: percentage_rule,
                        effective_from: date(2024, 1, 1),
                    },
                )
                .await
                .unwrap();

            let mut cmd = invoice_cmd(student, revenue, date(2024, 1, 31));
            cmd.class_id = Some(class);
            ledger.create_invoice(&store, jan, cmd).await.unwrap();
            ledger.record_payment(&store, jan, pay(student, revenue)).await.unwrap();
            // Billed but not collected: not revenue.
            let mut unpaid = invoice_cmd(student, 50_000, date(2024, 1, 31));
            unpaid.class_id = Some(class);
            ledger.create_invoice(&store, jan, unpaid).await.unwrap();

            let statement = payouts
                .get_payout(&store, jan, teacher, date(2024, 1, 1), date(2024, 1, 31))
                .await
                .unwrap();
            assert_eq!(statement.revenue_base, Money::new(revenue));
            assert_eq!(statement.payout, Money::new(expected));
            assert!(statement.warnings.is_empty());
        }
    }

    #[tokio::test]
    async fn payout_uses_rule_in_force_at_period_end() {
        let (store, _, tenant) = setup();
        let payouts = PayoutService::new(LedgerConfig::default());
        let teacher = TeacherId::new();
        let now = ctx(tenant, date(2024, 3, 15));
        payouts.assign_class_teacher(&store, now, ClassId::new(), teacher).await.unwrap();

        for (percent, from) in [(70, date(2024, 1, 1)), (60, date(2024, 3, 1))] {
            payouts
                .upsert_payout_rule(
                    &store,
                    now,
                    NewPayoutRule {
                        teacher_id: teacher,
                        schedule: RateSchedule::Fixed {
                            percentage: BasisPoints::from_whole_percent(percent).unwrap(),
                        },
                        effective_from: from,
                    },
                )
                .await
                .unwrap();
        }

        let rules = payouts.payout_rules(&store, now, teacher).await.unwrap();
        assert_eq!(rules.len(), 2);
        assert!(!rules[0].is_active);
        assert_eq!(rules[0].superseded_from, Some(date(2024, 3, 1)));

        let feb = payouts
            .get_payout(&store, now, teacher, date(2024, 2, 1), date(2024, 2, 29))
            .await
            .unwrap();
        assert_eq!(feb.rule_applied.id, rules[0].id);
        let mar = payouts
            .get_payout(&store, now, teacher, date(2024, 3, 1), date(2024, 3, 31))
            .await
            .unwrap();
        assert_eq!(mar.rule_applied.id, rules[1].id);

        let err = payouts
            .get_payout(&store, now, teacher, date(2023, 12, 1), date(2023, 12, 31))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::NotFound { entity: "payout rule", .. }));
        let err = payouts
            .get_payout(&store, now, TeacherId::new(), date(2024, 3, 1), date(2024, 3, 31))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::NotFound { entity: "teacher", .. }));
        let err = payouts
            .get_payout(&store, now, teacher, date(2024, 3, 31), date(2024, 3, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
    }

    #[tokio::test]
    async fn overlapping_rules_in_storage_warn_or_reject() {
        let store = InMemoryLedgerStore::new();
        let tenant = TenantId::new();
        let teacher = TeacherId::new();
        let now = ctx(tenant, date(2024, 1, 15));

        // Two active rules with the same start, as left by a bad data import.
        {
            let mut tx = store.begin(tenant).await.unwrap();
            for (percent, offset) in [(70, 0), (80, 1)] {
                let rule = bursar_payouts::PayoutRule::create(
                    bursar_core::PayoutRuleId::new(),
                    tenant,
                    NewPayoutRule {
                        teacher_id: teacher,
                        schedule: RateSchedule::Fixed {
                            percentage: BasisPoints::from_whole_percent(percent).unwrap(),
                        },
                        effective_from: date(2024, 1, 1),
                    },
                    UserId::new(),
                    noon(date(2024, 1, 1)) + chrono::Duration::seconds(offset),
                )
                .unwrap();
                tx.insert_payout_rule(&rule).await.unwrap();
            }
            tx.commit().await.unwrap();
        }

        let lenient = PayoutService::new(LedgerConfig::default());
        let statement = lenient
            .get_payout(&store, now, teacher, date(2024, 1, 1), date(2024, 1, 31))
            .await
            .unwrap();
        assert_eq!(statement.warnings.len(), 1);
        assert_eq!(
            statement.rule_applied.schedule,
            RateSchedule::Fixed {
                percentage: BasisPoints::from_whole_percent(80).unwrap()
            }
        );

        let strict = PayoutService::new(LedgerConfig {
            reject_ambiguous_payout_rules: true,
            ..LedgerConfig::default()
        });
        let err = strict
            .get_payout(&store, now, teacher, date(2024, 1, 1), date(2024, 1, 31))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::AmbiguousPayoutRule { .. }));
    }

    #[tokio::test]
    async fn tenants_do_not_see_each_other() {
        let (store, ledger, tenant) = setup();
        let student = StudentId::new();
        let today = ctx(tenant, date(2024, 1, 10));
        let invoice = ledger
            .create_invoice(&store, today, invoice_cmd(student, 1_000, date(2024, 1, 31)))
            .await
            .unwrap();

        let other = ctx(TenantId::new(), date(2024, 1, 10));
        let err = ledger.get_invoice(&store, other, invoice.id).await.unwrap_err();
        assert!(matches!(err, LedgerError::NotFound { .. }));
        assert!(ledger.list_invoices(&store, other, None).await.unwrap().is_empty());
    }

    /// Store wrapper that records which transaction calls were made, in order.
    mod recording {
        use std::sync::{Arc, Mutex};

        use async_trait::async_trait;
        use chrono::NaiveDate;

        use bursar_billing::{Invoice, InvoiceAdjustment, Payment, PaymentAllocation};
        use bursar_core::{
            ClassId, ExpectedVersion, InvoiceId, LedgerResult, PaymentId, StudentId, TeacherId,
            TenantId,
        };
        use bursar_payouts::PayoutRule;
        use bursar_reconciliation::DailyClose;

        use crate::store::{InMemoryLedgerStore, LedgerStore, LedgerTx};

        #[derive(Default)]
        pub struct RecordingStore {
            pub inner: InMemoryLedgerStore,
            pub calls: Arc<Mutex<Vec<&'static str>>>,
        }

        struct RecordingTx {
            inner: Box<dyn LedgerTx>,
            calls: Arc<Mutex<Vec<&'static str>>>,
        }

        impl RecordingTx {
            fn log(&self, call: &'static str) {
                self.calls.lock().unwrap().push(call);
            }
        }

        #[async_trait]
        impl LedgerStore for RecordingStore {
            async fn begin(&self, tenant_id: TenantId) -> LedgerResult<Box<dyn LedgerTx>> {
                Ok(Box::new(RecordingTx {
                    inner: self.inner.begin(tenant_id).await?,
                    calls: self.calls.clone(),
                }))
            }
        }

        #[async_trait]
        impl LedgerTx for RecordingTx {
            fn tenant_id(&self) -> TenantId {
                self.inner.tenant_id()
            }
            async fn next_receipt_number(&mut self, date: NaiveDate) -> LedgerResult<String> {
                self.log("next_receipt_number");
                self.inner.next_receipt_number(date).await
            }
            async fn insert_invoice(&mut self, invoice: &Invoice) -> LedgerResult<()> {
                self.log("insert_invoice");
                self.inner.insert_invoice(invoice).await
            }
            async fn get_invoice(&mut self, id: InvoiceId) -> LedgerResult<Option<Invoice>> {
                self.inner.get_invoice(id).await
            }
            async fn lock_invoice(&mut self, id: InvoiceId) -> LedgerResult<Option<Invoice>> {
                self.log("lock_invoice");
                self.inner.lock_invoice(id).await
            }
            async fn lock_open_invoices(&mut self, student_id: StudentId) -> LedgerResult<Vec<Invoice>> {
                self.log("lock_open_invoices");
                self.inner.lock_open_invoices(student_id).await
            }
            async fn lock_invoices(&mut self, ids: &[InvoiceId]) -> LedgerResult<Vec<Invoice>> {
                self.log("lock_invoices");
                self.inner.lock_invoices(ids).await
            }
            async fn lock_overdue_candidates(&mut self, today: NaiveDate) -> LedgerResult<Vec<Invoice>> {
                self.inner.lock_overdue_candidates(today).await
            }
            async fn update_invoice(&mut self, invoice: &Invoice, expected: ExpectedVersion) -> LedgerResult<()> {
                self.log("update_invoice");
                self.inner.update_invoice(invoice, expected).await
            }
            async fn list_invoices(&mut self, student_id: Option<StudentId>) -> LedgerResult<Vec<Invoice>> {
                self.inner.list_invoices(student_id).await
            }
            async fn insert_payment(&mut self, payment: &Payment) -> LedgerResult<()> {
                self.log("insert_payment");
                self.inner.insert_payment(payment).await
            }
            async fn get_payment(&mut self, id: PaymentId) -> LedgerResult<Option<Payment>> {
                self.inner.get_payment(id).await
            }
            async fn lock_payment(&mut self, id: PaymentId) -> LedgerResult<Option<Payment>> {
                self.inner.lock_payment(id).await
            }
            async fn lock_student_payments(&mut self, student_id: StudentId) -> LedgerResult<Vec<Payment>> {
                self.log("lock_student_payments");
                self.inner.lock_student_payments(student_id).await
            }
            async fn update_payment(&mut self, payment: &Payment, expected: ExpectedVersion) -> LedgerResult<()> {
                self.inner.update_payment(payment, expected).await
            }
            async fn payments_on(&mut self, date: NaiveDate) -> LedgerResult<Vec<Payment>> {
                self.inner.payments_on(date).await
            }
            async fn insert_allocations(&mut self, rows: &[PaymentAllocation]) -> LedgerResult<()> {
                self.log("insert_allocations");
                self.inner.insert_allocations(rows).await
            }
            async fn allocations_for_payments(&mut self, ids: &[PaymentId]) -> LedgerResult<Vec<PaymentAllocation>> {
                self.inner.allocations_for_payments(ids).await
            }
            async fn allocations_for_invoice(&mut self, id: InvoiceId) -> LedgerResult<Vec<PaymentAllocation>> {
                self.inner.allocations_for_invoice(id).await
            }
            async fn mark_allocations_reversed(&mut self, rows: &[PaymentAllocation]) -> LedgerResult<()> {
                self.inner.mark_allocations_reversed(rows).await
            }
            async fn revenue_allocations(
                &mut self,
                class_ids: &[ClassId],
                start: NaiveDate,
                end: NaiveDate,
            ) -> LedgerResult<Vec<PaymentAllocation>> {
                self.inner.revenue_allocations(class_ids, start, end).await
            }
            async fn insert_adjustment(&mut self, adjustment: &InvoiceAdjustment) -> LedgerResult<()> {
                self.inner.insert_adjustment(adjustment).await
            }
            async fn adjustments_for_invoice(&mut self, id: InvoiceId) -> LedgerResult<Vec<InvoiceAdjustment>> {
                self.inner.adjustments_for_invoice(id).await
            }
            async fn get_daily_close(&mut self, date: NaiveDate) -> LedgerResult<Option<DailyClose>> {
                self.inner.get_daily_close(date).await
            }
            async fn lock_daily_close(&mut self, date: NaiveDate) -> LedgerResult<Option<DailyClose>> {
                self.inner.lock_daily_close(date).await
            }
            async fn insert_daily_close(&mut self, close: &DailyClose) -> LedgerResult<()> {
                self.inner.insert_daily_close(close).await
            }
            async fn update_daily_close(&mut self, close: &DailyClose, expected: ExpectedVersion) -> LedgerResult<()> {
                self.inner.update_daily_close(close, expected).await
            }
            async fn insert_payout_rule(&mut self, rule: &PayoutRule) -> LedgerResult<()> {
                self.inner.insert_payout_rule(rule).await
            }
            async fn lock_payout_rules(&mut self, teacher_id: TeacherId) -> LedgerResult<Vec<PayoutRule>> {
                self.inner.lock_payout_rules(teacher_id).await
            }
            async fn update_payout_rule(&mut self, rule: &PayoutRule) -> LedgerResult<()> {
                self.inner.update_payout_rule(rule).await
            }
            async fn payout_rules(&mut self, teacher_id: TeacherId) -> LedgerResult<Vec<PayoutRule>> {
                self.inner.payout_rules(teacher_id).await
            }
            async fn assign_class_teacher(&mut self, class_id: ClassId, teacher_id: TeacherId) -> LedgerResult<()> {
                self.inner.assign_class_teacher(class_id, teacher_id).await
            }
            async fn classes_for_teacher(&mut self, teacher_id: TeacherId) -> LedgerResult<Vec<ClassId>> {
                self.inner.classes_for_teacher(teacher_id).await
            }
            async fn commit(self: Box<Self>) -> LedgerResult<()> {
                self.log("commit");
                self.inner.commit().await
            }
        }
    }

    #[tokio::test]
    async fn receipt_number_is_taken_after_invoice_writes() {
        let store = recording::RecordingStore::default();
        let ledger = LedgerService::new(LedgerConfig::default());
        let tenant = TenantId::new();
        let student = StudentId::new();
        let today = ctx(tenant, date(2024, 1, 10));

        ledger
            .create_invoice(&store, today, invoice_cmd(student, 9_000, date(2024, 1, 31)))
            .await
            .unwrap();
        store.calls.lock().unwrap().clear();

        let receipt = ledger.record_payment(&store, today, pay(student, 9_000)).await.unwrap();
        assert_eq!(receipt.payment.receipt_number, "RCPT-20240110-000001");
        assert_eq!(
            *store.calls.lock().unwrap(),
            vec![
                "lock_open_invoices",
                "update_invoice",
                "next_receipt_number",
                "insert_payment",
                "insert_allocations",
                "commit",
            ]
        );
    }
}
