//! Billing domain: invoices, payments, the allocation engine and adjustments.
//!
//! This crate contains business rules only, implemented as deterministic
//! domain logic (no IO, no HTTP, no storage).

pub mod adjustment;
pub mod allocation;
pub mod chain;
pub mod invoice;
pub mod payment;

pub use adjustment::{AdjustmentKind, InvoiceAdjustment, NewAdjustment};
pub use allocation::{
    AllocationPlan, AllocationStep, AllocationTarget, OverpaymentPolicy, PaymentAllocation,
    check_invoice_coverage, check_payment_conservation, execute_plan, fifo_queue,
    plan_allocation, reverse_allocations, unapplied_credit,
};
pub use chain::{ChainWalker, DEFAULT_MAX_CHAIN_LEN, check_parent_link};
pub use invoice::{BillingPeriod, Invoice, InvoiceKind, InvoiceStatus, LineItem, NewInvoice};
pub use payment::{
    NewPayment, Payment, PaymentMethod, PaymentStatus, SettlementChannel, format_receipt_number,
};
