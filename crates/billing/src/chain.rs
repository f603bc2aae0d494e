//! Recurring invoice chains.
//!
//! A recurring invoice may point at the invoice it renews. The chain is walked
//! one parent at a time by the caller (which owns the storage lookups), so
//! depth is bounded by configuration rather than by the stack.

use std::collections::HashSet;

use bursar_core::{InvoiceId, LedgerError, LedgerResult};

use crate::invoice::{Invoice, InvoiceKind};

pub const DEFAULT_MAX_CHAIN_LEN: usize = 240;

/// Accumulates a chain from a leaf towards its root.
///
/// ```ignore
/// let mut walker = ChainWalker::new(max_len);
/// let mut next = Some(leaf);
/// while let Some(invoice) = next {
///     let parent = walker.push(invoice)?;
///     next = match parent { Some(id) => Some(load(id)?), None => None };
/// }
/// let chain = walker.finish();
/// ```
#[derive(Debug)]
pub struct ChainWalker {
    max_len: usize,
    seen: HashSet<InvoiceId>,
    links: Vec<Invoice>,
}

impl ChainWalker {
    pub fn new(max_len: usize) -> Self {
        Self {
            max_len: max_len.max(1),
            seen: HashSet::new(),
            links: Vec::new(),
        }
    }

    /// Append the next link and return the parent id to load, if any.
    pub fn push(&mut self, invoice: Invoice) -> LedgerResult<Option<InvoiceId>> {
        if !self.seen.insert(invoice.id) {
            return Err(LedgerError::invariant(format!(
                "invoice chain revisits {}",
                invoice.id
            )));
        }
        if self.links.len() >= self.max_len {
            return Err(LedgerError::invariant(format!(
                "invoice chain exceeds {} links",
                self.max_len
            )));
        }
        let parent = invoice.parent_invoice_id;
        self.links.push(invoice);
        Ok(parent)
    }

    /// The chain, root first.
    pub fn finish(mut self) -> Vec<Invoice> {
        self.links.reverse();
        self.links
    }
}

/// Can `child` hang off `parent`, given the parent's chain length?
pub fn check_parent_link(
    parent: &Invoice,
    child: &Invoice,
    parent_chain_len: usize,
    max_len: usize,
) -> LedgerResult<()> {
    if parent.kind != InvoiceKind::Recurring || child.kind != InvoiceKind::Recurring {
        return Err(LedgerError::validation(
            "only recurring invoices can be chained",
        ));
    }
    if parent.student_id != child.student_id {
        return Err(LedgerError::validation(
            "parent invoice belongs to a different student",
        ));
    }
    if parent_chain_len + 1 > max_len {
        return Err(LedgerError::invariant(format!(
            "invoice chain would exceed {max_len} links"
        )));
    }
    Ok(())
}
