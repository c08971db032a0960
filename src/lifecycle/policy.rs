//! Pure transition and cancel policy for tracked transfers.
//!
//! Everything here takes `now` as an argument and touches no I/O, so the
//! safety windows are directly testable.

use crate::error::{RouterError, RouterResult};
use crate::types::{TransactionId, TransactionRecord, TransactionStatus};

/// Wall-clock seconds the sender-side prepare must age before the router
/// may cancel it unilaterally. Covers indexer lag on the receiver chain: a
/// receiver prepare the router already sent may not be visible yet.
pub const SENDER_PREPARE_BUFFER: u64 = 780;

/// Receiver-side expiry sits one day inside the sender's window so the
/// router can always fulfill the sender side after the user fulfills the
/// receiver side.
pub const ONE_DAY: u64 = 86_400;

/// Derived receiver-side expiry for a sender window, `None` when the window
/// is already too tight to safely prepare.
pub fn receiver_expiry(now: u64, sender_expiry: u64) -> Option<u64> {
    let expiry = sender_expiry.saturating_sub(ONE_DAY);
    (expiry > now).then_some(expiry)
}

/// Receiver-side cancel is safe any time after the record's own expiry.
pub fn can_cancel_receiver(now: u64, expiry: u64) -> bool {
    now > expiry
}

/// One side's observed status and expiry, as much as the cancel policy
/// needs to know about it.
#[derive(Debug, Clone, Copy)]
pub struct SideView {
    pub status: TransactionStatus,
    pub expiry: u64,
}

impl SideView {
    pub fn of(record: &TransactionRecord) -> Self {
        Self {
            status: record.status,
            expiry: record.variant.expiry,
        }
    }
}

/// Sender-side cancel policy.
///
/// Requires (a) the receiver side to be out of the picture - absent,
/// cancelled, or expired - and (b) the sender prepare to be older than
/// [`SENDER_PREPARE_BUFFER`].
pub fn check_sender_cancel(
    now: u64,
    sender_prepared_timestamp: u64,
    receiver: Option<SideView>,
    transaction_id: TransactionId,
) -> RouterResult<()> {
    match receiver {
        None => {}
        Some(view) => match view.status {
            TransactionStatus::Cancelled => {}
            TransactionStatus::Prepared if now > view.expiry => {}
            _ => {
                return Err(RouterError::ReceiverTxExists {
                    transaction_id: format!("{:?}", transaction_id),
                })
            }
        },
    }

    let elapsed = now.saturating_sub(sender_prepared_timestamp);
    if elapsed < SENDER_PREPARE_BUFFER {
        return Err(RouterError::SenderTxTooNew {
            elapsed,
            required: SENDER_PREPARE_BUFFER,
        });
    }
    Ok(())
}

/// The lifecycle states a tracked transfer can occupy. Derived from the
/// two side statuses, so a transfer is in exactly one state at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    SenderPrepared,
    BothPrepared,
    ReceiverFulfilled,
    ReceiverCancelled,
    Fulfilled,
    Cancelled,
}

pub fn derive_state(
    sender: TransactionStatus,
    receiver: Option<TransactionStatus>,
) -> TransferState {
    match (sender, receiver) {
        (TransactionStatus::Fulfilled, _) => TransferState::Fulfilled,
        (TransactionStatus::Cancelled, _) => TransferState::Cancelled,
        (TransactionStatus::Prepared, None) => TransferState::SenderPrepared,
        (TransactionStatus::Prepared, Some(TransactionStatus::Prepared)) => {
            TransferState::BothPrepared
        }
        (TransactionStatus::Prepared, Some(TransactionStatus::Fulfilled)) => {
            TransferState::ReceiverFulfilled
        }
        (TransactionStatus::Prepared, Some(TransactionStatus::Cancelled)) => {
            TransferState::ReceiverCancelled
        }
    }
}
