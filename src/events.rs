//! Transfer events emitted by the subgraph tracker.
//!
//! One event per newly discovered or status-changed record, classified by
//! which side of the transfer the reporting chain plays.

use serde::{Deserialize, Serialize};

use crate::types::{ChainId, TransactionRecord, TransferSide};

/// Events delivered to lifecycle subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TransactionEvent {
    SenderPrepared(TransactionRecord),
    ReceiverPrepared(TransactionRecord),
    SenderFulfilled(TransactionRecord),
    ReceiverFulfilled(TransactionRecord),
    SenderCancelled(TransactionRecord),
    ReceiverCancelled(TransactionRecord),
}

impl TransactionEvent {
    /// Classify a freshly observed record into its event.
    pub fn from_record(record: TransactionRecord) -> Self {
        use crate::types::TransactionStatus::*;
        match (record.side(), record.status) {
            (TransferSide::Sending, Prepared) => TransactionEvent::SenderPrepared(record),
            (TransferSide::Receiving, Prepared) => TransactionEvent::ReceiverPrepared(record),
            (TransferSide::Sending, Fulfilled) => TransactionEvent::SenderFulfilled(record),
            (TransferSide::Receiving, Fulfilled) => TransactionEvent::ReceiverFulfilled(record),
            (TransferSide::Sending, Cancelled) => TransactionEvent::SenderCancelled(record),
            (TransferSide::Receiving, Cancelled) => TransactionEvent::ReceiverCancelled(record),
        }
    }

    pub fn record(&self) -> &TransactionRecord {
        match self {
            TransactionEvent::SenderPrepared(r)
            | TransactionEvent::ReceiverPrepared(r)
            | TransactionEvent::SenderFulfilled(r)
            | TransactionEvent::ReceiverFulfilled(r)
            | TransactionEvent::SenderCancelled(r)
            | TransactionEvent::ReceiverCancelled(r) => r,
        }
    }

    pub fn chain_id(&self) -> ChainId {
        self.record().chain_id
    }

    /// Event name for metrics and logs.
    pub fn name(&self) -> &'static str {
        match self {
            TransactionEvent::SenderPrepared(_) => "sender_prepared",
            TransactionEvent::ReceiverPrepared(_) => "receiver_prepared",
            TransactionEvent::SenderFulfilled(_) => "sender_fulfilled",
            TransactionEvent::ReceiverFulfilled(_) => "receiver_fulfilled",
            TransactionEvent::SenderCancelled(_) => "sender_cancelled",
            TransactionEvent::ReceiverCancelled(_) => "receiver_cancelled",
        }
    }
}
