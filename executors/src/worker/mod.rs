use std::time::Duration;

use engine_core::{chain::Chain, error::EngineError, transaction::ReceiptInfo};
use tokio::sync::{Notify, oneshot};

use crate::store::TransactionRecord;

pub mod confirm;
pub mod error;
pub mod send;

pub use confirm::{ConfirmCycleReport, ConfirmationWorker};
pub use error::WorkerError;
pub use send::{SendCycleReport, SubmissionWorker};

/// Sleep until the next cycle is due, an optional wake-up signal fires, or
/// shutdown is requested. Returns `true` on shutdown.
pub(crate) async fn idle(
    shutdown: &mut oneshot::Receiver<()>,
    interval: Duration,
    wake: Option<&Notify>,
) -> bool {
    let woken = async {
        match wake {
            Some(notify) => notify.notified().await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = shutdown => true,
        _ = tokio::time::sleep(interval) => false,
        _ = woken => false,
    }
}

/// Receipt for any attempt of `record`. Errors only when no attempt has a
/// receipt and at least one lookup failed.
pub(crate) async fn find_receipt<C: Chain>(
    chain: &C,
    record: &TransactionRecord,
) -> Result<Option<ReceiptInfo>, EngineError> {
    let mut hashes: Vec<_> = record.attempts.iter().map(|a| a.hash).collect();
    if let Some(hash) = record.tx_hash {
        if !hashes.contains(&hash) {
            hashes.push(hash);
        }
    }

    let lookups: Vec<_> = hashes.iter().map(|hash| chain.get_receipt(*hash)).collect();
    let mut first_error = None;
    for result in futures::future::join_all(lookups).await {
        match result {
            Ok(Some(receipt)) => return Ok(Some(receipt)),
            Ok(None) => {}
            Err(e) => {
                first_error.get_or_insert(e);
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(None),
    }
}
