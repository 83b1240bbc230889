mod fixtures;
use fixtures::*;

use engine_core::transaction::FeeParams;
use engine_executors::events::EventKind;
use engine_executors::options::EngineOptions;
use engine_executors::store::TransactionStatus;
use engine_executors::worker::confirm::REPLACED_REASON;

async fn submitted(harness: &Harness) -> String {
    let id = harness.enqueue(POLYGON, sender()).await;
    harness
        .engine
        .submission_worker()
        .run_cycle()
        .await
        .unwrap();
    assert_eq!(harness.record(&id).await.status, TransactionStatus::Submitted);
    id
}

#[tokio::test]
async fn stuck_transaction_is_repriced_until_the_bound_then_errors() {
    setup_tracing();
    let options = EngineOptions {
        max_fee_escalations: 3,
        ..test_options()
    };
    let harness = Harness::new(options);
    let chain = harness.chain(POLYGON);
    chain.set_include_transactions(false);

    let id = submitted(&harness).await;
    let worker = harness.engine.confirmation_worker();

    for expected_bumps in 1..=3 {
        let report = worker.run_cycle().await.unwrap();
        assert_eq!(report.repriced, 1);
        let record = harness.record(&id).await;
        assert_eq!(record.status, TransactionStatus::Submitted);
        assert_eq!(record.fee_bumps, expected_bumps);
        assert_eq!(record.nonce, Some(0));
        chain.mine_block();
    }

    let report = worker.run_cycle().await.unwrap();
    assert_eq!(report.failed, 1);

    let record = harness.record(&id).await;
    assert_eq!(record.status, TransactionStatus::Errored);
    assert_eq!(
        record.error_message.as_deref(),
        Some("Transaction not mined after 3 fee escalations")
    );

    // every attempt shares the nonce and pays strictly more than the last
    assert_eq!(record.attempts.len(), 4);
    for pair in record.attempts.windows(2) {
        assert!(pair[1].fees.is_replacement_for(&pair[0].fees, 10));
    }
    let signed = harness.signer.signed();
    assert!(signed.iter().all(|tx| tx.nonce == 0));

    let kinds = harness.events.kinds_for(&id);
    assert_eq!(
        kinds
            .iter()
            .filter(|k| **k == EventKind::TransactionRepriced)
            .count(),
        3
    );
    assert_eq!(kinds.last(), Some(&EventKind::TransactionErrored));
}

#[tokio::test]
async fn repriced_attempt_that_lands_is_settled() {
    setup_tracing();
    let harness = Harness::new(test_options());
    let chain = harness.chain(POLYGON);
    chain.set_include_transactions(false);

    let id = submitted(&harness).await;
    let worker = harness.engine.confirmation_worker();
    worker.run_cycle().await.unwrap();

    let record = harness.record(&id).await;
    let replacement = record.tx_hash.unwrap();
    assert_ne!(record.attempts[0].hash, replacement);
    assert_eq!(chain.mempool_hashes(), vec![replacement]);

    chain.set_include_transactions(true);
    chain.mine_block();

    let report = worker.run_cycle().await.unwrap();
    assert_eq!(report.mined, 1);

    let record = harness.record(&id).await;
    assert_eq!(record.status, TransactionStatus::Mined);
    assert_eq!(record.tx_hash, Some(replacement));
    assert_eq!(record.block_number, Some(1));
}

#[tokio::test]
async fn fee_cap_rebroadcasts_instead_of_repricing() {
    setup_tracing();
    let cap = 100_000_000_000;
    let options = EngineOptions {
        max_fee_per_gas_cap: Some(cap),
        ..test_options()
    };
    let harness = Harness::new(options);
    let chain = harness.chain(POLYGON);
    chain.set_include_transactions(false);

    let id = submitted(&harness).await;
    let before = harness.record(&id).await;
    assert_eq!(before.fees.map(|f| f.max_fee()), Some(cap));

    let report = harness
        .engine
        .confirmation_worker()
        .run_cycle()
        .await
        .unwrap();
    assert_eq!(report.rebroadcast, 1);

    let after = harness.record(&id).await;
    assert_eq!(after.attempts.len(), 1);
    assert_eq!(after.tx_hash, before.tx_hash);
    assert_eq!(after.fee_bumps, 1);
}

#[tokio::test]
async fn rising_network_fees_are_followed() {
    setup_tracing();
    let harness = Harness::new(test_options());
    let chain = harness.chain(POLYGON);
    chain.set_include_transactions(false);

    let id = submitted(&harness).await;
    chain.set_fees(FeeParams::Eip1559 {
        max_fee_per_gas: 500_000_000_000,
        max_priority_fee_per_gas: 30_000_000_000,
    });

    harness
        .engine
        .confirmation_worker()
        .run_cycle()
        .await
        .unwrap();

    let record = harness.record(&id).await;
    assert_eq!(
        record.fees,
        Some(FeeParams::Eip1559 {
            max_fee_per_gas: 500_000_000_000,
            max_priority_fee_per_gas: 30_000_000_000,
        })
    );
}

#[tokio::test]
async fn nonce_consumed_elsewhere_marks_the_record_replaced() {
    setup_tracing();
    let harness = Harness::new(test_options());
    let chain = harness.chain(POLYGON);

    let id = submitted(&harness).await;
    chain.mine_foreign_transaction(sender());

    let report = harness
        .engine
        .confirmation_worker()
        .run_cycle()
        .await
        .unwrap();
    assert_eq!(report.failed, 1);

    let record = harness.record(&id).await;
    assert_eq!(record.status, TransactionStatus::Errored);
    assert_eq!(record.error_message.as_deref(), Some(REPLACED_REASON));
    assert!(!record.reverted);
}

#[tokio::test]
async fn receipt_that_shows_up_late_is_not_mistaken_for_a_replacement() {
    setup_tracing();
    let harness = Harness::new(test_options());
    let chain = harness.chain(POLYGON);

    let id = submitted(&harness).await;
    chain.mine_block();
    // the first lookup misses, the nonce has already moved on
    chain.hide_receipts_for(1);

    let report = harness
        .engine
        .confirmation_worker()
        .run_cycle()
        .await
        .unwrap();
    assert_eq!(report.mined, 1);
    assert_eq!(report.failed, 0);

    let record = harness.record(&id).await;
    assert_eq!(record.status, TransactionStatus::Mined);
    assert_eq!(record.error_message, None);
    assert!(
        !harness
            .events
            .kinds_for(&id)
            .contains(&EventKind::TransactionErrored)
    );
}

#[tokio::test]
async fn receipt_found_by_polling_settles_the_record() {
    setup_tracing();
    let harness = Harness::new(test_options());
    let chain = harness.chain(POLYGON);

    let id = submitted(&harness).await;
    chain.mine_block();

    let report = harness
        .engine
        .confirmation_worker()
        .run_cycle()
        .await
        .unwrap();
    assert_eq!(report.mined, 1);

    let record = harness.record(&id).await;
    assert_eq!(record.status, TransactionStatus::Mined);
    assert_eq!(record.block_number, Some(1));
    assert_eq!(record.gas_used, Some(21_000));
    assert!(
        harness
            .events
            .kinds_for(&id)
            .contains(&EventKind::TransactionMined)
    );
}

#[tokio::test]
async fn recently_sent_transactions_are_left_alone() {
    setup_tracing();
    let options = EngineOptions {
        stall_threshold_ms: 60_000,
        ..test_options()
    };
    let harness = Harness::new(options);
    harness.chain(POLYGON).set_include_transactions(false);

    let id = submitted(&harness).await;
    let report = harness
        .engine
        .confirmation_worker()
        .run_cycle()
        .await
        .unwrap();

    assert_eq!(report, Default::default());
    assert_eq!(harness.record(&id).await.fee_bumps, 0);
}
