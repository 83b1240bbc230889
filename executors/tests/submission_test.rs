mod fixtures;
use fixtures::*;

use engine_executors::events::EventKind;
use engine_executors::options::EngineOptions;
use engine_executors::store::{TransactionStatus, TransactionStore};

#[tokio::test]
async fn nonces_follow_enqueue_order() {
    setup_tracing();
    let harness = Harness::new(test_options());

    let mut ids = Vec::new();
    for _ in 0..5 {
        ids.push(harness.enqueue(POLYGON, sender()).await);
    }

    let report = harness
        .engine
        .submission_worker()
        .run_cycle()
        .await
        .unwrap();
    assert_eq!(report.submitted, 5);
    assert_eq!(report.failed, 0);

    let mut hashes = Vec::new();
    for (expected_nonce, id) in ids.iter().enumerate() {
        let record = harness.record(id).await;
        assert_eq!(record.status, TransactionStatus::Submitted);
        assert_eq!(record.nonce, Some(expected_nonce as u64));
        assert_eq!(record.attempts.len(), 1);
        hashes.push(record.tx_hash.unwrap());
    }
    assert_eq!(harness.chain(POLYGON).broadcasts(), hashes);

    for id in &ids {
        assert_eq!(
            harness.events.kinds_for(id),
            vec![EventKind::TransactionQueued, EventKind::TransactionSubmitted]
        );
    }
}

#[tokio::test]
async fn senders_and_chains_get_independent_nonce_sequences() {
    setup_tracing();
    let harness = Harness::new(test_options());

    let a = harness.enqueue(POLYGON, sender()).await;
    let b = harness.enqueue(POLYGON, other_sender()).await;
    let c = harness.enqueue(MAINNET, sender()).await;
    let d = harness.enqueue(POLYGON, sender()).await;

    harness
        .engine
        .submission_worker()
        .run_cycle()
        .await
        .unwrap();

    assert_eq!(harness.record(&a).await.nonce, Some(0));
    assert_eq!(harness.record(&b).await.nonce, Some(0));
    assert_eq!(harness.record(&c).await.nonce, Some(0));
    assert_eq!(harness.record(&d).await.nonce, Some(1));
}

#[tokio::test]
async fn starts_from_the_chain_nonce() {
    setup_tracing();
    let harness = Harness::new(test_options());
    let chain = harness.chain(POLYGON);
    chain.mine_foreign_transaction(sender());
    chain.mine_foreign_transaction(sender());

    let id = harness.enqueue(POLYGON, sender()).await;
    harness
        .engine
        .submission_worker()
        .run_cycle()
        .await
        .unwrap();

    assert_eq!(harness.record(&id).await.nonce, Some(2));
}

#[tokio::test]
async fn rejected_broadcast_errors_and_hands_the_nonce_to_the_next_record() {
    setup_tracing();
    let harness = Harness::new(test_options());
    let chain = harness.chain(POLYGON);
    chain.push_fault(BroadcastFault::Reject(node_error(
        POLYGON,
        "insufficient funds for gas * price + value",
    )));

    let rejected = harness.enqueue(POLYGON, sender()).await;
    let next = harness.enqueue(POLYGON, sender()).await;

    let report = harness
        .engine
        .submission_worker()
        .run_cycle()
        .await
        .unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.submitted, 1);

    let rejected = harness.record(&rejected).await;
    assert_eq!(rejected.status, TransactionStatus::Errored);
    assert!(
        rejected
            .error_message
            .as_deref()
            .is_some_and(|m| m.contains("insufficient funds"))
    );
    assert!(
        harness
            .events
            .kinds_for(&rejected.id)
            .contains(&EventKind::TransactionErrored)
    );

    let next = harness.record(&next).await;
    assert_eq!(next.status, TransactionStatus::Submitted);
    assert_eq!(next.nonce, Some(0));
}

#[tokio::test]
async fn ambiguous_broadcast_keeps_the_nonce_and_resends_the_same_payload() {
    setup_tracing();
    let harness = Harness::new(test_options());
    let chain = harness.chain(POLYGON);
    chain.push_fault(BroadcastFault::AcceptThenError(timeout_error(POLYGON)));

    let id = harness.enqueue(POLYGON, sender()).await;
    let worker = harness.engine.submission_worker();

    let first = worker.run_cycle().await.unwrap();
    assert_eq!(first.requeued, 1);

    let record = harness.record(&id).await;
    assert_eq!(record.status, TransactionStatus::Queued);
    assert_eq!(record.nonce, Some(0));
    assert_eq!(record.retry_count, 1);
    assert!(record.last_error.is_some());
    let first_hash = record.tx_hash.unwrap();

    // the node already has it and answers "already known"
    let second = worker.run_cycle().await.unwrap();
    assert_eq!(second.submitted, 1);

    let record = harness.record(&id).await;
    assert_eq!(record.status, TransactionStatus::Submitted);
    assert_eq!(record.nonce, Some(0));
    assert_eq!(record.tx_hash, Some(first_hash));
    assert_eq!(record.attempts.len(), 1);
    assert_eq!(harness.signer.signed().len(), 1);
}

#[tokio::test]
async fn ambiguous_failures_error_once_retries_are_exhausted() {
    setup_tracing();
    let options = EngineOptions {
        max_send_retries: 2,
        ..test_options()
    };
    let harness = Harness::new(options);
    let chain = harness.chain(POLYGON);
    for _ in 0..3 {
        chain.push_fault(BroadcastFault::Reject(timeout_error(POLYGON)));
    }

    let id = harness.enqueue(POLYGON, sender()).await;
    let worker = harness.engine.submission_worker();

    for expected_retries in 1..=2 {
        worker.run_cycle().await.unwrap();
        let record = harness.record(&id).await;
        assert_eq!(record.status, TransactionStatus::Queued);
        assert_eq!(record.retry_count, expected_retries);
    }

    let report = worker.run_cycle().await.unwrap();
    assert_eq!(report.failed, 1);

    let record = harness.record(&id).await;
    assert_eq!(record.status, TransactionStatus::Errored);
    assert!(
        record
            .error_message
            .as_deref()
            .is_some_and(|m| m.contains("after 2 retries"))
    );
    assert!(chain.broadcasts().is_empty());

    // kept on the record for audit, but the node never took it, so it is reused
    assert_eq!(record.nonce, Some(0));
    let next = harness.enqueue(POLYGON, sender()).await;
    worker.run_cycle().await.unwrap();
    assert_eq!(harness.record(&next).await.nonce, Some(0));
}

#[tokio::test]
async fn exhausted_nonce_below_the_high_water_mark_is_filled_with_a_noop() {
    setup_tracing();
    let options = EngineOptions {
        max_send_retries: 1,
        ..test_options()
    };
    let harness = Harness::new(options);
    let chain = harness.chain(POLYGON);
    chain.push_fault(BroadcastFault::Reject(timeout_error(POLYGON)));

    let stuck = harness.enqueue(POLYGON, sender()).await;
    let later = harness.enqueue(POLYGON, sender()).await;
    let worker = harness.engine.submission_worker();

    // the requeued record keeps nonce 0 and does not hold up the lane
    worker.run_cycle().await.unwrap();
    assert_eq!(harness.record(&stuck).await.status, TransactionStatus::Queued);
    assert_eq!(harness.record(&later).await.nonce, Some(1));
    assert_eq!(
        harness.record(&later).await.status,
        TransactionStatus::Submitted
    );

    chain.push_fault(BroadcastFault::Reject(timeout_error(POLYGON)));
    let report = worker.run_cycle().await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.gap_fills, 1);
    assert_eq!(
        harness.record(&stuck).await.status,
        TransactionStatus::Errored
    );

    let noops: Vec<_> = chain
        .mempool_transactions()
        .into_iter()
        .filter(|tx| tx.nonce == 0)
        .collect();
    assert_eq!(noops.len(), 1);
    assert_eq!(noops[0].to, Some(sender()));
    assert_eq!(noops[0].from, sender());
    assert!(noops[0].value.is_zero());
    assert!(noops[0].data.is_empty());

    // with the gap closed both nonces land in the next block
    chain.mine_block();
    assert_eq!(chain.mempool_transactions().len(), 0);
}

#[tokio::test]
async fn rejection_below_the_high_water_mark_is_filled_with_a_noop() {
    setup_tracing();
    let harness = Harness::new(test_options());
    let chain = harness.chain(POLYGON);
    chain.push_fault(BroadcastFault::Reject(timeout_error(POLYGON)));

    let rejected = harness.enqueue(POLYGON, sender()).await;
    let later = harness.enqueue(POLYGON, sender()).await;
    let worker = harness.engine.submission_worker();

    let first = worker.run_cycle().await.unwrap();
    assert_eq!(first.requeued, 1);
    assert_eq!(first.submitted, 1);
    assert_eq!(first.gap_fills, 0);

    // the resend of nonce 0 is refused outright
    chain.push_fault(BroadcastFault::Reject(node_error(
        POLYGON,
        "insufficient funds for gas * price + value",
    )));
    let second = worker.run_cycle().await.unwrap();
    assert_eq!(second.failed, 1);
    assert_eq!(second.gap_fills, 1);

    let rejected = harness.record(&rejected).await;
    assert_eq!(rejected.status, TransactionStatus::Errored);
    assert_eq!(rejected.nonce, Some(0));
    assert_eq!(harness.record(&later).await.nonce, Some(1));

    let pool = chain.mempool_transactions();
    let noop = pool
        .iter()
        .find(|tx| tx.nonce == 0)
        .expect("no-op at the rejected nonce");
    assert_eq!(noop.to, Some(sender()));
    assert!(noop.value.is_zero());
    assert!(noop.data.is_empty());
    assert_eq!(noop.gas_limit, 21_000);

    // nothing left to fill on the next pass
    let third = worker.run_cycle().await.unwrap();
    assert_eq!(third.gap_fills, 0);
}

#[tokio::test]
async fn reverting_call_fails_at_estimation_without_taking_a_nonce() {
    setup_tracing();
    let harness = Harness::new(test_options());
    let chain = harness.chain(POLYGON);
    chain.fail_gas_estimation(Some(node_error(
        POLYGON,
        "execution reverted: ERC20: transfer amount exceeds balance",
    )));

    let id = harness.enqueue(POLYGON, sender()).await;
    let report = harness
        .engine
        .submission_worker()
        .run_cycle()
        .await
        .unwrap();
    assert_eq!(report.failed, 1);

    let record = harness.record(&id).await;
    assert_eq!(record.status, TransactionStatus::Errored);
    assert_eq!(record.nonce, None);
    assert!(
        record
            .error_message
            .as_deref()
            .is_some_and(|m| m.starts_with("Gas estimation failed"))
    );
    assert!(chain.broadcasts().is_empty());
}

#[tokio::test]
async fn transient_estimation_failure_requeues_and_blocks_later_records() {
    setup_tracing();
    let harness = Harness::new(test_options());
    let chain = harness.chain(POLYGON);
    chain.fail_gas_estimation(Some(timeout_error(POLYGON)));

    let first = harness.enqueue(POLYGON, sender()).await;
    let second = harness.enqueue(POLYGON, sender()).await;
    let worker = harness.engine.submission_worker();

    let report = worker.run_cycle().await.unwrap();
    assert_eq!(report.requeued, 1);
    assert_eq!(harness.record(&first).await.retry_count, 0);
    assert_eq!(harness.record(&second).await.nonce, None);
    assert!(harness.record(&second).await.last_error.is_none());

    chain.fail_gas_estimation(None);
    worker.run_cycle().await.unwrap();
    assert_eq!(harness.record(&first).await.nonce, Some(0));
    assert_eq!(harness.record(&second).await.nonce, Some(1));
}

#[tokio::test]
async fn unavailable_signer_requeues_and_keeps_the_nonce() {
    setup_tracing();
    let harness = Harness::new(test_options());
    harness.signer.set_unavailable(true);

    let id = harness.enqueue(POLYGON, sender()).await;
    let worker = harness.engine.submission_worker();

    let report = worker.run_cycle().await.unwrap();
    assert_eq!(report.requeued, 1);
    let record = harness.record(&id).await;
    assert_eq!(record.status, TransactionStatus::Queued);
    assert_eq!(record.nonce, Some(0));
    assert!(
        record
            .last_error
            .as_deref()
            .is_some_and(|e| e.contains("unavailable"))
    );

    harness.signer.set_unavailable(false);
    worker.run_cycle().await.unwrap();
    let record = harness.record(&id).await;
    assert_eq!(record.status, TransactionStatus::Submitted);
    assert_eq!(record.nonce, Some(0));
}

#[tokio::test]
async fn caller_fee_overrides_are_used_verbatim() {
    setup_tracing();
    let harness = Harness::new(test_options());
    let mut request = transfer(POLYGON, sender());
    request.overrides.gas_limit = Some(90_000);
    request.overrides.gas_price = Some(33_000_000_000);

    let id = harness.engine.enqueue(request).await.unwrap().id;
    harness
        .engine
        .submission_worker()
        .run_cycle()
        .await
        .unwrap();

    let record = harness.record(&id).await;
    assert_eq!(record.gas_limit, Some(90_000));
    assert_eq!(
        record.fees,
        Some(engine_core::transaction::FeeParams::Legacy {
            gas_price: 33_000_000_000
        })
    );
}

#[tokio::test]
async fn estimated_gas_gets_the_margin() {
    setup_tracing();
    let harness = Harness::new(test_options());
    let id = harness.enqueue(POLYGON, sender()).await;
    harness
        .engine
        .submission_worker()
        .run_cycle()
        .await
        .unwrap();

    // mock node estimates 50k, default margin is 20%
    assert_eq!(harness.record(&id).await.gas_limit, Some(60_000));
}

#[tokio::test]
async fn concurrent_workers_never_submit_a_record_twice() {
    setup_tracing();
    let harness = Harness::new(test_options());

    let mut ids = Vec::new();
    for _ in 0..10 {
        ids.push(harness.enqueue(POLYGON, sender()).await);
    }

    let first = harness.engine.submission_worker();
    let mut second = harness.engine.submission_worker();
    second.worker_id = "second-worker".to_string();
    let (a, b) = tokio::join!(first.run_cycle(), second.run_cycle());
    let submitted = a.unwrap().submitted + b.unwrap().submitted;
    assert_eq!(submitted, 10);

    let mut nonces = Vec::new();
    for id in &ids {
        let record = harness.record(id).await;
        assert_eq!(record.status, TransactionStatus::Submitted);
        nonces.push(record.nonce.unwrap());
    }
    nonces.sort_unstable();
    assert_eq!(nonces, (0..10).collect::<Vec<u64>>());
    assert_eq!(harness.chain(POLYGON).broadcasts().len(), 10);

    let submitted = harness
        .store
        .list_by_status(TransactionStatus::Submitted, Some(POLYGON))
        .await
        .unwrap();
    assert_eq!(submitted.len(), 10);
}
