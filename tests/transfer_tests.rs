mod common;

use common::{balance, entry, fast_config, funded, harness};
use rand::Rng;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::time::Duration;
use wallet_ledger::application::worker::Worker;
use wallet_ledger::domain::ledger::{EntryStatus, EntryType, REFERENCE_TRANSFER};
use wallet_ledger::domain::task::TransferTask;
use wallet_ledger::error::LedgerError;

#[tokio::test]
async fn test_transfer_settles_through_worker() {
    let h = harness(fast_config());
    let alice = funded(&h.ledger, "alice", dec!(100)).await;
    let bob = funded(&h.ledger, "bob", dec!(50)).await;

    let pending = h
        .ledger
        .initiate_transfer(&alice, &bob, dec!(30), "lunch")
        .await
        .unwrap();
    assert_eq!(pending.status, EntryStatus::Pending);
    assert_eq!(pending.balance_before.value(), dec!(100));
    assert_eq!(pending.balance_after.value(), dec!(70));

    let worker = Worker::spawn(h.queue.clone(), h.ledger.clone());
    h.queue.drain(Duration::from_secs(5)).await.unwrap();
    worker.shutdown().await.unwrap();

    assert_eq!(balance(&h.ledger, &alice).await, dec!(70));
    assert_eq!(balance(&h.ledger, &bob).await, dec!(80));
    assert_eq!(
        entry(&h.ledger, &alice, pending.id).await.status,
        EntryStatus::Success
    );

    let credit = h
        .ledger
        .list_transactions(&bob)
        .await
        .unwrap()
        .into_iter()
        .find(|e| e.reference_id == Some(pending.id))
        .unwrap();
    assert_eq!(credit.entry_type, EntryType::Credit);
    assert_eq!(credit.status, EntryStatus::Success);
    assert_eq!(credit.reference_type.as_deref(), Some(REFERENCE_TRANSFER));
    assert_eq!(credit.balance_before.value(), dec!(50));
    assert_eq!(credit.balance_after.value(), dec!(80));
}

#[tokio::test]
async fn test_settling_twice_credits_once() {
    let h = harness(fast_config());
    let alice = funded(&h.ledger, "alice", dec!(100)).await;
    let bob = funded(&h.ledger, "bob", dec!(50)).await;
    let pending = h
        .ledger
        .initiate_transfer(&alice, &bob, dec!(30), "")
        .await
        .unwrap();
    let task = TransferTask::for_entry(&pending).unwrap();

    h.ledger.settle_transfer(&task).await.unwrap();
    h.ledger.settle_transfer(&task).await.unwrap();

    assert_eq!(balance(&h.ledger, &alice).await, dec!(70));
    assert_eq!(balance(&h.ledger, &bob).await, dec!(80));
    // Top-up plus one transfer credit.
    assert_eq!(h.ledger.list_transactions(&bob).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_enqueue_failure_leaves_pending_entry() {
    let h = harness(fast_config());
    let alice = funded(&h.ledger, "alice", dec!(100)).await;
    let bob = funded(&h.ledger, "bob", dec!(50)).await;

    h.faults.break_push(true);
    let result = h.ledger.initiate_transfer(&alice, &bob, dec!(30), "").await;
    assert!(matches!(result, Err(LedgerError::QueueUnavailable(_))));

    let history = h.ledger.list_transactions(&alice).await.unwrap();
    let orphan = history
        .iter()
        .find(|e| e.entry_type == EntryType::Debit)
        .unwrap();
    assert_eq!(orphan.status, EntryStatus::Pending);
    assert_eq!(balance(&h.ledger, &alice).await, dec!(100));
    assert_eq!(h.queue.depth().await.unwrap(), 0);

    // Once the queue is back, the operator sweep settles the orphan.
    h.faults.break_push(false);
    let requeued = h
        .ledger
        .requeue_stale_transfers(chrono::Duration::zero())
        .await
        .unwrap();
    assert_eq!(requeued, 1);

    let worker = Worker::spawn(h.queue.clone(), h.ledger.clone());
    h.queue.drain(Duration::from_secs(5)).await.unwrap();
    worker.shutdown().await.unwrap();

    assert_eq!(balance(&h.ledger, &alice).await, dec!(70));
    assert_eq!(balance(&h.ledger, &bob).await, dec!(80));
    assert_eq!(
        entry(&h.ledger, &alice, orphan.id).await.status,
        EntryStatus::Success
    );
}

#[tokio::test]
async fn test_sender_write_failure_marks_failed() {
    let h = harness(fast_config());
    let alice = funded(&h.ledger, "alice", dec!(100)).await;
    let bob = funded(&h.ledger, "bob", dec!(50)).await;
    let pending = h
        .ledger
        .initiate_transfer(&alice, &bob, dec!(30), "")
        .await
        .unwrap();

    h.faults.break_account(&alice);
    let task = TransferTask::for_entry(&pending).unwrap();
    assert!(matches!(
        h.ledger.settle_transfer(&task).await,
        Err(LedgerError::Persistence(_))
    ));

    assert_eq!(
        entry(&h.ledger, &alice, pending.id).await.status,
        EntryStatus::Failed
    );
    assert_eq!(balance(&h.ledger, &alice).await, dec!(100));
    assert_eq!(balance(&h.ledger, &bob).await, dec!(50));

    // A later redelivery does not resurrect a failed transfer.
    h.faults.heal_account(&alice);
    h.ledger.settle_transfer(&task).await.unwrap();
    assert_eq!(balance(&h.ledger, &alice).await, dec!(100));
    assert_eq!(balance(&h.ledger, &bob).await, dec!(50));
}

#[tokio::test]
async fn test_failure_after_sender_write_recovers_on_redelivery() {
    let h = harness(fast_config());
    let alice = funded(&h.ledger, "alice", dec!(100)).await;
    let bob = funded(&h.ledger, "bob", dec!(50)).await;
    let pending = h
        .ledger
        .initiate_transfer(&alice, &bob, dec!(30), "")
        .await
        .unwrap();

    h.faults.break_account(&bob);
    let task = TransferTask::for_entry(&pending).unwrap();
    assert!(matches!(
        h.ledger.settle_transfer(&task).await,
        Err(LedgerError::Persistence(_))
    ));

    assert_eq!(balance(&h.ledger, &alice).await, dec!(70));
    assert_eq!(balance(&h.ledger, &bob).await, dec!(50));
    assert_eq!(
        entry(&h.ledger, &alice, pending.id).await.status,
        EntryStatus::Pending
    );

    h.faults.heal_account(&bob);
    h.ledger.settle_transfer(&task).await.unwrap();

    assert_eq!(balance(&h.ledger, &alice).await, dec!(70));
    assert_eq!(balance(&h.ledger, &bob).await, dec!(80));
    assert_eq!(
        entry(&h.ledger, &alice, pending.id).await.status,
        EntryStatus::Success
    );
}

#[tokio::test]
async fn test_worker_retries_until_recipient_recovers() {
    let h = harness(fast_config());
    let alice = funded(&h.ledger, "alice", dec!(100)).await;
    let bob = funded(&h.ledger, "bob", dec!(50)).await;

    h.faults.break_account(&bob);
    let pending = h
        .ledger
        .initiate_transfer(&alice, &bob, dec!(30), "")
        .await
        .unwrap();
    let worker = Worker::spawn(h.queue.clone(), h.ledger.clone());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(balance(&h.ledger, &alice).await, dec!(70));
    assert_eq!(balance(&h.ledger, &bob).await, dec!(50));

    h.faults.heal_account(&bob);
    h.queue.drain(Duration::from_secs(10)).await.unwrap();
    worker.shutdown().await.unwrap();

    assert_eq!(balance(&h.ledger, &alice).await, dec!(70));
    assert_eq!(balance(&h.ledger, &bob).await, dec!(80));
    assert_eq!(
        entry(&h.ledger, &alice, pending.id).await.status,
        EntryStatus::Success
    );
    assert!(h.queue.dead_letters().await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_settlement_races_payments_on_the_sender() {
    let h = harness(fast_config());
    let alice = funded(&h.ledger, "alice", dec!(1000)).await;
    let bob = funded(&h.ledger, "bob", dec!(0)).await;
    let worker = Worker::spawn(h.queue.clone(), h.ledger.clone());
    let mut rng = rand::thread_rng();

    let mut transfers = Vec::new();
    let mut payments = Vec::new();
    for _ in 0..30 {
        let ledger = h.ledger.clone();
        let (from, to) = (alice.clone(), bob.clone());
        let amount = Decimal::new(rng.gen_range(1_000..=5_000), 2);
        transfers.push(tokio::spawn(async move {
            ledger.initiate_transfer(&from, &to, amount, "").await
        }));

        let ledger = h.ledger.clone();
        let account = alice.clone();
        let amount = Decimal::new(rng.gen_range(1_000..=5_000), 2);
        payments.push(tokio::spawn(async move {
            ledger.payment(&account, amount, "").await
        }));
    }

    for handle in transfers {
        match handle.await.unwrap() {
            Ok(_) | Err(LedgerError::InsufficientFunds { .. }) => {}
            Err(other) => panic!("unexpected initiation error: {other}"),
        }
    }
    let mut paid = Decimal::ZERO;
    for handle in payments {
        match handle.await.unwrap() {
            Ok(entry) => paid += entry.amount.value(),
            Err(LedgerError::InsufficientFunds { .. }) => {}
            Err(other) => panic!("unexpected payment error: {other}"),
        }
    }

    h.queue.drain(Duration::from_secs(10)).await.unwrap();
    worker.shutdown().await.unwrap();

    let history = h.ledger.list_transactions(&alice).await.unwrap();
    let debits: Vec<_> = history.iter().filter(|e| e.is_transfer_debit()).collect();
    assert!(debits.iter().all(|e| e.status.is_terminal()));
    let settled: Decimal = debits
        .iter()
        .filter(|e| e.status == EntryStatus::Success)
        .map(|e| e.amount.value())
        .sum();

    assert_eq!(balance(&h.ledger, &alice).await, dec!(1000) - settled - paid);
    assert_eq!(balance(&h.ledger, &bob).await, settled);

    let credits = h.ledger.list_transactions(&bob).await.unwrap();
    for failed in debits.iter().filter(|e| e.status == EntryStatus::Failed) {
        assert!(credits.iter().all(|c| c.reference_id != Some(failed.id)));
    }
    let failed = debits
        .iter()
        .filter(|e| e.status == EntryStatus::Failed)
        .count();
    assert_eq!(h.queue.dead_letters().await.unwrap().len(), failed);
}
