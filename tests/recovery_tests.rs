use std::sync::Arc;
use std::time::Duration;

use maat::prelude::*;

mod common;
use common::*;

fn ids(names: &[&str]) -> Vec<ParticipantId> {
    names.iter().map(|name| ParticipantId::from(*name)).collect()
}

fn vote(txn_id: TxnId, participant: &str, state: TxnState) -> LogRecord {
    LogRecord::Vote {
        txn_id,
        participant: ParticipantId::from(participant),
        state,
    }
}

fn seeded_log(records: Vec<LogRecord>) -> MemoryTransactionLog {
    let log = MemoryTransactionLog::new();
    for record in records {
        log.append(record).unwrap();
    }
    log
}

#[test]
fn test_replay_rebuilds_unsettled_transactions() {
    let replay = Replay::from_records(vec![
        LogRecord::Voting {
            txn_id: 1,
            participants: ids(&["p1", "p2"]),
        },
        vote(1, "p1", TxnState::Prepared),
        LogRecord::Voting {
            txn_id: 2,
            participants: ids(&["p3"]),
        },
        LogRecord::Settled {
            txn_id: 2,
            state: TxnState::Committed,
        },
        LogRecord::Decision {
            txn_id: 5,
            state: TxnState::Aborted,
            participants: ids(&["p1"]),
        },
    ]);

    assert_eq!(replay.max_txn_id, Some(5));
    assert_eq!(replay.unsettled.len(), 2);
    assert_eq!(
        replay.unsettled[0],
        RecoveredTxn {
            txn_id: 1,
            state: TxnState::Voting,
            participants: vec![
                (ParticipantId::from("p1"), Some(TxnState::Prepared)),
                (ParticipantId::from("p2"), None),
            ],
        }
    );
    assert_eq!(replay.unsettled[1].state, TxnState::Aborted);
}

#[test]
fn test_prepared_transaction_is_committed_after_restart() {
    let (locator, parts) = participants(&["p1", "p2"]);
    let log = seeded_log(vec![
        LogRecord::Voting {
            txn_id: 1,
            participants: ids(&["p1", "p2"]),
        },
        vote(1, "p1", TxnState::Prepared),
        vote(1, "p2", TxnState::Prepared),
    ]);
    let observed = setup_observed(fast_config(), Arc::new(log.clone()), locator);

    assert_eq!(observed.coordinator.recover().unwrap(), 1);
    assert!(wait_until(Duration::from_secs(5), || {
        observed.observer.count(|e| *e == Event::Settled(1)) == 1
    }));

    assert_eq!(is_settled(&log, 1), Some(TxnState::Committed));
    for participant in &parts {
        assert_eq!(participant.prepares(), 0);
        assert_eq!(participant.commits(), 1);
    }
    assert!(matches!(
        observed.coordinator.state(1),
        Err(CoordinatorError::UnknownTransaction(1))
    ));

    // The settler retires once the transaction is settled.
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(observed.observer.count(|e| *e == Event::Settled(1)), 1);
    assert_eq!(parts[0].commits(), 1);
}

#[test]
fn test_voting_transaction_without_votes_is_prepared_again() {
    let (locator, parts) = participants(&["p1", "p2"]);
    let log = seeded_log(vec![LogRecord::Voting {
        txn_id: 3,
        participants: ids(&["p1", "p2"]),
    }]);
    let observed = setup_observed(fast_config(), Arc::new(log.clone()), locator);

    observed.coordinator.recover().unwrap();
    assert!(wait_until(Duration::from_secs(5), || is_settled(&log, 3).is_some()));

    assert_eq!(is_settled(&log, 3), Some(TxnState::Committed));
    for participant in &parts {
        assert_eq!(participant.prepares(), 1);
        assert_eq!(participant.commits(), 1);
    }
}

#[test]
fn test_recovered_abort_decision_is_finished() {
    let (locator, parts) = participants(&["p1", "p2"]);
    let log = seeded_log(vec![
        LogRecord::Voting {
            txn_id: 4,
            participants: ids(&["p1", "p2"]),
        },
        vote(4, "p1", TxnState::Prepared),
        vote(4, "p2", TxnState::Aborted),
        LogRecord::Decision {
            txn_id: 4,
            state: TxnState::Aborted,
            participants: ids(&["p1", "p2"]),
        },
    ]);
    let observed = setup_observed(fast_config(), Arc::new(log.clone()), locator);

    observed.coordinator.recover().unwrap();
    assert!(wait_until(Duration::from_secs(5), || is_settled(&log, 4).is_some()));

    assert_eq!(is_settled(&log, 4), Some(TxnState::Aborted));
    assert_eq!(parts[0].aborts(), 1);
    assert_eq!(parts[1].aborts(), 0);
    assert_eq!(parts[0].commits() + parts[1].commits(), 0);
}

#[test]
fn test_partially_committed_transaction_is_not_committed_twice() {
    let (locator, parts) = participants(&["p1", "p2"]);
    let log = seeded_log(vec![
        LogRecord::Decision {
            txn_id: 6,
            state: TxnState::Committed,
            participants: ids(&["p1", "p2"]),
        },
        vote(6, "p1", TxnState::Committed),
        vote(6, "p2", TxnState::Prepared),
    ]);
    let observed = setup_observed(fast_config(), Arc::new(log.clone()), locator);

    observed.coordinator.recover().unwrap();
    assert!(wait_until(Duration::from_secs(5), || is_settled(&log, 6).is_some()));

    assert_eq!(parts[0].commits(), 0);
    assert_eq!(parts[1].commits(), 1);
    let committed_votes: Vec<_> = vote_records(&log, 6)
        .into_iter()
        .filter(|(_, state)| *state == TxnState::Committed)
        .collect();
    assert_eq!(committed_votes.len(), 2);
}

#[test]
fn test_unexpected_decision_is_stuck() {
    let (locator, parts) = participants(&["p1"]);
    let log = seeded_log(vec![LogRecord::Decision {
        txn_id: 9,
        state: TxnState::Prepared,
        participants: ids(&["p1"]),
    }]);
    let observed = setup_observed(fast_config(), Arc::new(log.clone()), locator);

    observed.coordinator.recover().unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        observed.coordinator.stuck_transactions() == vec![9]
    }));

    assert_eq!(
        observed.observer.count(|e| *e == Event::Stuck(9, TxnState::Prepared)),
        1
    );
    assert_eq!(observed.coordinator.state(9).unwrap(), TxnState::Prepared);
    assert_eq!(parts[0].prepares() + parts[0].commits() + parts[0].aborts(), 0);
    assert_eq!(is_settled(&log, 9), None);
}

#[test]
fn test_not_changed_decision_is_settled_without_a_settler() {
    let (locator, _) = participants(&["p1"]);
    let log = seeded_log(vec![LogRecord::Decision {
        txn_id: 2,
        state: TxnState::NotChanged,
        participants: ids(&["p1"]),
    }]);
    let observed = setup_observed(fast_config(), Arc::new(log.clone()), locator);

    assert_eq!(observed.coordinator.recover().unwrap(), 0);
    assert_eq!(is_settled(&log, 2), Some(TxnState::NotChanged));
    assert!(observed.observer.events().contains(&Event::Recovered(0)));
}

#[test]
fn test_recovery_continues_transaction_ids() {
    let (locator, _) = participants(&[]);
    let log = seeded_log(vec![
        LogRecord::Voting {
            txn_id: 17,
            participants: Vec::new(),
        },
        LogRecord::Settled {
            txn_id: 17,
            state: TxnState::NotChanged,
        },
    ]);
    let coordinator = Coordinator::open(fast_config(), Arc::new(log), locator).unwrap();

    assert_eq!(coordinator.begin().unwrap(), 18);
}

#[test]
fn test_committed_decision_cannot_be_aborted() {
    let (locator, parts) = participants(&["p1"]);
    parts[0].fail_commits_forever(ParticipantError::ConnectionFailed("down".into()));
    let log = seeded_log(vec![LogRecord::Decision {
        txn_id: 11,
        state: TxnState::Committed,
        participants: ids(&["p1"]),
    }]);
    let config = fast_config().with_settler_delays_ms(vec![10_000]);
    let observed = setup_observed(config, Arc::new(log.clone()), locator);

    observed.coordinator.recover().unwrap();
    assert!(matches!(
        observed.coordinator.abort(11),
        Err(CoordinatorError::CannotAbort(11))
    ));
    assert_eq!(observed.coordinator.state(11).unwrap(), TxnState::Committed);
    assert_eq!(parts[0].aborts(), 0);
}

#[test]
fn test_restart_after_clean_run_recovers_nothing() {
    let (locator, _) = participants(&["p1", "p2"]);
    let log = MemoryTransactionLog::new();
    {
        let coordinator = Coordinator::new(fast_config(), Arc::new(log.clone()), locator.clone());
        let txn = coordinator.begin().unwrap();
        coordinator.join(txn, ParticipantId::from("p1")).unwrap();
        coordinator.join(txn, ParticipantId::from("p2")).unwrap();
        coordinator.commit(txn).unwrap();
    }

    let observed = setup_observed(fast_config(), Arc::new(log), locator);
    assert_eq!(observed.coordinator.recover().unwrap(), 0);
}

#[test]
fn test_votes_without_a_voting_record_are_not_recovered() {
    let (locator, parts) = participants(&["p1", "p2"]);
    let log = MemoryTransactionLog::new();
    {
        let coordinator = Coordinator::new(fast_config(), Arc::new(log.clone()), locator.clone());
        let outcome = coordinator
            .run_phase(Phase::Prepare, 77, handles(&locator, &parts))
            .unwrap();
        assert_eq!(outcome, TxnState::Prepared);
    }
    assert_eq!(vote_records(&log, 77).len(), 2);

    let observed = setup_observed(fast_config(), Arc::new(log.clone()), locator);
    assert_eq!(observed.coordinator.recover().unwrap(), 0);
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(parts[0].commits(), 0);
    assert_eq!(parts[1].commits(), 0);
    assert_eq!(is_settled(&log, 77), None);
}

#[test]
fn test_records_after_settled_do_not_revive_a_transaction() {
    let replay = Replay::from_records(vec![
        LogRecord::Voting {
            txn_id: 9,
            participants: ids(&["p1"]),
        },
        LogRecord::Decision {
            txn_id: 9,
            state: TxnState::Aborted,
            participants: ids(&["p1"]),
        },
        vote(9, "p1", TxnState::Aborted),
        LogRecord::Settled {
            txn_id: 9,
            state: TxnState::Aborted,
        },
        vote(9, "p1", TxnState::Prepared),
    ]);

    assert!(replay.unsettled.is_empty());
    assert_eq!(replay.max_txn_id, Some(9));
}

#[test]
fn test_replayed_votes_follow_handle_transitions() {
    let replay = Replay::from_records(vec![
        LogRecord::Voting {
            txn_id: 4,
            participants: ids(&["p1", "p2"]),
        },
        vote(4, "p1", TxnState::Prepared),
        vote(4, "p1", TxnState::Aborted),
        vote(4, "p1", TxnState::Prepared),
        vote(4, "p2", TxnState::NotChanged),
        vote(4, "p2", TxnState::Prepared),
    ]);

    assert_eq!(replay.unsettled.len(), 1);
    assert_eq!(
        replay.unsettled[0].participants,
        vec![
            (ParticipantId::from("p1"), Some(TxnState::Aborted)),
            (ParticipantId::from("p2"), Some(TxnState::NotChanged)),
        ]
    );
}
