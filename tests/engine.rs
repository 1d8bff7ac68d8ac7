//! End-to-end scenarios for the append/commit protocol: first commits,
//! concurrent appenders, rollback of failed commits, broken streams,
//! closed streams and stream continuation.

mod setup;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use chainstream::error::Error;
use chainstream::event::CLOSED_STREAM_EVENT_TYPE;
use chainstream::store::DocumentStore;
use setup::{user_event, Harness};

#[tokio::test]
async fn empty_to_first_commit() {
    let harness = Harness::new();

    let document = harness
        .documents
        .get_or_create("users", "u1")
        .await
        .expect("creation should succeed");

    let mut session = harness
        .engine
        .open_session(document)
        .expect("session should open");
    let version = session
        .append(user_event("User.Created", "A"))
        .expect("append should buffer");
    assert_eq!(0, version);

    let document = session.commit().await.expect("commit should succeed");

    assert_eq!(0, document.active.current_stream_version);
    assert_eq!(None, document.prev_hash);
    let h0 = document.hash.clone().expect("the chain should have started");
    assert!(!h0.is_empty());

    let events = harness
        .engine
        .read(&document, None, None)
        .await
        .expect("read should succeed");
    assert_eq!(1, events.len());
    assert_eq!(0, events[0].event_version);
    assert_eq!("User.Created", events[0].event_type);

    assert!(harness
        .backend
        .keys("users")
        .contains(&"u1.events.json".to_owned()));

    // The committed state is what a fresh reader sees.
    let reread = harness
        .documents
        .get("users", "u1")
        .await
        .expect("get should succeed");
    assert_eq!(Some(h0), reread.hash);
    assert_eq!(0, reread.active.current_stream_version);
}

#[tokio::test]
async fn concurrent_appenders_conflict_and_retry() {
    let harness = Harness::new();

    let document = harness
        .documents
        .get_or_create("users", "u1")
        .await
        .expect("creation should succeed");
    let mut session = harness
        .engine
        .open_session(document)
        .expect("session should open");
    session
        .append(user_event("User.Created", "A"))
        .expect("append should buffer");
    session.commit().await.expect("first commit should succeed");

    // Two sessions starting from the same pre-commit fingerprint.
    let for_x = harness
        .documents
        .get("users", "u1")
        .await
        .expect("get should succeed");
    let for_y = harness
        .documents
        .get("users", "u1")
        .await
        .expect("get should succeed");
    assert_eq!(for_x.hash, for_y.hash);

    let mut x = harness
        .engine
        .open_session(for_x)
        .expect("session should open");
    x.append(user_event("User.Renamed", "B"))
        .expect("append should buffer");
    let after_x = x.commit().await.expect("the first committer should win");
    let h1 = after_x.hash.clone().expect("chain head");

    let mut y = harness
        .engine
        .open_session(for_y)
        .expect("session should open");
    y.append(user_event("User.Renamed", "C"))
        .expect("append should buffer");
    let result = y.commit().await;
    assert!(matches!(result, Err(Error::Conflict(_))));

    // The loser's events never landed.
    let events = harness
        .engine
        .read(&after_x, None, None)
        .await
        .expect("read should succeed");
    assert_eq!(2, events.len());

    // A retry from a fresh read lands behind the winner.
    let fresh = harness
        .documents
        .get("users", "u1")
        .await
        .expect("get should succeed");
    let mut retry = harness
        .engine
        .open_session(fresh)
        .expect("session should open");
    let version = retry
        .append(user_event("User.Renamed", "C"))
        .expect("append should buffer");
    assert_eq!(2, version);

    let after_y = retry.commit().await.expect("the retry should succeed");
    assert_eq!(2, after_y.active.current_stream_version);
    assert_eq!(Some(h1), after_y.prev_hash);
}

#[tokio::test]
async fn failed_document_write_rolls_the_data_back() {
    let harness = Harness::new();

    let document = harness
        .documents
        .get_or_create("users", "u1")
        .await
        .expect("creation should succeed");
    let mut session = harness
        .engine
        .open_session(document)
        .expect("session should open");
    session
        .append(user_event("User.Created", "A"))
        .expect("append should buffer");
    session.commit().await.expect("prefix commit should succeed");

    // The session reads the document, then loses its precondition.
    let stale = harness
        .documents
        .get("users", "u1")
        .await
        .expect("get should succeed");
    harness.bump_document_out_of_band("users", "u1").await;

    let mut session = harness
        .engine
        .open_session(stale)
        .expect("session should open");
    for name in ["B", "C", "D"] {
        session
            .append(user_event("User.Renamed", name))
            .expect("append should buffer");
    }
    let result = session.commit().await;
    assert!(matches!(result, Err(Error::Conflict(_))));

    // The rolled-back range is gone; the pre-commit prefix survives.
    let reread = harness
        .documents
        .get("users", "u1")
        .await
        .expect("get should succeed");
    let events = harness
        .engine
        .read(&reread, None, None)
        .await
        .expect("read should succeed");
    assert_eq!(1, events.len());
    assert_eq!(0, events[0].event_version);

    // Exactly one rollback record, counting the removed events.
    assert_eq!(1, reread.active.rollback_history.len());
    let record = &reread.active.rollback_history[0];
    assert_eq!(1, record.from_version);
    assert_eq!(3, record.to_version);
    assert_eq!(3, record.events_removed);
    assert_eq!("CSES-CON-0002", record.original_error_type);

    // The stream stays writable.
    assert!(!reread.is_broken());
    let mut session = harness
        .engine
        .open_session(reread)
        .expect("session should open");
    let version = session
        .append(user_event("User.Renamed", "E"))
        .expect("append should buffer");
    assert_eq!(1, version);
    session.commit().await.expect("commit should succeed");
}

#[tokio::test]
async fn failed_rollback_marks_the_stream_broken_until_repair() {
    let harness = Harness::new();

    let document = harness
        .documents
        .get_or_create("users", "u1")
        .await
        .expect("creation should succeed");
    let mut session = harness
        .engine
        .open_session(document)
        .expect("session should open");
    session
        .append(user_event("User.Created", "A"))
        .expect("append should buffer");
    session.commit().await.expect("prefix commit should succeed");

    let stale = harness
        .documents
        .get("users", "u1")
        .await
        .expect("get should succeed");
    harness.bump_document_out_of_band("users", "u1").await;

    // Let the commit's data append through, fail the rollback write.
    harness.backend.fail_puts_containing("u1.events.json", 1);

    let mut session = harness
        .engine
        .open_session(stale)
        .expect("session should open");
    for name in ["B", "C", "D"] {
        session
            .append(user_event("User.Renamed", name))
            .expect("append should buffer");
    }

    let error = session.commit().await.expect_err("the commit should break");
    match &error {
        Error::StreamBroken {
            orphaned_from,
            orphaned_to,
            original,
            cleanup,
            ..
        } => {
            assert_eq!(1, *orphaned_from);
            assert_eq!(3, *orphaned_to);
            assert!(matches!(original.as_deref(), Some(Error::Conflict(_))));
            assert!(matches!(cleanup.as_deref(), Some(Error::Backend { .. })));
        },
        other => panic!("expected StreamBroken, got: {other}"),
    }
    assert_eq!("CSES-STR-0002", error.code());

    // The broken marker is persisted and refuses further sessions.
    let broken = harness
        .documents
        .get("users", "u1")
        .await
        .expect("get should succeed");
    assert!(broken.is_broken());
    let info = broken
        .active
        .broken_stream_info
        .as_ref()
        .expect("broken info should be recorded");
    assert_eq!(1, info.orphaned_from);
    assert_eq!(3, info.orphaned_to);
    assert_eq!("CSES-CON-0002", info.original_error_type);
    assert_eq!("CSES-BCK-0001", info.cleanup_error_type);

    let refused = harness.engine.open_session(broken.clone());
    assert!(matches!(refused, Err(Error::StreamBroken { .. })));

    // Repair removes the orphans and reopens the stream.
    harness.backend.clear_faults();
    let mut broken = broken;
    let removed = harness
        .engine
        .repair_broken_stream(&mut broken)
        .await
        .expect("repair should succeed");
    assert_eq!(3, removed);
    assert!(!broken.is_broken());
    assert_eq!(0, broken.active.current_stream_version);

    let events = harness
        .engine
        .read(&broken, None, None)
        .await
        .expect("read should succeed");
    assert_eq!(1, events.len());

    let mut session = harness
        .engine
        .open_session(broken)
        .expect("session should open again");
    let version = session
        .append(user_event("User.Renamed", "E"))
        .expect("append should buffer");
    assert_eq!(1, version);
    session.commit().await.expect("commit should succeed");
}

#[tokio::test]
async fn closed_streams_reject_appends_without_writing() {
    let harness = Harness::new();

    let document = harness
        .documents
        .get_or_create("users", "u1")
        .await
        .expect("creation should succeed");
    let mut session = harness
        .engine
        .open_session(document)
        .expect("session should open");
    session
        .append(user_event("User.Created", "A"))
        .expect("append should buffer");
    session.close_stream().expect("closing should buffer");
    let document = session.commit().await.expect("commit should succeed");

    let events = harness
        .engine
        .read(&document, None, None)
        .await
        .expect("read should succeed");
    assert_eq!(2, events.len());
    assert_eq!(CLOSED_STREAM_EVENT_TYPE, events[1].event_type);

    // Buffering after a buffered closure is refused up front.
    let mut session = harness
        .engine
        .open_session(document.clone())
        .expect("session should open");
    session.close_stream().expect("closing should buffer");
    session
        .append(user_event("User.Renamed", "B"))
        .expect_err("buffering after a buffered closure is refused");
    drop(session);

    // A commit against the closed stream fails and writes nothing.
    let fresh = harness
        .documents
        .get("users", "u1")
        .await
        .expect("get should succeed");
    let mut session = harness
        .engine
        .open_session(fresh)
        .expect("session should open");
    session
        .append(user_event("User.Renamed", "B"))
        .expect("append should buffer");
    let result = session.commit().await;
    assert!(matches!(result, Err(Error::StreamClosed { .. })));

    let reread = harness
        .documents
        .get("users", "u1")
        .await
        .expect("get should succeed");
    let events = harness
        .engine
        .read(&reread, None, None)
        .await
        .expect("read should succeed");
    assert_eq!(2, events.len());
    assert_eq!(1, reread.active.current_stream_version);
}

#[tokio::test]
async fn closed_streams_continue_with_a_successor() {
    let harness = Harness::new();

    let document = harness
        .documents
        .get_or_create("users", "u1")
        .await
        .expect("creation should succeed");
    let mut session = harness
        .engine
        .open_session(document)
        .expect("session should open");
    session
        .append(user_event("User.Created", "A"))
        .expect("append should buffer");
    session.close_stream().expect("closing should buffer");
    let mut document = session.commit().await.expect("commit should succeed");

    let old_stream = document.active.stream_identifier.clone();
    harness
        .engine
        .continue_stream(&mut document)
        .await
        .expect("continuation should succeed");

    assert_ne!(old_stream, document.active.stream_identifier);
    assert_eq!(-1, document.active.current_stream_version);
    assert_eq!(1, document.terminated_streams.len());
    assert_eq!(old_stream, document.terminated_streams[0].stream_identifier);

    // The closed stream's data is archived under a stream-scoped key.
    let keys = harness.backend.keys("users");
    assert!(keys.contains(&format!("u1.events.{old_stream}.json")));
    assert!(!keys.contains(&"u1.events.json".to_owned()));

    // The successor accepts appends from version 0 again.
    let mut session = harness
        .engine
        .open_session(document)
        .expect("session should open");
    let version = session
        .append(user_event("User.Reopened", "A"))
        .expect("append should buffer");
    assert_eq!(0, version);
    let document = session.commit().await.expect("commit should succeed");
    assert_eq!(0, document.active.current_stream_version);

    // Continuing a non-closed stream is refused.
    let mut document = document;
    let result = harness.engine.continue_stream(&mut document).await;
    assert!(matches!(result, Err(Error::Config { .. })));
}

#[tokio::test]
async fn commits_keep_versions_contiguous_and_the_chain_linked() {
    let harness = Harness::new();

    let mut document = harness
        .documents
        .get_or_create("users", "u1")
        .await
        .expect("creation should succeed");

    let mut previous_hash: Option<String> = None;
    for round in 0..5 {
        let before = document.active.current_stream_version;
        let mut session = harness
            .engine
            .open_session(document)
            .expect("session should open");
        for i in 0..3 {
            session
                .append(user_event("User.Counted", &format!("{round}-{i}")))
                .expect("append should buffer");
        }
        document = session.commit().await.expect("commit should succeed");

        assert_eq!(before + 3, document.active.current_stream_version);
        assert_eq!(previous_hash, document.prev_hash);
        previous_hash = document.hash.clone();
    }

    let events = harness
        .engine
        .read(&document, None, None)
        .await
        .expect("read should succeed");
    let versions: Vec<i64> = events.iter().map(|event| event.event_version).collect();
    assert_eq!((0..15).collect::<Vec<i64>>(), versions);

    let window = harness
        .engine
        .read(&document, Some(4), Some(8))
        .await
        .expect("read should succeed");
    let versions: Vec<i64> = window.iter().map(|event| event.event_version).collect();
    assert_eq!(vec![4, 5, 6, 7, 8], versions);
}

#[tokio::test]
async fn streaming_reads_stop_after_cancellation() {
    let harness = Harness::new();

    let document = harness
        .documents
        .get_or_create("users", "u1")
        .await
        .expect("creation should succeed");
    let mut session = harness
        .engine
        .open_session(document)
        .expect("session should open");
    for i in 0..10 {
        session
            .append(user_event("User.Counted", &i.to_string()))
            .expect("append should buffer");
    }
    let document = session.commit().await.expect("commit should succeed");

    let cancellation = CancellationToken::new();
    let mut stream =
        harness
            .engine
            .read_as_stream(&document, None, None, cancellation.clone());

    let first = stream
        .next()
        .await
        .expect("one element expected")
        .expect("the first element should be an event");
    assert_eq!(0, first.event_version);

    cancellation.cancel();

    // After the handle fires, at most one more item: the cancellation.
    let next = stream.next().await.expect("a final item expected");
    assert!(matches!(next, Err(Error::Cancelled { .. })));
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn aborted_sessions_touch_nothing() {
    let harness = Harness::new();

    let document = harness
        .documents
        .get_or_create("users", "u1")
        .await
        .expect("creation should succeed");

    let mut session = harness
        .engine
        .open_session(document)
        .expect("session should open");
    session
        .append(user_event("User.Created", "A"))
        .expect("append should buffer");
    let document = session.abort();

    assert_eq!(-1, document.active.current_stream_version);
    let events = harness
        .engine
        .read(&document, None, None)
        .await
        .expect("read should succeed");
    assert!(events.is_empty());

    // An empty session commits as a no-op.
    let session = harness
        .engine
        .open_session(document)
        .expect("session should open");
    let document = session.commit().await.expect("empty commit should succeed");
    assert_eq!(None, document.hash);
}

#[tokio::test]
async fn manual_rollback_is_idempotent() {
    let harness = Harness::new();

    let document = harness
        .documents
        .get_or_create("users", "u1")
        .await
        .expect("creation should succeed");
    let mut session = harness
        .engine
        .open_session(document)
        .expect("session should open");
    for name in ["A", "B", "C"] {
        session
            .append(user_event("User.Created", name))
            .expect("append should buffer");
    }
    let mut document = session.commit().await.expect("commit should succeed");

    let removed = harness
        .engine
        .rollback_range(&mut document, 1, 2)
        .await
        .expect("rollback should succeed");
    assert_eq!(2, removed);
    assert_eq!(0, document.active.current_stream_version);
    assert_eq!(1, document.active.rollback_history.len());

    let again = harness
        .engine
        .rollback_range(&mut document, 1, 2)
        .await
        .expect("second rollback should succeed");
    assert_eq!(0, again);
    assert_eq!(1, document.active.rollback_history.len());

    let events = harness
        .engine
        .read(&document, None, None)
        .await
        .expect("read should succeed");
    assert_eq!(1, events.len());
}
