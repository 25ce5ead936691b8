//! Merge persistor behavior tests.
//!
//! Covers the concrete page-application scenarios: fresh chunk creation,
//! idempotent re-application, overlap merges from divergent pagination,
//! terminal-edge handling, and malformed-event tolerance.

use serde_json::json;
use tidemark_core::{
    InsertOutcome, MAX_CHUNK_MERGES_PER_PAGE, MemoryTimelineStore, PagePersistor, StoredEvent,
    TimelineStore,
};
use tidemark_proto::{Direction, Event, EventKind, Page, UnsignedData};

const ROOM: &str = "!room:example.org";

fn message(id: &str) -> Event {
    Event {
        event_id: id.to_owned(),
        sender: "@alice:example.org".to_owned(),
        kind: EventKind::Message,
        content: json!({"body": format!("body of {id}")}),
        origin_server_ts: 1_700_000_000_000,
        state_key: None,
        unsigned: None,
    }
}

fn page(start: &str, end: Option<&str>, events: Vec<Event>) -> Page {
    Page {
        start: Some(start.to_owned()),
        end: end.map(ToOwned::to_owned),
        events,
        state_events: Vec::new(),
    }
}

/// Normalized view of a room's chunk graph for structural comparison.
fn graph_shape(store: &MemoryTimelineStore) -> Vec<(Option<String>, Option<String>, Vec<String>, bool, bool)> {
    let mut shape: Vec<_> = store
        .all_chunks(ROOM)
        .into_iter()
        .map(|c| (c.prev_token, c.next_token, c.event_ids, c.is_last_forward, c.is_last_backward))
        .collect();
    shape.sort();
    shape
}

#[test]
fn forward_page_on_empty_room_creates_single_chunk() {
    let store = MemoryTimelineStore::new();
    let persistor = PagePersistor::new(store.clone());

    let outcome = persistor
        .insert_page(ROOM, &page("a", Some("b"), vec![message("$e1"), message("$e2")]), Direction::Forwards)
        .unwrap();

    assert_eq!(outcome, InsertOutcome::Success);
    let chunks = store.all_chunks(ROOM);
    assert_eq!(chunks.len(), 1);
    let chunk = &chunks[0];
    assert_eq!(chunk.prev_token.as_deref(), Some("a"));
    assert_eq!(chunk.next_token.as_deref(), Some("b"));
    assert_eq!(chunk.event_ids, vec!["$e1", "$e2"]);

    let e1 = store.event(ROOM, "$e1").unwrap().unwrap();
    let e2 = store.event(ROOM, "$e2").unwrap().unwrap();
    assert!(e1.display_index < e2.display_index);
}

#[test]
fn backward_page_preserves_forward_order() {
    let store = MemoryTimelineStore::new();
    let persistor = PagePersistor::new(store.clone());

    // Backward pages arrive newest-first.
    persistor
        .insert_page(ROOM, &page("t1", Some("t2"), vec![message("$e9"), message("$e8")]), Direction::Backwards)
        .unwrap();

    let chunks = store.all_chunks(ROOM);
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].event_ids, vec!["$e8", "$e9"]);
    assert_eq!(chunks[0].next_token.as_deref(), Some("t1"));
    assert_eq!(chunks[0].prev_token.as_deref(), Some("t2"));
}

#[test]
fn applying_same_page_twice_is_idempotent() {
    let store = MemoryTimelineStore::new();
    let persistor = PagePersistor::new(store.clone());
    let p = page("t1", Some("t2"), vec![message("$e9"), message("$e8")]);

    persistor.insert_page(ROOM, &p, Direction::Backwards).unwrap();
    let first = graph_shape(&store);

    persistor.insert_page(ROOM, &p, Direction::Backwards).unwrap();
    let second = graph_shape(&store);

    assert_eq!(first, second);
    assert_eq!(store.chunk_count(ROOM), 1);
}

#[test]
fn divergent_pagination_chunks_merge_on_shared_event() {
    let store = MemoryTimelineStore::new();
    let persistor = PagePersistor::new(store.clone());

    // Chunk one: [prev="a", next="b"] containing E4, E5.
    persistor
        .insert_page(ROOM, &page("b", Some("a"), vec![message("$e5"), message("$e4")]), Direction::Backwards)
        .unwrap();
    // Divergent pagination reaches E5 again from the other side:
    // [prev="b", next="c"] containing E5, E6.
    persistor
        .insert_page(ROOM, &page("c", Some("b"), vec![message("$e6"), message("$e5")]), Direction::Backwards)
        .unwrap();

    let chunks = store.all_chunks(ROOM);
    assert_eq!(chunks.len(), 1, "overlapping chunks must merge into one");
    let merged = &chunks[0];
    assert_eq!(merged.prev_token.as_deref(), Some("a"));
    assert_eq!(merged.next_token.as_deref(), Some("c"));
    assert_eq!(merged.event_ids, vec!["$e4", "$e5", "$e6"]);

    // Display indices follow the merged forward order.
    let indices: Vec<i64> = merged
        .event_ids
        .iter()
        .map(|id| store.event(ROOM, id).unwrap().unwrap().display_index)
        .collect();
    assert!(indices.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn empty_page_with_token_requests_more() {
    let store = MemoryTimelineStore::new();
    let persistor = PagePersistor::new(store.clone());

    let outcome = persistor
        .insert_page(ROOM, &page("a", Some("b"), vec![]), Direction::Backwards)
        .unwrap();
    assert_eq!(outcome, InsertOutcome::ShouldFetchMore);
}

#[test]
fn empty_backward_page_without_token_marks_history_start() {
    let store = MemoryTimelineStore::new();
    let persistor = PagePersistor::new(store.clone());

    persistor
        .insert_page(ROOM, &page("t0", Some("a"), vec![message("$e1")]), Direction::Backwards)
        .unwrap();
    let outcome = persistor
        .insert_page(ROOM, &page("a", None, vec![]), Direction::Backwards)
        .unwrap();

    assert_eq!(outcome, InsertOutcome::ReachedEnd);
    let chunks = store.all_chunks(ROOM);
    assert_eq!(chunks.len(), 1);
    assert!(chunks[0].is_last_backward);
    assert_eq!(chunks[0].prev_token, None);
}

#[test]
fn forward_reach_end_displaces_previous_live_chunk() {
    let store = MemoryTimelineStore::new();
    let persistor = PagePersistor::new(store.clone());

    let old_live = persistor.ensure_live_chunk(ROOM, Some("t-live")).unwrap();
    assert!(old_live.is_last_forward);

    // An unrelated historical chunk paginates forward and hits the end.
    persistor
        .insert_page(ROOM, &page("x", Some("y"), vec![message("$e5"), message("$e4")]), Direction::Backwards)
        .unwrap();
    let outcome = persistor
        .insert_page(ROOM, &page("x", None, vec![message("$e6")]), Direction::Forwards)
        .unwrap();
    assert_eq!(outcome, InsertOutcome::Success);

    let live = store.live_chunk(ROOM).unwrap().expect("a live chunk remains");
    assert_ne!(live.id, old_live.id, "old live chunk must be displaced");
    assert!(live.was_live_forward);
    assert_eq!(live.event_ids, vec!["$e4", "$e5", "$e6"]);
    assert!(store.chunk(ROOM, old_live.id).unwrap().is_none(), "displaced copy is deleted");
    assert_eq!(store.latest_previewable(ROOM).unwrap().as_deref(), Some("$e6"));
}

#[test]
fn second_backward_claim_moves_history_start_flag() {
    let store = MemoryTimelineStore::new();
    let persistor = PagePersistor::new(store.clone());

    persistor
        .insert_page(ROOM, &page("a", None, vec![message("$e1")]), Direction::Backwards)
        .unwrap();
    persistor
        .insert_page(ROOM, &page("z", None, vec![message("$e2")]), Direction::Backwards)
        .unwrap();

    let backward_terminals: Vec<_> = store
        .all_chunks(ROOM)
        .into_iter()
        .filter(|c| c.is_last_backward)
        .collect();
    assert_eq!(backward_terminals.len(), 1);
    assert!(backward_terminals[0].contains("$e2"));
}

#[test]
fn malformed_events_are_dropped_without_aborting() {
    let store = MemoryTimelineStore::new();
    let persistor = PagePersistor::new(store.clone());

    let mut no_sender = message("$broken");
    no_sender.sender = String::new();
    let outcome = persistor
        .insert_page(
            ROOM,
            &page("a", Some("b"), vec![message("$ok"), no_sender]),
            Direction::Forwards,
        )
        .unwrap();

    assert_eq!(outcome, InsertOutcome::Success);
    let chunks = store.all_chunks(ROOM);
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].event_ids, vec!["$ok"]);
    assert!(store.event(ROOM, "$broken").unwrap().is_none());
}

#[test]
fn backward_pages_apply_prev_content_for_member_state() {
    let store = MemoryTimelineStore::new();
    let persistor = PagePersistor::new(store.clone());

    let mut member = Event {
        event_id: "$m1".to_owned(),
        sender: "@bob:example.org".to_owned(),
        kind: EventKind::Member,
        content: json!({"membership": "join", "displayname": "Bob v2"}),
        origin_server_ts: 0,
        state_key: Some("@bob:example.org".to_owned()),
        unsigned: None,
    };
    member.unsigned = Some(UnsignedData {
        transaction_id: None,
        prev_content: Some(json!({"membership": "join", "displayname": "Bob v1"})),
    });

    let mut bob_message = message("$from-bob");
    bob_message.sender = "@bob:example.org".to_owned();

    let page = Page {
        start: Some("t1".to_owned()),
        end: Some("t2".to_owned()),
        events: vec![bob_message, member],
        state_events: Vec::new(),
    };
    persistor.insert_page(ROOM, &page, Direction::Backwards).unwrap();

    // Walking backward, the member's previous content is the state that
    // held before the page's events.
    let content = store.member_content(ROOM, "@bob:example.org").unwrap().unwrap();
    assert_eq!(content.display_name.as_deref(), Some("Bob v1"));
}

#[test]
fn reactions_aggregate_onto_their_target() {
    let store = MemoryTimelineStore::new();
    let persistor = PagePersistor::new(store.clone());

    persistor
        .insert_page(ROOM, &page("a", Some("b"), vec![message("$target")]), Direction::Forwards)
        .unwrap();

    let reaction = Event {
        event_id: "$r1".to_owned(),
        sender: "@carol:example.org".to_owned(),
        kind: EventKind::Reaction,
        content: json!({
            "m.relates_to": {"rel_type": "m.annotation", "event_id": "$target", "key": "👍"},
        }),
        origin_server_ts: 0,
        state_key: None,
        unsigned: None,
    };
    persistor
        .insert_page(ROOM, &page("b", Some("c"), vec![reaction.clone()]), Direction::Forwards)
        .unwrap();
    // Re-applying the same reaction must not double-count.
    persistor
        .insert_page(ROOM, &page("b", Some("c"), vec![reaction]), Direction::Forwards)
        .unwrap();

    let target = store.event(ROOM, "$target").unwrap().unwrap();
    assert_eq!(target.reactions.len(), 1);
    assert_eq!(target.reactions[0].key, "👍");
    assert_eq!(target.reactions[0].count, 1);
    assert_eq!(target.reactions[0].source_event_ids, vec!["$r1"]);
}

#[test]
fn context_page_anchors_a_new_chunk() {
    let store = MemoryTimelineStore::new();
    let persistor = PagePersistor::new(store.clone());

    let chunk_id = persistor
        .insert_context_page(
            ROOM,
            &page("s", Some("e"), vec![message("$before"), message("$anchor"), message("$after")]),
        )
        .unwrap();

    let chunk = store.chunk(ROOM, chunk_id).unwrap().unwrap();
    assert_eq!(chunk.event_ids, vec!["$before", "$anchor", "$after"]);
    assert_eq!(chunk.prev_token.as_deref(), Some("s"));
    assert_eq!(chunk.next_token.as_deref(), Some("e"));
    assert!(!chunk.is_last_forward);
}

#[test]
fn overlap_merges_are_capped_per_page() {
    let store = MemoryTimelineStore::new();
    let persistor = PagePersistor::new(store.clone());

    // Pathological precondition: many chunks already share one event.
    let extra = 4;
    store
        .in_transaction(ROOM, |txn| {
            txn.put_event(StoredEvent::synced(ROOM, message("$shared"), 0));
            for _ in 0..(MAX_CHUNK_MERGES_PER_PAGE + extra) {
                let mut chunk = txn.create_chunk();
                chunk.event_ids.push("$shared".to_owned());
                txn.put_chunk(chunk);
            }
            Ok(())
        })
        .unwrap();

    persistor
        .insert_page(ROOM, &page("a", Some("b"), vec![message("$shared")]), Direction::Forwards)
        .unwrap();

    // The page's chunk absorbed the cap's worth; the rest wait for a
    // later pass instead of amplifying one page application.
    assert_eq!(store.chunk_count(ROOM), extra + 1);
}

#[test]
fn clear_room_removes_every_chunk() {
    let store = MemoryTimelineStore::new();
    let persistor = PagePersistor::new(store.clone());

    persistor
        .insert_page(ROOM, &page("a", Some("b"), vec![message("$e1")]), Direction::Forwards)
        .unwrap();
    persistor.ensure_live_chunk(ROOM, None).unwrap();
    assert!(store.chunk_count(ROOM) >= 1);

    persistor.clear_room(ROOM).unwrap();
    assert_eq!(store.chunk_count(ROOM), 0);
    assert_eq!(store.latest_previewable(ROOM).unwrap(), None);
}
