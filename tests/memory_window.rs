use std::sync::Arc;
use std::time::Duration;

use chat_protocol::{IncomingPart, MessageInfo, Role, WireMessage};
use chat_store::{ChatStore, LoadDirection, ManualClock, StoreConfig};
use pretty_assertions::assert_eq;

const START: i64 = 1_700_000_000_000;

fn store_with(config: StoreConfig) -> (ChatStore, ManualClock) {
    let clock = ManualClock::new(START);
    let store = ChatStore::with_clock(config, Arc::new(clock.clone()));
    (store, clock)
}

fn history(session_id: &str, count: usize) -> Vec<WireMessage> {
    (0..count)
        .map(|index| {
            let role = if index % 2 == 0 { Role::User } else { Role::Assistant };
            WireMessage {
                info: MessageInfo::new(format!("msg_{index:02}"), session_id, role, START + index as i64),
                parts: vec![IncomingPart::text(format!("prt_{index:02}"), format!("message {index}"))],
            }
        })
        .collect()
}

fn ids(store: &ChatStore, session_id: &str) -> Vec<String> {
    store
        .messages(session_id)
        .iter()
        .map(|message| message.id().to_string())
        .collect()
}

fn open(store: &mut ChatStore, clock: &ManualClock, session_id: &str, count: usize) {
    clock.advance(Duration::from_secs(1));
    if store.select_session(session_id) {
        store.load_messages(session_id, history(session_id, count), None);
    }
}

#[test]
fn least_recently_used_session_is_evicted_first() {
    let (mut store, clock) = store_with(StoreConfig::default().with_max_sessions(2));

    open(&mut store, &clock, "ses_a", 2);
    open(&mut store, &clock, "ses_b", 2);
    open(&mut store, &clock, "ses_c", 2);

    assert_eq!(store.resident_session_ids(), vec!["ses_b", "ses_c"]);
    assert!(store.memory_state("ses_a").is_none());

    // Reopening needs a fresh load.
    clock.advance(Duration::from_secs(1));
    assert!(store.select_session("ses_a"));
}

#[test]
fn streaming_and_current_sessions_are_never_evicted() {
    let (mut store, clock) = store_with(StoreConfig::default().with_max_sessions(2));

    open(&mut store, &clock, "ses_a", 2);
    store.add_streaming_part(
        "ses_a",
        "msg_reply",
        IncomingPart::text_delta("prt_reply", "still going"),
        Some(Role::Assistant),
    );
    open(&mut store, &clock, "ses_b", 2);
    open(&mut store, &clock, "ses_c", 2);

    assert!(store.is_streaming("ses_a"));
    assert_eq!(store.resident_session_ids(), vec!["ses_a", "ses_c"]);
    assert_eq!(store.current_session_id(), Some("ses_c"));
}

#[test]
fn current_session_is_trimmed_to_the_viewport_around_the_tail() {
    let (mut store, clock) = store_with(StoreConfig::default().with_viewport_messages(3));

    open(&mut store, &clock, "ses_a", 10);

    assert_eq!(ids(&store, "ses_a"), vec!["msg_07", "msg_08", "msg_09"]);
    let state = store.memory_state("ses_a").expect("state");
    assert!(state.has_more_above);
    assert_eq!(state.viewport_anchor, 2);
}

#[test]
fn leaving_a_session_trims_it_around_the_anchor() {
    let config = StoreConfig::default().with_viewport_messages(4);
    let (mut store, clock) = store_with(config);

    store.select_session("ses_a");
    // Loaded while not current, so nothing is trimmed yet.
    store.select_session("ses_b");
    store.load_messages("ses_a", history("ses_a", 10), None);
    assert_eq!(store.messages("ses_a").len(), 10);

    store.select_session("ses_a");
    store.update_viewport_anchor("ses_a", 3);
    clock.advance(Duration::from_secs(1));
    store.select_session("ses_b");

    assert_eq!(ids(&store, "ses_a"), vec!["msg_01", "msg_02", "msg_03", "msg_04"]);
    assert_eq!(store.memory_state("ses_a").map(|state| state.viewport_anchor), Some(2));
}

#[test]
fn viewport_never_drops_below_its_size() {
    let (mut store, clock) = store_with(StoreConfig::default().with_viewport_messages(5));

    open(&mut store, &clock, "ses_a", 3);
    store.apply_window("ses_a");
    assert_eq!(store.messages("ses_a").len(), 3);

    open(&mut store, &clock, "ses_b", 12);
    store.apply_window("ses_b");
    assert_eq!(store.messages("ses_b").len(), 5);
}

#[test]
fn streaming_sessions_are_not_trimmed_on_switch() {
    let (mut store, clock) = store_with(StoreConfig::default().with_viewport_messages(2));

    store.select_session("ses_b");
    store.load_messages("ses_a", history("ses_a", 6), None);
    store.select_session("ses_a");
    store.add_streaming_part(
        "ses_a",
        "msg_reply",
        IncomingPart::text_delta("prt_reply", "thinking"),
        Some(Role::Assistant),
    );
    clock.advance(Duration::from_secs(1));
    store.select_session("ses_b");

    assert_eq!(store.messages("ses_a").len(), 7);
}

#[test]
fn background_streams_keep_only_the_newest_messages() {
    let (mut store, clock) = store_with(StoreConfig::default().with_background_streaming_buffer(2));
    store.select_session("ses_current");

    for index in 0..4 {
        clock.advance(Duration::from_millis(10));
        store.add_streaming_part(
            "ses_background",
            &format!("msg_bg_{index}"),
            IncomingPart::text_delta(format!("prt_bg_{index}"), "step"),
            Some(Role::Assistant),
        );
    }

    assert_eq!(ids(&store, "ses_background"), vec!["msg_bg_2", "msg_bg_3"]);
    let state = store.memory_state("ses_background").expect("state");
    assert!(state.has_more_above);
    assert_eq!(store.stream_phase("msg_bg_0"), None);
    assert!(store.stream_phase("msg_bg_3").is_some());
}

#[test]
fn older_history_is_backfilled_above() {
    let (mut store, _clock) = store_with(StoreConfig::default().with_history_page_size(2));
    let server = history("ses_a", 6);

    store.select_session("ses_a");
    store.load_messages("ses_a", server[4..].to_vec(), Some(2));
    assert!(store.memory_state("ses_a").is_some_and(|state| state.has_more_above));

    let limit = store.backfill_limit("ses_a", LoadDirection::Up);
    assert_eq!(limit, 4);
    let added = store.apply_backfill("ses_a", LoadDirection::Up, server[2..].to_vec(), limit);
    assert_eq!(added, 2);
    assert_eq!(ids(&store, "ses_a"), vec!["msg_02", "msg_03", "msg_04", "msg_05"]);
    assert!(store.memory_state("ses_a").is_some_and(|state| state.has_more_above));

    let limit = store.backfill_limit("ses_a", LoadDirection::Up);
    assert_eq!(limit, 6);
    let added = store.apply_backfill("ses_a", LoadDirection::Up, server.clone(), limit);
    assert_eq!(added, 2);
    assert_eq!(store.messages("ses_a").len(), 6);

    // A short page means the top of the history was reached.
    let limit = store.backfill_limit("ses_a", LoadDirection::Up);
    let added = store.apply_backfill("ses_a", LoadDirection::Up, server, limit);
    assert_eq!(added, 0);
    assert!(store.memory_state("ses_a").is_some_and(|state| !state.has_more_above));
}

#[test]
fn newer_history_is_backfilled_below_without_duplicates() {
    let (mut store, _clock) = store_with(StoreConfig::default().with_history_page_size(3));
    let server = history("ses_a", 5);

    store.select_session("ses_a");
    store.load_messages("ses_a", server[..3].to_vec(), None);

    let limit = store.backfill_limit("ses_a", LoadDirection::Down);
    assert_eq!(limit, 3);
    let added = store.apply_backfill("ses_a", LoadDirection::Down, server[2..].to_vec(), limit);

    assert_eq!(added, 2);
    assert_eq!(
        ids(&store, "ses_a"),
        vec!["msg_00", "msg_01", "msg_02", "msg_03", "msg_04"]
    );
}
