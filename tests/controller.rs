use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chat_protocol::{
    ChatTransport, IncomingPart, MessageInfo, Role, Session, TokenUsage, TransportError, WireMessage,
};
use chat_store::{
    ChatStore, LoadDirection, ManualClock, MemoryStorage, ModelSelection, SessionController,
    StateStorage, StaticContextLimits, StoreConfig, StoreError, StreamPhase,
};
use chat_transport_mock::{MockOp, MockTransport, TransportCall, MOCK_MODEL_ID, MOCK_PROVIDER_ID};
use pretty_assertions::assert_eq;

const START: i64 = 1_700_000_000_000;

struct Harness {
    controller: SessionController,
    transport: Arc<MockTransport>,
    clock: ManualClock,
}

impl Harness {
    fn new(transport: MockTransport) -> Self {
        Self::with_config(transport, StoreConfig::default())
    }

    fn with_config(transport: MockTransport, config: StoreConfig) -> Self {
        let clock = ManualClock::new(START);
        let limits = StaticContextLimits::new().with_limit(MOCK_PROVIDER_ID, MOCK_MODEL_ID, 10_000);
        let store = ChatStore::with_clock(config, Arc::new(clock.clone())).with_context_limits(Arc::new(limits));
        let transport = Arc::new(transport);
        let controller = SessionController::new(store, Arc::clone(&transport) as Arc<dyn ChatTransport>);
        Self {
            controller,
            transport,
            clock,
        }
    }

    fn pump_events(&self) {
        self.controller.handle_events(self.transport.take_events());
    }
}

fn selection() -> ModelSelection {
    ModelSelection::new(MOCK_PROVIDER_ID, MOCK_MODEL_ID).with_agent("build")
}

#[tokio::test]
async fn send_without_a_session_creates_one_and_streams_the_reply() {
    let harness = Harness::new(MockTransport::default().with_reply_tokens(TokenUsage::Total(2_500)));

    harness
        .controller
        .send_message("hello", &[], selection())
        .await
        .expect("send should succeed");

    let session_id = harness
        .controller
        .read(|store| store.current_session_id().map(str::to_string))
        .expect("a session was created");
    let prompts = harness.transport.sent_prompts();
    assert_eq!(prompts.len(), 1);
    assert_eq!(prompts[0].session_id, session_id);
    assert_eq!(prompts[0].agent.as_deref(), Some("build"));
    assert!(harness.controller.read(|store| store.is_loading()));

    harness.pump_events();

    harness.controller.read(|store| {
        let messages = store.messages(&session_id);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role(), Role::User);
        assert_eq!(messages[0].text(), "hello");
        assert_eq!(messages[1].role(), Role::Assistant);
        assert_eq!(messages[1].text(), "Mocked reply.");
        assert!(!store.is_loading());
        assert!(!store.is_streaming(&session_id));
        assert!(store.pending_user_message_ids().is_empty());
        assert_eq!(store.stream_phase(messages[1].id()), Some(StreamPhase::Cooldown));
    });

    let usage = harness
        .controller
        .store()
        .lock()
        .expect("store lock")
        .context_usage(&session_id)
        .expect("usage");
    assert_eq!(usage.total_tokens, 2_500);
    assert_eq!(usage.percentage, 25.0);

    harness.clock.advance(Duration::from_secs(3));
    let fired = harness.controller.fire_timers();
    assert_eq!(fired.settled.len(), 1);
}

#[tokio::test]
async fn failed_send_surfaces_an_error_and_keeps_the_optimistic_message() {
    let harness = Harness::new(MockTransport::default());
    harness.controller.create_session(None).await.expect("session");
    harness
        .transport
        .fail_next(MockOp::SendMessage, TransportError::Network("offline".to_string()));

    let result = harness.controller.send_message("hello", &[], selection()).await;

    assert!(matches!(result, Err(StoreError::Transport { .. })));
    harness.controller.read(|store| {
        assert!(store.error().is_some_and(|error| error.contains("offline")));
        assert!(!store.is_loading());
        let session_id = store.current_session_id().expect("current");
        assert_eq!(store.messages(session_id).len(), 1);
    });
}

#[tokio::test]
async fn gateway_timeout_relies_on_the_event_stream() {
    let harness = Harness::new(MockTransport::default());
    harness.controller.create_session(None).await.expect("session");
    harness
        .transport
        .fail_next(MockOp::SendMessage, TransportError::GatewayTimeout);

    harness
        .controller
        .send_message("hello", &[], selection())
        .await
        .expect("gateway timeout is not a failure");

    harness.controller.read(|store| {
        assert_eq!(store.error(), None);
        assert!(store.is_loading());
    });
}

#[tokio::test]
async fn session_crud_updates_the_list() {
    let harness = Harness::new(MockTransport::default());
    harness.transport.seed_session(Session::new("ses_existing", "Existing"));

    harness.controller.load_sessions().await.expect("list");
    let created = harness
        .controller
        .create_session(Some("Planning".to_string()))
        .await
        .expect("create");
    harness
        .controller
        .update_title(&created.id, "Renamed")
        .await
        .expect("rename");
    let shared = harness.controller.share_session(&created.id).await.expect("share");
    assert!(shared.share.is_some());

    harness.controller.read(|store| {
        let titles: Vec<&str> = store.sessions().iter().map(|session| session.title.as_str()).collect();
        assert_eq!(titles, vec!["Renamed", "Existing"]);
        assert!(store.current_session().and_then(|session| session.share.as_ref()).is_some());
    });

    harness.controller.delete_session(&created.id).await.expect("delete");
    harness.controller.read(|store| {
        assert_eq!(store.sessions().len(), 1);
        assert_eq!(store.current_session_id(), None);
    });
}

#[tokio::test]
async fn failed_crud_leaves_state_untouched() {
    let harness = Harness::new(MockTransport::default());
    harness.transport.seed_session(Session::new("ses_1", "Keep me"));
    harness.controller.load_sessions().await.expect("list");
    harness
        .transport
        .fail_next(MockOp::DeleteSession, TransportError::Status {
            code: 500,
            message: "boom".to_string(),
        });

    let result = harness.controller.delete_session("ses_1").await;

    assert!(result.is_err());
    harness.controller.read(|store| {
        assert_eq!(store.sessions().len(), 1);
        assert!(store.error().is_some());
    });
}

#[tokio::test]
async fn switching_sessions_loads_history_once() {
    let harness = Harness::new(MockTransport::default());
    harness.transport.seed_session(Session::new("ses_1", "One"));
    harness.transport.seed_messages(
        "ses_1",
        vec![WireMessage {
            info: MessageInfo::new("msg_1", "ses_1", Role::User, START - 10),
            parts: vec![IncomingPart::text("prt_1", "earlier question")],
        }],
    );

    harness.controller.set_current_session("ses_1").await.expect("select");
    harness.controller.set_current_session("ses_1").await.expect("select again");

    let loads = harness
        .transport
        .calls()
        .into_iter()
        .filter(|call| matches!(call, TransportCall::GetMessages { .. }))
        .count();
    assert_eq!(loads, 1);
    harness.controller.read(|store| {
        assert_eq!(store.messages("ses_1")[0].text(), "earlier question");
    });
}

#[tokio::test]
async fn selecting_a_session_the_backend_lost_drops_it() {
    let harness = Harness::new(MockTransport::default());
    harness.transport.seed_session(Session::new("ses_gone", "Gone"));
    harness.controller.load_sessions().await.expect("sessions");
    harness
        .transport
        .fail_next(MockOp::GetMessages, TransportError::NotFound("session ses_gone".to_string()));

    let result = harness.controller.set_current_session("ses_gone").await;

    assert!(matches!(result, Err(StoreError::SessionNotFound(id)) if id == "ses_gone"));
    harness.controller.read(|store| {
        assert!(store.session("ses_gone").is_none());
        assert_eq!(store.current_session_id(), None);
        assert_eq!(store.error(), None);
    });
}

#[tokio::test]
async fn load_more_requires_a_current_session() {
    let harness = Harness::new(MockTransport::default());
    assert!(matches!(
        harness.controller.load_more(LoadDirection::Up).await,
        Err(StoreError::NoCurrentSession)
    ));
}

#[tokio::test]
async fn load_more_fetches_a_larger_tail() {
    let harness = Harness::with_config(
        MockTransport::default(),
        StoreConfig::default().with_history_page_size(2),
    );
    harness.transport.seed_session(Session::new("ses_1", "One"));
    let history: Vec<WireMessage> = (0..5)
        .map(|index| WireMessage {
            info: MessageInfo::new(format!("msg_{index}"), "ses_1", Role::User, START + index),
            parts: vec![IncomingPart::text(format!("prt_{index}"), "text")],
        })
        .collect();
    harness.transport.seed_messages("ses_1", history);

    harness.controller.set_current_session("ses_1").await.expect("select");
    let added = harness.controller.load_more(LoadDirection::Up).await.expect("backfill");

    assert_eq!(added, 2);
    assert!(harness.transport.calls().contains(&TransportCall::GetMessages {
        session_id: "ses_1".to_string(),
        limit: Some(4),
    }));
    harness.controller.read(|store| assert_eq!(store.messages("ses_1").len(), 4));
}

#[tokio::test]
async fn custom_command_inserts_the_expanded_template_before_the_reply() {
    let harness = Harness::new(MockTransport::default().with_command_template("review", "Review $ARGUMENTS"));
    harness.controller.create_session(None).await.expect("session");

    harness
        .controller
        .send_message("/review src/lib.rs", &[], selection())
        .await
        .expect("command");
    harness.pump_events();

    let calls = harness.transport.calls();
    assert!(calls.iter().any(|call| matches!(
        call,
        TransportCall::RunCommand { request } if request.command == "review" && request.arguments == "src/lib.rs"
    )));
    harness.controller.read(|store| {
        let session_id = store.current_session_id().expect("current");
        let messages = store.messages(session_id);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role(), Role::User);
        assert_eq!(messages[0].text(), "Review src/lib.rs");
        assert_eq!(messages[1].text(), "Mocked reply.");
    });
}

#[tokio::test]
async fn builtin_commands_use_their_endpoints() {
    let harness = Harness::new(MockTransport::default());
    let session = harness.controller.create_session(None).await.expect("session");

    harness.controller.send_message("/init", &[], selection()).await.expect("init");
    harness.controller.send_message("/compact", &[], selection()).await.expect("summarize");
    harness.controller.send_message("/share", &[], selection()).await.expect("share");

    let calls = harness.transport.calls();
    assert!(calls.iter().any(|call| matches!(call, TransportCall::InitSession { session_id, .. } if *session_id == session.id)));
    assert!(calls.contains(&TransportCall::SummarizeSession {
        session_id: session.id.clone(),
    }));
    assert!(calls.contains(&TransportCall::ShareSession {
        session_id: session.id.clone(),
    }));
    assert!(harness.transport.sent_prompts().is_empty());
}

#[tokio::test]
async fn abort_clears_state_even_when_the_backend_fails() {
    let harness = Harness::new(MockTransport::default());
    harness.controller.create_session(None).await.expect("session");
    harness
        .transport
        .fail_next(MockOp::SendMessage, TransportError::GatewayTimeout);
    harness.controller.send_message("long task", &[], selection()).await.expect("send");
    harness
        .transport
        .fail_next(MockOp::AbortSession, TransportError::Network("gone".to_string()));

    let acknowledged = harness
        .controller
        .abort_current_operation()
        .await
        .expect("abort never fails");

    assert!(!acknowledged);
    harness.controller.read(|store| {
        assert!(!store.is_loading());
        let session_id = store.current_session_id().expect("current");
        assert!(!store.is_streaming(session_id));
    });
    assert!(!harness.controller.abort_current_operation().await.expect("nothing to abort"));
}

#[tokio::test]
async fn persisted_state_survives_a_restart() {
    let storage: Arc<dyn StateStorage> = Arc::new(MemoryStorage::new());
    let harness = Harness::new(MockTransport::default().with_reply_tokens(TokenUsage::Total(1_000)));
    let controller = harness.controller.clone().with_storage(Arc::clone(&storage));

    controller.send_message("hello", &[], selection()).await.expect("send");
    controller.handle_events(harness.transport.take_events());
    controller.persist().expect("persist");

    let restarted = SessionController::new(
        ChatStore::with_clock(StoreConfig::default(), Arc::new(ManualClock::new(START))),
        Arc::new(MockTransport::default()) as Arc<dyn ChatTransport>,
    )
    .with_storage(storage);
    assert!(restarted.restore().expect("restore"));

    restarted.read(|store| {
        let session_id = store.current_session_id().expect("current restored");
        assert_eq!(store.sessions().len(), 1);
        assert_eq!(
            store.model_selection(session_id).and_then(|selection| selection.agent.as_deref()),
            Some("build")
        );
        assert!(!store.is_resident(session_id));
    });
}

#[tokio::test]
async fn timer_driver_stops_on_shutdown() {
    let harness = Harness::with_config(
        MockTransport::default(),
        StoreConfig::default().with_timer_tick(Duration::from_millis(1)),
    );
    let shutdown = Arc::new(AtomicBool::new(false));
    let driver = {
        let controller = harness.controller.clone();
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move { controller.drive_timers(shutdown).await })
    };

    tokio::time::sleep(Duration::from_millis(5)).await;
    shutdown.store(true, Ordering::SeqCst);
    tokio::time::timeout(Duration::from_secs(1), driver)
        .await
        .expect("driver exits")
        .expect("driver task");
}
