use std::{
    collections::{HashSet, VecDeque},
    sync::atomic::{AtomicBool, AtomicUsize},
};

use async_trait::async_trait;
use octopus_core::{AdapterStream, MessageBody, MessageRole};
use serde_json::json;
use tokio::sync::Notify;
use tokio_test::{assert_err, assert_ok};

use super::*;
use crate::storage::MemoryStore;

/// What one `interact` call produces.
enum Script {
    /// Events delivered immediately.
    Events(Vec<Result<AdapterEvent, AdapterError>>),
    /// Events fed by the test through the paired sender.
    Live(mpsc::UnboundedReceiver<Result<AdapterEvent, AdapterError>>),
}

#[derive(Default)]
struct Shared {
    scripts: Mutex<VecDeque<Script>>,
    interactions: Mutex<Vec<(String, Option<String>)>>,
    pending: Mutex<HashSet<String>>,
    opens: AtomicUsize,
    closes: AtomicUsize,
    close_started: Notify,
    close_release: Option<Notify>,
}

impl Shared {
    fn interactions(&self) -> Vec<(String, Option<String>)> {
        self.interactions.lock().unwrap().clone()
    }
}

#[derive(Clone)]
struct ScriptedAdapter(Arc<Shared>);

impl ScriptedAdapter {
    fn new() -> Self {
        Self(Arc::new(Shared::default()))
    }

    /// An adapter whose `close` blocks until released through `close_release`.
    fn with_gated_close() -> Self {
        Self(Arc::new(Shared {
            close_release: Some(Notify::new()),
            ..Shared::default()
        }))
    }

    fn push(&self, events: Vec<Result<AdapterEvent, AdapterError>>) {
        self.0
            .scripts
            .lock()
            .unwrap()
            .push_back(Script::Events(events));
    }

    fn push_live(&self) -> mpsc::UnboundedSender<Result<AdapterEvent, AdapterError>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.0.scripts.lock().unwrap().push_back(Script::Live(rx));
        tx
    }
}

#[async_trait]
impl AssistantAdapter for ScriptedAdapter {
    async fn open(&self, _ctx: &ExecutionContext) -> Result<Box<dyn AdapterHandle>, AdapterError> {
        self.0.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedHandle(Arc::clone(&self.0))))
    }
}

struct ScriptedHandle(Arc<Shared>);

#[async_trait]
impl AdapterHandle for ScriptedHandle {
    async fn interact(
        &self,
        prompt: &str,
        resume_token: Option<&str>,
    ) -> Result<AdapterStream, AdapterError> {
        self.0
            .interactions
            .lock()
            .unwrap()
            .push((prompt.to_string(), resume_token.map(str::to_string)));
        let script = self.0.scripts.lock().unwrap().pop_front();
        match script {
            Some(Script::Events(events)) => Ok(futures::stream::iter(events).boxed()),
            Some(Script::Live(rx)) => Ok(UnboundedReceiverStream::new(rx).boxed()),
            None => Err(AdapterError::Spawn("no script".into())),
        }
    }

    async fn resolve_approval(&self, tool_use_id: &str, _decision: ApprovalDecision) -> bool {
        self.0.pending.lock().unwrap().remove(tool_use_id)
    }

    async fn close(&self) -> Result<(), AdapterError> {
        self.0.closes.fetch_add(1, Ordering::SeqCst);
        self.0.close_started.notify_one();
        if let Some(release) = &self.0.close_release {
            release.notified().await;
        }
        Ok(())
    }
}

fn text(s: &str) -> Result<AdapterEvent, AdapterError> {
    Ok(AdapterEvent::Text { text: s.into() })
}

fn completed(token: &str) -> Result<AdapterEvent, AdapterError> {
    Ok(AdapterEvent::Completed(Completion {
        resume_token: Some(token.into()),
        cost: Some(0.01),
        turns: Some(1),
        duration_ms: Some(1200),
        is_error: false,
    }))
}

fn registry(adapter: &ScriptedAdapter) -> (Arc<SessionRegistry>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let registry = SessionRegistry::new(
        Arc::clone(&store) as Arc<dyn TranscriptStore>,
        Arc::new(adapter.clone()),
        PathBuf::from("/tmp"),
    );
    (Arc::new(registry), store)
}

/// Memory store whose writes can be made to fail on demand.
#[derive(Default)]
struct FlakyStore {
    inner: MemoryStore,
    fail_appends: AtomicBool,
    fail_tokens: AtomicBool,
}

impl FlakyStore {
    fn check(flag: &AtomicBool) -> Result<(), StorageError> {
        if flag.load(Ordering::SeqCst) {
            Err(StorageError::Internal("disk full".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl TranscriptStore for FlakyStore {
    async fn save_session(&self, session: &Session) -> Result<(), StorageError> {
        self.inner.save_session(session).await
    }

    async fn load_sessions(&self) -> Result<Vec<Session>, StorageError> {
        self.inner.load_sessions().await
    }

    async fn set_resume_token(&self, id: &str, token: &str) -> Result<(), StorageError> {
        Self::check(&self.fail_tokens)?;
        self.inner.set_resume_token(id, token).await
    }

    async fn rename_session(&self, id: &str, name: &str) -> Result<(), StorageError> {
        self.inner.rename_session(id, name).await
    }

    async fn append_message(
        &self,
        id: &str,
        seq: u64,
        message: &Message,
    ) -> Result<(), StorageError> {
        Self::check(&self.fail_appends)?;
        self.inner.append_message(id, seq, message).await
    }

    async fn load_messages(&self, id: &str) -> Result<Vec<Message>, StorageError> {
        self.inner.load_messages(id).await
    }

    async fn delete_session(&self, id: &str) -> Result<(), StorageError> {
        self.inner.delete_session(id).await
    }
}

fn flaky_registry(adapter: &ScriptedAdapter) -> (Arc<SessionRegistry>, Arc<FlakyStore>) {
    let store = Arc::new(FlakyStore::default());
    let registry = SessionRegistry::new(
        Arc::clone(&store) as Arc<dyn TranscriptStore>,
        Arc::new(adapter.clone()),
        PathBuf::from("/tmp"),
    );
    (Arc::new(registry), store)
}

async fn status_of(registry: &SessionRegistry, id: &str) -> SessionStatus {
    assert_ok!(registry.get_session(id).await).session.status
}

fn status(status: SessionStatus) -> SessionEvent {
    SessionEvent::Status { status }
}

#[tokio::test]
async fn test_create_session_is_idle_and_lazy() {
    let adapter = ScriptedAdapter::new();
    let (registry, store) = registry(&adapter);

    let session = assert_ok!(
        registry
            .create_session("S1", Some(PathBuf::from("/tmp")))
            .await
    );
    assert_eq!(session.status, SessionStatus::Idle);
    assert!(session.resume_token.is_none());
    assert_eq!(adapter.0.opens.load(Ordering::SeqCst), 0);
    assert_eq!(store.load_sessions().await.unwrap().len(), 1);

    let defaulted = assert_ok!(registry.create_session("S2", None).await);
    assert_eq!(defaulted.working_dir, PathBuf::from("/tmp"));
}

#[tokio::test]
async fn test_hello_turn_event_order_and_transcript() {
    let adapter = ScriptedAdapter::new();
    adapter.push(vec![
        Ok(AdapterEvent::Ignored {
            kind: "system".into(),
        }),
        text("Hi there"),
        Ok(AdapterEvent::ToolUse {
            id: "tu_1".into(),
            name: "Bash".into(),
            input: json!({"command": "ls"}),
        }),
        Ok(AdapterEvent::ToolResult {
            tool_use_id: "tu_1".into(),
            output: json!("a.rs"),
            is_error: false,
        }),
        completed("c-1"),
    ]);
    let (registry, _store) = registry(&adapter);
    let session = registry.create_session("S1", None).await.unwrap();

    let (sink, mut subscriber) = mpsc::unbounded_channel();
    registry.subscribe(&session.id, sink).await.unwrap();

    let events: Vec<SessionEvent> = assert_ok!(registry.send_message(&session.id, "hello").await)
        .collect()
        .await;

    assert_eq!(events, [
        status(SessionStatus::Running),
        SessionEvent::UserMessage {
            content: "hello".into()
        },
        SessionEvent::AssistantText {
            content: "Hi there".into()
        },
        SessionEvent::ToolUse {
            tool: "Bash".into(),
            input: json!({"command": "ls"}),
            tool_use_id: "tu_1".into(),
        },
        SessionEvent::ToolResult {
            tool_use_id: "tu_1".into(),
            output: json!("a.rs"),
            is_error: false,
        },
        SessionEvent::Result {
            claude_session_id: Some("c-1".into()),
            cost: Some(0.01),
            turns: Some(1),
            duration_ms: Some(1200),
            is_error: false,
        },
        status(SessionStatus::Idle),
    ]);

    // Subscribers see the same sequence, addressed to the session.
    let mut broadcast = Vec::new();
    while let Ok(frame) = subscriber.try_recv() {
        assert_eq!(frame.session_id, session.id);
        broadcast.push(frame.event);
    }
    assert_eq!(broadcast, events);

    let detail = registry.get_session(&session.id).await.unwrap();
    assert_eq!(detail.session.status, SessionStatus::Idle);
    assert_eq!(detail.session.resume_token.as_deref(), Some("c-1"));
    let kinds: Vec<_> = detail
        .messages
        .iter()
        .map(|m| (m.role, m.body.kind()))
        .collect();
    assert_eq!(kinds, [
        (MessageRole::User, "text"),
        (MessageRole::Assistant, "text"),
        (MessageRole::Assistant, "tool_use"),
        (MessageRole::Tool, "tool_result"),
        (MessageRole::System, "result"),
    ]);
    assert_eq!(registry.list_sessions().await[0].message_count, 5);
}

#[tokio::test]
async fn test_status_is_running_only_during_turn() {
    let adapter = ScriptedAdapter::new();
    let feed = adapter.push_live();
    let (registry, _store) = registry(&adapter);
    let session = registry.create_session("S1", None).await.unwrap();

    assert_eq!(status_of(&registry, &session.id).await, SessionStatus::Idle);
    let stream = registry.send_message(&session.id, "hi").await.unwrap();
    assert_eq!(status_of(&registry, &session.id).await, SessionStatus::Running);

    feed.send(text("working")).unwrap();
    feed.send(completed("c-1")).unwrap();
    let events: Vec<_> = stream.collect().await;
    assert_eq!(events.last(), Some(&status(SessionStatus::Idle)));
    assert_eq!(status_of(&registry, &session.id).await, SessionStatus::Idle);
}

#[tokio::test]
async fn test_second_send_while_running_conflicts() {
    let adapter = ScriptedAdapter::new();
    let feed = adapter.push_live();
    let (registry, _store) = registry(&adapter);
    let session = registry.create_session("S1", None).await.unwrap();

    let first = registry.send_message(&session.id, "a").await.unwrap();
    let second = registry.send_message(&session.id, "b").await;
    assert!(matches!(second, Err(RegistryError::Conflict(ref id)) if *id == session.id));

    feed.send(text("done with a")).unwrap();
    feed.send(completed("c-1")).unwrap();
    let events: Vec<_> = first.collect().await;
    assert!(events.contains(&SessionEvent::AssistantText {
        content: "done with a".into()
    }));

    // The rejected prompt left no trace.
    let detail = registry.get_session(&session.id).await.unwrap();
    assert!(!detail.messages.contains(&Message::user_text("b")));
    assert_eq!(adapter.0.interactions().len(), 1);
}

#[tokio::test]
async fn test_concurrent_sends_admit_exactly_one() {
    let adapter = ScriptedAdapter::new();
    let feed = adapter.push_live();
    let (registry, store) = registry(&adapter);
    let session = registry.create_session("S1", None).await.unwrap();

    let attempts = (0..8).map(|i| {
        let registry = Arc::clone(&registry);
        let id = session.id.clone();
        tokio::spawn(async move { registry.send_message(&id, &format!("msg {i}")).await })
    });
    let results: Vec<_> = futures::future::join_all(attempts)
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();

    let mut admitted = Vec::new();
    for result in results {
        match result {
            Ok(stream) => admitted.push(stream),
            Err(RegistryError::Conflict(_)) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(admitted.len(), 1);

    feed.send(completed("c-1")).unwrap();
    let _: Vec<_> = admitted.pop().unwrap().collect().await;

    assert_eq!(adapter.0.interactions().len(), 1);
    assert_eq!(store.load_messages(&session.id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_distinct_sessions_do_not_block_each_other() {
    let adapter = ScriptedAdapter::new();
    let feed_a = adapter.push_live();
    let feed_b = adapter.push_live();
    let (registry, _store) = registry(&adapter);
    let a = registry.create_session("A", None).await.unwrap();
    let b = registry.create_session("B", None).await.unwrap();

    let mut stream_a = registry.send_message(&a.id, "for a").await.unwrap();
    feed_a.send(text("on it")).unwrap();
    while !matches!(
        stream_a.next().await,
        Some(SessionEvent::AssistantText { .. })
    ) {}
    let stream_b = registry.send_message(&b.id, "for b").await.unwrap();

    // B finishes while A is still in flight.
    feed_b.send(completed("c-b")).unwrap();
    let _: Vec<_> = stream_b.collect().await;
    assert_eq!(status_of(&registry, &b.id).await, SessionStatus::Idle);
    assert_eq!(status_of(&registry, &a.id).await, SessionStatus::Running);

    feed_a.send(completed("c-a")).unwrap();
    let _: Vec<_> = stream_a.collect().await;
    assert_eq!(status_of(&registry, &a.id).await, SessionStatus::Idle);

    let a_messages = registry.get_session(&a.id).await.unwrap().messages;
    assert_eq!(a_messages[0], Message::user_text("for a"));
    assert_eq!(a_messages.len(), 3);
}

#[tokio::test]
async fn test_resume_token_passed_verbatim_after_first_completion() {
    let adapter = ScriptedAdapter::new();
    adapter.push(vec![text("one"), completed("c-first")]);
    adapter.push(vec![text("two"), completed("c-second")]);
    adapter.push(vec![text("three"), completed("c-second")]);
    let (registry, _store) = registry(&adapter);
    let session = registry.create_session("S1", None).await.unwrap();

    for prompt in ["1", "2", "3"] {
        let _: Vec<_> = registry
            .send_message(&session.id, prompt)
            .await
            .unwrap()
            .collect()
            .await;
    }

    assert_eq!(adapter.0.interactions(), [
        ("1".to_string(), None),
        ("2".to_string(), Some("c-first".to_string())),
        ("3".to_string(), Some("c-second".to_string())),
    ]);
    // One handle serves every turn.
    assert_eq!(adapter.0.opens.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_adapter_failure_on_second_turn_keeps_token() {
    let adapter = ScriptedAdapter::new();
    adapter.push(vec![completed("c-1")]);
    adapter.push(vec![
        text("partial"),
        Err(AdapterError::Stream("pipe closed".into())),
    ]);
    let (registry, _store) = registry(&adapter);
    let session = registry.create_session("S1", None).await.unwrap();

    let _: Vec<_> = registry
        .send_message(&session.id, "first")
        .await
        .unwrap()
        .collect()
        .await;

    let (sink, mut subscriber) = mpsc::unbounded_channel();
    registry.subscribe(&session.id, sink).await.unwrap();
    let events: Vec<_> = assert_ok!(registry.send_message(&session.id, "second").await)
        .collect()
        .await;

    let error = SessionEvent::Error {
        message: "Stream failed: pipe closed".into(),
    };
    assert_eq!(&events[events.len() - 2..], [
        error.clone(),
        status(SessionStatus::Idle)
    ]);
    let mut broadcast = Vec::new();
    while let Ok(frame) = subscriber.try_recv() {
        broadcast.push(frame.event);
    }
    assert!(broadcast.contains(&error));

    let detail = registry.get_session(&session.id).await.unwrap();
    assert_eq!(detail.session.status, SessionStatus::Idle);
    assert_eq!(detail.session.resume_token.as_deref(), Some("c-1"));
    assert_eq!(
        detail.messages.last().map(|m| &m.body),
        Some(&MessageBody::Error {
            content: "Stream failed: pipe closed".into()
        })
    );
}

#[tokio::test]
async fn test_spawn_failure_becomes_error_event() {
    // No script queued: interact fails to spawn.
    let adapter = ScriptedAdapter::new();
    let (registry, _store) = registry(&adapter);
    let session = registry.create_session("S1", None).await.unwrap();

    let events: Vec<_> = assert_ok!(registry.send_message(&session.id, "hi").await)
        .collect()
        .await;
    assert!(matches!(
        events.as_slice(),
        [
            SessionEvent::Status { .. },
            SessionEvent::UserMessage { .. },
            SessionEvent::Error { .. },
            SessionEvent::Status {
                status: SessionStatus::Idle
            },
        ]
    ));
    assert_eq!(status_of(&registry, &session.id).await, SessionStatus::Idle);
}

#[tokio::test]
async fn test_stream_ending_without_completion_is_an_error() {
    let adapter = ScriptedAdapter::new();
    adapter.push(vec![text("cut off")]);
    let (registry, _store) = registry(&adapter);
    let session = registry.create_session("S1", None).await.unwrap();

    let events: Vec<_> = registry
        .send_message(&session.id, "hi")
        .await
        .unwrap()
        .collect()
        .await;
    assert!(
        events
            .iter()
            .any(|e| matches!(e, SessionEvent::Error { .. }))
    );
    assert!(
        registry
            .get_session(&session.id)
            .await
            .unwrap()
            .session
            .resume_token
            .is_none()
    );
}

#[tokio::test]
async fn test_approval_moves_through_waiting_state() {
    let adapter = ScriptedAdapter::new();
    let feed = adapter.push_live();
    let (registry, _store) = registry(&adapter);
    let session = registry.create_session("S1", None).await.unwrap();
    let mut stream = registry.send_message(&session.id, "rm it").await.unwrap();

    adapter.0.pending.lock().unwrap().insert("tu_9".into());
    feed.send(Ok(AdapterEvent::ApprovalRequested {
        tool_use_id: "tu_9".into(),
        tool_name: "Bash".into(),
        tool_input: json!({"command": "rm a"}),
    }))
    .unwrap();

    // status(running), user_message, tool_approval_request, status(waiting_approval)
    let mut seen = Vec::new();
    for _ in 0..4 {
        seen.push(stream.next().await.unwrap());
    }
    assert_eq!(seen[3], status(SessionStatus::WaitingApproval));
    assert_eq!(
        status_of(&registry, &session.id).await,
        SessionStatus::WaitingApproval
    );
    assert!(matches!(
        registry.send_message(&session.id, "again").await,
        Err(RegistryError::Conflict(_))
    ));

    assert!(assert_ok!(registry.approve_tool(&session.id, "tu_9").await));
    assert!(!assert_ok!(registry.approve_tool(&session.id, "tu_9").await));

    feed.send(Ok(AdapterEvent::ApprovalResolved {
        tool_use_id: "tu_9".into(),
        approved: true,
    }))
    .unwrap();
    feed.send(completed("c-1")).unwrap();
    let rest: Vec<_> = stream.collect().await;
    assert_eq!(rest[0], status(SessionStatus::Running));
    assert_eq!(rest.last(), Some(&status(SessionStatus::Idle)));

    let kinds: Vec<_> = registry
        .get_session(&session.id)
        .await
        .unwrap()
        .messages
        .iter()
        .map(|m| m.body.kind())
        .collect();
    assert_eq!(kinds, ["text", "tool_approval_request", "result"]);
}

#[tokio::test]
async fn test_approve_unknown_tool_is_a_noop() {
    let adapter = ScriptedAdapter::new();
    adapter.push(vec![completed("c-1")]);
    let (registry, _store) = registry(&adapter);
    let session = registry.create_session("S1", None).await.unwrap();

    // Before any handle exists.
    assert!(!assert_ok!(registry.approve_tool(&session.id, "unknown-id").await));

    let _: Vec<_> = registry
        .send_message(&session.id, "hi")
        .await
        .unwrap()
        .collect()
        .await;
    let before = registry.get_session(&session.id).await.unwrap();

    assert!(!assert_ok!(registry.approve_tool(&session.id, "unknown-id").await));
    assert!(
        !assert_ok!(
            registry
                .deny_tool(&session.id, "unknown-id", Some("no".into()))
                .await
        )
    );
    assert_eq!(registry.get_session(&session.id).await.unwrap(), before);

    assert!(matches!(
        registry.approve_tool("missing", "tu_1").await,
        Err(RegistryError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_delete_closes_handle_before_removal() {
    let adapter = ScriptedAdapter::with_gated_close();
    let feed = adapter.push_live();
    let (registry, store) = registry(&adapter);
    let session = registry.create_session("S1", None).await.unwrap();
    let mut stream = registry.send_message(&session.id, "long job").await.unwrap();
    feed.send(text("started")).unwrap();

    // Wait until the handle is open and the turn is streaming.
    while !matches!(
        stream.next().await,
        Some(SessionEvent::AssistantText { .. })
    ) {}

    let deleting = {
        let registry = Arc::clone(&registry);
        let id = session.id.clone();
        tokio::spawn(async move { registry.delete_session(&id).await })
    };

    adapter.0.close_started.notified().await;
    // Close is in progress; the session is still listed.
    assert_eq!(registry.list_sessions().await.len(), 1);

    if let Some(release) = &adapter.0.close_release {
        release.notify_one();
    }
    assert_ok!(deleting.await.unwrap());

    assert_eq!(adapter.0.closes.load(Ordering::SeqCst), 1);
    assert!(registry.list_sessions().await.is_empty());
    assert!(store.load_sessions().await.unwrap().is_empty());
    assert!(matches!(
        registry.get_session(&session.id).await,
        Err(RegistryError::NotFound(_))
    ));

    // The abandoned turn does not resurrect the session.
    drop(feed);
    let _: Vec<_> = stream.collect().await;
    assert!(registry.list_sessions().await.is_empty());
}

#[tokio::test]
async fn test_delete_unknown_session() {
    let adapter = ScriptedAdapter::new();
    let (registry, _store) = registry(&adapter);
    let session = registry.create_session("S1", None).await.unwrap();

    let err = assert_err!(registry.delete_session("nope").await);
    assert!(matches!(err, RegistryError::NotFound(ref id) if id == "nope"));
    assert_eq!(registry.list_sessions().await[0].session.id, session.id);
    assert_eq!(adapter.0.closes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_delete_without_handle_skips_close() {
    let adapter = ScriptedAdapter::new();
    let (registry, _store) = registry(&adapter);
    let session = registry.create_session("S1", None).await.unwrap();

    assert_ok!(registry.delete_session(&session.id).await);
    assert_eq!(adapter.0.closes.load(Ordering::SeqCst), 0);
    assert!(matches!(
        registry.delete_session(&session.id).await,
        Err(RegistryError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_unknown_session_operations() {
    let adapter = ScriptedAdapter::new();
    let (registry, _store) = registry(&adapter);
    let (sink, _rx) = mpsc::unbounded_channel();

    assert!(matches!(
        registry.send_message("nope", "hi").await,
        Err(RegistryError::NotFound(_))
    ));
    assert!(matches!(
        registry.get_session("nope").await,
        Err(RegistryError::NotFound(_))
    ));
    assert!(matches!(
        registry.subscribe("nope", sink).await,
        Err(RegistryError::NotFound(_))
    ));
    assert!(matches!(
        registry.rename_session("nope", "x").await,
        Err(RegistryError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_dropped_subscriber_does_not_affect_turn() {
    let adapter = ScriptedAdapter::new();
    adapter.push(vec![text("a"), text("b"), completed("c-1")]);
    let (registry, _store) = registry(&adapter);
    let session = registry.create_session("S1", None).await.unwrap();

    let (gone, gone_rx) = mpsc::unbounded_channel();
    let (live, mut live_rx) = mpsc::unbounded_channel();
    registry.subscribe(&session.id, gone).await.unwrap();
    let live_id = registry.subscribe(&session.id, live).await.unwrap();
    drop(gone_rx);

    let events: Vec<_> = registry
        .send_message(&session.id, "hi")
        .await
        .unwrap()
        .collect()
        .await;
    let mut received = 0;
    while live_rx.try_recv().is_ok() {
        received += 1;
    }
    assert_eq!(received, events.len());

    assert!(assert_ok!(registry.unsubscribe(&session.id, live_id).await));
    assert!(!assert_ok!(registry.unsubscribe(&session.id, live_id).await));
}

#[tokio::test]
async fn test_dropping_turn_stream_does_not_abandon_turn() {
    let adapter = ScriptedAdapter::new();
    let feed = adapter.push_live();
    let (registry, store) = registry(&adapter);
    let session = registry.create_session("S1", None).await.unwrap();

    let (sink, mut subscriber) = mpsc::unbounded_channel();
    registry.subscribe(&session.id, sink).await.unwrap();
    drop(registry.send_message(&session.id, "hi").await.unwrap());

    feed.send(text("still here")).unwrap();
    feed.send(completed("c-1")).unwrap();
    loop {
        let frame = subscriber.recv().await.unwrap();
        if frame.event == status(SessionStatus::Idle) {
            break;
        }
    }
    assert_eq!(store.load_messages(&session.id).await.unwrap().len(), 3);
    assert_eq!(status_of(&registry, &session.id).await, SessionStatus::Idle);
}

#[tokio::test]
async fn test_rename_import_and_restore() {
    let adapter = ScriptedAdapter::new();
    let (registry, store) = registry(&adapter);

    let first = registry.create_session("first", None).await.unwrap();
    let renamed = assert_ok!(registry.rename_session(&first.id, "renamed").await);
    assert_eq!(renamed.session.name, "renamed");

    let imported = assert_ok!(
        registry
            .import_session(
                "imported",
                Some(PathBuf::from("/srv/project")),
                Some("c-local".into()),
                vec![
                    Message::user_text("earlier question"),
                    Message::new(MessageRole::Assistant, MessageBody::Text {
                        content: "earlier answer".into()
                    }),
                ],
            )
            .await
    );
    assert_eq!(imported.resume_token.as_deref(), Some("c-local"));

    let listed = registry.list_sessions().await;
    assert_eq!(
        listed
            .iter()
            .map(|s| (s.session.name.as_str(), s.message_count))
            .collect::<Vec<_>>(),
        [("renamed", 0), ("imported", 2)]
    );

    let restarted = SessionRegistry::new(
        Arc::clone(&store) as Arc<dyn TranscriptStore>,
        Arc::new(adapter.clone()),
        PathBuf::from("/tmp"),
    );
    assert_eq!(assert_ok!(restarted.restore().await), 2);
    let restored = restarted.list_sessions().await;
    assert_eq!(restored, listed);
    assert!(
        restored
            .iter()
            .all(|s| s.session.status == SessionStatus::Idle)
    );

    // An imported session resumes the local conversation on its first turn.
    adapter.push(vec![completed("c-next")]);
    let _: Vec<_> = restarted
        .send_message(&imported.id, "continue")
        .await
        .unwrap()
        .collect()
        .await;
    assert_eq!(
        adapter.0.interactions()[0].1.as_deref(),
        Some("c-local")
    );
    assert_eq!(
        restarted.get_session(&imported.id).await.unwrap().messages[2],
        Message::user_text("continue")
    );
}

#[tokio::test]
async fn test_close_all_closes_live_handles_only() {
    let adapter = ScriptedAdapter::new();
    adapter.push(vec![completed("c-1")]);
    let (registry, _store) = registry(&adapter);
    let active = registry.create_session("active", None).await.unwrap();
    registry.create_session("never used", None).await.unwrap();

    let _: Vec<_> = registry
        .send_message(&active.id, "hi")
        .await
        .unwrap()
        .collect()
        .await;

    assert_eq!(registry.close_all().await, 1);
    assert_eq!(adapter.0.closes.load(Ordering::SeqCst), 1);
    assert_eq!(registry.close_all().await, 0);
    assert_eq!(registry.list_sessions().await.len(), 2);

    // The next turn reopens.
    adapter.push(vec![completed("c-2")]);
    let _: Vec<_> = registry
        .send_message(&active.id, "again")
        .await
        .unwrap()
        .collect()
        .await;
    assert_eq!(adapter.0.opens.load(Ordering::SeqCst), 2);
    assert_eq!(adapter.0.interactions()[1].1.as_deref(), Some("c-1"));
}

#[tokio::test]
async fn test_user_message_persistence_failure_skips_adapter() {
    let adapter = ScriptedAdapter::new();
    adapter.push(vec![text("unused"), completed("c-1")]);
    let (registry, store) = flaky_registry(&adapter);
    let session = registry.create_session("S1", None).await.unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    registry.subscribe(&session.id, tx).await.unwrap();

    store.fail_appends.store(true, Ordering::SeqCst);
    let result = registry.send_message(&session.id, "hello").await;
    assert!(matches!(result, Err(RegistryError::Persistence(_))));

    assert_eq!(adapter.0.opens.load(Ordering::SeqCst), 0);
    assert!(adapter.0.interactions().is_empty());
    assert_eq!(status_of(&registry, &session.id).await, SessionStatus::Idle);
    assert_eq!(registry.list_sessions().await[0].message_count, 0);

    // Subscribers saw the attempt start and end, and nothing else.
    assert_eq!(rx.recv().await.unwrap().event, status(SessionStatus::Running));
    assert_eq!(rx.recv().await.unwrap().event, status(SessionStatus::Idle));
    assert!(rx.try_recv().is_err());

    // The session is usable once the store recovers.
    store.fail_appends.store(false, Ordering::SeqCst);
    let events: Vec<_> = registry
        .send_message(&session.id, "hello")
        .await
        .unwrap()
        .collect()
        .await;
    assert_eq!(events.last(), Some(&status(SessionStatus::Idle)));
    assert_eq!(adapter.0.interactions(), [("hello".to_string(), None)]);
}

#[tokio::test]
async fn test_resume_token_kept_when_persisting_it_fails() {
    let adapter = ScriptedAdapter::new();
    adapter.push(vec![text("one"), completed("c-1")]);
    adapter.push(vec![text("two"), completed("c-2")]);
    let (registry, store) = flaky_registry(&adapter);
    let session = registry.create_session("S1", None).await.unwrap();

    store.fail_tokens.store(true, Ordering::SeqCst);
    let first: Vec<_> = registry
        .send_message(&session.id, "one")
        .await
        .unwrap()
        .collect()
        .await;
    assert!(first.iter().any(|e| matches!(
        e,
        SessionEvent::Result { claude_session_id: Some(token), .. } if token == "c-1"
    )));
    assert!(store.load_sessions().await.unwrap()[0].resume_token.is_none());

    store.fail_tokens.store(false, Ordering::SeqCst);
    let _: Vec<_> = registry
        .send_message(&session.id, "two")
        .await
        .unwrap()
        .collect()
        .await;

    assert_eq!(adapter.0.interactions(), [
        ("one".to_string(), None),
        ("two".to_string(), Some("c-1".to_string())),
    ]);
    assert_eq!(
        store.load_sessions().await.unwrap()[0].resume_token.as_deref(),
        Some("c-2")
    );
}

#[tokio::test]
async fn test_status_waits_until_every_approval_is_resolved() {
    let adapter = ScriptedAdapter::new();
    let feed = adapter.push_live();
    let (registry, _store) = registry(&adapter);
    let session = registry.create_session("S1", None).await.unwrap();
    let mut stream = registry.send_message(&session.id, "two tools").await.unwrap();

    for tool_use_id in ["tu_1", "tu_2"] {
        feed.send(Ok(AdapterEvent::ApprovalRequested {
            tool_use_id: tool_use_id.into(),
            tool_name: "Bash".into(),
            tool_input: json!({}),
        }))
        .unwrap();
    }
    // status(running), user_message, then request + waiting twice
    for _ in 0..6 {
        stream.next().await.unwrap();
    }

    feed.send(Ok(AdapterEvent::ApprovalResolved {
        tool_use_id: "tu_1".into(),
        approved: true,
    }))
    .unwrap();
    feed.send(text("working on tu_1")).unwrap();
    assert_eq!(stream.next().await.unwrap(), SessionEvent::AssistantText {
        content: "working on tu_1".into()
    });
    assert_eq!(
        status_of(&registry, &session.id).await,
        SessionStatus::WaitingApproval
    );

    feed.send(Ok(AdapterEvent::ApprovalResolved {
        tool_use_id: "tu_2".into(),
        approved: false,
    }))
    .unwrap();
    assert_eq!(stream.next().await.unwrap(), status(SessionStatus::Running));
    assert_eq!(status_of(&registry, &session.id).await, SessionStatus::Running);

    feed.send(completed("c-1")).unwrap();
    let rest: Vec<_> = stream.collect().await;
    assert_eq!(rest.last(), Some(&status(SessionStatus::Idle)));
}

#[tokio::test]
async fn test_watchers_see_every_session() {
    let adapter = ScriptedAdapter::new();
    adapter.push(vec![text("a"), completed("c-a")]);
    adapter.push(vec![text("b"), completed("c-b")]);
    let (registry, _store) = registry(&adapter);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let watcher = registry.watch(tx);

    // Created after the watcher registered.
    let a = registry.create_session("A", None).await.unwrap();
    let b = registry.create_session("B", None).await.unwrap();
    for id in [&a.id, &b.id] {
        let _: Vec<_> = registry
            .send_message(id, "go")
            .await
            .unwrap()
            .collect()
            .await;
    }

    let mut frames = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        frames.push(frame);
    }
    let ids: HashSet<_> = frames.iter().map(|f| f.session_id.clone()).collect();
    assert_eq!(ids, HashSet::from([a.id.clone(), b.id.clone()]));
    assert_eq!(frames.last().unwrap().event, status(SessionStatus::Idle));

    assert!(registry.unwatch(watcher));
    adapter.push(vec![completed("c-a2")]);
    let _: Vec<_> = registry
        .send_message(&a.id, "quiet")
        .await
        .unwrap()
        .collect()
        .await;
    assert!(rx.try_recv().is_err());
}
