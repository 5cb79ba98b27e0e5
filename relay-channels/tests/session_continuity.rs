//! End-to-end tests: inbound messages flow through the dispatcher and router,
//! the assistant is faked, and sessions persist to a real file.

use async_trait::async_trait;
use relay_channels::{
    Assistant, AssistantReply, Channel, ChannelMessage, ChannelResult, ChannelType,
    InvokeError, InvokeRequest, JsonFileBackend, MessageKind, OutgoingMessage, Router,
    SessionRecord, SessionStore, ThreadDispatcher, ThreadKey,
};
use relay_common::config::CorruptStatePolicy;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_test::assert_ok;

/// Assistant that hands out a fresh session id on every successful call.
#[derive(Default)]
struct FakeAssistant {
    issued: AtomicUsize,
    time_out: AtomicBool,
    requests: Mutex<Vec<InvokeRequest>>,
    issued_for: Mutex<HashMap<String, String>>,
}

impl FakeAssistant {
    fn requests(&self) -> Vec<InvokeRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Assistant for FakeAssistant {
    async fn invoke(&self, request: InvokeRequest) -> Result<AssistantReply, InvokeError> {
        let prompt = request.prompt.clone();
        self.requests.lock().unwrap().push(request);
        tokio::time::sleep(Duration::from_millis(5)).await;

        if self.time_out.load(Ordering::SeqCst) {
            return Err(InvokeError::Timeout(Duration::from_secs(600)));
        }

        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        let session_id = format!("sess-{n}");
        self.issued_for
            .lock()
            .unwrap()
            .insert(prompt.clone(), session_id.clone());
        Ok(AssistantReply {
            text: format!("echo: {prompt}"),
            session_id,
        })
    }
}

#[derive(Default)]
struct RecordingChannel {
    sent: Mutex<Vec<OutgoingMessage>>,
}

impl RecordingChannel {
    fn sent(&self) -> Vec<OutgoingMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Channel for RecordingChannel {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn send(&self, message: OutgoingMessage) -> ChannelResult<String> {
        self.sent.lock().unwrap().push(message);
        Ok("ts".into())
    }

    async fn listen(&self, _tx: mpsc::Sender<ChannelMessage>) -> ChannelResult<()> {
        Ok(())
    }

    async fn health_check(&self) -> ChannelResult<()> {
        Ok(())
    }
}

struct Relay {
    store: Arc<SessionStore>,
    assistant: Arc<FakeAssistant>,
    channel: Arc<RecordingChannel>,
    dispatcher: Arc<ThreadDispatcher<Router>>,
}

impl Relay {
    fn open(path: &Path) -> Self {
        let backend = JsonFileBackend::open(path).unwrap();
        let store = match SessionStore::load(Arc::new(backend), CorruptStatePolicy::Refuse) {
            Ok(store) => Arc::new(store),
            Err(e) => panic!("failed to load store: {e}"),
        };
        let assistant = Arc::new(FakeAssistant::default());
        let channel = Arc::new(RecordingChannel::default());
        let router = Router::new(
            store.clone(),
            assistant.clone(),
            channel.clone(),
            PathBuf::from("/srv/project"),
        );
        let dispatcher = Arc::new(ThreadDispatcher::new(Arc::new(router)));
        Self {
            store,
            assistant,
            channel,
            dispatcher,
        }
    }

    /// Feed messages through the processor loop and wait until all are handled.
    async fn deliver(&self, messages: Vec<ChannelMessage>) {
        let (tx, rx) = mpsc::channel(16);
        let processor = ThreadDispatcher::spawn_processor(self.dispatcher.clone(), rx);
        for message in messages {
            tx.send(message).await.unwrap();
        }
        drop(tx);
        assert_ok!(processor.await);

        tokio::time::timeout(Duration::from_secs(5), async {
            while self.dispatcher.active_threads() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("conversations did not finish");
    }
}

fn dm(ts: &str, thread_ts: Option<&str>, text: &str) -> ChannelMessage {
    ChannelMessage {
        id: ts.into(),
        channel_type: ChannelType::Slack,
        channel_id: "D1".into(),
        thread_id: thread_ts.map(String::from),
        user_id: "U1".into(),
        text: text.into(),
        kind: MessageKind::DirectMessage,
        timestamp: 0,
        trace_id: format!("trace-{ts}"),
    }
}

fn key(root: &str) -> ThreadKey {
    ThreadKey::new("D1", root)
}

#[tokio::test]
async fn new_message_starts_a_session() {
    let dir = TempDir::new().unwrap();
    let relay = Relay::open(&dir.path().join("sessions.json"));

    relay.deliver(vec![dm("100.1", None, "hello")]).await;

    let requests = relay.assistant.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].resume_session_id, None);
    assert_eq!(requests[0].working_dir, PathBuf::from("/srv/project"));

    assert_eq!(relay.store.len(), 1);
    assert_eq!(relay.store.get(&key("100.1")).unwrap().session_id, "sess-1");

    let sent = relay.channel.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].thread_id.as_deref(), Some("100.1"));
    assert_eq!(sent[0].text(), "echo: hello");
}

#[tokio::test]
async fn reply_resumes_stored_session_and_replaces_id() {
    let dir = TempDir::new().unwrap();
    let relay = Relay::open(&dir.path().join("sessions.json"));
    assert_ok!(
        relay
            .store
            .put(
                key("100.1"),
                SessionRecord::new("sess-42", Some(PathBuf::from("/srv/other")))
            )
            .await
    );

    relay.deliver(vec![dm("100.5", Some("100.1"), "and now?")]).await;

    let requests = relay.assistant.requests();
    assert_eq!(requests[0].resume_session_id.as_deref(), Some("sess-42"));
    assert_eq!(requests[0].working_dir, PathBuf::from("/srv/other"));

    let record = relay.store.get(&key("100.1")).unwrap();
    assert_eq!(record.session_id, "sess-1");
    assert_eq!(record.cwd, Some(PathBuf::from("/srv/other")));
}

#[tokio::test]
async fn timeout_leaves_previous_session_intact() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("sessions.json");
    let relay = Relay::open(&path);
    assert_ok!(
        relay
            .store
            .put(key("100.1"), SessionRecord::new("sess-42", None))
            .await
    );
    let before = std::fs::read(&path).unwrap();

    relay.assistant.time_out.store(true, Ordering::SeqCst);
    relay.deliver(vec![dm("100.5", Some("100.1"), "still there?")]).await;

    assert_eq!(relay.store.get(&key("100.1")).unwrap().session_id, "sess-42");
    assert_eq!(std::fs::read(&path).unwrap(), before);

    let sent = relay.channel.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].thread_id.as_deref(), Some("100.1"));
    assert!(sent[0].text().starts_with("Sorry, I encountered an error:"));

    // The next attempt resumes the untouched session.
    relay.assistant.time_out.store(false, Ordering::SeqCst);
    relay.deliver(vec![dm("100.6", Some("100.1"), "retry")]).await;
    let requests = relay.assistant.requests();
    assert_eq!(requests[1].resume_session_id.as_deref(), Some("sess-42"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rapid_replies_resume_in_arrival_order() {
    let dir = TempDir::new().unwrap();
    let relay = Relay::open(&dir.path().join("sessions.json"));

    let mut messages = vec![dm("100.1", None, "start")];
    for i in 2..=6 {
        messages.push(dm(&format!("100.{i}"), Some("100.1"), &format!("step {i}")));
    }
    // Interleave an unrelated thread.
    messages.insert(2, dm("200.1", None, "other"));
    relay.deliver(messages).await;

    let requests = relay.assistant.requests();
    assert_eq!(requests.len(), 7);

    // Each reply resumes exactly the session issued for the reply before it.
    let chain: Vec<&InvokeRequest> = requests
        .iter()
        .filter(|r| r.prompt != "other")
        .collect();
    assert_eq!(chain[0].resume_session_id, None);
    let issued_for = relay.assistant.issued_for.lock().unwrap().clone();
    for window in chain.windows(2) {
        assert_eq!(
            window[1].resume_session_id.as_ref(),
            issued_for.get(&window[0].prompt),
            "{:?} did not resume the session from {:?}",
            window[1].prompt,
            window[0].prompt
        );
    }
    let prompts: Vec<&str> = chain.iter().map(|r| r.prompt.as_str()).collect();
    assert_eq!(prompts, vec!["start", "step 2", "step 3", "step 4", "step 5", "step 6"]);

    assert_eq!(relay.store.len(), 2);
    assert_eq!(relay.channel.sent().len(), 7);
}

#[tokio::test]
async fn sessions_survive_restart() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("sessions.json");

    let expected = {
        let relay = Relay::open(&path);
        relay
            .deliver(vec![dm("100.1", None, "hi"), dm("300.1", None, "hey")])
            .await;
        relay.store.snapshot()
    };

    let relay = Relay::open(&path);
    assert_eq!(relay.store.snapshot(), expected);

    let stored = relay.store.get(&key("100.1")).unwrap().session_id;
    relay.deliver(vec![dm("100.2", Some("100.1"), "back again")]).await;
    assert_eq!(
        relay.assistant.requests()[0].resume_session_id.as_deref(),
        Some(stored.as_str())
    );
}
