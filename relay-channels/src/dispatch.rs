//! Per-thread message dispatch.
//!
//! Every thread gets its own worker task with a private queue. Messages for the
//! same thread are handled one at a time in the order they were dispatched;
//! messages for different threads are handled concurrently. A worker exits as
//! soon as its queue is empty, so idle threads cost nothing.

use crate::message::{ChannelMessage, ThreadKey};
use crate::traits::MessageHandler;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Handle to a live thread worker.
struct Worker {
    id: u64,
    tx: mpsc::UnboundedSender<ChannelMessage>,
}

/// Fans inbound messages out to one sequential worker per thread.
pub struct ThreadDispatcher<H: MessageHandler> {
    handler: Arc<H>,
    workers: Arc<DashMap<ThreadKey, Worker>>,
    next_id: AtomicU64,
}

impl<H: MessageHandler> ThreadDispatcher<H> {
    /// Create a dispatcher delivering to `handler`.
    pub fn new(handler: Arc<H>) -> Self {
        Self {
            handler,
            workers: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Number of threads with a live worker.
    pub fn active_threads(&self) -> usize {
        self.workers.len()
    }

    /// Queue a message on its thread's worker, starting one if needed.
    ///
    /// Sends happen while the map entry is held, so a worker retiring itself
    /// can never miss a message queued for it.
    pub fn dispatch(&self, message: ChannelMessage) {
        let key = message.thread_key();
        let mut worker = self
            .workers
            .entry(key.clone())
            .or_insert_with(|| self.spawn_worker(key.clone()));

        if let Err(mpsc::error::SendError(message)) = worker.tx.send(message) {
            tracing::warn!(thread_key = %key, "Thread worker gone, restarting");
            *worker = self.spawn_worker(key.clone());
            if worker.tx.send(message).is_err() {
                tracing::error!(thread_key = %key, "Failed to queue message on new worker");
            }
        }
    }

    fn spawn_worker(&self, key: ThreadKey) -> Worker {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_worker(
            self.handler.clone(),
            self.workers.clone(),
            key,
            id,
            rx,
        ));
        Worker { id, tx }
    }

    /// Start the loop that consumes a channel's inbound messages.
    pub fn spawn_processor(
        dispatcher: Arc<Self>,
        mut rx: mpsc::Receiver<ChannelMessage>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!("Thread dispatcher started");

            while let Some(message) = rx.recv().await {
                dispatcher.dispatch(message);
            }

            tracing::info!("Thread dispatcher stopped");
        })
    }
}

async fn run_worker<H: MessageHandler>(
    handler: Arc<H>,
    workers: Arc<DashMap<ThreadKey, Worker>>,
    key: ThreadKey,
    id: u64,
    mut rx: mpsc::UnboundedReceiver<ChannelMessage>,
) {
    tracing::debug!(thread_key = %key, "Thread worker started");

    loop {
        while let Ok(message) = rx.try_recv() {
            let handler = handler.clone();
            // A panicking handler must not take the rest of the queue with it.
            let task = tokio::spawn(async move { handler.handle(message).await });
            if let Err(e) = task.await {
                tracing::error!(thread_key = %key, error = %e, "Message handler panicked");
            }
        }

        let retired = workers
            .remove_if(&key, |_, worker| worker.id == id && rx.is_empty())
            .is_some();
        if retired || rx.is_empty() {
            // Either we removed ourselves, or a newer worker owns the key and
            // nothing more can reach this queue.
            break;
        }
    }

    tracing::debug!(thread_key = %key, "Thread worker finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ChannelType, MessageKind};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Duration;

    fn msg(channel: &str, root: &str, text: &str) -> ChannelMessage {
        ChannelMessage {
            id: format!("{root}-{text}"),
            channel_type: ChannelType::Cli,
            channel_id: channel.into(),
            thread_id: Some(root.into()),
            user_id: "U1".into(),
            text: text.into(),
            kind: MessageKind::Local,
            timestamp: 0,
            trace_id: String::new(),
        }
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(String, String)>>,
        in_flight: Mutex<std::collections::HashMap<String, usize>>,
        max_in_flight: AtomicUsize,
    }

    #[async_trait]
    impl MessageHandler for Recorder {
        async fn handle(&self, message: ChannelMessage) {
            let key = message.thread_key().to_string();
            {
                let mut in_flight = self.in_flight.lock().unwrap();
                let n = in_flight.entry(key.clone()).or_default();
                *n += 1;
                self.max_in_flight.fetch_max(*n, Ordering::SeqCst);
            }

            // Earlier messages sleep longer, so reordering would show up.
            let delay = 20u64.saturating_sub(message.text.parse::<u64>().unwrap_or(0));
            tokio::time::sleep(Duration::from_millis(delay)).await;

            if message.text == "boom" {
                self.in_flight.lock().unwrap().insert(key.clone(), 0);
                panic!("handler exploded");
            }

            self.seen.lock().unwrap().push((key.clone(), message.text));
            *self.in_flight.lock().unwrap().get_mut(&key).unwrap() -= 1;
        }
    }

    async fn wait_idle<H: MessageHandler>(dispatcher: &ThreadDispatcher<H>) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while dispatcher.active_threads() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("dispatcher did not go idle");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_same_thread_in_arrival_order() {
        let recorder = Arc::new(Recorder::default());
        let dispatcher = ThreadDispatcher::new(recorder.clone());

        for i in 0..10 {
            dispatcher.dispatch(msg("C1", "100.1", &i.to_string()));
        }
        wait_idle(&dispatcher).await;

        let seen: Vec<String> = recorder
            .seen
            .lock()
            .unwrap()
            .iter()
            .map(|(_, text)| text.clone())
            .collect();
        let expected: Vec<String> = (0..10).map(|i| i.to_string()).collect();
        assert_eq!(seen, expected);
        assert_eq!(recorder.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_threads_interleave_but_stay_ordered() {
        let recorder = Arc::new(Recorder::default());
        let dispatcher = ThreadDispatcher::new(recorder.clone());

        for i in 0..5 {
            dispatcher.dispatch(msg("C1", "A", &i.to_string()));
            dispatcher.dispatch(msg("C1", "B", &i.to_string()));
            dispatcher.dispatch(msg("C2", "A", &i.to_string()));
        }
        wait_idle(&dispatcher).await;

        let seen = recorder.seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 15);
        for key in ["C1:A", "C1:B", "C2:A"] {
            let texts: Vec<&str> = seen
                .iter()
                .filter(|(k, _)| k == key)
                .map(|(_, t)| t.as_str())
                .collect();
            assert_eq!(texts, vec!["0", "1", "2", "3", "4"], "order broken for {key}");
        }
    }

    struct Rendezvous(tokio::sync::Barrier);

    #[async_trait]
    impl MessageHandler for Rendezvous {
        async fn handle(&self, _message: ChannelMessage) {
            self.0.wait().await;
        }
    }

    #[tokio::test]
    async fn test_different_threads_run_concurrently() {
        let dispatcher = ThreadDispatcher::new(Arc::new(Rendezvous(tokio::sync::Barrier::new(2))));

        // Each handler blocks until the other arrives; serial handling would hang.
        dispatcher.dispatch(msg("C1", "A", "x"));
        dispatcher.dispatch(msg("C1", "B", "y"));
        wait_idle(&dispatcher).await;
    }

    #[tokio::test]
    async fn test_workers_exit_when_idle() {
        let recorder = Arc::new(Recorder::default());
        let dispatcher = ThreadDispatcher::new(recorder.clone());

        dispatcher.dispatch(msg("C1", "A", "0"));
        dispatcher.dispatch(msg("C1", "B", "0"));
        assert_eq!(dispatcher.active_threads(), 2);

        wait_idle(&dispatcher).await;
        assert_eq!(recorder.seen.lock().unwrap().len(), 2);

        // A later message for the same thread starts a fresh worker.
        dispatcher.dispatch(msg("C1", "A", "1"));
        wait_idle(&dispatcher).await;
        assert_eq!(recorder.seen.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_panicking_handler_does_not_drop_queue() {
        let recorder = Arc::new(Recorder::default());
        let dispatcher = ThreadDispatcher::new(recorder.clone());

        dispatcher.dispatch(msg("C1", "A", "boom"));
        dispatcher.dispatch(msg("C1", "A", "1"));
        wait_idle(&dispatcher).await;

        let seen = recorder.seen.lock().unwrap().clone();
        assert_eq!(seen, vec![("C1:A".to_string(), "1".to_string())]);
    }

    #[tokio::test]
    async fn test_processor_drains_channel() {
        let recorder = Arc::new(Recorder::default());
        let dispatcher = Arc::new(ThreadDispatcher::new(recorder.clone()));
        let (tx, rx) = mpsc::channel(8);

        let processor = ThreadDispatcher::spawn_processor(dispatcher.clone(), rx);
        tx.send(msg("C1", "A", "0")).await.unwrap();
        tx.send(msg("C1", "A", "1")).await.unwrap();
        drop(tx);

        processor.await.unwrap();
        wait_idle(&dispatcher).await;
        assert_eq!(recorder.seen.lock().unwrap().len(), 2);
    }
}
