//! Topic-based event bus (topics: `run:<run_id>`, `session:<session_key>`).
//!
//! Each topic is an independent broadcast channel created lazily on first
//! `subscribe` and torn down once its last subscriber drops. Publishing to a
//! topic with zero subscribers is a no-op — events are not buffered for
//! late joiners.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;

use aw_domain::run::EngineEvent;
use aw_domain::session::ResumeToken;

/// One event delivered on a topic. Carries the originating run so a
/// subscriber on a `session:*` topic (which can see events from more than
/// one run) can tell them apart.
#[derive(Debug, Clone)]
pub struct BusEvent {
    pub run_id: uuid::Uuid,
    pub tag: &'static str,
    pub engine_event: Option<EngineEvent>,
    /// Resume token the completed run left behind, if any. Carried here
    /// (rather than looked up separately) so `OutputTracker` can append it
    /// to the final edit without a second round-trip to the store.
    pub resume: Option<ResumeToken>,
}

impl BusEvent {
    pub fn run_started(run_id: uuid::Uuid) -> Self {
        Self { run_id, tag: "run_started", engine_event: None, resume: None }
    }

    pub fn run_completed(run_id: uuid::Uuid, resume: Option<ResumeToken>) -> Self {
        Self { run_id, tag: "run_completed", engine_event: None, resume }
    }

    /// Sent once the idle watchdog elapses with zero engine activity. A
    /// channel adapter capable of interactive cancel should render this as
    /// a "Keep Waiting" / "Stop Run" prompt; channels that can't just drop
    /// it. Either way the run itself resolves the outcome once the confirm
    /// window in the lifecycle config elapses or activity resumes.
    pub fn idle_keepalive_prompt(run_id: uuid::Uuid) -> Self {
        Self { run_id, tag: "idle_keepalive_prompt", engine_event: None, resume: None }
    }

    pub fn engine(run_id: uuid::Uuid, tag: &'static str, event: EngineEvent) -> Self {
        Self { run_id, tag, engine_event: Some(event), resume: None }
    }
}

const TOPIC_CAPACITY: usize = 256;

#[derive(Default)]
pub struct Bus {
    topics: Mutex<HashMap<String, broadcast::Sender<BusEvent>>>,
}

impl Bus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn run_topic(run_id: uuid::Uuid) -> String {
        format!("run:{run_id}")
    }

    pub fn session_topic(session_key: &str) -> String {
        format!("session:{session_key}")
    }

    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusEvent> {
        let mut topics = self.topics.lock();
        topics
            .entry(topic.to_owned())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .subscribe()
    }

    /// Publish to `topic`. A no-op if nobody has ever subscribed (the
    /// channel doesn't exist) or if every subscriber has since dropped (send
    /// returns a benign `SendError` we discard).
    pub fn publish(&self, topic: &str, event: BusEvent) {
        let sender = {
            let topics = self.topics.lock();
            topics.get(topic).cloned()
        };
        if let Some(sender) = sender {
            let _ = sender.send(event);
        }
    }

    /// Drop the topic entirely, e.g. once a run has terminated and nobody
    /// should be able to subscribe to stale history.
    pub fn unsubscribe_all(&self, topic: &str) {
        self.topics.lock().remove(topic);
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .get(topic)
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_with_no_subscribers_is_a_no_op() {
        let bus = Bus::new();
        // Should not panic even though nobody ever subscribed.
        bus.publish("run:nonexistent", BusEvent::run_started(uuid::Uuid::new_v4()));
    }

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = Bus::new();
        let run_id = uuid::Uuid::new_v4();
        let topic = Bus::run_topic(run_id);
        let mut rx = bus.subscribe(&topic);

        bus.publish(&topic, BusEvent::run_started(run_id));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.tag, "run_started");
        assert_eq!(event.run_id, run_id);
    }

    #[tokio::test]
    async fn session_topic_fans_out_to_all_subscribers() {
        let bus = Bus::new();
        let topic = Bus::session_topic("agent:a:main");
        let mut rx1 = bus.subscribe(&topic);
        let mut rx2 = bus.subscribe(&topic);

        bus.publish(&topic, BusEvent::run_completed(uuid::Uuid::new_v4(), None));

        assert_eq!(rx1.recv().await.unwrap().tag, "run_completed");
        assert_eq!(rx2.recv().await.unwrap().tag, "run_completed");
    }

    #[test]
    fn unsubscribe_all_removes_the_topic() {
        let bus = Bus::new();
        let topic = "run:x".to_string();
        let _rx = bus.subscribe(&topic);
        assert_eq!(bus.subscriber_count(&topic), 1);
        bus.unsubscribe_all(&topic);
        assert_eq!(bus.subscriber_count(&topic), 0);
    }
}
