//! Reference `Engine` implementation. Answers with its prompt echoed back,
//! after emitting one synthetic tool action, so the rest of the gateway
//! fabric (coalescers, Bus, Run) can be exercised without a real backend.

use crate::traits::{CancelHandle, Engine, EventSink, FlagCancelHandle, SteerOutcome, StartedRun};
use async_trait::async_trait;
use aw_domain::error::Result;
use aw_domain::job::Job;
use aw_domain::run::{Action, ActionKind, ActionPhase, EngineEvent, Usage};
use aw_domain::session::ResumeToken;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

pub struct EchoEngine {
    id: String,
}

impl EchoEngine {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

#[async_trait]
impl Engine for EchoEngine {
    fn id(&self) -> &str {
        &self.id
    }

    async fn start(&self, job: Job, sink: EventSink) -> Result<StartedRun> {
        let cancel: Arc<dyn CancelHandle> = Arc::new(FlagCancelHandle::default());
        let cancel_task = cancel.clone();
        let engine_id = self.id.clone();
        let prompt = job.prompt.clone();
        let resume = job.resume.clone().or_else(|| {
            Some(ResumeToken {
                engine_id: engine_id.clone(),
                value: job.run_id.to_string(),
            })
        });

        tokio::spawn(async move {
            let _ = sink.send(EngineEvent::Started {
                engine: engine_id.clone(),
                resume: resume.clone(),
                title: Some("echo".to_string()),
            });

            let mut action = Action {
                id: "echo-1".to_string(),
                kind: ActionKind::Tool,
                title: "echo".to_string(),
                result: None,
            };
            let _ = sink.send(EngineEvent::ActionEvent {
                action: action.clone(),
                phase: ActionPhase::Started,
                ok: None,
            });
            action.result = Some(format!("echoed {} chars", prompt.len()));

            if cancel_task.is_cancelled() {
                let _ = sink.send(EngineEvent::Completed {
                    ok: false,
                    answer: None,
                    error: Some("cancelled".to_string()),
                    resume: resume.clone(),
                    usage: None,
                });
                return;
            }

            sleep(Duration::from_millis(10)).await;

            let _ = sink.send(EngineEvent::ActionEvent {
                action,
                phase: ActionPhase::Completed,
                ok: Some(true),
            });

            let mut seq = 0u64;
            for chunk in prompt.split_inclusive(' ') {
                if cancel_task.is_cancelled() {
                    break;
                }
                let _ = sink.send(EngineEvent::Delta {
                    seq,
                    text: chunk.to_string(),
                });
                seq += 1;
            }

            let usage = Usage {
                input_tokens: prompt.len() as u64,
                output_tokens: prompt.len() as u64,
                total_tokens: prompt.len() as u64 * 2,
                context_window: Some(128_000),
            };

            let _ = sink.send(EngineEvent::Completed {
                ok: !cancel_task.is_cancelled(),
                answer: Some(prompt),
                error: if cancel_task.is_cancelled() {
                    Some("cancelled".to_string())
                } else {
                    None
                },
                resume,
                usage: Some(usage),
            });
        });

        Ok(StartedRun { cancel })
    }

    fn supports_steer(&self) -> bool {
        true
    }

    async fn steer(&self, _cancel: &dyn CancelHandle, _text: &str) -> Result<SteerOutcome> {
        Ok(SteerOutcome::Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn start_emits_started_then_completed() {
        let engine = EchoEngine::new("lemon");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let job = Job::new("s1", "default", "hi there", "telegram");
        engine.start(job, tx).await.unwrap();

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, EngineEvent::Started { .. }));

        let mut saw_completed = false;
        while let Some(ev) = rx.recv().await {
            if matches!(ev, EngineEvent::Completed { .. }) {
                saw_completed = true;
                break;
            }
        }
        assert!(saw_completed);
    }

    #[tokio::test]
    async fn cancelling_before_start_short_circuits_to_failed_completed() {
        let engine = EchoEngine::new("lemon");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let job = Job::new("s1", "default", "hello world", "telegram");
        let started = engine.start(job, tx).await.unwrap();
        started.cancel.cancel("test");

        let mut saw_failed_completed = false;
        while let Some(ev) = rx.recv().await {
            if let EngineEvent::Completed { ok, .. } = ev {
                saw_failed_completed = !ok;
                break;
            }
        }
        assert!(saw_failed_completed);
    }
}
