//! Drives one run's Bus events into a [`ChannelAdapter`], coalescing both
//! the answer stream and the tool-status block on the way.
//!
//! Subscribe on the run's topic as soon as the run id is known — before any
//! further `.await` — so the subscription is in place before the worker's
//! own task gets scheduled and starts publishing.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use aw_domain::config::CoalescingConfig;
use aw_domain::run::{CoalescerState, EngineEvent};

use crate::channel_adapter::ChannelAdapter;
use crate::coalesce::stream::{FlushAction, StreamCoalescer};
use crate::coalesce::tool_status::ToolStatusCoalescer;
use crate::runtime::bus::Bus;

pub struct OutputTracker {
    bus: Arc<Bus>,
    stream: StreamCoalescer,
    status: ToolStatusCoalescer,
}

impl OutputTracker {
    pub fn new(bus: Arc<Bus>, coalescing: CoalescingConfig) -> Self {
        let status = ToolStatusCoalescer::new(coalescing.max_status_entries);
        Self { bus, stream: StreamCoalescer::new(coalescing), status }
    }

    /// Drive a single run to completion against `adapter`. Returns once the
    /// run's `:run_completed` event has been seen and the tail of both the
    /// answer stream and the status block have been flushed.
    pub async fn drive(&self, run_id: Uuid, session_key: &str, adapter: Arc<dyn ChannelAdapter>) {
        let topic = Bus::run_topic(run_id);
        let mut rx = self.bus.subscribe(&topic);
        let mut state = CoalescerState::default();
        let edit_capable = adapter.edit_capable();

        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(_) => break,
            };

            match &event.engine_event {
                Some(EngineEvent::Delta { seq, text }) => {
                    if let Some(action) = self.stream.on_delta(&mut state, *seq, text, Utc::now(), edit_capable) {
                        self.apply_stream_action(&mut state, adapter.as_ref(), session_key, action).await;
                    }
                }
                Some(EngineEvent::ActionEvent { action, phase, ok }) => {
                    let rendered = self.status.on_action(&mut state.known_actions, action, *phase, *ok);
                    self.send_status_if_changed(&mut state, adapter.as_ref(), session_key, rendered).await;
                }
                _ => {}
            }

            if event.tag == "run_completed" {
                let resume_suffix = event.resume.as_ref().map(|token| format!(" [resume:{}]", token.value));
                if let Some(action) = self.stream.finalize(&mut state, Utc::now(), edit_capable, resume_suffix.as_deref()) {
                    self.apply_stream_action(&mut state, adapter.as_ref(), session_key, action).await;
                }
                if !state.known_actions.is_empty() {
                    let rendered = self.status.finalize(&mut state.known_actions);
                    self.send_status_if_changed(&mut state, adapter.as_ref(), session_key, rendered).await;
                }
                break;
            }
        }
    }

    /// Send a freshly rendered status block only if it differs from the last
    /// one actually sent, so an unchanged render doesn't trigger a redundant
    /// edit.
    async fn send_status_if_changed(&self, state: &mut CoalescerState, adapter: &dyn ChannelAdapter, session_key: &str, rendered: String) {
        if state.last_rendered_status.as_deref() == Some(rendered.as_str()) {
            return;
        }
        if adapter.send_status(session_key, &rendered).await.is_ok() {
            state.last_rendered_status = Some(rendered);
        }
    }

    async fn apply_stream_action(&self, state: &mut CoalescerState, adapter: &dyn ChannelAdapter, session_key: &str, action: FlushAction) {
        let limit = adapter.max_message_chars();
        match action {
            FlushAction::New { text } => {
                let text = adapter.truncate(&text, limit);
                if let Ok(msg_id) = adapter.send_new(session_key, &text).await {
                    state.answer_msg_id = Some(msg_id);
                }
            }
            FlushAction::Edit { msg_id, text } => {
                let text = adapter.truncate(&text, limit);
                let _ = adapter.edit(&msg_id, &text).await;
            }
        }
    }
}
