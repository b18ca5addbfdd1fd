//! Delta coalescing for the answer text channel.
//!
//! Deltas arrive far more often than a channel adapter should post/edit a
//! message — this buffers them and decides *when* to flush based on
//! `CoalescingConfig`: either enough text has piled up and the stream has
//! gone briefly idle (`min_chars` + `idle_ms`), or too much time has passed
//! since the last flush regardless of buffer size (`max_latency_ms`). A
//! buffer that blows past `max_buffer_chars` (e.g. a channel that's fallen
//! behind) forces an immediate flush rather than growing unbounded.
//!
//! Edit-capable channels (can mutate a previously sent message) render the
//! full cumulative answer on every flush and edit the same message in
//! place; channels without that capability get one new message per flush
//! containing just the incremental chunk.

use chrono::{DateTime, Utc};

use aw_domain::config::CoalescingConfig;
use aw_domain::run::CoalescerState;

/// What the caller (a `ChannelAdapter`) should do with a flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushAction {
    /// Replace the content of an already-sent message.
    Edit { msg_id: String, text: String },
    /// Send a new message.
    New { text: String },
}

/// Cap on out-of-order deltas held awaiting their predecessor. A delta that
/// would need to wait past this many slots is let through anyway — the
/// "small window" the spec calls for, not unbounded buffering.
const REORDER_WINDOW: usize = 32;

/// Cap on the cumulative rendered text an edit-capable channel accumulates
/// across a run's lifetime. A run long enough to blow past this just drops
/// its oldest text rather than growing the edited message forever.
const MAX_CUMULATIVE_CHARS: usize = 100_000;

pub struct StreamCoalescer {
    cfg: CoalescingConfig,
}

impl StreamCoalescer {
    pub fn new(cfg: CoalescingConfig) -> Self {
        Self { cfg }
    }

    /// Feed one `(seq, text)` delta into `state`, tagged by the `Run`'s
    /// monotonic per-run sequence counter. A `seq` already consumed is a
    /// duplicate and is dropped silently; a `seq` ahead of what's expected
    /// is held in `reorder_window` until the gap closes (or the window
    /// overflows, at which point it's let through out of order rather than
    /// held forever). Returns a flush action if a trigger fired, otherwise
    /// `None` (keep buffering).
    pub fn on_delta(&self, state: &mut CoalescerState, seq: u64, text: &str, now: DateTime<Utc>, edit_capable: bool) -> Option<FlushAction> {
        if seq < state.next_seq {
            return None; // duplicate, already appended
        }

        if seq > state.next_seq {
            if state.reorder_window.len() >= REORDER_WINDOW {
                // Predecessor never showed up within the window; take the
                // gap rather than stalling the stream indefinitely.
                state.next_seq = seq;
            } else {
                state.reorder_window.insert(seq, text.to_owned());
                return None;
            }
        }

        state.buffer.push_str(text);
        state.next_seq = state.next_seq.max(seq) + 1;

        // Drain any buffered deltas that are now contiguous.
        while let Some(next_text) = state.reorder_window.remove(&state.next_seq) {
            state.buffer.push_str(&next_text);
            state.next_seq += 1;
        }

        if state.buffer.len() > self.cfg.max_buffer_chars {
            return Some(self.flush(state, now, edit_capable));
        }

        let since_last_ms = state.last_flush_ts.map(|t| (now - t).num_milliseconds().max(0) as u64);
        let idle_elapsed = since_last_ms.map(|ms| ms >= self.cfg.idle_ms).unwrap_or(true);
        let latency_elapsed = since_last_ms.map(|ms| ms >= self.cfg.max_latency_ms).unwrap_or(false);
        let enough_chars = state.buffer.len() >= self.cfg.min_chars;

        if (enough_chars && idle_elapsed) || latency_elapsed {
            Some(self.flush(state, now, edit_capable))
        } else {
            None
        }
    }

    /// Flush whatever remains, regardless of thresholds, then — for
    /// edit-capable channels with a resume token to offer — append it to
    /// the message as a compact suffix so the user/UI can re-attach.
    /// Called once a run reaches `:run_completed`.
    pub fn finalize(&self, state: &mut CoalescerState, now: DateTime<Utc>, edit_capable: bool, resume_suffix: Option<&str>) -> Option<FlushAction> {
        let flushed = if !state.buffer.is_empty() { Some(self.flush(state, now, edit_capable)) } else { None };

        let Some(suffix) = resume_suffix.filter(|s| !s.is_empty() && edit_capable) else {
            return flushed;
        };

        let base_text = match &flushed {
            Some(FlushAction::Edit { text, .. }) | Some(FlushAction::New { text }) => text.clone(),
            None => state.last_rendered_text.clone().unwrap_or_default(),
        };
        let text = format!("{base_text}{suffix}");
        state.last_rendered_text = Some(text.clone());

        Some(match &state.answer_msg_id {
            Some(id) => FlushAction::Edit { msg_id: id.clone(), text },
            None => FlushAction::New { text },
        })
    }

    fn flush(&self, state: &mut CoalescerState, now: DateTime<Utc>, edit_capable: bool) -> FlushAction {
        let chunk = std::mem::take(&mut state.buffer);
        state.last_flush_ts = Some(now);

        if edit_capable {
            let mut full_text = match &state.last_rendered_text {
                Some(prev) => format!("{prev}{chunk}"),
                None => chunk,
            };
            if full_text.chars().count() > MAX_CUMULATIVE_CHARS {
                let drop = full_text.chars().count() - MAX_CUMULATIVE_CHARS;
                full_text = full_text.chars().skip(drop).collect();
            }
            state.last_rendered_text = Some(full_text.clone());
            match &state.answer_msg_id {
                Some(id) => FlushAction::Edit { msg_id: id.clone(), text: full_text },
                None => FlushAction::New { text: full_text },
            }
        } else {
            state.last_rendered_text = Some(chunk.clone());
            FlushAction::New { text: chunk }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> CoalescingConfig {
        CoalescingConfig { min_chars: 8, idle_ms: 50, max_latency_ms: 500, max_buffer_chars: 100, max_status_entries: 40 }
    }

    #[test]
    fn short_delta_below_threshold_does_not_flush() {
        let coalescer = StreamCoalescer::new(cfg());
        let mut state = CoalescerState::default();
        let now = Utc::now();
        assert!(coalescer.on_delta(&mut state, 0, "hi", now, true).is_none());
    }

    #[test]
    fn latency_trigger_flushes_even_under_min_chars() {
        let coalescer = StreamCoalescer::new(cfg());
        let mut state = CoalescerState { last_flush_ts: Some(Utc::now() - chrono::Duration::milliseconds(600)), ..Default::default() };
        let action = coalescer.on_delta(&mut state, 0, "hi", Utc::now(), true);
        assert!(matches!(action, Some(FlushAction::New { .. })));
    }

    #[test]
    fn edit_capable_channel_edits_with_cumulative_text() {
        let coalescer = StreamCoalescer::new(cfg());
        let mut state = CoalescerState::default();
        let t0 = Utc::now();
        let first = coalescer.on_delta(&mut state, 0, "hello there friend", t0, true).unwrap();
        let FlushAction::New { text } = first else { panic!("expected New") };
        assert_eq!(text, "hello there friend");

        state.answer_msg_id = Some("m1".into());
        let t1 = t0 + chrono::Duration::milliseconds(100);
        let second = coalescer.on_delta(&mut state, 1, " more text here", t1, true).unwrap();
        assert_eq!(second, FlushAction::Edit { msg_id: "m1".into(), text: "hello there friend more text here".into() });
    }

    #[test]
    fn non_edit_capable_channel_sends_only_the_increment() {
        let coalescer = StreamCoalescer::new(cfg());
        let mut state = CoalescerState::default();
        let t0 = Utc::now();
        let first = coalescer.on_delta(&mut state, 0, "hello there friend", t0, false).unwrap();
        assert_eq!(first, FlushAction::New { text: "hello there friend".into() });

        let t1 = t0 + chrono::Duration::milliseconds(100);
        let second = coalescer.on_delta(&mut state, 1, "more chunked text", t1, false).unwrap();
        assert_eq!(second, FlushAction::New { text: "more chunked text".into() });
    }

    #[test]
    fn oversized_buffer_forces_immediate_flush() {
        let coalescer = StreamCoalescer::new(cfg());
        let mut state = CoalescerState::default();
        let huge = "x".repeat(200);
        let action = coalescer.on_delta(&mut state, 0, &huge, Utc::now(), false);
        assert!(action.is_some());
    }

    #[test]
    fn duplicate_seq_is_ignored() {
        let coalescer = StreamCoalescer::new(cfg());
        let mut state = CoalescerState::default();
        let t0 = Utc::now();
        coalescer.on_delta(&mut state, 0, "hello there friend", t0, true);
        let dup = coalescer.on_delta(&mut state, 0, "hello there friend", t0, true);
        assert!(dup.is_none());
        assert_eq!(state.next_seq, 1);
    }

    #[test]
    fn out_of_order_delta_is_held_until_the_gap_closes() {
        let coalescer = StreamCoalescer::new(cfg());
        let mut state = CoalescerState::default();
        let t0 = Utc::now();

        // seq 1 arrives before seq 0: held, nothing flushed yet.
        assert!(coalescer.on_delta(&mut state, 1, "world", t0, true).is_none());
        assert_eq!(state.buffer, "");

        // seq 0 arrives: both 0 and the held 1 drain into the buffer in order.
        let action = coalescer.on_delta(&mut state, 0, "hello ", t0, true).unwrap();
        let FlushAction::New { text } = action else { panic!("expected New") };
        assert_eq!(text, "hello world");
        assert_eq!(state.next_seq, 2);
    }

    #[test]
    fn cumulative_text_beyond_cap_drops_the_oldest_chars() {
        let coalescer = StreamCoalescer::new(cfg());
        let mut state = CoalescerState {
            last_rendered_text: Some("x".repeat(MAX_CUMULATIVE_CHARS)),
            answer_msg_id: Some("m1".into()),
            next_seq: 1,
            ..Default::default()
        };
        let action = coalescer.on_delta(&mut state, 1, "overflow", Utc::now(), true).unwrap();
        let FlushAction::Edit { text, .. } = action else { panic!("expected Edit") };
        assert_eq!(text.len(), MAX_CUMULATIVE_CHARS);
        assert!(text.ends_with("overflow"));
    }

    #[test]
    fn finalize_flushes_remaining_buffer_once() {
        let coalescer = StreamCoalescer::new(cfg());
        let mut state = CoalescerState { buffer: "leftover".into(), ..Default::default() };
        assert!(coalescer.finalize(&mut state, Utc::now(), false, None).is_some());
        assert!(coalescer.finalize(&mut state, Utc::now(), false, None).is_none());
    }

    #[test]
    fn finalize_appends_resume_suffix_on_edit_capable_channels() {
        let coalescer = StreamCoalescer::new(cfg());
        let mut state = CoalescerState { buffer: "the end".into(), answer_msg_id: Some("m1".into()), ..Default::default() };
        let action = coalescer.finalize(&mut state, Utc::now(), true, Some(" [resume:abc]")).unwrap();
        assert_eq!(action, FlushAction::Edit { msg_id: "m1".into(), text: "the end [resume:abc]".into() });
    }

    #[test]
    fn finalize_with_empty_buffer_still_appends_resume_suffix() {
        let coalescer = StreamCoalescer::new(cfg());
        let mut state = CoalescerState { last_rendered_text: Some("already sent".into()), answer_msg_id: Some("m1".into()), ..Default::default() };
        let action = coalescer.finalize(&mut state, Utc::now(), true, Some(" [resume:abc]")).unwrap();
        assert_eq!(action, FlushAction::Edit { msg_id: "m1".into(), text: "already sent [resume:abc]".into() });
    }

    #[test]
    fn finalize_does_not_append_resume_suffix_on_non_edit_capable_channels() {
        let coalescer = StreamCoalescer::new(cfg());
        let mut state = CoalescerState { buffer: "the end".into(), ..Default::default() };
        let action = coalescer.finalize(&mut state, Utc::now(), false, Some(" [resume:abc]")).unwrap();
        assert_eq!(action, FlushAction::New { text: "the end".into() });
    }
}
