//! The seam between the coalescers and a concrete channel (Telegram,
//! Discord, the HTTP SSE endpoint, ...). A channel tells
//! [`OutputTracker`](crate::output_tracker::OutputTracker) whether it can
//! edit a previously sent message; the tracker drives `send_new`/`edit`
//! calls from there.

use async_trait::async_trait;

use aw_domain::error::Result;

#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Whether this channel supports mutating an already-sent message.
    /// Telegram/Discord/Slack do; a plain webhook or log sink typically
    /// doesn't and gets one message per flush instead.
    fn edit_capable(&self) -> bool;

    /// Send a new message, returning an id `edit` can later target.
    async fn send_new(&self, session_key: &str, text: &str) -> Result<String>;

    /// Replace the content of a message previously returned by `send_new`.
    async fn edit(&self, msg_id: &str, text: &str) -> Result<()>;

    /// Post (or update) the running tool-status block. Channels that want
    /// status folded into the answer message rather than a separate one
    /// can treat this the same as `send_new`/`edit` on a second message id
    /// they track themselves.
    async fn send_status(&self, session_key: &str, text: &str) -> Result<()>;

    /// Largest message body this channel accepts before it needs to split
    /// or reject. Telegram's 4096 is the default; channels with a tighter
    /// limit (Discord's 2000) override it.
    fn max_message_chars(&self) -> usize {
        4096
    }

    /// Truncate `text` to fit `max_message_chars`, appending an ellipsis
    /// marker when it had to cut. Coalescers call this on the rendered
    /// text before handing it to `send_new`/`edit` so a channel's own
    /// length limit never produces a hard send failure.
    fn truncate(&self, text: &str, limit: usize) -> String {
        if text.chars().count() <= limit {
            return text.to_owned();
        }
        let marker = "\u{2026}";
        let keep = limit.saturating_sub(marker.chars().count());
        let mut out: String = text.chars().take(keep).collect();
        out.push_str(marker);
        out
    }
}
