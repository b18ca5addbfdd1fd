//! Tool/command/action-lifecycle status coalescing.
//!
//! Renders the running list of actions a run has taken as a single numbered
//! status block (one line per action, oldest first), so a channel can show
//! "what's happening" without spamming a message per tool call. Capped at
//! `max_status_entries`; once full, the oldest entry is dropped to make
//! room for a new one. A `Completed` event updates the existing line for
//! that action in place rather than appending a second one.

use aw_domain::run::{Action, ActionPhase};

const MAX_TITLE_CHARS: usize = 80;
const MAX_RESULT_CHARS: usize = 140;
const ID_SEP: char = '\u{1}';

fn truncate_to(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        text.to_owned()
    } else {
        let head: String = text.chars().take(limit.saturating_sub(1)).collect();
        format!("{head}…")
    }
}

fn make_entry(id: &str, marker: &str, title: &str, result: Option<&str>) -> String {
    match result {
        Some(r) if !r.is_empty() => format!("{id}{ID_SEP}{marker} {} — {}", truncate_to(title, MAX_TITLE_CHARS), truncate_to(r, MAX_RESULT_CHARS)),
        _ => format!("{id}{ID_SEP}{marker} {}", truncate_to(title, MAX_TITLE_CHARS)),
    }
}

fn entry_id(entry: &str) -> &str {
    entry.split(ID_SEP).next().unwrap_or("")
}

fn entry_display(entry: &str) -> &str {
    entry.split_once(ID_SEP).map(|(_, d)| d).unwrap_or(entry)
}

pub struct ToolStatusCoalescer {
    max_entries: usize,
}

impl ToolStatusCoalescer {
    pub fn new(max_entries: usize) -> Self {
        Self { max_entries }
    }

    /// Record one action lifecycle event and return the freshly rendered
    /// status block.
    pub fn on_action(&self, known_actions: &mut Vec<String>, action: &Action, phase: ActionPhase, ok: Option<bool>) -> String {
        if action.id.is_empty() {
            return self.render(known_actions);
        }
        let marker = match phase {
            ActionPhase::Started => "…",
            ActionPhase::Completed if ok.unwrap_or(true) => "✓",
            ActionPhase::Completed => "✗",
        };
        let entry = make_entry(&action.id, marker, &action.title, action.result.as_deref());

        if let Some(pos) = known_actions.iter().position(|e| entry_id(e) == action.id) {
            known_actions[pos] = entry;
        } else {
            known_actions.push(entry);
            if known_actions.len() > self.max_entries {
                known_actions.remove(0);
            }
        }

        self.render(known_actions)
    }

    /// Mark any action still showing as in-progress as interrupted, for the
    /// case a run ends before every started action reported completion.
    pub fn finalize(&self, known_actions: &mut [String]) -> String {
        for entry in known_actions.iter_mut() {
            if entry_display(entry).starts_with('…') {
                let id = entry_id(entry).to_owned();
                let rest = entry_display(entry).trim_start_matches('…').trim_start().to_owned();
                *entry = format!("{id}{ID_SEP}⚠ {rest}");
            }
        }
        self.render(known_actions)
    }

    fn render(&self, known_actions: &[String]) -> String {
        known_actions
            .iter()
            .enumerate()
            .map(|(i, e)| format!("{}. {}", i + 1, entry_display(e)))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aw_domain::run::ActionKind;

    fn action(id: &str, title: &str) -> Action {
        Action { id: id.to_owned(), kind: ActionKind::Tool, title: title.to_owned(), result: None }
    }

    #[test]
    fn started_then_completed_updates_the_same_line() {
        let coalescer = ToolStatusCoalescer::new(40);
        let mut known = Vec::new();
        coalescer.on_action(&mut known, &action("a1", "grep"), ActionPhase::Started, None);
        let rendered = coalescer.on_action(&mut known, &action("a1", "grep"), ActionPhase::Completed, Some(true));
        assert_eq!(known.len(), 1);
        assert_eq!(rendered, "1. ✓ grep");
    }

    #[test]
    fn failed_completion_renders_with_cross_marker() {
        let coalescer = ToolStatusCoalescer::new(40);
        let mut known = Vec::new();
        coalescer.on_action(&mut known, &action("a1", "build"), ActionPhase::Started, None);
        let rendered = coalescer.on_action(&mut known, &action("a1", "build"), ActionPhase::Completed, Some(false));
        assert_eq!(rendered, "1. ✗ build");
    }

    #[test]
    fn cap_drops_oldest_entry() {
        let coalescer = ToolStatusCoalescer::new(2);
        let mut known = Vec::new();
        coalescer.on_action(&mut known, &action("a1", "one"), ActionPhase::Started, None);
        coalescer.on_action(&mut known, &action("a2", "two"), ActionPhase::Started, None);
        let rendered = coalescer.on_action(&mut known, &action("a3", "three"), ActionPhase::Started, None);
        assert_eq!(known.len(), 2);
        assert_eq!(rendered, "1. … two\n2. … three");
    }

    #[test]
    fn finalize_marks_unfinished_actions_interrupted() {
        let coalescer = ToolStatusCoalescer::new(40);
        let mut known = Vec::new();
        coalescer.on_action(&mut known, &action("a1", "slow tool"), ActionPhase::Started, None);
        let rendered = coalescer.finalize(&mut known);
        assert_eq!(rendered, "1. ⚠ slow tool");
    }

    #[test]
    fn completion_result_is_appended_and_truncated() {
        let coalescer = ToolStatusCoalescer::new(40);
        let mut known = Vec::new();
        coalescer.on_action(&mut known, &action("a1", "search"), ActionPhase::Started, None);
        let mut completed = action("a1", "search");
        completed.result = Some("x".repeat(200));
        let rendered = coalescer.on_action(&mut known, &completed, ActionPhase::Completed, Some(true));
        let line = rendered.strip_prefix("1. ✓ search — ").expect("expected a result suffix");
        assert_eq!(line.chars().count(), MAX_RESULT_CHARS);
        assert!(line.ends_with('…'));
    }

    #[test]
    fn action_without_id_is_dropped() {
        let coalescer = ToolStatusCoalescer::new(40);
        let mut known = Vec::new();
        let rendered = coalescer.on_action(&mut known, &action("", "ghost"), ActionPhase::Started, None);
        assert!(known.is_empty());
        assert_eq!(rendered, "");
    }

    #[test]
    fn long_title_is_truncated() {
        let coalescer = ToolStatusCoalescer::new(40);
        let mut known = Vec::new();
        let long_title = "x".repeat(120);
        coalescer.on_action(&mut known, &action("a1", &long_title), ActionPhase::Started, None);
        assert!(entry_display(&known[0]).chars().count() <= MAX_TITLE_CHARS + 2);
    }
}
