// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use runa_model::{Content, Part, Role};

/// Recorded conversation history with a curated view.
///
/// Raw history is what actually happened; the curated view is what gets
/// resubmitted to the model.  Invariants maintained here:
/// - the first entry of a non-empty history has the user role;
/// - thought parts are never persisted;
/// - adjacent model contents whose first parts are both text are
///   consolidated into one content on record;
/// - the curated view drops invalid model output (no parts, or any
///   empty/whitespace text part) and everything after it in that turn.
#[derive(Debug, Default)]
pub struct History {
    items: Vec<Content>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Append a user content entry.
    pub fn push_user(&mut self, content: Content) {
        debug_assert!(matches!(content.role, Role::User));
        self.items.push(content);
    }

    /// Remove the trailing entry iff it is still exactly `expected`.
    ///
    /// Used by the stream rollback path: when every retry attempt failed,
    /// the user content pushed before the attempts is popped so history
    /// looks as if the turn never happened.  If something else replaced the
    /// tail in the meantime the cleanup is skipped.
    pub fn rollback_tail(&mut self, expected: &Content) -> bool {
        if self.items.last() == Some(expected) {
            self.items.pop();
            true
        } else {
            false
        }
    }

    /// Record model output for the current turn.
    ///
    /// Thought parts are stripped before recording; contents left with no
    /// parts are skipped entirely.  When the previous entry is also a model
    /// content and both sides meet text-first, the contents are
    /// consolidated: the new text is concatenated onto the previous text.
    pub fn record_model_output(&mut self, outputs: Vec<Content>) {
        for output in outputs {
            debug_assert!(matches!(output.role, Role::Model));
            let parts: Vec<Part> = output
                .parts
                .into_iter()
                .filter(|p| !p.is_thought())
                .collect();
            if parts.is_empty() {
                continue;
            }
            let content = Content { role: Role::Model, parts };

            let consolidate = matches!(
                (self.items.last(), content.parts.first()),
                (Some(prev), Some(Part::Text { .. }))
                    if matches!(prev.role, Role::Model)
                        && matches!(prev.parts.first(), Some(Part::Text { .. }))
            );
            match self.items.last_mut() {
                Some(prev) if consolidate => {
                    for part in content.parts {
                        let merged = match (prev.parts.last_mut(), &part) {
                            (Some(Part::Text { text: last }), Part::Text { text: new }) => {
                                last.push_str(new);
                                true
                            }
                            _ => false,
                        };
                        if !merged {
                            prev.parts.push(part);
                        }
                    }
                }
                _ => self.items.push(content),
            }
        }
    }

    /// Substitute the current turn's recorded contents wholesale.  Used when
    /// the provider reports its own function-calling history: everything
    /// beyond `known_len` replaces the entries recorded since then.
    pub fn splice_tail(&mut self, known_len: usize, replacement: Vec<Content>) {
        self.items.truncate(known_len);
        for c in replacement {
            match c.role {
                Role::User => self.items.push(c),
                Role::Model => self.record_model_output(vec![c]),
            }
        }
    }

    /// Deep copy of the raw history.
    pub fn raw(&self) -> Vec<Content> {
        self.items.clone()
    }

    /// Deep copy of the curated history: the subset considered valid for
    /// resubmission.  Within each turn's model group, contents after the
    /// first invalid one are dropped too; a half-valid turn must not leak
    /// its tail.
    pub fn curated(&self) -> Vec<Content> {
        let mut out = Vec::with_capacity(self.items.len());
        let mut turn_poisoned = false;
        for item in &self.items {
            match item.role {
                Role::User => {
                    turn_poisoned = false;
                    out.push(item.clone());
                }
                Role::Model => {
                    if turn_poisoned {
                        continue;
                    }
                    if item.is_valid_model_output() {
                        out.push(item.clone());
                    } else {
                        turn_poisoned = true;
                    }
                }
            }
        }
        out
    }

    pub fn get(&self, curated: bool) -> Vec<Content> {
        if curated {
            self.curated()
        } else {
            self.raw()
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
