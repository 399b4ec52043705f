// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Operator-facing collaborator interface.
//!
//! The update machinery never draws anything or asks anything on its own.
//! It talks to the outside world through an [`UpdateSink`], which may be a
//! terminal, a desktop window, or a scripted test double. Every method may
//! be called from a worker thread.

use crate::{ansi::AnsiSpan, tweaks::RestorePrompt};

use parking_lot::Mutex;
use std::{collections::VecDeque, path::Path, sync::Arc};

/// Outcome of a per-file restore question.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileDecision {
    /// Put the archived version back.
    Restore,

    /// Keep what the installer wrote.
    KeepNew,
}

/// Sink for log output, progress, and operator decisions.
pub trait UpdateSink: Send + Sync {
    /// Append raw text to the log.
    fn append(&self, text: &str);

    /// Append decoded installer output. Plain sinks just append the text.
    fn append_spans(&self, spans: &[AnsiSpan]) {
        for span in spans {
            self.append(&span.text);
        }
    }

    /// Make sure the log is on screen.
    fn ensure_visible(&self) {}

    /// Clear the log.
    fn clear(&self);

    /// Report busy or idle, with a short hint of what is going on.
    fn set_busy(&self, busy: bool, hint: &str);

    /// Ask a yes or no question.
    fn confirm(&self, question: &str) -> bool;

    /// Ask which version of a tweak file to keep. `None` if no answer could
    /// be obtained.
    fn prompt_file_decision(&self, path: &Path, diff: &str) -> Option<FileDecision>;

    /// Send a notification.
    fn notify(&self, title: &str, body: &str);
}

impl<S> UpdateSink for Arc<S>
where
    S: UpdateSink + ?Sized,
{
    fn append(&self, text: &str) {
        (**self).append(text)
    }

    fn append_spans(&self, spans: &[AnsiSpan]) {
        (**self).append_spans(spans)
    }

    fn ensure_visible(&self) {
        (**self).ensure_visible()
    }

    fn clear(&self) {
        (**self).clear()
    }

    fn set_busy(&self, busy: bool, hint: &str) {
        (**self).set_busy(busy, hint)
    }

    fn confirm(&self, question: &str) -> bool {
        (**self).confirm(question)
    }

    fn prompt_file_decision(&self, path: &Path, diff: &str) -> Option<FileDecision> {
        (**self).prompt_file_decision(path, diff)
    }

    fn notify(&self, title: &str, body: &str) {
        (**self).notify(title, body)
    }
}

impl<S> RestorePrompt for S
where
    S: UpdateSink + ?Sized,
{
    fn bulk_restore(&self, files: usize) -> bool {
        self.confirm(&format!(
            "Large backup\n{files} files in backup.\n\
             Restore all differing files automatically?\n\
             Yes = restore all differing files. No = prompt file-by-file."
        ))
    }

    fn decide(&self, path: &Path, diff: &str) -> Option<FileDecision> {
        self.prompt_file_decision(path, diff)
    }
}

/// Bounded log buffer.
///
/// Keeps at most `max_lines` complete lines, dropping the oldest first. A
/// limit of zero means unlimited.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Scrollback {
    lines: VecDeque<String>,
    partial: String,
    max_lines: usize,
}

impl Scrollback {
    /// Construct new empty scrollback.
    pub fn new(max_lines: usize) -> Self {
        Self {
            max_lines,
            ..Default::default()
        }
    }

    /// Append text that may hold any number of newlines.
    pub fn push(&mut self, text: &str) {
        for piece in text.split_inclusive('\n') {
            self.partial.push_str(piece);
            if self.partial.ends_with('\n') {
                let line = std::mem::take(&mut self.partial);
                self.lines.push_back(line);
            }
        }
        self.trim();
    }

    /// Change line limit, trimming right away.
    pub fn set_max_lines(&mut self, max_lines: usize) {
        self.max_lines = max_lines;
        self.trim();
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.lines.clear();
        self.partial.clear();
    }

    /// Complete lines followed by trailing partial line.
    pub fn text(&self) -> String {
        let mut text: String = self.lines.iter().map(String::as_str).collect();
        text.push_str(&self.partial);
        text
    }

    /// Number of complete lines held.
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// Check if nothing is held.
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty() && self.partial.is_empty()
    }

    fn trim(&mut self) {
        if self.max_lines == 0 {
            return;
        }

        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
        }
    }
}

/// Headless sink that records everything and answers from a script.
///
/// Useful for unattended runs, and for embedding the updater somewhere that
/// renders the log on its own schedule.
#[derive(Debug, Default)]
pub struct MemorySink {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    log: Scrollback,
    busy: Vec<(bool, String)>,
    questions: Vec<String>,
    confirms: VecDeque<bool>,
    default_confirm: bool,
    decisions: VecDeque<Option<FileDecision>>,
    default_decision: Option<FileDecision>,
    notifications: Vec<(String, String)>,
    decided: Vec<(String, String)>,
}

impl MemorySink {
    /// Construct new memory sink keeping at most `max_lines` of log.
    ///
    /// Unscripted questions are answered with no, and unscripted file
    /// decisions keep the new file.
    pub fn new(max_lines: usize) -> Self {
        let sink = Self::default();
        {
            let mut state = sink.state.lock();
            state.log.set_max_lines(max_lines);
            state.default_decision = Some(FileDecision::KeepNew);
        }
        sink
    }

    /// Queue answer of next yes or no question.
    pub fn answer(self, yes: bool) -> Self {
        self.state.lock().confirms.push_back(yes);
        self
    }

    /// Answer every unscripted yes or no question with `yes`.
    pub fn answer_all(self, yes: bool) -> Self {
        self.state.lock().default_confirm = yes;
        self
    }

    /// Queue answer of next file decision.
    pub fn decide(self, decision: Option<FileDecision>) -> Self {
        self.state.lock().decisions.push_back(decision);
        self
    }

    /// Recorded log text.
    pub fn log(&self) -> String {
        self.state.lock().log.text()
    }

    /// Recorded busy transitions.
    pub fn busy_transitions(&self) -> Vec<(bool, String)> {
        self.state.lock().busy.clone()
    }

    /// Questions asked so far.
    pub fn questions(&self) -> Vec<String> {
        self.state.lock().questions.clone()
    }

    /// Files a decision was asked for, along with their diff preview.
    pub fn decided(&self) -> Vec<(String, String)> {
        self.state.lock().decided.clone()
    }

    /// Notifications sent so far.
    pub fn notifications(&self) -> Vec<(String, String)> {
        self.state.lock().notifications.clone()
    }
}

impl UpdateSink for MemorySink {
    fn append(&self, text: &str) {
        self.state.lock().log.push(text);
    }

    fn clear(&self) {
        self.state.lock().log.clear();
    }

    fn set_busy(&self, busy: bool, hint: &str) {
        self.state.lock().busy.push((busy, hint.to_string()));
    }

    fn confirm(&self, question: &str) -> bool {
        let mut state = self.state.lock();
        state.questions.push(question.to_string());
        let fallback = state.default_confirm;
        state.confirms.pop_front().unwrap_or(fallback)
    }

    fn prompt_file_decision(&self, path: &Path, diff: &str) -> Option<FileDecision> {
        let mut state = self.state.lock();
        state
            .decided
            .push((path.display().to_string(), diff.to_string()));
        let fallback = state.default_decision;
        state.decisions.pop_front().unwrap_or(fallback)
    }

    fn notify(&self, title: &str, body: &str) {
        self.state
            .lock()
            .notifications
            .push((title.to_string(), body.to_string()));
    }
}
