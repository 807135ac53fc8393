//! Application UI. For now, this is mostly progress bars.
//!
//! This is adapted from `substudy` by Eric Kidd, which is licensed under
//! Apache-2.0 OR MIT. Used with permission.

use std::{borrow::Cow, io, sync::Arc, time::Duration};

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use serde_json::Value;

/// Application UI state.
#[derive(Clone)]
pub struct Ui {
    /// Our progress bars. I'm not actually sure that this `Arc` is useful, but
    /// I'm playing it safe until I understand `MultiProgress` and `tokio`
    /// interactions better.
    multi_progress: Arc<MultiProgress>,
}

impl Ui {
    /// Create a new UI. This sets up logging and and progress bars.
    pub fn init() -> Ui {
        let multi_progress = Arc::new(MultiProgress::new());
        Ui { multi_progress }
    }

    /// Create a new UI for unit tests.returns_right_number_of_subs
    #[cfg(test)]
    #[allow(dead_code)]
    pub fn init_for_tests() -> Ui {
        let multi_progress =
            Arc::new(MultiProgress::with_draw_target(ProgressDrawTarget::hidden()));
        Ui { multi_progress }
    }

    /// Hide all our progress bars completely, for when we're writing actual
    /// output to `stdout`.
    pub fn hide_progress_bars(&self) {
        self.multi_progress
            .set_draw_target(ProgressDrawTarget::hidden());
    }

    /// Get a writer than can be used to write to stderr, for use with `tracing`
    /// and other output code.
    pub fn get_stderr_writer(&self) -> SafeStderrWriter {
        SafeStderrWriter { ui: self.clone() }
    }

    /// Get a reference to our progress bars.
    pub fn multi_progress(&self) -> &MultiProgress {
        &self.multi_progress
    }

    /// Create a new progress bar with default settings.
    pub fn new_progress_bar(&self, config: &ProgressConfig<'_>, len: u64) -> ProgressBar {
        let pb = ProgressBar::new(len).with_style(default_progress_style());
        let pb = self.multi_progress.add(pb);
        #[cfg(test)]
        pb.set_draw_target(ProgressDrawTarget::hidden());
        pb.set_prefix(config.emoji.to_owned());
        pb.set_message(config.msg.to_owned());
        pb.enable_steady_tick(Duration::from_millis(250));
        pb.with_finish(indicatif::ProgressFinish::WithMessage(Cow::Owned(
            config.done_msg.to_owned(),
        )))
    }

    /// Create a new spinner with default settings.
    pub fn new_spinner(&self, config: &ProgressConfig<'_>) -> ProgressBar {
        let sp = ProgressBar::new_spinner().with_style(default_spinner_style());
        let sp = self.multi_progress.add(sp);
        #[cfg(test)]
        sp.set_draw_target(ProgressDrawTarget::hidden());
        sp.set_prefix(config.emoji.to_owned());
        sp.set_message(config.msg.to_owned());
        sp.enable_steady_tick(Duration::from_millis(250));
        sp.with_finish(indicatif::ProgressFinish::WithMessage(Cow::Owned(
            config.done_msg.to_owned(),
        )))
    }

    /// Create a new progress bar or spinner based on a size hint.
    pub fn new_from_size_hint(
        &self,
        config: &ProgressConfig<'_>,
        size_hint: (usize, Option<usize>),
    ) -> ProgressBar {
        match size_hint {
            (_, Some(len)) if len > 0 => self.new_progress_bar(
                config,
                u64::try_from(len).expect("size hint too large"),
            ),
            _ => self.new_spinner(config),
        }
    }
}

/// Configuration for a progress bar.
pub struct ProgressConfig<'a> {
    /// Emoji to display in the progress bar.
    pub emoji: &'a str,
    /// Message to display in a running progress bar.
    pub msg: &'a str,
    /// Message to display in a progress bar when it is done.
    pub done_msg: &'a str,
}

fn default_progress_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("  {prefix:3}{msg:25} {pos:>4}/{len:4} {elapsed_precise} {wide_bar:.cyan/blue} {eta_precise}")
        .expect("bad progress bar template")
}

fn default_spinner_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("{spinner} {prefix:3}{msg}")
        .expect("bad progress bar template")
}

/// A writer which can used to write to `stderr`. It will hide and show progress
/// bars as needed, so that they don't interfere with the output.
#[derive(Clone)]
pub struct SafeStderrWriter {
    ui: Ui,
}

// The `tracing-indicatif` crate suggests that we should implement the following
// methods.
impl io::Write for SafeStderrWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.ui.multi_progress().suspend(|| io::stderr().write(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.ui.multi_progress().suspend(|| io::stderr().flush())
    }

    fn write_vectored(&mut self, bufs: &[io::IoSlice<'_>]) -> io::Result<usize> {
        self.ui
            .multi_progress()
            .suspend(|| io::stderr().write_vectored(bufs))
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.ui
            .multi_progress()
            .suspend(|| io::stderr().write_all(buf))
    }

    fn write_fmt(&mut self, fmt: std::fmt::Arguments<'_>) -> io::Result<()> {
        self.ui
            .multi_progress()
            .suspend(|| io::stderr().write_fmt(fmt))
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SafeStderrWriter {
    type Writer = SafeStderrWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// A single progress bar tracking a whole batch's completion (C3), driven by
/// [`crate::events::Event::Completed`] / [`crate::events::Event::Failed`] /
/// [`crate::events::Event::Progress`].
#[derive(Clone)]
pub struct BatchProgress {
    bar: ProgressBar,
}

impl BatchProgress {
    /// Build a progress bar for `total` requests.
    pub fn new(ui: &Ui, total: usize) -> Self {
        let bar = ui.new_progress_bar(
            &ProgressConfig {
                emoji: "🚀",
                msg: "Running LLM requests",
                done_msg: "Ran LLM requests",
            },
            total as u64,
        );
        Self { bar }
    }

    /// Update the bar from one batch-level event. Non-terminal, non-progress
    /// events are ignored.
    pub fn on_event(&self, event: &crate::events::Event) {
        use crate::events::Event;
        match event {
            Event::Completed { .. } | Event::Failed { .. } => {
                self.bar.inc(1);
            }
            Event::Progress { done, total } => {
                self.bar.set_length(*total as u64);
                self.bar.set_position(*done as u64);
            }
            _ => {}
        }
    }

    /// Finish the bar, leaving its "done" message visible.
    pub fn finish(&self) {
        self.bar.finish();
    }
}

/// Per-agent state tracked by [`AgentBoard`] (§4.5 "Progress aggregation"),
/// mirroring the source's `AgentState`.
struct AgentState {
    status: AgentStatus,
    current_iteration: u32,
    max_iterations: u32,
    last_tool: String,
    total_tokens: u64,
    total_cost_usd: f64,
    started_at: std::time::Instant,
    completed_at: Option<std::time::Instant>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum AgentStatus {
    Searching,
    Found,
    NotFound,
}

impl AgentStatus {
    fn label(self) -> &'static str {
        match self {
            AgentStatus::Searching => "searching",
            AgentStatus::Found => "found",
            AgentStatus::NotFound => "not_found",
        }
    }
}

/// Multi-agent progress display (C5): shows at most `max_visible_agents`
/// agents at once — running agents first (oldest start time first), then
/// most-recently-completed — and keeps a completed agent visible for
/// `completed_agent_display_seconds` before it's replaced by a still-running
/// one (§4.5 "Visibility policy").
pub struct AgentBoard {
    max_visible_agents: usize,
    completed_agent_display_seconds: f64,
    agents: std::sync::Mutex<std::collections::HashMap<String, AgentState>>,
    slots: Vec<ProgressBar>,
    main: ProgressBar,
}

impl AgentBoard {
    /// Build a board for `total_agents`, showing up to `max_visible_agents`
    /// at once.
    pub fn new(ui: &Ui, total_agents: usize, max_visible_agents: usize, completed_agent_display_seconds: f64) -> Self {
        let main = ui.new_progress_bar(
            &ProgressConfig {
                emoji: "🕵️",
                msg: "Running agents",
                done_msg: "Ran agents",
            },
            total_agents as u64,
        );
        let slots = (0..max_visible_agents.max(1))
            .map(|_| {
                let bar = ui.multi_progress().add(ProgressBar::new_spinner());
                bar.set_style(default_spinner_style());
                #[cfg(test)]
                bar.set_draw_target(ProgressDrawTarget::hidden());
                bar
            })
            .collect();
        Self {
            max_visible_agents: max_visible_agents.max(1),
            completed_agent_display_seconds,
            agents: std::sync::Mutex::new(std::collections::HashMap::new()),
            slots,
            main,
        }
    }

    /// Register an agent before it starts running.
    pub fn register(&self, agent_id: &str, max_iterations: u32) {
        let mut agents = self.agents.lock().expect("agent board lock poisoned");
        agents.insert(
            agent_id.to_owned(),
            AgentState {
                status: AgentStatus::Searching,
                current_iteration: 0,
                max_iterations,
                last_tool: String::new(),
                total_tokens: 0,
                total_cost_usd: 0.0,
                started_at: std::time::Instant::now(),
                completed_at: None,
            },
        );
    }

    /// Update state from one event and re-render the visible slots.
    ///
    /// The two-event pattern (`AgentComplete` then `AgentStatusFinal`)
    /// avoids double-counting: the main bar advances only on
    /// `AgentStatusFinal`.
    pub fn on_event(&self, event: &crate::events::Event) {
        use crate::events::Event;
        {
            let mut agents = self.agents.lock().expect("agent board lock poisoned");
            match event {
                Event::IterationStart { agent_id, iteration } => {
                    if let Some(agent) = agents.get_mut(agent_id) {
                        agent.current_iteration = *iteration;
                    }
                }
                Event::ToolCall { agent_id, call, .. } => {
                    if let Some(agent) = agents.get_mut(agent_id) {
                        agent.last_tool = format_tool_call(&call.name, &call.arguments);
                    }
                }
                Event::IterationComplete { agent_id, total_tokens, total_cost_usd, .. } => {
                    if let Some(agent) = agents.get_mut(agent_id) {
                        agent.total_tokens = *total_tokens;
                        agent.total_cost_usd = *total_cost_usd;
                    }
                }
                Event::AgentStatusFinal { agent_id, status } => {
                    if let Some(agent) = agents.get_mut(agent_id) {
                        agent.status = if status == "found" { AgentStatus::Found } else { AgentStatus::NotFound };
                        agent.completed_at = Some(std::time::Instant::now());
                    }
                    self.main.inc(1);
                }
                _ => {}
            }
        }
        self.render();
    }

    /// Re-render the visible slot bars from current agent state. Safe to
    /// call on a timer even with no new events, so completed agents age out
    /// after `completed_agent_display_seconds` even without a fresh event.
    pub fn render(&self) {
        let agents = self.agents.lock().expect("agent board lock poisoned");
        let now = std::time::Instant::now();

        let mut visible: Vec<(&String, &AgentState)> = agents
            .iter()
            .filter(|(_, agent)| match agent.completed_at {
                None => true,
                Some(completed_at) => now.duration_since(completed_at).as_secs_f64() < self.completed_agent_display_seconds,
            })
            .collect();

        visible.sort_by(|(_, a), (_, b)| match (a.completed_at, b.completed_at) {
            (None, None) => a.started_at.cmp(&b.started_at),
            (None, Some(_)) => std::cmp::Ordering::Less,
            (Some(_), None) => std::cmp::Ordering::Greater,
            (Some(ca), Some(cb)) => cb.cmp(&ca),
        });
        visible.truncate(self.max_visible_agents);

        for (slot, agent) in self.slots.iter().zip(visible.iter()) {
            let (agent_id, state) = *agent;
            slot.set_message(render_agent_line(agent_id, state));
            slot.tick();
        }
        for slot in self.slots.iter().skip(visible.len()) {
            slot.set_message(String::new());
        }
    }

    /// Finish the board, clearing the per-agent slots and leaving only the
    /// main summary bar.
    pub fn finish(&self) {
        for slot in &self.slots {
            slot.finish_and_clear();
        }
        self.main.finish();
    }
}

fn render_agent_line(agent_id: &str, state: &AgentState) -> String {
    format!(
        "{agent_id} [{status}] iter {iter}/{max_iter} {tool} {tokens}tok ${cost:.4}",
        status = state.status.label(),
        iter = state.current_iteration,
        max_iter = state.max_iterations,
        tool = state.last_tool,
        tokens = state.total_tokens,
        cost = state.total_cost_usd,
    )
}

/// A short, human-readable rendering of a tool call's arguments, mirroring
/// the source's single-arg-or-ellipsis heuristic.
fn format_tool_call(tool_name: &str, raw_arguments: &str) -> String {
    let args_str = match serde_json::from_str::<Value>(raw_arguments) {
        Ok(Value::Object(map)) if map.is_empty() => "()".to_owned(),
        Ok(Value::Object(map)) if map.len() == 1 => {
            let (_, value) = map.iter().next().expect("checked len == 1");
            match value {
                Value::String(s) if s.len() < 20 => format!("({s})"),
                Value::Number(n) => format!("({n})"),
                _ => "(...)".to_owned(),
            }
        }
        _ => "(...)".to_owned(),
    };
    format!("{tool_name}{args_str}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{events::Event, model::ToolCall};

    #[test]
    fn batch_progress_advances_on_terminal_events() {
        let ui = Ui::init_for_tests();
        let progress = BatchProgress::new(&ui, 2);
        progress.on_event(&Event::Completed { request_id: "r1".into(), total_tokens: 10, cost_usd: 0.01 });
        progress.on_event(&Event::Failed {
            request_id: "r2".into(),
            error_kind: "timeout".into(),
            error_message: "boom".into(),
        });
        assert_eq!(progress.bar.position(), 2);
    }

    #[test]
    fn agent_board_counts_status_final_once() {
        let ui = Ui::init_for_tests();
        let board = AgentBoard::new(&ui, 2, 1, 3.0);
        board.register("a1", 15);
        board.register("a2", 15);

        board.on_event(&Event::ToolCall {
            agent_id: "a1".into(),
            iteration: 1,
            call: ToolCall { id: "c1".into(), name: "search".into(), arguments: "{\"q\":\"foo\"}".into() },
        });
        board.on_event(&Event::AgentStatusFinal { agent_id: "a1".into(), status: "found".into() });
        board.on_event(&Event::AgentStatusFinal { agent_id: "a2".into(), status: "not_found".into() });

        assert_eq!(board.main.position(), 2);
    }

    #[test]
    fn format_tool_call_summarizes_single_short_arg() {
        assert_eq!(format_tool_call("search", "{\"query\":\"whales\"}"), "search(whales)");
        assert_eq!(format_tool_call("search", "{}"), "search()");
        assert_eq!(
            format_tool_call("search", "{\"a\":1,\"b\":2}"),
            "search(...)"
        );
    }
}
