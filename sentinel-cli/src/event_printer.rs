//! Prints lifecycle events to the terminal, styled the way
//! `exec/src/event_processor.rs` styles exec/patch events: a timestamp
//! prefix, color reserved exclusively for `.style()` calls so `--color
//! never` is honored everywhere.

use chrono::Utc;
use owo_colors::OwoColorize;
use owo_colors::Style;
use sentinel_core::EventMsg;
use sentinel_core::protocol::Event;

pub struct EventPrinter {
    bold: Style,
    dimmed: Style,
    magenta: Style,
    red: Style,
    green: Style,
    yellow: Style,
}

macro_rules! ts_println {
    ($($arg:tt)*) => {{
        let now = Utc::now();
        print!("[{}] ", now.format("%Y-%m-%dT%H:%M:%S"));
        println!($($arg)*);
    }};
}

impl EventPrinter {
    pub fn new(with_ansi: bool) -> Self {
        if with_ansi {
            EventPrinter {
                bold: Style::new().bold(),
                dimmed: Style::new().dimmed(),
                magenta: Style::new().magenta(),
                red: Style::new().red(),
                green: Style::new().green(),
                yellow: Style::new().yellow(),
            }
        } else {
            EventPrinter {
                bold: Style::new(),
                dimmed: Style::new(),
                magenta: Style::new(),
                red: Style::new(),
                green: Style::new(),
                yellow: Style::new(),
            }
        }
    }

    pub fn print(&self, event: &Event) {
        match &event.msg {
            EventMsg::CycleStarted { cycle_id, goal, turn_index, .. } => {
                ts_println!(
                    "{} {} (turn {turn_index}, cycle {cycle_id})",
                    "cycle started:".style(self.bold),
                    goal
                );
            }
            EventMsg::AgentCurating { .. } => {
                ts_println!("{}", "curating context...".style(self.dimmed));
            }
            EventMsg::AgentAwaitingContext { bundle_path, .. } => {
                ts_println!(
                    "{} {bundle_path}",
                    "awaiting approval of context bundle:".style(self.yellow)
                );
            }
            EventMsg::AgentAwaitingProposal { bundle_path, change_count, .. } => {
                ts_println!(
                    "{} {bundle_path} ({change_count} change(s))",
                    "awaiting approval of proposal:".style(self.yellow)
                );
            }
            EventMsg::CycleApplying { change_count, checkpoint_id, .. } => {
                ts_println!(
                    "{} {change_count} change(s) (checkpoint {checkpoint_id})",
                    "applying:".style(self.magenta)
                );
            }
            EventMsg::CycleVerifying { .. } => {
                ts_println!("{}", "verifying...".style(self.dimmed));
            }
            EventMsg::CycleCommitted { version_id, .. } => {
                ts_println!("{} {version_id}", "committed:".style(self.green));
            }
            EventMsg::CycleRolledBack { reason, .. } => {
                ts_println!("{} {reason}", "rolled back:".style(self.red));
            }
            EventMsg::CycleDone { duration_ms, summary, .. } => {
                ts_println!("{} {summary} ({duration_ms}ms)", "done:".style(self.green));
            }
            EventMsg::CycleFailed { duration_ms, summary, .. } => {
                ts_println!("{} {summary} ({duration_ms}ms)", "failed:".style(self.red));
            }
            EventMsg::CycleCancelled { duration_ms, .. } => {
                ts_println!("{} ({duration_ms}ms)", "cancelled".style(self.red));
            }
            EventMsg::ApprovalPending { action_label, .. } => {
                ts_println!(
                    "{} {action_label} [approve / reject <reason> / cancel]",
                    "approval requested:".style(self.bold)
                );
            }
            EventMsg::ApprovalResolved { outcome, reason, .. } => {
                let reason = reason.as_deref().unwrap_or("");
                ts_println!("{} {outcome:?} {reason}", "approval resolved:".style(self.dimmed));
            }
        }
    }
}
