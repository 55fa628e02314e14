//! CLI output formatting

use crate::core::{PlanExecution, Status};
use crate::execution::ExecutionEvent;
use console::Emoji;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;
use uuid::Uuid;

// Re-export style
pub use console::style;

// Emojis for output
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "✓ ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "✗ ");
pub static SPINNER: Emoji<'_, '_> = Emoji("⏳ ", "~ ");
pub static INFO: Emoji<'_, '_> = Emoji("ℹ️  ", "i ");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "!");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "> ");
pub static HAND: Emoji<'_, '_> = Emoji("✋ ", "# ");

/// Create a spinner shown while a plan runs
pub fn create_spinner(message: impl Into<String>) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    if let Ok(template) = ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {msg}") {
        spinner.set_style(template);
    }
    spinner.set_message(message.into());
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner
}

fn short_id(id: &Uuid) -> String {
    id.to_string()[..8].to_string()
}

/// Format a status for display
pub fn format_status(status: Status) -> String {
    let text = status.as_str();
    match status {
        Status::Succeeded => style(text).green().to_string(),
        Status::IgnoreFailed => style(text).green().dim().to_string(),
        Status::Failed | Status::Errored | Status::ApprovalRejected => style(text).red().to_string(),
        Status::Expired | Status::Aborted | Status::Discontinuing => style(text).yellow().to_string(),
        Status::Queued => style(text).dim().to_string(),
        Status::Running => style(text).cyan().to_string(),
        Status::AsyncWaiting | Status::TaskWaiting | Status::ApprovalWaiting | Status::InterventionWaiting => {
            style(text).blue().to_string()
        }
    }
}

/// One-line summary of a plan execution
pub fn format_execution_summary(execution: &PlanExecution) -> String {
    let icon = if execution.status.is_positive() {
        CHECK
    } else if execution.status.is_final() {
        CROSS
    } else {
        SPINNER
    };

    format!(
        "{} {} - {} - {} - {}",
        icon,
        style(short_id(&execution.id)).dim(),
        style(&execution.plan_id).bold(),
        style(&execution.pipeline_id).cyan(),
        format_status(execution.status)
    )
}

/// Format an execution event for display
pub fn format_execution_event(event: &ExecutionEvent) -> String {
    match event {
        ExecutionEvent::PlanQueued {
            plan_execution_id,
            pipeline_id,
        } => format!(
            "{} Plan execution {} queued behind pipeline {}",
            SPINNER,
            style(short_id(plan_execution_id)).dim(),
            style(pipeline_id).bold()
        ),
        ExecutionEvent::PlanStarted {
            plan_execution_id,
            plan_id,
        } => format!(
            "{} Starting plan {} ({})",
            ROCKET,
            style(plan_id).bold(),
            style(short_id(plan_execution_id)).dim()
        ),
        ExecutionEvent::NodeStarted { setup_id, attempt, .. } => {
            if *attempt > 0 {
                format!("{} {} (retry {})", SPINNER, style(setup_id).cyan(), style(attempt).dim())
            } else {
                format!("{} {}", SPINNER, style(setup_id).cyan())
            }
        }
        ExecutionEvent::NodeStatusChanged {
            node_execution_id,
            from,
            to,
            ..
        } => format!(
            "   {} {} → {}",
            style(short_id(node_execution_id)).dim(),
            format_status(*from),
            format_status(*to)
        ),
        ExecutionEvent::NodeAdvised {
            setup_id,
            status,
            advise_type,
            ..
        } => {
            let icon = if status.is_positive() { CHECK } else { CROSS };
            format!(
                "{} {} {} ({})",
                icon,
                style(setup_id).bold(),
                format_status(*status),
                style(advise_type).dim()
            )
        }
        ExecutionEvent::NodeRetryScheduled {
            setup_id,
            attempt,
            wait_interval_secs,
            ..
        } => format!(
            "{} {} retry {} in {}s",
            WARN,
            style(setup_id).yellow(),
            attempt,
            wait_interval_secs
        ),
        ExecutionEvent::InterventionWaiting {
            setup_id,
            timeout_secs,
            repair_action_code,
            ..
        } => format!(
            "{} {} waiting for intervention ({}s, then {:?})",
            HAND,
            style(setup_id).yellow(),
            timeout_secs,
            repair_action_code
        ),
        ExecutionEvent::StatusCorrected {
            node_execution_id,
            from,
            to,
            ..
        } => format!(
            "{} {} corrected {} → {}",
            INFO,
            style(short_id(node_execution_id)).dim(),
            format_status(*from),
            format_status(*to)
        ),
        ExecutionEvent::InterruptProcessed {
            interrupt_type, state, ..
        } => format!("{} Interrupt {} {:?}", INFO, style(interrupt_type).bold(), state),
        ExecutionEvent::ApprovalFinalized {
            node_execution_id,
            status,
            attempts,
            ..
        } => format!(
            "{} {} approval {:?} after {} poll(s)",
            INFO,
            style(short_id(node_execution_id)).dim(),
            status,
            attempts
        ),
        ExecutionEvent::PlanCompleted {
            plan_execution_id,
            status,
        } => format!(
            "{} Plan execution ({}) finished {}",
            if status.is_positive() { CHECK } else { CROSS },
            style(short_id(plan_execution_id)).dim(),
            format_status(*status)
        ),
    }
}

pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
