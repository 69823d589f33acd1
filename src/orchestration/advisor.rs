//! Creation-time heuristics: urgency score, duration estimate and
//! suggestions.
//!
//! Everything here is a pure function of the new task, the tasks already
//! registered and the current time.

use chrono::{DateTime, Duration, Utc};

use crate::core::task::Task;

/// Ceiling of the priority score.
pub const MAX_SCORE: u32 = 100;

/// Tasks on the same day for the same assignee above which the new task is
/// flagged as an overload.
pub const OVERLOAD_THRESHOLD: usize = 3;

/// Heuristic fields computed for a new task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advice {
    pub priority_score: u8,
    pub estimated_duration_minutes: u32,
    pub suggestions: Vec<String>,
}

/// Compute the advice for `task` given the already registered tasks.
pub fn advise<'a>(task: &Task, existing: impl IntoIterator<Item = &'a Task>, now: DateTime<Utc>) -> Advice {
    let mut suggestions = deadline_suggestions(task, now);

    if task.dependencies().len() > 3 {
        suggestions.push(format!(
            "Task has {} dependencies; consider splitting it or running prerequisites in parallel",
            task.dependencies().len()
        ));
    }

    let same_day = same_day_load(task, existing);
    if same_day > OVERLOAD_THRESHOLD {
        if let Some(assignee) = &task.assignee {
            suggestions.push(format!(
                "{} already has {} tasks due that day; consider redistributing",
                assignee, same_day
            ));
        }
    }

    Advice {
        priority_score: priority_score(task, now),
        estimated_duration_minutes: estimate_duration(&task.task_type),
        suggestions,
    }
}

/// `clamp(0, 100, due-date band + category weight + 10 × dependencies)`.
pub fn priority_score(task: &Task, now: DateTime<Utc>) -> u8 {
    let due_band = match task.due_date {
        Some(due) => {
            let remaining = due - now;
            if remaining <= Duration::days(1) {
                100
            } else if remaining <= Duration::days(7) {
                50
            } else if remaining <= Duration::days(30) {
                20
            } else {
                0
            }
        }
        None => 0,
    };

    let category = match task.category.to_ascii_lowercase().as_str() {
        "ceremony" => 80,
        "reception" => 60,
        "vendor" => 40,
        _ => 0,
    };

    let dependencies = 10 * task.dependencies().len() as u32;
    (due_band + category + dependencies).min(MAX_SCORE) as u8
}

/// Minutes, looked up by task type.
pub fn estimate_duration(task_type: &str) -> u32 {
    match task_type.to_ascii_lowercase().as_str() {
        "reminder" => 2,
        "email" | "notification" => 5,
        "payment" => 15,
        "booking" => 30,
        "document" => 45,
        "meeting" => 60,
        "research" => 120,
        _ => 30,
    }
}

fn deadline_suggestions(task: &Task, now: DateTime<Utc>) -> Vec<String> {
    let Some(due) = task.due_date else {
        return Vec::new();
    };
    if due < now {
        vec!["Task is overdue; reschedule or escalate".to_string()]
    } else if due - now <= Duration::days(3) {
        vec!["Deadline is within 3 days; start soon".to_string()]
    } else {
        Vec::new()
    }
}

/// Existing tasks due on the same UTC calendar day for the same assignee.
fn same_day_load<'a>(task: &Task, existing: impl IntoIterator<Item = &'a Task>) -> usize {
    let (Some(due), Some(assignee)) = (task.due_date, task.assignee.as_deref()) else {
        return 0;
    };
    let day = due.date_naive();
    existing
        .into_iter()
        .filter(|other| other.id != task.id)
        .filter(|other| other.assignee.as_deref() == Some(assignee))
        .filter(|other| other.due_date.map(|d| d.date_naive()) == Some(day))
        .count()
}
