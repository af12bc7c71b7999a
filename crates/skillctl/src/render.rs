//! Output rendering for skillctl.

use skill_core::messages::SkillListPayload;
use skill_core::types::{PassOutcome, PassReport, SchedulerSnapshot};
use skill_core::Message;

use crate::client::StatusResponse;

/// Print skills in tabular format.
pub fn print_skill_list(list: &SkillListPayload) {
    if list.skills.is_empty() {
        println!("No skills found.");
        return;
    }

    println!(
        "{:<32}  {:<9}  {:<6}  {:<6}  {:<6}",
        "SKILL", "INSTALLED", "ACTIVE", "LOADED", "PINNED"
    );
    println!("{}", "-".repeat(67));

    for skill in list.skills.values() {
        println!(
            "{:<32}  {:<9}  {:<6}  {:<6}  {:<6}",
            truncate(&skill.id, 32),
            yes_no(skill.installed),
            yes_no(skill.active),
            yes_no(skill.loaded),
            yes_no(skill.pinned),
        );
    }

    println!();
    println!(
        "{} skill(s), {} installed, {} in catalog",
        list.skills.len(),
        list.installed.len(),
        list.catalog.len()
    );
}

/// Print scheduler state and the last pass.
pub fn print_status(status: &StatusResponse) {
    print_scheduler(&status.scheduler);
    match &status.last_pass {
        Some(report) => {
            println!();
            print_report(report);
        }
        None => {
            println!();
            println!("No pass has run yet.");
        }
    }
}

fn print_scheduler(snapshot: &SchedulerSnapshot) {
    println!("Scheduler: {}", snapshot.phase.as_str());
    println!();
    println!(
        "  Last Download:  {}",
        snapshot
            .last_download
            .as_ref()
            .map_or_else(|| "-".to_string(), format_time)
    );
    println!("  Next Download:  {}", format_time(&snapshot.next_download));
    println!("  Interval:       {}", format_interval(snapshot.update_interval_secs));
    println!("  Passes:         {}", snapshot.passes_completed);
}

/// Print a pass report.
pub fn print_report(report: &PassReport) {
    println!("Pass: {}", report.pass_id);
    println!();
    println!("  Reason:         {}", report.reason.as_str());
    println!("  Outcome:        {}", format_outcome(report.outcome));
    if let Some(error) = &report.error {
        println!("  Error:          {error}");
    }
    println!("  Started:        {}", format_time(&report.started_at));
    println!("  Finished:       {}", format_time(&report.finished_at));

    print_ids("Installed", &report.installed);
    print_ids("Updated", &report.updated);
    print_ids("Removed", &report.removed);
    print_ids("Loaded", &report.loaded);
    print_ids("Unloaded", &report.unloaded);
    print_ids("Missing", &report.missing_priority);

    if report.locks_removed > 0 {
        println!("  Locks Removed:  {}", report.locks_removed);
    }
    if !report.failures.is_empty() {
        println!();
        println!("  Failures:");
        for failure in &report.failures {
            println!("    {:<28}  {}", truncate(&failure.skill, 28), failure.error);
        }
    }
}

/// One line per bus message, for `watch`.
pub fn print_message(msg: &Message) {
    let data = if msg.data.is_null() {
        String::new()
    } else {
        msg.data.to_string()
    };
    println!(
        "{}  {:<36}  {}",
        chrono::Local::now().format("%H:%M:%S"),
        msg.msg_type,
        data
    );
}

fn print_ids(label: &str, ids: &[String]) {
    if !ids.is_empty() {
        println!("  {:<15} {}", format!("{label}:"), ids.join(", "));
    }
}

fn format_outcome(outcome: PassOutcome) -> &'static str {
    match outcome {
        PassOutcome::Completed => "COMPLETED",
        PassOutcome::CatalogFailed => "CATALOG_FAILED",
    }
}

fn format_interval(secs: u64) -> String {
    if secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{secs}s")
    }
}

fn format_time(dt: &chrono::DateTime<chrono::Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{head}...")
    }
}
