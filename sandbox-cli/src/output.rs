//! Terminal rendering of jobs and messages

use colored::*;
use sandbox_core::domain::job::{Job, JobStatus};
use sandbox_core::domain::message::{Message, MessageType};
use sandbox_core::domain::test::{TestReport, TestStatus};

/// Renders one message as terminal lines
pub fn format_message(message: &Message) -> String {
    match message.message_type {
        MessageType::Log => text(message),
        MessageType::Info => text(message).cyan().to_string(),
        MessageType::Warn => text(message).yellow().to_string(),
        MessageType::Error => text(message).red().to_string(),
        MessageType::Debug => text(message).dimmed().to_string(),
        MessageType::Complete => text(message).dimmed().to_string(),
        MessageType::Exception => match message.exception() {
            Some(error) => {
                let mut out = format!("{} {}", "✗".red(), error.to_string().red().bold());
                if let Some(stack) = error.stack {
                    for line in stack.lines().skip(1) {
                        out.push_str(&format!("\n  {}", line.trim().dimmed()));
                    }
                }
                out
            }
            None => text(message).red().to_string(),
        },
        MessageType::Result => {
            let pretty = serde_json::to_string_pretty(&message.payload)
                .unwrap_or_else(|_| message.payload.to_string());
            format!("{}\n{}", "Result:".bold(), pretty)
        }
        MessageType::Test => match message.test_report() {
            Some(report) => format_test(&report),
            None => text(message),
        },
        MessageType::Status => match message.status_report() {
            Some(report) => {
                let mut out = format!("{} {}", "Status:".bold(), colorize_status(&report.status));
                if let Some(error) = report.error {
                    out.push_str(&format!(" ({})", error));
                }
                out
            }
            None => text(message),
        },
    }
}

fn text(message: &Message) -> String {
    match message.text() {
        Some(text) => text.to_string(),
        None => message.payload.to_string(),
    }
}

fn format_test(report: &TestReport) -> String {
    let duration = report
        .duration_ms
        .map(|ms| format!(" ({}ms)", ms).dimmed().to_string())
        .unwrap_or_default();

    match report.status {
        TestStatus::Running => format!("{} {}", "▸".cyan(), report.name.dimmed()),
        TestStatus::Passed => format!("{} {}{}", "✓".green(), report.name, duration),
        TestStatus::Failed => format!(
            "{} {} {}{}",
            "✗".red(),
            report.name,
            report.message.red(),
            duration
        ),
        TestStatus::Skipped => format!("{} {}", "○".dimmed(), report.name.dimmed()),
    }
}

/// Prints a message, sending errors to stderr
pub fn print_message(message: &Message) {
    let line = format_message(message);
    match message.message_type {
        MessageType::Error | MessageType::Exception => eprintln!("{}", line),
        _ => println!("{}", line),
    }
}

/// Print a job summary
pub fn print_job_summary(job: &Job) {
    println!("  {} Job {}", "▸".cyan(), job.id.dimmed());
    println!("    Status:   {}", colorize_status(&job.status));
    println!(
        "    Created:  {}",
        job.created_at
            .format("%Y-%m-%d %H:%M:%S")
            .to_string()
            .dimmed()
    );
    println!();
}

/// Print detailed job information
pub fn print_job_details(job: &Job) {
    println!("{}", "Job Details:".bold());
    println!("  ID:        {}", job.id.cyan());
    println!("  Status:    {}", colorize_status(&job.status));
    println!("  Created:   {}", job.created_at.format("%Y-%m-%d %H:%M:%S"));
    println!("  Timeout:   {}ms", job.timeout_ms);
    println!("  Testing:   {}", if job.testing { "yes" } else { "no" });

    if let Some(completed) = job.completed_at {
        println!("  Completed: {}", completed.format("%Y-%m-%d %H:%M:%S"));
    }

    if let Some(input) = &job.input {
        println!("\n{}", "Input:".bold());
        println!(
            "{}",
            serde_json::to_string_pretty(input).unwrap_or_else(|_| input.to_string())
        );
    }

    if let Some(error) = &job.error {
        println!("\n{}", "Error:".bold());
        println!("{}", error.red());
    }

    println!("\n{}", "Script:".bold());
    for line in job.script.lines() {
        println!("  {}", line.dimmed());
    }
}

/// Colorize job status for display
pub fn colorize_status(status: &JobStatus) -> ColoredString {
    let status_str = status.as_str();
    match status {
        JobStatus::Pending => status_str.yellow(),
        JobStatus::Running => status_str.cyan(),
        JobStatus::Completed => status_str.green(),
        JobStatus::Failed => status_str.red(),
        JobStatus::Timeout => status_str.red(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandbox_core::domain::message::StatusReport;
    use serde_json::json;

    fn plain(message: &Message) -> String {
        colored::control::set_override(false);
        format_message(message)
    }

    #[test]
    fn test_format_console_and_status() {
        let log = Message::new("j", 1, MessageType::Log, json!("hello"));
        assert_eq!(plain(&log), "hello");

        let status = Message::status("j", 2, &StatusReport::failed("Error: boom"));
        assert_eq!(plain(&status), "Status: failed (Error: boom)");
    }

    #[test]
    fn test_format_exception_with_stack() {
        let payload = json!({
            "name": "Error",
            "message": "boom",
            "stack": "Uncaught Error: boom\n    at <anonymous> (job.js:1)"
        });
        let exception = Message::new("j", 1, MessageType::Exception, payload);
        assert_eq!(plain(&exception), "✗ Error: boom\n  at <anonymous> (job.js:1)");
    }

    #[test]
    fn test_format_test_report() {
        let report = TestReport {
            status: TestStatus::Passed,
            name: "adds".to_string(),
            message: "Test passed".to_string(),
            event_timestamp: 0,
            duration_ms: Some(3),
        };
        let message = Message::new("j", 1, MessageType::Test, serde_json::to_value(&report).unwrap());
        assert_eq!(plain(&message), "✓ adds (3ms)");
    }

    #[test]
    fn test_format_result() {
        let result = Message::new("j", 1, MessageType::Result, json!({"n": 1}));
        assert_eq!(plain(&result), "Result:\n{\n  \"n\": 1\n}");
    }
}
