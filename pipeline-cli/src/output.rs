// Terminal output
// ANSI-colored progress lines on stderr; the final report goes to stdout

use pipeline_engine::execution::status_marker;
use pipeline_engine::Status;

fn color(status: Status) -> &'static str {
    match status {
        Status::Succeeded => "32",
        Status::SucceededWithIssues => "33",
        Status::Failed => "31",
        Status::Canceled => "35",
        Status::Skipped | Status::Pending | Status::Running => "2",
    }
}

/// Right-aligned bold action word, then the message
pub fn status(action: &str, message: &str) {
    eprintln!("\x1b[1;36m{:>12}\x1b[0m {}", action, message);
}

pub fn check(message: &str) {
    eprintln!("\x1b[32m  \u{2713}\x1b[0m {}", message);
}

pub fn warning(message: &str) {
    eprintln!("\x1b[33m  !\x1b[0m {}", message);
}

pub fn error(message: &str) {
    eprintln!("\x1b[1;31merror:\x1b[0m {}", message);
}

pub fn info(message: &str) {
    eprintln!("\x1b[36m  i\x1b[0m {}", message);
}

pub fn dim(message: &str) {
    eprintln!("\x1b[2m{}\x1b[0m", message);
}

pub fn header(message: &str) {
    eprintln!("\x1b[1m==> {}\x1b[0m", message);
}

pub fn stage_header(name: &str, total_jobs: usize) {
    eprintln!("\x1b[1;34m  Stage\x1b[0m '{}' ({} jobs)", name, total_jobs);
}

/// A node that reached a terminal status, indented to its depth
pub fn completed(indent: usize, label: &str, status: Status, seconds: f64, extra: &str) {
    eprintln!(
        "{}\x1b[{}m{} {} {}\x1b[0m ({:.2}s){}",
        " ".repeat(indent),
        color(status),
        status_marker(status),
        label,
        status,
        seconds,
        extra
    );
}

pub fn step_output(line: &str, is_error: bool) {
    if is_error {
        eprintln!("\x1b[31m        | {}\x1b[0m", line);
    } else {
        eprintln!("        | {}", line);
    }
}

/// Closing line of a run, colored by its aggregate status
pub fn outcome(pipeline: &str, status: Status, seconds: f64) {
    eprintln!(
        "\x1b[1;{}m{} Pipeline '{}' {}\x1b[0m in {:.2}s",
        color(status),
        status_marker(status),
        pipeline,
        status,
        seconds
    );
}
