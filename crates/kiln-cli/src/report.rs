//! Run report rendering.

use crate::config::OutputFormat;
use console::style;
use kiln_core::run::{JobResult, JobStatus, PipelineResult, PipelineStatus, StepStatus};
use std::fmt::Write;

/// Output lines shown for a failed step in the table report.
const FAILURE_TAIL_LINES: usize = 20;

pub fn render(result: &PipelineResult, format: OutputFormat) -> Result<String, Box<dyn std::error::Error>> {
    match format {
        OutputFormat::Table => Ok(render_table(result)),
        OutputFormat::Json => Ok(serde_json::to_string_pretty(result)?),
        OutputFormat::Yaml => Ok(serde_yaml::to_string(result)?),
    }
}

fn render_table(result: &PipelineResult) -> String {
    let mut out = String::new();
    let width = result.jobs.iter().map(|j| j.name.len()).max().unwrap_or(0);

    let _ = writeln!(
        out,
        "{} {} {}",
        style("Pipeline").bold(),
        style(result.pipeline.as_deref().unwrap_or("(unnamed)")).bold(),
        style(result.run_id).dim()
    );

    for job in &result.jobs {
        let _ = writeln!(
            out,
            "  {} {:<width$}  {:<9}  {}",
            job_icon(job.status),
            job.name,
            job.status.as_str(),
            style(job.duration_ms().map(format_duration).unwrap_or_default()).dim(),
            width = width
        );
        render_steps(&mut out, job);
    }

    let count = |status: JobStatus| result.jobs.iter().filter(|j| j.status == status).count();
    let _ = writeln!(
        out,
        "\nResult: {} ({} succeeded, {} failed, {} skipped, {} cancelled) in {}",
        match result.status {
            PipelineStatus::Success => style(result.status.as_str()).green().bold(),
            PipelineStatus::Cancelled => style(result.status.as_str()).yellow().bold(),
            PipelineStatus::Failure => style(result.status.as_str()).red().bold(),
        },
        count(JobStatus::Success),
        count(JobStatus::Failure),
        count(JobStatus::Skipped),
        count(JobStatus::Cancelled),
        format_duration(result.duration_ms())
    );
    out
}

fn render_steps(out: &mut String, job: &JobResult) {
    for step in &job.steps {
        let detail = match (step.status, step.exit_code, &step.error) {
            (StepStatus::Failure, _, Some(error)) => format!(" ({})", error),
            (StepStatus::Failure, Some(code), None) => format!(" (exit {})", code),
            _ => String::new(),
        };
        let _ = writeln!(out, "      {} {}{}", step_icon(step.status), step.name, style(detail).dim());

        if step.status == StepStatus::Failure && !step.output.is_empty() {
            let lines: Vec<&str> = step.output.lines().collect();
            let start = lines.len().saturating_sub(FAILURE_TAIL_LINES);
            if start > 0 {
                let _ = writeln!(out, "        {}", style(format!("... {} lines omitted", start)).dim());
            }
            for line in &lines[start..] {
                let _ = writeln!(out, "        {} {}", style("|").dim(), line);
            }
        }
    }
    if let Some(error) = &job.error {
        let _ = writeln!(out, "      {} {}", style("error:").red(), error);
    }
}

fn job_icon(status: JobStatus) -> console::StyledObject<&'static str> {
    match status {
        JobStatus::Success => style("✓").green(),
        JobStatus::Failure => style("✗").red(),
        JobStatus::Cancelled => style("⊘").yellow(),
        JobStatus::Skipped => style("-").dim(),
        JobStatus::Pending | JobStatus::Running => style("…").dim(),
    }
}

fn step_icon(status: StepStatus) -> console::StyledObject<&'static str> {
    match status {
        StepStatus::Success => style("✓").green(),
        StepStatus::Failure => style("✗").red(),
        StepStatus::Cancelled => style("⊘").yellow(),
        StepStatus::Skipped => style("-").dim(),
        StepStatus::Pending | StepStatus::Running => style("…").dim(),
    }
}

fn format_duration(ms: i64) -> String {
    if ms < 1000 {
        format!("{}ms", ms)
    } else {
        format!("{:.1}s", ms as f64 / 1000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::RunId;
    use kiln_core::run::{FailureKind, StepResult};

    fn result() -> PipelineResult {
        let mut failed_step = StepResult::skipped(0, "cargo fmt --check");
        failed_step.status = StepStatus::Failure;
        failed_step.failure = Some(FailureKind::StepFailure);
        failed_step.exit_code = Some(1);
        failed_step.output = "Diff in src/main.rs\n".into();

        let fmt = JobResult {
            name: "fmt".into(),
            status: JobStatus::Failure,
            failure: Some(FailureKind::StepFailure),
            error: Some("step `cargo fmt --check` exited with code 1".into()),
            steps: vec![failed_step],
            started_at: None,
            ended_at: None,
        };
        let check = JobResult::not_run("check", JobStatus::Skipped, ["cargo check"]);

        PipelineResult::new(RunId::new(), vec![check, fmt], false, chrono::Utc::now())
            .with_pipeline_name(Some("ci".into()))
    }

    #[test]
    fn test_table_report() {
        let table = render(&result(), OutputFormat::Table).unwrap();
        assert!(table.contains("ci"));
        assert!(table.contains("fmt"));
        assert!(table.contains("cargo fmt --check"));
        assert!(table.contains("Diff in src/main.rs"));
        assert!(table.contains("0 succeeded, 1 failed, 1 skipped, 0 cancelled"));
    }

    #[test]
    fn test_json_report_parses_back() {
        let original = result();
        let json = render(&original, OutputFormat::Json).unwrap();
        let parsed: PipelineResult = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn test_yaml_report() {
        let yaml = render(&result(), OutputFormat::Yaml).unwrap();
        assert!(yaml.contains("status: failure"));
        assert!(yaml.contains("name: fmt"));
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(250), "250ms");
        assert_eq!(format_duration(1500), "1.5s");
    }
}
