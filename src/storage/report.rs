//! Session report sink.
//!
//! Terminal sessions are announced exactly once; the CSV sink writes one
//! report file per session with a commented metadata header followed by one
//! row per result. Repeat notifications are idempotent: the file name is
//! deterministic per session and an existing report is left untouched.

use crate::error::{PdtError, PdtResult};
use crate::model::{TestResult, TestSession};
use async_trait::async_trait;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

/// Notified when a session reaches a terminal state.
#[async_trait]
pub trait ReportSink: Send + Sync {
    /// Emit the session report. Called once per session; must be idempotent
    /// on repeats.
    async fn on_session_terminal(
        &self,
        session: &TestSession,
        results: &[TestResult],
    ) -> PdtResult<()>;
}

/// Sink that drops everything (reporting disabled).
pub struct NoopReportSink;

#[async_trait]
impl ReportSink for NoopReportSink {
    async fn on_session_terminal(
        &self,
        _session: &TestSession,
        _results: &[TestResult],
    ) -> PdtResult<()> {
        Ok(())
    }
}

/// CSV report writer.
pub struct CsvReportSink {
    output_dir: PathBuf,
}

impl CsvReportSink {
    /// Write reports under `output_dir` (created on demand).
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    fn report_path(&self, session: &TestSession) -> PathBuf {
        let file_name = format!("{}_{}.csv", session.serial_number, session.id);
        self.output_dir.join(file_name)
    }
}

#[async_trait]
impl ReportSink for CsvReportSink {
    async fn on_session_terminal(
        &self,
        session: &TestSession,
        results: &[TestResult],
    ) -> PdtResult<()> {
        let path = self.report_path(session);
        if path.exists() {
            tracing::debug!(path = %path.display(), "report already written");
            return Ok(());
        }
        if !self.output_dir.exists() {
            std::fs::create_dir_all(&self.output_dir)
                .map_err(|e| PdtError::Report(e.to_string()))?;
        }

        let mut file =
            File::create(&path).map_err(|e| PdtError::Report(format!("create report: {e}")))?;

        let header = serde_json::json!({
            "session_id": session.id,
            "serial_number": session.serial_number,
            "station_id": session.station_id,
            "status": session.status,
            "final_result": session.final_result,
            "start_time": session.start_time,
            "end_time": session.end_time,
            "total_items": session.total_items,
            "pass_items": session.pass_items,
            "fail_items": session.fail_items,
        });
        let pretty = serde_json::to_string_pretty(&header)
            .map_err(|e| PdtError::Report(e.to_string()))?;
        for line in pretty.lines() {
            writeln!(file, "# {line}").map_err(|e| PdtError::Report(e.to_string()))?;
        }

        let mut writer = csv::Writer::from_writer(file);
        writer
            .write_record([
                "item_no",
                "item_name",
                "measured_value",
                "lower_limit",
                "upper_limit",
                "result",
                "error_message",
                "duration_ms",
                "test_time",
            ])
            .map_err(|e| PdtError::Report(e.to_string()))?;

        for row in results {
            writer
                .write_record(&[
                    row.item_no.to_string(),
                    row.item_name.clone(),
                    row.measured_value.clone(),
                    row.lower_limit.map(|v| v.to_string()).unwrap_or_default(),
                    row.upper_limit.map(|v| v.to_string()).unwrap_or_default(),
                    row.result.to_string(),
                    row.error_message.clone(),
                    row.execution_duration_ms.to_string(),
                    row.test_time.to_rfc3339(),
                ])
                .map_err(|e| PdtError::Report(e.to_string()))?;
        }
        writer
            .flush()
            .map_err(|e| PdtError::Report(e.to_string()))?;

        tracing::info!(path = %path.display(), "session report written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FinalResult, PointResult, SessionStatus, TestSession};
    use chrono::Utc;

    fn terminal_session() -> TestSession {
        let mut session = TestSession::new("SN0042", "st1", None, false);
        session.status = SessionStatus::Completed;
        session.final_result = Some(FinalResult::Pass);
        session.total_items = 1;
        session.pass_items = 1;
        session
    }

    fn row(session: &TestSession) -> TestResult {
        TestResult {
            session_id: session.id,
            test_plan_id: "1".to_string(),
            item_no: 1,
            item_name: "vbat".to_string(),
            measured_value: "12.01".to_string(),
            lower_limit: Some(11.5),
            upper_limit: Some(12.5),
            result: PointResult::Pass,
            error_message: String::new(),
            execution_duration_ms: 17,
            test_time: Utc::now(),
        }
    }

    #[tokio::test]
    async fn writes_header_comment_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CsvReportSink::new(dir.path());
        let session = terminal_session();
        sink.on_session_terminal(&session, &[row(&session)])
            .await
            .unwrap();

        let path = dir
            .path()
            .join(format!("{}_{}.csv", session.serial_number, session.id));
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("# {"));
        assert!(content.contains("SN0042"));
        assert!(content.contains("12.01"));
        assert!(content.contains("PASS"));
    }

    #[tokio::test]
    async fn repeat_notification_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CsvReportSink::new(dir.path());
        let session = terminal_session();
        sink.on_session_terminal(&session, &[row(&session)])
            .await
            .unwrap();
        let path = dir
            .path()
            .join(format!("{}_{}.csv", session.serial_number, session.id));
        let before = std::fs::metadata(&path).unwrap().len();

        // Second notification with different rows must not rewrite the file.
        sink.on_session_terminal(&session, &[]).await.unwrap();
        let after = std::fs::metadata(&path).unwrap().len();
        assert_eq!(before, after);
    }
}
