// Append-only feedback log: free-text reflections and misclassification reports

use crate::error::FeedbackError;
use chrono::{Local, NaiveDateTime};
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::info;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const THOUGHTS_FILE: &str = "data.txt";
const REPORTS_FILE: &str = "analyze.txt";

/// One "the analysis was wrong" report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MisclassificationReport {
    /// `None` when the line carried no parseable timestamp.
    pub submitted_at: Option<NaiveDateTime>,
    pub student_id: String,
    pub incorrect_label: String,
    pub reason: String,
}

impl MisclassificationReport {
    /// Parses a report line. Anything that does not look like one gives `None`.
    pub fn parse_line(line: &str) -> Option<Self> {
        let line = line.trim();
        let submitted_at = line
            .strip_prefix('[')
            .and_then(|rest| rest.split_once(']'))
            .and_then(|(ts, _)| NaiveDateTime::parse_from_str(ts, TIMESTAMP_FORMAT).ok());

        let mut parts = line.split('|');
        let student_id = field_after(parts.next()?, "Student:")?;
        let incorrect_label = field_after(parts.next()?, "Incorrect Analysis:")?;
        let reason = field_after(parts.next()?, "Reason:")?;

        Some(Self {
            submitted_at,
            student_id,
            incorrect_label,
            reason,
        })
    }
}

fn field_after(part: &str, key: &str) -> Option<String> {
    part.split_once(key)
        .map(|(_, value)| value.trim().to_string())
}

fn require(value: &str, field: &'static str) -> Result<(), FeedbackError> {
    if value.trim().is_empty() {
        Err(FeedbackError::EmptyField(field))
    } else {
        Ok(())
    }
}

/// Report fields stay on one line so the file stays one report per line.
fn single_line(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Flat-file store for user feedback, rooted at one directory.
#[derive(Debug, Clone)]
pub struct FeedbackLog {
    dir: PathBuf,
}

impl FeedbackLog {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn thoughts_path(&self) -> PathBuf {
        self.dir.join(THOUGHTS_FILE)
    }

    pub fn reports_path(&self) -> PathBuf {
        self.dir.join(REPORTS_FILE)
    }

    fn append(&self, path: &Path, entry: &str) -> Result<(), FeedbackError> {
        std::fs::create_dir_all(&self.dir)?;
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(entry.as_bytes())?;
        Ok(())
    }

    fn read(path: PathBuf) -> Result<String, FeedbackError> {
        std::fs::read_to_string(&path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => FeedbackError::Missing(path),
            _ => FeedbackError::Io(e),
        })
    }

    fn timestamp() -> String {
        Local::now().format(TIMESTAMP_FORMAT).to_string()
    }

    /// Appends a free-text reflection as `[timestamp] text`.
    pub fn submit_thought(&self, text: &str) -> Result<(), FeedbackError> {
        require(text, "thought")?;
        let entry = format!("[{}] {}\n", Self::timestamp(), text);
        self.append(&self.thoughts_path(), &entry)?;
        info!("Recorded reflection ({} bytes)", text.len());
        Ok(())
    }

    /// Appends a misclassification report.
    pub fn submit_report(
        &self,
        student_id: &str,
        incorrect_label: &str,
        reason: &str,
    ) -> Result<(), FeedbackError> {
        require(student_id, "student id")?;
        require(incorrect_label, "incorrect analysis")?;
        require(reason, "reason")?;

        let entry = format!(
            "[{}] Student: {} | Incorrect Analysis: {} | Reason: {}\n",
            Self::timestamp(),
            single_line(student_id),
            single_line(incorrect_label),
            single_line(reason)
        );
        self.append(&self.reports_path(), &entry)?;
        info!("Recorded misclassification report from {}", student_id.trim());
        Ok(())
    }

    /// Raw content of the reflections file.
    pub fn read_thoughts(&self) -> Result<String, FeedbackError> {
        Self::read(self.thoughts_path())
    }

    /// Every well-formed report, in file order. Malformed lines are skipped.
    pub fn read_reports(&self) -> Result<Vec<MisclassificationReport>, FeedbackError> {
        let content = Self::read(self.reports_path())?;
        Ok(content
            .lines()
            .filter_map(MisclassificationReport::parse_line)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, TempDir};

    /// A log whose directory does not exist yet, inside a fresh temp dir.
    fn scratch_log() -> (TempDir, FeedbackLog) {
        let scratch = tempdir().unwrap();
        let log = FeedbackLog::new(scratch.path().join("feedback"));
        (scratch, log)
    }

    #[test]
    fn reports_round_trip() {
        let (_scratch, log) = scratch_log();
        log.submit_report("20231234", "Angry", "I was just\nconcentrating")
            .unwrap();
        log.submit_report(" 42 ", "Sad", "Lighting").unwrap();

        let reports = log.read_reports().unwrap();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].student_id, "20231234");
        assert_eq!(reports[0].incorrect_label, "Angry");
        assert_eq!(reports[0].reason, "I was just concentrating");
        assert!(reports[0].submitted_at.is_some());
        assert_eq!(reports[1].student_id, "42");
    }

    #[test]
    fn empty_fields_are_rejected() {
        let (_scratch, log) = scratch_log();
        assert!(matches!(
            log.submit_report("1", "  ", "why"),
            Err(FeedbackError::EmptyField("incorrect analysis"))
        ));
        assert!(matches!(
            log.submit_thought("\n\t"),
            Err(FeedbackError::EmptyField("thought"))
        ));
        assert!(!log.reports_path().exists());
        assert!(!log.thoughts_path().exists());
    }

    #[test]
    fn malformed_report_lines_are_skipped() {
        let (_scratch, log) = scratch_log();
        std::fs::create_dir_all(&log.dir).unwrap();
        std::fs::write(
            log.reports_path(),
            "garbage\n\
             [2024-05-01 09:30:00] Student: 7 | Incorrect Analysis: Fear | Reason: smiling\n\
             [2024-05-01 09:31:00] Student: 8 | Reason: missing label\n\
             Student: 9 | Incorrect Analysis: Happy | Reason: no timestamp\n",
        )
        .unwrap();

        let reports = log.read_reports().unwrap();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].student_id, "7");
        assert_eq!(
            reports[0].submitted_at,
            NaiveDateTime::parse_from_str("2024-05-01 09:30:00", TIMESTAMP_FORMAT).ok()
        );
        assert_eq!(reports[1].reason, "no timestamp");
        assert_eq!(reports[1].submitted_at, None);
    }

    #[test]
    fn missing_files_are_distinct_from_empty_ones() {
        let (_scratch, log) = scratch_log();
        assert!(matches!(log.read_thoughts(), Err(FeedbackError::Missing(_))));
        assert!(matches!(log.read_reports(), Err(FeedbackError::Missing(_))));

        std::fs::create_dir_all(&log.dir).unwrap();
        std::fs::write(log.reports_path(), "").unwrap();
        assert!(log.read_reports().unwrap().is_empty());
    }

    #[test]
    fn thoughts_keep_their_raw_text() {
        let (_scratch, log) = scratch_log();
        log.submit_thought("Machines read faces,\nnot feelings.").unwrap();

        let content = log.read_thoughts().unwrap();
        assert!(content.starts_with('['));
        assert!(content.ends_with("] Machines read faces,\nnot feelings.\n"));
    }
}
