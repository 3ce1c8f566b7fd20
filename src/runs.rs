use chrono::{SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

static ID_COUNTER: AtomicU64 = AtomicU64::new(1);

const MAX_ADDRESS_CHARS: usize = 500;

const RUN_COLUMNS: &str = "
    id, address, status, current_step, cancel_requested,
    imagery_json, analysis_json, pdf_url, metadata_json, error_message,
    created_at, updated_at
";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Queued => 0,
            Self::Processing => 1,
            Self::Completed | Self::Failed | Self::Cancelled => 2,
        }
    }

    /// Status only moves forward, and nothing leaves a terminal status.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        !self.is_terminal() && next.rank() >= self.rank()
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = StoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "queued" => Ok(Self::Queued),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(StoreError::InvalidState(value.to_string())),
        }
    }
}

/// Advisory sub-stage marker. Drives UI progress only; `RunStatus` is authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CurrentStep {
    Initializing,
    Imagery,
    ImageryComplete,
    AiAnalysis,
    AnalysisComplete,
    GeneratingPdf,
    PdfComplete,
    Completed,
    Cancelled,
    Failed,
}

impl CurrentStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Imagery => "imagery",
            Self::ImageryComplete => "imagery_complete",
            Self::AiAnalysis => "ai_analysis",
            Self::AnalysisComplete => "analysis_complete",
            Self::GeneratingPdf => "generating_pdf",
            Self::PdfComplete => "pdf_complete",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for CurrentStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CurrentStep {
    type Err = StoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "initializing" => Ok(Self::Initializing),
            "imagery" => Ok(Self::Imagery),
            "imagery_complete" => Ok(Self::ImageryComplete),
            "ai_analysis" => Ok(Self::AiAnalysis),
            "analysis_complete" => Ok(Self::AnalysisComplete),
            "generating_pdf" => Ok(Self::GeneratingPdf),
            "pdf_complete" => Ok(Self::PdfComplete),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            "failed" => Ok(Self::Failed),
            _ => Err(StoreError::InvalidStep(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRun {
    pub id: String,
    pub address: String,
    pub status: RunStatus,
    pub current_step: CurrentStep,
    pub cancel_requested: bool,
    pub imagery: Option<Value>,
    pub analysis: Option<Value>,
    pub pdf_url: Option<String>,
    pub metadata: Option<Value>,
    pub error_message: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    pub seq: i64,
    pub event_type: String,
    pub from_status: Option<RunStatus>,
    pub to_status: RunStatus,
    pub current_step: CurrentStep,
    pub message: String,
    pub created_at: String,
}

/// Partial update. `None` leaves the stored value as it is.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunPatch {
    pub status: Option<RunStatus>,
    pub current_step: Option<CurrentStep>,
    pub imagery: Option<Value>,
    pub analysis: Option<Value>,
    pub pdf_url: Option<String>,
    pub metadata: Option<Value>,
    pub error_message: Option<String>,
}

impl RunPatch {
    pub fn step(step: CurrentStep) -> Self {
        Self {
            current_step: Some(step),
            ..Self::default()
        }
    }

    pub fn processing(step: CurrentStep) -> Self {
        Self {
            status: Some(RunStatus::Processing),
            current_step: Some(step),
            ..Self::default()
        }
    }

    pub fn completed() -> Self {
        Self {
            status: Some(RunStatus::Completed),
            current_step: Some(CurrentStep::Completed),
            ..Self::default()
        }
    }

    pub fn cancelled() -> Self {
        Self {
            status: Some(RunStatus::Cancelled),
            current_step: Some(CurrentStep::Cancelled),
            ..Self::default()
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: Some(RunStatus::Failed),
            current_step: Some(CurrentStep::Failed),
            error_message: Some(message.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(String),
    #[error("serialization error: {0}")]
    Serde(String),
    #[error("Run not found: {0}")]
    RunNotFound(String),
    #[error("Run {id} is already {status}; no further changes are accepted.")]
    Terminal { id: String, status: RunStatus },
    #[error("Run status cannot move from {from} to {to}.")]
    InvalidTransition { from: RunStatus, to: RunStatus },
    #[error("Report URL can only be recorded once the report is stored.")]
    PrematureReportUrl,
    #[error("invalid run status: {0}")]
    InvalidState(String),
    #[error("invalid run step: {0}")]
    InvalidStep(String),
    #[error("{0}")]
    InvalidInput(String),
}

/// Persisted run table. Sole source of truth for job state.
pub struct RunStore;

impl RunStore {
    pub fn create(connection: &mut Connection, address: &str) -> Result<AnalysisRun, StoreError> {
        let address = normalize_address(address)?;
        let run_id = make_id("run");
        let now = now_timestamp();

        let tx = connection
            .transaction()
            .map_err(|e| StoreError::Db(e.to_string()))?;

        tx.execute(
            "
            INSERT INTO analysis_runs (
              id, address, status, current_step, cancel_requested, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, 0, ?5, ?5)
            ",
            params![
                run_id,
                address,
                RunStatus::Queued.as_str(),
                CurrentStep::Initializing.as_str(),
                now
            ],
        )
        .map_err(|e| StoreError::Db(e.to_string()))?;

        insert_event(
            &tx,
            &run_id,
            "run_created",
            None,
            RunStatus::Queued,
            CurrentStep::Initializing,
            "Run was created and is queued.",
            &now,
        )?;

        tx.commit().map_err(|e| StoreError::Db(e.to_string()))?;
        Self::get(connection, &run_id)
    }

    pub fn get(connection: &Connection, run_id: &str) -> Result<AnalysisRun, StoreError> {
        Self::find(connection, run_id)?.ok_or_else(|| StoreError::RunNotFound(run_id.to_string()))
    }

    pub fn find(connection: &Connection, run_id: &str) -> Result<Option<AnalysisRun>, StoreError> {
        connection
            .query_row(
                &format!("SELECT {RUN_COLUMNS} FROM analysis_runs WHERE id = ?1"),
                params![run_id],
                run_from_row,
            )
            .optional()
            .map_err(|e| StoreError::Db(e.to_string()))
    }

    pub fn exists(connection: &Connection, run_id: &str) -> Result<bool, StoreError> {
        let found: Option<i64> = connection
            .query_row(
                "SELECT 1 FROM analysis_runs WHERE id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| StoreError::Db(e.to_string()))?;
        Ok(found.is_some())
    }

    /// Newest first. `None` returns every run.
    pub fn list(connection: &Connection, limit: Option<usize>) -> Result<Vec<AnalysisRun>, StoreError> {
        let limit = limit.map(|v| v as i64).unwrap_or(-1);
        let mut stmt = connection
            .prepare(&format!(
                "SELECT {RUN_COLUMNS} FROM analysis_runs
                 ORDER BY created_at DESC, rowid DESC
                 LIMIT ?1"
            ))
            .map_err(|e| StoreError::Db(e.to_string()))?;

        let rows = stmt
            .query_map(params![limit], run_from_row)
            .map_err(|e| StoreError::Db(e.to_string()))?;

        let mut runs = Vec::new();
        for row in rows {
            runs.push(row.map_err(|e| StoreError::Db(e.to_string()))?);
        }
        Ok(runs)
    }

    /// Applies a partial update, refreshing `updated_at`.
    ///
    /// The read-check-write happens inside an immediate transaction so two
    /// writers racing on the same run cannot both pass the terminal check.
    pub fn update(
        connection: &mut Connection,
        run_id: &str,
        patch: RunPatch,
    ) -> Result<AnalysisRun, StoreError> {
        let tx = connection
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| StoreError::Db(e.to_string()))?;

        let current = Self::get(&tx, run_id)?;
        if current.status.is_terminal() {
            return Err(StoreError::Terminal {
                id: current.id,
                status: current.status,
            });
        }

        let next_status = patch.status.unwrap_or(current.status);
        if !current.status.can_transition_to(next_status) {
            return Err(StoreError::InvalidTransition {
                from: current.status,
                to: next_status,
            });
        }

        let next_step = patch.current_step.unwrap_or(current.current_step);
        if patch.pdf_url.is_some()
            && !matches!(next_step, CurrentStep::PdfComplete | CurrentStep::Completed)
        {
            return Err(StoreError::PrematureReportUrl);
        }

        let imagery_json = patch.imagery.as_ref().map(encode_json).transpose()?;
        let analysis_json = patch.analysis.as_ref().map(encode_json).transpose()?;
        let metadata_json = patch.metadata.as_ref().map(encode_json).transpose()?;
        let now = now_timestamp();

        tx.execute(
            "
            UPDATE analysis_runs
            SET status = ?1,
                current_step = ?2,
                imagery_json = COALESCE(?3, imagery_json),
                analysis_json = COALESCE(?4, analysis_json),
                pdf_url = COALESCE(?5, pdf_url),
                metadata_json = COALESCE(?6, metadata_json),
                error_message = COALESCE(?7, error_message),
                updated_at = ?8
            WHERE id = ?9
            ",
            params![
                next_status.as_str(),
                next_step.as_str(),
                imagery_json,
                analysis_json,
                patch.pdf_url,
                metadata_json,
                patch.error_message,
                now,
                run_id
            ],
        )
        .map_err(|e| StoreError::Db(e.to_string()))?;

        if next_status != current.status || next_step != current.current_step {
            let event_type = match next_status {
                RunStatus::Completed => "run_completed",
                RunStatus::Failed => "run_failed",
                RunStatus::Cancelled => "run_cancelled",
                _ if next_status != current.status => "run_started",
                _ => "step_changed",
            };
            let message = patch
                .error_message
                .clone()
                .unwrap_or_else(|| format!("Run moved to {next_step}."));
            insert_event(
                &tx,
                run_id,
                event_type,
                Some(current.status),
                next_status,
                next_step,
                &message,
                &now,
            )?;
        }

        tx.commit().map_err(|e| StoreError::Db(e.to_string()))?;
        Self::get(connection, run_id)
    }

    /// Raises the cancellation flag. Stages observe it at their next checkpoint.
    pub fn request_cancel(connection: &mut Connection, run_id: &str) -> Result<AnalysisRun, StoreError> {
        let tx = connection
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| StoreError::Db(e.to_string()))?;

        let current = Self::get(&tx, run_id)?;
        if current.status.is_terminal() {
            return Err(StoreError::Terminal {
                id: current.id,
                status: current.status,
            });
        }

        if !current.cancel_requested {
            let now = now_timestamp();
            tx.execute(
                "UPDATE analysis_runs SET cancel_requested = 1, updated_at = ?1 WHERE id = ?2",
                params![now, run_id],
            )
            .map_err(|e| StoreError::Db(e.to_string()))?;
            insert_event(
                &tx,
                run_id,
                "cancel_requested",
                Some(current.status),
                current.status,
                current.current_step,
                "Cancellation was requested.",
                &now,
            )?;
        }

        tx.commit().map_err(|e| StoreError::Db(e.to_string()))?;
        Self::get(connection, run_id)
    }

    pub fn cancel_requested(connection: &Connection, run_id: &str) -> Result<bool, StoreError> {
        connection
            .query_row(
                "SELECT cancel_requested FROM analysis_runs WHERE id = ?1",
                params![run_id],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .map_err(|e| StoreError::Db(e.to_string()))?
            .map(|flag| flag == 1)
            .ok_or_else(|| StoreError::RunNotFound(run_id.to_string()))
    }

    pub fn events(connection: &Connection, run_id: &str) -> Result<Vec<RunEvent>, StoreError> {
        let mut stmt = connection
            .prepare(
                "
                SELECT seq, event_type, from_status, to_status, current_step, message, created_at
                FROM run_events
                WHERE run_id = ?1
                ORDER BY seq ASC
                ",
            )
            .map_err(|e| StoreError::Db(e.to_string()))?;

        let rows = stmt
            .query_map(params![run_id], |row| {
                let from_status: Option<String> = row.get(2)?;
                Ok(RunEvent {
                    seq: row.get(0)?,
                    event_type: row.get(1)?,
                    from_status: from_status
                        .map(|v| parse_column::<RunStatus>(2, &v))
                        .transpose()?,
                    to_status: parse_column(3, &row.get::<_, String>(3)?)?,
                    current_step: parse_column(4, &row.get::<_, String>(4)?)?,
                    message: row.get(5)?,
                    created_at: row.get(6)?,
                })
            })
            .map_err(|e| StoreError::Db(e.to_string()))?;

        let mut events = Vec::new();
        for row in rows {
            events.push(row.map_err(|e| StoreError::Db(e.to_string()))?);
        }
        Ok(events)
    }
}

pub(crate) fn normalize_address(input: &str) -> Result<String, StoreError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(StoreError::InvalidInput(
            "Enter a property address to analyze.".to_string(),
        ));
    }
    if trimmed.chars().count() > MAX_ADDRESS_CHARS {
        return Err(StoreError::InvalidInput(format!(
            "Keep the address under {MAX_ADDRESS_CHARS} characters."
        )));
    }
    Ok(trimmed.to_string())
}

#[allow(clippy::too_many_arguments)]
fn insert_event(
    tx: &rusqlite::Transaction<'_>,
    run_id: &str,
    event_type: &str,
    from_status: Option<RunStatus>,
    to_status: RunStatus,
    current_step: CurrentStep,
    message: &str,
    now: &str,
) -> Result<(), StoreError> {
    tx.execute(
        "
        INSERT INTO run_events (
          run_id, event_type, from_status, to_status, current_step, message, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ",
        params![
            run_id,
            event_type,
            from_status.map(|s| s.as_str()),
            to_status.as_str(),
            current_step.as_str(),
            message,
            now
        ],
    )
    .map_err(|e| StoreError::Db(e.to_string()))?;
    Ok(())
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<AnalysisRun> {
    Ok(AnalysisRun {
        id: row.get(0)?,
        address: row.get(1)?,
        status: parse_column(2, &row.get::<_, String>(2)?)?,
        current_step: parse_column(3, &row.get::<_, String>(3)?)?,
        cancel_requested: row.get::<_, i64>(4)? == 1,
        imagery: decode_json_column(5, row.get(5)?)?,
        analysis: decode_json_column(6, row.get(6)?)?,
        pdf_url: row.get(7)?,
        metadata: decode_json_column(8, row.get(8)?)?,
        error_message: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

fn parse_column<T>(index: usize, value: &str) -> rusqlite::Result<T>
where
    T: FromStr<Err = StoreError>,
{
    T::from_str(value)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(e)))
}

fn decode_json_column(index: usize, raw: Option<String>) -> rusqlite::Result<Option<Value>> {
    raw.map(|text| {
        serde_json::from_str(&text)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(e)))
    })
    .transpose()
}

fn encode_json(value: &Value) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Serde(e.to_string()))
}

fn make_id(prefix: &str) -> String {
    let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    let salt: u32 = rand::random();
    format!(
        "{}_{}_{}_{:08x}",
        prefix,
        Utc::now().timestamp_millis(),
        counter,
        salt
    )
}

pub(crate) fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::{CurrentStep, RunPatch, RunStatus, RunStore, StoreError};
    use crate::db::bootstrap_schema;
    use pretty_assertions::assert_eq;
    use rusqlite::Connection;
    use serde_json::json;

    fn setup_conn() -> Connection {
        let mut conn = Connection::open_in_memory().expect("open memory db");
        bootstrap_schema(&mut conn).expect("bootstrap schema");
        conn
    }

    #[test]
    fn create_trims_address_and_starts_queued() {
        let mut conn = setup_conn();
        let run = RunStore::create(&mut conn, "  12 Elm Street, Austin TX  ").expect("create");
        assert_eq!(run.address, "12 Elm Street, Austin TX");
        assert_eq!(run.status, RunStatus::Queued);
        assert_eq!(run.current_step, CurrentStep::Initializing);
        assert!(!run.cancel_requested);
        assert!(run.analysis.is_none());
        assert!(run.pdf_url.is_none());
        assert_eq!(run.created_at, run.updated_at);
    }

    #[test]
    fn create_rejects_blank_and_oversized_addresses() {
        let mut conn = setup_conn();
        assert!(matches!(
            RunStore::create(&mut conn, "   "),
            Err(StoreError::InvalidInput(_))
        ));
        assert!(matches!(
            RunStore::create(&mut conn, &"x".repeat(501)),
            Err(StoreError::InvalidInput(_))
        ));
    }

    #[test]
    fn ids_are_unique_across_rapid_creates() {
        let mut conn = setup_conn();
        let a = RunStore::create(&mut conn, "1 A St").expect("a");
        let b = RunStore::create(&mut conn, "1 A St").expect("b");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn update_merges_fields_and_keeps_untouched_values() {
        let mut conn = setup_conn();
        let run = RunStore::create(&mut conn, "1 A St").expect("create");
        RunStore::update(
            &mut conn,
            &run.id,
            RunPatch {
                imagery: Some(json!({"source": "mock"})),
                ..RunPatch::processing(CurrentStep::ImageryComplete)
            },
        )
        .expect("imagery");
        let updated = RunStore::update(&mut conn, &run.id, RunPatch::step(CurrentStep::AiAnalysis))
            .expect("step");
        assert_eq!(updated.status, RunStatus::Processing);
        assert_eq!(updated.imagery, Some(json!({"source": "mock"})));
        assert_eq!(updated.current_step, CurrentStep::AiAnalysis);
    }

    #[test]
    fn status_never_moves_backwards() {
        let mut conn = setup_conn();
        let run = RunStore::create(&mut conn, "1 A St").expect("create");
        RunStore::update(&mut conn, &run.id, RunPatch::processing(CurrentStep::Imagery))
            .expect("processing");
        let err = RunStore::update(
            &mut conn,
            &run.id,
            RunPatch {
                status: Some(RunStatus::Queued),
                ..RunPatch::default()
            },
        )
        .expect_err("backwards transition");
        assert!(matches!(
            err,
            StoreError::InvalidTransition {
                from: RunStatus::Processing,
                to: RunStatus::Queued
            }
        ));
    }

    #[test]
    fn terminal_run_rejects_any_mutation() {
        let mut conn = setup_conn();
        let run = RunStore::create(&mut conn, "1 A St").expect("create");
        RunStore::update(&mut conn, &run.id, RunPatch::failed("boom")).expect("fail");

        let err = RunStore::update(&mut conn, &run.id, RunPatch::step(CurrentStep::AiAnalysis))
            .expect_err("terminal update");
        assert!(matches!(
            err,
            StoreError::Terminal {
                status: RunStatus::Failed,
                ..
            }
        ));
        assert!(matches!(
            RunStore::request_cancel(&mut conn, &run.id),
            Err(StoreError::Terminal { .. })
        ));

        let after = RunStore::get(&conn, &run.id).expect("get");
        assert_eq!(after.error_message.as_deref(), Some("boom"));
        assert_eq!(after.current_step, CurrentStep::Failed);
        assert!(!after.cancel_requested);
    }

    #[test]
    fn report_url_requires_report_step() {
        let mut conn = setup_conn();
        let run = RunStore::create(&mut conn, "1 A St").expect("create");
        let err = RunStore::update(
            &mut conn,
            &run.id,
            RunPatch {
                pdf_url: Some("http://x/report.txt".to_string()),
                ..RunPatch::processing(CurrentStep::GeneratingPdf)
            },
        )
        .expect_err("premature url");
        assert!(matches!(err, StoreError::PrematureReportUrl));
        assert!(RunStore::get(&conn, &run.id).expect("get").pdf_url.is_none());
    }

    #[test]
    fn request_cancel_sets_flag_without_changing_status() {
        let mut conn = setup_conn();
        let run = RunStore::create(&mut conn, "1 A St").expect("create");
        let flagged = RunStore::request_cancel(&mut conn, &run.id).expect("cancel");
        assert!(flagged.cancel_requested);
        assert_eq!(flagged.status, RunStatus::Queued);
        assert!(RunStore::cancel_requested(&conn, &run.id).expect("flag"));

        RunStore::request_cancel(&mut conn, &run.id).expect("second cancel is a no-op");
        let cancel_events = RunStore::events(&conn, &run.id)
            .expect("events")
            .into_iter()
            .filter(|e| e.event_type == "cancel_requested")
            .count();
        assert_eq!(cancel_events, 1);
    }

    #[test]
    fn list_orders_newest_first_and_respects_limit() {
        let mut conn = setup_conn();
        let first = RunStore::create(&mut conn, "1 First St").expect("first");
        let second = RunStore::create(&mut conn, "2 Second St").expect("second");
        let third = RunStore::create(&mut conn, "3 Third St").expect("third");

        let all = RunStore::list(&conn, None).expect("list");
        let ids: Vec<&str> = all.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec![third.id.as_str(), second.id.as_str(), first.id.as_str()]);

        let limited = RunStore::list(&conn, Some(2)).expect("limited");
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].id, third.id);
    }

    #[test]
    fn events_record_every_transition_in_order() {
        let mut conn = setup_conn();
        let run = RunStore::create(&mut conn, "1 A St").expect("create");
        RunStore::update(&mut conn, &run.id, RunPatch::processing(CurrentStep::Imagery))
            .expect("imagery");
        RunStore::update(&mut conn, &run.id, RunPatch::cancelled()).expect("cancel");

        let events = RunStore::events(&conn, &run.id).expect("events");
        let kinds: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(kinds, vec!["run_created", "run_started", "run_cancelled"]);
        assert_eq!(events[2].from_status, Some(RunStatus::Processing));
        assert_eq!(events[2].to_status, RunStatus::Cancelled);
    }

    #[test]
    fn missing_run_is_reported_by_id() {
        let mut conn = setup_conn();
        assert!(!RunStore::exists(&conn, "run_missing").expect("exists"));
        let err = RunStore::update(&mut conn, "run_missing", RunPatch::completed())
            .expect_err("missing");
        assert_eq!(err.to_string(), "Run not found: run_missing");
    }

    #[test]
    fn queued_run_may_fail_directly() {
        let status = RunStatus::Queued;
        assert!(status.can_transition_to(RunStatus::Failed));
        assert!(status.can_transition_to(RunStatus::Cancelled));
        assert!(!RunStatus::Cancelled.can_transition_to(RunStatus::Cancelled));
    }
}
