use async_trait::async_trait;
use binlog_pitr_core::{ApplySink, BinlogEvent, LogPosition, PitrError};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

use crate::binlog_source::{event_type, BINLOG_MAGIC};
use crate::service_configuration::MysqlNode;

const DEFAULT_MYSQL_PORT: u16 = 3306;
const MAX_STDERR_IN_ERROR: usize = 512;

#[derive(Debug, Clone)]
pub(crate) struct MysqlSettings {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) user: String,
    pub(crate) password: Option<String>,
    pub(crate) mysqlbinlog_path: String,
    pub(crate) mysql_path: String,
    pub(crate) work_dir: Option<PathBuf>,
}

impl From<MysqlNode> for MysqlSettings {
    fn from(node: MysqlNode) -> Self {
        MysqlSettings {
            host: node.host,
            port: node.port.unwrap_or(DEFAULT_MYSQL_PORT),
            user: node.user,
            password: node.password,
            mysqlbinlog_path: node.mysqlbinlog_path.unwrap_or_else(|| "mysqlbinlog".to_string()),
            mysql_path: node.mysql_path.unwrap_or_else(|| "mysql".to_string()),
            work_dir: node.work_dir.map(PathBuf::from),
        }
    }
}

/// Replays event batches into MySQL through `mysqlbinlog <file> | mysql`.
///
/// Each batch is written to a temporary binlog file headed by the most recent
/// format description seen, and replayed in a single mysql session. Batches
/// only hold whole transactions, so a failure leaves none half applied.
#[derive(Debug)]
pub(crate) struct MysqlbinlogApplier {
    settings: MysqlSettings,
    format_description: Option<Vec<u8>>,
    applied_through: LogPosition,
    batches: u64,
}

impl MysqlbinlogApplier {
    pub(crate) fn new(settings: MysqlSettings, base: LogPosition) -> Self {
        Self {
            settings,
            format_description: None,
            applied_through: base,
            batches: 0,
        }
    }

    #[cfg(test)]
    pub(crate) fn batches(&self) -> u64 {
        self.batches
    }

    fn apply_error(&self, reason: impl Into<String>) -> PitrError {
        PitrError::Apply {
            position: self.applied_through,
            reason: reason.into(),
        }
    }

    /// Binlog file image for the batch, or `None` when it carries no data events.
    pub(crate) fn file_image(&mut self, events: &[BinlogEvent]) -> Result<Option<(Vec<u8>, LogPosition)>, PitrError> {
        let mut body = Vec::new();
        let mut last = None;
        for event in events {
            if event.data.get(4) == Some(&event_type::FORMAT_DESCRIPTION) {
                self.format_description = Some(event.data.clone());
                continue;
            }
            if event.is_preamble() {
                continue;
            }
            body.extend_from_slice(&event.data);
            last = Some(event.next);
        }
        let Some(last) = last else {
            return Ok(None);
        };
        let Some(fde) = self.format_description.as_ref() else {
            return Err(self.apply_error("no format description event precedes the batch"));
        };

        let mut image = Vec::with_capacity(BINLOG_MAGIC.len() + fde.len() + body.len());
        image.extend_from_slice(&BINLOG_MAGIC);
        image.extend_from_slice(fde);
        image.extend_from_slice(&body);
        Ok(Some((image, last)))
    }

    async fn run_pipeline(&self, binlog_file: &std::path::Path) -> Result<(), PitrError> {
        let mut decode = Command::new(&self.settings.mysqlbinlog_path)
            .arg(binlog_file)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                self.apply_error(format!(
                    "failed to start {}: {}",
                    self.settings.mysqlbinlog_path, e
                ))
            })?;
        let decoded: Stdio = decode
            .stdout
            .take()
            .ok_or_else(|| self.apply_error("mysqlbinlog stdout not captured"))?
            .try_into()
            .map_err(|e: std::io::Error| self.apply_error(e.to_string()))?;

        let mut apply = Command::new(&self.settings.mysql_path);
        apply
            .arg(format!("--host={}", self.settings.host))
            .arg(format!("--port={}", self.settings.port))
            .arg(format!("--user={}", self.settings.user))
            .stdin(decoded)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(password) = &self.settings.password {
            apply.env("MYSQL_PWD", password);
        }
        let apply = apply.spawn().map_err(|e| {
            self.apply_error(format!("failed to start {}: {}", self.settings.mysql_path, e))
        })?;

        let (decode_out, apply_out) = tokio::join!(decode.wait_with_output(), apply.wait_with_output());
        let decode_out = decode_out.map_err(|e| self.apply_error(e.to_string()))?;
        let apply_out = apply_out.map_err(|e| self.apply_error(e.to_string()))?;

        if !decode_out.status.success() {
            return Err(self.apply_error(format!(
                "{} exited with {}: {}",
                self.settings.mysqlbinlog_path,
                decode_out.status,
                stderr_excerpt(&decode_out.stderr)
            )));
        }
        if !apply_out.status.success() {
            return Err(self.apply_error(format!(
                "{} exited with {}: {}",
                self.settings.mysql_path,
                apply_out.status,
                stderr_excerpt(&apply_out.stderr)
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ApplySink for MysqlbinlogApplier {
    async fn apply_all(&mut self, events: &[BinlogEvent]) -> Result<(), PitrError> {
        let Some((image, last)) = self.file_image(events)? else {
            return Ok(());
        };

        let builder = {
            let mut b = tempfile::Builder::new();
            b.prefix("pitr-apply-").suffix(".binlog");
            b
        };
        let tmp = match &self.settings.work_dir {
            Some(dir) => builder.tempfile_in(dir),
            None => builder.tempfile(),
        }
        .map_err(|e| self.apply_error(format!("failed to create batch file: {}", e)))?;
        tokio::fs::write(tmp.path(), &image)
            .await
            .map_err(|e| self.apply_error(format!("failed to write batch file: {}", e)))?;

        debug!(
            target: "mysql_applier",
            events = events.len(),
            bytes = image.len(),
            through = %last,
            "applying batch"
        );
        self.run_pipeline(tmp.path()).await?;

        self.applied_through = last;
        self.batches += 1;
        info!(
            target: "mysql_applier",
            through = %last,
            batch = self.batches,
            "batch applied"
        );
        Ok(())
    }
}

fn stderr_excerpt(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    match text.char_indices().nth(MAX_STDERR_IN_ERROR) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
