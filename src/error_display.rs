//! User-facing error message formatting.
//!
//! Matches on the typed errors of the data engine and on io::ErrorKind
//! instead of parsing strings.

use crate::error::{ExportError, FetchError, IngestError, StoreError, TransientNetworkError};
use std::io;
use std::path::Path;

pub fn user_message_from_transient(err: &TransientNetworkError) -> String {
    match err {
        TransientNetworkError::Network(msg) => {
            format!("Could not reach the query service: {}", msg)
        }
        TransientNetworkError::Status { status } if *status >= 500 => {
            format!("The query service failed (HTTP {}). Try again later.", status)
        }
        TransientNetworkError::Status { status: 401 | 403 } => {
            "The query service refused the request. Check credentials and access.".to_string()
        }
        TransientNetworkError::Status { status: 404 } => {
            "Question not found. Check the question id and base URL.".to_string()
        }
        TransientNetworkError::Status { status } => {
            format!("The query service rejected the request (HTTP {}).", status)
        }
        TransientNetworkError::Timeout(after) => format!(
            "The query took longer than {}s. Narrow the filters or raise fetch.timeout_secs.",
            after.as_secs()
        ),
        TransientNetworkError::MalformedBody(_) => {
            "The query service returned something that is not JSON.".to_string()
        }
    }
}

pub fn user_message_from_store(err: &StoreError) -> String {
    match err {
        StoreError::SchemaMismatch {
            row,
            expected,
            found,
        } => format!(
            "Result rows do not match the columns: row {} has {} values, expected {}.",
            row + 1,
            found,
            expected
        ),
        other => other.to_string(),
    }
}

pub fn user_message_from_fetch(err: &FetchError) -> String {
    match err {
        FetchError::Exhausted { attempts, source } if *attempts > 1 => format!(
            "{} (gave up after {} attempts)",
            user_message_from_transient(source),
            attempts
        ),
        FetchError::Exhausted { source, .. } => user_message_from_transient(source),
        FetchError::InvalidResponse(msg) => format!("Unexpected response from the server: {}", msg),
        FetchError::SchemaMismatch(e) => user_message_from_store(e),
        FetchError::Cancelled => "Request cancelled.".to_string(),
    }
}

pub fn user_message_from_ingest(err: &IngestError) -> String {
    match err {
        IngestError::Connect(msg) => format!("Could not open the result stream: {}", msg),
        IngestError::Transport(msg) => format!("Result stream interrupted: {}", msg),
        IngestError::Server(msg) => format!("The server stopped the stream: {}", msg),
        IngestError::Decode { event, .. } => {
            format!("The server sent a malformed '{}' event.", event)
        }
        IngestError::UnexpectedEnd => {
            "The result stream closed before it finished. Rows received so far are kept."
                .to_string()
        }
        IngestError::SchemaMismatch(e) => user_message_from_store(e),
    }
}

pub fn user_message_from_export(err: &ExportError) -> String {
    match err {
        ExportError::NoSchema => "Nothing to export yet.".to_string(),
        ExportError::StoreChanged { .. } => {
            "The result was replaced while exporting. Export again.".to_string()
        }
        ExportError::InvalidDelimiter(c) => format!(
            "Cannot export with delimiter {:?}. Use a single ASCII character such as ',' or ';'.",
            c
        ),
        ExportError::Csv(e) => match e.kind() {
            csv::ErrorKind::Io(io) => user_message_from_io(io, None),
            _ => format!("Could not write CSV: {}", e),
        },
        ExportError::Json(e) => format!("Could not write JSON: {}", e),
        ExportError::Io(e) => user_message_from_io(e, None),
    }
}

/// Format an io::Error as a user-facing message by matching on ErrorKind.
pub fn user_message_from_io(err: &io::Error, context: Option<&str>) -> String {
    use std::io::ErrorKind;

    let base: String = match err.kind() {
        ErrorKind::NotFound => "File or directory not found.".to_string(),
        ErrorKind::PermissionDenied => "Permission denied. Check write access.".to_string(),
        ErrorKind::ConnectionRefused => "Connection refused.".to_string(),
        ErrorKind::ConnectionReset => "Connection reset.".to_string(),
        ErrorKind::TimedOut => "Operation timed out.".to_string(),
        ErrorKind::AlreadyExists => "File already exists.".to_string(),
        ErrorKind::Interrupted => "Operation interrupted.".to_string(),
        ErrorKind::OutOfMemory => "Out of memory.".to_string(),
        _ => {
            let msg = err.to_string();
            if msg.contains("No space left") {
                return "No space left on device. Free up disk space and try again.".to_string();
            }
            return match context {
                Some(ctx) if !ctx.is_empty() => format!("I/O error: {} {}", msg, ctx),
                _ => msg,
            };
        }
    };

    match context {
        Some(ctx) if !ctx.is_empty() => format!("{} {}", base, ctx),
        _ => base,
    }
}

/// Format a color_eyre Report by downcasting to known error types.
/// Walks the cause chain; `path` names the file involved, if any.
pub fn user_message_from_report(report: &color_eyre::eyre::Report, path: Option<&Path>) -> String {
    let with_path = |msg: String| match path {
        Some(p) => format!("{}: {}", p.display(), msg),
        None => msg,
    };
    for cause in report.chain() {
        if let Some(e) = cause.downcast_ref::<FetchError>() {
            return user_message_from_fetch(e);
        }
        if let Some(e) = cause.downcast_ref::<IngestError>() {
            return user_message_from_ingest(e);
        }
        if let Some(e) = cause.downcast_ref::<ExportError>() {
            return with_path(user_message_from_export(e));
        }
        if let Some(e) = cause.downcast_ref::<io::Error>() {
            return with_path(user_message_from_io(e, None));
        }
    }
    let display = report.to_string();
    display
        .lines()
        .next()
        .map(str::trim)
        .unwrap_or("An error occurred")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_user_message_from_io_not_found() {
        let err = io::Error::new(io::ErrorKind::NotFound, "missing");
        assert_eq!(user_message_from_io(&err, None), "File or directory not found.");
        assert_eq!(
            user_message_from_io(&err, Some("(exports)")),
            "File or directory not found. (exports)"
        );
    }

    #[test]
    fn test_exhausted_retries_mention_attempts() {
        let err = FetchError::Exhausted {
            attempts: 3,
            source: TransientNetworkError::Status { status: 503 },
        };
        assert_eq!(
            user_message_from_fetch(&err),
            "The query service failed (HTTP 503). Try again later. (gave up after 3 attempts)"
        );
        let once = FetchError::Exhausted {
            attempts: 1,
            source: TransientNetworkError::Timeout(Duration::from_secs(30)),
        };
        assert!(user_message_from_fetch(&once).contains("longer than 30s"));
    }

    #[test]
    fn test_report_chain_finds_typed_error() {
        let report = color_eyre::eyre::Report::new(IngestError::UnexpectedEnd)
            .wrap_err("streaming question 7");
        assert!(user_message_from_report(&report, None).contains("Rows received so far are kept"));

        let report = color_eyre::eyre::Report::new(ExportError::Io(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "denied",
        )));
        assert_eq!(
            user_message_from_report(&report, Some(Path::new("/tmp/out.csv"))),
            "/tmp/out.csv: Permission denied. Check write access."
        );
    }

    #[test]
    fn test_schema_mismatch_is_one_based() {
        let err = IngestError::SchemaMismatch(StoreError::SchemaMismatch {
            row: 0,
            expected: 3,
            found: 2,
        });
        assert_eq!(
            user_message_from_ingest(&err),
            "Result rows do not match the columns: row 1 has 2 values, expected 3."
        );
    }
}
