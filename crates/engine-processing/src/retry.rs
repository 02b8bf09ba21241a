use connectors::error::ConnectorError;
use engine_core::retry::RetryDisposition;
use tokio_postgres::{Error as PgError, error::SqlState};

/// Decides whether a failed read or write is worth another attempt.
pub fn classify_connector_error(err: &ConnectorError) -> RetryDisposition {
    match err {
        ConnectorError::Postgres(pg_err) => classify_pg_error(pg_err),
        ConnectorError::Unavailable(_) | ConnectorError::Read(_) => RetryDisposition::Retry,
        ConnectorError::Tls(_) => RetryDisposition::Retry,
        ConnectorError::InvalidUrl(_)
        | ConnectorError::TableNotFound(_)
        | ConnectorError::UnsupportedDriver(_)
        | ConnectorError::InvalidMetadata(_)
        | ConnectorError::Decode(_)
        | ConnectorError::Write(_) => RetryDisposition::Stop,
    }
}

fn classify_pg_error(err: &PgError) -> RetryDisposition {
    if err.is_closed() {
        return RetryDisposition::Retry;
    }

    if let Some(code) = err.code()
        && is_retryable_pg_code(code)
    {
        return RetryDisposition::Retry;
    }

    RetryDisposition::Stop
}

fn is_retryable_pg_code(code: &SqlState) -> bool {
    matches!(
        *code,
        SqlState::T_R_SERIALIZATION_FAILURE
            | SqlState::T_R_DEADLOCK_DETECTED
            | SqlState::LOCK_NOT_AVAILABLE
            | SqlState::TOO_MANY_CONNECTIONS
            | SqlState::ADMIN_SHUTDOWN
            | SqlState::CRASH_SHUTDOWN
            | SqlState::CANNOT_CONNECT_NOW
            | SqlState::CONNECTION_FAILURE
            | SqlState::CONNECTION_DOES_NOT_EXIST
            | SqlState::SQLCLIENT_UNABLE_TO_ESTABLISH_SQLCONNECTION
            | SqlState::CONNECTION_EXCEPTION
            | SqlState::QUERY_CANCELED
            | SqlState::OBJECT_IN_USE
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_failures_are_retried() {
        assert_eq!(
            classify_connector_error(&ConnectorError::Unavailable("ds_0".into())),
            RetryDisposition::Retry
        );
        assert_eq!(
            classify_connector_error(&ConnectorError::Read("timeout".into())),
            RetryDisposition::Retry
        );
    }

    #[test]
    fn permanent_failures_stop() {
        assert_eq!(
            classify_connector_error(&ConnectorError::Write("duplicate key".into())),
            RetryDisposition::Stop
        );
        assert_eq!(
            classify_connector_error(&ConnectorError::TableNotFound("orders".into())),
            RetryDisposition::Stop
        );
    }
}
