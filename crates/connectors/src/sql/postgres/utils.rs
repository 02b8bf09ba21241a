use crate::error::ConnectorError;
use model::pagination::position::LogPosition;
use native_tls::TlsConnector;
use postgres_native_tls::MakeTlsConnector;
use tokio_postgres::{Client, Config, NoTls, config::SslMode};
use tracing::{error, warn};

pub async fn connect_client(url: &str) -> Result<Client, ConnectorError> {
    let config = url
        .parse::<Config>()
        .map_err(|e| ConnectorError::InvalidUrl(e.to_string()))?;
    let ssl_mode = config.get_ssl_mode();

    match ssl_mode {
        SslMode::Disable => connect_without_tls(config).await,
        SslMode::Require => connect_with_tls(config).await,
        SslMode::Prefer => match connect_with_tls(config.clone()).await {
            Ok(client) => Ok(client),
            Err(error) => {
                warn!(%error, "Postgres TLS handshake failed, retrying without TLS");
                connect_without_tls(config).await
            }
        },
        _ => connect_with_tls(config).await,
    }
}

pub(crate) async fn connect_with_tls(config: Config) -> Result<Client, ConnectorError> {
    let connector = TlsConnector::builder().build()?;
    let tls = MakeTlsConnector::new(connector);
    let (client, connection) = config.connect(tls).await?;
    tokio::spawn(async move {
        if let Err(err) = connection.await {
            error!(%err, "Postgres connection error");
        }
    });
    Ok(client)
}

pub(crate) async fn connect_without_tls(config: Config) -> Result<Client, ConnectorError> {
    let (client, connection) = config.connect(NoTls).await?;
    tokio::spawn(async move {
        if let Err(err) = connection.await {
            error!(%err, "Postgres connection error");
        }
    });
    Ok(client)
}

/// Parses a textual LSN such as `16/B374D848`.
pub fn parse_lsn(lsn: &str) -> Result<LogPosition, ConnectorError> {
    let (hi, lo) = lsn
        .split_once('/')
        .ok_or_else(|| ConnectorError::Decode(format!("malformed LSN '{lsn}'")))?;
    let hi = u64::from_str_radix(hi, 16)
        .map_err(|e| ConnectorError::Decode(format!("malformed LSN '{lsn}': {e}")))?;
    let lo = u64::from_str_radix(lo, 16)
        .map_err(|e| ConnectorError::Decode(format!("malformed LSN '{lsn}': {e}")))?;
    Ok(LogPosition((hi << 32) | lo))
}

pub fn format_lsn(position: LogPosition) -> String {
    let offset = position.offset();
    format!("{:X}/{:X}", offset >> 32, offset & 0xFFFF_FFFF)
}
