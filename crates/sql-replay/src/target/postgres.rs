//! PostgreSQL target sessions.
//!
//! Each session is a dedicated `tokio-postgres` connection whose driver
//! task is spawned onto the runtime and aborted when the session closes.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, Config as PgConfig, NoTls, SimpleQueryMessage};
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::{debug, warn};

use super::{explain_sql, ExecOutput, TargetConnector, TargetError, TargetErrorKind, TargetSession};
use crate::config::TargetConfig;
use crate::error::Result;
use crate::tls::SslMode;

/// Opens PostgreSQL sessions.
pub struct PostgresConnector {
    pg_config: PgConfig,
    tls: Option<MakeRustlsConnect>,
}

impl PostgresConnector {
    pub fn new(config: &TargetConfig) -> Result<Self> {
        let mut pg_config = PgConfig::new();
        pg_config.host(&config.host);
        pg_config.port(config.port());
        pg_config.dbname(&config.database);
        pg_config.user(&config.user);
        pg_config.password(&config.password);
        pg_config.application_name("sql-replay");
        pg_config.connect_timeout(Duration::from_secs(config.connect_timeout_seconds));

        let tls = SslMode::parse(&config.ssl_mode)?.connector()?;
        if tls.is_none() {
            warn!("PostgreSQL TLS is disabled. Credentials will be transmitted in plaintext.");
        }

        Ok(Self { pg_config, tls })
    }
}

#[async_trait]
impl TargetConnector for PostgresConnector {
    async fn open(&self) -> std::result::Result<Box<dyn TargetSession>, TargetError> {
        let (client, driver) = match &self.tls {
            Some(tls) => {
                let (client, connection) = self
                    .pg_config
                    .connect(tls.clone())
                    .await
                    .map_err(|e| TargetError::connection(e.to_string()))?;
                (client, tokio::spawn(async move { drive(connection).await }))
            }
            None => {
                let (client, connection) = self
                    .pg_config
                    .connect(NoTls)
                    .await
                    .map_err(|e| TargetError::connection(e.to_string()))?;
                (client, tokio::spawn(async move { drive(connection).await }))
            }
        };
        Ok(Box::new(PostgresSession { client, driver }))
    }

    fn db_type(&self) -> &str {
        "postgres"
    }
}

async fn drive<F>(connection: F)
where
    F: std::future::Future<Output = std::result::Result<(), tokio_postgres::Error>>,
{
    if let Err(e) = connection.await {
        debug!("PostgreSQL target connection ended: {}", e);
    }
}

/// One PostgreSQL connection.
pub struct PostgresSession {
    client: Client,
    driver: JoinHandle<()>,
}

#[async_trait]
impl TargetSession for PostgresSession {
    async fn explain(&mut self, sql: &str) -> std::result::Result<String, TargetError> {
        let explain = explain_sql(sql)?;
        // extended protocol: the server refuses more than one statement
        let rows = self
            .client
            .query(explain.as_str(), &[])
            .await
            .map_err(classify)?;

        let plan: Vec<String> = rows
            .iter()
            .filter_map(|row| row.try_get::<_, String>(0).ok())
            .collect();
        Ok(plan.join("\n"))
    }

    async fn execute(&mut self, sql: &str) -> std::result::Result<ExecOutput, TargetError> {
        let start = Instant::now();
        let messages = self.client.simple_query(sql).await.map_err(classify)?;
        let elapsed = start.elapsed();

        let rows = messages
            .iter()
            .map(|m| match m {
                SimpleQueryMessage::CommandComplete(n) => *n,
                _ => 0,
            })
            .sum();
        Ok(ExecOutput { rows, elapsed })
    }

    async fn close(self: Box<Self>) {
        drop(self.client);
        self.driver.abort();
    }
}

/// Map a driver error onto the target taxonomy by SQLSTATE class.
fn classify(err: tokio_postgres::Error) -> TargetError {
    let message = err.to_string();
    match err.code() {
        Some(code) => TargetError::new(classify_sqlstate(code), message),
        // no SQLSTATE: the server never answered
        None => TargetError::connection(message),
    }
}

fn classify_sqlstate(code: &SqlState) -> TargetErrorKind {
    if *code == SqlState::SYNTAX_ERROR {
        return TargetErrorKind::Syntax;
    }
    if *code == SqlState::QUERY_CANCELED {
        return TargetErrorKind::Timeout;
    }
    match code.code().get(..2).unwrap_or("") {
        // feature not supported, syntax error or access rule violation
        "0A" | "42" => TargetErrorKind::Semantic,
        // connection exception, operator intervention
        "08" | "57" => TargetErrorKind::Connection,
        _ => TargetErrorKind::Other,
    }
}
