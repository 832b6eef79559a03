//! `tokio-postgres` backed sessions.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use tokio_postgres::types::ToSql;
use tokio_postgres::{CancelToken, Client, NoTls};

use super::decode::PgValue;
use super::session::{Connector, DbSession, QueryCanceller, QueryOutput};
use crate::types::{DatabaseConfig, Error, Result};

/// Opens plain-TCP sessions against one PostgreSQL endpoint.
pub struct PgConnector {
    config: tokio_postgres::Config,
}

impl fmt::Debug for PgConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgConnector")
            .field("hosts", &self.config.get_hosts().len())
            .field("dbname", &self.config.get_dbname())
            .finish()
    }
}

impl PgConnector {
    pub fn new(database: &DatabaseConfig) -> Result<Self> {
        let mut config = database.parse()?;
        if config.get_application_name().is_none() {
            config.application_name(env!("CARGO_PKG_NAME"));
        }
        Ok(Self { config })
    }
}

#[async_trait]
impl Connector for PgConnector {
    async fn connect(&self) -> Result<Box<dyn DbSession>> {
        let (client, connection) = self.config.connect(NoTls).await?;
        // The connection future drives socket I/O for the client and resolves
        // once the client is dropped or the server goes away.
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::warn!(error = %e, "postgres connection task ended with error");
            }
        });
        Ok(Box::new(PgSession { client }))
    }
}

/// One live PostgreSQL session.
pub struct PgSession {
    client: Client,
}

impl fmt::Debug for PgSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgSession")
            .field("closed", &self.client.is_closed())
            .finish()
    }
}

#[async_trait]
impl DbSession for PgSession {
    async fn query(&mut self, sql: &str, params: &[String]) -> Result<QueryOutput> {
        let statement = self.client.prepare(sql).await?;
        let columns: Vec<String> = statement
            .columns()
            .iter()
            .map(|c| c.name().to_string())
            .collect();

        let bound: Vec<&(dyn ToSql + Sync)> =
            params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
        let rows = self.client.query(&statement, &bound).await?;

        let mut output = QueryOutput::new(columns);
        for row in &rows {
            let mut object = Map::with_capacity(output.columns.len());
            for (idx, name) in output.columns.iter().enumerate() {
                let value = row
                    .try_get::<_, PgValue>(idx)
                    .map_err(|e| Error::database(format!("cannot decode column '{}': {}", name, e)))?;
                object.insert(name.clone(), Value::from(value));
            }
            output.rows.push(object);
        }
        Ok(output)
    }

    async fn ping(&mut self) -> Result<()> {
        self.client.simple_query("SELECT 1").await?;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.client.is_closed()
    }

    fn canceller(&self) -> Option<Arc<dyn QueryCanceller>> {
        Some(Arc::new(PgCanceller {
            token: self.client.cancel_token(),
        }))
    }
}

struct PgCanceller {
    token: CancelToken,
}

#[async_trait]
impl QueryCanceller for PgCanceller {
    async fn cancel(&self) {
        if let Err(e) = self.token.cancel_query(NoTls).await {
            tracing::warn!(error = %e, "failed to cancel running statement");
        }
    }
}
