//! Data access for the instrumentation facility.
//!
//! [`CoverageBackend`] is the seam between the session protocol and the
//! database. The production implementation, [`PgBackend`], talks to the
//! `pgcov` extension over one `tokio-postgres` connection.

use async_trait::async_trait;
use tokio_postgres::{CancelToken, Client, NoTls, Row};
use tracing::{debug, warn};

use crate::config::{ConnectionTarget, APPLICATION_NAME};
use crate::error::{BackendError, CoverageError, CoverageResult};
use crate::record::LineSample;

const SAVEPOINT: &str = "pgcov_listen";

/// One row of the facility's called-functions report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalledFunction {
    pub signature: String,
    pub calls: u64,
}

/// Operations the session protocol needs from the held connection.
///
/// All methods run against the same transaction. Implementations are moved
/// into the listen task while the listen call is outstanding.
#[async_trait]
pub trait CoverageBackend: Send + 'static {
    type Canceller: ListenCanceller;

    /// Token that interrupts a statement running on this connection
    fn canceller(&self) -> Self::Canceller;

    async fn begin(&mut self) -> Result<(), BackendError>;

    /// Best-effort cancel of listeners left behind by earlier sessions.
    /// Returns how many backends accepted the cancel signal.
    async fn cancel_orphaned_listeners(&mut self) -> Result<u64, BackendError>;

    async fn backend_pid(&mut self) -> Result<i32, BackendError>;

    async fn set_savepoint(&mut self) -> Result<(), BackendError>;

    /// Blocks until the facility stops listening. An intentional stop comes
    /// back as [`BackendError::Cancelled`].
    async fn listen(&mut self) -> Result<(), BackendError>;

    /// Roll back to the savepoint, undoing only what the interrupted listen
    /// call left behind.
    async fn undo_interrupted(&mut self) -> Result<(), BackendError>;

    /// Called functions ordered by signature
    async fn called_functions(&mut self) -> Result<Vec<CalledFunction>, BackendError>;

    async fn function_source(&mut self, signature: &str) -> Result<Option<String>, BackendError>;

    /// Line samples ordered by line number
    async fn line_samples(&mut self, signature: &str) -> Result<Vec<LineSample>, BackendError>;

    /// Roll back the held transaction. Failures are logged, not returned.
    async fn release(&mut self);
}

/// Interrupts the statement currently running on a session's connection.
#[async_trait]
pub trait ListenCanceller: Send + Sync + 'static {
    async fn cancel(&self) -> Result<(), BackendError>;
}

pub struct PgBackend {
    client: Client,
}

impl PgBackend {
    pub async fn connect(target: &ConnectionTarget) -> CoverageResult<Self> {
        let (client, connection) = target
            .config()
            .connect(NoTls)
            .await
            .map_err(|err| CoverageError::connection("connect to database", err))?;

        tokio::spawn(async move {
            if let Err(err) = connection.await {
                warn!(error = %err, "Database connection closed with error");
            }
        });

        debug!(database = %target.describe(), "Connected to database");
        Ok(Self { client })
    }
}

#[async_trait]
impl CoverageBackend for PgBackend {
    type Canceller = PgCanceller;

    fn canceller(&self) -> PgCanceller {
        PgCanceller {
            token: self.client.cancel_token(),
        }
    }

    async fn begin(&mut self) -> Result<(), BackendError> {
        self.client.batch_execute("BEGIN").await?;
        Ok(())
    }

    async fn cancel_orphaned_listeners(&mut self) -> Result<u64, BackendError> {
        let row = self
            .client
            .query_one(
                "SELECT count(*) FILTER (WHERE pg_cancel_backend(pid)) FROM pg_stat_activity \
                 WHERE application_name = $1 AND pid <> pg_backend_pid()",
                &[&APPLICATION_NAME],
            )
            .await?;
        non_negative(&row, 0, "cancelled backends")
    }

    async fn backend_pid(&mut self) -> Result<i32, BackendError> {
        let row = self.client.query_one("SELECT pg_backend_pid()", &[]).await?;
        Ok(row.try_get(0)?)
    }

    async fn set_savepoint(&mut self) -> Result<(), BackendError> {
        self.client
            .batch_execute(&format!("SAVEPOINT {SAVEPOINT}"))
            .await?;
        Ok(())
    }

    async fn listen(&mut self) -> Result<(), BackendError> {
        self.client
            .batch_execute("SELECT pgcov.pgcov_listen()")
            .await?;
        Ok(())
    }

    async fn undo_interrupted(&mut self) -> Result<(), BackendError> {
        self.client
            .batch_execute(&format!("ROLLBACK TO SAVEPOINT {SAVEPOINT}"))
            .await?;
        Ok(())
    }

    async fn called_functions(&mut self) -> Result<Vec<CalledFunction>, BackendError> {
        let rows = self
            .client
            .query(
                "SELECT fnsignature::text, ncalls::int8 \
                 FROM pgcov.pgcov_called_functions() ORDER BY fnsignature",
                &[],
            )
            .await?;

        rows.iter()
            .map(|row| -> Result<CalledFunction, BackendError> {
                Ok(CalledFunction {
                    signature: row.try_get(0)?,
                    calls: non_negative(row, 1, "ncalls")?,
                })
            })
            .collect()
    }

    async fn function_source(&mut self, signature: &str) -> Result<Option<String>, BackendError> {
        let row = self
            .client
            .query_one(
                "SELECT pgcov.pgcov_fn_line_coverage_src($1)::text",
                &[&signature],
            )
            .await?;
        Ok(row.try_get(0)?)
    }

    async fn line_samples(&mut self, signature: &str) -> Result<Vec<LineSample>, BackendError> {
        let rows = self
            .client
            .query(
                "SELECT lineno::int4, ncalls::int8 \
                 FROM pgcov.pgcov_fn_line_coverage($1) ORDER BY lineno",
                &[&signature],
            )
            .await?;

        rows.iter()
            .map(|row| -> Result<LineSample, BackendError> {
                let line: i32 = row.try_get(0)?;
                let line = u32::try_from(line)
                    .map_err(|_| BackendError::unexpected(format!("negative line number {line}")))?;
                Ok(LineSample::new(line, non_negative(row, 1, "ncalls")?))
            })
            .collect()
    }

    async fn release(&mut self) {
        if let Err(err) = self.client.batch_execute("ROLLBACK").await {
            warn!(error = %err, "Failed to roll back coverage transaction");
        }
    }
}

fn non_negative(row: &Row, idx: usize, column: &str) -> Result<u64, BackendError> {
    let value: i64 = row.try_get(idx)?;
    u64::try_from(value)
        .map_err(|_| BackendError::unexpected(format!("negative {column} value {value}")))
}

/// Sends a cancel request for the session's backend over a separate connection.
pub struct PgCanceller {
    token: CancelToken,
}

#[async_trait]
impl ListenCanceller for PgCanceller {
    async fn cancel(&self) -> Result<(), BackendError> {
        self.token.cancel_query(NoTls).await?;
        Ok(())
    }
}
