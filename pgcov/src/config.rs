//! Connection target configuration.

use tokio_postgres::config::{Host, SslMode};
use tokio_postgres::Config;
use tracing::warn;

use crate::error::{BackendError, CoverageError, CoverageResult};

/// Application name the session registers under. Earlier sessions carrying
/// the same name are cancelled when a new session starts.
pub const APPLICATION_NAME: &str = "pgcov-html";

const DEFAULT_HOST: &str = "localhost";

/// Where to connect, in libpq key/value or URL form.
#[derive(Debug, Clone)]
pub struct ConnectionTarget {
    config: Config,
}

impl ConnectionTarget {
    /// Parse a connection string. An empty string yields an empty target that
    /// is completed by [`ConnectionTarget::with_env_fallbacks`].
    pub fn parse(conninfo: &str) -> CoverageResult<Self> {
        let mut config = if conninfo.trim().is_empty() {
            Config::new()
        } else {
            conninfo
                .parse::<Config>()
                .map_err(|err| CoverageError::connection("parse connection string", err))?
        };

        // Connections are made without TLS; `prefer` silently falls back.
        match config.get_ssl_mode() {
            SslMode::Disable | SslMode::Prefer => {}
            _ => {
                return Err(CoverageError::connection(
                    "configure TLS",
                    BackendError::unexpected(
                        "TLS connections are not supported; use sslmode=prefer or sslmode=disable",
                    ),
                ))
            }
        }

        if config.get_application_name().is_none() {
            config.application_name(APPLICATION_NAME);
        }

        Ok(Self { config })
    }

    /// Fill fields the connection string left unset from the standard `PG*`
    /// variables, falling back to `localhost` and the current `USER`.
    pub fn with_env_fallbacks<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let config = &mut self.config;

        if config.get_hosts().is_empty() {
            let host = lookup("PGHOST").unwrap_or_else(|| DEFAULT_HOST.to_string());
            config.host(&host);
        }
        if config.get_ports().is_empty() {
            if let Some(port) = lookup("PGPORT") {
                match port.parse::<u16>() {
                    Ok(port) => {
                        config.port(port);
                    }
                    Err(err) => warn!(value = %port, error = %err, "Ignoring invalid PGPORT"),
                }
            }
        }
        if config.get_user().is_none() {
            if let Some(user) = lookup("PGUSER").or_else(|| lookup("USER")) {
                config.user(&user);
            }
        }
        if config.get_password().is_none() {
            if let Some(password) = lookup("PGPASSWORD") {
                config.password(password);
            }
        }
        if config.get_dbname().is_none() {
            if let Some(dbname) = lookup("PGDATABASE") {
                config.dbname(&dbname);
            }
        }

        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Human-readable `host:port/dbname` for log lines; never includes credentials.
    pub fn describe(&self) -> String {
        let host = match self.config.get_hosts().first() {
            Some(Host::Tcp(name)) => name.clone(),
            #[cfg(unix)]
            Some(Host::Unix(path)) => path.display().to_string(),
            None => DEFAULT_HOST.to_string(),
        };
        let port = self.config.get_ports().first().copied().unwrap_or(5432);
        let dbname = self
            .config
            .get_dbname()
            .or_else(|| self.config.get_user())
            .unwrap_or("");
        format!("{host}:{port}/{dbname}")
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]

    use std::collections::HashMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn connection_target__empty_conninfo__then_sets_application_name() {
        let target = ConnectionTarget::parse("").expect("empty conninfo parses");
        assert_eq!(target.config().get_application_name(), Some(APPLICATION_NAME));
    }

    #[test]
    fn connection_target__explicit_application_name__then_kept() {
        let target = ConnectionTarget::parse("host=db application_name=suite")
            .expect("conninfo parses");
        assert_eq!(target.config().get_application_name(), Some("suite"));
    }

    #[test]
    fn connection_target__url__then_parsed() {
        let target = ConnectionTarget::parse("postgresql://alice@db.internal:6543/app")
            .expect("url parses");

        assert_eq!(target.config().get_user(), Some("alice"));
        assert_eq!(target.config().get_dbname(), Some("app"));
        assert_eq!(target.config().get_ports(), &[6543]);
    }

    #[test]
    fn connection_target__garbage__then_connection_error() {
        let err = ConnectionTarget::parse("host=db port=notaport").expect_err("bad port");
        assert_eq!(err.kind(), crate::error::ErrorKind::Connection);
    }

    #[test]
    fn connection_target__sslmode_require__then_rejected_before_connecting() {
        let err = ConnectionTarget::parse("host=db sslmode=require").expect_err("TLS required");

        assert_eq!(err.kind(), crate::error::ErrorKind::Connection);
        assert!(err.to_string().contains("could not configure TLS"), "{err}");
        assert!(err.to_string().contains("sslmode=prefer"), "{err}");
    }

    #[test]
    fn connection_target__sslmode_prefer_or_disable__then_accepted() {
        for conninfo in ["host=db sslmode=prefer", "host=db sslmode=disable", "host=db"] {
            assert!(ConnectionTarget::parse(conninfo).is_ok(), "{conninfo} rejected");
        }
    }

    #[test]
    fn connection_target__env_fallbacks__then_fill_unset_fields() {
        let target = ConnectionTarget::parse("")
            .expect("parse")
            .with_env_fallbacks(env(&[
                ("PGHOST", "pg.example"),
                ("PGPORT", "5433"),
                ("PGUSER", "tester"),
                ("PGPASSWORD", "secret"),
                ("PGDATABASE", "suite"),
            ]));

        let config = target.config();
        assert!(matches!(config.get_hosts(), [Host::Tcp(h)] if h == "pg.example"));
        assert_eq!(config.get_ports(), &[5433]);
        assert_eq!(config.get_user(), Some("tester"));
        assert_eq!(config.get_password(), Some(&b"secret"[..]));
        assert_eq!(config.get_dbname(), Some("suite"));
        assert_eq!(target.describe(), "pg.example:5433/suite");
    }

    #[test]
    fn connection_target__env_fallbacks__then_explicit_fields_win() {
        let target = ConnectionTarget::parse("host=primary user=owner dbname=main")
            .expect("parse")
            .with_env_fallbacks(env(&[
                ("PGHOST", "ignored"),
                ("PGUSER", "ignored"),
                ("PGDATABASE", "ignored"),
            ]));

        let config = target.config();
        assert!(matches!(config.get_hosts(), [Host::Tcp(h)] if h == "primary"));
        assert_eq!(config.get_user(), Some("owner"));
        assert_eq!(config.get_dbname(), Some("main"));
    }

    #[test]
    fn connection_target__no_env__then_defaults_to_localhost_and_user() {
        let target = ConnectionTarget::parse("")
            .expect("parse")
            .with_env_fallbacks(env(&[("USER", "runner"), ("PGPORT", "not-a-port")]));

        let config = target.config();
        assert!(matches!(config.get_hosts(), [Host::Tcp(h)] if h == "localhost"));
        assert!(config.get_ports().is_empty());
        assert_eq!(config.get_user(), Some("runner"));
        assert_eq!(target.describe(), "localhost:5432/runner");
    }
}
