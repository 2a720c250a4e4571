//! Coverage session protocol.
//!
//! A session holds one transaction open while the instrumentation facility's
//! listen call blocks on a spawned task. The backend handle travels into that
//! task and only comes back through the stop signal, so the transaction is
//! never used by two callers at once.
//!
//! Stopping cancels the listen call through the session's cancel token, waits
//! for the task to hand the backend back, rolls back to the savepoint taken
//! before listening and then harvests the per-function records. Closing rolls
//! back the transaction and gives up the connection.
//!
//! ```text
//! open ─> Created ─listen─> Listening ─stop─> Cancelling ─> Harvested ─close─> Closed
//! ```
//!
//! Any failure after `open` ends in `Closed` with the backend released, except
//! a cancel request that fails or times out: the session then stays in
//! `Cancelling` and dropping it aborts the listen task, which drops the
//! connection.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::backend::{CalledFunction, CoverageBackend, ListenCanceller, PgBackend};
use crate::config::ConnectionTarget;
use crate::error::{BackendError, CoverageError, CoverageResult};
use crate::record::{FunctionRecord, RecordSet};

#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// How long `stop` waits for the listen call to acknowledge cancellation.
    /// `None` waits indefinitely.
    pub cancel_timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Transaction open and savepoint taken; listen call not issued yet
    Created,
    Listening,
    /// Cancel requested, listen call not handed back yet
    Cancelling,
    /// Records harvested; transaction still held until `close`
    Harvested,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Created => "created",
            SessionState::Listening => "listening",
            SessionState::Cancelling => "cancelling",
            SessionState::Harvested => "harvested",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// What the listen task hands back when the listen call returns.
struct ListenerExit<B> {
    backend: B,
    outcome: Result<(), BackendError>,
}

/// Connect to `target` and start listening.
pub async fn start(
    target: &ConnectionTarget,
    options: SessionOptions,
) -> CoverageResult<ListeningSession<PgBackend>> {
    info!(database = %target.describe(), "Starting coverage session");
    let backend = PgBackend::connect(target).await?;
    ListeningSession::start(backend, options).await
}

pub struct ListeningSession<B: CoverageBackend> {
    backend_pid: i32,
    canceller: B::Canceller,
    /// Held while `Created` and `Harvested`; owned by the listen task in between.
    backend: Option<B>,
    stop_signal: Option<oneshot::Receiver<ListenerExit<B>>>,
    listener: Option<JoinHandle<()>>,
    options: SessionOptions,
    state: SessionState,
}

impl<B: CoverageBackend> ListeningSession<B> {
    /// Open the transaction, clear out orphaned listeners and take the
    /// savepoint. The backend is released if any step fails.
    pub async fn open(mut backend: B, options: SessionOptions) -> CoverageResult<Self> {
        let (backend_pid, orphaned) = match prepare(&mut backend).await {
            Ok(prepared) => prepared,
            Err(err) => {
                backend.release().await;
                return Err(err);
            }
        };
        debug!(
            backend_pid,
            orphaned_listeners = orphaned,
            "Coverage transaction prepared"
        );

        Ok(Self {
            backend_pid,
            canceller: backend.canceller(),
            backend: Some(backend),
            stop_signal: None,
            listener: None,
            options,
            state: SessionState::Created,
        })
    }

    /// Issue the listen call on a separate task.
    pub fn listen(&mut self) -> CoverageResult<()> {
        let backend = match (self.state, self.backend.take()) {
            (SessionState::Created, Some(backend)) => backend,
            (state, backend) => {
                self.backend = backend;
                return Err(CoverageError::InvalidState {
                    operation: "listen on",
                    state,
                });
            }
        };

        let (signal, stop_signal) = oneshot::channel();
        self.listener = Some(tokio::spawn(listen(backend, signal)));
        self.stop_signal = Some(stop_signal);
        self.state = SessionState::Listening;

        info!(backend_pid = self.backend_pid, "Coverage session listening");
        Ok(())
    }

    /// [`open`](Self::open) followed by [`listen`](Self::listen).
    pub async fn start(backend: B, options: SessionOptions) -> CoverageResult<Self> {
        let mut session = Self::open(backend, options).await?;
        session.listen()?;
        Ok(session)
    }

    pub fn backend_pid(&self) -> i32 {
        self.backend_pid
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Wait until `trigger` completes while the listen call keeps running.
    ///
    /// If the listen call returns first, for any reason, the session is
    /// closed and a protocol error is returned.
    pub async fn wait_for<F>(&mut self, trigger: F) -> CoverageResult<()>
    where
        F: Future<Output = ()>,
    {
        self.expect_state(SessionState::Listening, "wait on")?;
        let exit = {
            let Some(stop_signal) = self.stop_signal.as_mut() else {
                return Err(CoverageError::ListenerLost);
            };
            tokio::select! {
                () = trigger => return Ok(()),
                exit = stop_signal => exit,
            }
        };

        self.stop_signal = None;
        self.state = SessionState::Closed;
        let exit = exit.map_err(|_| CoverageError::ListenerLost)?;
        Err(premature_exit(exit).await)
    }

    /// Cancel the listen call and harvest the accumulated records.
    ///
    /// On success the session is `Harvested` and still holds the transaction
    /// until [`close`](Self::close). On failure after the listen call has been
    /// handed back, the backend is released and the session is `Closed`.
    pub async fn stop(&mut self) -> CoverageResult<RecordSet> {
        self.expect_state(SessionState::Listening, "stop")?;
        let stop_signal = self
            .stop_signal
            .take()
            .ok_or(CoverageError::ListenerLost)?;

        self.state = SessionState::Cancelling;
        debug!(backend_pid = self.backend_pid, state = %self.state, "Cancelling listen call");
        self.canceller
            .cancel()
            .await
            .map_err(|err| CoverageError::protocol("cancel request", err))?;

        let exit = match self.options.cancel_timeout {
            Some(limit) => timeout(limit, stop_signal)
                .await
                .map_err(|_| CoverageError::CancelTimedOut(limit))?,
            None => stop_signal.await,
        };
        let ListenerExit {
            mut backend,
            outcome,
        } = exit.map_err(|_| CoverageError::ListenerLost)?;

        let result = match outcome {
            Ok(()) => harvest(&mut backend).await,
            Err(err) if err.is_cancelled() => harvest(&mut backend).await,
            Err(err) => Err(CoverageError::protocol("listen call", err)),
        };

        match result {
            Ok(records) => {
                self.backend = Some(backend);
                self.state = SessionState::Harvested;
                info!(
                    backend_pid = self.backend_pid,
                    functions = records.len(),
                    "Harvested coverage records"
                );
                Ok(records)
            }
            Err(err) => {
                backend.release().await;
                self.state = SessionState::Closed;
                Err(err)
            }
        }
    }

    /// Roll back the held transaction. Closing twice is a no-op.
    pub async fn close(&mut self) {
        if let Some(mut backend) = self.backend.take() {
            backend.release().await;
        }
        if self.state != SessionState::Closed {
            debug!(backend_pid = self.backend_pid, from = %self.state, "Coverage session closed");
        }
        self.state = SessionState::Closed;
    }

    fn expect_state(&self, expected: SessionState, operation: &'static str) -> CoverageResult<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(CoverageError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }
}

impl<B: CoverageBackend> Drop for ListeningSession<B> {
    fn drop(&mut self) {
        // Dropping the listen task drops the backend and closes the connection.
        if let Some(listener) = &self.listener {
            listener.abort();
        }
    }
}

async fn prepare<B: CoverageBackend>(backend: &mut B) -> CoverageResult<(i32, u64)> {
    backend
        .begin()
        .await
        .map_err(|err| CoverageError::connection("begin transaction", err))?;
    let orphaned = backend
        .cancel_orphaned_listeners()
        .await
        .map_err(|err| CoverageError::connection("cancel orphaned listeners", err))?;
    let backend_pid = backend
        .backend_pid()
        .await
        .map_err(|err| CoverageError::connection("read backend pid", err))?;
    backend
        .set_savepoint()
        .await
        .map_err(|err| CoverageError::connection("set savepoint", err))?;
    Ok((backend_pid, orphaned))
}

async fn listen<B: CoverageBackend>(mut backend: B, signal: oneshot::Sender<ListenerExit<B>>) {
    let outcome = backend.listen().await;
    match &outcome {
        Ok(()) => debug!("Listen call returned"),
        Err(BackendError::Cancelled) => debug!("Listen call cancelled"),
        Err(err) => warn!(error = %err, "Listen call failed"),
    }
    // The receiver is gone only if the session was dropped.
    let _ = signal.send(ListenerExit { backend, outcome });
}

async fn premature_exit<B: CoverageBackend>(exit: ListenerExit<B>) -> CoverageError {
    let ListenerExit {
        mut backend,
        outcome,
    } = exit;
    backend.release().await;
    match outcome {
        Ok(()) => CoverageError::protocol(
            "listen call",
            BackendError::unexpected("returned before a stop was requested"),
        ),
        Err(err) => CoverageError::protocol("listen call", err),
    }
}

async fn harvest<B: CoverageBackend>(backend: &mut B) -> CoverageResult<RecordSet> {
    backend
        .undo_interrupted()
        .await
        .map_err(|err| CoverageError::protocol("rollback to savepoint", err))?;

    let called = backend
        .called_functions()
        .await
        .map_err(|err| CoverageError::protocol("list called functions", err))?;

    let mut records = Vec::with_capacity(called.len());
    for CalledFunction { signature, calls } in called {
        let source = backend
            .function_source(&signature)
            .await
            .map_err(|err| CoverageError::protocol("fetch function source", err))?;
        let samples = backend
            .line_samples(&signature)
            .await
            .map_err(|err| CoverageError::protocol("fetch line coverage", err))?;

        debug!(
            signature = %signature,
            calls,
            samples = samples.len(),
            has_source = source.is_some(),
            "Harvested function"
        );
        records.push(FunctionRecord::new(signature, calls, source, samples)?);
    }

    RecordSet::new(records)
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]

    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use super::*;
    use crate::error::ErrorKind;
    use crate::record::LineSample;

    #[derive(Clone, Copy)]
    enum ListenScript {
        UntilCancelled,
        FailAfterCancel,
        FailImmediately,
        IgnoreCancel,
    }

    #[derive(Default)]
    struct Journal {
        calls: Mutex<Vec<String>>,
    }

    impl Journal {
        fn push(&self, call: impl Into<String>) {
            self.calls.lock().unwrap().push(call.into());
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    struct FakeFunction {
        signature: &'static str,
        calls: u64,
        source: Option<&'static str>,
        samples: Vec<LineSample>,
    }

    struct FakeBackend {
        script: ListenScript,
        fail_at: Option<&'static str>,
        functions: Vec<FakeFunction>,
        journal: Arc<Journal>,
        cancel_requested: Arc<Notify>,
        cancel_fails: bool,
        dropped: Arc<AtomicBool>,
    }

    impl FakeBackend {
        fn new(script: ListenScript) -> Self {
            Self {
                script,
                fail_at: None,
                functions: Vec::new(),
                journal: Arc::new(Journal::default()),
                cancel_requested: Arc::new(Notify::new()),
                cancel_fails: false,
                dropped: Arc::new(AtomicBool::new(false)),
            }
        }

        fn with_function(
            mut self,
            signature: &'static str,
            calls: u64,
            source: Option<&'static str>,
            samples: &[(u32, u64)],
        ) -> Self {
            self.functions.push(FakeFunction {
                signature,
                calls,
                source,
                samples: samples
                    .iter()
                    .map(|&(line, count)| LineSample::new(line, count))
                    .collect(),
            });
            self
        }

        fn failing_at(mut self, step: &'static str) -> Self {
            self.fail_at = Some(step);
            self
        }

        fn step(&self, name: &str) -> Result<(), BackendError> {
            self.journal.push(name);
            if self.fail_at == Some(name) {
                return Err(BackendError::unexpected(format!("{name} exploded")));
            }
            Ok(())
        }

        fn function(&self, signature: &str) -> &FakeFunction {
            self.functions
                .iter()
                .find(|f| f.signature == signature)
                .expect("known function")
        }
    }

    impl Drop for FakeBackend {
        fn drop(&mut self) {
            self.dropped.store(true, Ordering::SeqCst);
        }
    }

    struct FakeCanceller {
        journal: Arc<Journal>,
        cancel_requested: Arc<Notify>,
        fails: bool,
    }

    #[async_trait]
    impl ListenCanceller for FakeCanceller {
        async fn cancel(&self) -> Result<(), BackendError> {
            self.journal.push("cancel");
            if self.fails {
                return Err(BackendError::unexpected("could not reach server"));
            }
            self.cancel_requested.notify_one();
            Ok(())
        }
    }

    #[async_trait]
    impl CoverageBackend for FakeBackend {
        type Canceller = FakeCanceller;

        fn canceller(&self) -> FakeCanceller {
            FakeCanceller {
                journal: Arc::clone(&self.journal),
                cancel_requested: Arc::clone(&self.cancel_requested),
                fails: self.cancel_fails,
            }
        }

        async fn begin(&mut self) -> Result<(), BackendError> {
            self.step("begin")
        }

        async fn cancel_orphaned_listeners(&mut self) -> Result<u64, BackendError> {
            self.step("cancel_orphaned")?;
            Ok(1)
        }

        async fn backend_pid(&mut self) -> Result<i32, BackendError> {
            self.step("backend_pid")?;
            Ok(4242)
        }

        async fn set_savepoint(&mut self) -> Result<(), BackendError> {
            self.step("savepoint")
        }

        async fn listen(&mut self) -> Result<(), BackendError> {
            self.journal.push("listen");
            match self.script {
                ListenScript::UntilCancelled => {
                    self.cancel_requested.notified().await;
                    Err(BackendError::Cancelled)
                }
                ListenScript::FailAfterCancel => {
                    self.cancel_requested.notified().await;
                    Err(BackendError::unexpected("server closed the connection"))
                }
                ListenScript::FailImmediately => {
                    Err(BackendError::unexpected("function pgcov.pgcov_listen() does not exist"))
                }
                ListenScript::IgnoreCancel => std::future::pending().await,
            }
        }

        async fn undo_interrupted(&mut self) -> Result<(), BackendError> {
            self.step("undo_interrupted")
        }

        async fn called_functions(&mut self) -> Result<Vec<CalledFunction>, BackendError> {
            self.step("called_functions")?;
            Ok(self
                .functions
                .iter()
                .map(|f| CalledFunction {
                    signature: f.signature.to_string(),
                    calls: f.calls,
                })
                .collect())
        }

        async fn function_source(
            &mut self,
            signature: &str,
        ) -> Result<Option<String>, BackendError> {
            self.step("function_source")?;
            Ok(self.function(signature).source.map(str::to_string))
        }

        async fn line_samples(&mut self, signature: &str) -> Result<Vec<LineSample>, BackendError> {
            self.step("line_samples")?;
            Ok(self.function(signature).samples.clone())
        }

        async fn release(&mut self) {
            self.journal.push("release");
        }
    }

    fn without_timeout() -> SessionOptions {
        SessionOptions::default()
    }

    #[tokio::test]
    async fn session__start_then_stop__then_harvests_records_in_order() {
        let backend = FakeBackend::new(ListenScript::UntilCancelled)
            .with_function("public.a(integer)", 3, Some("BEGIN\nRETURN 1;\nEND;"), &[(1, 3), (2, 3)])
            .with_function("public.b()", 1, None, &[]);
        let journal = Arc::clone(&backend.journal);

        let mut session = ListeningSession::start(backend, without_timeout())
            .await
            .expect("session starts");
        assert_eq!(session.backend_pid(), 4242);
        assert_eq!(session.state(), SessionState::Listening);

        let records = session.stop().await.expect("stop harvests");
        assert_eq!(session.state(), SessionState::Harvested);
        assert!(!journal.calls().contains(&"release".to_string()));
        session.close().await;
        assert_eq!(session.state(), SessionState::Closed);

        assert_eq!(records.len(), 2);
        let a = records.get("public.a(integer)").expect("a harvested");
        assert_eq!(a.calls(), 3);
        assert_eq!(a.source(), Some("BEGIN\nRETURN 1;\nEND;"));
        assert_eq!(a.samples(), &[LineSample::new(1, 3), LineSample::new(2, 3)]);
        let b = records.get("public.b()").expect("b harvested");
        assert!(!b.has_source());

        assert_eq!(
            journal.calls(),
            vec![
                "begin",
                "cancel_orphaned",
                "backend_pid",
                "savepoint",
                "listen",
                "cancel",
                "undo_interrupted",
                "called_functions",
                "function_source",
                "line_samples",
                "function_source",
                "line_samples",
                "release",
            ]
        );
    }

    #[tokio::test]
    async fn session__stop_with_non_cancellation_error__then_protocol_error_and_no_records() {
        let backend = FakeBackend::new(ListenScript::FailAfterCancel).with_function(
            "public.a()",
            1,
            Some("BEGIN"),
            &[(1, 1)],
        );
        let journal = Arc::clone(&backend.journal);

        let mut session = ListeningSession::start(backend, without_timeout())
            .await
            .expect("session starts");
        let err = session.stop().await.expect_err("listen failure must propagate");

        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert!(err.to_string().contains("listen call failed"), "{err}");
        let calls = journal.calls();
        assert!(!calls.contains(&"undo_interrupted".to_string()));
        assert!(!calls.contains(&"called_functions".to_string()));
        assert_eq!(calls.last().map(String::as_str), Some("release"));
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn session__begin_fails__then_connection_error() {
        let backend = FakeBackend::new(ListenScript::UntilCancelled).failing_at("begin");
        let journal = Arc::clone(&backend.journal);

        let err = match ListeningSession::start(backend, without_timeout()).await {
            Ok(_) => panic!("start must fail"),
            Err(err) => err,
        };

        assert_eq!(err.kind(), ErrorKind::Connection);
        assert!(err.to_string().contains("begin transaction"));
        assert_eq!(journal.calls(), vec!["begin", "release"]);
    }

    #[tokio::test]
    async fn session__savepoint_fails__then_connection_error_without_listening() {
        let backend = FakeBackend::new(ListenScript::UntilCancelled).failing_at("savepoint");
        let journal = Arc::clone(&backend.journal);

        let result = ListeningSession::start(backend, without_timeout()).await;

        assert!(matches!(result, Err(CoverageError::Connection { stage: "set savepoint", .. })));
        assert!(!journal.calls().contains(&"listen".to_string()));
    }

    #[tokio::test]
    async fn session__wait_for_trigger__then_keeps_listening() {
        let backend = FakeBackend::new(ListenScript::UntilCancelled).with_function(
            "f()",
            2,
            Some("BEGIN"),
            &[(1, 2)],
        );

        let mut session = ListeningSession::start(backend, without_timeout())
            .await
            .expect("session starts");
        session
            .wait_for(async {})
            .await
            .expect("trigger completes first");

        assert_eq!(session.state(), SessionState::Listening);
        let records = session.stop().await.expect("stop harvests");
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn session__listen_fails_before_trigger__then_protocol_error() {
        let backend = FakeBackend::new(ListenScript::FailImmediately);
        let journal = Arc::clone(&backend.journal);

        let mut session = ListeningSession::start(backend, without_timeout())
            .await
            .expect("session starts");
        let err = session
            .wait_for(std::future::pending())
            .await
            .expect_err("listen failure ends the wait");

        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert!(err.to_string().contains("does not exist"));
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(journal.calls().last().map(String::as_str), Some("release"));

        let err = session.stop().await.expect_err("session already closed");
        assert!(matches!(
            err,
            CoverageError::InvalidState {
                operation: "stop",
                state: SessionState::Closed
            }
        ));
    }

    #[tokio::test]
    async fn session__cancel_request_fails__then_protocol_error() {
        let mut backend = FakeBackend::new(ListenScript::UntilCancelled);
        backend.cancel_fails = true;

        let mut session = ListeningSession::start(backend, without_timeout())
            .await
            .expect("session starts");
        let err = session.stop().await.expect_err("cancel failure propagates");

        assert!(matches!(err, CoverageError::Protocol { stage: "cancel request", .. }));
        assert_eq!(session.state(), SessionState::Cancelling);
    }

    #[tokio::test(start_paused = true)]
    async fn session__cancel_never_acknowledged__then_times_out() {
        let backend = FakeBackend::new(ListenScript::IgnoreCancel);
        let options = SessionOptions {
            cancel_timeout: Some(Duration::from_secs(5)),
        };

        let mut session = ListeningSession::start(backend, options)
            .await
            .expect("session starts");
        let err = session.stop().await.expect_err("stop must give up");

        assert!(matches!(err, CoverageError::CancelTimedOut(limit) if limit == Duration::from_secs(5)));
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert_eq!(session.state(), SessionState::Cancelling);
    }

    #[tokio::test]
    async fn session__harvest_query_fails__then_no_records_and_released() {
        let backend = FakeBackend::new(ListenScript::UntilCancelled)
            .with_function("f()", 1, Some("BEGIN"), &[(1, 1)])
            .failing_at("line_samples");
        let journal = Arc::clone(&backend.journal);

        let mut session = ListeningSession::start(backend, without_timeout())
            .await
            .expect("session starts");
        let err = session.stop().await.expect_err("harvest failure propagates");

        assert!(matches!(err, CoverageError::Protocol { stage: "fetch line coverage", .. }));
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(journal.calls().last().map(String::as_str), Some("release"));
    }

    #[tokio::test]
    async fn session__malformed_samples__then_protocol_error() {
        let backend = FakeBackend::new(ListenScript::UntilCancelled).with_function(
            "f()",
            1,
            Some("BEGIN\nEND;"),
            &[(2, 1), (1, 1)],
        );

        let mut session = ListeningSession::start(backend, without_timeout())
            .await
            .expect("session starts");
        let err = session.stop().await.expect_err("unsorted samples rejected");

        assert!(matches!(err, CoverageError::MalformedRecord { .. }));
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[tokio::test]
    async fn session__dropped_without_stop__then_backend_released() {
        let backend = FakeBackend::new(ListenScript::IgnoreCancel);
        let dropped = Arc::clone(&backend.dropped);

        let session = ListeningSession::start(backend, without_timeout())
            .await
            .expect("session starts");
        drop(session);

        tokio::time::timeout(Duration::from_secs(2), async {
            while !dropped.load(Ordering::SeqCst) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("listen task must drop the backend");
    }

    #[tokio::test]
    async fn session__open_then_listen__then_walks_created_to_listening() {
        let backend = FakeBackend::new(ListenScript::UntilCancelled);
        let journal = Arc::clone(&backend.journal);

        let mut session = ListeningSession::open(backend, without_timeout())
            .await
            .expect("session opens");
        assert_eq!(session.state(), SessionState::Created);
        assert!(!journal.calls().contains(&"listen".to_string()));

        let err = session.stop().await.expect_err("nothing to stop yet");
        assert!(matches!(
            err,
            CoverageError::InvalidState {
                state: SessionState::Created,
                ..
            }
        ));

        session.listen().expect("listen issued");
        assert_eq!(session.state(), SessionState::Listening);

        let err = session.listen().expect_err("listen only once");
        assert!(matches!(
            err,
            CoverageError::InvalidState {
                operation: "listen on",
                state: SessionState::Listening
            }
        ));

        session.stop().await.expect("stop harvests");
        session.close().await;
        assert_eq!(
            journal.calls().iter().filter(|call| *call == "release").count(),
            1
        );
    }

    #[tokio::test]
    async fn session__closed_while_created__then_released_without_listening() {
        let backend = FakeBackend::new(ListenScript::UntilCancelled);
        let journal = Arc::clone(&backend.journal);

        let mut session = ListeningSession::open(backend, without_timeout())
            .await
            .expect("session opens");
        session.close().await;
        session.close().await;

        assert_eq!(session.state(), SessionState::Closed);
        let calls = journal.calls();
        assert_eq!(calls.last().map(String::as_str), Some("release"));
        assert_eq!(calls.iter().filter(|call| *call == "release").count(), 1);
        assert!(!calls.contains(&"listen".to_string()));
        assert!(session.listen().is_err());
    }

    #[test]
    fn session_state__display__then_lowercase_names() {
        assert_eq!(SessionState::Created.to_string(), "created");
        assert_eq!(SessionState::Cancelling.to_string(), "cancelling");
        assert_eq!(SessionState::Harvested.to_string(), "harvested");
        assert_eq!(SessionState::Closed.to_string(), "closed");
    }
}
