use std::time::Duration;

use encoding_rs::Encoding;
use tokio::time::Instant;

use crate::protocol::{call_bytes, decode_response, Response};
use crate::transport::{CoqProcess, ReadError};
use crate::types::{CoqConfig, CoqError};
use crate::value::{RouteId, StateId, Value};

/// Bound on the `Init` handshake. A backend that cannot answer this fast
/// was launched with a broken executable or arguments.
pub const INIT_TIMEOUT: Duration = Duration::from_secs(1);

/// Edit position sentinel sent with every `Add`.
const EDIT_ID: i64 = -1;

/// Route used by routed queries.
const DEFAULT_ROUTE: RouteId = RouteId(0);

/// A document session with one backend process.
///
/// Tracks the checkpoint (state id) the next sentence extends and the stack
/// of checkpoints passed by successful sentences, so sentences can be
/// undone with [`CoqSession::rewind`]. Calls are strictly one at a time.
pub struct CoqSession {
    process: CoqProcess,
    config: CoqConfig,
    root: StateId,
    current: StateId,
    history: Vec<StateId>,
    /// Name of the call whose reply is still owed after a timeout.
    pending: Option<String>,
}

impl CoqSession {
    /// Launch the configured backend and perform the `Init` handshake.
    ///
    /// The process is terminated before any error is returned.
    pub async fn initialize(config: CoqConfig) -> Result<Self, CoqError> {
        let args = config.backend_args();
        let process = CoqProcess::spawn(&config.executable, &args, config.working_dir.as_deref())?;
        Self::with_process(process, config).await
    }

    /// Run the `Init` handshake over an already-started process.
    pub async fn with_process(mut process: CoqProcess, config: CoqConfig) -> Result<Self, CoqError> {
        match handshake(&mut process).await {
            Ok(root) => {
                tracing::info!(root = %root, "coqtop session initialized");
                Ok(Self {
                    process,
                    config,
                    root,
                    current: root,
                    history: Vec::new(),
                    pending: None,
                })
            }
            Err(e) => {
                tracing::warn!(error = %e, "coqtop initialization failed");
                process.terminate().await;
                Err(e)
            }
        }
    }

    /// Kill the backend and start a fresh one with the same configuration.
    ///
    /// All checkpoint state is discarded. If the relaunch fails the session
    /// stays terminated.
    pub async fn restart(&mut self) -> Result<(), CoqError> {
        self.process.terminate().await;
        self.history.clear();
        self.current = self.root;
        let fresh = Self::initialize(self.config.clone()).await?;
        *self = fresh;
        Ok(())
    }

    /// Terminate the backend. Idempotent.
    pub async fn shutdown(&mut self) {
        self.process.terminate().await;
    }

    /// Send one call and wait for its reply.
    ///
    /// With `timeout`, the whole call is bounded and running out yields
    /// [`CoqError::Timeout`] with the backend left alive. Without it, only
    /// the per-read readiness wait (the configured default) applies. A
    /// backend that stops producing output is terminated and reported as
    /// [`CoqError::BackendDied`].
    ///
    /// A new call gives up on any reply still owed to an earlier timeout;
    /// that reply is skipped when it arrives.
    pub async fn call(
        &mut self,
        name: &str,
        arg: &Value,
        encoding: &'static Encoding,
        timeout: Option<Duration>,
    ) -> Result<Response, CoqError> {
        self.pending = None;
        let readiness = timeout.unwrap_or_else(|| self.config.timeout());
        let result = call_process(&mut self.process, name, arg, encoding, readiness, timeout).await;
        self.note_timeout(name, &result);
        result
    }

    /// Keep waiting for the reply to the call that last timed out.
    ///
    /// If that call was an `advance`, the checkpoint state is updated as if
    /// it had answered in time.
    pub async fn resume(&mut self, timeout: Option<Duration>) -> Result<Response, CoqError> {
        let name = self.pending.take().ok_or(CoqError::NothingPending)?;
        let readiness = timeout.unwrap_or_else(|| self.config.timeout());
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let result = match self.process.resume_message(readiness, deadline).await {
            Ok(reply) => decode_response(&reply.value, reply.annotation),
            Err(e) => Err(read_failure(&mut self.process, &name, e, readiness, timeout).await),
        };
        self.note_timeout(&name, &result);

        let response = result?;
        if name == "Add" {
            self.record_added(&response)?;
        }
        Ok(response)
    }

    /// Whether a timed-out call can still be [`resume`](Self::resume)d.
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    fn note_timeout(&mut self, name: &str, result: &Result<Response, CoqError>) {
        if matches!(result, Err(CoqError::Timeout { .. })) {
            self.pending = Some(name.to_string());
        }
    }

    fn record_added(&mut self, response: &Response) -> Result<(), CoqError> {
        if let Response::Ok { value, .. } = response {
            let next = added_state_id(value)?;
            tracing::debug!(from = %self.current, to = %next, "Sentence added");
            self.history.push(self.current);
            self.current = next;
        }
        Ok(())
    }

    /// Add a sentence after the current checkpoint.
    ///
    /// On success the previous checkpoint is pushed onto the history and the
    /// backend's new state id becomes current. A failed sentence leaves the
    /// state untouched.
    pub async fn advance(
        &mut self,
        command: &str,
        encoding: &'static Encoding,
    ) -> Result<Response, CoqError> {
        let arg = Value::pair(
            Value::pair(Value::str(command), Value::Int(EDIT_ID)),
            Value::pair(Value::StateId(self.current), Value::Bool(true)),
        );
        let timeout = self.config.timeout();
        let response = self.call("Add", &arg, encoding, Some(timeout)).await?;
        self.record_added(&response)?;
        Ok(response)
    }

    /// Undo the last `steps` sentences.
    ///
    /// Local state moves before the backend confirms the `Edit_at`. If that
    /// call fails the two disagree and the session should be restarted.
    pub async fn rewind(&mut self, steps: usize) -> Result<Response, CoqError> {
        if steps > self.history.len() {
            return Err(CoqError::RewindTooFar {
                requested: steps,
                available: self.history.len(),
            });
        }
        let target = self.history.len() - steps;
        if let Some(&state) = self.history.get(target) {
            self.current = state;
        }
        self.history.truncate(target);
        tracing::debug!(steps, to = %self.current, "Rewinding");

        self.call("Edit_at", &Value::StateId(self.current), encoding_rs::UTF_8, None)
            .await
    }

    /// Run a query against the current checkpoint without changing it.
    ///
    /// `routed` sends it on the default feedback route.
    pub async fn query(
        &mut self,
        command: &str,
        encoding: &'static Encoding,
        routed: bool,
    ) -> Result<Response, CoqError> {
        let query = Value::pair(Value::str(command), Value::StateId(self.current));
        let arg = if routed {
            Value::pair(Value::RouteId(DEFAULT_ROUTE), query)
        } else {
            query
        };
        self.call("Query", &arg, encoding, None).await
    }

    /// Fetch the goals at the current checkpoint.
    pub async fn goals(&mut self, timeout: Option<Duration>) -> Result<Response, CoqError> {
        let timeout = timeout.unwrap_or_else(|| self.config.timeout());
        self.call("Goal", &Value::Unit, encoding_rs::UTF_8, Some(timeout))
            .await
    }

    pub fn is_running(&self) -> bool {
        self.process.is_running()
    }

    /// Checkpoints passed by successful sentences, oldest first.
    pub fn history(&self) -> &[StateId] {
        &self.history
    }

    /// The checkpoint the next sentence extends.
    pub fn current_state(&self) -> StateId {
        self.current
    }

    /// The checkpoint returned by `Init`.
    pub fn root_state(&self) -> StateId {
        self.root
    }

    pub fn config(&self) -> &CoqConfig {
        &self.config
    }
}

async fn handshake(process: &mut CoqProcess) -> Result<StateId, CoqError> {
    let response = call_process(
        process,
        "Init",
        &Value::none(),
        encoding_rs::UTF_8,
        INIT_TIMEOUT,
        Some(INIT_TIMEOUT),
    )
    .await?;

    match &response {
        Response::Ok { value, .. } => value.as_state_id().ok_or_else(|| {
            CoqError::Protocol(format!("Init returned {} instead of a state id", value.kind()))
        }),
        Response::Err { .. } => Err(CoqError::Launch(format!(
            "backend rejected Init: {}",
            response.error_message().unwrap_or_default().trim()
        ))),
    }
}

async fn call_process(
    process: &mut CoqProcess,
    name: &str,
    arg: &Value,
    encoding: &'static Encoding,
    readiness: Duration,
    timeout: Option<Duration>,
) -> Result<Response, CoqError> {
    let started = Instant::now();
    let deadline = timeout.and_then(|t| started.checked_add(t));

    process.send(&call_bytes(name, arg, encoding)).await?;

    match process.read_message(readiness, deadline).await {
        Ok(reply) => {
            tracing::trace!(call = name, elapsed_ms = started.elapsed().as_millis() as u64, "Reply received");
            decode_response(&reply.value, reply.annotation)
        }
        Err(e) => Err(read_failure(process, name, e, readiness, timeout).await),
    }
}

async fn read_failure(
    process: &mut CoqProcess,
    name: &str,
    error: ReadError,
    readiness: Duration,
    timeout: Option<Duration>,
) -> CoqError {
    match error {
        ReadError::Timeout => {
            let timeout_secs = timeout.unwrap_or(readiness).as_secs_f64();
            tracing::warn!(call = name, timeout_secs, "coqtop call timed out");
            CoqError::Timeout { timeout_secs }
        }
        ReadError::Died => {
            let timeout_secs = readiness.as_secs_f64();
            tracing::warn!(call = name, timeout_secs, "coqtop stopped responding, terminating");
            process.terminate().await;
            CoqError::BackendDied { timeout_secs }
        }
        ReadError::Io(e) => CoqError::Transport(e),
    }
}

/// `Add` answers `(new_state_id, (union, message))`.
fn added_state_id(value: &Value) -> Result<StateId, CoqError> {
    match value {
        Value::Pair(first, _) => first.as_state_id().ok_or_else(|| {
            CoqError::Protocol(format!("Add returned {} instead of a state id", first.kind()))
        }),
        other => Err(CoqError::Protocol(format!(
            "Add returned {} instead of a pair",
            other.kind()
        ))),
    }
}
