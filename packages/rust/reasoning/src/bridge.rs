//! Reasoning bridge subprocess.
//!
//! Spawns the configured bridge command, talks a JSON-lines protocol over
//! stdin/stdout, and validates every batch item against its expected
//! schema. Stderr is inherited so bridge logs land next to ours.

use std::io::{BufRead, BufReader, Write};
use std::process::{Child, Command, Stdio};

use serde::de::DeserializeOwned;
use tracing::{info, instrument, warn};

use lorekeeper_shared::{BridgeConfig, LorekeeperError, Result, RetryPolicy};

use crate::Reasoner;
use crate::protocol::{
    AnswerRequest, ArbitrateRequest, ErrorKind, ExtractRequest, ItemOutcome, RawAnswer,
    RawDecision, RawExtraction, RawMerged, RequestMessage, ResponseMessage, SynthesizeRequest,
    TaskKind,
};

// ---------------------------------------------------------------------------
// Bridge handle
// ---------------------------------------------------------------------------

/// Handle to the spawned bridge subprocess.
struct BridgeHandle {
    child: Child,
    stdin: std::process::ChildStdin,
    reader: BufReader<std::process::ChildStdout>,
    request_counter: u64,
}

impl BridgeHandle {
    /// Spawn the bridge subprocess and wait for its ready signal.
    fn spawn(config: &BridgeConfig) -> Result<Self> {
        info!(cmd = %config.cmd, script = %config.script, "spawning reasoning bridge");

        let mut child = Command::new(&config.cmd)
            .arg("run")
            .arg(&config.script)
            .current_dir(&config.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit()) // Bridge logs go to parent stderr
            .spawn()
            .map_err(|e| {
                LorekeeperError::Reasoning(format!(
                    "failed to spawn bridge: {e}. Is `{}` installed?",
                    config.cmd
                ))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| LorekeeperError::Reasoning("failed to capture bridge stdin".into()))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| LorekeeperError::Reasoning("failed to capture bridge stdout".into()))?;

        let mut handle = Self {
            child,
            stdin,
            reader: BufReader::new(stdout),
            request_counter: 0,
        };

        handle.wait_for_ready()?;
        Ok(handle)
    }

    /// Wait for the bridge to send its "ready" message.
    fn wait_for_ready(&mut self) -> Result<()> {
        let line = self.read_line()?;
        let msg: ResponseMessage = serde_json::from_str(line.trim()).map_err(|e| {
            LorekeeperError::Reasoning(format!("invalid bridge ready message: {e} (got: {line})"))
        })?;

        match msg {
            ResponseMessage::Ready => {
                info!("bridge is ready");
                Ok(())
            }
            _ => Err(LorekeeperError::Reasoning(format!(
                "expected ready message, got: {line}"
            ))),
        }
    }

    fn read_line(&mut self) -> Result<String> {
        let mut line = String::new();
        self.reader
            .read_line(&mut line)
            .map_err(|e| LorekeeperError::Reasoning(format!("bridge read error: {e}")))?;

        if line.is_empty() {
            return Err(LorekeeperError::Reasoning(
                "bridge closed stdout unexpectedly".into(),
            ));
        }
        Ok(line)
    }

    /// Send one batched reasoning request and wait for its response.
    fn send_batch(
        &mut self,
        task: TaskKind,
        model: &str,
        timeout_secs: u64,
        items: Vec<serde_json::Value>,
    ) -> Result<Vec<ItemOutcome>> {
        self.request_counter += 1;
        let id = format!("req-{}", self.request_counter);

        let request = RequestMessage::Reason {
            id: id.clone(),
            task,
            model: model.to_string(),
            timeout_secs,
            items,
        };

        let json = serde_json::to_string(&request).map_err(|e| {
            LorekeeperError::Reasoning(format!("failed to serialize request: {e}"))
        })?;

        writeln!(self.stdin, "{json}").map_err(|e| {
            LorekeeperError::Reasoning(format!("failed to write to bridge stdin: {e}"))
        })?;
        self.stdin
            .flush()
            .map_err(|e| LorekeeperError::Reasoning(format!("failed to flush bridge stdin: {e}")))?;

        let line = self.read_line()?;
        let msg: ResponseMessage = serde_json::from_str(line.trim()).map_err(|e| {
            LorekeeperError::Reasoning(format!(
                "invalid bridge response: {e} (got: {})",
                &line[..line.len().min(200)]
            ))
        })?;

        match msg {
            ResponseMessage::Result { id: resp_id, items } => {
                debug_assert_eq!(resp_id, id);
                Ok(items)
            }
            ResponseMessage::Error { error, kind, .. } => Err(classify(kind, error)),
            ResponseMessage::Ready => Err(LorekeeperError::Reasoning(
                "unexpected ready message during reasoning".into(),
            )),
        }
    }

    /// Send shutdown and wait for the bridge to exit.
    fn shutdown(mut self) -> Result<()> {
        let json = serde_json::to_string(&RequestMessage::Shutdown).expect("static message");
        let _ = writeln!(self.stdin, "{json}");
        let _ = self.stdin.flush();

        match self.child.wait() {
            Ok(status) => {
                info!(?status, "bridge exited");
                Ok(())
            }
            Err(e) => {
                warn!("bridge wait error: {e}");
                Ok(())
            }
        }
    }
}

/// Map a bridge-reported failure class onto the error taxonomy.
fn classify(kind: Option<ErrorKind>, error: String) -> LorekeeperError {
    match kind {
        Some(ErrorKind::RateLimited) => LorekeeperError::RateLimited { retry_after_secs: 1 },
        Some(ErrorKind::Timeout) => LorekeeperError::ReasoningTimeout(error),
        Some(ErrorKind::Schema) => LorekeeperError::ReasoningSchema(error),
        Some(ErrorKind::Other) | None => LorekeeperError::Reasoning(error),
    }
}

// ---------------------------------------------------------------------------
// BridgeReasoner
// ---------------------------------------------------------------------------

/// Production [`Reasoner`] backed by the bridge subprocess.
pub struct BridgeReasoner {
    config: BridgeConfig,
    handle: BridgeHandle,
    retry: RetryPolicy,
}

impl BridgeReasoner {
    /// Spawn the bridge and perform the ready handshake.
    pub fn spawn(config: &BridgeConfig) -> Result<Self> {
        let handle = BridgeHandle::spawn(config)?;
        Ok(Self {
            config: config.clone(),
            handle,
            retry: RetryPolicy::standard().with_max_retries(config.max_retries),
        })
    }

    /// Override the retry schedule (tests use millisecond delays).
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Shut the bridge down cleanly.
    pub fn shutdown(self) -> Result<()> {
        self.handle.shutdown()
    }

    /// Run one task over a batch with per-item failure isolation.
    ///
    /// Transient item failures (rate limit, timeout) are retried with
    /// backoff, resending only the affected items; every other failure
    /// resolves immediately to a per-item error.
    #[instrument(skip_all, fields(task = task.as_str(), items = items.len()))]
    fn run_task<T: DeserializeOwned>(
        &mut self,
        task: TaskKind,
        items: Vec<serde_json::Value>,
    ) -> Vec<Result<T>> {
        let total = items.len();
        let mut outcomes: Vec<Option<Result<T>>> = (0..total).map(|_| None).collect();
        let mut pending: Vec<(usize, serde_json::Value)> =
            items.into_iter().enumerate().collect();
        let mut attempt: u32 = 0;

        while !pending.is_empty() {
            let batch: Vec<serde_json::Value> =
                pending.iter().map(|(_, v)| v.clone()).collect();

            let batch_outcomes = match self.handle.send_batch(
                task,
                &self.config.model,
                self.config.timeout_secs,
                batch,
            ) {
                Ok(outcomes) => outcomes,
                Err(err) if err.is_transient() && self.retry.allows(attempt) => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(attempt, error = %err, "transient batch failure, backing off");
                    std::thread::sleep(delay);
                    attempt += 1;
                    continue;
                }
                Err(err) => {
                    // Whole batch failed for good: every pending item gets
                    // the same terminal error.
                    let msg = err.to_string();
                    for (idx, _) in pending.drain(..) {
                        outcomes[idx] = Some(Err(LorekeeperError::Reasoning(msg.clone())));
                    }
                    break;
                }
            };

            if batch_outcomes.len() != pending.len() {
                let msg = format!(
                    "bridge returned {} outcomes for {} items",
                    batch_outcomes.len(),
                    pending.len()
                );
                for (idx, _) in pending.drain(..) {
                    outcomes[idx] = Some(Err(LorekeeperError::ReasoningSchema(msg.clone())));
                }
                break;
            }

            let mut still_pending = Vec::new();
            for ((idx, item), outcome) in pending.into_iter().zip(batch_outcomes) {
                match outcome {
                    ItemOutcome::Ok { value } => {
                        outcomes[idx] = Some(serde_json::from_value(value).map_err(|e| {
                            LorekeeperError::ReasoningSchema(format!(
                                "item {idx} failed schema validation: {e}"
                            ))
                        }));
                    }
                    ItemOutcome::Error { error, kind } => {
                        let err = classify(kind, error);
                        if err.is_transient() && self.retry.allows(attempt) {
                            still_pending.push((idx, item));
                        } else {
                            outcomes[idx] = Some(Err(err));
                        }
                    }
                }
            }

            pending = still_pending;
            if !pending.is_empty() {
                let delay = self.retry.delay_for(attempt);
                warn!(
                    attempt,
                    retrying = pending.len(),
                    "transient item failures, backing off"
                );
                std::thread::sleep(delay);
                attempt += 1;
            }
        }

        outcomes
            .into_iter()
            .map(|o| o.expect("every item resolved"))
            .collect()
    }

    fn to_values<S: serde::Serialize>(items: &[S]) -> Vec<serde_json::Value> {
        items
            .iter()
            .map(|i| serde_json::to_value(i).expect("request types serialize"))
            .collect()
    }
}

impl Reasoner for BridgeReasoner {
    fn extract_batch(&mut self, items: &[ExtractRequest]) -> Vec<Result<RawExtraction>> {
        self.run_task(TaskKind::Extract, Self::to_values(items))
    }

    fn arbitrate_batch(&mut self, items: &[ArbitrateRequest]) -> Vec<Result<RawDecision>> {
        self.run_task(TaskKind::Arbitrate, Self::to_values(items))
    }

    fn synthesize_batch(&mut self, items: &[SynthesizeRequest]) -> Vec<Result<String>> {
        self.run_task::<RawMerged>(TaskKind::Synthesize, Self::to_values(items))
            .into_iter()
            .map(|r| r.map(|m| m.content))
            .collect()
    }

    fn answer_batch(&mut self, items: &[AnswerRequest]) -> Vec<Result<RawAnswer>> {
        self.run_task(TaskKind::Answer, Self::to_values(items))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
