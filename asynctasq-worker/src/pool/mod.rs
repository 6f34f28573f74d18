//! Warm subprocess pool for CPU-bound tasks. Each child is a copy of
//! the current executable re-invoked in `--cpu-worker` mode: it re-runs the
//! same handler registration the parent did, then sits in a loop reading
//! length-prefixed [`TaskEnvelope`]s off stdin and writing length-prefixed
//! [`Outcome`]s to stdout. Recycled after `max_tasks_per_worker` tasks to
//! bound any per-process resource leakage in user handler code.

use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use asynctasq_core::codec::{decode_value, encode_value};
use asynctasq_core::envelope::TaskEnvelope;
use asynctasq_core::registry::{Outcome, TaskRegistry};
use asynctasq_core::value::Value;
use futures::FutureExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{error, warn};

/// Length-prefixes `bytes` for pipe framing: the codec's own TLV shape has
/// no outer length, so streams need one.
async fn write_framed(stdin: &mut ChildStdin, bytes: &[u8]) -> std::io::Result<()> {
    stdin.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
    stdin.write_all(bytes).await?;
    stdin.flush().await
}

async fn read_framed(reader: &mut BufReader<ChildStdout>) -> std::io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

struct PoolWorker {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    tasks_processed: u32,
}

impl PoolWorker {
    async fn spawn(argv0: &str, extra_arg: &str) -> std::io::Result<Self> {
        let mut child = Command::new(argv0)
            .arg(extra_arg)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        let stdin = child.stdin.take().expect("child stdin was piped");
        let stdout = BufReader::new(child.stdout.take().expect("child stdout was piped"));
        Ok(PoolWorker {
            child,
            stdin,
            stdout,
            tasks_processed: 0,
        })
    }
}

/// Pool of recyclable subprocess workers executing CPU-bound task kinds.
pub struct ProcessPool {
    argv0: String,
    child_flag: String,
    max_tasks_per_worker: u32,
    workers: Vec<Mutex<Option<PoolWorker>>>,
    next: AtomicU32,
}

impl ProcessPool {
    pub async fn spawn(size: usize, child_flag: impl Into<String>, max_tasks_per_worker: u32) -> std::io::Result<Self> {
        let argv0 = std::env::current_exe()?
            .to_str()
            .expect("executable path is valid utf-8")
            .to_string();
        let child_flag = child_flag.into();
        let mut workers = Vec::with_capacity(size);
        for _ in 0..size {
            let worker = PoolWorker::spawn(&argv0, &child_flag).await?;
            workers.push(Mutex::new(Some(worker)));
        }
        Ok(ProcessPool {
            argv0,
            child_flag,
            max_tasks_per_worker,
            workers,
            next: AtomicU32::new(0),
        })
    }

    fn pick_slot(&self) -> usize {
        self.next.fetch_add(1, Ordering::Relaxed) as usize % self.workers.len()
    }

    /// Sends `envelope` to one pooled child and awaits its [`Outcome`].
    /// Spawns a fresh child in place of one that died or was retired.
    pub async fn execute(&self, envelope: &TaskEnvelope) -> Outcome {
        let slot = self.pick_slot();
        let mut guard = self.workers[slot].lock().await;

        if guard.is_none() {
            match PoolWorker::spawn(&self.argv0, &self.child_flag).await {
                Ok(w) => *guard = Some(w),
                Err(err) => {
                    error!(error = %err, "failed to respawn process pool worker");
                    return Outcome::Err {
                        message: format!("process pool worker unavailable: {err}"),
                        retryable: true,
                    };
                }
            }
        }

        let request = envelope.encode();
        let outcome = {
            let worker = guard.as_mut().unwrap();
            match write_framed(&mut worker.stdin, &request).await {
                Ok(()) => match read_framed(&mut worker.stdout).await {
                    Ok(response_bytes) => decode_outcome(&response_bytes),
                    Err(err) => {
                        warn!(error = %err, "process pool worker died mid-task");
                        Outcome::Err {
                            message: format!("process pool worker died: {err}"),
                            retryable: true,
                        }
                    }
                },
                Err(err) => {
                    warn!(error = %err, "failed to write to process pool worker stdin");
                    Outcome::Err {
                        message: format!("process pool worker unavailable: {err}"),
                        retryable: true,
                    }
                }
            }
        };

        let worker = guard.as_mut().unwrap();
        worker.tasks_processed += 1;
        let dead = matches!(outcome, Outcome::Err { retryable: true, .. }) && worker.child.try_wait().ok().flatten().is_some();
        if dead || worker.tasks_processed >= self.max_tasks_per_worker {
            let mut retired = guard.take().unwrap();
            let _ = retired.child.start_kill();
            tokio::spawn(async move {
                let _ = retired.child.wait().await;
            });
        }

        outcome
    }

    /// Kills every pooled child and waits for it to exit. Called from the
    /// worker's cleanup registry during shutdown, after the fetch loop has
    /// stopped handing out new work.
    pub async fn shutdown(&self) {
        for slot in &self.workers {
            let mut guard = slot.lock().await;
            if let Some(mut worker) = guard.take() {
                let _ = worker.child.start_kill();
                let _ = worker.child.wait().await;
            }
        }
    }
}

fn decode_outcome(bytes: &[u8]) -> Outcome {
    match decode_value(bytes) {
        Ok(Value::Map(mut map)) => {
            let status = map.remove("status").and_then(|v| v.as_str().map(str::to_string));
            match status.as_deref() {
                Some("ok") => {
                    let result = match map.remove("result") {
                        Some(Value::Bytes(b)) => b,
                        _ => Vec::new(),
                    };
                    Outcome::Ok(result)
                }
                Some("timed_out") => Outcome::TimedOut,
                _ => {
                    let message = map
                        .remove("message")
                        .and_then(|v| v.as_str().map(str::to_string))
                        .unwrap_or_else(|| "malformed child response".to_string());
                    let retryable = matches!(map.get("retryable"), Some(Value::Bool(true)));
                    Outcome::Err { message, retryable }
                }
            }
        }
        _ => Outcome::Err {
            message: "malformed child response envelope".to_string(),
            retryable: true,
        },
    }
}

fn encode_outcome(outcome: &Outcome) -> Vec<u8> {
    use std::collections::BTreeMap;
    let mut map = BTreeMap::new();
    match outcome {
        Outcome::Ok(bytes) => {
            map.insert("status".to_string(), Value::Str("ok".to_string()));
            map.insert("result".to_string(), Value::Bytes(bytes.clone()));
        }
        Outcome::Err { message, retryable } => {
            map.insert("status".to_string(), Value::Str("err".to_string()));
            map.insert("message".to_string(), Value::Str(message.clone()));
            map.insert("retryable".to_string(), Value::Bool(*retryable));
        }
        Outcome::TimedOut => {
            map.insert("status".to_string(), Value::Str("timed_out".to_string()));
        }
    }
    encode_value(&Value::Map(map))
}

/// Entry point a child process calls when launched with the pool's
/// `child_flag`: reads framed envelopes from stdin, executes them against
/// the (already-registered) handler registry, and writes framed outcomes
/// to stdout until stdin closes.
pub async fn run_cpu_child(registry: Arc<TaskRegistry>) {
    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut stdout = tokio::io::stdout();
    loop {
        let mut len_buf = [0u8; 4];
        if stdin.read_exact(&mut len_buf).await.is_err() {
            return;
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut body = vec![0u8; len];
        if stdin.read_exact(&mut body).await.is_err() {
            return;
        }

        let outcome = match TaskEnvelope::decode(&body) {
            Ok(envelope) => match registry.resolve(&envelope.class_path) {
                Ok(handler) => {
                    let result = std::panic::AssertUnwindSafe(handler.execute(&envelope))
                        .catch_unwind()
                        .await;
                    match result {
                        Ok(outcome) => outcome,
                        Err(panic) => Outcome::Err {
                            message: panic_message(panic),
                            retryable: false,
                        },
                    }
                }
                Err(err) => Outcome::Err {
                    message: err.to_string(),
                    retryable: false,
                },
            },
            Err(err) => Outcome::Err {
                message: err.to_string(),
                retryable: false,
            },
        };

        let response = encode_outcome(&outcome);
        if stdout
            .write_all(&(response.len() as u32).to_be_bytes())
            .await
            .is_err()
        {
            return;
        }
        if stdout.write_all(&response).await.is_err() {
            return;
        }
        if stdout.flush().await.is_err() {
            return;
        }
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "<non-string panic payload>".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_round_trips_through_wire_encoding() {
        let ok = Outcome::Ok(vec![1, 2, 3]);
        let decoded = decode_outcome(&encode_outcome(&ok));
        assert!(matches!(decoded, Outcome::Ok(bytes) if bytes == vec![1, 2, 3]));

        let err = Outcome::Err {
            message: "boom".to_string(),
            retryable: true,
        };
        let decoded = decode_outcome(&encode_outcome(&err));
        assert!(matches!(decoded, Outcome::Err { retryable: true, .. }));

        let timed_out = Outcome::TimedOut;
        let decoded = decode_outcome(&encode_outcome(&timed_out));
        assert!(matches!(decoded, Outcome::TimedOut));
    }
}
