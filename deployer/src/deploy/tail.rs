//! Background tailing of remote log files
//!
//! One task per instance follows the deploy's log files over its own
//! connection and re-emits every line through `tracing`. Tasks are owned by
//! the [`LogTailer`]; [`LogTailer::stop_all`] cancels and joins them, and
//! dropping the tailer or a [`TailScope`] aborts whatever is left.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fleet_api::Instance;

use crate::config::Deploy;
use crate::errors::DeployError;
use crate::remote::{RemoteTransport, Stream, Target};
use crate::utils::shell_quote;

/// Splits a byte stream into lines, holding back an unterminated tail
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    /// Append `data` and return every line it completed
    pub fn push(&mut self, data: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(data);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    /// Whatever is left once the stream has ended
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}

/// Time a cancelled tail gets to shut its session down
const CANCEL_GRACE: Duration = Duration::from_secs(5);

pub fn tail_command(log_files: &[String]) -> String {
    let files: Vec<String> = log_files.iter().map(|f| shell_quote(f)).collect();
    format!("tail -n 0 -F {}", files.join(" "))
}

struct TailHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Supervises one tail task per instance
pub struct LogTailer {
    transport: Arc<dyn RemoteTransport>,
    tasks: Mutex<HashMap<String, TailHandle>>,
}

impl LogTailer {
    pub fn new(transport: Arc<dyn RemoteTransport>) -> Self {
        Self {
            transport,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    fn tasks(&self) -> MutexGuard<'_, HashMap<String, TailHandle>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start tailing `instance` unless a live task already does
    pub fn start(&self, deploy: &Arc<Deploy>, instance: &Instance) {
        if !deploy.tail_logs || deploy.log_files.is_empty() {
            return;
        }

        let mut tasks = self.tasks();
        if let Some(handle) = tasks.get(&instance.id) {
            if !handle.task.is_finished() {
                return;
            }
            debug!("Restarting finished log tail for {}", instance.id);
        }

        let cancel = CancellationToken::new();
        let task = tokio::spawn(tail_instance(
            Arc::clone(&self.transport),
            Arc::clone(deploy),
            instance.clone(),
            cancel.clone(),
        ));
        tasks.insert(instance.id.clone(), TailHandle { cancel, task });
    }

    /// True while a task for `instance_id` is running
    pub fn is_tailing(&self, instance_id: &str) -> bool {
        self.tasks()
            .get(instance_id)
            .map(|h| !h.task.is_finished())
            .unwrap_or(false)
    }

    /// Number of tracked tasks, finished or not
    pub fn len(&self) -> usize {
        self.tasks().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancel every task and wait for each to finish
    pub async fn stop_all(&self) {
        let handles: Vec<(String, TailHandle)> = self.tasks().drain().collect();
        if handles.is_empty() {
            return;
        }

        info!("Stopping {} log tail(s)", handles.len());
        for (_, handle) in &handles {
            handle.cancel.cancel();
        }
        for (id, handle) in handles {
            if let Err(e) = handle.task.await {
                if !e.is_cancelled() {
                    warn!("Log tail for {} ended abnormally: {}", id, e);
                }
            }
        }
    }

    /// Cancel and abort every task without waiting for it
    pub fn abort_all(&self) {
        let handles: Vec<TailHandle> = self.tasks().drain().map(|(_, h)| h).collect();
        if !handles.is_empty() {
            debug!("Aborting {} log tail(s)", handles.len());
        }
        for handle in handles {
            handle.cancel.cancel();
            handle.task.abort();
        }
    }

    /// Ties the tasks started from now on to the caller.
    ///
    /// Finish with [`TailScope::stop`]; if the scope is dropped instead,
    /// for example because the caller's future was cancelled, every task
    /// is aborted.
    pub fn scope(&self) -> TailScope<'_> {
        TailScope { tailer: self }
    }
}

impl Drop for LogTailer {
    fn drop(&mut self) {
        self.abort_all();
    }
}

/// Aborts the tailer's tasks when dropped
pub struct TailScope<'a> {
    tailer: &'a LogTailer,
}

impl TailScope<'_> {
    /// Cancel and join every task
    pub async fn stop(self) {
        self.tailer.stop_all().await;
    }
}

impl Drop for TailScope<'_> {
    fn drop(&mut self) {
        self.tailer.abort_all();
    }
}

async fn tail_instance(
    transport: Arc<dyn RemoteTransport>,
    deploy: Arc<Deploy>,
    instance: Instance,
    cancel: CancellationToken,
) {
    let id = instance.id.clone();
    let command = tail_command(&deploy.log_files);
    let stop = cancel.clone();
    info!("Tailing {} on {}", deploy.log_files.join(", "), id);

    let stream_id = id.clone();
    let tail = deploy.ssh.with_connection(
        transport.as_ref(),
        Some(Target::Instance(&instance)),
        move |session| {
            Box::pin(async move {
                let (tx, mut rx) = mpsc::channel(64);
                let exec = session.exec_streaming(&command, tx);
                tokio::pin!(exec);

                let mut stdout = LineBuffer::default();
                let mut stderr = LineBuffer::default();
                let mut status: Option<Result<Option<i32>, DeployError>> = None;

                loop {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        result = &mut exec, if status.is_none() => status = Some(result),
                        chunk = rx.recv() => match chunk {
                            Some(chunk) => {
                                let buffer = match chunk.stream {
                                    Stream::Stdout => &mut stdout,
                                    Stream::Stderr => &mut stderr,
                                };
                                for line in buffer.push(&chunk.data) {
                                    info!(instance = %stream_id, stream = %chunk.stream, "{}", line);
                                }
                            }
                            None => break,
                        },
                    }
                }

                for (stream, buffer) in [(Stream::Stdout, &mut stdout), (Stream::Stderr, &mut stderr)] {
                    if let Some(line) = buffer.finish() {
                        info!(instance = %stream_id, stream = %stream, "{}", line);
                    }
                }

                match status {
                    Some(Err(e)) => Err(e),
                    Some(Ok(code)) => {
                        debug!("tail on {} exited with {:?}", stream_id, code);
                        Ok(())
                    }
                    None => Ok(()),
                }
            })
        },
    );

    tokio::pin!(tail);
    let result = tokio::select! {
        result = &mut tail => result,
        _ = cancel.cancelled() => {
            // let a running tail close its session; give up on a stalled connect
            match tokio::time::timeout(CANCEL_GRACE, &mut tail).await {
                Ok(result) => result,
                Err(_) => {
                    debug!("Log tail for {} dropped before it connected", id);
                    Ok(())
                }
            }
        }
    };
    if let Err(e) = result {
        warn!("Log tail for {} stopped: {}", id, e);
    }
}
