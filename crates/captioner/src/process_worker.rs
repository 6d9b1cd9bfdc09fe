//! Long-lived worker subprocess speaking JSON lines over stdin/stdout.
//!
//! Protocol:
//! - on startup the worker loads its model and prints `{"event":"ready"}`
//! - `{"op":"caption","id":N,"video":..}` → `{"id":N,"caption":..}` or
//!   `{"id":N,"error":{"kind":"resource_exhausted"|"failed","message":..}}`
//! - `{"op":"cancel","id":N}` aborts request N, which must then answer (any reply with id N)
//! - `{"op":"reclaim","id":N}` and `{"op":"shutdown"}` get no reply
//!
//! Replies whose id does not match the request in flight are discarded. A worker that
//! does not answer a cancel within the grace period is abandoned: it reports itself dead
//! so the lifecycle manager replaces it.

use std::io;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use crate::worker::{InferenceOptions, InferenceWorker, WorkerError, WorkerFactory, WorkerResult};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
const CANCEL_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum WorkerRequest<'a> {
    Caption {
        id: u64,
        video: &'a Path,
        #[serde(skip_serializing_if = "Option::is_none")]
        fps: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        max_pixels: Option<u64>,
        max_new_tokens: u32,
        prompt: &'a str,
    },
    Cancel {
        id: u64,
    },
    Reclaim {
        id: u64,
    },
    Shutdown,
}

#[derive(Debug, Deserialize)]
struct WorkerResponse {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    event: Option<String>,
    #[serde(default)]
    caption: Option<String>,
    #[serde(default)]
    error: Option<WorkerFault>,
}

#[derive(Debug, Deserialize)]
struct WorkerFault {
    kind: FaultKind,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum FaultKind {
    ResourceExhausted,
    Failed,
    #[serde(other)]
    Unknown,
}

impl WorkerResponse {
    /// Turn a reply to a caption request into the caption or a tagged error
    fn into_result(self) -> WorkerResult<String> {
        if let Some(fault) = self.error {
            return Err(match fault.kind {
                FaultKind::ResourceExhausted => WorkerError::ResourceExhausted(fault.message),
                FaultKind::Failed | FaultKind::Unknown => WorkerError::Failed(fault.message),
            });
        }
        self.caption
            .ok_or_else(|| WorkerError::Protocol("reply carries neither caption nor error".to_string()))
    }
}

/// Spawns one worker subprocess per load
pub struct ProcessWorkerFactory {
    command: Vec<String>,
    load_timeout: Duration,
    cancel_grace: Duration,
    shutdown_grace: Duration,
}

impl ProcessWorkerFactory {
    pub fn new(command: Vec<String>, load_timeout: Duration) -> Self {
        Self {
            command,
            load_timeout,
            cancel_grace: CANCEL_GRACE,
            shutdown_grace: SHUTDOWN_GRACE,
        }
    }

    /// How long a cancelled request may take to answer before the worker is abandoned
    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}

#[async_trait]
impl WorkerFactory for ProcessWorkerFactory {
    async fn load(&self, device: &str) -> WorkerResult<Box<dyn InferenceWorker>> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| WorkerError::Load("empty worker command".to_string()))?;

        info!("🔮 Starting worker: {} {} --device {}", program, args.join(" "), device);
        let mut child = Command::new(program)
            .args(args)
            .arg("--device")
            .arg(device)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| WorkerError::Load(format!("failed to spawn {}: {}", program, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| WorkerError::Load("worker stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| WorkerError::Load("worker stdout unavailable".to_string()))?;

        let mut worker = ProcessWorker {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            outbox: Vec::new(),
            written: 0,
            next_id: 1,
            in_flight: None,
            exited: false,
            abandoned: false,
            cancel_grace: self.cancel_grace,
            shutdown_grace: self.shutdown_grace,
        };

        match tokio::time::timeout(self.load_timeout, worker.wait_ready()).await {
            Ok(Ok(())) => {
                info!("✅ Worker ready");
                Ok(Box::new(worker) as Box<dyn InferenceWorker>)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(WorkerError::Load(format!(
                "worker not ready after {}s",
                self.load_timeout.as_secs()
            ))),
        }
    }
}

pub struct ProcessWorker {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    /// Line being written; survives a cancelled write so it is finished before the next one
    outbox: Vec<u8>,
    written: usize,
    next_id: u64,
    /// Caption request still owed a reply
    in_flight: Option<u64>,
    exited: bool,
    abandoned: bool,
    cancel_grace: Duration,
    shutdown_grace: Duration,
}

impl ProcessWorker {
    async fn wait_ready(&mut self) -> WorkerResult<()> {
        loop {
            match self.read_response().await? {
                Some(resp) if resp.event.as_deref() == Some("ready") => return Ok(()),
                Some(_) => continue,
                None => return Err(WorkerError::Load("worker exited before becoming ready".to_string())),
            }
        }
    }

    async fn send(&mut self, request: &WorkerRequest<'_>) -> WorkerResult<()> {
        self.flush_outbox().await?;

        let mut line = serde_json::to_string(request)
            .map_err(|e| WorkerError::Protocol(format!("failed to encode request: {}", e)))?;
        line.push('\n');
        self.outbox = line.into_bytes();
        self.written = 0;
        self.flush_outbox().await
    }

    /// Write whatever is left of the current line. Each `write` either lands or does
    /// nothing, so dropping this future mid-line loses no bytes.
    async fn flush_outbox(&mut self) -> WorkerResult<()> {
        while self.written < self.outbox.len() {
            let n = self.stdin.write(&self.outbox[self.written..]).await?;
            if n == 0 {
                return Err(io::Error::from(io::ErrorKind::WriteZero).into());
            }
            self.written += n;
        }
        self.stdin.flush().await?;
        Ok(())
    }

    /// Read until the reply to `id` arrives
    async fn drain_until(&mut self, id: u64) -> WorkerResult<()> {
        loop {
            match self.read_response().await? {
                Some(resp) if resp.id == Some(id) => return Ok(()),
                Some(_) => continue,
                None => return Err(WorkerError::Failed("worker exited while cancelling".to_string())),
            }
        }
    }

    /// Next well-formed reply, or None at end of stream. Non-JSON output is skipped.
    async fn read_response(&mut self) -> WorkerResult<Option<WorkerResponse>> {
        loop {
            let Some(line) = self.stdout.next_line().await? else {
                self.exited = true;
                return Ok(None);
            };
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<WorkerResponse>(trimmed) {
                Ok(resp) => return Ok(Some(resp)),
                Err(_) => debug!("worker: {}", trimmed),
            }
        }
    }

    fn take_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

#[async_trait]
impl InferenceWorker for ProcessWorker {
    async fn infer(&mut self, variant: &Path, options: &InferenceOptions) -> WorkerResult<String> {
        let id = self.take_id();
        self.in_flight = Some(id);
        self.send(&WorkerRequest::Caption {
            id,
            video: variant,
            fps: options.fps,
            max_pixels: options.max_pixels,
            max_new_tokens: options.max_new_tokens,
            prompt: &options.prompt,
        })
        .await?;

        loop {
            let Some(resp) = self.read_response().await? else {
                return Err(WorkerError::Failed("worker exited mid-request".to_string()));
            };
            if resp.id != Some(id) {
                debug!("Discarding stale worker reply (id {:?}, waiting for {})", resp.id, id);
                continue;
            }
            self.in_flight = None;
            return resp.into_result();
        }
    }

    async fn cancel(&mut self) -> WorkerResult<()> {
        let Some(id) = self.in_flight.take() else {
            return Ok(());
        };
        if self.abandoned || self.exited {
            return Ok(());
        }

        debug!("Cancelling worker request {}", id);
        let grace = self.cancel_grace;
        let cancelled = tokio::time::timeout(grace, async {
            self.send(&WorkerRequest::Cancel { id }).await?;
            self.drain_until(id).await
        })
        .await;

        match cancelled {
            Ok(Ok(())) => {
                debug!("Worker request {} cancelled", id);
                Ok(())
            }
            Ok(Err(e)) => {
                self.abandoned = true;
                Err(e)
            }
            Err(_) => {
                warn!(
                    "Worker did not acknowledge cancel of request {} within {}s, abandoning it",
                    id,
                    grace.as_secs_f64()
                );
                self.abandoned = true;
                Ok(())
            }
        }
    }

    async fn reclaim(&mut self) -> WorkerResult<()> {
        if self.abandoned {
            return Ok(());
        }
        let id = self.take_id();
        self.send(&WorkerRequest::Reclaim { id }).await
    }

    async fn shutdown(self: Box<Self>) -> WorkerResult<()> {
        let mut this = self;
        if let Err(e) = this.send(&WorkerRequest::Shutdown).await {
            debug!("Worker did not accept shutdown request: {}", e);
        }

        let grace = this.shutdown_grace;
        match tokio::time::timeout(grace, this.child.wait()).await {
            Ok(Ok(status)) => {
                debug!("Worker exited with {}", status);
                Ok(())
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => {
                warn!("Worker ignored shutdown for {}s, killing it", grace.as_secs_f64());
                this.child.kill().await?;
                Ok(())
            }
        }
    }

    fn is_alive(&mut self) -> bool {
        if self.exited || self.abandoned {
            return false;
        }
        matches!(self.child.try_wait(), Ok(None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Instant;
    use tempfile::TempDir;
    use crate::executor::{attempt, Outcome};
    use crate::testing::FakeProber;

    /// Answers captions at once, honours cancel and shutdown, never answers "stall"
    const COOPERATIVE: &str = r##"echo '{"event":"ready"}'
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
  case "$line" in
    *'"op":"cancel"'*) echo "{\"id\":$id,\"error\":{\"kind\":\"cancelled\",\"message\":\"cancelled\"}}" ;;
    *'"op":"shutdown"'*) exit 0 ;;
    *'"op":"caption"'*stall*) ;;
    *'"op":"caption"'*crash*) exit 3 ;;
    *'"op":"caption"'*oom*) echo "{\"id\":$id,\"error\":{\"kind\":\"resource_exhausted\",\"message\":\"CUDA out of memory\"}}" ;;
    *'"op":"caption"'*) echo '{"id":0,"caption":"stale"}'; echo "loading frames"; echo "{\"id\":$id,\"caption\":\" ok \"}" ;;
  esac
done
"##;

    /// Blocks on "stall" without reading stdin and ignores cancel and shutdown
    const STUBBORN: &str = r##"echo '{"event":"ready"}'
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
  case "$line" in
    *'"op":"caption"'*stall*) sleep 3; echo "{\"id\":$id,\"caption\":\"late\"}" ;;
    *'"op":"caption"'*) echo "{\"id\":$id,\"caption\":\"ok\"}" ;;
  esac
done
"##;

    fn script(dir: &TempDir, body: &str) -> Vec<String> {
        let path = dir.path().join("worker.sh");
        fs::write(&path, body).unwrap();
        vec!["sh".to_string(), path.to_string_lossy().into_owned()]
    }

    fn factory(dir: &TempDir, body: &str) -> ProcessWorkerFactory {
        ProcessWorkerFactory::new(script(dir, body), Duration::from_secs(5))
            .with_cancel_grace(Duration::from_millis(500))
            .with_shutdown_grace(Duration::from_millis(300))
    }

    async fn load(dir: &TempDir, body: &str) -> Box<dyn InferenceWorker> {
        factory(dir, body).load("cuda").await.unwrap()
    }

    async fn run(worker: &mut Box<dyn InferenceWorker>, video: &str, timeout: Duration) -> Outcome {
        attempt(
            &FakeProber::new(),
            worker.as_mut(),
            Path::new(video),
            &InferenceOptions::default(),
            timeout,
        )
        .await
    }

    #[tokio::test]
    async fn ready_worker_captions_and_skips_stale_replies() {
        let dir = TempDir::new().unwrap();
        let mut worker = load(&dir, COOPERATIVE).await;

        let caption = worker.infer(Path::new("/videos/good.mp4"), &InferenceOptions::default()).await.unwrap();
        assert_eq!(caption, " ok ");
        assert!(worker.is_alive());
        worker.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn worker_oom_is_tagged() {
        let dir = TempDir::new().unwrap();
        let mut worker = load(&dir, COOPERATIVE).await;

        let err = worker.infer(Path::new("/videos/oom.mp4"), &InferenceOptions::default()).await.unwrap_err();
        assert!(err.is_resource_exhausted());
        worker.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn timed_out_request_does_not_block_the_next_item() {
        let dir = TempDir::new().unwrap();
        let mut worker = load(&dir, COOPERATIVE).await;

        assert_eq!(run(&mut worker, "/videos/stall.mp4", Duration::from_millis(300)).await, Outcome::Timeout);
        assert!(worker.is_alive());
        assert_eq!(
            run(&mut worker, "/videos/good.mp4", Duration::from_secs(2)).await,
            Outcome::Success("ok".to_string())
        );
        worker.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn unacknowledged_cancel_marks_worker_dead() {
        let dir = TempDir::new().unwrap();
        let mut worker = load(&dir, STUBBORN).await;

        assert_eq!(run(&mut worker, "/videos/stall.mp4", Duration::from_millis(200)).await, Outcome::Timeout);
        assert!(!worker.is_alive());

        // ignores shutdown too: killed once the grace period runs out
        let started = Instant::now();
        worker.shutdown().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn exit_mid_request_is_a_failure() {
        let dir = TempDir::new().unwrap();
        let mut worker = load(&dir, COOPERATIVE).await;

        let result = worker.infer(Path::new("/videos/crash.mp4"), &InferenceOptions::default()).await;
        assert!(matches!(result, Err(WorkerError::Failed(_))));
        assert!(!worker.is_alive());
    }

    #[tokio::test]
    async fn load_times_out_without_ready_event() {
        let dir = TempDir::new().unwrap();
        let factory = ProcessWorkerFactory::new(script(&dir, "sleep 5\n"), Duration::from_millis(200));

        let started = Instant::now();
        let result = factory.load("cuda").await;
        assert!(matches!(result.err(), Some(WorkerError::Load(_))));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn exit_before_ready_fails_load() {
        let dir = TempDir::new().unwrap();
        let result = factory(&dir, "echo starting\nexit 1\n").load("cuda").await;
        assert!(matches!(result.err(), Some(WorkerError::Load(_))));
    }

    fn parse(json: &str) -> WorkerResponse {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn caption_reply_yields_text() {
        let resp = parse(r#"{"id": 3, "caption": "a dog running"}"#);
        assert_eq!(resp.id, Some(3));
        assert_eq!(resp.into_result().unwrap(), "a dog running");
    }

    #[test]
    fn out_of_memory_is_tagged() {
        let resp = parse(r#"{"id": 1, "error": {"kind": "resource_exhausted", "message": "CUDA out of memory"}}"#);
        assert!(resp.into_result().unwrap_err().is_resource_exhausted());
    }

    #[test]
    fn other_faults_are_generic_failures() {
        for kind in ["failed", "segfault"] {
            let resp = parse(&format!(r#"{{"id": 1, "error": {{"kind": "{}", "message": "boom"}}}}"#, kind));
            assert!(matches!(resp.into_result(), Err(WorkerError::Failed(m)) if m == "boom"));
        }
    }

    #[test]
    fn empty_reply_is_a_protocol_error() {
        assert!(matches!(parse(r#"{"id": 1}"#).into_result(), Err(WorkerError::Protocol(_))));
    }

    #[test]
    fn ready_event_parses() {
        let resp = parse(r#"{"event": "ready"}"#);
        assert_eq!(resp.event.as_deref(), Some("ready"));
        assert_eq!(resp.id, None);
    }

    #[test]
    fn requests_are_tagged_by_op() {
        let options = InferenceOptions::default();
        let req = WorkerRequest::Caption {
            id: 7,
            video: Path::new("/tmp/v.mp4"),
            fps: options.fps,
            max_pixels: Some(360 * 420),
            max_new_tokens: options.max_new_tokens,
            prompt: &options.prompt,
        };
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["op"], "caption");
        assert_eq!(value["id"], 7);
        assert_eq!(value["video"], "/tmp/v.mp4");
        assert_eq!(value["max_pixels"], 151200);
        assert!(value.get("fps").is_none());

        let value = serde_json::to_value(WorkerRequest::Shutdown).unwrap();
        assert_eq!(value["op"], "shutdown");
    }
}
