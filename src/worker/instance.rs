use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;

use super::{OutputEvent, WorkerStatus};
use crate::control_plane::WorkerResource;
use crate::process::ProcessProbe;

/// Receiving end of a worker's output, fed by a detached reader task.
#[derive(Debug)]
pub struct OutputQueue {
    rx: mpsc::Receiver<OutputEvent>,
    dropped: Arc<AtomicU64>,
    ready: Arc<AtomicBool>,
}

impl OutputQueue {
    /// Spawn the reader task for `reader` and return the queue it fills.
    ///
    /// Lines that arrive while `capacity` lines are already buffered are
    /// dropped and counted. [`OutputEvent::Exited`] is always delivered.
    /// The first line containing `ready_marker` raises the ready flag
    /// whether or not the line itself fits in the queue.
    pub fn attach<R>(reader: R, capacity: usize, ready_marker: impl Into<String>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(capacity);
        let dropped = Arc::new(AtomicU64::new(0));
        let counter = dropped.clone();
        let ready = Arc::new(AtomicBool::new(false));
        let ready_flag = ready.clone();
        let marker = ready_marker.into();

        tokio::spawn(async move {
            let mut reader = BufReader::new(reader);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf).await {
                    Ok(0) => break,
                    Ok(_) => {
                        let line = String::from_utf8_lossy(&buf)
                            .trim_end_matches(['\r', '\n'])
                            .to_string();
                        if !ready_flag.load(Ordering::Relaxed) && line.contains(&marker) {
                            ready_flag.store(true, Ordering::Release);
                        }
                        match tx.try_send(OutputEvent::Line(line)) {
                            Ok(()) => {}
                            Err(TrySendError::Full(_)) => {
                                counter.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(TrySendError::Closed(_)) => return,
                        }
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "Worker output read failed");
                        break;
                    }
                }
            }
            let _ = tx.send(OutputEvent::Exited).await;
        });

        Self { rx, dropped, ready }
    }

    /// Next queued item, or `None` if nothing arrived within `timeout`.
    pub async fn next(&mut self, timeout: Duration) -> Option<OutputEvent> {
        tokio::time::timeout(timeout, self.rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// Lines lost because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Whether the worker has printed the ready marker.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }
}

/// One spawned worker process tracked by the supervisor.
#[derive(Debug)]
pub struct WorkerInstance {
    pid: u32,
    port: u16,
    status: WorkerStatus,
    spawned_at: Instant,
    child: Child,
    output: OutputQueue,
    remote: WorkerResource,
}

impl WorkerInstance {
    pub fn new(pid: u32, port: u16, child: Child, output: OutputQueue, remote: WorkerResource) -> Self {
        Self {
            pid,
            port,
            status: WorkerStatus::Starting,
            spawned_at: Instant::now(),
            child,
            output,
            remote,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn status(&self) -> WorkerStatus {
        self.status
    }

    pub fn set_status(&mut self, status: WorkerStatus) {
        if self.status != status {
            tracing::debug!(pid = self.pid, from = %self.status, to = %status, "Worker status changed");
            self.status = status;
        }
    }

    pub fn spawned_at(&self) -> Instant {
        self.spawned_at
    }

    pub fn remote(&self) -> &WorkerResource {
        &self.remote
    }

    pub fn remote_mut(&mut self) -> &mut WorkerResource {
        &mut self.remote
    }

    /// Whether the process is still running. Reaps it if it exited.
    pub fn is_alive(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                tracing::debug!(pid = self.pid, %status, "Worker process exited");
                false
            }
            Err(e) => {
                tracing::warn!(pid = self.pid, error = %e, "Cannot query worker process, assuming dead");
                false
            }
        }
    }

    pub async fn next_output(&mut self, timeout: Duration) -> Option<OutputEvent> {
        self.output.next(timeout).await
    }

    pub fn dropped_lines(&self) -> u64 {
        self.output.dropped()
    }

    pub fn printed_ready_marker(&self) -> bool {
        self.output.is_ready()
    }

    /// SIGTERM, wait up to `wait`, then SIGKILL. Returns false when the
    /// process had already exited.
    pub async fn terminate(&mut self, probe: &mut ProcessProbe, wait: Duration) -> bool {
        if !self.is_alive() {
            return false;
        }

        if !probe.signal_terminate(self.pid) {
            if let Err(e) = self.child.start_kill() {
                tracing::debug!(pid = self.pid, error = %e, "Kill failed, process already gone");
            }
        }

        match tokio::time::timeout(wait, self.child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                tracing::warn!(pid = self.pid, "Worker ignored SIGTERM, killing");
                if let Err(e) = self.child.start_kill() {
                    tracing::debug!(pid = self.pid, error = %e, "Kill failed, process already gone");
                }
                let _ = self.child.wait().await;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_secs(2);
    const MARKER: &str = "Game Engine Initialized.";

    #[tokio::test]
    async fn lines_then_exit_sentinel() {
        let mut queue = OutputQueue::attach(&b"booting\r\nGame Engine Initialized.\npartial"[..], 16, MARKER);

        assert_eq!(queue.next(WAIT).await, Some(OutputEvent::Line("booting".into())));
        assert_eq!(
            queue.next(WAIT).await,
            Some(OutputEvent::Line("Game Engine Initialized.".into()))
        );
        assert_eq!(queue.next(WAIT).await, Some(OutputEvent::Line("partial".into())));
        assert_eq!(queue.next(WAIT).await, Some(OutputEvent::Exited));
        assert_eq!(queue.dropped(), 0);
        assert!(queue.is_ready());
    }

    #[tokio::test]
    async fn full_queue_drops_lines_but_keeps_exit() {
        let mut queue = OutputQueue::attach(&b"a\nb\nc\nd\ne\n"[..], 2, MARKER);

        // Give the reader time to run into the full queue
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(queue.next(WAIT).await, Some(OutputEvent::Line("a".into())));
        assert_eq!(queue.next(WAIT).await, Some(OutputEvent::Line("b".into())));
        assert_eq!(queue.next(WAIT).await, Some(OutputEvent::Exited));
        assert_eq!(queue.dropped(), 3);
        assert!(!queue.is_ready());
    }

    #[tokio::test]
    async fn ready_marker_is_seen_even_when_its_line_is_dropped() {
        let mut chatter: String = (0..3000).map(|i| format!("loading asset {}\n", i)).collect();
        chatter.push_str("Game Engine Initialized.\nidle\n");
        let mut queue = OutputQueue::attach(std::io::Cursor::new(chatter.into_bytes()), 8, MARKER);

        // Nothing is read until the reader has run out of input
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(queue.is_ready());
        assert_eq!(queue.dropped(), 3002 - 8);

        let mut lines = Vec::new();
        while let Some(OutputEvent::Line(line)) = queue.next(WAIT).await {
            lines.push(line);
        }
        assert!(!lines.iter().any(|l| l.contains(MARKER)));
    }

    #[tokio::test]
    async fn invalid_utf8_is_replaced() {
        let mut queue = OutputQueue::attach(&b"ok \xff\n"[..], 4, MARKER);
        match queue.next(WAIT).await {
            Some(OutputEvent::Line(line)) => assert!(line.starts_with("ok ")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn idle_queue_times_out() {
        let (_writer, reader) = tokio::io::duplex(64);
        let mut queue = OutputQueue::attach(reader, 4, MARKER);
        assert_eq!(queue.next(Duration::from_millis(50)).await, None);
    }
}
