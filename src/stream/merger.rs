//! Stream merger
//!
//! Each output channel of a child process gets its own reader task. Both
//! readers push into one bounded queue; a reader that cannot enqueue within
//! `enqueue_timeout` drops the event and emits a rate-limited warning. Each
//! reader finishes with an end-of-stream marker, and the consumer yields a
//! single `Completion` event once both markers arrived and the process
//! exited.
//!
//! Commands started through [`StreamMerger::spawn`] lead their own process
//! group, so killing or dropping the stream reaches every process the
//! command forked, not only the direct child.

use futures::stream::{BoxStream, StreamExt};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::progress::classify_line;
use super::{StreamEvent, StreamName};
use crate::core::config::RunConfig;
use crate::core::errors::{ConvoyError, Result};

/// Readers get this long to observe end-of-stream after the process is killed
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Time between SIGTERM and SIGKILL for the rest of a killed process group
#[cfg(unix)]
const TERM_GRACE: Duration = Duration::from_secs(1);

/// Queue and backpressure settings for one merged stream
#[derive(Debug, Clone)]
pub struct StreamOptions {
    pub queue_capacity: usize,
    pub enqueue_timeout: Duration,
    pub drop_warning_interval: Duration,
    /// Bytes kept per line; the rest of an overlong line is discarded
    pub max_line_bytes: usize,
}

impl StreamOptions {
    pub fn from_config(config: &RunConfig) -> Self {
        Self {
            queue_capacity: config.queue_capacity.max(1),
            enqueue_timeout: config.enqueue_timeout(),
            drop_warning_interval: config.drop_warning_interval(),
            max_line_bytes: config.max_line_bytes.max(1),
        }
    }
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self::from_config(&RunConfig::default())
    }
}

enum Envelope {
    Event(StreamEvent),
    Eof(StreamName),
}

/// Entry points for merging a process's output channels
pub struct StreamMerger;

impl StreamMerger {
    /// Spawn `command` in a new process group with piped stdout/stderr and merge its output
    pub fn spawn(command: &mut Command, options: StreamOptions) -> Result<MergedStream> {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let child = command
            .spawn()
            .map_err(|e| ConvoyError::io(format!("spawn {:?}", command.as_std().get_program()), e))?;
        // The child leads its group, so the group id is its pid
        let group = child.id().and_then(|pid| i32::try_from(pid).ok());
        Self::merge(child, group, options)
    }

    /// Merge the output of an already spawned child whose stdout and stderr are piped.
    ///
    /// Only the child itself is killed on [`MergedStream::kill`] or drop.
    pub fn from_child(child: Child, options: StreamOptions) -> Result<MergedStream> {
        Self::merge(child, None, options)
    }

    fn merge(mut child: Child, group: Option<i32>, options: StreamOptions) -> Result<MergedStream> {
        let stdout = child.stdout.take().ok_or_else(|| {
            ConvoyError::configuration("child process stdout is not piped")
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            ConvoyError::configuration("child process stderr is not piped")
        })?;

        let (tx, rx) = mpsc::channel(options.queue_capacity.max(1));
        let counters = ReaderCounters::default();

        let readers = vec![
            tokio::spawn(read_channel(
                stdout,
                StreamName::Stdout,
                tx.clone(),
                options.clone(),
                counters.clone(),
            )),
            tokio::spawn(read_channel(
                stderr,
                StreamName::Stderr,
                tx,
                options,
                counters.clone(),
            )),
        ];

        Ok(MergedStream {
            rx,
            child,
            group,
            readers,
            open_readers: 2,
            killed_at: None,
            finished: false,
            counters,
        })
    }
}

/// Lazy, order-preserving event sequence for one child process
pub struct MergedStream {
    rx: mpsc::Receiver<Envelope>,
    child: Child,
    group: Option<i32>,
    readers: Vec<JoinHandle<()>>,
    open_readers: usize,
    killed_at: Option<Instant>,
    finished: bool,
    counters: ReaderCounters,
}

/// Counters shared by both readers of one process
#[derive(Clone, Default)]
struct ReaderCounters {
    dropped: Arc<AtomicU64>,
    truncated: Arc<AtomicU64>,
}

impl MergedStream {
    /// Next event, or `None` after the terminal `Completion` was yielded
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        if self.finished {
            return None;
        }

        while self.open_readers > 0 {
            let received = match self.killed_at {
                Some(at) => {
                    let remaining = KILL_GRACE.saturating_sub(at.elapsed());
                    match tokio::time::timeout(remaining, self.rx.recv()).await {
                        Ok(received) => received,
                        Err(_) => {
                            debug!("readers still open after kill grace period, aborting them");
                            self.abort_readers();
                            None
                        }
                    }
                }
                None => self.rx.recv().await,
            };

            match received {
                Some(Envelope::Event(event)) => return Some(event),
                Some(Envelope::Eof(stream)) => {
                    debug!(%stream, "reader reached end of stream");
                    self.open_readers -= 1;
                }
                // Every sender is gone, so no marker can still arrive
                None => self.open_readers = 0,
            }
        }

        self.finished = true;
        Some(match self.child.wait().await {
            Ok(status) => completion_for(status),
            Err(e) => StreamEvent::Completion {
                success: false,
                exit_code: None,
                error_message: Some(format!("failed to wait for process: {}", e)),
            },
        })
    }

    /// Terminate the process and its group; the readers then observe ordinary end-of-stream
    pub fn kill(&mut self) {
        if self.killed_at.is_none() {
            self.terminate_group();
            if let Err(e) = self.child.start_kill() {
                debug!(error = %e, "kill request failed, process probably already exited");
            }
            self.killed_at = Some(Instant::now());
        }
    }

    /// Number of events discarded by the backpressure policy so far
    pub fn dropped_events(&self) -> u64 {
        self.counters.dropped.load(Ordering::Relaxed)
    }

    /// Number of lines cut down to `max_line_bytes` so far
    pub fn truncated_lines(&self) -> u64 {
        self.counters.truncated.load(Ordering::Relaxed)
    }

    /// Process id of the child, if it is still running
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Adapt into a boxed stream; dropping it kills the child
    pub fn into_stream(self) -> BoxStream<'static, StreamEvent> {
        futures::stream::unfold(self, |mut merged| async move {
            merged.next_event().await.map(|event| (event, merged))
        })
        .boxed()
    }

    fn abort_readers(&mut self) {
        for reader in &self.readers {
            reader.abort();
        }
    }

    fn terminate_group(&mut self) {
        if let Some(pgid) = self.group.take() {
            terminate_group(pgid);
        }
    }
}

impl Drop for MergedStream {
    fn drop(&mut self) {
        // The child itself is killed by kill_on_drop
        if !self.finished {
            self.terminate_group();
        }
        self.abort_readers();
    }
}

/// SIGTERM the whole group, then SIGKILL whatever is left after `TERM_GRACE`
#[cfg(unix)]
fn terminate_group(pgid: i32) {
    use nix::sys::signal::Signal;

    if !signal_group(pgid, Signal::SIGTERM) {
        return;
    }
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                tokio::time::sleep(TERM_GRACE).await;
                signal_group(pgid, Signal::SIGKILL);
            });
        }
        // No runtime to wait on, so skip the grace period
        Err(_) => {
            signal_group(pgid, Signal::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
fn terminate_group(_pgid: i32) {}

/// Returns false once the group has no members left
#[cfg(unix)]
fn signal_group(pgid: i32, signal: nix::sys::signal::Signal) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    match killpg(Pid::from_raw(pgid), signal) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(e) => {
            debug!(pgid, %signal, error = %e, "failed to signal process group");
            false
        }
    }
}

fn completion_for(status: ExitStatus) -> StreamEvent {
    if status.success() {
        StreamEvent::Completion {
            success: true,
            exit_code: status.code(),
            error_message: None,
        }
    } else {
        StreamEvent::Completion {
            success: false,
            exit_code: status.code(),
            error_message: Some(format!("process exited with {}", status)),
        }
    }
}

/// Rate limiter for one kind of warning from one reader
struct ThrottledWarning {
    stream: StreamName,
    message: &'static str,
    interval: Duration,
    last_warned: Option<Instant>,
    suppressed: u64,
}

impl ThrottledWarning {
    fn new(stream: StreamName, message: &'static str, interval: Duration) -> Self {
        Self {
            stream,
            message,
            interval,
            last_warned: None,
            suppressed: 0,
        }
    }

    fn record(&mut self) {
        self.suppressed += 1;
        let due = self
            .last_warned
            .map_or(true, |at| at.elapsed() >= self.interval);
        if due {
            self.emit();
            self.last_warned = Some(Instant::now());
        }
    }

    /// Report occurrences still held back by the rate limit; returns how many there were
    fn flush(&mut self) -> u64 {
        let pending = self.suppressed;
        if pending > 0 {
            self.emit();
        }
        pending
    }

    fn emit(&mut self) {
        warn!(stream = %self.stream, count = self.suppressed, "{}", self.message);
        self.suppressed = 0;
    }
}

async fn read_channel<R>(
    reader: R,
    stream: StreamName,
    tx: mpsc::Sender<Envelope>,
    options: StreamOptions,
    counters: ReaderCounters,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut drops = ThrottledWarning::new(
        stream,
        "event queue full, dropping output",
        options.drop_warning_interval,
    );
    let mut truncations = ThrottledWarning::new(
        stream,
        "output line too long, truncating",
        options.drop_warning_interval,
    );
    let mut consumer_gone = false;

    loop {
        buf.clear();
        match read_capped_line(&mut reader, &mut buf, options.max_line_bytes).await {
            Ok((0, _)) => break,
            Ok((_, truncated)) => {
                if truncated {
                    counters.truncated.fetch_add(1, Ordering::Relaxed);
                    truncations.record();
                }
                let line = decode_line(&buf);
                let event = classify_line(line, stream);
                match tx
                    .send_timeout(Envelope::Event(event), options.enqueue_timeout)
                    .await
                {
                    Ok(()) => {}
                    Err(SendTimeoutError::Timeout(_)) => {
                        counters.dropped.fetch_add(1, Ordering::Relaxed);
                        drops.record();
                    }
                    // Consumer is gone; nobody wants the rest
                    Err(SendTimeoutError::Closed(_)) => {
                        consumer_gone = true;
                        break;
                    }
                }
            }
            Err(e) => {
                warn!(%stream, error = %e, "failed reading process output");
                break;
            }
        }
    }

    drops.flush();
    truncations.flush();
    if !consumer_gone {
        let _ = tx.send(Envelope::Eof(stream)).await;
    }
}

/// Read one line into `buf` without its newline, keeping at most `max` bytes.
///
/// Returns the number of bytes consumed from `reader` (0 at end of input)
/// and whether the line was cut short.
async fn read_capped_line<R>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    max: usize,
) -> std::io::Result<(usize, bool)>
where
    R: AsyncBufRead + Unpin,
{
    let mut consumed = 0;
    let mut truncated = false;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            break;
        }
        let (content, used, done) = match available.iter().position(|&b| b == b'\n') {
            Some(i) => (&available[..i], i + 1, true),
            None => (available, available.len(), false),
        };
        let room = max.saturating_sub(buf.len());
        if content.len() > room {
            truncated = true;
        }
        buf.extend_from_slice(&content[..content.len().min(room)]);
        reader.consume(used);
        consumed += used;
        if done {
            break;
        }
    }
    Ok((consumed, truncated))
}

fn decode_line(buf: &[u8]) -> String {
    let mut end = buf.len();
    if end > 0 && buf[end - 1] == b'\n' {
        end -= 1;
    }
    if end > 0 && buf[end - 1] == b'\r' {
        end -= 1;
    }
    String::from_utf8_lossy(&buf[..end]).into_owned()
}
