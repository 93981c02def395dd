//! Fan-in of named byte streams into one broadcast output.
//!
//! Every stream gets its own reader task. Chunks from all streams are
//! published on a shared broadcast channel; when a stream ends (EOF or read
//! error) a [`MergerError`] is delivered on that stream's one-shot
//! termination channel. Streams can be added at any time, which is how
//! command output joins the console output of a running VM.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::{Bytes, BytesMut};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::machine::CommandOutput;

const OUTPUT_CAPACITY: usize = 1024;
const READ_CHUNK: usize = 64 << 10;

/// Why a merged stream stopped producing output.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MergerErrorKind {
    /// The stream reached end of file.
    Eof,
    /// Reading the stream failed.
    Read(String),
}

/// Termination notice for one named stream.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MergerError {
    /// Stream name given to [`OutputMerger::add`].
    pub name: String,
    /// How the stream ended.
    pub kind: MergerErrorKind,
}

impl fmt::Display for MergerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            MergerErrorKind::Eof => write!(f, "{}: stream closed", self.name),
            MergerErrorKind::Read(message) => write!(f, "{}: {message}", self.name),
        }
    }
}

impl std::error::Error for MergerError {}

type Tee = Arc<tokio::sync::Mutex<File>>;

/// Merges named readers into one broadcast stream.
#[derive(Debug)]
pub struct OutputMerger {
    output: broadcast::Sender<Bytes>,
    errors: Mutex<HashMap<String, oneshot::Receiver<MergerError>>>,
    readers: Mutex<JoinSet<()>>,
    tee: Option<Tee>,
}

impl OutputMerger {
    /// Creates a merger; when `tee` is set every chunk is also appended to
    /// that file.
    #[must_use]
    pub fn new(tee: Option<File>) -> Self {
        let (output, _) = broadcast::channel(OUTPUT_CAPACITY);
        Self {
            output,
            errors: Mutex::new(HashMap::new()),
            readers: Mutex::new(JoinSet::new()),
            tee: tee.map(|file| Arc::new(tokio::sync::Mutex::new(file))),
        }
    }

    /// Subscribes to chunks published from now on.
    #[must_use]
    pub fn subscribe(&self) -> CommandOutput {
        CommandOutput::new(self.output.subscribe())
    }

    /// Starts pumping `reader` into the merged output under `name`.
    ///
    /// The stream's termination channel is kept until [`Self::take_error`]
    /// claims it. Must be called from within a tokio runtime.
    pub fn add<R>(&self, name: impl Into<String>, reader: R)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let name = name.into();
        let (done_tx, done_rx) = oneshot::channel();
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.clone(), done_rx);
        self.spawn_reader(name, reader, done_tx);
    }

    /// Like [`Self::add`], but nobody will wait for the stream to end, so no
    /// termination channel is kept.
    pub fn add_untracked<R>(&self, name: impl Into<String>, reader: R)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (done_tx, _) = oneshot::channel();
        self.spawn_reader(name.into(), reader, done_tx);
    }

    fn spawn_reader<R>(&self, name: String, reader: R, done: oneshot::Sender<MergerError>)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let output = self.output.clone();
        let tee = self.tee.clone();
        let mut readers = self.readers.lock().unwrap_or_else(PoisonError::into_inner);
        // Reap readers of streams that already ended.
        while readers.try_join_next().is_some() {}
        readers.spawn(pump(name, reader, output, tee, done));
    }

    /// Takes the termination channel for stream `name`.
    ///
    /// Each channel can be taken once; later calls return `None`.
    pub fn take_error(&self, name: &str) -> Option<oneshot::Receiver<MergerError>> {
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
    }

    /// Waits until every stream added so far has ended.
    pub async fn wait(&self) {
        let mut readers = self.take_readers();
        while readers.join_next().await.is_some() {}
    }

    /// Stops all reader tasks and waits for them to exit.
    pub async fn shutdown(&self) {
        let mut readers = self.take_readers();
        readers.abort_all();
        while readers.join_next().await.is_some() {}
        debug!("output merger stopped");
    }

    fn take_readers(&self) -> JoinSet<()> {
        std::mem::take(&mut *self.readers.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

async fn pump<R>(
    name: String,
    mut reader: R,
    output: broadcast::Sender<Bytes>,
    tee: Option<Tee>,
    done: oneshot::Sender<MergerError>,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    let kind = loop {
        buf.reserve(READ_CHUNK);
        match reader.read_buf(&mut buf).await {
            Ok(0) => break MergerErrorKind::Eof,
            Ok(_) => {
                let chunk = buf.split().freeze();
                if let Some(log) = &tee {
                    let mut file = log.lock().await;
                    if let Err(err) = async {
                        file.write_all(&chunk).await?;
                        file.flush().await
                    }
                    .await
                    {
                        warn!(stream = %name, error = %err, "failed to write console log");
                    }
                }
                // No subscribers is fine; output is only consumed while a
                // command is being monitored.
                output.send(chunk).ok();
            }
            Err(err) => break MergerErrorKind::Read(err.to_string()),
        }
    };
    done.send(MergerError { name, kind }).ok();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncWriteExt, duplex};

    #[tokio::test]
    async fn merges_streams_and_reports_eof() {
        let merger = OutputMerger::new(None);
        let mut output = merger.subscribe();
        let (mut writer, reader) = duplex(64);
        merger.add("console", reader);
        let done = merger.take_error("console").expect("termination channel");

        writer.write_all(b"hello").await.expect("write");
        drop(writer);

        assert_eq!(output.recv().await.as_deref(), Some(b"hello".as_slice()));
        let err = done.await.expect("termination notice");
        assert_eq!(err.kind, MergerErrorKind::Eof);
        assert_eq!(err.to_string(), "console: stream closed");
    }

    #[tokio::test]
    async fn termination_channel_is_taken_once() {
        let merger = OutputMerger::new(None);
        let (_writer, reader) = duplex(8);
        merger.add("ssh", reader);

        assert!(merger.take_error("ssh").is_some());
        assert!(merger.take_error("ssh").is_none());
        merger.shutdown().await;
    }

    #[tokio::test]
    async fn finished_command_streams_are_released() {
        let merger = OutputMerger::new(None);
        let (_console, console_reader) = duplex(8);
        merger.add("qemu", console_reader);
        let _console_done = merger.take_error("qemu").expect("console channel");

        for round in 0..100 {
            let (stdout, stdout_reader) = duplex(8);
            let (stderr, stderr_reader) = duplex(8);
            let name = format!("ssh-{round}");
            merger.add(name.clone(), stdout_reader);
            merger.add_untracked(format!("{name}-stderr"), stderr_reader);
            let done = merger.take_error(&name).expect("termination channel");
            drop(stdout);
            drop(stderr);
            done.await.expect("stream ended");
        }

        assert!(merger.errors.lock().expect("errors lock").is_empty());
        let live = merger.readers.lock().expect("readers lock").len();
        assert!(live <= 4, "{live} readers still tracked");
        merger.shutdown().await;
    }

    #[tokio::test]
    async fn untracked_streams_still_reach_subscribers() {
        let merger = OutputMerger::new(None);
        let mut output = merger.subscribe();
        let (mut writer, reader) = duplex(64);
        merger.add_untracked("ssh-stderr", reader);

        writer.write_all(b"warning").await.expect("write");

        assert_eq!(output.recv().await.as_deref(), Some(b"warning".as_slice()));
        assert!(merger.take_error("ssh-stderr").is_none());
        merger.shutdown().await;
    }

    #[tokio::test]
    async fn wait_returns_after_all_streams_end() {
        let merger = OutputMerger::new(None);
        let (first, first_reader) = duplex(8);
        let (second, second_reader) = duplex(8);
        merger.add("a", first_reader);
        merger.add("b", second_reader);
        drop(first);
        drop(second);

        merger.wait().await;
    }

    #[tokio::test]
    async fn shutdown_stops_idle_readers() {
        let merger = OutputMerger::new(None);
        let (_writer, reader) = duplex(8);
        merger.add("idle", reader);
        let done = merger.take_error("idle").expect("termination channel");

        merger.shutdown().await;

        assert!(done.await.is_err(), "aborted reader never reports");
    }

    #[tokio::test]
    async fn tee_copies_output_to_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("console.log");
        let file = File::create(&path).await.expect("create log");
        let merger = OutputMerger::new(Some(file));
        let (mut writer, reader) = duplex(64);
        merger.add("console", reader);

        writer.write_all(b"boot log").await.expect("write");
        drop(writer);
        merger.wait().await;

        let logged = tokio::fs::read(&path).await.expect("read log");
        assert_eq!(logged, b"boot log");
    }
}
