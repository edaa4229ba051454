use crate::decoder::{LineDecoder, LogDecoder};
use crate::engine::{EngineGateway, LogOptions};
use crate::error::ErrorKind;
use crate::stats::StatsSample;
use crate::transport::Transport;
use futures::StreamExt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub type ErrorCallback = Box<dyn FnMut(ErrorKind) + Send>;

/// Cancel handle for a running stream. Cancelling closes the connection and
/// suppresses every later callback, including the error callback.
#[derive(Debug)]
pub struct StreamHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl StreamHandle {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the reader task to release the stream.
    pub async fn finished(self) {
        if let Err(error) = self.task.await {
            debug!("stream task ended abnormally: {error}");
        }
    }
}

trait Sink: Send + 'static {
    fn feed(&mut self, bytes: &[u8]);
    fn finish(&mut self);
}

struct LogSink<F> {
    decoder: LogDecoder,
    on_chunk: F,
}

impl<F> Sink for LogSink<F>
where
    F: FnMut(String) + Send + 'static,
{
    fn feed(&mut self, bytes: &[u8]) {
        for chunk in self.decoder.feed(bytes) {
            (self.on_chunk)(chunk);
        }
    }

    fn finish(&mut self) {
        if let Some(chunk) = self.decoder.flush() {
            (self.on_chunk)(chunk);
        }
    }
}

struct StatsSink<F> {
    decoder: LineDecoder<StatsSample>,
    on_sample: F,
}

impl<F> StatsSink<F>
where
    F: FnMut(StatsSample) + Send + 'static,
{
    fn deliver(&mut self, unit: Result<StatsSample, ErrorKind>) {
        // Decode failures were already logged by the decoder; the stream goes on.
        if let Ok(sample) = unit {
            (self.on_sample)(sample);
        }
    }
}

impl<F> Sink for StatsSink<F>
where
    F: FnMut(StatsSample) + Send + 'static,
{
    fn feed(&mut self, bytes: &[u8]) {
        for unit in self.decoder.feed(bytes) {
            self.deliver(unit);
        }
    }

    fn finish(&mut self) {
        if let Some(unit) = self.decoder.flush() {
            self.deliver(unit);
        }
    }
}

impl EngineGateway {
    /// Follows a container's log, one callback per received read.
    pub fn stream_logs<F>(
        &self,
        id: &str,
        options: &LogOptions,
        on_chunk: F,
        on_error: Option<ErrorCallback>,
    ) -> StreamHandle
    where
        F: FnMut(String) + Send + 'static,
    {
        let options = LogOptions {
            follow: true,
            ..options.clone()
        };
        let sink = LogSink {
            decoder: LogDecoder::new(options.framing),
            on_chunk,
        };
        spawn_stream(
            self.transport(),
            Self::logs_path(id, &options),
            sink,
            on_error,
        )
    }

    /// Follows a container's stats as newline-delimited JSON samples.
    pub fn stream_stats<F>(
        &self,
        id: &str,
        on_sample: F,
        on_error: Option<ErrorCallback>,
    ) -> StreamHandle
    where
        F: FnMut(StatsSample) + Send + 'static,
    {
        let sink = StatsSink {
            decoder: LineDecoder::new(),
            on_sample,
        };
        spawn_stream(self.transport(), Self::stats_path(id, true), sink, on_error)
    }
}

fn spawn_stream<S: Sink>(
    transport: Arc<dyn Transport>,
    path: String,
    mut sink: S,
    mut on_error: Option<ErrorCallback>,
) -> StreamHandle {
    let token = CancellationToken::new();
    let cancelled = token.clone();

    let task = tokio::spawn(async move {
        let mut report = |error: ErrorKind| {
            if cancelled.is_cancelled() {
                return;
            }
            match on_error.as_mut() {
                Some(callback) => callback(error),
                None => debug!("stream {path} failed without error handler: {error}"),
            }
        };

        let opened = tokio::select! {
            biased;
            _ = cancelled.cancelled() => return,
            opened = transport.open_stream(&path) => opened,
        };
        let mut body = match opened {
            Ok(body) => body,
            Err(error) => {
                report(error);
                return;
            }
        };
        debug!("stream {path} opened");

        loop {
            tokio::select! {
                biased;
                _ = cancelled.cancelled() => {
                    debug!("stream {path} cancelled");
                    return;
                }
                next = body.next() => match next {
                    Some(Ok(chunk)) => {
                        if cancelled.is_cancelled() {
                            return;
                        }
                        sink.feed(&chunk);
                    }
                    Some(Err(error)) => {
                        if !cancelled.is_cancelled() {
                            sink.finish();
                        }
                        report(error);
                        return;
                    }
                    None => {
                        debug!("stream {path} closed by engine");
                        if !cancelled.is_cancelled() {
                            sink.finish();
                        }
                        report(ErrorKind::StreamClosed);
                        return;
                    }
                }
            }
        }
    });

    StreamHandle { token, task }
}
