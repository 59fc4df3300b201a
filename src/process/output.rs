use std::fmt;
use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;

use futures::future;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Where a server's stdout or stderr is written. `None` discards it.
pub type Sink = Box<dyn Write + Send + 'static>;

/// A cloneable in-memory sink, handy for asserting on server output.
#[derive(Clone, Default)]
pub struct CapturedOutput {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl CapturedOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sink(&self) -> Sink {
        Box::new(self.clone())
    }

    pub fn contents(&self) -> Vec<u8> {
        self.buf.lock().clone()
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.buf.lock()).into_owned()
    }
}

impl Write for CapturedOutput {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.lock().extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Copies a child pipe into a sink until EOF or cancellation, then hands
/// the sink back.
pub(crate) struct Pump {
    join_handle: JoinHandle<Sink>,
    token: CancellationToken,
}

impl fmt::Debug for Pump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pump")
            .field("cancelled", &self.token.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl Pump {
    pub(crate) fn spawn<R>(mut reader: R, mut sink: Sink) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let token = CancellationToken::new();
        let join_handle = tokio::spawn({
            let token = token.clone();
            async move {
                let mut buf = [0u8; 8192];
                loop {
                    let n = tokio::select! {
                        _ = token.cancelled() => break,
                        read = reader.read(&mut buf) => match read {
                            Ok(0) => break,
                            Ok(n) => n,
                            Err(err) => {
                                log::debug!("output pipe closed: {err}");
                                break;
                            }
                        },
                    };
                    if let Err(err) = sink.write_all(&buf[..n]) {
                        log::warn!("dropping server output: {err}");
                        break;
                    }
                }
                let _ = sink.flush();
                sink
            }
        });

        Self { join_handle, token }
    }

    /// Lets the pump drain for up to `grace`, then cancels it. Returns the
    /// sink unless the task panicked.
    pub(crate) async fn finish(self, grace: Duration) -> Option<Sink> {
        let Self {
            mut join_handle,
            token,
        } = self;
        let joined = match tokio::time::timeout(grace, &mut join_handle).await {
            Ok(joined) => joined,
            Err(_) => {
                token.cancel();
                join_handle.await
            }
        };
        joined.ok()
    }

    pub(crate) async fn finish_all(pumps: impl IntoIterator<Item = Pump>, grace: Duration) {
        future::join_all(pumps.into_iter().map(|pump| pump.finish(grace))).await;
    }
}
