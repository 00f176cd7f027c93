use chrono::Utc;
use orient_common::{OrientationDecoder, OrientationSample};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Decoder stage between the stream actor and the presenter.
///
/// Decodes every raw frame in arrival order and publishes the current
/// [`OrientationSample`]. Frames that fail to decode leave the previous
/// sample in place.
pub struct SampleFeed {
    sample_rx: watch::Receiver<Option<OrientationSample>>,
    task: JoinHandle<()>,
}

impl SampleFeed {
    /// Starts decoding frames received on `frames`.
    #[must_use]
    pub fn spawn(frames: broadcast::Receiver<String>) -> Self {
        let (sample_tx, sample_rx) = watch::channel(None);
        let task = tokio::spawn(run(frames, sample_tx));
        Self { sample_rx, task }
    }

    /// Current sample, if any frame has decoded yet.
    #[must_use]
    pub fn latest(&self) -> Option<OrientationSample> {
        *self.sample_rx.borrow()
    }

    /// Receiver that observes every new sample.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<Option<OrientationSample>> {
        self.sample_rx.clone()
    }
}

impl Drop for SampleFeed {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn receipt_time_ms() -> i64 {
    Utc::now().timestamp_millis()
}

async fn run(
    mut frames: broadcast::Receiver<String>,
    sample_tx: watch::Sender<Option<OrientationSample>>,
) {
    let mut decoder = OrientationDecoder::new();
    loop {
        match frames.recv().await {
            Ok(raw) => {
                if let Some(sample) = decoder.accept(&raw, receipt_time_ms()) {
                    trace!(latency_ms = sample.latency_ms, "sample decoded");
                    sample_tx.send_replace(Some(sample));
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "decoder fell behind, frames dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    debug!(
        accepted = decoder.accepted(),
        discarded = decoder.discarded(),
        "frame source closed"
    );
}
