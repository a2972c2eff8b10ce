use futures::future::BoxFuture;
use log::info;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// What a source hands to the ingestion worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceEvent {
    /// Raw broker frame, decoded by the consumer.
    Frame(String),
    Connected,
    Disconnected(String),
}

/// A producer of broker frames that runs until cancelled or its consumer goes away.
pub trait SightingSource: Send + 'static {
    fn label(&self) -> &'static str;

    fn run(
        self: Box<Self>,
        tx: mpsc::Sender<SourceEvent>,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, ()>;
}

/// Source fed from an in-process channel, for embedding and tests.
pub struct ChannelSource {
    rx: mpsc::Receiver<SourceEvent>,
}

impl ChannelSource {
    pub fn new(capacity: usize) -> (mpsc::Sender<SourceEvent>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, Self { rx })
    }
}

impl SightingSource for ChannelSource {
    fn label(&self) -> &'static str {
        "channel-source"
    }

    fn run(
        self: Box<Self>,
        tx: mpsc::Sender<SourceEvent>,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, ()> {
        let mut rx = self.rx;
        Box::pin(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = rx.recv() => match event {
                        Some(event) => {
                            if tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
            info!("[channel-source] stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn forwards_until_input_closes() {
        let (input, source) = ChannelSource::new(4);
        let (tx, mut rx) = mpsc::channel(4);
        let task = tokio::spawn(Box::new(source).run(tx, CancellationToken::new()));
        input.send(SourceEvent::Frame("a".into())).await.unwrap();
        drop(input);
        assert_eq!(rx.recv().await, Some(SourceEvent::Frame("a".into())));
        task.await.unwrap();
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn stops_on_cancel() {
        let (_input, source) = ChannelSource::new(4);
        let (tx, _rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(Box::new(source).run(tx, cancel.clone()));
        cancel.cancel();
        task.await.unwrap();
    }
}
