// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! WebSocket pub/sub subscriber for gateway status topics.

use core_types::retry::{Backoff, RetryPolicy};
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use log::{error, info, warn};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::decode::SubscribeFrame;
use crate::source::{SightingSource, SourceEvent};
use crate::topic::TopicPattern;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid broker url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("subscribe frame encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("broker closed the connection")]
    Closed,
}

enum SessionEnd {
    Cancelled,
    ConsumerGone,
}

/// Subscribes to every gateway topic and forwards frames, reconnecting with backoff.
pub struct WsWorker {
    url: Url,
    filter: String,
    retry: RetryPolicy,
}

impl WsWorker {
    pub fn new(url: &str, pattern: &TopicPattern, retry: RetryPolicy) -> Result<Self, TransportError> {
        Ok(Self {
            url: Url::parse(url)?,
            filter: pattern.subscription_filter(),
            retry,
        })
    }

    pub fn filter(&self) -> &str {
        &self.filter
    }

    async fn stream(self, tx: mpsc::Sender<SourceEvent>, cancel: CancellationToken) {
        let mut backoff = self.retry.backoff();
        loop {
            match self.session(&tx, &cancel, &mut backoff).await {
                Ok(SessionEnd::Cancelled) | Ok(SessionEnd::ConsumerGone) => break,
                Err(err) => {
                    error!("[ws-source] broker connection to {} lost: {err}", self.url);
                    if tx
                        .send(SourceEvent::Disconnected(err.to_string()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }
            let Some(delay) = backoff.next_delay() else {
                error!(
                    "[ws-source] giving up after {} reconnect attempts",
                    backoff.attempts()
                );
                break;
            };
            info!("[ws-source] reconnecting in {}ms", delay.as_millis());
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        info!("[ws-source] subscriber stopped");
    }

    async fn session(
        &self,
        tx: &mpsc::Sender<SourceEvent>,
        cancel: &CancellationToken,
        backoff: &mut Backoff,
    ) -> Result<SessionEnd, TransportError> {
        let (ws, _) = tokio::select! {
            _ = cancel.cancelled() => return Ok(SessionEnd::Cancelled),
            res = connect_async(self.url.as_str()) => res?,
        };
        let (mut write, mut read) = ws.split();
        let subscribe = serde_json::to_string(&SubscribeFrame::new(&self.filter))?;
        write.send(Message::Text(subscribe)).await?;
        info!("[ws-source] subscribed to {} on {}", self.filter, self.url);
        backoff.reset();
        if tx.send(SourceEvent::Connected).await.is_err() {
            return Ok(SessionEnd::ConsumerGone);
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = write.close().await;
                    return Ok(SessionEnd::Cancelled);
                }
                msg = read.next() => {
                    let text = match msg {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                            Ok(text) => text,
                            Err(_) => {
                                warn!("[ws-source] dropping non-utf8 binary frame");
                                continue;
                            }
                        },
                        Some(Ok(Message::Close(_))) | None => return Err(TransportError::Closed),
                        Some(Ok(_)) => continue,
                        Some(Err(err)) => return Err(err.into()),
                    };
                    if tx.send(SourceEvent::Frame(text)).await.is_err() {
                        return Ok(SessionEnd::ConsumerGone);
                    }
                }
            }
        }
    }
}

impl SightingSource for WsWorker {
    fn label(&self) -> &'static str {
        "ws-source"
    }

    fn run(
        self: Box<Self>,
        tx: mpsc::Sender<SourceEvent>,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, ()> {
        Box::pin((*self).stream(tx, cancel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(usize::MAX, 10, 20, 0.0)
    }

    #[tokio::test]
    async fn subscribes_forwards_and_reconnects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let broker = tokio::spawn(async move {
            let mut subscriptions = Vec::new();
            for round in 0..2 {
                let (stream, _) = listener.accept().await.unwrap();
                let mut ws = accept_async(stream).await.unwrap();
                if let Some(Ok(Message::Text(text))) = ws.next().await {
                    subscriptions.push(text);
                }
                ws.send(Message::Text(format!("frame-{round}"))).await.unwrap();
                if round == 0 {
                    ws.close(None).await.unwrap();
                } else {
                    // hold the connection until the client leaves
                    while let Some(Ok(_)) = ws.next().await {}
                }
            }
            subscriptions
        });

        let pattern = TopicPattern::parse("gw/{gateway}/status").unwrap();
        let worker = WsWorker::new(&format!("ws://{addr}/pubsub"), &pattern, policy()).unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(Box::new(worker).run(tx, cancel.clone()));

        assert_eq!(rx.recv().await, Some(SourceEvent::Connected));
        assert_eq!(rx.recv().await, Some(SourceEvent::Frame("frame-0".into())));
        assert!(matches!(rx.recv().await, Some(SourceEvent::Disconnected(_))));
        assert_eq!(rx.recv().await, Some(SourceEvent::Connected));
        assert_eq!(rx.recv().await, Some(SourceEvent::Frame("frame-1".into())));

        cancel.cancel();
        task.await.unwrap();
        let subscriptions = broker.await.unwrap();
        assert_eq!(subscriptions.len(), 2);
        for sub in subscriptions {
            let value: serde_json::Value = serde_json::from_str(&sub).unwrap();
            assert_eq!(value["action"], "subscribe");
            assert_eq!(value["topic"], "gw/+/status");
        }
    }

    #[test]
    fn rejects_invalid_url() {
        let pattern = TopicPattern::parse("{gateway}").unwrap();
        assert!(matches!(
            WsWorker::new("not a url", &pattern, policy()),
            Err(TransportError::InvalidUrl(_))
        ));
    }
}
