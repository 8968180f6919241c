use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_stream::Stream;
use tracing::debug;

use crate::codec::{self, Decoded};
use crate::error::ConsumeError;
use crate::message::IdentifiedMessage;
use crate::storage::{BlockingConnection, Store};

type PullResult = Result<Option<Decoded<IdentifiedMessage>>, ConsumeError>;

/// `Duration::ZERO` means "wait forever", as BLPOP's `0` does.
fn effective_timeout(timeout: Duration) -> Option<Duration> {
    (!timeout.is_zero()).then_some(timeout)
}

/// Pull handle for one topic.
///
/// Clones share the same blocking connection, opened on the first pull, so
/// pulls through any clone serialize on it and never see the same entry twice.
#[derive(Clone)]
pub struct TopicConsumer {
    inner: Arc<ConsumerInner>,
}

struct ConsumerInner {
    topic: String,
    store: Arc<dyn Store>,
    conn: Mutex<Option<Box<dyn BlockingConnection>>>,
    default_timeout: Duration,
}

impl TopicConsumer {
    pub(super) fn new(topic: &str, store: Arc<dyn Store>, default_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(ConsumerInner {
                topic: topic.to_string(),
                store,
                conn: Mutex::new(None),
                default_timeout,
            }),
        }
    }

    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    /// True when both handles share one underlying consumer.
    pub fn same_handle(&self, other: &TopicConsumer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Pull with the configured default timeout.
    pub async fn next(&self) -> PullResult {
        self.next_timeout(self.inner.default_timeout).await
    }

    /// Block on the topic's delivery list until an entry arrives or `timeout`
    /// elapses (`Ok(None)`). `Duration::ZERO` blocks indefinitely.
    ///
    /// The connection is taken out of the handle for the duration of the pop
    /// and only put back once the pop completes. If this future is dropped
    /// mid-pop, or the pop fails, the connection is dropped with it. Closing
    /// it makes the server abandon the pending pop instead of consuming a
    /// later entry on behalf of a caller that is gone.
    pub async fn next_timeout(&self, timeout: Duration) -> PullResult {
        let mut slot = self.inner.conn.lock().await;
        let mut conn = match slot.take() {
            Some(conn) => conn,
            None => {
                debug!(topic = %self.inner.topic, "opening consumer connection");
                self.inner.store.blocking_connection().await?
            }
        };
        let raw = conn
            .pop_head(&self.inner.topic, effective_timeout(timeout))
            .await?;
        *slot = Some(conn);
        Ok(raw.map(|value| codec::parse(&value)))
    }

    /// A stream over the topic that ends at the first pull that times out.
    /// Calling `stream` again resumes pulling from the same handle.
    pub fn stream(&self) -> TopicStream {
        self.stream_timeout(self.inner.default_timeout)
    }

    pub fn stream_timeout(&self, timeout: Duration) -> TopicStream {
        TopicStream {
            consumer: self.clone(),
            timeout,
            pending: None,
            finished: false,
        }
    }
}

/// Stream returned by [`TopicConsumer::stream`].
///
/// Dropping it while a pull is in flight cancels that pull and closes the
/// consumer's connection; the next pull opens a fresh one. An entry the server
/// had already handed to the cancelled pull before the close is lost with it.
pub struct TopicStream {
    consumer: TopicConsumer,
    timeout: Duration,
    pending: Option<Pin<Box<dyn Future<Output = PullResult> + Send>>>,
    finished: bool,
}

impl Stream for TopicStream {
    type Item = Result<Decoded<IdentifiedMessage>, ConsumeError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        if self.pending.is_none() {
            let consumer = self.consumer.clone();
            let timeout = self.timeout;
            self.pending = Some(Box::pin(async move { consumer.next_timeout(timeout).await }));
        }
        let Some(pending) = self.pending.as_mut() else {
            return Poll::Ready(None);
        };
        let result = ready!(pending.as_mut().poll(cx));
        self.pending = None;
        match result {
            Ok(Some(message)) => Poll::Ready(Some(Ok(message))),
            Ok(None) => {
                self.finished = true;
                Poll::Ready(None)
            }
            Err(e) => Poll::Ready(Some(Err(e))),
        }
    }
}
