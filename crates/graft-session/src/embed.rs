//! Adapters that let external streams and sinks ride inside messages.

use std::fmt;
use std::pin::Pin;

use futures_core::Stream;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use futures_util::{FutureExt, Sink, SinkExt, StreamExt};
use tracing::debug;

use crate::channel::{Channel, Direction};
use crate::value::Value;

/// Something that can be carried by a channel once it is embedded in a message.
///
/// When a message containing an `Embed` is written, the session allocates a
/// channel in [`direction`](Embed::direction) and hands it to
/// [`drive`](Embed::drive), which runs until the embedded value is exhausted.
pub trait Embed: Send + 'static {
    /// The direction of the channel as seen by the embedding side.
    fn direction(&self) -> Direction;

    /// Move data between the embedded value and `channel`.
    fn drive(self: Box<Self>, channel: Channel) -> BoxFuture<'static, ()>;
}

/// Feeds the items of a stream into a write channel.
pub(crate) struct Producer {
    stream: BoxStream<'static, Result<Value, String>>,
}

impl Producer {
    pub(crate) fn new<S, T>(stream: S) -> Self
    where
        S: Stream<Item = T> + Send + 'static,
        T: Into<Value> + 'static,
    {
        Self {
            stream: stream.map(|item| Ok(item.into())).boxed(),
        }
    }

    pub(crate) fn fallible<S, T, E>(stream: S) -> Self
    where
        S: Stream<Item = Result<T, E>> + Send + 'static,
        T: Into<Value> + 'static,
        E: fmt::Display + 'static,
    {
        Self {
            stream: stream
                .map(|item| item.map(Into::into).map_err(|err| err.to_string()))
                .boxed(),
        }
    }
}

impl Embed for Producer {
    fn direction(&self) -> Direction {
        Direction::Write
    }

    fn drive(self: Box<Self>, channel: Channel) -> BoxFuture<'static, ()> {
        let mut stream = self.stream;
        async move {
            while let Some(item) = stream.next().await {
                match item {
                    Ok(value) => {
                        if channel.send(value).await.is_err() {
                            debug!(channel_id = channel.id(), "embedded producer closed early");
                            return;
                        }
                    }
                    Err(reason) => {
                        debug!(channel_id = channel.id(), %reason, "embedded producer failed");
                        let _ = channel.fail(reason).await;
                        return;
                    }
                }
            }
            let _ = channel.end().await;
        }
        .boxed()
    }
}

type BoxSink = Pin<Box<dyn Sink<Value, Error = String> + Send>>;

/// Drains a read channel into a sink.
pub(crate) struct Consumer {
    sink: BoxSink,
}

impl Consumer {
    pub(crate) fn new<K>(sink: K) -> Self
    where
        K: Sink<Value> + Send + 'static,
        K::Error: fmt::Display,
    {
        Self {
            sink: Box::pin(sink.sink_map_err(|err| err.to_string())),
        }
    }
}

impl Embed for Consumer {
    fn direction(&self) -> Direction {
        Direction::Read
    }

    fn drive(self: Box<Self>, channel: Channel) -> BoxFuture<'static, ()> {
        let mut sink = self.sink;
        async move {
            while let Some(item) = channel.recv().await {
                match item {
                    Ok(value) => {
                        if let Err(reason) = sink.send(value).await {
                            debug!(channel_id = channel.id(), %reason, "embedded consumer rejected value");
                            // Keep draining so the writer is not left waiting on credit.
                            while channel.recv().await.is_some() {}
                            return;
                        }
                    }
                    Err(err) => {
                        debug!(channel_id = channel.id(), %err, "embedded consumer input failed");
                        break;
                    }
                }
            }
            if let Err(reason) = sink.close().await {
                debug!(channel_id = channel.id(), %reason, "embedded consumer close failed");
            }
        }
        .boxed()
    }
}
