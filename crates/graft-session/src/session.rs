use std::fmt;
use std::sync::{Arc, Weak};

use futures_util::stream::{self, BoxStream};
use futures_util::{SinkExt, StreamExt};
use graft_frame::{Frame, FrameCodec};
use graft_transport::Transport;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

use crate::channel::{Channel, Direction};
use crate::config::SessionConfig;
use crate::error::{Result, SessionError};
use crate::message::{Message, Provenance, SessionId};
use crate::mux::{classify, Mux, Outgoing, Wire};
use crate::relay::RelayHandle;

#[derive(Default)]
struct Tasks {
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

struct SessionInner {
    mux: Arc<Mux>,
    output: Mutex<mpsc::UnboundedReceiver<Result<Message>>>,
    // `None` once close has started.
    tasks: Mutex<Option<Tasks>>,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.mux.shutdown.cancel();
    }
}

/// One multiplexing endpoint.
///
/// A session is either bound to a transport, in which case written messages
/// go to the peer and the peer's messages come out of [`recv`](Session::recv),
/// or local, in which case written messages come straight back out. Local
/// sessions are what relay stages and in-process pipelines are built from.
///
/// `Session` is a cheap handle; clones share the same endpoint.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// A transport-less session that emits what is written to it.
    pub fn local() -> Self {
        Self::local_with_config(SessionConfig::default())
    }

    pub fn local_with_config(config: SessionConfig) -> Self {
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let mux = Mux::new(SessionId::generate(), config, None, output_tx);
        debug!(session = %mux.id, "local session started");
        Self::from_parts(mux, output_rx, Tasks::default())
    }

    /// Bind a session to a transport with default configuration.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new<T: Transport>(transport: T) -> Self {
        Self::with_config(transport, SessionConfig::default())
    }

    /// Bind a session to a transport.
    ///
    /// Must be called from within a tokio runtime.
    pub fn with_config<T: Transport>(transport: T, config: SessionConfig) -> Self {
        let (read_half, write_half) = tokio::io::split(transport);
        let codec = FrameCodec::with_config(config.frame.clone());

        let (outbound, outbound_rx) = mpsc::channel(config.queue_depth());
        let (signals, signals_rx) = mpsc::unbounded_channel();
        let (output_tx, output_rx) = mpsc::unbounded_channel();

        let mux = Mux::new(
            SessionId::generate(),
            config,
            Some(Wire { outbound, signals }),
            output_tx,
        );

        let writer = tokio::spawn(write_loop(
            Arc::downgrade(&mux),
            FramedWrite::new(write_half, codec.clone()),
            outbound_rx,
            signals_rx,
        ));
        let reader = tokio::spawn(read_loop(
            Arc::clone(&mux),
            FramedRead::new(read_half, codec),
        ));
        info!(session = %mux.id, "session started");

        Self::from_parts(
            mux,
            output_rx,
            Tasks {
                reader: Some(reader),
                writer: Some(writer),
            },
        )
    }

    fn from_parts(
        mux: Arc<Mux>,
        output: mpsc::UnboundedReceiver<Result<Message>>,
        tasks: Tasks,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                mux,
                output: Mutex::new(output),
                tasks: Mutex::new(Some(tasks)),
            }),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.inner.mux.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.mux.config
    }

    pub fn is_closed(&self) -> bool {
        self.inner.mux.is_closed()
    }

    /// Send a message.
    ///
    /// Live channels and streams inside it are replaced by placeholders and
    /// start flowing once the message is queued. A message that already
    /// carries origin metadata keeps it.
    pub async fn write(&self, message: Message) -> Result<()> {
        self.inner.mux.write(message).await
    }

    /// Send a message on behalf of another session, preserving its identity.
    pub async fn accept_relayed(
        &self,
        session: SessionId,
        channel: u32,
        mut message: Message,
    ) -> Result<()> {
        message.stamp(Provenance { session, channel });
        self.write(message).await
    }

    /// Next message from this session, `Ok(None)` once it has closed.
    ///
    /// A fatal transport or protocol failure is returned once as an error.
    pub async fn recv(&self) -> Result<Option<Message>> {
        let mut output = self.inner.output.lock().await;
        match output.recv().await {
            Some(Ok(message)) => Ok(Some(message)),
            Some(Err(err)) => Err(err),
            None => Ok(None),
        }
    }

    /// All further messages as a stream. The stream keeps the session alive.
    pub fn messages(&self) -> BoxStream<'static, Result<Message>> {
        stream::unfold(self.clone(), |session| async move {
            match session.recv().await {
                Ok(Some(message)) => Some((Ok(message), session)),
                Ok(None) => None,
                Err(err) => Some((Err(err), session)),
            }
        })
        .boxed()
    }

    /// A channel this side reads from; embed it to let the peer write to it.
    pub fn create_read_channel(&self) -> Result<Channel> {
        self.inner.mux.create_channel(Direction::Read)
    }

    /// A channel this side writes to; embed it to let the peer read from it.
    pub fn create_write_channel(&self) -> Result<Channel> {
        self.inner.mux.create_channel(Direction::Write)
    }

    /// A channel both sides read from and write to.
    pub fn create_duplex_channel(&self) -> Result<Channel> {
        self.inner.mux.create_channel(Direction::Duplex)
    }

    /// Forward every message from this session into `target`.
    pub fn pipe_into(&self, target: &Session) -> RelayHandle {
        RelayHandle::spawn(self.clone(), target.clone())
    }

    /// Forward every message from `source` into this session.
    pub fn pipe_from(&self, source: &Session) -> RelayHandle {
        source.pipe_into(self)
    }

    /// End all channels, flush pending frames and close the transport.
    ///
    /// Channels whose writer already called [`Channel::end`] are delivered in
    /// full first, which waits on the peer's credit for at most
    /// [`SessionConfig::close_timeout`]. Channels still open send what their
    /// credit allows and are then ended. A channel that still holds values
    /// nobody granted credit for fails on the reader's side instead.
    ///
    /// Idempotent: later calls return once the first close has finished.
    pub async fn close(&self) -> Result<()> {
        let mut tasks = self.inner.tasks.lock().await;
        let Some(mut running) = tasks.take() else {
            return Ok(());
        };
        let mux = &self.inner.mux;

        mux.mark_closed();
        mux.drain_ended(mux.config.close_timeout).await;
        mux.shutdown.cancel();
        mux.join_pumps().await;
        mux.drain();
        mux.shutdown_writer().await;

        if let Some(writer) = running.writer.take() {
            let _ = writer.await;
        }
        if let Some(reader) = running.reader.take() {
            let _ = reader.await;
        }
        mux.close_output();
        debug!(session = %mux.id, "session closed");
        Ok(())
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", self.id())
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn read_loop<R>(mux: Arc<Mux>, mut frames: FramedRead<R, FrameCodec>)
where
    R: AsyncRead + Unpin,
{
    loop {
        let next = tokio::select! {
            biased;
            _ = mux.shutdown.cancelled() => return,
            next = frames.next() => next,
        };

        let frame = match next {
            Some(Ok(frame)) => frame,
            Some(Err(err)) => {
                mux.finish(Some(classify(err)));
                return;
            }
            None => {
                mux.finish(None);
                return;
            }
        };

        match mux.dispatch(frame) {
            Ok(()) => {}
            Err(SessionError::UnknownChannel(id)) => {
                debug!(session = %mux.id, channel_id = id, "dropping frame for unknown channel");
            }
            Err(err) => {
                warn!(session = %mux.id, %err, "dropping session after bad frame");
                mux.finish(Some(err));
                return;
            }
        }
    }
}

async fn write_loop<W>(
    mux: Weak<Mux>,
    mut sink: FramedWrite<W, FrameCodec>,
    mut outbound: mpsc::Receiver<Outgoing>,
    mut signals: mpsc::UnboundedReceiver<Frame>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let next = tokio::select! {
            biased;
            Some(frame) = signals.recv() => Some(Outgoing::Frame(frame)),
            next = outbound.recv() => next,
        };

        match next {
            Some(Outgoing::Frame(frame)) => {
                if let Err(err) = sink.send(frame).await {
                    if let Some(mux) = mux.upgrade() {
                        mux.finish(Some(classify(err)));
                    }
                    return;
                }
            }
            Some(Outgoing::Shutdown(ack)) => {
                if let Err(err) = sink.close().await {
                    debug!(%err, "transport close failed");
                }
                let _ = ack.send(());
                return;
            }
            None => break,
        }
    }
    let _ = sink.close().await;
}
