use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use graft_frame::{Frame, Origin};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex, Semaphore};
use tracing::warn;

use crate::control::ControlOp;
use crate::error::{ChannelError, Result, SessionError};
use crate::message::SessionId;
use crate::value::Value;

/// Which way data flows through a channel, from the holder's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// The holder reads; the other end writes.
    Read,
    /// The holder writes; the other end reads.
    Write,
    /// Both ends read and write.
    Duplex,
}

impl Direction {
    /// The same channel seen from the other end.
    pub fn flip(self) -> Self {
        match self {
            Direction::Read => Direction::Write,
            Direction::Write => Direction::Read,
            Direction::Duplex => Direction::Duplex,
        }
    }

    pub fn can_read(self) -> bool {
        matches!(self, Direction::Read | Direction::Duplex)
    }

    pub fn can_write(self) -> bool {
        matches!(self, Direction::Write | Direction::Duplex)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Read => "read",
            Direction::Write => "write",
            Direction::Duplex => "duplex",
        }
    }
}

/// Lifecycle of a channel.
///
/// Half-closed states only apply to duplex channels; a unidirectional
/// channel is `Open` until its single direction ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Open,
    /// This side ended its write direction.
    HalfClosedLocal,
    /// The other side ended its write direction.
    HalfClosedRemote,
    Closed,
}

/// Which side of the link allocated a channel ID, relative to this session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Side {
    Local,
    Remote,
}

/// Registry key: IDs are only unique per allocating side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ChannelKey {
    pub(crate) side: Side,
    pub(crate) id: u32,
}

impl ChannelKey {
    pub(crate) fn local(id: u32) -> Self {
        Self {
            side: Side::Local,
            id,
        }
    }

    pub(crate) fn remote(id: u32) -> Self {
        Self {
            side: Side::Remote,
            id,
        }
    }

    /// Key for a channel named by a frame received with `origin`.
    pub(crate) fn from_incoming(origin: Origin, id: u32) -> Self {
        match origin {
            Origin::Sender => Self::remote(id),
            Origin::Receiver => Self::local(id),
        }
    }

    /// Origin flag for frames this session sends about the channel.
    pub(crate) fn outgoing_origin(self) -> Origin {
        match self.side {
            Side::Local => Origin::Sender,
            Side::Remote => Origin::Receiver,
        }
    }
}

/// One unit moving through a channel queue.
pub(crate) enum Chunk {
    Data(Value),
    End,
    Error(ChannelError),
}

enum Source {
    Wire(mpsc::UnboundedReceiver<Chunk>),
    Loopback(mpsc::Receiver<Chunk>),
}

impl Source {
    async fn recv(&mut self) -> Option<Chunk> {
        match self {
            Source::Wire(rx) => rx.recv().await,
            Source::Loopback(rx) => rx.recv().await,
        }
    }
}

struct ReadHalf {
    // `None` once the read direction has finished or when there is none.
    source: Option<Source>,
    consumed: u32,
}

struct ChannelInner {
    key: ChannelKey,
    direction: Direction,
    owner: Option<SessionId>,
    window: u32,
    local_done: AtomicBool,
    remote_done: AtomicBool,
    // The write direction's final frame has been queued for the peer.
    sealed: AtomicBool,
    outbound: mpsc::Sender<Chunk>,
    pending: StdMutex<Option<mpsc::Receiver<Chunk>>>,
    inbound: Option<mpsc::UnboundedSender<Chunk>>,
    // Copies of sent values for the owner of a write-only channel.
    tap: Option<mpsc::UnboundedSender<Chunk>>,
    watched: AtomicBool,
    read: Mutex<ReadHalf>,
    credit: Semaphore,
    signals: Option<mpsc::UnboundedSender<Frame>>,
}

/// Handle to a live channel.
///
/// Cloning yields another handle to the same channel. A channel belongs to
/// the session that created or materialized it; handles can be sent inside
/// messages on that session and come back as the very same handle.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    /// A channel bound to a transport-backed session.
    pub(crate) fn wired(
        key: ChannelKey,
        direction: Direction,
        window: u32,
        credit: u32,
        owner: SessionId,
        signals: mpsc::UnboundedSender<Frame>,
    ) -> Self {
        let window = window.max(1);
        let (outbound, pending) = mpsc::channel(window as usize);
        let (tx, rx) = mpsc::unbounded_channel();
        let (inbound, tap) = if direction.can_read() {
            (Some(tx), None)
        } else {
            (None, Some(tx))
        };

        Self {
            inner: Arc::new(ChannelInner {
                key,
                direction,
                owner: Some(owner),
                window,
                local_done: AtomicBool::new(!direction.can_write()),
                remote_done: AtomicBool::new(!direction.can_read()),
                sealed: AtomicBool::new(!direction.can_write()),
                outbound,
                pending: StdMutex::new(direction.can_write().then_some(pending)),
                inbound,
                tap,
                watched: AtomicBool::new(false),
                read: Mutex::new(ReadHalf {
                    source: Some(Source::Wire(rx)),
                    consumed: 0,
                }),
                credit: Semaphore::new(credit as usize),
                signals: Some(signals),
            }),
        }
    }

    /// An in-process channel: whatever any handle sends, any handle receives.
    pub(crate) fn loopback(id: u32, direction: Direction, window: u32) -> Self {
        let (outbound, rx) = mpsc::channel(window.max(1) as usize);
        Self {
            inner: Arc::new(ChannelInner {
                key: ChannelKey::local(id),
                direction,
                owner: None,
                window,
                local_done: AtomicBool::new(false),
                remote_done: AtomicBool::new(true),
                sealed: AtomicBool::new(false),
                outbound,
                pending: StdMutex::new(None),
                inbound: None,
                tap: None,
                watched: AtomicBool::new(false),
                read: Mutex::new(ReadHalf {
                    source: Some(Source::Loopback(rx)),
                    consumed: 0,
                }),
                credit: Semaphore::new(0),
                signals: None,
            }),
        }
    }

    /// A handle for a reference to a channel that no longer exists.
    pub(crate) fn detached(key: ChannelKey, direction: Direction, owner: SessionId) -> Self {
        let (outbound, _) = mpsc::channel(1);
        Self {
            inner: Arc::new(ChannelInner {
                key,
                direction,
                owner: Some(owner),
                window: 1,
                local_done: AtomicBool::new(true),
                remote_done: AtomicBool::new(true),
                sealed: AtomicBool::new(true),
                outbound,
                pending: StdMutex::new(None),
                inbound: None,
                tap: None,
                watched: AtomicBool::new(false),
                read: Mutex::new(ReadHalf {
                    source: None,
                    consumed: 0,
                }),
                credit: Semaphore::new(0),
                signals: None,
            }),
        }
    }

    /// Channel ID, unique among channels allocated by the same side.
    pub fn id(&self) -> u32 {
        self.inner.key.id
    }

    /// Direction from this handle's point of view.
    pub fn direction(&self) -> Direction {
        self.inner.direction
    }

    /// The session this channel is bound to, or `None` for in-process channels.
    pub fn session(&self) -> Option<&SessionId> {
        self.inner.owner.as_ref()
    }

    pub fn state(&self) -> ChannelState {
        let local = self.inner.local_done.load(Ordering::Acquire);
        let remote = self.inner.remote_done.load(Ordering::Acquire);
        if self.is_loopback() {
            return if local {
                ChannelState::Closed
            } else {
                ChannelState::Open
            };
        }
        match (local, remote) {
            (true, true) => ChannelState::Closed,
            _ if self.inner.direction != Direction::Duplex => ChannelState::Open,
            (true, false) => ChannelState::HalfClosedLocal,
            (false, true) => ChannelState::HalfClosedRemote,
            (false, false) => ChannelState::Open,
        }
    }

    /// True when both handles refer to the same channel.
    pub fn ptr_eq(&self, other: &Channel) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Queue a value for the other end.
    ///
    /// Suspends while the reader has not granted enough credit.
    pub async fn send(&self, value: impl Into<Value>) -> Result<()> {
        if !self.writable() || self.inner.local_done.load(Ordering::Acquire) {
            return Err(SessionError::ChannelClosed(self.id()));
        }
        self.inner
            .outbound
            .send(Chunk::Data(value.into()))
            .await
            .map_err(|_| SessionError::ChannelClosed(self.id()))
    }

    /// Signal that no more data follows. Ending twice is a no-op.
    pub async fn end(&self) -> Result<()> {
        self.finish_write(Chunk::End).await
    }

    /// Send a final value, then end.
    pub async fn end_with(&self, value: impl Into<Value>) -> Result<()> {
        self.send(value).await?;
        self.end().await
    }

    /// End the write direction with an error for the reader.
    pub async fn fail(&self, reason: impl Into<String>) -> Result<()> {
        self.finish_write(Chunk::Error(ChannelError::Failed(reason.into())))
            .await
    }

    /// Next inbound value, `None` once the other end has ended.
    ///
    /// A failure is delivered once, after which the channel yields `None`.
    ///
    /// On a write-only channel the owner reads back what it sends, starting
    /// from the first `recv` or from the channel coming back inside a
    /// message, whichever is earlier. It ends when the write direction ends.
    pub async fn recv(&self) -> Option<std::result::Result<Value, ChannelError>> {
        self.watch();
        let mut read = self.inner.read.lock().await;
        let source = read.source.as_mut()?;
        match source.recv().await {
            Some(Chunk::Data(value)) => {
                self.replenish(&mut read);
                Some(Ok(value))
            }
            Some(Chunk::Error(err)) => {
                read.source = None;
                Some(Err(err))
            }
            Some(Chunk::End) | None => {
                read.source = None;
                None
            }
        }
    }

    /// Consume the handle as a stream of inbound values.
    pub fn into_stream(self) -> BoxStream<'static, std::result::Result<Value, ChannelError>> {
        stream::unfold(self, |channel| async move {
            let item = channel.recv().await?;
            Some((item, channel))
        })
        .boxed()
    }

    fn writable(&self) -> bool {
        self.is_loopback() || self.inner.direction.can_write()
    }

    async fn finish_write(&self, chunk: Chunk) -> Result<()> {
        if !self.writable() {
            return Err(SessionError::ChannelClosed(self.id()));
        }
        if self.inner.local_done.swap(true, Ordering::AcqRel) {
            return match chunk {
                Chunk::End => Ok(()),
                _ => Err(SessionError::ChannelClosed(self.id())),
            };
        }
        self.inner
            .outbound
            .send(chunk)
            .await
            .map_err(|_| SessionError::ChannelClosed(self.id()))
    }

    fn replenish(&self, read: &mut ReadHalf) {
        let Some(signals) = &self.inner.signals else {
            return;
        };
        // Read-backs of our own writes owe the peer nothing.
        if !self.inner.direction.can_read() {
            return;
        }
        read.consumed = read.consumed.saturating_add(1);
        let threshold = (self.inner.window / 2).max(1);
        if read.consumed < threshold || self.inner.remote_done.load(Ordering::Acquire) {
            return;
        }
        let amount = std::mem::take(&mut read.consumed);
        match (ControlOp::Credit { amount }).encode() {
            Ok(payload) => {
                let _ = signals.send(Frame::control(
                    self.inner.key.outgoing_origin(),
                    self.id(),
                    payload,
                ));
            }
            Err(err) => warn!(channel_id = self.id(), %err, "failed to encode credit"),
        }
    }

    pub(crate) fn key(&self) -> ChannelKey {
        self.inner.key
    }

    pub(crate) fn is_loopback(&self) -> bool {
        self.inner.owner.is_none()
    }

    /// Window to advertise to the writer, if this handle has a read direction.
    pub(crate) fn read_window(&self) -> Option<u32> {
        self.inner.direction.can_read().then_some(self.inner.window)
    }

    /// Take the outbound queue for the pump. Returns `None` after the first call.
    pub(crate) fn take_pending(&self) -> Option<mpsc::Receiver<Chunk>> {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub(crate) fn credit(&self) -> &Semaphore {
        &self.inner.credit
    }

    pub(crate) fn grant(&self, amount: u32) {
        let available = self.inner.credit.available_permits();
        if available.saturating_add(amount as usize) > Semaphore::MAX_PERMITS {
            warn!(channel_id = self.id(), amount, "credit overflow ignored");
            return;
        }
        self.inner.credit.add_permits(amount as usize);
    }

    /// Start copying sent values to the owner's read side.
    pub(crate) fn watch(&self) {
        if self.inner.tap.is_some() {
            self.inner.watched.store(true, Ordering::Release);
        }
    }

    pub(crate) fn is_watched(&self) -> bool {
        self.inner.watched.load(Ordering::Acquire)
    }

    /// Hand a copy of a sent value to the owner, if it is watching.
    pub(crate) fn mirror(&self, value: Value) {
        if let (Some(tap), true) = (&self.inner.tap, self.is_watched()) {
            let _ = tap.send(Chunk::Data(value));
        }
    }

    /// Close the owner's copy of the write direction.
    fn close_tap(&self, error: Option<ChannelError>) {
        if let Some(tap) = &self.inner.tap {
            let _ = tap.send(error.map_or(Chunk::End, Chunk::Error));
        }
    }

    /// Record that the write direction's final frame is queued, and pass the
    /// outcome to the owner's copy. Returns false if it was already sealed.
    pub(crate) fn seal(&self, error: Option<ChannelError>) -> bool {
        if self.inner.sealed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.close_tap(error);
        true
    }

    /// True once neither direction can carry anything more over the wire.
    /// The peer has forgotten such a channel.
    pub(crate) fn is_retired(&self) -> bool {
        self.inner.sealed.load(Ordering::Acquire)
            && self.inner.remote_done.load(Ordering::Acquire)
    }

    /// True once this side has ended or failed its write direction.
    pub(crate) fn write_ended(&self) -> bool {
        self.inner.local_done.load(Ordering::Acquire)
    }

    /// Mark the write direction finished. Returns the previous value.
    pub(crate) fn mark_local_done(&self) -> bool {
        self.inner.local_done.swap(true, Ordering::AcqRel)
    }

    /// Hand an inbound chunk to the consumer. Returns false if the read
    /// direction is absent or already finished.
    pub(crate) fn deliver(&self, chunk: Chunk) -> bool {
        let Some(inbound) = &self.inner.inbound else {
            return false;
        };
        let finished = match chunk {
            Chunk::Data(_) => self.inner.remote_done.load(Ordering::Acquire),
            Chunk::End | Chunk::Error(_) => self.inner.remote_done.swap(true, Ordering::AcqRel),
        };
        !finished && inbound.send(chunk).is_ok()
    }

    pub(crate) fn is_settled(&self) -> bool {
        self.inner.local_done.load(Ordering::Acquire)
            && self.inner.remote_done.load(Ordering::Acquire)
    }

    /// Force both directions closed. The consumer sees `error`, or a clean
    /// end when there is none.
    pub(crate) fn terminate(&self, error: Option<ChannelError>) {
        self.mark_local_done();
        self.seal(error.clone());
        self.inner.credit.close();
        self.deliver(error.map_or(Chunk::End, Chunk::Error));
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id())
            .field("direction", &self.direction())
            .field("state", &self.state())
            .finish()
    }
}
