//! The multiplexing engine shared by a session's tasks and handles.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use graft_frame::{is_root, Frame, FrameError, FrameKind, ROOT};
use graft_transport::TransportError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::channel::{Channel, ChannelKey, Chunk, Direction, Side};
use crate::config::SessionConfig;
use crate::control::ControlOp;
use crate::embed::Embed;
use crate::error::{ChannelError, Result, SessionError};
use crate::message::{Message, Provenance, SessionId};
use crate::registry::Registry;
use crate::value::Value;
use crate::wire::{self, ChannelRef, Envelope, WireValue};

const UNDELIVERED: &str = "session closed before the channel was drained";

/// Work for the transport writer.
pub(crate) enum Outgoing {
    Frame(Frame),
    /// Flush and close the transport, then acknowledge.
    Shutdown(oneshot::Sender<()>),
}

/// Senders into the transport writer.
///
/// `outbound` is the ordered lane for messages, data and end/error signals.
/// `signals` carries open/credit grants and is always written first.
pub(crate) struct Wire {
    pub(crate) outbound: mpsc::Sender<Outgoing>,
    pub(crate) signals: mpsc::UnboundedSender<Frame>,
}

/// Side effects of an encode that only take hold once its frame is queued.
#[derive(Default)]
struct Staged {
    attached: Vec<Channel>,
    drivers: Vec<(Box<dyn Embed>, Channel)>,
    allocated: Vec<ChannelKey>,
}

pub(crate) struct Mux {
    pub(crate) id: SessionId,
    pub(crate) config: SessionConfig,
    registry: Mutex<Registry>,
    wire: Option<Wire>,
    output: Mutex<Option<mpsc::UnboundedSender<Result<Message>>>>,
    closed: AtomicBool,
    finished: AtomicBool,
    pub(crate) shutdown: CancellationToken,
    pumps: Mutex<Vec<(Channel, JoinHandle<()>)>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Mux {
    pub(crate) fn new(
        id: SessionId,
        config: SessionConfig,
        wire: Option<Wire>,
        output: mpsc::UnboundedSender<Result<Message>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            config,
            registry: Mutex::new(Registry::default()),
            wire,
            output: Mutex::new(Some(output)),
            closed: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            pumps: Mutex::new(Vec::new()),
        })
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        lock(&self.registry)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Push an item to the session's consumer.
    fn emit(&self, item: Result<Message>) -> bool {
        match lock(&self.output).as_ref() {
            Some(tx) => tx.send(item).is_ok(),
            None => false,
        }
    }

    /// Stop emitting. Messages already queued stay readable.
    pub(crate) fn close_output(&self) {
        lock(&self.output).take();
    }

    fn new_channel(&self, key: ChannelKey, direction: Direction, credit: u32) -> Channel {
        let window = self.config.window();
        match &self.wire {
            Some(wire) => Channel::wired(
                key,
                direction,
                window,
                credit,
                self.id.clone(),
                wire.signals.clone(),
            ),
            None => Channel::loopback(key.id, direction, window),
        }
    }

    /// Allocate a fresh local channel.
    pub(crate) fn create_channel(&self, direction: Direction) -> Result<Channel> {
        if self.is_closed() {
            return Err(SessionError::SessionClosed);
        }
        let mut registry = self.registry();
        let key = ChannelKey::local(registry.allocate()?);
        let channel = self.new_channel(key, direction, 0);
        if self.wire.is_some() {
            registry.insert(channel.clone());
        }
        debug!(session = %self.id, channel_id = key.id, ?direction, "channel allocated");
        Ok(channel)
    }

    /// Start the pump for a channel's write direction, once.
    fn activate(self: &Arc<Self>, channel: &Channel) {
        if self.wire.is_none() || self.shutdown.is_cancelled() {
            return;
        }
        let Some(queue) = channel.take_pending() else {
            return;
        };
        let handle = tokio::spawn(Arc::clone(self).pump(channel.clone(), queue));
        let mut pumps = lock(&self.pumps);
        pumps.retain(|(_, pump)| !pump.is_finished());
        pumps.push((channel.clone(), handle));
    }

    /// Drop the registry entry once both directions are done.
    fn settle(&self, channel: &Channel) {
        if !channel.is_settled() {
            return;
        }
        let key = channel.key();
        let mut registry = self.registry();
        if registry.get(key).is_some_and(|current| current.ptr_eq(channel)) {
            registry.remove(key);
            debug!(session = %self.id, channel_id = key.id, "channel closed");
        }
    }

    // ----- outbound -----

    pub(crate) async fn write(self: &Arc<Self>, mut message: Message) -> Result<()> {
        if self.is_closed() {
            return Err(SessionError::SessionClosed);
        }
        if self.wire.is_none() {
            message.stamp_if_missing(|| Provenance {
                session: self.id.clone(),
                channel: ROOT,
            });
            return if self.emit(Ok(message)) {
                Ok(())
            } else {
                Err(SessionError::SessionClosed)
            };
        }

        let (frame, staged) = self.stage(|mux, staged| mux.message_frame(message, staged))?;
        if !self.enqueue(frame).await {
            self.rollback(staged);
            return Err(SessionError::SessionClosed);
        }
        self.commit(staged);
        Ok(())
    }

    fn stage<T>(&self, build: impl FnOnce(&Self, &mut Staged) -> Result<T>) -> Result<(T, Staged)> {
        let mut staged = Staged::default();
        match build(self, &mut staged) {
            Ok(built) => Ok((built, staged)),
            Err(err) => {
                self.rollback(staged);
                Err(err)
            }
        }
    }

    fn message_frame(&self, message: Message, staged: &mut Staged) -> Result<Frame> {
        let provenance = message.provenance().cloned().unwrap_or_else(|| Provenance {
            session: self.id.clone(),
            channel: ROOT,
        });
        let body = self.encode_map(message.into_fields(), staged)?;
        let payload = wire::to_payload(&Envelope {
            session: provenance.session,
            channel: provenance.channel,
            body,
        })?;
        self.check_size(payload.len())?;
        Ok(Frame::message(payload))
    }

    /// Build a data frame, plus the owner's copy of the value when the
    /// channel is watched.
    fn data_frame(
        &self,
        channel: &Channel,
        value: Value,
        staged: &mut Staged,
    ) -> Result<(Frame, Option<Value>)> {
        let key = channel.key();
        let encoded = self.encode_value(value, staged)?;
        let payload = wire::to_payload(&encoded)?;
        self.check_size(payload.len())?;
        let copy = channel.is_watched().then(|| self.local_view(encoded));
        Ok((Frame::data(key.outgoing_origin(), key.id, payload), copy))
    }

    /// An encoded value as its sender sees it: placeholders resolve to the
    /// sender's own handles.
    fn local_view(&self, value: WireValue) -> Value {
        match value {
            WireValue::Null => Value::Null,
            WireValue::Bool(b) => Value::Bool(b),
            WireValue::Number(n) => Value::Number(n),
            WireValue::String(s) => Value::String(s),
            WireValue::Bytes(b) => Value::Bytes(b.into()),
            WireValue::Array(items) => {
                Value::Array(items.into_iter().map(|v| self.local_view(v)).collect())
            }
            WireValue::Map(map) => Value::Map(
                map.into_iter()
                    .map(|(key, value)| (key, self.local_view(value)))
                    .collect(),
            ),
            WireValue::Channel(reference) => {
                let key = if reference.remote {
                    ChannelKey::remote(reference.id)
                } else {
                    ChannelKey::local(reference.id)
                };
                let channel = self.registry().get(key);
                Value::Channel(channel.unwrap_or_else(|| {
                    Channel::detached(key, reference.direction, self.id.clone())
                }))
            }
        }
    }

    fn check_size(&self, size: usize) -> Result<()> {
        let max = self.config.frame.max_payload_size;
        if size > max {
            return Err(FrameError::PayloadTooLarge { size, max }.into());
        }
        Ok(())
    }

    fn encode_map(
        &self,
        map: BTreeMap<String, Value>,
        staged: &mut Staged,
    ) -> Result<BTreeMap<String, WireValue>> {
        map.into_iter()
            .map(|(key, value)| Ok((key, self.encode_value(value, staged)?)))
            .collect()
    }

    fn encode_value(&self, value: Value, staged: &mut Staged) -> Result<WireValue> {
        Ok(match value {
            Value::Null => WireValue::Null,
            Value::Bool(b) => WireValue::Bool(b),
            Value::Number(n) => WireValue::Number(n),
            Value::String(s) => WireValue::String(s),
            Value::Bytes(b) => WireValue::Bytes(b.to_vec()),
            Value::Array(items) => WireValue::Array(
                items
                    .into_iter()
                    .map(|item| self.encode_value(item, staged))
                    .collect::<Result<_>>()?,
            ),
            Value::Map(map) => WireValue::Map(self.encode_map(map, staged)?),
            Value::Channel(channel) => {
                let reference = self.placeholder(&channel)?;
                staged.attached.push(channel);
                WireValue::Channel(reference)
            }
            Value::Stream(embed) => {
                let channel = self.create_channel(embed.direction())?;
                staged.allocated.push(channel.key());
                let reference = self.placeholder(&channel)?;
                staged.drivers.push((embed, channel));
                WireValue::Channel(reference)
            }
        })
    }

    fn placeholder(&self, channel: &Channel) -> Result<ChannelRef> {
        if channel.session() != Some(&self.id) {
            return Err(SessionError::ForeignChannel(channel.id()));
        }
        if channel.is_retired() {
            return Err(SessionError::ChannelClosed(channel.id()));
        }
        let key = channel.key();
        Ok(ChannelRef {
            id: key.id,
            remote: key.side == Side::Remote,
            direction: channel.direction(),
            // Only the allocator grants its window inline; the other side
            // granted it with an open signal when it materialized the channel.
            window: match key.side {
                Side::Local => channel.read_window(),
                Side::Remote => None,
            },
        })
    }

    fn rollback(&self, staged: Staged) {
        if staged.allocated.is_empty() {
            return;
        }
        let mut registry = self.registry();
        for key in staged.allocated {
            registry.remove(key);
        }
    }

    fn commit(self: &Arc<Self>, staged: Staged) {
        for channel in &staged.attached {
            self.activate(channel);
        }
        for (embed, channel) in staged.drivers {
            self.activate(&channel);
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    _ = embed.drive(channel) => {}
                }
            });
        }
    }

    async fn enqueue(&self, frame: Frame) -> bool {
        match &self.wire {
            Some(wire) => wire.outbound.send(Outgoing::Frame(frame)).await.is_ok(),
            None => false,
        }
    }

    /// Queue a control frame behind any data already queued.
    async fn send_control(&self, key: ChannelKey, op: ControlOp) -> bool {
        match op.encode() {
            Ok(payload) => {
                self.enqueue(Frame::control(key.outgoing_origin(), key.id, payload))
                    .await
            }
            Err(err) => {
                warn!(session = %self.id, channel_id = key.id, %err, "failed to encode control");
                false
            }
        }
    }

    /// Queue the final frame of a channel's write direction.
    async fn seal(&self, channel: &Channel, error: Option<ChannelError>) {
        if !channel.seal(error.clone()) {
            return;
        }
        let op = match error {
            Some(err) => error_op(err),
            None => ControlOp::End,
        };
        self.send_control(channel.key(), op).await;
    }

    /// Send a grant ahead of queued data.
    fn signal(&self, key: ChannelKey, op: ControlOp) {
        let Some(wire) = &self.wire else {
            return;
        };
        match op.encode() {
            Ok(payload) => {
                let _ = wire
                    .signals
                    .send(Frame::control(key.outgoing_origin(), key.id, payload));
            }
            Err(err) => warn!(session = %self.id, channel_id = key.id, %err, "failed to encode signal"),
        }
    }

    /// Encode and queue one value on a channel. Returns false when the channel
    /// cannot continue.
    async fn send_value(self: &Arc<Self>, channel: &Channel, value: Value) -> bool {
        match self.stage(|mux, staged| mux.data_frame(channel, value, staged)) {
            Ok(((frame, copy), staged)) => {
                if !self.enqueue(frame).await {
                    self.rollback(staged);
                    return false;
                }
                self.commit(staged);
                if let Some(copy) = copy {
                    channel.mirror(copy);
                }
                true
            }
            Err(err) => {
                warn!(session = %self.id, channel_id = channel.id(), %err, "failing channel after encode error");
                self.seal(channel, Some(ChannelError::Failed(err.to_string())))
                    .await;
                false
            }
        }
    }

    /// Forward one channel's queued chunks to the transport as credit allows.
    async fn pump(self: Arc<Self>, channel: Channel, mut queue: mpsc::Receiver<Chunk>) {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => None,
                chunk = queue.recv() => Some(chunk),
            };
            let Some(Some(chunk)) = next else {
                self.flush(&channel, &mut queue, None).await;
                break;
            };

            match chunk {
                Chunk::Data(value) => {
                    let permit = tokio::select! {
                        biased;
                        _ = self.shutdown.cancelled() => None,
                        permit = channel.credit().acquire() => Some(permit),
                    };
                    match permit {
                        Some(Ok(permit)) => permit.forget(),
                        // Credit closed: the channel was terminated.
                        Some(Err(_)) => break,
                        None => {
                            self.flush(&channel, &mut queue, Some(value)).await;
                            break;
                        }
                    }
                    if !self.send_value(&channel, value).await {
                        break;
                    }
                }
                Chunk::End => {
                    self.seal(&channel, None).await;
                    break;
                }
                Chunk::Error(err) => {
                    self.seal(&channel, Some(err)).await;
                    break;
                }
            }
        }
        // Only reached unsealed when the transport is gone.
        channel.seal(None);
        channel.mark_local_done();
        self.settle(&channel);
    }

    /// On shutdown, send what credit still allows, then end the channel.
    /// Values left without credit fail the channel for the reader.
    async fn flush(
        self: &Arc<Self>,
        channel: &Channel,
        queue: &mut mpsc::Receiver<Chunk>,
        mut held: Option<Value>,
    ) {
        if channel.credit().is_closed() {
            return;
        }
        loop {
            let chunk = match held.take() {
                Some(value) => Chunk::Data(value),
                None => match queue.try_recv() {
                    Ok(chunk) => chunk,
                    Err(_) => break,
                },
            };
            match chunk {
                Chunk::Data(value) => {
                    let Ok(permit) = channel.credit().try_acquire() else {
                        debug!(session = %self.id, channel_id = channel.id(), "closing with undelivered values");
                        let reason = ChannelError::Failed(UNDELIVERED.to_string());
                        self.seal(channel, Some(reason)).await;
                        return;
                    };
                    permit.forget();
                    if !self.send_value(channel, value).await {
                        return;
                    }
                }
                Chunk::End => break,
                Chunk::Error(err) => {
                    self.seal(channel, Some(err)).await;
                    return;
                }
            }
        }
        self.seal(channel, None).await;
    }

    /// Wait up to `limit` for the pumps of channels whose writer has already
    /// ended. They finish once the peer has granted credit for everything
    /// queued. Returns false if the wait timed out.
    pub(crate) async fn drain_ended(&self, limit: Duration) -> bool {
        let mut ended = {
            let mut pumps = lock(&self.pumps);
            let (ended, open): (Vec<_>, Vec<_>) = std::mem::take(&mut *pumps)
                .into_iter()
                .partition(|(channel, _)| channel.write_ended());
            *pumps = open;
            ended
        };
        let waited = tokio::time::timeout(limit, async {
            for (_, pump) in ended.iter_mut() {
                let _ = pump.await;
            }
        })
        .await;
        if waited.is_ok() {
            return true;
        }
        warn!(session = %self.id, ?limit, "peer stopped taking data; closing ended channels early");
        // Unfinished pumps go back so shutdown joins them after they flush.
        lock(&self.pumps).extend(ended.into_iter().filter(|(_, pump)| !pump.is_finished()));
        false
    }

    pub(crate) async fn join_pumps(&self) {
        let pumps = std::mem::take(&mut *lock(&self.pumps));
        for (_, pump) in pumps {
            let _ = pump.await;
        }
    }

    /// Ask the writer to flush and close the transport, and wait for it.
    pub(crate) async fn shutdown_writer(&self) {
        let Some(wire) = &self.wire else {
            return;
        };
        let (ack, done) = oneshot::channel();
        if wire.outbound.send(Outgoing::Shutdown(ack)).await.is_ok() {
            let _ = done.await;
        }
    }

    // ----- inbound -----

    /// Apply one inbound frame.
    pub(crate) fn dispatch(self: &Arc<Self>, frame: Frame) -> Result<()> {
        match frame.kind {
            FrameKind::Message => {
                if !is_root(frame.channel) {
                    return Err(SessionError::Protocol(format!(
                        "message frame on channel {}",
                        frame.channel
                    )));
                }
                let envelope: Envelope = wire::from_payload(&frame.payload, "message")?;
                let fields = envelope
                    .body
                    .into_iter()
                    .map(|(key, value)| (key, self.decode_value(value)))
                    .collect();
                let message = Message::from_parts(
                    fields,
                    Provenance {
                        session: envelope.session,
                        channel: envelope.channel,
                    },
                );
                if !self.emit(Ok(message)) {
                    debug!(session = %self.id, "message dropped after output closed");
                }
                Ok(())
            }
            FrameKind::Data => {
                let key = ChannelKey::from_incoming(frame.origin, frame.channel);
                let channel = self.registry().route(key)?;
                let value: WireValue = wire::from_payload(&frame.payload, "data")?;
                let value = self.decode_value(value);
                if !channel.deliver(Chunk::Data(value)) {
                    debug!(session = %self.id, channel_id = key.id, "data for finished channel dropped");
                }
                Ok(())
            }
            FrameKind::Control => {
                let key = ChannelKey::from_incoming(frame.origin, frame.channel);
                let op = ControlOp::decode(&frame.payload)?;
                let channel = self.registry().route(key)?;
                match op {
                    ControlOp::Open { window } => channel.grant(window),
                    ControlOp::Credit { amount } => channel.grant(amount),
                    ControlOp::End => {
                        channel.deliver(Chunk::End);
                        self.settle(&channel);
                    }
                    ControlOp::Error { message } => {
                        channel.deliver(Chunk::Error(ChannelError::Failed(message)));
                        self.settle(&channel);
                    }
                }
                Ok(())
            }
        }
    }

    fn decode_value(self: &Arc<Self>, value: WireValue) -> Value {
        match value {
            WireValue::Null => Value::Null,
            WireValue::Bool(b) => Value::Bool(b),
            WireValue::Number(n) => Value::Number(n),
            WireValue::String(s) => Value::String(s),
            WireValue::Bytes(b) => Value::Bytes(b.into()),
            WireValue::Array(items) => {
                Value::Array(items.into_iter().map(|v| self.decode_value(v)).collect())
            }
            WireValue::Map(map) => Value::Map(
                map.into_iter()
                    .map(|(key, value)| (key, self.decode_value(value)))
                    .collect(),
            ),
            WireValue::Channel(reference) => Value::Channel(self.materialize(reference)),
        }
    }

    /// Resolve a placeholder to a live channel, registering it on first sight.
    fn materialize(self: &Arc<Self>, reference: ChannelRef) -> Channel {
        let direction = reference.direction.flip();

        if reference.remote {
            let key = ChannelKey::local(reference.id);
            let Some(channel) = self.registry().get(key) else {
                debug!(session = %self.id, channel_id = key.id, "reference to closed channel");
                return Channel::detached(key, direction, self.id.clone());
            };
            // Our own channel came back: its writer may now read what it sends.
            channel.watch();
            return channel;
        }

        let key = ChannelKey::remote(reference.id);
        let credit = reference.window.unwrap_or(0);
        let (channel, created) = self
            .registry()
            .register_with(key, || self.new_channel(key, direction, credit));
        if created {
            debug!(session = %self.id, channel_id = key.id, ?direction, "channel materialized");
            if let Some(window) = channel.read_window() {
                self.signal(key, ControlOp::Open { window });
            }
            self.activate(&channel);
        }
        channel
    }

    // ----- teardown -----

    /// End every channel cleanly; used by a local close.
    pub(crate) fn drain(&self) {
        let channels = self.registry().drain();
        if !channels.is_empty() {
            debug!(session = %self.id, count = channels.len(), "ending open channels");
        }
        for channel in channels {
            channel.terminate(None);
        }
    }

    /// Tear the session down after the transport ended or failed.
    pub(crate) fn finish(&self, error: Option<SessionError>) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        self.mark_closed();
        self.shutdown.cancel();

        let reason = match &error {
            Some(err) => {
                warn!(session = %self.id, %err, "session failed");
                err.to_string()
            }
            None => {
                debug!(session = %self.id, "transport closed");
                "transport closed".to_string()
            }
        };
        let channels = self.registry().drain();
        if !channels.is_empty() {
            debug!(session = %self.id, count = channels.len(), "terminating open channels");
        }
        for channel in channels {
            channel.terminate(Some(ChannelError::Terminated(reason.clone())));
        }

        let tx = lock(&self.output).take();
        if let (Some(tx), Some(err)) = (tx, error) {
            let _ = tx.send(Err(err));
        }
    }
}

fn error_op(err: ChannelError) -> ControlOp {
    let message = match err {
        ChannelError::Failed(message) | ChannelError::Terminated(message) => message,
    };
    ControlOp::Error { message }
}

/// Map a codec failure to the session error it represents.
pub(crate) fn classify(err: FrameError) -> SessionError {
    match err {
        FrameError::Io(io) => SessionError::Transport(TransportError::Io(io)),
        err if err.is_malformed() => SessionError::Protocol(err.to_string()),
        err => SessionError::Frame(err),
    }
}
