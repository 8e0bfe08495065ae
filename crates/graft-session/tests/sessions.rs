use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{sink, stream};
use graft_frame::ROOT;
use graft_session::{
    ChannelError, ChannelState, Direction, Message, Session, SessionConfig, SessionError, Value,
};
use graft_transport::pipe;
use tokio::sync::mpsc;

async fn within<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(10), fut)
        .await
        .expect("test should finish in time")
}

fn linked() -> (Session, Session) {
    let (a, b) = pipe();
    (Session::new(a), Session::new(b))
}

fn linked_with(config: SessionConfig) -> (Session, Session) {
    let (a, b) = pipe();
    (
        Session::with_config(a, config.clone()),
        Session::with_config(b, config),
    )
}

async fn next(session: &Session) -> Message {
    session
        .recv()
        .await
        .expect("recv should succeed")
        .expect("a message should arrive")
}

#[tokio::test]
async fn messages_arrive_in_order_with_sender_identity() {
    within(async {
        let (client, server) = linked();
        for n in 0..50 {
            client
                .write(Message::new().with("n", n))
                .await
                .expect("write should succeed");
        }

        for n in 0..50 {
            let message = next(&server).await;
            assert_eq!(message.get("n").and_then(Value::as_i64), Some(n));
            assert_eq!(message.session(), Some(client.id()));
            assert_eq!(message.channel(), Some(ROOT));
        }
    })
    .await;
}

#[tokio::test]
async fn plain_fields_survive_the_trip() {
    within(async {
        let (client, server) = linked();
        client
            .write(
                Message::new()
                    .with("hello", "world")
                    .with("flag", true)
                    .with("ratio", 0.5)
                    .with("raw", Bytes::from_static(b"\x00\x01"))
                    .with("list", vec![Value::from(1), Value::Null]),
            )
            .await
            .unwrap();

        let message = next(&server).await;
        assert_eq!(message.get("hello"), Some(&Value::from("world")));
        assert_eq!(message.get("flag"), Some(&Value::Bool(true)));
        assert_eq!(message.get("ratio").and_then(Value::as_f64), Some(0.5));
        assert_eq!(
            message.get("raw").and_then(Value::as_bytes).map(|b| &b[..]),
            Some(&b"\x00\x01"[..])
        );
        assert_eq!(
            message.get("list").and_then(Value::as_array).map(<[Value]>::len),
            Some(2)
        );

        let json = message.to_json();
        assert_eq!(json["_session"], client.id().as_str());
        assert_eq!(json["_channel"], 0);
    })
    .await;
}

#[tokio::test]
async fn peer_answers_on_return_channel() {
    within(async {
        let (client, server) = linked();
        let reply = client.create_read_channel().unwrap();
        client
            .write(Message::new().with("cmd", "ping").with("reply", reply.clone()))
            .await
            .unwrap();

        let request = next(&server).await;
        let back = request
            .get("reply")
            .and_then(Value::as_channel)
            .cloned()
            .expect("reply channel");
        assert_eq!(back.direction(), Direction::Write);
        back.end_with("pong").await.unwrap();

        assert_eq!(reply.recv().await, Some(Ok(Value::from("pong"))));
        assert_eq!(reply.recv().await, None);
    })
    .await;
}

#[tokio::test]
async fn sender_streams_into_write_channel() {
    within(async {
        let (client, server) = linked();
        let more = client.create_write_channel().unwrap();
        client
            .write(Message::new().with("more", more.clone()))
            .await
            .unwrap();

        let message = next(&server).await;
        let incoming = message
            .get("more")
            .and_then(Value::as_channel)
            .cloned()
            .expect("channel");
        assert_eq!(incoming.direction(), Direction::Read);

        more.send("a").await.unwrap();
        more.end_with("b").await.unwrap();

        assert_eq!(incoming.recv().await, Some(Ok(Value::from("a"))));
        assert_eq!(incoming.recv().await, Some(Ok(Value::from("b"))));
        assert_eq!(incoming.recv().await, None);
        assert_eq!(incoming.state(), ChannelState::Closed);
    })
    .await;
}

#[tokio::test]
async fn embedded_producer_is_read_remotely() {
    within(async {
        let (client, server) = linked();
        let source = stream::iter(vec![Bytes::from_static(b"hello world")]);
        client
            .write(Message::new().with("body", Value::producer(source)))
            .await
            .unwrap();

        let message = next(&server).await;
        let body = message
            .get("body")
            .and_then(Value::as_channel)
            .cloned()
            .expect("producer channel");
        let first = body.recv().await.unwrap().unwrap();
        assert_eq!(first.as_bytes().map(|b| &b[..]), Some(&b"hello world"[..]));
        assert_eq!(body.recv().await, None);
    })
    .await;
}

#[tokio::test]
async fn producer_failure_reaches_reader() {
    within(async {
        let (client, server) = linked();
        let source = stream::iter(vec![Ok(1), Err("disk gone")]);
        client
            .write(Message::new().with("body", Value::try_producer(source)))
            .await
            .unwrap();

        let body = next(&server)
            .await
            .remove("body")
            .and_then(Value::into_channel)
            .expect("producer channel");
        assert_eq!(body.recv().await, Some(Ok(Value::from(1))));
        assert_eq!(
            body.recv().await,
            Some(Err(ChannelError::Failed("disk gone".into())))
        );
        assert_eq!(body.recv().await, None);
    })
    .await;
}

#[tokio::test]
async fn embedded_consumer_receives_remote_writes() {
    within(async {
        let (client, server) = linked();
        let (tx, mut rx) = mpsc::unbounded_channel::<Value>();
        let collector = sink::unfold(tx, |tx, value: Value| async move {
            tx.send(value).map_err(|_| "collector gone")?;
            Ok::<_, &str>(tx)
        });
        client
            .write(Message::new().with("sink", Value::consumer(collector)))
            .await
            .unwrap();

        let target = next(&server)
            .await
            .remove("sink")
            .and_then(Value::into_channel)
            .expect("consumer channel");
        assert_eq!(target.direction(), Direction::Write);
        for n in 0..3 {
            target.send(n).await.unwrap();
        }
        target.end().await.unwrap();

        for n in 0..3 {
            assert_eq!(rx.recv().await, Some(Value::from(n)));
        }
        assert_eq!(rx.recv().await, None);
    })
    .await;
}

#[tokio::test]
async fn values_flow_past_the_credit_window() {
    within(async {
        let config = SessionConfig {
            channel_window: 4,
            ..SessionConfig::default()
        };
        let (client, server) = linked_with(config);
        client
            .write(Message::new().with("count", Value::producer(stream::iter(0..50))))
            .await
            .unwrap();

        let count = next(&server)
            .await
            .remove("count")
            .and_then(Value::into_channel)
            .expect("producer channel");
        let mut seen = Vec::new();
        while let Some(item) = count.recv().await {
            seen.push(item.unwrap().as_i64().unwrap());
        }
        assert_eq!(seen, (0..50).collect::<Vec<_>>());
    })
    .await;
}

#[tokio::test]
async fn channels_travel_inside_channels() {
    within(async {
        let (client, server) = linked();
        let outer = client.create_write_channel().unwrap();
        client
            .write(Message::new().with("outer", outer.clone()))
            .await
            .unwrap();
        let outer_in = next(&server)
            .await
            .remove("outer")
            .and_then(Value::into_channel)
            .expect("outer channel");

        let inner = client.create_write_channel().unwrap();
        outer.send(inner.clone()).await.unwrap();
        inner.end_with("deep").await.unwrap();

        let inner_in = outer_in
            .recv()
            .await
            .unwrap()
            .unwrap()
            .into_channel()
            .expect("inner channel");
        assert_eq!(inner_in.direction(), Direction::Read);
        assert_eq!(inner_in.recv().await, Some(Ok(Value::from("deep"))));
        assert_eq!(inner_in.recv().await, None);
    })
    .await;
}

#[tokio::test]
async fn echoed_channel_resolves_to_original_handle() {
    within(async {
        let (client, server) = linked();
        let mine = client.create_read_channel().unwrap();
        client
            .write(Message::new().with("ch", mine.clone()).with("n", 7))
            .await
            .unwrap();

        let request = next(&server).await;
        server.write(request).await.unwrap();

        let echoed = next(&client).await;
        let back = echoed.get("ch").and_then(Value::as_channel).expect("channel");
        assert!(back.ptr_eq(&mine));
        assert_eq!(echoed.get("n"), Some(&Value::from(7)));
        // The echo keeps the identity of the session that first wrote it.
        assert_eq!(echoed.session(), Some(client.id()));
    })
    .await;
}

#[tokio::test]
async fn duplex_channel_half_closes_each_way() {
    within(async {
        let (client, server) = linked();
        let mine = client.create_duplex_channel().unwrap();
        client
            .write(Message::new().with("d", mine.clone()))
            .await
            .unwrap();
        let theirs = next(&server)
            .await
            .remove("d")
            .and_then(Value::into_channel)
            .expect("duplex channel");
        assert_eq!(theirs.direction(), Direction::Duplex);

        theirs.send("from server").await.unwrap();
        mine.send("from client").await.unwrap();
        assert_eq!(mine.recv().await, Some(Ok(Value::from("from server"))));
        assert_eq!(theirs.recv().await, Some(Ok(Value::from("from client"))));

        mine.end().await.unwrap();
        assert_eq!(theirs.recv().await, None);
        assert_eq!(theirs.state(), ChannelState::HalfClosedRemote);

        theirs.end_with("last").await.unwrap();
        assert_eq!(mine.recv().await, Some(Ok(Value::from("last"))));
        assert_eq!(mine.recv().await, None);
        assert_eq!(mine.state(), ChannelState::Closed);
    })
    .await;
}

#[tokio::test]
async fn stalled_channel_does_not_block_others() {
    within(async {
        let (client, server) = linked();
        client
            .write(Message::new().with("flood", Value::producer(stream::iter(0..1000))))
            .await
            .unwrap();
        let _flood = next(&server).await;

        client
            .write(Message::new().with("side", Value::producer(stream::iter(0..5))))
            .await
            .unwrap();
        let side = next(&server)
            .await
            .remove("side")
            .and_then(Value::into_channel)
            .expect("side channel");

        for n in 0..5 {
            client.write(Message::new().with("n", n)).await.unwrap();
        }
        for n in 0..5 {
            assert_eq!(next(&server).await.get("n"), Some(&Value::from(n)));
        }

        let mut count = 0;
        while let Some(item) = side.recv().await {
            item.unwrap();
            count += 1;
        }
        assert_eq!(count, 5);
    })
    .await;
}

#[tokio::test]
async fn close_is_idempotent_and_ends_peer() {
    within(async {
        let (client, server) = linked();
        client.write(Message::new().with("bye", true)).await.unwrap();
        client.close().await.unwrap();
        client.close().await.unwrap();

        assert!(client.is_closed());
        assert!(matches!(
            client.write(Message::new()).await,
            Err(SessionError::SessionClosed)
        ));

        assert_eq!(next(&server).await.get("bye"), Some(&Value::Bool(true)));
        assert!(server.recv().await.unwrap().is_none());
        assert!(server.is_closed());
    })
    .await;
}

#[tokio::test]
async fn close_ends_open_write_channels() {
    within(async {
        let (client, server) = linked();
        let out = client.create_write_channel().unwrap();
        client.write(Message::new().with("out", out.clone())).await.unwrap();
        let incoming = next(&server)
            .await
            .remove("out")
            .and_then(Value::into_channel)
            .expect("channel");

        out.send(1).await.unwrap();
        assert_eq!(incoming.recv().await, Some(Ok(Value::from(1))));
        client.close().await.unwrap();

        assert_eq!(incoming.recv().await, None);
        assert!(out.send(2).await.is_err());
    })
    .await;
}

#[tokio::test]
async fn close_delivers_ended_channels_in_full() {
    within(async {
        let (client, server) = linked();
        let out = client.create_write_channel().unwrap();
        client.write(Message::new().with("out", out.clone())).await.unwrap();

        let reader = tokio::spawn(async move {
            let incoming = next(&server)
                .await
                .remove("out")
                .and_then(Value::into_channel)
                .expect("channel");
            let mut total = 0;
            while let Some(item) = incoming.recv().await {
                total += item.unwrap().as_i64().unwrap();
            }
            total
        });

        for n in 0..40 {
            out.send(n).await.unwrap();
        }
        out.end().await.unwrap();
        client.close().await.unwrap();

        assert_eq!(reader.await.unwrap(), (0..40).sum::<i64>());
    })
    .await;
}

#[tokio::test]
async fn dropped_transport_terminates_channels() {
    within(async {
        let (a, b) = pipe();
        let session = Session::new(a);
        let reader = session.create_read_channel().unwrap();
        drop(b);

        assert!(matches!(
            reader.recv().await,
            Some(Err(ChannelError::Terminated(_)))
        ));
        assert_eq!(reader.recv().await, None);
        assert!(session.recv().await.unwrap().is_none());
        assert!(matches!(
            session.write(Message::new()).await,
            Err(SessionError::SessionClosed)
        ));
    })
    .await;
}

#[tokio::test]
async fn write_channel_failure_reaches_reader() {
    within(async {
        let (client, server) = linked();
        let out = client.create_write_channel().unwrap();
        client.write(Message::new().with("out", out.clone())).await.unwrap();
        let incoming = next(&server)
            .await
            .remove("out")
            .and_then(Value::into_channel)
            .expect("channel");

        out.send("partial").await.unwrap();
        out.fail("upstream went away").await.unwrap();

        assert_eq!(incoming.recv().await, Some(Ok(Value::from("partial"))));
        assert_eq!(
            incoming.recv().await,
            Some(Err(ChannelError::Failed("upstream went away".into())))
        );
        assert_eq!(incoming.recv().await, None);
        assert!(matches!(
            out.send("late").await,
            Err(SessionError::ChannelClosed(_))
        ));
    })
    .await;
}

#[tokio::test]
async fn finished_channel_cannot_be_embedded_again() {
    within(async {
        let (client, server) = linked();
        let out = client.create_write_channel().unwrap();
        client.write(Message::new().with("out", out.clone())).await.unwrap();
        let incoming = next(&server)
            .await
            .remove("out")
            .and_then(Value::into_channel)
            .expect("channel");

        out.end_with("only").await.unwrap();
        assert_eq!(incoming.recv().await, Some(Ok(Value::from("only"))));
        assert_eq!(incoming.recv().await, None);

        let id = out.id();
        assert!(matches!(
            client.write(Message::new().with("again", out)).await,
            Err(SessionError::ChannelClosed(closed)) if closed == id
        ));

        // The session itself is unaffected.
        client.write(Message::new().with("n", 1)).await.unwrap();
        assert_eq!(next(&server).await.get("n"), Some(&Value::from(1)));
    })
    .await;
}

#[tokio::test]
async fn close_gives_up_on_a_peer_that_stops_reading() {
    within(async {
        let (a, b) = pipe();
        let client = Session::with_config(
            a,
            SessionConfig {
                close_timeout: Duration::from_millis(200),
                ..SessionConfig::default()
            },
        );
        let server = Session::new(b);

        let out = client.create_write_channel().unwrap();
        client.write(Message::new().with("out", out.clone())).await.unwrap();
        for n in 0..20 {
            out.send(n).await.unwrap();
        }
        out.end().await.unwrap();

        tokio::time::timeout(Duration::from_secs(3), client.close())
            .await
            .expect("close should not wait for the stalled reader")
            .unwrap();

        // The reader gets what its window allowed, then learns the rest was lost.
        let incoming = next(&server)
            .await
            .remove("out")
            .and_then(Value::into_channel)
            .expect("channel");
        for n in 0..16 {
            assert_eq!(incoming.recv().await, Some(Ok(Value::from(n))));
        }
        assert!(matches!(
            incoming.recv().await,
            Some(Err(ChannelError::Failed(_)))
        ));
        assert_eq!(incoming.recv().await, None);
    })
    .await;
}

#[tokio::test]
async fn echoed_write_channel_reads_back_on_both_sides() {
    within(async {
        let (client, server) = linked();
        let writes = client.create_write_channel().unwrap();
        let returned = client.create_read_channel().unwrap();
        client
            .write(
                Message::new()
                    .with("writes", writes.clone())
                    .with("return", returned.clone()),
            )
            .await
            .unwrap();

        let mut request = next(&server).await;
        let theirs = request
            .remove("writes")
            .and_then(Value::into_channel)
            .expect("writes channel");
        let back = request
            .remove("return")
            .and_then(Value::into_channel)
            .expect("return channel");
        back.end_with(theirs.clone()).await.unwrap();

        let echoed = returned
            .recv()
            .await
            .expect("echo")
            .unwrap()
            .into_channel()
            .expect("channel");
        assert!(echoed.ptr_eq(&writes));

        for n in 0..3 {
            writes.send(n).await.unwrap();
        }
        writes.end().await.unwrap();

        for n in 0..3 {
            assert_eq!(echoed.recv().await, Some(Ok(Value::from(n))));
            assert_eq!(theirs.recv().await, Some(Ok(Value::from(n))));
        }
        assert_eq!(echoed.recv().await, None);
        assert_eq!(theirs.recv().await, None);
    })
    .await;
}

#[cfg(unix)]
#[tokio::test]
async fn unix_socket_pair_carries_channels() {
    within(async {
        let (a, b) = tokio::net::UnixStream::pair().expect("socket pair");
        let client = Session::new(a);
        let server = Session::new(b);

        let reply = client.create_read_channel().unwrap();
        client
            .write(Message::new().with("reply", reply.clone()))
            .await
            .unwrap();
        let back = next(&server)
            .await
            .remove("reply")
            .and_then(Value::into_channel)
            .expect("channel");
        back.end_with("over uds").await.unwrap();

        assert_eq!(reply.recv().await, Some(Ok(Value::from("over uds"))));
        client.close().await.unwrap();
        server.close().await.unwrap();
    })
    .await;
}
