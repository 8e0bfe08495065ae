use std::future::Future;
use std::time::Duration;

use graft_frame::ROOT;
use graft_session::{Message, Session, SessionError, Value};
use graft_transport::pipe;

async fn within<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(10), fut)
        .await
        .expect("test should finish in time")
}

fn linked() -> (Session, Session) {
    let (a, b) = pipe();
    (Session::new(a), Session::new(b))
}

async fn next(session: &Session) -> Message {
    session
        .recv()
        .await
        .expect("recv should succeed")
        .expect("a message should arrive")
}

#[tokio::test]
async fn local_relay_passes_channels_through() {
    within(async {
        let first = Session::local();
        let second = Session::local();
        let _relay = first.pipe_into(&second);

        let channel = first.create_write_channel().unwrap();
        first
            .write(Message::new().with("ch", channel.clone()))
            .await
            .unwrap();

        let message = next(&second).await;
        assert_eq!(message.session(), Some(first.id()));
        let relayed = message.get("ch").and_then(Value::as_channel).expect("channel");
        assert!(relayed.ptr_eq(&channel));

        for n in 0..10 {
            channel.send(n).await.unwrap();
        }
        channel.end().await.unwrap();
        for n in 0..10 {
            assert_eq!(relayed.recv().await, Some(Ok(Value::from(n))));
        }
        assert_eq!(relayed.recv().await, None);
    })
    .await;
}

#[tokio::test]
async fn remote_messages_keep_their_origin_through_a_local_stage() {
    within(async {
        let (client, server) = linked();
        let stage = Session::local();
        let _relay = server.pipe_into(&stage);

        client.write(Message::new().with("hello", "world")).await.unwrap();
        let message = next(&stage).await;
        assert_eq!(message.get("hello"), Some(&Value::from("world")));
        assert_eq!(message.session(), Some(client.id()));
        assert_eq!(message.channel(), Some(ROOT));
        assert_ne!(message.session(), Some(stage.id()));
    })
    .await;
}

#[tokio::test]
async fn relayed_reply_channel_still_reaches_the_sender() {
    within(async {
        let (client, server) = linked();
        let stage = Session::local();
        let _relay = server.pipe_into(&stage);

        let reply = client.create_read_channel().unwrap();
        client
            .write(Message::new().with("reply", reply.clone()))
            .await
            .unwrap();

        let message = next(&stage).await;
        let back = message
            .get("reply")
            .and_then(Value::as_channel)
            .expect("reply channel");
        back.end_with("answered").await.unwrap();

        assert_eq!(reply.recv().await, Some(Ok(Value::from("answered"))));
        assert_eq!(reply.recv().await, None);
    })
    .await;
}

#[tokio::test]
async fn identity_survives_two_transport_hops() {
    within(async {
        let (client, middle_in) = linked();
        let (middle_out, far) = linked();
        let _relay = middle_in.pipe_into(&middle_out);

        client.write(Message::new().with("hop", 2)).await.unwrap();
        let message = next(&far).await;
        assert_eq!(message.get("hop"), Some(&Value::from(2)));
        assert_eq!(message.session(), Some(client.id()));
        assert_ne!(message.session(), Some(middle_out.id()));
    })
    .await;
}

#[tokio::test]
async fn transport_relay_rejects_foreign_channels() {
    within(async {
        let (client, middle_in) = linked();
        let (middle_out, _far) = linked();
        let relay = middle_in.pipe_into(&middle_out);

        let reply = client.create_read_channel().unwrap();
        client
            .write(Message::new().with("reply", reply))
            .await
            .unwrap();

        assert!(matches!(
            relay.join().await,
            Err(SessionError::ForeignChannel(_))
        ));
    })
    .await;
}

#[tokio::test]
async fn relay_stops_when_source_closes() {
    within(async {
        let (client, server) = linked();
        let stage = Session::local();
        let relay = stage.pipe_from(&server);

        client.write(Message::new().with("n", 1)).await.unwrap();
        client.close().await.unwrap();

        assert_eq!(relay.join().await.unwrap(), 1);
        assert_eq!(next(&stage).await.get("n"), Some(&Value::from(1)));
    })
    .await;
}
