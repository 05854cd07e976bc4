use std::{cell::RefCell, rc::Rc};

use bytes::Bytes;
use monoio_http2::{
    ConnectOptions, Error, Headers, ListenOptions, RequestOptions, RespondOptions, Server,
    Session, SessionEventKind, Stream, StreamRole,
};

/// Answers every request with a page and pushes `/style.css` alongside.
async fn push_server() -> (Server, String) {
    let server = Server::new(ListenOptions::default());
    let _token = server.on_stream(|stream, _| {
        let stream = stream.clone();
        monoio::spawn(async move {
            stream
                .respond(Headers::from_record([(":status", "200")]), RespondOptions::default())
                .unwrap();
            let pushed = stream
                .push_stream(Headers::from_record([(":path", "/style.css")]))
                .unwrap();
            assert_eq!(pushed.role(), StreamRole::Pushed);
            assert!(matches!(
                pushed.push_stream(Headers::from_record([(":path", "/nested")])),
                Err(Error::NestedPush)
            ));
            pushed
                .respond(
                    Headers::from_record([(":status", "200"), ("content-type", "text/css")]),
                    RespondOptions::default(),
                )
                .unwrap();
            pushed
                .send_data(Bytes::from_static(b"body{}"), true)
                .await
                .unwrap();
            stream
                .send_data(Bytes::from_static(b"<html></html>"), true)
                .await
                .unwrap();
        });
    });
    let addr = server.listen().await.unwrap();
    (server, format!("http://{addr}"))
}

#[monoio::test(enable_timer = true)]
async fn wait_push_yields_pushed_response() {
    let (server, url) = push_server().await;
    let session = Session::connect(&url, ConnectOptions::default()).await.unwrap();

    let push = session.wait_push();
    let stream = session
        .request(Headers::from_record([(":path", "/")]), RequestOptions::default())
        .await
        .unwrap();
    let push = push.await.unwrap();
    assert_eq!(push.request.value_string(":path"), Some("/style.css"));
    assert_eq!(push.request.value_string(":authority"), Some(session.authority()));
    assert_eq!(push.response.status(), Some(200));
    assert_eq!(push.response.value_string("content-type"), Some("text/css"));
    assert_eq!(push.stream.role(), StreamRole::Pushed);
    assert_eq!(
        push.stream.read_to_end().await.unwrap(),
        Bytes::from_static(b"body{}")
    );
    assert_eq!(session.listener_count(SessionEventKind::Stream), 0);

    assert_eq!(stream.wait_response().await.unwrap().status(), Some(200));
    assert_eq!(
        stream.read_to_end().await.unwrap(),
        Bytes::from_static(b"<html></html>")
    );

    session.close().await.unwrap();
    server.close().await.unwrap();
}

#[monoio::test(enable_timer = true)]
async fn push_without_waiter_is_kept() {
    let (server, url) = push_server().await;
    let session = Session::connect(&url, ConnectOptions::default()).await.unwrap();

    let stream = session
        .request(Headers::from_record([(":path", "/")]), RequestOptions::default())
        .await
        .unwrap();
    stream.read_to_end().await.unwrap();

    let push = session.wait_push().await.unwrap();
    assert_eq!(push.request.value_string(":path"), Some("/style.css"));
    assert_eq!(
        push.stream.read_to_end().await.unwrap(),
        Bytes::from_static(b"body{}")
    );

    session.close().await.unwrap();
    server.close().await.unwrap();
}

#[monoio::test(enable_timer = true)]
async fn push_refused_when_disabled() {
    let outcome: Rc<RefCell<Option<bool>>> = Rc::default();
    let record = outcome.clone();
    let server = Server::new(ListenOptions::default());
    let _token = server.on_stream(move |stream: &Stream, _: &Headers| {
        stream
            .respond(Headers::from_record([(":status", "200")]), RespondOptions::default())
            .unwrap();
        let pushed = stream.push_stream(Headers::from_record([(":path", "/style.css")]));
        record.replace(Some(pushed.is_ok()));
        let stream = stream.clone();
        monoio::spawn(async move { stream.end().await.unwrap() });
    });
    let addr = server.listen().await.unwrap();

    let options = ConnectOptions {
        enable_push: false,
        ..Default::default()
    };
    let session = Session::connect(&format!("http://{addr}"), options).await.unwrap();
    let stream = session
        .request(Headers::from_record([(":path", "/")]), RequestOptions::default())
        .await
        .unwrap();
    stream.wait_response().await.unwrap();
    stream.wait_end().await.unwrap();
    assert_eq!(*outcome.borrow(), Some(false));

    session.close().await.unwrap();
    server.close().await.unwrap();
}

#[monoio::test(enable_timer = true)]
async fn client_cannot_push_and_server_cannot_wait_for_pushes() {
    let server = Server::new(ListenOptions::default());
    let sessions = Rc::new(RefCell::new(Vec::new()));
    let kept = sessions.clone();
    let _token = server.on(monoio_http2::ServerEventKind::Session, move |event| {
        if let monoio_http2::ServerEvent::Session(session) = event {
            kept.borrow_mut().push(session.clone());
        }
    });
    let _stream_token = server.on_stream(|stream, _| {
        stream
            .respond(
                Headers::from_record([(":status", "200")]),
                RespondOptions {
                    end_stream: true,
                    ..Default::default()
                },
            )
            .unwrap();
    });
    let addr = server.listen().await.unwrap();

    let session = Session::connect(&format!("http://{addr}"), ConnectOptions::default())
        .await
        .unwrap();
    let stream = session
        .request(Headers::from_record([(":path", "/")]), RequestOptions::default())
        .await
        .unwrap();
    assert!(matches!(
        stream.push_stream(Headers::from_record([(":path", "/x")])),
        Err(Error::Unsupported { .. })
    ));
    stream.wait_response().await.unwrap();

    let server_session = sessions.borrow()[0].clone();
    assert!(matches!(
        server_session.wait_push().await,
        Err(Error::Unsupported { .. })
    ));

    session.close().await.unwrap();
    server.close().await.unwrap();
}
