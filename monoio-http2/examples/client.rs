use std::time::Duration;

use monoio_http2::{ConnectOptions, Headers, RequestOptions, Session};

#[monoio::main(enable_timer = true)]
async fn main() {
    let session = Session::connect("http://127.0.0.1:59288", ConnectOptions::default())
        .await
        .unwrap();
    let _token = session.on_error(|e| println!("GOT SESSION ERR={e}"));

    let push = session.wait_push();
    let stream = session
        .request(Headers::from_record([(":path", "/")]), RequestOptions::default())
        .await
        .unwrap();

    let response = stream.wait_response().await.unwrap();
    println!("GOT RESPONSE: {:?}", response);
    while let Some(chunk) = stream.read_chunk().await {
        println!("GOT CHUNK = {:?}", chunk);
    }
    if let Some(trailers) = stream.trailers() {
        println!("GOT TRAILERS: {:?}", trailers);
    }

    match push.timeout(Duration::from_millis(200)).await {
        Ok(push) => {
            println!("GOT PUSH: {:?} -> {:?}", push.request, push.response);
            let body = push.stream.read_to_end().await.unwrap();
            println!("PUSHED BODY = {:?}", body);
        }
        Err(e) => println!("no push: {e}"),
    }

    session.close().await.unwrap();
}
