use bytes::Bytes;
use monoio_http2::{Headers, ListenOptions, RespondOptions, Server, Stream};

const PAGE: &str = r#"<html><head><link rel="stylesheet" href="/style.css"></head><body>hi</body></html>"#;
const STYLE: &str = "body { color: teal; }";

#[monoio::main(enable_timer = true)]
async fn main() {
    let server = Server::new(ListenOptions::with_port(59288));
    let _token = server.on_stream(|stream, headers| {
        println!("GOT REQUEST: {:?}", headers.value_string(":path"));
        monoio::spawn(handle(stream.clone()));
    });
    let addr = server.listen().await.unwrap();
    println!("Listening on {addr}");
    // Runs until killed.
    std::future::pending::<()>().await;
}

async fn handle(stream: Stream) {
    if let Err(e) = serve_page(&stream).await {
        println!("GOT ERR={e}");
        stream.destroy();
    }
}

async fn serve_page(stream: &Stream) -> monoio_http2::Result<()> {
    let html = Headers::from_record([(":status", "200"), ("content-type", "text/html")]);
    stream.respond(html, RespondOptions::default())?;

    match stream.push_stream(Headers::from_record([(":path", "/style.css")])) {
        Ok(pushed) => {
            let css = Headers::from_record([(":status", "200"), ("content-type", "text/css")]);
            pushed.respond(css, RespondOptions::default())?;
            pushed.send_data(Bytes::from_static(STYLE.as_bytes()), true).await?;
        }
        Err(e) => println!("push refused: {e}"),
    }

    stream.send_data(Bytes::from_static(PAGE.as_bytes()), true).await
}
