//! Minimal viewer: connects, says hello and prints every state it receives.
//!
//! ```text
//! cargo run --example viewer -- ws://127.0.0.1:8787
//! ```

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tungstenite::Message;
use url::Url;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let url = Url::parse(
        &std::env::args().nth(1).unwrap_or_else(|| "ws://127.0.0.1:8787".into()),
    )?;
    let (ws_stream, _) = connect_async(url.as_str()).await?;
    let (mut write, mut read) = ws_stream.split();

    write
        .send(Message::Text(r#"{"type":"hello","role":"viewer"}"#.into()))
        .await?;
    println!("Connected to {}", url);

    while let Some(frame) = read.next().await {
        match frame? {
            Message::Text(text) => println!("{}", text),
            Message::Close(frame) => {
                println!("Closed: {:?}", frame);
                break;
            }
            _ => {}
        }
    }
    Ok(())
}
