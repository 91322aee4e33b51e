use nsq_client::{Reader, ReaderConfigBuilder, ReaderEvent, Writer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut writer = Writer::new("localhost", 4150)?;

    println!("Connecting to nsqd...");
    writer.connect().await?;

    println!("\nPublishing messages to 'events'...");
    writer.publish("events", ["Hello, NSQ!"]).await?;
    writer.publish("events", ["one", "two", "three"]).await?;
    println!("Published 4 messages");

    let config = ReaderConfigBuilder::new()
        .nsqd_tcp_address("localhost:4150")
        .max_in_flight(10)
        .build();
    let mut reader = Reader::new("events", "basic", config)?;
    reader.connect().await?;

    println!("\nReading messages...");
    let mut received = 0;
    while let Some(event) = reader.next_event().await {
        match event {
            ReaderEvent::Message(message) => {
                println!(
                    "Got message {}: {}",
                    message.id(),
                    String::from_utf8_lossy(message.body())
                );
                message.finish()?;
                received += 1;
                if received == 4 {
                    break;
                }
            }
            ReaderEvent::NsqdConnected(addr) => println!("Connected to {addr}"),
            ReaderEvent::Error(e) => println!("Reader error: {e}"),
            _ => {}
        }
    }

    reader.close().await;
    writer.close().await;
    Ok(())
}
