use nsq_client::{Message, Reader, ReaderConfigBuilder, ReaderEvent};
use std::time::Duration;
use tokio::time::sleep;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = ReaderConfigBuilder::new()
        .lookupd_http_address("localhost:4161")
        .max_in_flight(25)
        .max_attempts(3)
        .max_backoff_duration(Duration::from_secs(30))
        .build();

    let mut reader = Reader::new("events", "worker", config)?;
    reader.on_discard(|message| {
        println!(
            "Message {} exceeded max attempts, discarding",
            message.id()
        );
    });
    reader.connect().await?;

    println!("Starting worker, waiting for messages...");

    while let Some(event) = reader.next_event().await {
        match event {
            ReaderEvent::Message(message) => {
                tokio::spawn(handle(message));
            }
            ReaderEvent::NsqdConnected(addr) => println!("Connected to {addr}"),
            ReaderEvent::NsqdClosed(addr) => println!("Lost connection to {addr}"),
            ReaderEvent::Error(e) => println!("Reader error: {e}"),
            ReaderEvent::Discard(_) => {}
        }
    }

    Ok(())
}

async fn handle(message: Message) {
    let body = String::from_utf8_lossy(message.body()).into_owned();
    println!("Processing message {}: {}", message.id(), body);

    let result = match process_message(&body).await {
        Ok(()) => {
            println!("✅ Successfully processed message {}", message.id());
            message.finish()
        }
        Err(e) => {
            println!(
                "❌ Failed to process message {} (attempt {}): {}",
                message.id(),
                message.attempts(),
                e
            );
            message.requeue(None, true)
        }
    };

    if let Err(e) = result {
        println!("Could not respond to message {}: {}", message.id(), e);
    }
}

async fn process_message(body: &str) -> Result<(), String> {
    println!("  Processing: {}", body);
    sleep(Duration::from_millis(100)).await;

    if body.contains("error") {
        Err("Message contains 'error'".to_string())
    } else {
        Ok(())
    }
}
