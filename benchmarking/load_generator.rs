use std::time::{Duration, Instant};
use tokio::io::duplex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use wsconn::{Conn, ConnConfig, MessageType, Role};

#[tokio::main]
async fn main() {
    let connection_count = 100; // Number of simulated client/server pairs
    let message_count = 1000; // Messages per connection
    let message_size = 16384; // Size of each message in bytes

    let (tx, mut rx) = mpsc::unbounded_channel();

    for _ in 0..connection_count {
        let tx = tx.clone();
        tokio::spawn(async move {
            let (client_io, server_io) = duplex(message_size * 4);
            let client = Conn::new(client_io, Role::Client, "", ConnConfig::default());
            let server = Conn::new(server_io, Role::Server, "", ConnConfig::default());
            let cancel = CancellationToken::new();

            tokio::spawn(async move {
                loop {
                    let Ok((msg_type, reader)) = server.read(&cancel).await else {
                        return;
                    };
                    let mut payload = Vec::new();
                    let mut buf = vec![0u8; message_size];
                    loop {
                        let Ok(chunk) = reader.read(&mut buf).await else { return };
                        payload.extend_from_slice(&buf[..chunk.n]);
                        if chunk.eof {
                            break;
                        }
                    }
                    let Ok(writer) = server.write(&cancel, msg_type).await else {
                        return;
                    };
                    if writer.write(payload).await.is_err() {
                        return;
                    }
                    let _ = writer.close().await;
                }
            });

            let payload = vec![b'a'; message_size];
            let start = Instant::now();

            for _ in 0..message_count {
                let writer = client.write(&cancel, MessageType::Binary).await.unwrap();
                writer.write(payload.clone()).await.unwrap();
                writer.close().await.unwrap();

                let (_, reader) = client.read(&cancel).await.unwrap();
                let mut buf = vec![0u8; message_size];
                loop {
                    let chunk = reader.read(&mut buf).await.unwrap();
                    if chunk.eof {
                        break;
                    }
                }
            }

            let duration = start.elapsed();
            tx.send(duration).unwrap();
        });
    }

    drop(tx);

    let mut total_duration = Duration::new(0, 0);
    while let Some(duration) = rx.recv().await {
        total_duration += duration;
    }

    let avg_latency = total_duration / (connection_count as u32 * message_count as u32);
    println!("Average Latency: {:?}", avg_latency);
}
