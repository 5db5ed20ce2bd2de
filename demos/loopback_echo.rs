//! Runs a client and a server `Conn` over an in-memory duplex pipe and echoes three text
//! messages between them. Stands in for the TCP + handshake examples a full WebSocket
//! library would ship, since this crate starts only after the Upgrade has already happened.

use log::*;
use tokio::io::duplex;
use tokio_util::sync::CancellationToken;
use wsconn::{Conn, ConnConfig, MessageType, Role, StatusCode};

async fn run_server(conn: Conn) {
    let cancel = CancellationToken::new();
    loop {
        let (msg_type, reader) = match conn.read(&cancel).await {
            Ok(pair) => pair,
            Err(e) => {
                info!("server: connection ended: {e}");
                return;
            }
        };

        let mut payload = Vec::new();
        let mut buf = [0u8; 256];
        loop {
            match reader.read(&mut buf).await {
                Ok(chunk) => {
                    payload.extend_from_slice(&buf[..chunk.n]);
                    if chunk.eof {
                        break;
                    }
                }
                Err(e) => {
                    error!("server: read failed: {e}");
                    return;
                }
            }
        }

        info!("server: echoing {} bytes", payload.len());
        let Ok(writer) = conn.write(&cancel, msg_type).await else {
            return;
        };
        if writer.write(payload).await.is_err() {
            return;
        }
        let _ = writer.close().await;
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let (client_io, server_io) = duplex(8 * 1024);
    let client = Conn::new(client_io, Role::Client, "", ConnConfig::default());
    let server = Conn::new(server_io, Role::Server, "", ConnConfig::default());

    tokio::spawn(run_server(server));

    let cancel = CancellationToken::new();
    for message in ["hello", "from", "wsconn"] {
        let writer = client.write(&cancel, MessageType::Text).await.expect("start write");
        writer.write(message.as_bytes().to_vec()).await.expect("write chunk");
        writer.close().await.expect("finish message");

        let (_, reader) = client.read(&cancel).await.expect("read reply");
        let mut buf = [0u8; 256];
        let chunk = reader.read(&mut buf).await.expect("read reply bytes");
        info!("client: received {:?}", String::from_utf8_lossy(&buf[..chunk.n]));
    }

    client
        .close(StatusCode::NORMAL_CLOSURE, "done")
        .await
        .expect("close connection");
}
