// TCP position feed
// Streams each solved position as a JSON line to every connected client

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Bind the feed listener on `addr` ([host:]port).
pub async fn bind_position_feed(addr: &str) -> io::Result<TcpListener> {
    let addr = if addr.contains(':') {
        addr.to_string()
    } else {
        format!("0.0.0.0:{}", addr)
    };
    let socket_addr: SocketAddr = addr
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, format!("{}: {}", addr, e)))?;
    TcpListener::bind(socket_addr).await
}

/// Accept feed clients forever; each gets its own subscription to `tx`.
pub async fn serve_position_feed(listener: TcpListener, tx: broadcast::Sender<Vec<u8>>) {
    if let Ok(addr) = listener.local_addr() {
        info!("Listening for position feed clients on {}", addr);
    }

    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                info!("Accepted position feed client {}", peer_addr);
                let rx = tx.subscribe();
                tokio::spawn(feed_client(stream, peer_addr, rx));
            }
            Err(e) => error!("Position feed accept failed: {}", e),
        }
    }
}

async fn feed_client(mut stream: TcpStream, peer_addr: SocketAddr, mut rx: broadcast::Receiver<Vec<u8>>) {
    let heartbeat = Duration::from_secs(crate::constants::HEARTBEAT_INTERVAL_SECS);
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + heartbeat, heartbeat);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        let bytes = tokio::select! {
            result = rx.recv() => match result {
                Ok(bytes) => bytes,
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    warn!("Position feed client {} lagged by {} messages", peer_addr, count);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = interval.tick() => b"\n".to_vec(),
        };

        if let Err(e) = stream.write_all(&bytes).await {
            info!("Position feed client {} disconnected: {}", peer_addr, e);
            break;
        }
        if let Err(e) = stream.flush().await {
            info!("Position feed client {} flush error: {}", peer_addr, e);
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader};

    #[tokio::test]
    async fn test_bind_rejects_bad_address() {
        assert!(bind_position_feed("not-an-address:xx").await.is_err());
    }

    #[tokio::test]
    async fn test_feed_delivers_lines() {
        let listener = bind_position_feed("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, _rx) = broadcast::channel(16);
        tokio::spawn(serve_position_feed(listener, tx.clone()));

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut reader = BufReader::new(stream);

        // Wait for the server side to subscribe
        while tx.receiver_count() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tx.send(b"{\"x\":1.0}\n".to_vec()).unwrap();

        let mut line = String::new();
        tokio::time::timeout(Duration::from_secs(2), reader.read_line(&mut line))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(line, "{\"x\":1.0}\n");
    }
}
