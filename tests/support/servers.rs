//! Minimal in-process servers for exercising the transport against
//! misbehaving origins and proxies.

#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, copy_bidirectional};
use tokio::net::{TcpListener, TcpStream};

/// Requests or destinations seen by a test server.
pub type Log = Arc<Mutex<Vec<String>>>;

fn new_log() -> Log {
    Arc::new(Mutex::new(Vec::new()))
}

async fn bind() -> TcpListener {
    TcpListener::bind("127.0.0.1:0").await.unwrap()
}

/// Reads one request head (through the blank line).
pub async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> Option<String> {
    let mut head = Vec::new();
    while !head.ends_with(b"\r\n\r\n") {
        match stream.read_u8().await {
            Ok(byte) => head.push(byte),
            Err(_) => return None,
        }
        if head.len() > 64 * 1024 {
            return None;
        }
    }
    Some(String::from_utf8_lossy(&head).into_owned())
}

/// Answers every request with `reply`, then closes the connection (or keeps
/// it open for `linger`).
pub async fn raw_http_server(reply: &'static [u8], linger: Option<Duration>) -> SocketAddr {
    let listener = bind().await;
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                if read_head(&mut stream).await.is_none() {
                    return;
                }
                let _ = stream.write_all(reply).await;
                let _ = stream.flush().await;
                if let Some(linger) = linger {
                    tokio::time::sleep(linger).await;
                }
            });
        }
    });
    addr
}

/// Logs each request line, answers one request per connection with a
/// keep-alive response and then closes the socket.
pub async fn one_shot_keepalive_server(reply: &'static [u8]) -> (SocketAddr, Log) {
    let listener = bind().await;
    let addr = listener.local_addr().unwrap();
    let log = new_log();
    let seen = Arc::clone(&log);
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let seen = Arc::clone(&seen);
            tokio::spawn(async move {
                let Some(head) = read_head(&mut stream).await else {
                    return;
                };
                let line = head.lines().next().unwrap_or_default().to_string();
                seen.lock().unwrap().push(line);
                let _ = stream.write_all(reply).await;
                let _ = stream.flush().await;
            });
        }
    });
    (addr, log)
}

/// Accepts connections and never writes a byte.
pub async fn silent_server() -> SocketAddr {
    let listener = bind().await;
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    addr
}

/// A port with nothing listening on it.
pub async fn closed_port() -> SocketAddr {
    let listener = bind().await;
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

async fn connect_target(host: &str, port: u16) -> Option<TcpStream> {
    TcpStream::connect((host, port)).await.ok()
}

/// SOCKS5 server; logs `host:port` of every CONNECT and pipes to the target.
///
/// With `auth`, only username/password authentication is accepted.
pub async fn socks5_server(auth: Option<(&'static str, &'static str)>) -> (SocketAddr, Log) {
    let listener = bind().await;
    let addr = listener.local_addr().unwrap();
    let log = new_log();
    let seen = log.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let seen = seen.clone();
            tokio::spawn(async move {
                let _ = socks5_session(stream, auth, seen).await;
            });
        }
    });
    (addr, log)
}

async fn socks5_session(
    mut client: TcpStream,
    auth: Option<(&'static str, &'static str)>,
    log: Log,
) -> std::io::Result<()> {
    let version = client.read_u8().await?;
    assert_eq!(version, 5);
    let count = client.read_u8().await?;
    let mut methods = vec![0u8; usize::from(count)];
    client.read_exact(&mut methods).await?;

    match auth {
        None => client.write_all(&[5, 0x00]).await?,
        Some((user, pass)) => {
            if !methods.contains(&0x02) {
                client.write_all(&[5, 0xff]).await?;
                return Ok(());
            }
            client.write_all(&[5, 0x02]).await?;
            let _ = client.read_u8().await?;
            let ulen = client.read_u8().await?;
            let mut username = vec![0u8; usize::from(ulen)];
            client.read_exact(&mut username).await?;
            let plen = client.read_u8().await?;
            let mut password = vec![0u8; usize::from(plen)];
            client.read_exact(&mut password).await?;
            if username != user.as_bytes() || password != pass.as_bytes() {
                client.write_all(&[1, 0x01]).await?;
                return Ok(());
            }
            client.write_all(&[1, 0x00]).await?;
        }
    }

    let mut head = [0u8; 4];
    client.read_exact(&mut head).await?;
    let host = match head[3] {
        0x01 => {
            let mut ip = [0u8; 4];
            client.read_exact(&mut ip).await?;
            Ipv4Addr::from(ip).to_string()
        }
        0x04 => {
            let mut ip = [0u8; 16];
            client.read_exact(&mut ip).await?;
            Ipv6Addr::from(ip).to_string()
        }
        _ => {
            let len = client.read_u8().await?;
            let mut name = vec![0u8; usize::from(len)];
            client.read_exact(&mut name).await?;
            String::from_utf8_lossy(&name).into_owned()
        }
    };
    let port = client.read_u16().await?;
    log.lock().unwrap().push(format!("{host}:{port}"));

    let Some(mut upstream) = connect_target(&host, port).await else {
        client.write_all(&[5, 0x05, 0, 1, 0, 0, 0, 0, 0, 0]).await?;
        return Ok(());
    };
    client.write_all(&[5, 0x00, 0, 1, 127, 0, 0, 1, 0, 0]).await?;
    copy_bidirectional(&mut client, &mut upstream).await?;
    Ok(())
}

/// SOCKS5 server that refuses every CONNECT with `code`.
pub async fn socks5_rejecting_server(code: u8) -> SocketAddr {
    let listener = bind().await;
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut client, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut greeting = [0u8; 3];
                client.read_exact(&mut greeting).await.ok()?;
                client.write_all(&[5, 0x00]).await.ok()?;
                let mut request = [0u8; 10];
                client.read_exact(&mut request).await.ok()?;
                client.write_all(&[5, code, 0, 1, 0, 0, 0, 0, 0, 0]).await.ok()
            });
        }
    });
    addr
}

/// SOCKS4/4a server; logs the destination and pipes to the target.
pub async fn socks4_server() -> (SocketAddr, Log) {
    let listener = bind().await;
    let addr = listener.local_addr().unwrap();
    let log = new_log();
    let seen = log.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let seen = seen.clone();
            tokio::spawn(async move {
                let _ = socks4_session(stream, seen).await;
            });
        }
    });
    (addr, log)
}

async fn read_cstring(stream: &mut TcpStream) -> std::io::Result<String> {
    let mut bytes = Vec::new();
    loop {
        match stream.read_u8().await? {
            0 => return Ok(String::from_utf8_lossy(&bytes).into_owned()),
            byte => bytes.push(byte),
        }
    }
}

async fn socks4_session(mut client: TcpStream, log: Log) -> std::io::Result<()> {
    let mut head = [0u8; 8];
    client.read_exact(&mut head).await?;
    assert_eq!(head[0], 4);
    let port = u16::from_be_bytes([head[2], head[3]]);
    let ip = Ipv4Addr::new(head[4], head[5], head[6], head[7]);
    let _user = read_cstring(&mut client).await?;
    let host = if ip.octets()[..3] == [0, 0, 0] && ip.octets()[3] != 0 {
        read_cstring(&mut client).await?
    } else {
        IpAddr::V4(ip).to_string()
    };
    log.lock().unwrap().push(format!("{host}:{port}"));

    let Some(mut upstream) = connect_target(&host, port).await else {
        client.write_all(&[0, 0x5b, 0, 0, 0, 0, 0, 0]).await?;
        return Ok(());
    };
    client.write_all(&[0, 0x5a, 0, 0, 0, 0, 0, 0]).await?;
    copy_bidirectional(&mut client, &mut upstream).await?;
    Ok(())
}

/// HTTP proxy: tunnels CONNECT and forwards absolute-form requests verbatim.
/// Logs each request head.
pub async fn http_proxy_server() -> (SocketAddr, Log) {
    let listener = bind().await;
    let addr = listener.local_addr().unwrap();
    let log = new_log();
    let seen = log.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let seen = seen.clone();
            tokio::spawn(async move {
                let _ = http_proxy_session(stream, seen).await;
            });
        }
    });
    (addr, log)
}

async fn http_proxy_session(mut client: TcpStream, log: Log) -> std::io::Result<()> {
    let Some(head) = read_head(&mut client).await else {
        return Ok(());
    };
    log.lock().unwrap().push(head.clone());
    let request_line = head.lines().next().unwrap_or_default().to_string();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default();
    let target = parts.next().unwrap_or_default();

    if method == "CONNECT" {
        let (host, port) = target.rsplit_once(':').unwrap();
        let Some(mut upstream) = connect_target(host, port.parse().unwrap()).await else {
            client.write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n").await?;
            return Ok(());
        };
        client.write_all(b"HTTP/1.1 200 Connection established\r\n\r\n").await?;
        copy_bidirectional(&mut client, &mut upstream).await?;
        return Ok(());
    }

    let authority = target
        .strip_prefix("http://")
        .and_then(|rest| rest.split('/').next())
        .unwrap_or_default();
    let Some(mut upstream) = TcpStream::connect(authority).await.ok() else {
        client.write_all(b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\n\r\n").await?;
        return Ok(());
    };
    upstream.write_all(head.as_bytes()).await?;
    copy_bidirectional(&mut client, &mut upstream).await?;
    Ok(())
}

/// HTTP proxy that answers every request with `status` and an empty body.
pub async fn http_proxy_rejecting(status_line: &'static str) -> (SocketAddr, Log) {
    let listener = bind().await;
    let addr = listener.local_addr().unwrap();
    let log = new_log();
    let seen = log.clone();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let seen = seen.clone();
            tokio::spawn(async move {
                if let Some(head) = read_head(&mut stream).await {
                    seen.lock().unwrap().push(head);
                    let reply = format!("HTTP/1.1 {status_line}\r\nContent-Length: 0\r\n\r\n");
                    let _ = stream.write_all(reply.as_bytes()).await;
                }
            });
        }
    });
    (addr, log)
}
