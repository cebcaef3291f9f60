//! Dialing a target through a pool endpoint
//!
//! HTTP endpoints are driven with a CONNECT request, SOCKS5 endpoints through
//! tokio-socks. Either way the caller gets back a plain TCP stream already
//! tunnelled to the target.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;

use crate::error::{PoolError, Result};
use crate::models::{Credentials, ParsedAddress, ProxyScheme};

/// Open a tunnel to `target_host:target_port` through `endpoint`
pub async fn connect_through(
    endpoint: &ParsedAddress,
    target_host: &str,
    target_port: u16,
) -> Result<TcpStream> {
    let endpoint_addr = format_authority(endpoint.dial_host(), endpoint.port);
    let target = format_authority(target_host, target_port);

    let result = match endpoint.scheme {
        ProxyScheme::Http => {
            http_connect(
                &endpoint_addr,
                endpoint.credentials.as_ref(),
                target_host,
                target_port,
            )
            .await
        }
        ProxyScheme::Socks5 => {
            socks5_connect(
                &endpoint_addr,
                endpoint.credentials.as_ref(),
                target_host,
                target_port,
            )
            .await
        }
    };

    result.map_err(|e| {
        PoolError::ProxyConnectionFailed(format!(
            "{} endpoint {} could not reach {}: {}",
            endpoint.scheme, endpoint_addr, target, e
        ))
    })
}

async fn http_connect(
    endpoint_addr: &str,
    credentials: Option<&Credentials>,
    target_host: &str,
    target_port: u16,
) -> std::result::Result<TcpStream, anyhow::Error> {
    let mut stream = TcpStream::connect(endpoint_addr).await?;

    let authority = format_authority(target_host, target_port);
    let mut request = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n", authority, authority);
    if let Some(creds) = credentials {
        let token = BASE64.encode(format!("{}:{}", creds.username, creds.password));
        request.push_str(&format!("Proxy-Authorization: Basic {}\r\n", token));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await?;

    let mut response = vec![0u8; 1024];
    let n = stream.read(&mut response).await?;
    if n == 0 {
        anyhow::bail!("endpoint closed the connection before answering CONNECT");
    }

    let status_line = String::from_utf8_lossy(&response[..n])
        .lines()
        .next()
        .unwrap_or_default()
        .to_string();
    if !is_connect_success(&status_line) {
        anyhow::bail!("CONNECT rejected: {}", status_line);
    }

    Ok(stream)
}

async fn socks5_connect(
    endpoint_addr: &str,
    credentials: Option<&Credentials>,
    target_host: &str,
    target_port: u16,
) -> std::result::Result<TcpStream, anyhow::Error> {
    let socket = TcpStream::connect(endpoint_addr).await?;

    let stream = match credentials {
        Some(creds) => {
            Socks5Stream::connect_with_password_and_socket(
                socket,
                (target_host, target_port),
                &creds.username,
                &creds.password,
            )
            .await?
        }
        None => Socks5Stream::connect_with_socket(socket, (target_host, target_port)).await?,
    };

    Ok(stream.into_inner())
}

fn is_connect_success(status_line: &str) -> bool {
    let mut parts = status_line.split_whitespace();
    matches!(
        (parts.next(), parts.next()),
        (Some("HTTP/1.1") | Some("HTTP/1.0"), Some("200"))
    )
}

/// `host:port`, bracketing bare IPv6 hosts
pub(crate) fn format_authority(host: &str, port: u16) -> String {
    if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::net::TcpListener;
    use tokio::time::{timeout, Duration};

    async fn echo_target() -> (std::net::SocketAddr, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = stream.read(&mut buf).await.unwrap();
            stream.write_all(&buf[..n]).await.unwrap();
        });
        (addr, task)
    }

    async fn relay_once(client: &mut TcpStream, server: &mut TcpStream) {
        let mut buf = [0u8; 64];
        let n = client.read(&mut buf).await.unwrap();
        server.write_all(&buf[..n]).await.unwrap();
        let n = server.read(&mut buf).await.unwrap();
        client.write_all(&buf[..n]).await.unwrap();
    }

    async fn assert_echoes(stream: &mut TcpStream) {
        stream.write_all(b"ping").await.unwrap();
        let mut out = [0u8; 4];
        timeout(Duration::from_secs(1), stream.read_exact(&mut out))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&out, b"ping");
    }

    #[test]
    fn test_connect_status_line() {
        assert!(is_connect_success("HTTP/1.1 200 Connection Established"));
        assert!(is_connect_success("HTTP/1.0 200 OK"));
        assert!(!is_connect_success("HTTP/1.1 407 Proxy Authentication Required"));
        assert!(!is_connect_success("HTTP/1.1 2000 Weird"));
        assert!(!is_connect_success(""));
    }

    #[test]
    fn test_format_authority_brackets_ipv6() {
        assert_eq!(format_authority("::1", 8080), "[::1]:8080");
        assert_eq!(format_authority("[::1]", 8080), "[::1]:8080");
        assert_eq!(format_authority("example.com", 443), "example.com:443");
    }

    #[tokio::test]
    async fn test_http_endpoint_tunnels_bytes() {
        let (target_addr, target_task) = echo_target().await;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint_addr = listener.local_addr().unwrap();
        let endpoint_task = tokio::spawn(async move {
            let (mut client, _) = listener.accept().await.unwrap();

            let mut buf = vec![0u8; 2048];
            let n = client.read(&mut buf).await.unwrap();
            let req = String::from_utf8_lossy(&buf[..n]);
            assert!(req.starts_with("CONNECT 127.0.0.1:"));
            // base64("user:pass")
            assert!(req.contains("Proxy-Authorization: Basic dXNlcjpwYXNz"));

            let mut server = TcpStream::connect(target_addr).await.unwrap();
            client
                .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
                .await
                .unwrap();
            relay_once(&mut client, &mut server).await;
        });

        let endpoint =
            ParsedAddress::parse(&format!("http://user:pass@{}", endpoint_addr)).unwrap();
        let mut stream = connect_through(&endpoint, "127.0.0.1", target_addr.port())
            .await
            .unwrap();
        assert_echoes(&mut stream).await;

        endpoint_task.await.unwrap();
        target_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_http_endpoint_rejection_is_connection_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint_addr = listener.local_addr().unwrap();
        let endpoint_task = tokio::spawn(async move {
            let (mut client, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 2048];
            let _ = client.read(&mut buf).await.unwrap();
            client
                .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
                .await
                .unwrap();
        });

        let endpoint = ParsedAddress::parse(&endpoint_addr.to_string()).unwrap();
        let err = connect_through(&endpoint, "example.com", 443)
            .await
            .unwrap_err();

        assert!(matches!(err, PoolError::ProxyConnectionFailed(_)));
        assert!(err.to_string().contains("407"));
        endpoint_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_fails() {
        // Bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let endpoint = ParsedAddress::parse(&addr.to_string()).unwrap();
        let result = connect_through(&endpoint, "example.com", 80).await;
        assert!(matches!(result, Err(PoolError::ProxyConnectionFailed(_))));
    }

    #[tokio::test]
    async fn test_socks5_endpoint_tunnels_bytes() {
        let (target_addr, target_task) = echo_target().await;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint_addr = listener.local_addr().unwrap();
        let endpoint_task = tokio::spawn(async move {
            let (mut client, _) = listener.accept().await.unwrap();

            // Greeting
            let mut header = [0u8; 2];
            client.read_exact(&mut header).await.unwrap();
            assert_eq!(header[0], 0x05);
            let mut methods = vec![0u8; header[1] as usize];
            client.read_exact(&mut methods).await.unwrap();
            assert!(methods.contains(&0x02));
            client.write_all(&[0x05, 0x02]).await.unwrap();

            // Username/password sub-negotiation
            let mut auth_head = [0u8; 2];
            client.read_exact(&mut auth_head).await.unwrap();
            assert_eq!(auth_head[0], 0x01);
            let mut uname = vec![0u8; auth_head[1] as usize];
            client.read_exact(&mut uname).await.unwrap();
            let mut plen = [0u8; 1];
            client.read_exact(&mut plen).await.unwrap();
            let mut passwd = vec![0u8; plen[0] as usize];
            client.read_exact(&mut passwd).await.unwrap();
            assert_eq!(uname, b"user");
            assert_eq!(passwd, b"pass");
            client.write_all(&[0x01, 0x00]).await.unwrap();

            // CONNECT to an IPv4 target
            let mut req_head = [0u8; 4];
            client.read_exact(&mut req_head).await.unwrap();
            assert_eq!(req_head, [0x05, 0x01, 0x00, 0x01]);
            let mut dst_ip = [0u8; 4];
            client.read_exact(&mut dst_ip).await.unwrap();
            let mut dst_port = [0u8; 2];
            client.read_exact(&mut dst_port).await.unwrap();

            let dest = std::net::SocketAddr::from((
                std::net::Ipv4Addr::from(dst_ip),
                u16::from_be_bytes(dst_port),
            ));
            assert_eq!(dest, target_addr);

            let mut server = TcpStream::connect(dest).await.unwrap();
            client
                .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
            relay_once(&mut client, &mut server).await;
        });

        let endpoint =
            ParsedAddress::parse(&format!("socks5://user:pass@{}", endpoint_addr)).unwrap();
        let mut stream = connect_through(&endpoint, "127.0.0.1", target_addr.port())
            .await
            .unwrap();
        assert_echoes(&mut stream).await;

        endpoint_task.await.unwrap();
        target_task.await.unwrap();
    }
}
