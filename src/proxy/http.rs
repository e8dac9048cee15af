//! HTTP CONNECT client-side tunnel negotiation

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::common::{Endpoint, Error, Result};
use crate::http::{HttpResult, ResponseDecoder};

/// Negotiate an HTTP CONNECT tunnel to `target` over a connected channel.
///
/// The reply is fed through the incremental response decoder one byte at a
/// time, so the stream ends up positioned exactly after the blank line that
/// terminates the reply head.
pub(crate) async fn establish<S>(
    stream: &mut S,
    target: &Endpoint,
    username: Option<&str>,
    password: Option<&str>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let authority = target.authority();
    let mut request = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n");
    if let Some(user) = username {
        let credentials = format!("{user}:{}", password.unwrap_or(""));
        request.push_str(&format!(
            "Proxy-Authorization: Basic {}\r\n",
            BASE64.encode(credentials)
        ));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await?;

    let mut decoder = ResponseDecoder::head_only();
    let mut buf = BytesMut::with_capacity(256);
    let mut byte = [0u8; 1];
    loop {
        if let Some(result) = decoder.decode(&mut buf)? {
            let HttpResult::Response(response) = result else {
                return Err(Error::Proxy("unexpected redirect from CONNECT".into()));
            };
            if response.head.status != 200 {
                return Err(Error::Proxy(format!(
                    "HTTP CONNECT failed with status {}",
                    response.head.status
                )));
            }
            trace!("HTTP CONNECT tunnel to {} open", target);
            return Ok(());
        }

        match stream.read_exact(&mut byte).await {
            Ok(_) => buf.extend_from_slice(&byte),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(Error::Proxy("proxy closed during CONNECT reply".into()));
            }
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn connect_succeeds_and_positions_after_blank_line() {
        let (mut client, mut server) = duplex(1024);
        let target = Endpoint::new("chat.example.org", 5222);

        let peer = tokio::spawn(async move {
            let mut request = vec![0u8; 1024];
            let n = server.read(&mut request).await.unwrap();
            let text = String::from_utf8_lossy(&request[..n]).to_string();
            assert!(text.starts_with("CONNECT chat.example.org:5222 HTTP/1.1\r\n"));
            assert!(text.contains("Host: chat.example.org:5222\r\n"));
            assert!(text.ends_with("\r\n\r\n"));

            // Reply plus the first tunneled bytes in one write.
            server
                .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n\x17\x03")
                .await
                .unwrap();
        });

        establish(&mut client, &target, None, None).await.unwrap();
        peer.await.unwrap();

        let mut first = [0u8; 2];
        client.read_exact(&mut first).await.unwrap();
        assert_eq!(first, [0x17, 0x03]);
    }

    #[tokio::test]
    async fn connect_sends_basic_authorization() {
        let (mut client, mut server) = duplex(1024);
        let target = Endpoint::new("example.org", 443);

        let peer = tokio::spawn(async move {
            let mut request = vec![0u8; 1024];
            let n = server.read(&mut request).await.unwrap();
            let text = String::from_utf8_lossy(&request[..n]).to_string();
            // base64("alice:secret")
            assert!(text.contains("Proxy-Authorization: Basic YWxpY2U6c2VjcmV0\r\n"));
            server.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await.unwrap();
        });

        establish(&mut client, &target, Some("alice"), Some("secret"))
            .await
            .unwrap();
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn connect_fails_on_407() {
        let (mut client, mut server) = duplex(1024);
        let target = Endpoint::new("example.org", 443);

        let peer = tokio::spawn(async move {
            let mut request = vec![0u8; 1024];
            let _ = server.read(&mut request).await.unwrap();
            server
                .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Basic realm=\"proxy\"\r\n\r\n")
                .await
                .unwrap();
        });

        let err = establish(&mut client, &target, None, None)
            .await
            .unwrap_err();
        match err {
            Error::Proxy(message) => assert!(message.contains("407")),
            other => panic!("expected proxy error, got {other:?}"),
        }
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn connect_fails_on_malformed_status_line() {
        let (mut client, mut server) = duplex(1024);
        let target = Endpoint::new("example.org", 443);

        let peer = tokio::spawn(async move {
            let mut request = vec![0u8; 1024];
            let _ = server.read(&mut request).await.unwrap();
            server.write_all(b"garbage\r\n\r\n").await.unwrap();
        });

        let err = establish(&mut client, &target, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::HttpDecode(_)));
        peer.await.unwrap();
    }
}
