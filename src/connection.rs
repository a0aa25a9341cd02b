use crate::close::CloseReason;
use crate::error::Error;
use std::net::SocketAddr;
use tokio::net::{TcpSocket, TcpStream};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{
    client_async_tls_with_config, tungstenite::client::IntoClientRequest, tungstenite::Message,
    Connector, MaybeTlsStream, WebSocketStream,
};
use tracing::debug;
use url::Url;

/// Type alias for the gateway socket
pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Open a websocket to `url` within `connect_timeout`.
///
/// Resolves the host, opens a TCP socket tuned for latency, negotiates TLS
/// for `wss://` URLs and performs the websocket handshake.
pub(crate) async fn connect(url: &str, connect_timeout: Duration) -> Result<WsStream, Error> {
    match timeout(connect_timeout, connect_with_options(url)).await {
        Ok(result) => result,
        Err(_) => Err(Error::ConnectTimeout(connect_timeout)),
    }
}

async fn connect_with_options(url: &str) -> Result<WsStream, Error> {
    let parsed_url = Url::parse(url).map_err(|e| Error::ConnectionFailed {
        attempts: 0,
        last_error: format!("Invalid URL: {}", e),
    })?;

    let host = parsed_url
        .host_str()
        .ok_or_else(|| Error::ConnectionFailed {
            attempts: 0,
            last_error: "No host in URL".to_string(),
        })?;

    let is_tls = match parsed_url.scheme() {
        "wss" => true,
        "ws" => false,
        scheme => {
            return Err(Error::ConnectionFailed {
                attempts: 0,
                last_error: format!("Unsupported scheme: {}", scheme),
            })
        }
    };
    let port = parsed_url.port().unwrap_or(if is_tls { 443 } else { 80 });

    let request = url
        .into_client_request()
        .map_err(|e| Error::ConnectionFailed {
            attempts: 0,
            last_error: format!("Invalid WebSocket request: {}", e),
        })?;

    debug!("Connecting to {}:{} (tls={})", host, port, is_tls);
    let tcp_stream = connect_direct(host, port).await?;
    set_tcp_options(&tcp_stream);

    let connector = if is_tls {
        let tls = native_tls::TlsConnector::new().map_err(|e| Error::ConnectionFailed {
            attempts: 0,
            last_error: format!("TLS error: {}", e),
        })?;
        Some(Connector::NativeTls(tls))
    } else {
        None
    };

    let (ws_stream, _response) = client_async_tls_with_config(request, tcp_stream, None, connector)
        .await
        .map_err(Error::WebSocket)?;

    Ok(ws_stream)
}

async fn connect_direct(host: &str, port: u16) -> Result<TcpStream, Error> {
    let dest_str = format!("{}:{}", host, port);
    let dest_addr: SocketAddr = tokio::net::lookup_host(&dest_str)
        .await
        .map_err(|e| Error::ConnectionFailed {
            attempts: 0,
            last_error: format!("DNS lookup failed: {}", e),
        })?
        .next()
        .ok_or_else(|| Error::ConnectionFailed {
            attempts: 0,
            last_error: format!("No addresses found for {}", host),
        })?;

    let socket = if dest_addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(|e| Error::ConnectionFailed {
        attempts: 0,
        last_error: format!("Failed to create socket: {}", e),
    })?;

    socket
        .connect(dest_addr)
        .await
        .map_err(|e| Error::ConnectionFailed {
            attempts: 0,
            last_error: format!("TCP connect to {} failed: {}", dest_addr, e),
        })
}

/// Disable Nagle and enable keepalive so dead peers are noticed
fn set_tcp_options(stream: &TcpStream) {
    let sock2 = socket2::SockRef::from(stream);
    let _ = sock2.set_nodelay(true);

    let keepalive = socket2::TcpKeepalive::new()
        .with_time(Duration::from_secs(30))
        .with_interval(Duration::from_secs(10));
    let _ = sock2.set_tcp_keepalive(&keepalive);
}

/// Map a received close frame to a close reason
pub(crate) fn close_reason(frame: Option<&CloseFrame>) -> CloseReason {
    match frame {
        Some(frame) => CloseReason::from_code(u16::from(frame.code)),
        None => CloseReason::Unknown,
    }
}

/// Close frame carrying `reason`'s code
pub(crate) fn close_message(reason: CloseReason) -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::from(reason.code()),
        reason: String::new().into(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_close_reason_from_frame() {
        let frame = CloseFrame {
            code: CloseCode::from(4004),
            reason: String::from("bad token").into(),
        };
        assert_eq!(close_reason(Some(&frame)), CloseReason::AuthenticationFailed);
        assert_eq!(close_reason(None), CloseReason::Unknown);
    }

    #[test]
    fn test_close_message_code() {
        match close_message(CloseReason::UnknownError) {
            Message::Close(Some(frame)) => assert_eq!(u16::from(frame.code), 4000),
            other => panic!("expected close frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rejects_unsupported_scheme() {
        let err = connect("http://127.0.0.1:1/", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConnectionFailed { .. }));
        assert!(connect("not a url", Duration::from_secs(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_connects_to_plain_websocket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(Message::Text("hello".into())).await.unwrap();
        });

        let mut ws = connect(&format!("ws://{}/?v=10", addr), Duration::from_secs(5))
            .await
            .unwrap();
        match ws.next().await {
            Some(Ok(Message::Text(text))) => assert_eq!(text.as_str(), "hello"),
            other => panic!("unexpected frame {:?}", other),
        }
        server.await.unwrap();
    }
}
