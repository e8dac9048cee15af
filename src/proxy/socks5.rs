//! SOCKS5 client-side tunnel negotiation (RFC 1928 / RFC 1929)

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::common::{Endpoint, Error, Result};

const SOCKS5_VERSION: u8 = 0x05;
const AUTH_VERSION: u8 = 0x01;

const AUTH_NONE: u8 = 0x00;
const AUTH_PASSWORD: u8 = 0x02;
const AUTH_NO_ACCEPTABLE: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REP_SUCCESS: u8 = 0x00;
const REP_GENERAL_FAILURE: u8 = 0x01;
const REP_NOT_ALLOWED: u8 = 0x02;
const REP_NETWORK_UNREACHABLE: u8 = 0x03;
const REP_HOST_UNREACHABLE: u8 = 0x04;
const REP_CONNECTION_REFUSED: u8 = 0x05;
const REP_TTL_EXPIRED: u8 = 0x06;
const REP_CMD_NOT_SUPPORTED: u8 = 0x07;
const REP_ATYP_NOT_SUPPORTED: u8 = 0x08;

/// Negotiate a SOCKS5 tunnel to `target` over a connected channel.
///
/// The target host is always sent with DOMAIN_NAME addressing so that name
/// resolution happens on the proxy side.
pub(crate) async fn establish<S>(
    stream: &mut S,
    target: &Endpoint,
    username: Option<&str>,
    password: Option<&str>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    // Greeting: offer no-auth and username/password, let the proxy pick.
    stream
        .write_all(&[SOCKS5_VERSION, 2, AUTH_NONE, AUTH_PASSWORD])
        .await?;

    let mut selection = [0u8; 2];
    stream.read_exact(&mut selection).await?;

    if selection[0] != SOCKS5_VERSION {
        return Err(Error::Proxy(format!(
            "invalid SOCKS version from proxy: {}",
            selection[0]
        )));
    }

    match selection[1] {
        AUTH_NONE => {}
        AUTH_PASSWORD => {
            authenticate(stream, username, password).await?;
        }
        AUTH_NO_ACCEPTABLE => {
            return Err(Error::Proxy("no acceptable authentication method".into()));
        }
        other => {
            return Err(Error::Proxy(format!(
                "proxy selected unsupported auth method: {other:#04x}"
            )));
        }
    }

    send_connect(stream, target).await?;
    read_reply(stream).await?;

    trace!("SOCKS5 tunnel to {} open", target);
    Ok(())
}

/// Username/password sub-negotiation (RFC 1929), ISO-8859-1 strings.
async fn authenticate<S>(
    stream: &mut S,
    username: Option<&str>,
    password: Option<&str>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let username = latin1_bytes(username.unwrap_or(""));
    let password = latin1_bytes(password.unwrap_or(""));
    if username.len() > 255 || password.len() > 255 {
        return Err(Error::Proxy("proxy credentials longer than 255 bytes".into()));
    }

    let mut request = Vec::with_capacity(3 + username.len() + password.len());
    request.push(AUTH_VERSION);
    request.push(username.len() as u8);
    request.extend_from_slice(&username);
    request.push(password.len() as u8);
    request.extend_from_slice(&password);
    stream.write_all(&request).await?;

    let mut response = [0u8; 2];
    stream.read_exact(&mut response).await?;
    if response[1] != 0x00 {
        return Err(Error::Proxy(format!(
            "proxy authentication failed with status {}",
            response[1]
        )));
    }
    Ok(())
}

async fn send_connect<S>(stream: &mut S, target: &Endpoint) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let host = target.host().as_bytes();
    if host.len() > 255 {
        return Err(Error::Proxy(format!(
            "target host name too long for SOCKS5: {}",
            target.host()
        )));
    }

    let mut request = Vec::with_capacity(7 + host.len());
    request.extend_from_slice(&[SOCKS5_VERSION, CMD_CONNECT, 0x00, ATYP_DOMAIN]);
    request.push(host.len() as u8);
    request.extend_from_slice(host);
    request.extend_from_slice(&target.port().to_be_bytes());
    stream.write_all(&request).await?;
    Ok(())
}

async fn read_reply<S>(stream: &mut S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await?;

    if reply[0] != SOCKS5_VERSION {
        return Err(Error::Proxy(format!(
            "invalid SOCKS version in reply: {}",
            reply[0]
        )));
    }

    if reply[1] != REP_SUCCESS {
        let message = match reply[1] {
            REP_GENERAL_FAILURE => "general SOCKS server failure",
            REP_NOT_ALLOWED => "connection not allowed by ruleset",
            REP_NETWORK_UNREACHABLE => "network unreachable",
            REP_HOST_UNREACHABLE => "host unreachable",
            REP_CONNECTION_REFUSED => "connection refused",
            REP_TTL_EXPIRED => "TTL expired",
            REP_CMD_NOT_SUPPORTED => "command not supported",
            REP_ATYP_NOT_SUPPORTED => "address type not supported",
            _ => "unknown reply code",
        };
        return Err(Error::Proxy(format!(
            "SOCKS5 connect rejected ({}): {message}",
            reply[1]
        )));
    }

    // The reply carries the bound address; consume it so the stream is
    // positioned at the first tunneled byte.
    match reply[3] {
        ATYP_IPV4 => {
            let mut bound = [0u8; 6];
            stream.read_exact(&mut bound).await?;
        }
        ATYP_IPV6 => {
            let mut bound = [0u8; 18];
            stream.read_exact(&mut bound).await?;
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut bound = vec![0u8; len[0] as usize + 2];
            stream.read_exact(&mut bound).await?;
        }
        other => {
            return Err(Error::Proxy(format!(
                "unsupported bound address type in reply: {other}"
            )));
        }
    }
    Ok(())
}

/// Encode the first 256 Unicode code points directly; anything outside the
/// Latin-1 range becomes `?`, never a multi-byte sequence.
fn latin1_bytes(s: &str) -> Vec<u8> {
    s.chars()
        .map(|c| if (c as u32) <= 0xFF { c as u8 } else { b'?' })
        .collect()
}
