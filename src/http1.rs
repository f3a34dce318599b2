use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};

use bytes::Bytes;
use http::header::{CONNECTION, CONTENT_LENGTH, HOST, HeaderName, HeaderValue, TRANSFER_ENCODING};
use http::{HeaderMap, Method, StatusCode, Version};

use crate::error::{ConnectErrorKind, Error, ReadErrorKind};
use crate::origin::{Origin, Scheme};
use crate::response::Response;
use crate::transport::{ConnectionConfig, Connector, PreparedRequest, Transport};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

const MAX_RESPONSE_HEADERS: usize = 64;

/// Default [`Connector`]: plain TCP for `http`, rustls-wrapped TCP for
/// `https`, HTTP/1.1 framing on top.
#[derive(Clone, Copy, Debug, Default)]
pub struct Http1Connector;

impl Connector for Http1Connector {
    fn connect(
        &self,
        origin: &Origin,
        config: &ConnectionConfig,
    ) -> Result<Box<dyn Transport>, Error> {
        let tcp = open_tcp(origin, config)?;
        tcp.set_nodelay(true)
            .map_err(|source| connect_error(ConnectErrorKind::Io, origin, source))?;
        tcp.set_read_timeout(config.configured_read_timeout())
            .map_err(|source| connect_error(ConnectErrorKind::Io, origin, source))?;
        tcp.set_write_timeout(config.configured_read_timeout())
            .map_err(|source| connect_error(ConnectErrorKind::Io, origin, source))?;

        let (stream, verified) = match origin.scheme() {
            Scheme::Http => (TransportStream::Plain(tcp), false),
            Scheme::Https => wrap_tls(origin, tcp)?,
        };

        Ok(Box::new(Http1Transport {
            stream,
            origin: origin.clone(),
            blocksize: config.configured_blocksize(),
            verified,
            reusable: true,
            open: true,
            buffer: Vec::new(),
            last_method: None,
            last_uri: origin.to_string(),
        }))
    }
}

fn connect_error(kind: ConnectErrorKind, origin: &Origin, source: impl Into<BoxError>) -> Error {
    Error::Connect {
        kind,
        uri: origin.to_string(),
        source: source.into(),
    }
}

fn open_tcp(origin: &Origin, config: &ConnectionConfig) -> Result<TcpStream, Error> {
    let addresses: Vec<SocketAddr> = (origin.host(), origin.port())
        .to_socket_addrs()
        .map_err(|source| connect_error(ConnectErrorKind::Dns, origin, source))?
        .collect();
    if addresses.is_empty() {
        return Err(connect_error(
            ConnectErrorKind::Dns,
            origin,
            format!("no addresses resolved for {}", origin.authority()),
        ));
    }

    let mut last_error = None;
    for address in addresses {
        match TcpStream::connect_timeout(&address, config.configured_connect_timeout()) {
            Ok(stream) => return Ok(stream),
            Err(source) => last_error = Some(source),
        }
    }
    let source = last_error.unwrap_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::AddrNotAvailable, "connect failed")
    });
    let kind = match source.kind() {
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => ConnectErrorKind::Timeout,
        std::io::ErrorKind::ConnectionRefused => ConnectErrorKind::Refused,
        _ => ConnectErrorKind::Io,
    };
    Err(connect_error(kind, origin, source))
}

#[cfg(feature = "tls-rustls")]
fn wrap_tls(origin: &Origin, mut tcp: TcpStream) -> Result<(TransportStream, bool), Error> {
    use rustls::pki_types::ServerName;

    let server_name = ServerName::try_from(origin.host().to_owned())
        .map_err(|source| connect_error(ConnectErrorKind::Tls, origin, source))?;
    let mut connection = rustls::ClientConnection::new(crate::tls::client_config(), server_name)
        .map_err(|source| connect_error(ConnectErrorKind::Tls, origin, source))?;
    // Drive the handshake to completion so certificate failures surface as
    // connect-phase errors, not mid-request read errors.
    while connection.is_handshaking() {
        connection
            .complete_io(&mut tcp)
            .map_err(|source| connect_error(ConnectErrorKind::Tls, origin, source))?;
    }
    Ok((
        TransportStream::Tls(Box::new(rustls::StreamOwned::new(connection, tcp))),
        true,
    ))
}

#[cfg(not(feature = "tls-rustls"))]
fn wrap_tls(origin: &Origin, tcp: TcpStream) -> Result<(TransportStream, bool), Error> {
    let _ = tcp;
    Err(connect_error(
        ConnectErrorKind::Tls,
        origin,
        "tls support is not compiled into this build (enable the tls-rustls feature)",
    ))
}

enum TransportStream {
    Plain(TcpStream),
    #[cfg(feature = "tls-rustls")]
    Tls(Box<rustls::StreamOwned<rustls::ClientConnection, TcpStream>>),
}

impl TransportStream {
    fn tcp(&self) -> &TcpStream {
        match self {
            Self::Plain(stream) => stream,
            #[cfg(feature = "tls-rustls")]
            Self::Tls(stream) => &stream.sock,
        }
    }
}

impl Read for TransportStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Self::Plain(stream) => stream.read(buf),
            #[cfg(feature = "tls-rustls")]
            Self::Tls(stream) => stream.read(buf),
        }
    }
}

impl Write for TransportStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Self::Plain(stream) => stream.write(buf),
            #[cfg(feature = "tls-rustls")]
            Self::Tls(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Self::Plain(stream) => stream.flush(),
            #[cfg(feature = "tls-rustls")]
            Self::Tls(stream) => stream.flush(),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum BodyMode {
    Empty,
    Length(usize),
    Chunked,
    UntilClose,
}

struct Http1Transport {
    stream: TransportStream,
    origin: Origin,
    blocksize: usize,
    verified: bool,
    reusable: bool,
    open: bool,
    buffer: Vec<u8>,
    last_method: Option<Method>,
    last_uri: String,
}

impl Http1Transport {
    fn read_io_error(&mut self, source: std::io::Error) -> Error {
        self.reusable = false;
        let kind = match source.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => ReadErrorKind::Timeout,
            std::io::ErrorKind::UnexpectedEof => ReadErrorKind::Truncated,
            _ => ReadErrorKind::Io,
        };
        self.read_error(kind, source)
    }

    fn read_error(&mut self, kind: ReadErrorKind, source: impl Into<BoxError>) -> Error {
        self.reusable = false;
        Error::Read {
            kind,
            method: self.last_method.clone().unwrap_or(Method::GET),
            uri: self.last_uri.clone(),
            source: source.into(),
        }
    }

    fn fill_buffer(&mut self) -> Result<usize, Error> {
        let mut chunk = vec![0_u8; self.blocksize];
        let read = self
            .stream
            .read(&mut chunk)
            .map_err(|source| self.read_io_error(source))?;
        self.buffer.extend_from_slice(&chunk[..read]);
        Ok(read)
    }

    fn read_head(&mut self) -> Result<(usize, StatusCode, Version, HeaderMap), Error> {
        loop {
            if !self.buffer.is_empty() {
                match parse_response_head(&self.buffer) {
                    Ok(Some(head)) => {
                        let status = StatusCode::from_u16(head.code).map_err(|source| {
                            self.read_error(ReadErrorKind::Protocol, source)
                        })?;
                        let version = match head.minor_version {
                            0 => Version::HTTP_10,
                            _ => Version::HTTP_11,
                        };
                        let mut headers = HeaderMap::with_capacity(head.raw_headers.len());
                        for (name, value) in head.raw_headers {
                            let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
                                return Err(self.read_error(
                                    ReadErrorKind::Protocol,
                                    format!("invalid header name {name:?}"),
                                ));
                            };
                            let Ok(value) = HeaderValue::from_bytes(&value) else {
                                return Err(self.read_error(
                                    ReadErrorKind::Protocol,
                                    format!("invalid value for header {name}"),
                                ));
                            };
                            headers.append(name, value);
                        }
                        return Ok((head.head_len, status, version, headers));
                    }
                    Ok(None) => {}
                    Err(message) => {
                        return Err(self.read_error(ReadErrorKind::Protocol, message));
                    }
                }
            }
            if self.fill_buffer()? == 0 {
                return Err(self.read_error(
                    ReadErrorKind::Truncated,
                    "connection closed before response head was complete",
                ));
            }
        }
    }

    fn take_buffered(&mut self, wanted: usize) -> Vec<u8> {
        let take = wanted.min(self.buffer.len());
        self.buffer.drain(..take).collect()
    }

    fn read_body_exact(&mut self, length: usize) -> Result<Vec<u8>, Error> {
        let mut body = self.take_buffered(length);
        while body.len() < length {
            if self.fill_buffer()? == 0 {
                return Err(self.read_error(
                    ReadErrorKind::Truncated,
                    format!("connection closed with {}/{length} body bytes", body.len()),
                ));
            }
            let remaining = length - body.len();
            body.extend(self.take_buffered(remaining));
        }
        Ok(body)
    }

    fn read_line(&mut self) -> Result<String, Error> {
        loop {
            if let Some(position) = self
                .buffer
                .windows(2)
                .position(|window| window == b"\r\n")
            {
                let line: Vec<u8> = self.buffer.drain(..position + 2).collect();
                return Ok(String::from_utf8_lossy(&line[..position]).into_owned());
            }
            if self.fill_buffer()? == 0 {
                return Err(self.read_error(
                    ReadErrorKind::Truncated,
                    "connection closed inside chunked framing",
                ));
            }
        }
    }

    fn read_body_chunked(&mut self) -> Result<Vec<u8>, Error> {
        let mut body = Vec::new();
        loop {
            let size_line = self.read_line()?;
            let size_text = size_line.split(';').next().unwrap_or("").trim();
            let size = usize::from_str_radix(size_text, 16).map_err(|_| {
                self.read_error(
                    ReadErrorKind::Protocol,
                    format!("invalid chunk size line {size_line:?}"),
                )
            })?;
            if size == 0 {
                // Trailer section runs until an empty line.
                loop {
                    if self.read_line()?.is_empty() {
                        break;
                    }
                }
                return Ok(body);
            }
            body.extend(self.read_body_exact(size)?);
            let terminator = self.read_body_exact(2)?;
            if terminator != b"\r\n" {
                return Err(
                    self.read_error(ReadErrorKind::Protocol, "chunk data missing crlf terminator")
                );
            }
        }
    }

    fn read_body_until_close(&mut self) -> Result<Vec<u8>, Error> {
        let mut body = std::mem::take(&mut self.buffer);
        let mut chunk = vec![0_u8; self.blocksize];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => break,
                Ok(read) => body.extend_from_slice(&chunk[..read]),
                Err(source) => return Err(self.read_io_error(source)),
            }
        }
        Ok(body)
    }
}

impl Transport for Http1Transport {
    fn send(&mut self, request: &PreparedRequest) -> Result<(), Error> {
        self.last_method = Some(request.method.clone());
        self.last_uri = request.uri.to_string();

        let head = encode_request_head(&self.origin, request);
        if let Err(source) = self
            .stream
            .write_all(&head)
            .and_then(|()| self.stream.write_all(&request.body))
            .and_then(|()| self.stream.flush())
        {
            return Err(self.read_io_error(source));
        }
        Ok(())
    }

    fn receive(&mut self) -> Result<Response, Error> {
        let (head_len, status, version, headers) = self.read_head()?;
        self.buffer.drain(..head_len);

        let head_request = self.last_method.as_ref() == Some(&Method::HEAD);
        let body_mode = response_body_mode(head_request, status, &headers)
            .map_err(|message| self.read_error(ReadErrorKind::Protocol, message))?;
        let body = match body_mode {
            BodyMode::Empty => Vec::new(),
            BodyMode::Length(length) => self.read_body_exact(length)?,
            BodyMode::Chunked => self.read_body_chunked()?,
            BodyMode::UntilClose => self.read_body_until_close()?,
        };

        self.reusable = body_mode != BodyMode::UntilClose
            && if version == Version::HTTP_11 {
                !header_has_token(&headers, &CONNECTION, "close")
            } else if version == Version::HTTP_10 {
                header_has_token(&headers, &CONNECTION, "keep-alive")
            } else {
                false
            };

        Ok(Response::new(status, version, headers, Bytes::from(body)))
    }

    fn is_reusable(&self) -> bool {
        self.open && self.reusable
    }

    fn probe_alive(&mut self) -> bool {
        if !self.open {
            return false;
        }
        // Leftover bytes from a previous exchange mean the framing is out of
        // sync; treat the connection as unusable.
        if !self.buffer.is_empty() {
            return false;
        }
        let tcp = self.stream.tcp();
        if tcp.set_nonblocking(true).is_err() {
            return false;
        }
        let mut probe = [0_u8; 1];
        // Any readable byte on an idle connection is either a close or
        // unsolicited data; both mean the connection must not be reused.
        let alive = matches!(
            tcp.peek(&mut probe),
            Err(ref error) if error.kind() == std::io::ErrorKind::WouldBlock
        );
        if tcp.set_nonblocking(false).is_err() {
            return false;
        }
        alive
    }

    fn verified(&self) -> bool {
        self.verified
    }

    fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        self.reusable = false;
        let _ = self.stream.tcp().shutdown(Shutdown::Both);
    }
}

struct ParsedHead {
    head_len: usize,
    code: u16,
    minor_version: u8,
    raw_headers: Vec<(String, Vec<u8>)>,
}

/// Owned snapshot of an httparse result: `Ok(None)` means the head is not yet
/// complete and more bytes are needed.
fn parse_response_head(buffer: &[u8]) -> Result<Option<ParsedHead>, String> {
    let mut header_storage = [httparse::EMPTY_HEADER; MAX_RESPONSE_HEADERS];
    let mut parsed = httparse::Response::new(&mut header_storage);
    match parsed.parse(buffer) {
        Ok(httparse::Status::Complete(head_len)) => {
            let code = parsed.code.ok_or_else(|| "missing status code".to_owned())?;
            let minor_version = parsed.version.unwrap_or(1);
            let raw_headers = parsed
                .headers
                .iter()
                .map(|header| (header.name.to_owned(), header.value.to_vec()))
                .collect();
            Ok(Some(ParsedHead {
                head_len,
                code,
                minor_version,
                raw_headers,
            }))
        }
        Ok(httparse::Status::Partial) => Ok(None),
        Err(source) => Err(source.to_string()),
    }
}

fn response_body_mode(
    head_request: bool,
    status: StatusCode,
    headers: &HeaderMap,
) -> Result<BodyMode, String> {
    if head_request
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
    {
        return Ok(BodyMode::Empty);
    }
    if header_has_token(headers, &TRANSFER_ENCODING, "chunked") {
        return Ok(BodyMode::Chunked);
    }
    if let Some(value) = headers.get(CONTENT_LENGTH) {
        let length = value
            .to_str()
            .ok()
            .and_then(|text| text.trim().parse::<usize>().ok())
            .ok_or_else(|| format!("invalid content-length {value:?}"))?;
        return Ok(BodyMode::Length(length));
    }
    Ok(BodyMode::UntilClose)
}

fn header_has_token(headers: &HeaderMap, name: &HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|item| item.trim().eq_ignore_ascii_case(token))
}

fn encode_request_head(origin: &Origin, request: &PreparedRequest) -> Vec<u8> {
    let target = request
        .uri
        .path_and_query()
        .map(|path_and_query| path_and_query.as_str())
        .unwrap_or("/");

    let mut head = Vec::with_capacity(256);
    head.extend_from_slice(request.method.as_str().as_bytes());
    head.extend_from_slice(b" ");
    head.extend_from_slice(target.as_bytes());
    head.extend_from_slice(b" HTTP/1.1\r\n");

    if !request.headers.contains_key(HOST) {
        head.extend_from_slice(b"host: ");
        head.extend_from_slice(origin.host_header_value().as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    for (name, value) in &request.headers {
        head.extend_from_slice(name.as_str().as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    let needs_content_length = !request.headers.contains_key(CONTENT_LENGTH)
        && (!request.body.is_empty()
            || matches!(request.method, Method::POST | Method::PUT | Method::PATCH));
    if needs_content_length {
        head.extend_from_slice(format!("content-length: {}\r\n", request.body.len()).as_bytes());
    }
    head.extend_from_slice(b"\r\n");
    head
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use http::header::{CONNECTION, CONTENT_LENGTH, HeaderValue};
    use http::{HeaderMap, Method, StatusCode, Uri};

    use super::{BodyMode, encode_request_head, header_has_token, response_body_mode};
    use crate::origin::{Origin, Scheme};
    use crate::transport::PreparedRequest;

    fn prepared(method: Method, uri: &str, body: &'static [u8]) -> PreparedRequest {
        PreparedRequest::new(
            method,
            uri.parse::<Uri>().expect("uri should parse"),
            HeaderMap::new(),
            Bytes::from_static(body),
        )
    }

    #[test]
    fn encode_request_head_includes_host_and_target() {
        let origin = Origin::new(Scheme::Http, "api.example.com", 80);
        let request = prepared(Method::GET, "http://api.example.com/v1/items?page=2", b"");
        let head = String::from_utf8(encode_request_head(&origin, &request))
            .expect("head should be utf-8");
        assert!(head.starts_with("GET /v1/items?page=2 HTTP/1.1\r\n"));
        assert!(head.contains("host: api.example.com\r\n"));
        assert!(!head.contains("content-length"));
        assert!(head.ends_with("\r\n\r\n"));
    }

    #[test]
    fn encode_request_head_adds_content_length_for_post() {
        let origin = Origin::new(Scheme::Http, "api.example.com", 8080);
        let request = prepared(Method::POST, "http://api.example.com:8080/v1/items", b"{}");
        let head = String::from_utf8(encode_request_head(&origin, &request))
            .expect("head should be utf-8");
        assert!(head.contains("host: api.example.com:8080\r\n"));
        assert!(head.contains("content-length: 2\r\n"));
    }

    #[test]
    fn response_body_mode_prefers_chunked_over_content_length() {
        let mut headers = HeaderMap::new();
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("10"));
        let mode = response_body_mode(false, StatusCode::OK, &headers)
            .expect("body mode should resolve");
        assert!(mode == BodyMode::Chunked);
    }

    #[test]
    fn response_body_mode_is_empty_for_head_and_no_content() {
        let headers = HeaderMap::new();
        assert!(
            response_body_mode(true, StatusCode::OK, &headers).expect("head request")
                == BodyMode::Empty
        );
        assert!(
            response_body_mode(false, StatusCode::NO_CONTENT, &headers).expect("204")
                == BodyMode::Empty
        );
    }

    #[test]
    fn header_has_token_matches_list_values_case_insensitively() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("Keep-Alive, Close"));
        assert!(header_has_token(&headers, &CONNECTION, "close"));
        assert!(header_has_token(&headers, &CONNECTION, "keep-alive"));
        assert!(!header_has_token(&headers, &CONNECTION, "upgrade"));
    }
}
