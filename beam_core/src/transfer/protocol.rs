//! `::`-delimited control lines and replies.
//!
//! A connection opens with one control line; for file offers the body
//! follows immediately after the header's second delimiter. Scanning works
//! on raw bytes and only the bounded header prefix is decoded as text.

use super::constants::MAX_HEADER_LEN;
use crate::{BeamError, Result};
use tokio::io::{AsyncRead, AsyncReadExt};

pub const DELIMITER: &[u8] = b"::";

const PAIR_REQUEST: &str = "PAIR_REQUEST";
const PAIR_VERIFY: &str = "PAIR_VERIFY";

const MAX_REPLY_LEN: usize = 64;

/// The first line on a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlLine {
    /// `<fileName>::<fileSize>::`
    FileHeader { file_name: String, file_size: u64 },
    /// `PAIR_REQUEST::<replyPort>::`
    PairRequest { reply_port: u16 },
    /// `PAIR_VERIFY::<code>::<replyPort>::`, port optional
    PairVerify { code: String, reply_port: Option<u16> },
}

impl ControlLine {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            ControlLine::FileHeader {
                file_name,
                file_size,
            } => format!("{}::{}::", file_name, file_size),
            ControlLine::PairRequest { reply_port } => {
                format!("{}::{}::", PAIR_REQUEST, reply_port)
            }
            ControlLine::PairVerify {
                code,
                reply_port: Some(port),
            } => format!("{}::{}::{}::", PAIR_VERIFY, code, port),
            ControlLine::PairVerify {
                code,
                reply_port: None,
            } => format!("{}::{}::", PAIR_VERIFY, code),
        }
        .into_bytes()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderScan {
    /// Need more bytes
    Incomplete,
    /// `header_len` bytes form the control line; anything after is body.
    Complete { line: ControlLine, header_len: usize },
}

fn find_delimiter(buf: &[u8], from: usize) -> Option<usize> {
    if from >= buf.len() {
        return None;
    }
    buf[from..]
        .windows(DELIMITER.len())
        .position(|w| w == DELIMITER)
        .map(|i| from + i)
}

fn field_str(bytes: &[u8]) -> Result<&str> {
    std::str::from_utf8(bytes).map_err(|_| BeamError::protocol("header is not valid UTF-8"))
}

fn parse_number<T: std::str::FromStr>(bytes: &[u8], what: &str) -> Result<T> {
    field_str(bytes)?
        .trim()
        .parse()
        .map_err(|_| BeamError::protocol(format!("invalid {}", what)))
}

/// Look for a complete control line at the start of `buf`.
///
/// `at_eof` tells the scanner no more bytes will come, which turns a
/// missing delimiter into an error and completes a port-less `PAIR_VERIFY`.
pub fn scan_header(buf: &[u8], at_eof: bool) -> Result<HeaderScan> {
    let need_more = || {
        if at_eof {
            Err(BeamError::protocol("connection closed inside header"))
        } else if buf.len() > MAX_HEADER_LEN {
            Err(BeamError::protocol("header too long"))
        } else {
            Ok(HeaderScan::Incomplete)
        }
    };

    let Some(first) = find_delimiter(buf, 0) else {
        return need_more();
    };
    let Some(second) = find_delimiter(buf, first + DELIMITER.len()) else {
        return need_more();
    };
    if second > MAX_HEADER_LEN {
        return Err(BeamError::protocol("header too long"));
    }

    let head = &buf[..first];
    let field = &buf[first + DELIMITER.len()..second];
    let after_second = second + DELIMITER.len();

    if head == PAIR_REQUEST.as_bytes() {
        let reply_port = parse_number(field, "reply port")?;
        return Ok(HeaderScan::Complete {
            line: ControlLine::PairRequest { reply_port },
            header_len: after_second,
        });
    }

    if head == PAIR_VERIFY.as_bytes() {
        let code = field_str(field)?.trim().to_string();
        let rest = &buf[after_second..];

        if let Some(third) = find_delimiter(buf, after_second) {
            let reply_port = parse_number(&buf[after_second..third], "reply port")?;
            return Ok(HeaderScan::Complete {
                line: ControlLine::PairVerify {
                    code,
                    reply_port: Some(reply_port),
                },
                header_len: third + DELIMITER.len(),
            });
        }

        // Still possibly reading the port digits
        let maybe_port = rest.iter().all(|b| b.is_ascii_digit()) && rest.len() <= 5;
        if maybe_port && !at_eof {
            return need_more();
        }
        return Ok(HeaderScan::Complete {
            line: ControlLine::PairVerify {
                code,
                reply_port: None,
            },
            header_len: after_second,
        });
    }

    let file_name = field_str(head)?.to_string();
    let file_size = parse_number(field, "file size")?;
    Ok(HeaderScan::Complete {
        line: ControlLine::FileHeader {
            file_name,
            file_size,
        },
        header_len: after_second,
    })
}

/// Receiver's answer to a control line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Accept,
    Decline,
    PairAck,
    PairFail,
}

impl Reply {
    pub fn encode(self) -> &'static [u8] {
        match self {
            Reply::Accept => b"ACCEPT::",
            Reply::Decline => b"DECLINE::",
            Reply::PairAck => b"PAIR_ACK::",
            Reply::PairFail => b"PAIR_FAIL::",
        }
    }

    fn from_token(token: &[u8]) -> Result<Self> {
        match token {
            b"ACCEPT" => Ok(Reply::Accept),
            b"DECLINE" | b"REJECT" => Ok(Reply::Decline),
            b"PAIR_ACK" => Ok(Reply::PairAck),
            b"PAIR_FAIL" => Ok(Reply::PairFail),
            other => Err(BeamError::protocol(format!(
                "unexpected reply {:?}",
                String::from_utf8_lossy(other)
            ))),
        }
    }
}

/// Read one reply. Bytes after it are discarded; none are expected.
pub async fn read_reply<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Reply> {
    let mut buf = Vec::with_capacity(16);
    let mut chunk = [0u8; MAX_REPLY_LEN];

    loop {
        if let Some(end) = find_delimiter(&buf, 0) {
            return Reply::from_token(&buf[..end]);
        }
        if buf.len() > MAX_REPLY_LEN {
            return Err(BeamError::protocol("reply too long"));
        }

        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(BeamError::protocol("connection closed before reply"));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}
