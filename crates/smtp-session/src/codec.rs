//! Byte-level framing of SMTP responses and outbound content.
use crate::error::SessionError;
use crate::response::{Response, ResponseBuilder, ResponseLine};
use tokio::io::{AsyncRead, AsyncReadExt};

pub(crate) const MAX_LINE_LEN: usize = 4096;

/// Terminator line written after a content payload. Content is
/// expected to arrive pre-encoded (CRLF normalized and dot-stuffed)
/// and ending with CRLF.
pub(crate) const END_OF_CONTENT: &[u8] = b".\r\n";

/// Frames CRLF-delimited response lines out of a growable read buffer
/// and assembles complete (possibly multi-line) responses.
#[derive(Debug)]
pub(crate) struct ResponseReader {
    connection_id: String,
    buffer: Vec<u8>,
}

impl ResponseReader {
    pub fn new(connection_id: String) -> Self {
        Self {
            connection_id,
            buffer: Vec::with_capacity(1024),
        }
    }

    /// Read one complete response. `Ok(None)` means the peer closed
    /// the connection.
    pub async fn read_response<R>(&mut self, stream: &mut R) -> Result<Option<Response>, SessionError>
    where
        R: AsyncRead + Unpin,
    {
        let Some(mut line) = self.read_line(stream).await? else {
            return Ok(None);
        };
        tracing::trace!("[{}] recv<- {line}", self.connection_id);

        let mut parsed = parse_response_line(&line)?;
        let mut builder = ResponseBuilder::new(&parsed);

        while !parsed.is_final {
            line = match self.read_line(stream).await? {
                Some(next) => next,
                None => return Ok(None),
            };
            tracing::trace!("[{}] recv<- {line}", self.connection_id);
            parsed = parse_response_line(&line)?;
            builder
                .add_line(&parsed)
                .map_err(SessionError::MalformedResponseLine)?;
        }

        Ok(Some(builder.build()))
    }

    async fn read_line<R>(&mut self, stream: &mut R) -> Result<Option<String>, SessionError>
    where
        R: AsyncRead + Unpin,
    {
        let mut too_long = false;
        loop {
            if let Some(i) = find_crlf(&self.buffer) {
                if too_long {
                    self.buffer.drain(0..i + 2);
                    return Err(SessionError::ResponseTooLong);
                }

                let line = String::from_utf8(self.buffer[0..i].to_vec());
                self.buffer.drain(0..i + 2);
                return Ok(Some(line?));
            }
            if self.buffer.len() > MAX_LINE_LEN {
                self.buffer.clear();
                too_long = true;
            }

            // Didn't find a complete line, fill up the rest of the buffer
            let mut data = [0u8; MAX_LINE_LEN];
            let size = stream
                .read(&mut data)
                .await
                .map_err(|err| SessionError::ReadError {
                    connection_id: self.connection_id.clone(),
                    error: format!("{err:#}"),
                })?;
            if size == 0 {
                if !self.buffer.is_empty() {
                    tracing::debug!(
                        "[{}] Discarding {} buffered bytes of a partial line at connection close",
                        self.connection_id,
                        self.buffer.len()
                    );
                }
                return Ok(None);
            }
            self.buffer.extend_from_slice(&data[0..size]);
        }
    }
}

fn find_crlf(buffer: &[u8]) -> Option<usize> {
    let mut start = 0;
    while let Some(offset) = memchr::memchr(b'\r', &buffer[start..]) {
        let i = start + offset;
        match buffer.get(i + 1) {
            Some(b'\n') => return Some(i),
            Some(_) => start = i + 1,
            None => return None,
        }
    }
    None
}

pub(crate) fn parse_response_line(line: &str) -> Result<ResponseLine, SessionError> {
    if line.len() < 4 {
        return Err(SessionError::MalformedResponseLine(line.to_string()));
    }

    match line.as_bytes()[3] {
        b' ' | b'-' => match line[0..3].parse::<u16>() {
            Ok(code) => Ok(ResponseLine {
                code,
                is_final: line.as_bytes()[3] == b' ',
                content: &line[4..],
            }),
            Err(_) => Err(SessionError::MalformedResponseLine(line.to_string())),
        },
        _ => Err(SessionError::MalformedResponseLine(line.to_string())),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::response::EnhancedStatusCode;

    #[test]
    fn response_line_parsing() {
        assert_eq!(
            parse_response_line("220 woot").unwrap(),
            ResponseLine {
                code: 220,
                is_final: true,
                content: "woot"
            }
        );
        assert_eq!(
            parse_response_line("220-woot").unwrap(),
            ResponseLine {
                code: 220,
                is_final: false,
                content: "woot"
            }
        );

        assert!(matches!(
            parse_response_line("220_woot"),
            Err(SessionError::MalformedResponseLine(_))
        ));
        assert!(matches!(
            parse_response_line("not really"),
            Err(SessionError::MalformedResponseLine(_))
        ));
        assert!(matches!(
            parse_response_line("250"),
            Err(SessionError::MalformedResponseLine(_))
        ));
    }

    #[tokio::test]
    async fn reads_a_single_line_response() {
        let mut input: &[u8] = b"250 OK\r\n";
        let mut reader = ResponseReader::new("test".to_string());

        let response = reader.read_response(&mut input).await.unwrap().unwrap();
        assert_eq!(response.code, 250);
        assert_eq!(response.content, "OK");

        assert!(reader.read_response(&mut input).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reads_a_multi_line_response() {
        let mut input: &[u8] =
            b"250-smtp.example.com greets you\r\n250-PIPELINING\r\n250 SIZE 1000000\r\n";
        let mut reader = ResponseReader::new("test".to_string());

        let response = reader.read_response(&mut input).await.unwrap().unwrap();
        assert_eq!(response.code, 250);
        assert_eq!(
            response.content,
            "smtp.example.com greets you\nPIPELINING\nSIZE 1000000"
        );
    }

    #[tokio::test]
    async fn strips_repeated_enhanced_codes() {
        let mut input: &[u8] = b"250-2.1.0 first\r\n250 2.1.0 second\r\n";
        let mut reader = ResponseReader::new("test".to_string());

        let response = reader.read_response(&mut input).await.unwrap().unwrap();
        assert_eq!(
            response.enhanced_code,
            Some(EnhancedStatusCode {
                class: 2,
                subject: 1,
                detail: 0
            })
        );
        assert_eq!(response.content, "first\nsecond");
    }

    #[tokio::test]
    async fn rejects_mismatched_multi_line_codes() {
        let mut input: &[u8] = b"250-first\r\n221 second\r\n";
        let mut reader = ResponseReader::new("test".to_string());

        let err = reader.read_response(&mut input).await.unwrap_err();
        assert!(
            matches!(err, SessionError::MalformedResponseLine(ref line) if line == "221 second"),
            "got error {err:?}"
        );
    }

    #[tokio::test]
    async fn rejects_over_long_lines() {
        let mut input = vec![b'x'; MAX_LINE_LEN * 3];
        input.extend_from_slice(b"\r\n250 OK\r\n");
        let mut input: &[u8] = &input;
        let mut reader = ResponseReader::new("test".to_string());

        let err = reader.read_response(&mut input).await.unwrap_err();
        assert!(matches!(err, SessionError::ResponseTooLong), "got {err:?}");

        // The over-long line is discarded; the next one parses fine
        let response = reader.read_response(&mut input).await.unwrap().unwrap();
        assert_eq!(response.code, 250);
    }

    #[tokio::test]
    async fn tolerates_bare_carriage_returns_inside_a_line() {
        let mut input: &[u8] = b"250 a\rb\r\n";
        let mut reader = ResponseReader::new("test".to_string());

        let response = reader.read_response(&mut input).await.unwrap().unwrap();
        assert_eq!(response.content, "a\rb");
    }

    #[tokio::test]
    async fn eof_mid_response_reports_closed() {
        let mut input: &[u8] = b"250-first\r\n";
        let mut reader = ResponseReader::new("test".to_string());

        assert!(reader.read_response(&mut input).await.unwrap().is_none());
    }
}
