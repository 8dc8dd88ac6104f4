//! Bounded newline framing for IPC sockets.

use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// Result of reading one frame.
#[derive(Debug, PartialEq, Eq)]
pub enum Frame {
    /// A complete line, newline stripped.
    Line(String),
    /// A line longer than the limit; its bytes were discarded up to the newline.
    TooLarge(usize),
    /// The peer closed the connection.
    Eof,
}

/// Read the next newline-terminated frame, never buffering more than `limit`
/// bytes. An oversized line is skipped so the stream stays in sync.
pub async fn read_frame<R>(reader: &mut R, limit: usize) -> std::io::Result<Frame>
where
    R: AsyncBufRead + Unpin,
{
    let mut line: Vec<u8> = Vec::new();
    let mut seen = 0usize;
    let mut oversized = false;

    loop {
        let (used, complete) = {
            let available = reader.fill_buf().await?;
            if available.is_empty() {
                return Ok(match (oversized, line.is_empty()) {
                    (true, _) => Frame::TooLarge(seen),
                    (false, true) => Frame::Eof,
                    (false, false) => Frame::Line(String::from_utf8_lossy(&line).into_owned()),
                });
            }
            let (chunk, used, complete) = match available.iter().position(|b| *b == b'\n') {
                Some(i) => (&available[..i], i + 1, true),
                None => (available, available.len(), false),
            };
            seen += chunk.len();
            if !oversized {
                if line.len() + chunk.len() > limit {
                    oversized = true;
                    line = Vec::new();
                } else {
                    line.extend_from_slice(chunk);
                }
            }
            (used, complete)
        };
        reader.consume(used);

        if complete {
            if oversized {
                return Ok(Frame::TooLarge(seen));
            }
            return Ok(Frame::Line(String::from_utf8_lossy(&line).into_owned()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn test_reads_lines_in_order() {
        let data: &[u8] = b"{\"type\":\"ping\"}\n{\"type\":\"quit\"}\n";
        let mut reader = BufReader::new(data);
        assert_eq!(
            read_frame(&mut reader, 1024).await.unwrap(),
            Frame::Line("{\"type\":\"ping\"}".to_string())
        );
        assert_eq!(
            read_frame(&mut reader, 1024).await.unwrap(),
            Frame::Line("{\"type\":\"quit\"}".to_string())
        );
        assert_eq!(read_frame(&mut reader, 1024).await.unwrap(), Frame::Eof);
    }

    #[tokio::test]
    async fn test_oversized_line_skipped_and_stream_resyncs() {
        let mut data = vec![b'x'; 100];
        data.extend_from_slice(b"\nok\n");
        // Small buffer so the long line spans several fills.
        let mut reader = BufReader::with_capacity(8, data.as_slice());
        assert_eq!(
            read_frame(&mut reader, 16).await.unwrap(),
            Frame::TooLarge(100)
        );
        assert_eq!(
            read_frame(&mut reader, 16).await.unwrap(),
            Frame::Line("ok".to_string())
        );
    }

    #[tokio::test]
    async fn test_trailing_line_without_newline() {
        let data: &[u8] = b"partial";
        let mut reader = BufReader::new(data);
        assert_eq!(
            read_frame(&mut reader, 1024).await.unwrap(),
            Frame::Line("partial".to_string())
        );
        assert_eq!(read_frame(&mut reader, 1024).await.unwrap(), Frame::Eof);
    }

    #[tokio::test]
    async fn test_line_exactly_at_limit_is_kept() {
        let data: &[u8] = b"abcd\n";
        let mut reader = BufReader::new(data);
        assert_eq!(
            read_frame(&mut reader, 4).await.unwrap(),
            Frame::Line("abcd".to_string())
        );
    }
}
