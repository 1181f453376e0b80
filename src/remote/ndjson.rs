use futures::{Stream, StreamExt};
use serde::de::DeserializeOwned;

use crate::error::SessionError;

/// Split a chunked byte stream into newline-delimited lines. Blank lines are
/// keep-alives and are skipped; a trailing line without a newline is still
/// yielded when the stream ends.
pub fn lines<S, B, E>(chunks: S) -> impl Stream<Item = Result<String, SessionError>> + Send
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send,
    E: std::error::Error + Send + Sync + 'static,
{
    async_stream::try_stream! {
        let mut chunks = Box::pin(chunks);
        let mut buffer: Vec<u8> = Vec::new();

        while let Some(chunk) = chunks.next().await {
            let chunk = chunk.map_err(|err| SessionError::connection_from("stream read failed", err))?;
            buffer.extend_from_slice(chunk.as_ref());

            while let Some(newline) = buffer.iter().position(|byte| *byte == b'\n') {
                let line: Vec<u8> = buffer.drain(..=newline).collect();
                if let Some(text) = decode_line(&line)? {
                    yield text;
                }
            }
        }

        if let Some(text) = decode_line(&buffer)? {
            yield text;
        }
    }
}

fn decode_line(raw: &[u8]) -> Result<Option<String>, SessionError> {
    let text = std::str::from_utf8(raw)
        .map_err(|err| SessionError::Protocol(format!("stream is not utf-8: {err}")))?
        .trim();
    Ok((!text.is_empty()).then(|| text.to_string()))
}

pub fn decode<T: DeserializeOwned>(line: &str) -> Result<T, SessionError> {
    serde_json::from_str(line)
        .map_err(|err| SessionError::Protocol(format!("cannot decode {line:?}: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use std::io;

    async fn collect(chunks: Vec<Result<&'static [u8], io::Error>>) -> Vec<Result<String, SessionError>> {
        lines(stream::iter(chunks)).collect().await
    }

    #[tokio::test]
    async fn reassembles_lines_across_chunks() {
        let out = collect(vec![
            Ok(b"{\"a\":1}\n{\"b\"".as_slice()),
            Ok(b":2}\n\n".as_slice()),
            Ok(b"\n{\"c\":3}".as_slice()),
        ])
        .await;

        let out: Vec<String> = out.into_iter().map(Result::unwrap).collect();
        assert_eq!(out, vec![r#"{"a":1}"#, r#"{"b":2}"#, r#"{"c":3}"#]);
    }

    #[tokio::test]
    async fn read_errors_end_the_stream_as_connection_errors() {
        let out = collect(vec![
            Ok(b"{\"a\":1}\n".as_slice()),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")),
            Ok(b"{\"never\":true}\n".as_slice()),
        ])
        .await;

        assert_eq!(out.len(), 2);
        assert!(out[0].is_ok());
        assert!(matches!(&out[1], Err(err) if err.is_retriable()));
    }

    #[test]
    fn decode_reports_protocol_errors() {
        let err = decode::<serde_json::Value>("{not json").unwrap_err();
        assert!(matches!(err, SessionError::Protocol(_)));
        assert!(!err.is_retriable());
    }
}
