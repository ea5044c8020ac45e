use futures::{stream, Stream, StreamExt};
use hyper::body::Bytes;

struct Framer<S> {
    body: S,
    buffer: Vec<u8>,
    done: bool,
}

impl<S> Framer<S> {
    fn next_line(&mut self) -> Option<Bytes> {
        while let Some(position) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=position).collect();
            line.pop();

            if line.last() == Some(&b'\r') {
                line.pop();
            }

            if !line.iter().all(u8::is_ascii_whitespace) {
                return Some(Bytes::from(line));
            }
        }

        None
    }

    fn remainder(&mut self) -> Option<Bytes> {
        let line = std::mem::take(&mut self.buffer);

        if line.iter().all(u8::is_ascii_whitespace) {
            None
        } else {
            Some(Bytes::from(line))
        }
    }
}

/// Splits a chunked body into newline separated lines, skipping empty ones
///
/// Chunk boundaries are arbitrary, thus lines are buffered until their terminating newline arrives.
/// A trailing line without newline is emitted when the body ends. The stream ends after the first error.
pub fn frame_lines<S, E>(body: S) -> impl Stream<Item = Result<Bytes, E>>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    let framer = Framer {
        body,
        buffer: Vec::new(),
        done: false,
    };

    stream::unfold(framer, |mut framer| async move {
        loop {
            if let Some(line) = framer.next_line() {
                return Some((Ok(line), framer));
            }

            if framer.done {
                return framer.remainder().map(|line| (Ok(line), framer));
            }

            match framer.body.next().await {
                Some(Ok(chunk)) => framer.buffer.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    framer.buffer.clear();
                    framer.done = true;
                    return Some((Err(e), framer));
                }
                None => framer.done = true,
            }
        }
    })
}

#[cfg(test)]
mod does {
    use super::*;
    use pretty_assertions::assert_eq;

    async fn collect(chunks: Vec<Result<&'static str, &'static str>>) -> Vec<Result<String, &'static str>> {
        let body = stream::iter(
            chunks
                .into_iter()
                .map(|chunk| chunk.map(|s| Bytes::from_static(s.as_bytes()))),
        );

        frame_lines(body)
            .map(|line| line.map(|l| String::from_utf8_lossy(&l).into_owned()))
            .collect()
            .await
    }

    #[tokio::test]
    async fn reassemble_lines_across_chunks() {
        let lines = collect(vec![Ok("{\"a\":"), Ok("1}\n{\"b\""), Ok(":2}\n")]).await;

        assert_eq!(lines, vec![Ok("{\"a\":1}".to_owned()), Ok("{\"b\":2}".to_owned())]);
    }

    #[tokio::test]
    async fn skip_empty_lines() {
        let lines = collect(vec![Ok("\n\r\n1\n\n2")]).await;

        assert_eq!(lines, vec![Ok("1".to_owned()), Ok("2".to_owned())]);
    }

    #[tokio::test]
    async fn end_after_errors() {
        let lines = collect(vec![Ok("1\n2"), Err("reset"), Ok("3\n")]).await;

        assert_eq!(lines, vec![Ok("1".to_owned()), Err("reset")]);
    }
}
