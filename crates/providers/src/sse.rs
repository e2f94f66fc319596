//! Shared SSE plumbing for streaming chat adapters.
//!
//! The adapter receives a `reqwest::Response`, buffers body chunks, splits on
//! the `\n\n` event delimiter, extracts `data:` payloads, and feeds each
//! payload to a vendor-specific parser returning zero or more stream events.

use crate::retry::from_reqwest;
use vx_domain::error::Result;
use vx_domain::stream::{BoxStream, StreamEvent};

/// Pull complete `data:` payloads out of an SSE buffer.
///
/// The buffer is drained in place; a trailing partial event stays buffered
/// for the next call. Non-`data:` lines (`event:`, `id:`, `retry:`) are
/// ignored.
pub(crate) fn drain_data_lines(buffer: &mut String) -> Vec<String> {
    let mut payloads = Vec::new();

    while let Some(pos) = buffer.find("\n\n") {
        let block: String = buffer.drain(..pos).collect();
        buffer.drain(..2);

        for line in block.lines() {
            if let Some(data) = line.trim().strip_prefix("data:") {
                let data = data.trim();
                if !data.is_empty() {
                    payloads.push(data.to_string());
                }
            }
        }
    }

    payloads
}

/// Build a [`BoxStream`] of [`StreamEvent`]s from an SSE response and a
/// vendor-specific parser closure.
///
/// The closure is `FnMut` because adapters keep mutable assembly state across
/// payloads (tool-call aggregation). The stream flushes any partial trailing
/// event when the body closes and guarantees a `Done` event is emitted even
/// if the vendor never sent a finish marker.
pub(crate) fn sse_event_stream<F>(
    response: reqwest::Response,
    mut parse_data: F,
) -> BoxStream<'static, Result<StreamEvent>>
where
    F: FnMut(&str) -> Vec<Result<StreamEvent>> + Send + 'static,
{
    let stream = async_stream::stream! {
        let mut response = response;
        let mut buffer = String::new();
        let mut done_emitted = false;

        loop {
            match response.chunk().await {
                Ok(Some(bytes)) => {
                    buffer.push_str(&String::from_utf8_lossy(&bytes));
                    for data in drain_data_lines(&mut buffer) {
                        for event in parse_data(&data) {
                            if matches!(&event, Ok(StreamEvent::Done { .. })) {
                                done_emitted = true;
                            }
                            yield event;
                        }
                    }
                }
                Ok(None) => {
                    if !buffer.trim().is_empty() {
                        buffer.push_str("\n\n");
                        for data in drain_data_lines(&mut buffer) {
                            for event in parse_data(&data) {
                                if matches!(&event, Ok(StreamEvent::Done { .. })) {
                                    done_emitted = true;
                                }
                                yield event;
                            }
                        }
                    }
                    break;
                }
                Err(e) => {
                    yield Err(from_reqwest("llm", e));
                    break;
                }
            }
        }

        if !done_emitted {
            yield Ok(StreamEvent::Done {
                usage: None,
                finish_reason: Some("stop".into()),
            });
        }
    };

    Box::pin(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_complete_event() {
        let mut buf = String::from("event: message\ndata: {\"a\":1}\n\n");
        assert_eq!(drain_data_lines(&mut buf), vec!["{\"a\":1}"]);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_event_stays_buffered() {
        let mut buf = String::from("data: whole\n\ndata: par");
        assert_eq!(drain_data_lines(&mut buf), vec!["whole"]);
        assert_eq!(buf, "data: par");
    }

    #[test]
    fn multiple_events_in_one_chunk() {
        let mut buf = String::from("data: one\n\ndata: two\n\ndata: [DONE]\n\n");
        assert_eq!(drain_data_lines(&mut buf), vec!["one", "two", "[DONE]"]);
    }

    #[test]
    fn ignores_metadata_lines_and_empty_data() {
        let mut buf = String::from("id: 3\nretry: 100\ndata: \n\nevent: ping\ndata: x\n\n");
        assert_eq!(drain_data_lines(&mut buf), vec!["x"]);
    }

    #[test]
    fn incremental_append_completes_event() {
        let mut buf = String::from("data: first-ha");
        assert!(drain_data_lines(&mut buf).is_empty());
        buf.push_str("lf\n\n");
        assert_eq!(drain_data_lines(&mut buf), vec!["first-half"]);
    }
}
