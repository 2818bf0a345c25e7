use futures::StreamExt;
use lookout_core::LogLine;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Split a byte stream into lines and forward them to `tx`.
///
/// Stops when the stream ends or errors, or when the receiver is dropped.
/// A trailing partial line is flushed at the end.
pub async fn pump_lines<S, E>(stream: S, tx: mpsc::Sender<LogLine>, ctx: Option<&str>)
where
    S: futures::Stream<Item = Result<bytes::Bytes, E>>,
    E: std::fmt::Display,
{
    let stream = stream.fuse();
    futures::pin_mut!(stream);
    let mut buf = bytes::BytesMut::new();
    'outer: loop {
        tokio::select! {
            _ = tx.closed() => {
                debug!(ctx = ctx.unwrap_or("-"), "log reader went away");
                break;
            }
            next = stream.next() => match next {
                Some(Ok(chunk)) => {
                    buf.extend_from_slice(&chunk);
                    while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                        let line = buf.split_to(pos);
                        let _ = buf.split_to(1);
                        if tx.send(to_line(&line)).await.is_err() {
                            break 'outer;
                        }
                    }
                }
                Some(Err(e)) => {
                    warn!(ctx = ctx.unwrap_or("-"), error = %e, "log stream error");
                    break;
                }
                None => break,
            },
        }
    }
    if !buf.is_empty() {
        let _ = tx.send(to_line(&buf)).await;
    }
    debug!(ctx = ctx.unwrap_or("-"), "log pump ended");
}

fn to_line(raw: &[u8]) -> LogLine {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    LogLine::stdout(String::from_utf8_lossy(raw).into_owned())
}
