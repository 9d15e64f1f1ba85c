//! Client channels over a byte stream.
//!
//! The client speaks [`ChannelMessage`] envelopes as length-prefixed JSON
//! frames. `notebookd` runs this over stdin/stdout. Inbound frames are read
//! with the control size limit; outbound frames may carry large gateway
//! output.

use std::future::Future;

use kernel_ipc::framing::send_frame_with_limit;
use kernel_ipc::{
    recv_json_control_frame, ChannelMessage, FrameError, KernelProcessMessage, MAX_FRAME_SIZE,
};
use log::{error, info, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::relay::Orchestrator;
use crate::shutdown::{ProcessTree, TerminationOutcome};
use crate::state::client_event;

/// Run `orchestrator` with its client on the other end of `reader`/`writer`.
///
/// EOF on `reader` counts as a shutdown request. Returns once the gateway
/// tree is gone and every outbound frame has been written.
pub async fn serve<T, R, W, F>(
    orchestrator: Orchestrator<T>,
    mut reader: R,
    mut writer: W,
    shutdown: F,
) -> anyhow::Result<TerminationOutcome>
where
    T: ProcessTree,
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
    F: Future<Output = ()>,
{
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ChannelMessage>();

    let reader_task = tokio::spawn(async move {
        loop {
            match recv_json_control_frame::<_, ChannelMessage>(&mut reader).await {
                Ok(Some(message)) => {
                    if let Some(event) = client_event(message) {
                        if inbound_tx.send(event).is_err() {
                            break;
                        }
                    }
                }
                Ok(None) => {
                    info!("[orchestrator] Client closed its channel");
                    break;
                }
                // The frame was consumed whole, so the stream is still aligned.
                Err(FrameError::Json(e)) => {
                    warn!("[orchestrator] Dropping malformed frame: {}", e)
                }
                Err(e) => {
                    error!("[orchestrator] Client channel failed: {}", e);
                    break;
                }
            }
        }
    });

    let writer_task = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            match write_message(&mut writer, &message, MAX_FRAME_SIZE).await {
                Ok(()) => {}
                Err(FrameError::Io(e)) => {
                    error!("[orchestrator] Client channel closed: {}", e);
                    break;
                }
                // Nothing was written for this message; later ones still go out.
                Err(e) => error!(
                    "[orchestrator] Dropping {} frame: {}",
                    message.channel(),
                    e
                ),
            }
        }
    });

    let result = orchestrator.run(inbound_rx, outbound_tx, shutdown).await;
    let _ = writer_task.await;
    reader_task.abort();
    Ok(result?)
}

/// Write one envelope. A stdout line too large for one frame is sent as
/// consecutive stdout messages whose text concatenates to the original line.
async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &ChannelMessage,
    max_size: usize,
) -> Result<(), FrameError> {
    let data = serde_json::to_vec(message)?;
    let err = match send_frame_with_limit(writer, &data, max_size).await {
        Err(err @ FrameError::TooLarge { .. }) => err,
        other => return other,
    };
    let ChannelMessage::KernelProcess(KernelProcessMessage::Stdout { message: line }) = message
    else {
        return Err(err);
    };

    // JSON escaping can grow text up to six times (`\u0000`).
    let piece_size = (max_size / 8).max(1);
    let pieces = split_at_char_boundaries(line, piece_size);
    warn!(
        "[orchestrator] Splitting {}-byte stdout line into {} frames",
        line.len(),
        pieces.len()
    );
    for piece in pieces {
        let part = ChannelMessage::from(KernelProcessMessage::stdout(piece));
        let data = serde_json::to_vec(&part)?;
        send_frame_with_limit(writer, &data, max_size).await?;
    }
    Ok(())
}

/// Split `text` into pieces of at most `max_bytes`, never inside a character.
/// A single character wider than `max_bytes` becomes its own piece.
fn split_at_char_boundaries(text: &str, max_bytes: usize) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut rest = text;
    while rest.len() > max_bytes {
        let mut cut = max_bytes;
        while cut > 0 && !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        if cut == 0 {
            cut = rest.chars().next().map_or(rest.len(), char::len_utf8);
        }
        let (head, tail) = rest.split_at(cut);
        pieces.push(head);
        rest = tail;
    }
    pieces.push(rest);
    pieces
}

#[cfg(test)]
mod tests {
    use kernel_ipc::recv_json_frame;

    use super::*;

    #[test]
    fn test_split_keeps_characters_whole() {
        let text = "aé€😀b";
        let pieces = split_at_char_boundaries(text, 3);
        assert_eq!(pieces.concat(), text);
        assert!(pieces.iter().all(|p| !p.is_empty()));
        assert_eq!(pieces, vec!["aé", "€", "😀", "b"]);
        assert_eq!(split_at_char_boundaries("short", 16), vec!["short"]);
    }

    #[tokio::test]
    async fn test_oversized_stdout_is_split_and_later_frames_follow() {
        let line = "x".repeat(500);
        let mut buf = Vec::new();
        write_message(
            &mut buf,
            &ChannelMessage::from(KernelProcessMessage::stdout(line.clone())),
            128,
        )
        .await
        .unwrap();
        write_message(
            &mut buf,
            &ChannelMessage::from(KernelProcessMessage::End),
            128,
        )
        .await
        .unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let mut text = String::new();
        let mut frames = 0;
        let last = loop {
            let message: ChannelMessage = recv_json_frame(&mut cursor).await.unwrap().unwrap();
            match message {
                ChannelMessage::KernelProcess(KernelProcessMessage::Stdout { message }) => {
                    frames += 1;
                    text.push_str(&message);
                }
                other => break other,
            }
        };
        assert!(frames > 1);
        assert_eq!(text, line);
        assert_eq!(last, ChannelMessage::KernelProcess(KernelProcessMessage::End));
    }

    #[tokio::test]
    async fn test_oversized_non_stdout_is_refused_without_writing() {
        let mut buf = Vec::new();
        let message = ChannelMessage::from(KernelProcessMessage::Error {
            message: "e".repeat(500),
        });
        assert!(matches!(
            write_message(&mut buf, &message, 128).await,
            Err(FrameError::TooLarge { .. })
        ));
        assert!(buf.is_empty());
    }
}
