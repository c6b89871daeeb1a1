// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Async adapter around the pure decoder.
//!
//! Drives [`KeypressDecoder`] from any byte source, arming the
//! backslash-enter timer while a lone backslash is held.  The timer is the
//! only clock in the whole input path.

use futures::Stream;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_stream::wrappers::ReceiverStream;

use crate::decoder::{KeypressDecoder, BACKSLASH_ENTER_WINDOW};
use crate::key::Key;

/// Decode `reader` into a stream of key events.
///
/// The stream ends when the reader does; anything still buffered (including
/// a paste without its terminator) is flushed as final keys.
pub fn key_stream<R>(mut reader: R) -> impl Stream<Item = Key>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<Key>(64);
    tokio::spawn(async move {
        let mut decoder = KeypressDecoder::new();
        let mut buf = [0u8; 1024];
        loop {
            let read = if decoder.is_holding_backslash() {
                tokio::select! {
                    // Window expired: release the held backslash, then keep
                    // reading.
                    _ = sleep(BACKSLASH_ENTER_WINDOW) => {
                        for key in decoder.notify_timeout() {
                            if tx.send(key).await.is_err() {
                                return;
                            }
                        }
                        continue;
                    }
                    n = reader.read(&mut buf) => n,
                }
            } else {
                reader.read(&mut buf).await
            };

            match read {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    for byte in &buf[..n] {
                        for key in decoder.feed(*byte) {
                            if tx.send(key).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        }
        for key in decoder.flush() {
            if tx.send(key).await.is_err() {
                return;
            }
        }
    });
    ReceiverStream::new(rx)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    async fn decode_bytes(bytes: &'static [u8]) -> Vec<Key> {
        key_stream(bytes).collect().await
    }

    #[tokio::test]
    async fn plain_text_round_trips() {
        let keys = decode_bytes(b"hi").await;
        let names: Vec<&str> = keys.iter().map(|k| k.name.as_str()).collect();
        assert_eq!(names, vec!["h", "i"]);
    }

    #[tokio::test]
    async fn paste_survives_chunked_reader() {
        // A slice reader may hand the sentinel across read calls; the
        // decoder's internal state carries over.
        let keys = decode_bytes(b"\x1b[200~a\nb\nc\x1b[201~").await;
        assert_eq!(keys.len(), 1);
        assert!(keys[0].paste);
        assert_eq!(keys[0].sequence, "a\nb\nc");
    }

    #[tokio::test]
    async fn unterminated_paste_flushed_at_eof() {
        let keys = decode_bytes(b"\x1b[200~tail").await;
        assert_eq!(keys.len(), 1);
        assert!(keys[0].paste);
        assert_eq!(keys[0].sequence, "tail");
    }

    #[tokio::test]
    async fn held_backslash_released_by_timer() {
        // EOF arrives immediately after the backslash; the flush path (not
        // the timer) must still release it.
        let keys = decode_bytes(b"\\").await;
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].name, "\\");
    }

    #[tokio::test]
    async fn backslash_return_in_same_read_is_shift_return() {
        let keys = decode_bytes(b"\\\r").await;
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].name, "return");
        assert!(keys[0].shift);
    }
}
