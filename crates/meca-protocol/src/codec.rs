//! NUL 结尾帧编解码
//!
//! TCP 是字节流，一次 `read` 可能包含半帧或多帧。[`FrameDecoder`] 累积字节，
//! 按 NUL 切分出完整帧。

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::ProtocolError;

/// 帧结束符
pub const FRAME_TERMINATOR: u8 = 0;

/// 单帧最大长度（不含结束符）
pub const MAX_FRAME_LEN: usize = 1024;

/// 封装一帧（追加 NUL）
pub fn encode_frame(text: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(text.len() + 1);
    buf.put_slice(text.as_bytes());
    buf.put_u8(FRAME_TERMINATOR);
    buf.freeze()
}

/// 流式帧解码器
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    max_len: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_max_len(MAX_FRAME_LEN)
    }

    pub fn with_max_len(max_len: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(max_len.min(4096)),
            max_len,
        }
    }

    /// 追加从 socket 读到的字节
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// 取出下一帧
    ///
    /// - `None`：缓冲区中没有完整帧
    /// - `Some(Err(..))`：该帧非法（已从缓冲区移除，可继续解码后续帧）
    pub fn next_frame(&mut self) -> Option<Result<String, ProtocolError>> {
        match self.buf.iter().position(|b| *b == FRAME_TERMINATOR) {
            Some(end) => {
                let frame = self.buf.split_to(end);
                self.buf.advance(1);

                if frame.len() > self.max_len {
                    return Some(Err(ProtocolError::FrameTooLong {
                        len: frame.len(),
                        max: self.max_len,
                    }));
                }

                // 控制器偶尔在帧间插入换行
                let text = match std::str::from_utf8(&frame) {
                    Ok(text) if text.is_ascii() => text.trim().to_string(),
                    _ => {
                        return Some(Err(ProtocolError::NonAscii {
                            hex: hex::encode(&frame),
                        }));
                    },
                };

                if text.is_empty() {
                    self.next_frame()
                } else {
                    Some(Ok(text))
                }
            },
            None if self.buf.len() > self.max_len => {
                let len = self.buf.len();
                self.buf.clear();
                Some(Err(ProtocolError::FrameTooLong {
                    len,
                    max: self.max_len,
                }))
            },
            None => None,
        }
    }

    /// 缓冲区中尚未成帧的字节数
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }

    /// 丢弃未成帧数据（重连后调用）
    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_frame_appends_terminator() {
        let frame = encode_frame("Home");
        assert_eq!(&frame[..], b"Home\0");
    }

    #[test]
    fn test_split_across_reads() {
        let mut decoder = FrameDecoder::new();
        decoder.push(b"[2000][Motors ");
        assert!(decoder.next_frame().is_none());
        decoder.push(b"activated.]\0[2002][Hom");
        assert_eq!(
            decoder.next_frame().unwrap().unwrap(),
            "[2000][Motors activated.]"
        );
        assert!(decoder.next_frame().is_none());
        assert_eq!(decoder.pending_len(), 10);
    }

    #[test]
    fn test_multiple_frames_in_one_read() {
        let mut decoder = FrameDecoder::new();
        decoder.push(b"[3030][1]\0[3030][2]\0\0\n\0[3004][]\0");
        let frames: Vec<_> = std::iter::from_fn(|| decoder.next_frame())
            .map(|f| f.unwrap())
            .collect();
        assert_eq!(frames, vec!["[3030][1]", "[3030][2]", "[3004][]"]);
    }

    #[test]
    fn test_non_ascii_frame_is_reported_and_skipped() {
        let mut decoder = FrameDecoder::new();
        decoder.push(&[0xff, 0xfe, 0x00]);
        decoder.push(b"[2000][ok]\0");
        assert_eq!(
            decoder.next_frame().unwrap(),
            Err(ProtocolError::NonAscii {
                hex: "fffe".to_string()
            })
        );
        assert_eq!(decoder.next_frame().unwrap().unwrap(), "[2000][ok]");
    }

    #[test]
    fn test_overflow_without_terminator() {
        let mut decoder = FrameDecoder::with_max_len(8);
        decoder.push(b"0123456789");
        assert!(matches!(
            decoder.next_frame(),
            Some(Err(ProtocolError::FrameTooLong { len: 10, max: 8 }))
        ));
        assert_eq!(decoder.pending_len(), 0);
    }
}
