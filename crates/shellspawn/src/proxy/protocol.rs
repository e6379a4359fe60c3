//! Bytes exchanged between the stdin worker and the terminal proxy.
//!
//! Proxy to caller: the child's pid as a native-endian `i32` right after the
//! proxy has launched it, then one byte per event. Caller to proxy: one byte
//! per answered input request.

use std::io::{self, Read, Write};

/// The child is stopped waiting for terminal input.
pub(crate) const INPUT_REQUESTED: u8 = b'R';
/// The proxy could not switch the child's job state and gave up.
pub(crate) const FAULT: u8 = b'E';
/// A line was written to the terminal.
pub(crate) const DELIVERED: u8 = b'X';
/// The caller closed the terminal; no more input will follow.
pub(crate) const CLOSED: u8 = b'C';

/// A message from the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProxyMessage {
    InputRequested,
    Fault,
}

impl ProxyMessage {
    pub(crate) fn as_byte(self) -> u8 {
        match self {
            Self::InputRequested => INPUT_REQUESTED,
            Self::Fault => FAULT,
        }
    }

    pub(crate) fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            INPUT_REQUESTED => Some(Self::InputRequested),
            FAULT => Some(Self::Fault),
            _ => None,
        }
    }
}

/// The caller's answer to an input request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Reply {
    Delivered,
    Closed,
}

impl Reply {
    pub(crate) fn as_byte(self) -> u8 {
        match self {
            Self::Delivered => DELIVERED,
            Self::Closed => CLOSED,
        }
    }

    /// Decodes a reply byte. Anything unknown counts as closed, as does a
    /// caller that went away.
    pub(crate) fn from_byte(byte: Option<u8>) -> Self {
        match byte {
            Some(DELIVERED) => Self::Delivered,
            _ => Self::Closed,
        }
    }
}

/// Reads one byte, `None` at end-of-stream.
pub(crate) fn read_byte(reader: &mut impl Read) -> io::Result<Option<u8>> {
    let mut byte = [0u8; 1];
    loop {
        match reader.read(&mut byte) {
            Ok(0) => return Ok(None),
            Ok(_) => return Ok(Some(byte[0])),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
}

/// Reads the next proxy message, `None` once the proxy has exited.
pub(crate) fn read_message(reader: &mut impl Read) -> io::Result<Option<ProxyMessage>> {
    match read_byte(reader)? {
        None => Ok(None),
        Some(byte) => ProxyMessage::from_byte(byte).map(Some).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unexpected byte {byte:#04x} from terminal proxy"),
            )
        }),
    }
}

pub(crate) fn send_reply(writer: &mut impl Write, reply: Reply) -> io::Result<()> {
    writer.write_all(&[reply.as_byte()])?;
    writer.flush()
}

pub(crate) fn encode_pid(pid: i32) -> [u8; 4] {
    pid.to_ne_bytes()
}

/// Reads the child pid sent by the proxy.
pub(crate) fn read_pid(reader: &mut impl Read) -> io::Result<i32> {
    let mut raw = [0u8; 4];
    reader.read_exact(&mut raw)?;
    Ok(i32::from_ne_bytes(raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_bytes_are_distinct() {
        let all = [INPUT_REQUESTED, FAULT, DELIVERED, CLOSED];
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_messages_decode_in_order_then_end() {
        let mut stream = Cursor::new(vec![INPUT_REQUESTED, INPUT_REQUESTED, FAULT]);
        assert_eq!(read_message(&mut stream).expect("read"), Some(ProxyMessage::InputRequested));
        assert_eq!(read_message(&mut stream).expect("read"), Some(ProxyMessage::InputRequested));
        assert_eq!(read_message(&mut stream).expect("read"), Some(ProxyMessage::Fault));
        assert_eq!(read_message(&mut stream).expect("read"), None);
    }

    #[test]
    fn test_unknown_message_is_invalid_data() {
        let mut stream = Cursor::new(vec![b'?']);
        let err = read_message(&mut stream).expect_err("must fail");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_replies_default_to_closed() {
        assert_eq!(Reply::from_byte(Some(DELIVERED)), Reply::Delivered);
        assert_eq!(Reply::from_byte(Some(CLOSED)), Reply::Closed);
        assert_eq!(Reply::from_byte(Some(b'z')), Reply::Closed);
        assert_eq!(Reply::from_byte(None), Reply::Closed);
    }

    #[test]
    fn test_reply_is_a_single_byte() {
        let mut out = Vec::new();
        send_reply(&mut out, Reply::Delivered).expect("write");
        send_reply(&mut out, Reply::Closed).expect("write");
        assert_eq!(out, vec![DELIVERED, CLOSED]);
    }

    #[test]
    fn test_pid_hand_off() {
        let mut stream = Cursor::new(encode_pid(4242).to_vec());
        assert_eq!(read_pid(&mut stream).expect("pid"), 4242);
        let mut short = Cursor::new(vec![1u8, 2]);
        assert!(read_pid(&mut short).is_err());
    }
}
