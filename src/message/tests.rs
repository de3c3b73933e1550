use anyhow::Result;

use crate::error::Category;
use crate::protocol::{Endianness, Header, MessageType};
use crate::sasl::Capabilities;

use super::{Message, RawMessage};

fn blob(endianness: Endianness, fields: &[u8], body: &[u8]) -> Vec<u8> {
    let header = Header {
        endianness,
        message_type: MessageType::METHOD_CALL,
        flags: 0,
        version: 1,
        body_length: body.len() as u32,
        serial: 9,
        fields_length: fields.len() as u32,
    };

    let mut out = header.to_bytes().to_vec();
    out.extend_from_slice(fields);

    while out.len() % 8 != 0 {
        out.push(0);
    }

    out.extend_from_slice(body);
    out
}

#[test]
fn test_raw_message() -> Result<()> {
    for endianness in [Endianness::LITTLE, Endianness::BIG] {
        let message = RawMessage::decode(&blob(endianness, b"abc", b"hello"), Capabilities::EMPTY)?;
        assert_eq!(message.header().endianness, endianness);
        assert_eq!(message.header().serial, 9);
        assert_eq!(message.body(), b"hello");
        assert_eq!(message.blob().len(), 16 + 8 + 5);
        assert_eq!(message.encode(Capabilities::EMPTY)?, message.blob());
    }

    Ok(())
}

#[test]
fn test_raw_message_length_mismatch() {
    let mut data = blob(Endianness::LITTLE, b"", b"hello");
    data.push(0);

    let error = RawMessage::new(data).unwrap_err();
    assert_eq!(error.category(), Category::InvalidData);

    let error = RawMessage::new(vec![b'l'; 4]).unwrap_err();
    assert_eq!(
        error.to_string(),
        "Message blob of 4 bytes is shorter than the fixed header"
    );
}

#[test]
fn test_raw_message_fds() -> Result<()> {
    let mut message = RawMessage::new(blob(Endianness::LITTLE, b"", b"x"))?;
    assert_eq!(message.fds().map(|fds| fds.len()), Some(0));

    #[cfg(unix)]
    {
        let file = tempfile::tempfile()?;
        let mut fds = crate::fd_list::FdList::new();
        fds.push(std::os::fd::OwnedFd::from(file));
        message.attach_fds(fds);
        assert_eq!(message.fds().map(|fds| fds.len()), Some(1));
        assert_eq!(message.take_fds().len(), 1);
    }

    Ok(())
}
