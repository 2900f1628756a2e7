// Length-delimited message framing over TCP.
//
// Every token travels as a frame: a 4-byte big-endian length prefix followed
// by the ASCII token itself. `read_message` uses `read_exact` for both parts,
// so a token that arrives split across several TCP segments is reassembled
// before anyone looks at it, and two tokens that arrive in one segment are
// returned one at a time. Both functions operate on raw bytes; `message.rs`
// handles the token text.
//
// `MAX_MESSAGE_SIZE` bounds what a peer can make us allocate. The longest
// payload we ever send is the usage text.

use std::io::{self, Read, Write};

/// Maximum allowed payload size in bytes.
pub const MAX_MESSAGE_SIZE: u32 = 256;

/// Write a length-delimited message: 4-byte big-endian length, then payload.
pub fn write_message<W: Write>(writer: &mut W, msg: &[u8]) -> io::Result<()> {
    let len = u32::try_from(msg.len())
        .ok()
        .filter(|len| *len <= MAX_MESSAGE_SIZE)
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "message too large: {} bytes (max {MAX_MESSAGE_SIZE})",
                    msg.len()
                ),
            )
        })?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(msg)?;
    writer.flush()?;
    Ok(())
}

/// Read a length-delimited message: 4-byte big-endian length, then payload.
///
/// Returns `UnexpectedEof` if the stream closes before or during a message.
/// Returns `InvalidData` if the length exceeds `MAX_MESSAGE_SIZE`.
pub fn read_message<R: Read>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_MESSAGE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("message too large: {len} bytes (max {MAX_MESSAGE_SIZE})"),
        ));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}
