//! Typed message bodies and the little-endian payload stream.
use byteorder::{ByteOrder, LittleEndian};
use std::io::{self, ErrorKind};

use crate::address::NetAddress;

/// Payload capacity of a single message (excludes record framing).
pub const MAX_PAYLOAD_SIZE: usize = 1024;

/// Sentinel for "no reliable id assigned".
pub const INVALID_RELIABLE_ID: u16 = 0xFFFF;
/// Sentinel for "no sequence id assigned".
pub const INVALID_SEQUENCE_ID: u16 = 0xFFFF;
/// String length marking a null (absent) string, vs. 0 for an empty one.
pub const NULL_STRING_LENGTH: u16 = 0xFFFF;

/// A single message: type id, delivery bookkeeping and a bounded payload.
///
/// The reliable-id and sequence-id fields hold their sentinels until the
/// sending connection stamps them; whether they appear on the wire is driven
/// by the type's registered flags, not by the values here.
#[derive(Debug)]
pub struct NetMessage {
    pub message_type_id: u8,
    /// Stamped from the session clock when written into a packet. On the
    /// receive side this is the authoritative send timestamp of the record.
    pub sent_time: f32,
    pub reliable_id: u16,
    pub sequence_id: u16,

    /// Connection index of the sender, if the sender is an established
    /// connection.
    pub sender: Option<u8>,
    pub sender_address: NetAddress,

    /// Clock time this message last entered a packet; drives retransmission.
    pub last_sent_time: f64,

    payload: Vec<u8>,
    read_cursor: usize,
}

impl NetMessage {
    pub fn new(message_type_id: u8) -> Self {
        Self {
            message_type_id,
            sent_time: 0.0,
            reliable_id: INVALID_RELIABLE_ID,
            sequence_id: INVALID_SEQUENCE_ID,
            sender: None,
            sender_address: NetAddress::default(),
            last_sent_time: 0.0,
            payload: Vec::new(),
            read_cursor: 0,
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    pub fn set_payload(&mut self, bytes: &[u8]) -> io::Result<()> {
        if bytes.len() > MAX_PAYLOAD_SIZE {
            return Err(payload_full());
        }
        self.payload.clear();
        self.payload.extend_from_slice(bytes);
        self.read_cursor = 0;
        Ok(())
    }

    pub fn has_read_all_data(&self) -> bool {
        self.read_cursor >= self.payload.len()
    }

    // -- writers ----------------------------------------------------------

    pub fn write_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        if self.payload.len() + bytes.len() > MAX_PAYLOAD_SIZE {
            return Err(payload_full());
        }
        self.payload.extend_from_slice(bytes);
        Ok(())
    }

    pub fn write_u8(&mut self, value: u8) -> io::Result<()> {
        self.write_bytes(&[value])
    }

    pub fn write_bool(&mut self, value: bool) -> io::Result<()> {
        self.write_u8(u8::from(value))
    }

    pub fn write_u16(&mut self, value: u16) -> io::Result<()> {
        self.write_bytes(&value.to_le_bytes())
    }

    pub fn write_u32(&mut self, value: u32) -> io::Result<()> {
        self.write_bytes(&value.to_le_bytes())
    }

    pub fn write_u64(&mut self, value: u64) -> io::Result<()> {
        self.write_bytes(&value.to_le_bytes())
    }

    pub fn write_i32(&mut self, value: i32) -> io::Result<()> {
        self.write_bytes(&value.to_le_bytes())
    }

    pub fn write_f32(&mut self, value: f32) -> io::Result<()> {
        self.write_bytes(&value.to_le_bytes())
    }

    pub fn write_f64(&mut self, value: f64) -> io::Result<()> {
        self.write_bytes(&value.to_le_bytes())
    }

    /// Writes a u16 length followed by raw bytes. `None` encodes as the
    /// null-string length.
    pub fn write_string(&mut self, value: Option<&str>) -> io::Result<()> {
        match value {
            None => self.write_u16(NULL_STRING_LENGTH),
            Some(s) => {
                let bytes = s.as_bytes();
                if bytes.len() >= NULL_STRING_LENGTH as usize {
                    return Err(io::Error::new(ErrorKind::InvalidInput, "string too long"));
                }
                self.write_u16(bytes.len() as u16)?;
                self.write_bytes(bytes)
            }
        }
    }

    // -- readers ----------------------------------------------------------

    fn take(&mut self, count: usize) -> io::Result<&[u8]> {
        if self.read_cursor + count > self.payload.len() {
            return Err(io::Error::new(ErrorKind::UnexpectedEof, "message payload exhausted"));
        }
        let slice = &self.payload[self.read_cursor..self.read_cursor + count];
        self.read_cursor += count;
        Ok(slice)
    }

    pub fn read_bytes(&mut self, out: &mut [u8]) -> io::Result<()> {
        let slice = self.take(out.len())?;
        out.copy_from_slice(slice);
        Ok(())
    }

    pub fn read_u8(&mut self) -> io::Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_bool(&mut self) -> io::Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u16(&mut self) -> io::Result<u16> {
        Ok(LittleEndian::read_u16(self.take(2)?))
    }

    pub fn read_u32(&mut self) -> io::Result<u32> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    pub fn read_u64(&mut self) -> io::Result<u64> {
        Ok(LittleEndian::read_u64(self.take(8)?))
    }

    pub fn read_i32(&mut self) -> io::Result<i32> {
        Ok(LittleEndian::read_i32(self.take(4)?))
    }

    pub fn read_f32(&mut self) -> io::Result<f32> {
        Ok(LittleEndian::read_f32(self.take(4)?))
    }

    pub fn read_f64(&mut self) -> io::Result<f64> {
        Ok(LittleEndian::read_f64(self.take(8)?))
    }

    /// Reads a string written by [`write_string`]. `Ok(None)` is a null
    /// string.
    ///
    /// [`write_string`]: NetMessage::write_string
    pub fn read_string(&mut self) -> io::Result<Option<String>> {
        let length = self.read_u16()?;
        if length == NULL_STRING_LENGTH {
            return Ok(None);
        }
        let bytes = self.take(length as usize)?;
        String::from_utf8(bytes.to_vec())
            .map(Some)
            .map_err(|_| io::Error::new(ErrorKind::InvalidData, "string is not utf-8"))
    }
}

impl Clone for NetMessage {
    /// Clones reset the read cursor so the copy can be parsed from the top.
    fn clone(&self) -> Self {
        Self {
            message_type_id: self.message_type_id,
            sent_time: self.sent_time,
            reliable_id: self.reliable_id,
            sequence_id: self.sequence_id,
            sender: self.sender,
            sender_address: self.sender_address,
            last_sent_time: self.last_sent_time,
            payload: self.payload.clone(),
            read_cursor: 0,
        }
    }
}

fn payload_full() -> io::Error {
    io::Error::new(ErrorKind::WriteZero, "message payload full")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_round_trip() {
        let mut msg = NetMessage::new(10);
        msg.write_u8(0xAB).unwrap();
        msg.write_u16(0xBEEF).unwrap();
        msg.write_u32(0xDEADBEEF).unwrap();
        msg.write_i32(-12345).unwrap();
        msg.write_f32(3.5).unwrap();
        msg.write_f64(-0.25).unwrap();
        msg.write_bool(true).unwrap();

        assert_eq!(msg.read_u8().unwrap(), 0xAB);
        assert_eq!(msg.read_u16().unwrap(), 0xBEEF);
        assert_eq!(msg.read_u32().unwrap(), 0xDEADBEEF);
        assert_eq!(msg.read_i32().unwrap(), -12345);
        assert_eq!(msg.read_f32().unwrap(), 3.5);
        assert_eq!(msg.read_f64().unwrap(), -0.25);
        assert!(msg.read_bool().unwrap());
        assert!(msg.has_read_all_data());
    }

    #[test]
    fn test_payload_is_little_endian() {
        let mut msg = NetMessage::new(0);
        msg.write_u16(0x0102).unwrap();
        assert_eq!(msg.payload(), &[0x02, 0x01]);
    }

    #[test]
    fn test_write_past_capacity_fails_without_mutation() {
        let mut msg = NetMessage::new(0);
        msg.write_bytes(&[0u8; MAX_PAYLOAD_SIZE]).unwrap();
        assert!(msg.write_u8(1).is_err());
        assert_eq!(msg.payload_len(), MAX_PAYLOAD_SIZE);
    }

    #[test]
    fn test_string_encoding_null_vs_empty() {
        let mut msg = NetMessage::new(0);
        msg.write_string(None).unwrap();
        msg.write_string(Some("")).unwrap();
        msg.write_string(Some("snapnet")).unwrap();

        assert_eq!(msg.read_string().unwrap(), None);
        assert_eq!(msg.read_string().unwrap(), Some(String::new()));
        assert_eq!(msg.read_string().unwrap(), Some(String::from("snapnet")));
    }

    #[test]
    fn test_read_past_end_errors() {
        let mut msg = NetMessage::new(0);
        msg.write_u8(1).unwrap();
        msg.read_u8().unwrap();
        assert!(msg.read_u8().is_err());
    }

    #[test]
    fn test_clone_resets_read_cursor() {
        let mut msg = NetMessage::new(0);
        msg.write_u32(77).unwrap();
        msg.read_u32().unwrap();

        let mut copy = msg.clone();
        assert_eq!(copy.read_u32().unwrap(), 77);
    }
}
