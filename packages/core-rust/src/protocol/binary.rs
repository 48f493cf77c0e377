//! Big-endian binary protocol.
//!
//! Messages start with the version word `0x8001_0000 | type` followed by the
//! name and sequence id ("strict" form). The older form, a bare name length
//! followed by name, type byte, and sequence id, is accepted on read.

use super::{
    FieldHeader, InputProtocol, ListHeader, MapHeader, MessageHeader, MessageType, OutputProtocol,
    TType,
};
use crate::error::{ProtocolError, Result};
use crate::transport::{ReadTransport, WriteTransport};

const VERSION_MASK: u32 = 0xFFFF_0000;
const VERSION_1: u32 = 0x8001_0000;
const TYPE_MASK: u32 = 0x0000_00FF;

/// Decoder for the binary protocol.
#[derive(Debug)]
pub struct BinaryInputProtocol<T> {
    transport: T,
}

impl<T: ReadTransport> BinaryInputProtocol<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        self.transport.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn read_size(&mut self) -> Result<usize> {
        let size = self.read_i32()?;
        usize::try_from(size).map_err(|_| ProtocolError::NegativeSize(size))
    }

    fn read_type(&mut self) -> Result<TType> {
        let [raw] = self.read_array::<1>()?;
        TType::from_u8(raw)
    }
}

impl<T: ReadTransport> InputProtocol for BinaryInputProtocol<T> {
    fn read_message_begin(&mut self) -> Result<MessageHeader> {
        let first = self.read_i32()?;
        // Reinterpret the sign bit as the version marker.
        #[allow(clippy::cast_sign_loss)]
        let word = first as u32;

        if first < 0 {
            if word & VERSION_MASK != VERSION_1 {
                return Err(ProtocolError::BadVersion(word & VERSION_MASK));
            }
            #[allow(clippy::cast_possible_truncation)]
            let message_type = MessageType::from_u8((word & TYPE_MASK) as u8)?;
            let name = self.read_string()?;
            let seq_id = self.read_i32()?;
            Ok(MessageHeader {
                name,
                message_type,
                seq_id,
            })
        } else {
            let name_len = usize::try_from(first).map_err(|_| ProtocolError::NegativeSize(first))?;
            let name = String::from_utf8(self.transport.read_vec(name_len)?)
                .map_err(|e| ProtocolError::InvalidData(e.to_string()))?;
            let [raw_type] = self.read_array::<1>()?;
            let message_type = MessageType::from_u8(raw_type)?;
            let seq_id = self.read_i32()?;
            Ok(MessageHeader {
                name,
                message_type,
                seq_id,
            })
        }
    }

    fn read_message_end(&mut self) -> Result<()> {
        Ok(())
    }

    fn read_struct_begin(&mut self) -> Result<()> {
        Ok(())
    }

    fn read_struct_end(&mut self) -> Result<()> {
        Ok(())
    }

    fn read_field_begin(&mut self) -> Result<FieldHeader> {
        let field_type = self.read_type()?;
        if field_type == TType::Stop {
            return Ok(FieldHeader::stop());
        }
        let id = self.read_i16()?;
        Ok(FieldHeader { field_type, id })
    }

    fn read_field_end(&mut self) -> Result<()> {
        Ok(())
    }

    fn read_list_begin(&mut self) -> Result<ListHeader> {
        let element_type = self.read_type()?;
        let size = self.read_size()?;
        Ok(ListHeader { element_type, size })
    }

    fn read_list_end(&mut self) -> Result<()> {
        Ok(())
    }

    fn read_set_begin(&mut self) -> Result<ListHeader> {
        self.read_list_begin()
    }

    fn read_set_end(&mut self) -> Result<()> {
        Ok(())
    }

    fn read_map_begin(&mut self) -> Result<MapHeader> {
        let key_type = self.read_type()?;
        let value_type = self.read_type()?;
        let size = self.read_size()?;
        Ok(MapHeader {
            key_type,
            value_type,
            size,
        })
    }

    fn read_map_end(&mut self) -> Result<()> {
        Ok(())
    }

    fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_byte()? != 0)
    }

    fn read_byte(&mut self) -> Result<i8> {
        Ok(i8::from_be_bytes(self.read_array()?))
    }

    fn read_i16(&mut self) -> Result<i16> {
        Ok(i16::from_be_bytes(self.read_array()?))
    }

    fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_be_bytes(self.read_array()?))
    }

    fn read_i64(&mut self) -> Result<i64> {
        Ok(i64::from_be_bytes(self.read_array()?))
    }

    fn read_double(&mut self) -> Result<f64> {
        Ok(f64::from_be_bytes(self.read_array()?))
    }

    fn read_string(&mut self) -> Result<String> {
        String::from_utf8(self.read_binary()?).map_err(|e| ProtocolError::InvalidData(e.to_string()))
    }

    fn read_binary(&mut self) -> Result<Vec<u8>> {
        let len = self.read_size()?;
        self.transport.read_vec(len)
    }
}

/// Encoder for the binary protocol. Always writes the strict form.
#[derive(Debug)]
pub struct BinaryOutputProtocol<T> {
    transport: T,
}

impl<T: WriteTransport> BinaryOutputProtocol<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    /// Returns the underlying transport.
    pub fn into_inner(self) -> T {
        self.transport
    }

    fn write_size(&mut self, size: usize) -> Result<()> {
        let size = i32::try_from(size).map_err(|_| ProtocolError::SizeLimit {
            size,
            limit: i32::MAX as usize,
        })?;
        self.write_i32(size)
    }
}

impl<T: WriteTransport> OutputProtocol for BinaryOutputProtocol<T> {
    fn write_message_begin(&mut self, header: &MessageHeader) -> Result<()> {
        let word = VERSION_1 | u32::from(header.message_type.as_u8());
        self.transport.write_all(&word.to_be_bytes());
        self.write_string(&header.name)?;
        self.write_i32(header.seq_id)
    }

    fn write_message_end(&mut self) -> Result<()> {
        Ok(())
    }

    fn write_struct_begin(&mut self, _name: &str) -> Result<()> {
        Ok(())
    }

    fn write_struct_end(&mut self) -> Result<()> {
        Ok(())
    }

    fn write_field_begin(&mut self, _name: &str, header: FieldHeader) -> Result<()> {
        self.transport.write_all(&[header.field_type.as_u8()]);
        self.write_i16(header.id)
    }

    fn write_field_end(&mut self) -> Result<()> {
        Ok(())
    }

    fn write_field_stop(&mut self) -> Result<()> {
        self.transport.write_all(&[TType::Stop.as_u8()]);
        Ok(())
    }

    fn write_list_begin(&mut self, header: ListHeader) -> Result<()> {
        self.transport.write_all(&[header.element_type.as_u8()]);
        self.write_size(header.size)
    }

    fn write_list_end(&mut self) -> Result<()> {
        Ok(())
    }

    fn write_set_begin(&mut self, header: ListHeader) -> Result<()> {
        self.write_list_begin(header)
    }

    fn write_set_end(&mut self) -> Result<()> {
        Ok(())
    }

    fn write_map_begin(&mut self, header: MapHeader) -> Result<()> {
        self.transport
            .write_all(&[header.key_type.as_u8(), header.value_type.as_u8()]);
        self.write_size(header.size)
    }

    fn write_map_end(&mut self) -> Result<()> {
        Ok(())
    }

    fn write_bool(&mut self, value: bool) -> Result<()> {
        self.write_byte(i8::from(value))
    }

    fn write_byte(&mut self, value: i8) -> Result<()> {
        self.transport.write_all(&value.to_be_bytes());
        Ok(())
    }

    fn write_i16(&mut self, value: i16) -> Result<()> {
        self.transport.write_all(&value.to_be_bytes());
        Ok(())
    }

    fn write_i32(&mut self, value: i32) -> Result<()> {
        self.transport.write_all(&value.to_be_bytes());
        Ok(())
    }

    fn write_i64(&mut self, value: i64) -> Result<()> {
        self.transport.write_all(&value.to_be_bytes());
        Ok(())
    }

    fn write_double(&mut self, value: f64) -> Result<()> {
        self.transport.write_all(&value.to_be_bytes());
        Ok(())
    }

    fn write_string(&mut self, value: &str) -> Result<()> {
        self.write_binary(value.as_bytes())
    }

    fn write_binary(&mut self, value: &[u8]) -> Result<()> {
        self.write_size(value.len())?;
        self.transport.write_all(value);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.transport.flush()
    }
}
