use crate::error::{Error, Result};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc::{Crc, CRC_32_ISCSI};

/// Common header: source port, destination port, verification tag, checksum.
pub(crate) const COMMON_HEADER_SIZE: usize = 12;
pub(crate) const CHUNK_HEADER_SIZE: usize = 4;
const PADDING_MULTIPLE: usize = 4;

const CT_DATA: u8 = 0;
const CT_INIT: u8 = 1;
const CT_INIT_ACK: u8 = 2;
const CT_HEARTBEAT: u8 = 4;
const CT_HEARTBEAT_ACK: u8 = 5;
const CT_ABORT: u8 = 6;
const CT_SHUTDOWN: u8 = 7;
const CT_SHUTDOWN_ACK: u8 = 8;
const CT_COOKIE_ECHO: u8 = 10;
const CT_COOKIE_ACK: u8 = 11;
const CT_SHUTDOWN_COMPLETE: u8 = 14;

/// U bit of the DATA chunk flags.
const DATA_FLAG_UNORDERED: u8 = 0x04;

const ISCSI_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

fn padding(len: usize) -> usize {
    (PADDING_MULTIPLE - (len % PADDING_MULTIPLE)) % PADDING_MULTIPLE
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Chunk {
    Init {
        initiate_tag: u32,
        out_streams: u16,
        in_streams: u16,
        initial_tsn: u32,
        addresses: Vec<String>,
    },
    InitAck {
        initiate_tag: u32,
        out_streams: u16,
        in_streams: u16,
        initial_tsn: u32,
        addresses: Vec<String>,
    },
    CookieEcho {
        echo_tag: u32,
    },
    CookieAck,
    Data {
        tsn: u32,
        stream: u16,
        ssn: u16,
        ppid: u32,
        unordered: bool,
        user_data: Bytes,
    },
    Heartbeat {
        info: Bytes,
    },
    HeartbeatAck {
        info: Bytes,
    },
    Shutdown,
    ShutdownAck,
    ShutdownComplete,
    Abort,
}

impl Chunk {
    fn chunk_type(&self) -> u8 {
        match self {
            Chunk::Init { .. } => CT_INIT,
            Chunk::InitAck { .. } => CT_INIT_ACK,
            Chunk::CookieEcho { .. } => CT_COOKIE_ECHO,
            Chunk::CookieAck => CT_COOKIE_ACK,
            Chunk::Data { .. } => CT_DATA,
            Chunk::Heartbeat { .. } => CT_HEARTBEAT,
            Chunk::HeartbeatAck { .. } => CT_HEARTBEAT_ACK,
            Chunk::Shutdown => CT_SHUTDOWN,
            Chunk::ShutdownAck => CT_SHUTDOWN_ACK,
            Chunk::ShutdownComplete => CT_SHUTDOWN_COMPLETE,
            Chunk::Abort => CT_ABORT,
        }
    }

    fn marshal_value(&self, writer: &mut BytesMut) {
        match self {
            Chunk::Init {
                initiate_tag,
                out_streams,
                in_streams,
                initial_tsn,
                addresses,
            }
            | Chunk::InitAck {
                initiate_tag,
                out_streams,
                in_streams,
                initial_tsn,
                addresses,
            } => {
                writer.put_u32(*initiate_tag);
                writer.put_u16(*out_streams);
                writer.put_u16(*in_streams);
                writer.put_u32(*initial_tsn);
                writer.put_u8(addresses.len() as u8);
                for address in addresses {
                    writer.put_u8(address.len() as u8);
                    writer.put_slice(address.as_bytes());
                }
            }
            Chunk::CookieEcho { echo_tag } => {
                writer.put_u32(*echo_tag);
            }
            Chunk::CookieAck
            | Chunk::Shutdown
            | Chunk::ShutdownAck
            | Chunk::ShutdownComplete
            | Chunk::Abort => {}
            Chunk::Data {
                tsn,
                stream,
                ssn,
                ppid,
                unordered: _,
                user_data,
            } => {
                writer.put_u32(*tsn);
                writer.put_u16(*stream);
                writer.put_u16(*ssn);
                writer.put_u32(*ppid);
                writer.put_slice(user_data);
            }
            Chunk::Heartbeat { info } | Chunk::HeartbeatAck { info } => {
                writer.put_slice(info);
            }
        }
    }

    fn flags(&self) -> u8 {
        match self {
            Chunk::Data { unordered, .. } if *unordered => DATA_FLAG_UNORDERED,
            _ => 0,
        }
    }

    fn unmarshal(typ: u8, flags: u8, mut value: Bytes) -> Result<Self> {
        match typ {
            CT_INIT | CT_INIT_ACK => {
                if value.remaining() < 13 {
                    return Err(Error::ErrChunkInvalidLength);
                }
                let initiate_tag = value.get_u32();
                let out_streams = value.get_u16();
                let in_streams = value.get_u16();
                let initial_tsn = value.get_u32();
                let count = value.get_u8() as usize;
                let mut addresses = Vec::with_capacity(count);
                for _ in 0..count {
                    if value.remaining() < 1 {
                        return Err(Error::ErrChunkInvalidLength);
                    }
                    let len = value.get_u8() as usize;
                    if value.remaining() < len {
                        return Err(Error::ErrChunkInvalidLength);
                    }
                    let raw = value.split_to(len);
                    addresses.push(
                        String::from_utf8(raw.to_vec())
                            .map_err(|_| Error::ErrChunkInvalidLength)?,
                    );
                }
                if typ == CT_INIT {
                    Ok(Chunk::Init {
                        initiate_tag,
                        out_streams,
                        in_streams,
                        initial_tsn,
                        addresses,
                    })
                } else {
                    Ok(Chunk::InitAck {
                        initiate_tag,
                        out_streams,
                        in_streams,
                        initial_tsn,
                        addresses,
                    })
                }
            }
            CT_COOKIE_ECHO => {
                if value.remaining() < 4 {
                    return Err(Error::ErrChunkInvalidLength);
                }
                Ok(Chunk::CookieEcho {
                    echo_tag: value.get_u32(),
                })
            }
            CT_COOKIE_ACK => Ok(Chunk::CookieAck),
            CT_DATA => {
                if value.remaining() < 12 {
                    return Err(Error::ErrChunkInvalidLength);
                }
                let tsn = value.get_u32();
                let stream = value.get_u16();
                let ssn = value.get_u16();
                let ppid = value.get_u32();
                Ok(Chunk::Data {
                    tsn,
                    stream,
                    ssn,
                    ppid,
                    unordered: flags & DATA_FLAG_UNORDERED != 0,
                    user_data: value,
                })
            }
            CT_HEARTBEAT => Ok(Chunk::Heartbeat { info: value }),
            CT_HEARTBEAT_ACK => Ok(Chunk::HeartbeatAck { info: value }),
            CT_SHUTDOWN => Ok(Chunk::Shutdown),
            CT_SHUTDOWN_ACK => Ok(Chunk::ShutdownAck),
            CT_SHUTDOWN_COMPLETE => Ok(Chunk::ShutdownComplete),
            CT_ABORT => Ok(Chunk::Abort),
            _ => Err(Error::ErrUnknownChunkType),
        }
    }
}

/// One engine datagram: common header plus bundled chunks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Packet {
    pub(crate) source_port: u16,
    pub(crate) destination_port: u16,
    pub(crate) verification_tag: u32,
    pub(crate) chunks: Vec<Chunk>,
}

impl Packet {
    pub(crate) fn marshal(&self, with_checksum: bool) -> Bytes {
        let mut raw = BytesMut::new();
        raw.put_u16(self.source_port);
        raw.put_u16(self.destination_port);
        raw.put_u32(self.verification_tag);
        raw.put_u32(0); // checksum, patched below

        for chunk in &self.chunks {
            let mut value = BytesMut::new();
            chunk.marshal_value(&mut value);
            raw.put_u8(chunk.chunk_type());
            raw.put_u8(chunk.flags());
            raw.put_u16((CHUNK_HEADER_SIZE + value.len()) as u16);
            raw.extend_from_slice(&value);
            raw.put_bytes(0, padding(value.len()));
        }

        if with_checksum {
            let checksum = checksum_over(&raw);
            raw[8..12].copy_from_slice(&checksum.to_le_bytes());
        }
        raw.freeze()
    }

    pub(crate) fn unmarshal(raw: &Bytes, verify_checksum: bool) -> Result<Self> {
        if raw.len() < COMMON_HEADER_SIZE {
            return Err(Error::ErrPacketHeaderTooSmall);
        }
        let mut reader = raw.clone();
        let source_port = reader.get_u16();
        let destination_port = reader.get_u16();
        let verification_tag = reader.get_u32();
        let their_checksum = reader.get_u32_le();
        if verify_checksum {
            let our_checksum = checksum_over(raw);
            if their_checksum != our_checksum {
                return Err(Error::ErrChecksumMismatch);
            }
        }

        let mut chunks = Vec::new();
        while reader.remaining() >= CHUNK_HEADER_SIZE {
            let typ = reader.get_u8();
            let flags = reader.get_u8();
            let length = reader.get_u16() as usize;
            if length < CHUNK_HEADER_SIZE || reader.remaining() < length - CHUNK_HEADER_SIZE {
                return Err(Error::ErrChunkInvalidLength);
            }
            let value_len = length - CHUNK_HEADER_SIZE;
            let value = reader.split_to(value_len);
            let pad = padding(value_len).min(reader.remaining());
            reader.advance(pad);
            chunks.push(Chunk::unmarshal(typ, flags, value)?);
        }
        Ok(Packet {
            source_port,
            destination_port,
            verification_tag,
            chunks,
        })
    }
}

/// CRC-32-ISCSI over the packet with the checksum field read as zero.
fn checksum_over(raw: &[u8]) -> u32 {
    let mut digest = ISCSI_CRC.digest();
    digest.update(&raw[0..8]);
    digest.update(&[0, 0, 0, 0]);
    digest.update(&raw[12..]);
    digest.finalize()
}
