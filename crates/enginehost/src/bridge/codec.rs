//! Length-prefixed JSON framing for control channels.
//!
//! Control messages are small and infrequent, so JSON inside a 4-byte
//! length prefix is plenty; the codec works over any AsyncRead/AsyncWrite
//! (child pipes in production, in-memory duplex streams in tests).

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Frames larger than this indicate a corrupted channel, not a real
/// control message.
const MAX_FRAME_LEN: usize = 64 * 1024;

pub struct JsonCodec<T> {
    framing: LengthDelimitedCodec,
    _marker: PhantomData<T>,
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            framing: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .max_frame_length(MAX_FRAME_LEN)
                .new_codec(),
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: DeserializeOwned> Decoder for JsonCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(frame) = self.framing.decode(src)? else {
            return Ok(None);
        };
        let item = serde_json::from_slice(&frame)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(Some(item))
    }
}

impl<T: Serialize> Encoder<T> for JsonCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.framing.encode(Bytes::from(json), dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{ControlRequest, ControlResponse};
    use std::path::PathBuf;

    #[test]
    fn roundtrip_request() {
        let mut codec = JsonCodec::<ControlRequest>::new();
        let mut buf = BytesMut::new();

        let req = ControlRequest::Init {
            ipc_fd: 5,
            resource_dir: PathBuf::from("/data/resources"),
        };
        codec.encode(req, &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();

        match decoded {
            ControlRequest::Init {
                ipc_fd,
                resource_dir,
            } => {
                assert_eq!(ipc_fd, 5);
                assert_eq!(resource_dir, PathBuf::from("/data/resources"));
            }
            other => panic!("wrong variant: {:?}", other),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn roundtrip_response() {
        let mut codec = JsonCodec::<ControlResponse>::new();
        let mut buf = BytesMut::new();

        codec
            .encode(
                ControlResponse::Failed {
                    error: "engine refused".to_string(),
                },
                &mut buf,
            )
            .unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(decoded, ControlResponse::Failed { error } if error == "engine refused"));
    }

    #[test]
    fn partial_frame_waits_for_more_data() {
        let mut codec = JsonCodec::<ControlResponse>::new();
        let mut buf = BytesMut::new();
        codec.encode(ControlResponse::Ready, &mut buf).unwrap();

        let rest = buf.split_off(3);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.unsplit(rest);
        assert!(matches!(
            codec.decode(&mut buf).unwrap(),
            Some(ControlResponse::Ready)
        ));
    }

    #[test]
    fn garbage_payload_is_invalid_data() {
        let mut codec = JsonCodec::<ControlResponse>::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0, 0, 0, 4]);
        buf.extend_from_slice(b"!!!!");

        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
