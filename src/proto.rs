//! `UserApps` protobuf message and the record encoder seam.
use crate::record::AppsInstalled;
use bytes::{Bytes, BytesMut};
use prost::Message;

pub use prost::{DecodeError, EncodeError};

/// Wire format stored in memcached:
///
/// ```proto
/// message UserApps {
///     repeated uint32 apps = 1;   // unpacked
///     optional double lat = 2;
///     optional double lon = 3;
/// }
/// ```
#[derive(Clone, PartialEq, Message)]
pub struct UserApps {
    #[prost(uint32, repeated, packed = "false", tag = "1")]
    pub apps: Vec<u32>,
    #[prost(double, optional, tag = "2")]
    pub lat: Option<f64>,
    #[prost(double, optional, tag = "3")]
    pub lon: Option<f64>,
}

impl From<&AppsInstalled<'_>> for UserApps {
    fn from(rec: &AppsInstalled<'_>) -> Self {
        Self {
            apps: rec.apps.clone(),
            lat: Some(rec.lat),
            lon: Some(rec.lon),
        }
    }
}

/// Turns a parsed record into the bytes written to the store.
pub trait RecordEncoder: Send + Sync {
    fn encode(&self, record: &AppsInstalled<'_>) -> Result<Bytes, EncodeError>;
}

/// Default encoder: `UserApps` via prost.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProtobufEncoder;

impl RecordEncoder for ProtobufEncoder {
    fn encode(&self, record: &AppsInstalled<'_>) -> Result<Bytes, EncodeError> {
        let msg = UserApps::from(record);
        let mut buf = BytesMut::with_capacity(msg.encoded_len());
        msg.encode(&mut buf)?;
        Ok(buf.freeze())
    }
}

/// Inverse of [`ProtobufEncoder::encode`].
pub fn decode_user_apps(bytes: &[u8]) -> Result<UserApps, DecodeError> {
    UserApps::decode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::parse_apps_installed;

    #[test]
    fn round_trip_keeps_coords_and_apps() {
        let rec = parse_apps_installed("idfa\t1rfw452y52g2gq4g\t55.55\t42.42\t1423,43,567,3,7,23").unwrap();
        let bytes = ProtobufEncoder.encode(&rec).unwrap();
        let back = decode_user_apps(&bytes).unwrap();
        assert_eq!(back.lat, Some(55.55));
        assert_eq!(back.lon, Some(42.42));
        assert_eq!(back.apps, vec![1423, 43, 567, 3, 7, 23]);
    }

    #[test]
    fn empty_app_list_still_carries_coords() {
        let rec = parse_apps_installed("gaid\tx\t-0.5\t180\t").unwrap();
        let back = decode_user_apps(&ProtobufEncoder.encode(&rec).unwrap()).unwrap();
        assert!(back.apps.is_empty());
        assert_eq!((back.lat, back.lon), (Some(-0.5), Some(180.0)));
    }

    #[test]
    fn garbage_does_not_decode() {
        assert!(decode_user_apps(&[0xff, 0xff, 0xff]).is_err());
    }
}
