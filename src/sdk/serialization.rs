//! 推送帧的编解码工具
//!
//! 监听连接上的帧可能经过 gzip 压缩，载荷字段以 base64 文本传输。

use flate2::read::GzDecoder;
use serde::Deserialize;
use std::io::{self, Read};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// base64 字段反序列化；`null` 和空串都视为空载荷
pub fn deserialize_base64<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use base64::Engine;
    let encoded = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
    if encoded.is_empty() {
        return Ok(Vec::new());
    }
    base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(serde::de::Error::custom)
}

pub fn decompress_gzip(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(data).read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(test)]
pub(crate) fn compress_gzip(data: &[u8]) -> io::Result<Vec<u8>> {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

/// 带 gzip 魔数的帧先解压，其余原样返回
pub fn maybe_decompress(data: Vec<u8>) -> io::Result<Vec<u8>> {
    if data.starts_with(&GZIP_MAGIC) {
        decompress_gzip(&data)
    } else {
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Deserialize)]
    struct Frame {
        #[serde(default, deserialize_with = "deserialize_base64")]
        data: Vec<u8>,
    }

    #[test]
    fn base64_field_accepts_null_and_empty() {
        let f: Frame = serde_json::from_str(r#"{"data":null}"#).unwrap();
        assert!(f.data.is_empty());
        let f: Frame = serde_json::from_str(r#"{"data":""}"#).unwrap();
        assert!(f.data.is_empty());
        let f: Frame = serde_json::from_str(r#"{"data":"aGk="}"#).unwrap();
        assert_eq!(f.data, b"hi");
    }

    #[test]
    fn plain_payload_passes_through_untouched() {
        let raw = br#"{"errCode":0}"#.to_vec();
        assert_eq!(maybe_decompress(raw.clone()).unwrap(), raw);

        let packed = compress_gzip(&raw).unwrap();
        assert_eq!(maybe_decompress(packed).unwrap(), raw);
    }
}
