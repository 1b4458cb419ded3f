//! Share-link codec
//!
//! `https://host/?batch={batchId}&key={key}&meta={meta}`
//!
//! - `key`: raw key → standard base64 → zstd → URL-safe base64 (no padding)
//! - `meta`: `FileMetadata[]` JSON → zstd → URL-safe base64 (no padding)
//!
//! The link is the only secret a receiver needs. Either parameter may be
//! absent on decode; the caller can then fall back to local state.

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use filesh_core::FileMetadata;
use url::Url;

use crate::error::{CryptoError, CryptoResult};
use crate::keys::EncryptionKey;

const ZSTD_LEVEL: i32 = 19;

/// A decoded share link
#[derive(Debug, Clone)]
pub struct ShareLink {
    pub batch_id: String,
    pub key: Option<EncryptionKey>,
    pub metadata: Option<Vec<FileMetadata>>,
}

/// Build a share link under `base_url`.
pub fn encode_share_link(
    base_url: &str,
    batch_id: &str,
    key: &EncryptionKey,
    metadata: &[FileMetadata],
) -> CryptoResult<String> {
    let mut url = Url::parse(base_url)
        .map_err(|e| CryptoError::Link(format!("invalid base URL '{base_url}': {e}")))?;

    let key_param = pack(key.to_base64().as_bytes())?;
    let json = serde_json::to_vec(metadata)
        .map_err(|e| CryptoError::Link(format!("serializing metadata: {e}")))?;
    let meta_param = pack(&json)?;

    url.query_pairs_mut()
        .clear()
        .append_pair("batch", batch_id)
        .append_pair("key", &key_param)
        .append_pair("meta", &meta_param);

    Ok(url.into())
}

/// Parse a share link.
///
/// A missing `batch` parameter is an error; a missing `key` or `meta` is not.
/// A parameter that is present but does not decode is an error.
pub fn decode_share_link(link: &str) -> CryptoResult<ShareLink> {
    let url = Url::parse(link.trim())
        .map_err(|e| CryptoError::Link(format!("not a URL: {e}")))?;

    let mut batch_id = None;
    let mut key = None;
    let mut metadata = None;

    for (name, value) in url.query_pairs() {
        match name.as_ref() {
            "batch" if !value.is_empty() => batch_id = Some(value.into_owned()),
            "key" if !value.is_empty() => {
                let encoded = unpack(&value, "key")?;
                let encoded = String::from_utf8(encoded)
                    .map_err(|_| CryptoError::Link("key parameter is not text".into()))?;
                key = Some(EncryptionKey::from_base64(&encoded)?);
            }
            "meta" if !value.is_empty() => {
                let json = unpack(&value, "meta")?;
                let files: Vec<FileMetadata> = serde_json::from_slice(&json)
                    .map_err(|e| CryptoError::Link(format!("meta parameter: {e}")))?;
                metadata = Some(files);
            }
            _ => {}
        }
    }

    let batch_id = batch_id.ok_or_else(|| CryptoError::Link("missing batch parameter".into()))?;
    filesh_core::types::validate_batch_id(&batch_id)
        .map_err(|e| CryptoError::Link(e.to_string()))?;

    Ok(ShareLink {
        batch_id,
        key,
        metadata,
    })
}

fn pack(data: &[u8]) -> CryptoResult<String> {
    let compressed = zstd::encode_all(data, ZSTD_LEVEL)
        .map_err(|e| CryptoError::Link(format!("compressing: {e}")))?;
    Ok(URL_SAFE_NO_PAD.encode(compressed))
}

fn unpack(value: &str, param: &str) -> CryptoResult<Vec<u8>> {
    let compressed = URL_SAFE_NO_PAD
        .decode(value)
        .or_else(|_| STANDARD.decode(value))
        .map_err(|e| CryptoError::Link(format!("{param} parameter: base64 decode: {e}")))?;
    zstd::decode_all(compressed.as_slice())
        .map_err(|e| CryptoError::Link(format!("{param} parameter: decompress: {e}")))
}
