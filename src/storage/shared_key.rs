// Shared Key request authorization, used when running against a local
// emulator (Azurite) or any account configured with AZURE_STORAGE_KEY.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::StorageError;

type HmacSha256 = Hmac<Sha256>;

/// Request fields covered by a Shared Key signature.
#[derive(Debug, Default)]
pub struct SharedKeyRequest<'a> {
    pub method: &'a str,
    /// Already percent-encoded URL path, starting with `/`.
    pub path: &'a str,
    pub content_length: Option<usize>,
    pub content_type: &'a str,
    /// `x-ms-*` headers sent with the request.
    pub ms_headers: &'a [(&'a str, &'a str)],
    pub query: &'a [(&'a str, &'a str)],
}

pub fn string_to_sign(account: &str, request: &SharedKeyRequest<'_>) -> String {
    let content_length = match request.content_length {
        Some(0) | None => String::new(),
        Some(len) => len.to_string(),
    };

    let mut headers: Vec<(String, &str)> = request
        .ms_headers
        .iter()
        .map(|(k, v)| (k.to_lowercase(), v.trim()))
        .filter(|(k, _)| k.starts_with("x-ms-"))
        .collect();
    headers.sort_by(|a, b| a.0.cmp(&b.0));
    let canonicalized_headers: String = headers
        .iter()
        .map(|(k, v)| format!("{}:{}\n", k, v))
        .collect();

    let mut canonicalized_resource = format!("/{}{}", account, request.path);
    let mut query: Vec<(String, &str)> = request
        .query
        .iter()
        .map(|(k, v)| (k.to_lowercase(), *v))
        .collect();
    query.sort_by(|a, b| a.0.cmp(&b.0));
    for (k, v) in &query {
        canonicalized_resource.push_str(&format!("\n{}:{}", k, v));
    }

    format!(
        "{}\n\n\n{}\n\n{}\n\n\n\n\n\n\n{}{}",
        request.method,
        content_length,
        request.content_type,
        canonicalized_headers,
        canonicalized_resource
    )
}

/// Returns the `Authorization` header value for the request.
pub fn authorization(
    account: &str,
    key: &[u8],
    request: &SharedKeyRequest<'_>,
) -> Result<String, StorageError> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| StorageError::Signing(format!("HMAC key error: {}", e)))?;
    mac.update(string_to_sign(account, request).as_bytes());
    let signature = BASE64.encode(mac.finalize().into_bytes());
    Ok(format!("SharedKey {}:{}", account, signature))
}
