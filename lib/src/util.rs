use std::io;

use data_encoding::BASE64URL_NOPAD;
use rand::{TryRngCore, rngs::OsRng};
use serde::Serialize;

/// Reads `len` bytes from the OS random source and encodes them as unpadded base64url.
pub fn random_string(len: usize) -> io::Result<String> {
    let mut buf = vec![0u8; len];
    OsRng.try_fill_bytes(&mut buf).map_err(io::Error::other)?;
    Ok(BASE64URL_NOPAD.encode(&buf))
}

/// Pretty JSON for log and terminal output. Never fails.
pub fn pretty_string<T: Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string_pretty(value)
        .unwrap_or_else(|err| format!("<value could not be serialized: {err}>"))
}
