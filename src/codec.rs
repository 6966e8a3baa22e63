use crate::error::Result;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io::Read;
use std::path::Path;

/// Encodes a value as JSON bytes for blob upload.
pub fn to_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

pub fn from_json<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Computes the lowercase hex MD5 digest of a file's contents.
/// Reads in chunks so large archive files don't need to fit in memory.
pub fn file_md5(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut context = md5::Context::new();
    let mut buffer = [0_u8; 64 * 1024];
    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        context.consume(&buffer[..bytes_read]);
    }
    Ok(format!("{:x}", context.compute()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn md5_of_known_contents() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("checksum.txt");

        std::fs::write(&path, b"").unwrap();
        assert_eq!(file_md5(&path).unwrap(), "d41d8cd98f00b204e9800998ecf8427e");

        std::fs::write(&path, b"abc").unwrap();
        assert_eq!(file_md5(&path).unwrap(), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn json_round_trip() {
        let value = serde_json::json!({"features": 2, "layer": "loggedpoint2024-05-01"});
        let bytes = to_json(&value).unwrap();
        let decoded: serde_json::Value = from_json(&bytes).unwrap();
        assert_eq!(decoded, value);
    }
}
