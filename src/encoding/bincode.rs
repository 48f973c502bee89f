use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Serialize a value using bincode
pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| Error::Encoding(format!("serialization failed: {}", e)))
}

/// Deserialize a value from a byte slice using bincode
pub fn deserialize<T: for<'a> Deserialize<'a>>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes)
        .map_err(|e| Error::Encoding(format!("deserialization failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct RootEntry {
        page_id: u64,
        cookie: Vec<u8>,
    }

    #[test]
    fn test_serialize_deserialize() -> Result<()> {
        let original = vec![
            RootEntry {
                page_id: 1,
                cookie: vec![3, 0, 1],
            },
            RootEntry {
                page_id: 9,
                cookie: vec![4, 2, 2, 2],
            },
        ];

        let bytes = serialize(&original)?;
        let decoded: Vec<RootEntry> = deserialize(&bytes)?;
        assert_eq!(original, decoded);
        Ok(())
    }

    #[test]
    fn test_invalid_data() {
        let invalid_data = vec![0xFF, 0xFF, 0xFF, 0xFF];
        let result: Result<String> = deserialize(&invalid_data);
        assert!(matches!(result, Err(Error::Encoding(_))));
    }
}
