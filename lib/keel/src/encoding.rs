/// Base64 helpers for serde'ing binary key material in configuration files.
pub mod base64 {
    use serde::{Deserialize, Deserializer, Serializer};

    #[inline]
    pub fn encode(data: &[u8]) -> String {
        ::base64::encode(data)
    }

    #[inline]
    pub fn decode(encoded: &str) -> Result<Vec<u8>, ::base64::DecodeError> {
        ::base64::decode(encoded)
    }

    #[inline]
    pub fn serialize<S, T>(data: T, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        T: AsRef<[u8]>,
    {
        serializer.serialize_str(&encode(data.as_ref()))
    }

    #[inline]
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        decode(&encoded).map_err(serde::de::Error::custom)
    }

    #[cfg(test)]
    mod tests {
        #[test]
        fn test_roundtrip() {
            let data = [1u8, 2, 3, 254, 255];
            let encoded = super::encode(&data);

            assert_eq!(super::decode(&encoded).unwrap(), data);
        }
    }
}
