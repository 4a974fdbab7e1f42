/// Serializes durations as human readable strings, such as `1h 30m` or `10s`.
pub mod duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let value = String::deserialize(deserializer)?;
        humantime::parse_duration(&value).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Wrapper {
        #[serde(with = "super::duration")]
        value: Duration,
    }

    #[test]
    fn duration_as_human_string() {
        let json = serde_json::to_string(&Wrapper {
            value: Duration::from_secs(90),
        })
        .unwrap();
        assert_eq!(json, r#"{"value":"1m 30s"}"#);
    }

    #[test]
    fn duration_rejects_garbage() {
        assert!(serde_json::from_str::<Wrapper>(r#"{"value":"soon"}"#).is_err());
        let parsed: Wrapper = serde_json::from_str(r#"{"value":"2m"}"#).unwrap();
        assert_eq!(parsed.value, Duration::from_secs(120));
    }
}
