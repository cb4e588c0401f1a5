//! Serde support for `Duration` configuration fields.
//! Accepts either an integer number of seconds or a humantime string
//! such as "90s" or "2m", and serializes as a humantime string.
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::time::Duration;

struct Wrap(Duration);

impl Serialize for Wrap {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(self.0).to_string())
    }
}

impl<'de> Deserialize<'de> for Wrap {
    fn deserialize<D>(deserializer: D) -> Result<Wrap, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct V;

        impl<'de2> de::Visitor<'de2> for V {
            type Value = Duration;

            fn expecting(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
                fmt.write_str("a duration expressed as seconds or a humantime string")
            }

            fn visit_u64<E>(self, v: u64) -> Result<Duration, E>
            where
                E: de::Error,
            {
                Ok(Duration::from_secs(v))
            }

            fn visit_i64<E>(self, v: i64) -> Result<Duration, E>
            where
                E: de::Error,
            {
                v.try_into()
                    .map(Duration::from_secs)
                    .map_err(|_| E::custom("duration seconds must not be negative"))
            }

            fn visit_f64<E>(self, v: f64) -> Result<Duration, E>
            where
                E: de::Error,
            {
                Ok(Duration::from_secs_f64(v))
            }

            fn visit_str<E>(self, v: &str) -> Result<Duration, E>
            where
                E: de::Error,
            {
                humantime::parse_duration(v)
                    .map_err(|_| E::invalid_value(de::Unexpected::Str(v), &self))
            }
        }

        deserializer.deserialize_any(V).map(Wrap)
    }
}

pub fn serialize<S>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    Wrap(*d).serialize(serializer)
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    Wrap::deserialize(deserializer).map(|w| w.0)
}

pub mod opt {
    use super::Wrap;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(d: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match d {
            Some(d) => serializer.serialize_some(&Wrap(*d)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<Wrap>::deserialize(deserializer)?.map(|w| w.0))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(serde::Serialize, serde::Deserialize)]
    struct Holder {
        #[serde(with = "super")]
        interval: Duration,
    }

    #[test]
    fn durations_from_seconds_or_strings() {
        let h: Holder = serde_json::from_str(r#"{"interval": 90}"#).unwrap();
        assert_eq!(h.interval, Duration::from_secs(90));

        let h: Holder = serde_json::from_str(r#"{"interval": "2m"}"#).unwrap();
        assert_eq!(h.interval, Duration::from_secs(120));

        assert_eq!(
            serde_json::to_string(&h).unwrap(),
            r#"{"interval":"2m"}"#.to_string()
        );
    }
}
