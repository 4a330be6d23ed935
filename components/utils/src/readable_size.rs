//! Human-readable byte sizes for logs and config values. Parsing and
//! formatting rules follow raft-engine's `util::ReadableSize`.

use std::{
    fmt::{self, Debug, Display},
    str::FromStr,
};

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

const BINARY_DATA_MAGNITUDE: u64 = 1024;
pub const B: u64 = 1;
pub const KIB: u64 = B * BINARY_DATA_MAGNITUDE;
pub const MIB: u64 = KIB * BINARY_DATA_MAGNITUDE;
pub const GIB: u64 = MIB * BINARY_DATA_MAGNITUDE;
pub const TIB: u64 = GIB * BINARY_DATA_MAGNITUDE;

#[derive(Clone, Copy, PartialEq, Eq, Ord, PartialOrd)]
pub struct ReadableSize(pub u64);

impl ReadableSize {
    pub const fn kb(count: u64) -> ReadableSize {
        ReadableSize(count * KIB)
    }

    pub const fn mb(count: u64) -> ReadableSize {
        ReadableSize(count * MIB)
    }

    pub const fn gb(count: u64) -> ReadableSize {
        ReadableSize(count * GIB)
    }

    pub const fn as_bytes(self) -> u64 {
        self.0
    }
}

impl Display for ReadableSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 >= TIB {
            write!(f, "{:.1}TiB", self.0 as f64 / TIB as f64)
        } else if self.0 >= GIB {
            write!(f, "{:.1}GiB", self.0 as f64 / GIB as f64)
        } else if self.0 >= MIB {
            write!(f, "{:.1}MiB", self.0 as f64 / MIB as f64)
        } else if self.0 >= KIB {
            write!(f, "{:.1}KiB", self.0 as f64 / KIB as f64)
        } else {
            write!(f, "{}B", self.0)
        }
    }
}

impl Debug for ReadableSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl FromStr for ReadableSize {
    type Err = String;

    fn from_str(s: &str) -> Result<ReadableSize, String> {
        let size_str = s.trim();
        if size_str.is_empty() || !size_str.is_ascii() {
            return Err(format!("{s:?} is not a valid size"));
        }

        let digits = size_str
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == '.')
            .count();
        let (size, unit) = size_str.split_at(digits);

        let unit = match unit.trim() {
            "K" | "KB" | "KiB" => KIB,
            "M" | "MB" | "MiB" => MIB,
            "G" | "GB" | "GiB" => GIB,
            "T" | "TB" | "TiB" => TIB,
            "B" | "" => B,
            _ => {
                return Err(format!(
                    "only B, KB, KiB, MB, MiB, GB, GiB, TB, and TiB are supported: {s:?}"
                ));
            }
        };

        match size.parse::<f64>() {
            Ok(n) => Ok(ReadableSize((n * unit as f64) as u64)),
            Err(_) => Err(format!("invalid size string: {s:?}")),
        }
    }
}

impl Serialize for ReadableSize {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let size = self.0;
        if size == 0 || size % KIB != 0 {
            serializer.serialize_u64(size)
        } else if size % TIB == 0 {
            serializer.serialize_str(&format!("{}TiB", size / TIB))
        } else if size % GIB == 0 {
            serializer.serialize_str(&format!("{}GiB", size / GIB))
        } else if size % MIB == 0 {
            serializer.serialize_str(&format!("{}MiB", size / MIB))
        } else {
            serializer.serialize_str(&format!("{}KiB", size / KIB))
        }
    }
}

impl<'de> Deserialize<'de> for ReadableSize {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct SizeVisitor;

        impl<'de> de::Visitor<'de> for SizeVisitor {
            type Value = ReadableSize;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("valid size")
            }

            fn visit_u64<E>(self, size: u64) -> Result<ReadableSize, E>
            where
                E: de::Error,
            {
                Ok(ReadableSize(size))
            }

            fn visit_i64<E>(self, size: i64) -> Result<ReadableSize, E>
            where
                E: de::Error,
            {
                if size >= 0 {
                    self.visit_u64(size as u64)
                } else {
                    Err(E::invalid_value(de::Unexpected::Signed(size), &self))
                }
            }

            fn visit_str<E>(self, size_str: &str) -> Result<ReadableSize, E>
            where
                E: de::Error,
            {
                size_str.parse().map_err(E::custom)
            }
        }

        deserializer.deserialize_any(SizeVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn construct_and_display() {
        assert_eq!(ReadableSize::kb(2).0, 2048);
        assert_eq!(ReadableSize::mb(2).0, 2 * MIB);
        assert_eq!(format!("{}", ReadableSize::mb(3)), "3.0MiB");
        assert_eq!(format!("{}", ReadableSize(512)), "512B");
    }

    #[test]
    fn parse() {
        assert_eq!("1MiB".parse::<ReadableSize>().unwrap(), ReadableSize::mb(1));
        assert_eq!("64K".parse::<ReadableSize>().unwrap(), ReadableSize::kb(64));
        assert_eq!("123".parse::<ReadableSize>().unwrap(), ReadableSize(123));
        assert!("12km".parse::<ReadableSize>().is_err());
    }
}
