use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;

/// Bucket backend kinds
///
/// The closed set of backends a locator can resolve to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BucketKind {
    Local,
    Cloud,
}

impl FromStr for BucketKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" => Ok(BucketKind::Local),
            "cloud" => Ok(BucketKind::Cloud),
            _ => Err(anyhow::anyhow!("Invalid bucket kind: {}", s)),
        }
    }
}

impl Display for BucketKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            BucketKind::Local => write!(f, "local"),
            BucketKind::Cloud => write!(f, "cloud"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_is_case_insensitive() {
        assert_eq!("LOCAL".parse::<BucketKind>().unwrap(), BucketKind::Local);
        assert_eq!("cloud".parse::<BucketKind>().unwrap(), BucketKind::Cloud);
        assert!("nfs".parse::<BucketKind>().is_err());
    }

    #[test]
    fn display_round_trips_through_from_str() {
        for kind in [BucketKind::Local, BucketKind::Cloud] {
            assert_eq!(kind.to_string().parse::<BucketKind>().unwrap(), kind);
        }
    }
}
