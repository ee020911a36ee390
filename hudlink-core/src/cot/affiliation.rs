use std::fmt;

/// Affiliation encoded in the second atom of a CoT type (`a-f-…`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Affiliation {
    Friendly,
    Hostile,
    Neutral,
    Unknown,
    /// Anything that is not an `a-{f,h,n,u}` atom type.
    Pending,
}

impl Affiliation {
    pub fn from_cot_type(cot_type: &str) -> Self {
        if cot_type.starts_with("a-f") {
            Self::Friendly
        } else if cot_type.starts_with("a-h") {
            Self::Hostile
        } else if cot_type.starts_with("a-n") {
            Self::Neutral
        } else if cot_type.starts_with("a-u") {
            Self::Unknown
        } else {
            Self::Pending
        }
    }
}

impl fmt::Display for Affiliation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Friendly => write!(f, "FRIENDLY"),
            Self::Hostile => write!(f, "HOSTILE"),
            Self::Neutral => write!(f, "NEUTRAL"),
            Self::Unknown => write!(f, "UNKNOWN"),
            Self::Pending => write!(f, "PENDING"),
        }
    }
}
