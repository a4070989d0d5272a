//! Selection of sections included in `describe` output.

use std::collections::BTreeSet;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DescribeOption {
    Info,
    Keys,
    Secrets,
    Features,
    Runtime,
    Apis,
    Services,
    FailedServices,
    FailedDetails,
    Markers,
    Security,
    Tracking,
    Workers,
}

impl DescribeOption {
    pub const ALL: [DescribeOption; 13] = [
        Self::Info,
        Self::Keys,
        Self::Secrets,
        Self::Features,
        Self::Runtime,
        Self::Apis,
        Self::Services,
        Self::FailedServices,
        Self::FailedDetails,
        Self::Markers,
        Self::Security,
        Self::Tracking,
        Self::Workers,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Keys => "keys",
            Self::Secrets => "secrets",
            Self::Features => "features",
            Self::Runtime => "runtime",
            Self::Apis => "apis",
            Self::Services => "services",
            Self::FailedServices => "failed",
            Self::FailedDetails => "failedDetails",
            Self::Markers => "markers",
            Self::Security => "security",
            Self::Tracking => "tracking",
            Self::Workers => "workers",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown describe option {0}")]
pub struct UnknownOption(pub String);

impl FromStr for DescribeOption {
    type Err = UnknownOption;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Self::ALL
            .into_iter()
            .find(|o| o.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownOption(s.to_string()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DescribeOptions(BTreeSet<DescribeOption>);

impl DescribeOptions {
    #[must_use]
    pub fn all() -> Self {
        Self(DescribeOption::ALL.into_iter().collect())
    }

    #[must_use]
    pub fn of(options: &[DescribeOption]) -> Self {
        Self(options.iter().copied().collect())
    }

    #[must_use]
    pub fn with(mut self, option: DescribeOption) -> Self {
        self.0.insert(option);
        self
    }

    #[must_use]
    pub fn has(&self, option: DescribeOption) -> bool {
        self.0.contains(&option)
    }

    /// Parses a comma separated list such as `info,apis,services`.
    ///
    /// # Errors
    ///
    /// Returns the first unknown option.
    pub fn parse(list: &str) -> Result<Self, UnknownOption> {
        list.split(',')
            .filter(|s| !s.trim().is_empty())
            .map(str::parse)
            .collect::<Result<BTreeSet<_>, _>>()
            .map(Self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_comma_separated_lists() {
        let options = DescribeOptions::parse("info, apis,FAILEDDETAILS").unwrap();
        assert!(options.has(DescribeOption::Info));
        assert!(options.has(DescribeOption::Apis));
        assert!(options.has(DescribeOption::FailedDetails));
        assert!(!options.has(DescribeOption::Keys));
        assert!(DescribeOptions::parse("info,bogus").is_err());
        assert_eq!(DescribeOptions::parse("").unwrap(), DescribeOptions::default());
    }

    #[test]
    fn all_covers_every_option() {
        let all = DescribeOptions::all();
        assert!(DescribeOption::ALL.iter().all(|o| all.has(*o)));
    }
}
