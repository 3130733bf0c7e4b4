//! Connect version aliases and image resolution.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Default image repository on Docker Hub.
pub const DEFAULT_REPOSITORY: &str = "rstudio/rstudio-connect";

/// Default Connect version when none is requested.
pub const DEFAULT_VERSION: &str = "2025.09.0";

/// First Connect release exposing the bootstrap endpoint.
pub const DEFAULT_MIN_BOOTSTRAP_VERSION: &str = "2022.10.0";

/// A calendar-style Connect version, `YEAR.MONTH[.PATCH]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectVersion {
    pub year: u32,
    pub month: u32,
    pub patch: u32,
}

impl ConnectVersion {
    pub fn new(year: u32, month: u32, patch: u32) -> Self {
        Self { year, month, patch }
    }
}

impl FromStr for ConnectVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().split('.');
        let year = parts
            .next()
            .and_then(|p| p.parse::<u32>().ok())
            .ok_or_else(|| format!("'{s}' is not a YEAR.MONTH version"))?;
        let month = parts
            .next()
            .and_then(|p| p.parse::<u32>().ok())
            .ok_or_else(|| format!("'{s}' is not a YEAR.MONTH version"))?;
        // Patch may carry a suffix ("2024.08.0-dev"); only its leading digits count.
        let patch = parts
            .next()
            .map(|p| {
                p.chars()
                    .take_while(char::is_ascii_digit)
                    .collect::<String>()
                    .parse::<u32>()
                    .unwrap_or(0)
            })
            .unwrap_or(0);

        if !(1..=12).contains(&month) {
            return Err(format!("'{s}' has an invalid month"));
        }

        Ok(Self { year, month, patch })
    }
}

impl Ord for ConnectVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.year, self.month, self.patch).cmp(&(other.year, other.month, other.patch))
    }
}

impl PartialOrd for ConnectVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ConnectVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}.{}", self.year, self.month, self.patch)
    }
}

/// How the caller chose the image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageSelector {
    /// A Connect version alias such as `2025.09.0`.
    Version(String),
    /// A complete image reference, used verbatim.
    Image(String),
}

impl Default for ImageSelector {
    fn default() -> Self {
        ImageSelector::Version(DEFAULT_VERSION.to_string())
    }
}

/// The image to run and the Connect version it is known to carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedImage {
    pub reference: String,
    pub version: Option<ConnectVersion>,
}

/// Map a version alias to the Docker Hub tag.
///
/// Releases after 2023.06 are published on Ubuntu jammy, releases from 2022.09
/// through 2023.06 on bionic; older releases are tagged with the bare version.
pub fn docker_tag(version: &str) -> String {
    let mut parts = version.split('.');
    let (Some(year), Some(month)) = (parts.next(), parts.next()) else {
        return version.to_string();
    };
    let (Ok(year), Ok(month)) = (year.parse::<u32>(), month.parse::<u32>()) else {
        return version.to_string();
    };

    if year > 2023 || (year == 2023 && month > 6) {
        format!("jammy-{version}")
    } else if year > 2022 || (year == 2022 && month >= 9) {
        format!("bionic-{version}")
    } else {
        version.to_string()
    }
}

/// Resolve a selector against a repository.
pub fn resolve_image(selector: &ImageSelector, repository: &str) -> ResolvedImage {
    match selector {
        ImageSelector::Version(version) => ResolvedImage {
            reference: format!("{}:{}", repository, docker_tag(version)),
            version: version.parse().ok(),
        },
        ImageSelector::Image(reference) => ResolvedImage {
            reference: reference.clone(),
            version: version_from_reference(reference),
        },
    }
}

/// Best-effort version recovery from an explicit image tag, e.g. `jammy-2024.05.0`.
fn version_from_reference(reference: &str) -> Option<ConnectVersion> {
    // Digests carry no version; a ':' in the last path segment starts the tag.
    let without_digest = reference.split('@').next()?;
    let last_segment = without_digest.rsplit('/').next()?;
    let (_, tag) = last_segment.split_once(':')?;
    let candidate = tag.rsplit('-').next()?;
    candidate.parse().ok()
}
