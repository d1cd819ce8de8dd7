//! Syntactic validation of `name=url,name=url` peer lists

use std::collections::BTreeMap;
use std::str::FromStr;

use url::Url;

use crate::UrlsMapError;

/// Member name to peer URLs, as found in an initial cluster string.
///
/// A name may appear more than once to carry several URLs; its URLs are kept
/// sorted.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UrlsMap(BTreeMap<String, Vec<Url>>);

impl UrlsMap {
    /// Parses and validates an initial cluster string.
    ///
    /// # Errors
    ///
    /// Fails on the first URL that does not parse, uses a scheme other than
    /// `http`, `https`, `unix` or `unixs`, lacks an explicit port (`http(s)`
    /// only), or carries a path.
    pub fn parse(s: &str) -> Result<Self, UrlsMapError> {
        let mut map: BTreeMap<String, Vec<Url>> = BTreeMap::new();

        for segment in s.split(',').filter(|segment| !segment.is_empty()) {
            let (name, raw) = segment.split_once('=').unwrap_or((segment, ""));
            let url = validate_url(raw.trim())?;
            map.entry(name.to_string()).or_default().push(url);
        }

        for urls in map.values_mut() {
            urls.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        }

        Ok(Self(map))
    }

    /// URLs registered under `name`.
    #[must_use]
    #[cfg(test)]
    pub(crate) fn urls(&self, name: &str) -> Option<&[Url]> {
        self.0.get(name).map(Vec::as_slice)
    }

    /// Member names in sorted order.
    #[cfg(test)]
    pub(crate) fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Number of distinct member names.
    #[must_use]
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the map holds no members.
    #[must_use]
    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromStr for UrlsMap {
    type Err = UrlsMapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn validate_url(raw: &str) -> Result<Url, UrlsMapError> {
    let url = Url::parse(raw).map_err(|e| UrlsMapError::Parse {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;

    let (authority, rest) = split_authority(raw);

    match url.scheme() {
        "http" | "https" => {
            if !has_explicit_port(authority) {
                return Err(UrlsMapError::MissingPort(raw.to_string()));
            }
        }
        "unix" | "unixs" => {}
        _ => return Err(UrlsMapError::UnsupportedScheme(raw.to_string())),
    }

    if rest.starts_with('/') {
        return Err(UrlsMapError::UnexpectedPath(raw.to_string()));
    }

    Ok(url)
}

/// Splits `scheme://authority/rest` into the raw authority and whatever
/// follows it.
fn split_authority(raw: &str) -> (&str, &str) {
    let after_scheme = raw.split_once("://").map_or("", |(_, tail)| tail);
    let end = after_scheme
        .find(['/', '?', '#'])
        .unwrap_or(after_scheme.len());
    after_scheme.split_at(end)
}

fn has_explicit_port(authority: &str) -> bool {
    let host_port = authority
        .rsplit_once('@')
        .map_or(authority, |(_, host_port)| host_port);

    if host_port.starts_with('[') {
        return host_port
            .split_once("]:")
            .is_some_and(|(_, port)| port.chars().all(|c| c.is_ascii_digit()));
    }

    host_port.matches(':').count() == 1
}
