use std::cmp::Ordering;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VersionError {
    #[error("empty version string")]
    Empty,
    #[error("malformed version component {component:?} in {version:?}")]
    MalformedComponent { version: String, component: String },
}

/// Compare two dot-separated numeric version strings component-wise.
///
/// Missing components count as zero, so `"1.2"` and `"1.2.0"` are equal
/// while `"1.2.0.1"` is higher than both. Malformed components are an
/// explicit error rather than a silent zero.
///
/// # Errors
/// Returns an error when either version string is empty or contains a
/// non-numeric component.
pub fn compare(first: &str, second: &str) -> Result<Ordering, VersionError> {
    let left = parse_components(first)?;
    let right = parse_components(second)?;
    for index in 0..left.len().max(right.len()) {
        let a = left.get(index).copied().unwrap_or(0);
        let b = right.get(index).copied().unwrap_or(0);
        match a.cmp(&b) {
            Ordering::Equal => {}
            unequal => return Ok(unequal),
        }
    }
    Ok(Ordering::Equal)
}

/// Return whichever of the two versions is higher; the first operand wins a
/// tie.
///
/// # Errors
/// Propagates [`VersionError`] from [`compare`].
pub fn higher_of<'a>(first: &'a str, second: &'a str) -> Result<&'a str, VersionError> {
    match compare(first, second)? {
        Ordering::Less => Ok(second),
        Ordering::Equal | Ordering::Greater => Ok(first),
    }
}

/// Whether `candidate` is strictly higher than `current`.
///
/// # Errors
/// Propagates [`VersionError`] from [`compare`].
pub fn is_newer(candidate: &str, current: &str) -> Result<bool, VersionError> {
    Ok(compare(candidate, current)? == Ordering::Greater)
}

/// Extract the first dot-separated numeric version token from a release
/// name such as `"petrel 1.4.0.112"`.
#[must_use]
pub fn extract_version(release_name: &str) -> Option<&str> {
    release_name
        .split_whitespace()
        .find(|token| parse_components(token).is_ok())
}

fn parse_components(version: &str) -> Result<Vec<u64>, VersionError> {
    if version.is_empty() {
        return Err(VersionError::Empty);
    }
    version
        .split('.')
        .map(|component| {
            component
                .parse::<u64>()
                .map_err(|_| VersionError::MalformedComponent {
                    version: version.to_owned(),
                    component: component.to_owned(),
                })
        })
        .collect()
}
