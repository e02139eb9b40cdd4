//! Image identity: `user/name:tag` parsing and tag normalization.

use crate::error::HubError;

pub const ANONYMOUS_USER: &str = "_";
pub const DEFAULT_TAG: &str = "latest";

/// Tag assigned when "latest" is normalized before the digest is known.
pub const PLACEHOLDER_TAG: &str = "0000000000";

const DIGEST_TAG_LEN: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageRef {
    pub user: String,
    pub name: String,
    pub tag: String,
}

impl ImageRef {
    pub fn new(user: &str, name: &str, tag: &str) -> Self {
        Self {
            user: if user.is_empty() {
                ANONYMOUS_USER.to_string()
            } else {
                user.to_string()
            },
            name: name.to_string(),
            tag: if tag.is_empty() {
                DEFAULT_TAG.to_string()
            } else {
                tag.to_string()
            },
        }
    }

    /// Parses `[user/]name[:tag]`, defaulting the user to `_` and the tag
    /// to `latest`. A tag containing a further `:` is rejected.
    pub fn parse(input: &str) -> Result<Self, HubError> {
        let (user, name_tag) = match input.rfind('/') {
            Some(idx) => (&input[..idx], &input[idx + 1..]),
            None => ("", input),
        };
        let (name, tag) = match name_tag.find(':') {
            Some(idx) => (&name_tag[..idx], &name_tag[idx + 1..]),
            None => (name_tag, ""),
        };
        if tag.contains(':') {
            return Err(HubError::InvalidImageName(input.to_string()));
        }
        if name.is_empty() {
            return Err(HubError::InvalidImageName(input.to_string()));
        }
        Ok(Self::new(user, name, tag))
    }

    /// Canonical object name: always `user/name:tag`, `_` included.
    pub fn fullname(&self) -> String {
        format!("{}/{}:{}", self.user, self.name, self.tag)
    }

    /// Staging object name used while chunks are being assembled.
    pub fn slice_name(&self) -> String {
        format!("{}/_slice_{}:{}", self.user, self.name, self.tag)
    }

    /// Human-facing name: the anonymous user is omitted.
    pub fn display_name(&self) -> String {
        if self.user == ANONYMOUS_USER {
            format!("{}:{}", self.name, self.tag)
        } else {
            self.fullname()
        }
    }

    pub fn with_tag(&self, tag: &str) -> Self {
        Self::new(&self.user, &self.name, tag)
    }
}

impl std::fmt::Display for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.display_name())
    }
}

pub fn is_default_tag(tag: &str) -> bool {
    tag.is_empty() || tag == DEFAULT_TAG
}

/// Rewrites the mutable "latest" tag into a content-addressed one: the first
/// ten hex characters of the digest, or a placeholder when the digest is not
/// yet known. Explicit tags pass through untouched.
pub fn normalize_tag(tag: &str, digest: &str) -> String {
    if !is_default_tag(tag) {
        return tag.to_string();
    }
    let digest = digest.strip_prefix("sha256:").unwrap_or(digest);
    if digest.is_empty() {
        PLACEHOLDER_TAG.to_string()
    } else {
        digest[..DIGEST_TAG_LEN.min(digest.len())].to_string()
    }
}

/// Repository names match `^[a-z0-9]+(?:[._-][a-z0-9]+)*$`: lowercase
/// alphanumeric runs joined by single separators.
pub fn is_valid_name(name: &str) -> bool {
    let mut expect_alnum = true;
    for c in name.chars() {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            expect_alnum = false;
        } else if matches!(c, '.' | '_' | '-') {
            if expect_alnum {
                return false;
            }
            expect_alnum = true;
        } else {
            return false;
        }
    }
    !name.is_empty() && !expect_alnum
}

/// The anonymous user `_` is exempt from the name pattern; everything else
/// must match it, as must the repository name itself.
pub fn validate_repo_name(user: &str, name: &str) -> Result<(), HubError> {
    if user.is_empty() {
        return Err(HubError::InvalidImageName(name.to_string()));
    }
    let mut to_check = vec![name];
    if user != ANONYMOUS_USER {
        to_check.push(user);
    }
    for part in to_check {
        if !is_valid_name(part) {
            return Err(HubError::InvalidImageName(part.to_string()));
        }
    }
    Ok(())
}

pub fn strip_digest_prefix(digest: &str) -> &str {
    digest.strip_prefix("sha256:").unwrap_or(digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_reference_round_trips() {
        let r = ImageRef::parse("alice/ubuntu:v1").unwrap();
        assert_eq!(r.user, "alice");
        assert_eq!(r.name, "ubuntu");
        assert_eq!(r.tag, "v1");
        assert_eq!(r.fullname(), "alice/ubuntu:v1");
    }

    #[test]
    fn parse_applies_defaults() {
        let r = ImageRef::parse("ubuntu").unwrap();
        assert_eq!(r.user, "_");
        assert_eq!(r.name, "ubuntu");
        assert_eq!(r.tag, "latest");
        assert_eq!(r.display_name(), "ubuntu:latest");
    }

    #[test]
    fn parse_rejects_double_colon_tag() {
        assert!(matches!(
            ImageRef::parse("name:x:y"),
            Err(HubError::InvalidImageName(_))
        ));
    }

    #[test]
    fn parse_keeps_nested_user_path() {
        let r = ImageRef::parse("org/team/img:v2").unwrap();
        assert_eq!(r.user, "org/team");
        assert_eq!(r.name, "img");
    }

    #[test]
    fn slice_name_carries_staging_prefix() {
        let r = ImageRef::new("alice", "ubuntu", "v1");
        assert_eq!(r.slice_name(), "alice/_slice_ubuntu:v1");
    }

    #[test]
    fn normalize_tag_rewrites_latest_to_digest_prefix() {
        let digest = "f2ca1bb6c7e907d06dafe4687e579fce76b37e4e93b7605022da52e6ccc26fd2";
        assert_eq!(normalize_tag("latest", digest), "f2ca1bb6c7");
        assert_eq!(normalize_tag("", digest), "f2ca1bb6c7");
        assert_eq!(
            normalize_tag("latest", &format!("sha256:{digest}")),
            "f2ca1bb6c7"
        );
    }

    #[test]
    fn normalize_tag_uses_placeholder_without_digest() {
        assert_eq!(normalize_tag("latest", ""), PLACEHOLDER_TAG);
    }

    #[test]
    fn normalize_tag_keeps_explicit_tags() {
        assert_eq!(normalize_tag("v1", "deadbeef"), "v1");
    }

    #[test]
    fn name_pattern_matches_expected_shapes() {
        for good in ["ubuntu", "ubuntu-20.04", "a", "x_y-z.0", "0img"] {
            assert!(is_valid_name(good), "{good} should be valid");
        }
        for bad in ["", "Ubuntu", "-img", "img-", "a..b", "a b", "img:tag"] {
            assert!(!is_valid_name(bad), "{bad} should be invalid");
        }
    }

    #[test]
    fn anonymous_user_skips_user_validation() {
        assert!(validate_repo_name("_", "img").is_ok());
        assert!(validate_repo_name("Alice", "img").is_err());
        assert!(validate_repo_name("alice", "IMG").is_err());
        assert!(validate_repo_name("", "img").is_err());
    }
}
