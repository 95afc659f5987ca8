use std::fmt;

/// A container image reference such as `registry.example.com:5000/team/app:v1@sha256:...`.
///
/// The first path segment is only treated as a registry host when it looks like one
/// (contains a `.` or `:`, or is `localhost`), so `library/nginx` has no host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub host: Option<String>,
    pub path: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ParseError {
    Empty,
    InvalidCharacter(String),
    MissingRepository(String),
    EmptyPathSegment(String),
    EmptyTag(String),
    InvalidDigest(String),
}

impl std::error::Error for ParseError {}
impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::Empty => write!(f, "image reference is empty"),
            ParseError::InvalidCharacter(image) => {
                write!(f, "image reference contains whitespace or control characters: {:?}", image)
            }
            ParseError::MissingRepository(image) => write!(f, "repository is missing: {}", image),
            ParseError::EmptyPathSegment(image) => {
                write!(f, "repository path contains an empty segment: {}", image)
            }
            ParseError::EmptyTag(image) => write!(f, "tag is empty: {}", image),
            ParseError::InvalidDigest(image) => write!(f, "invalid digest: {}", image),
        }
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(host) = &self.host {
            write!(f, "{}/", host)?;
        }
        write!(f, "{}{}", self.path, self.suffix())
    }
}

impl ImageReference {
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        if s.is_empty() {
            return Err(ParseError::Empty);
        }
        if s.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(ParseError::InvalidCharacter(s.to_string()));
        }

        let (name_and_tag, digest) = match s.split_once('@') {
            Some((rest, digest)) => {
                if !is_valid_digest(digest) {
                    return Err(ParseError::InvalidDigest(s.to_string()));
                }
                (rest, Some(digest.to_string()))
            }
            None => (s, None),
        };

        // Only a colon after the last slash starts a tag, earlier ones belong to a host port
        let last_slash = name_and_tag.rfind('/');
        let (name, tag) = match name_and_tag.rfind(':') {
            Some(pos) if last_slash.is_none_or(|slash| pos > slash) => {
                let tag = &name_and_tag[pos + 1..];
                if tag.is_empty() {
                    return Err(ParseError::EmptyTag(s.to_string()));
                }
                (&name_and_tag[..pos], Some(tag.to_string()))
            }
            _ => (name_and_tag, None),
        };

        if name.is_empty() {
            return Err(ParseError::MissingRepository(s.to_string()));
        }
        if name.split('/').any(str::is_empty) {
            return Err(ParseError::EmptyPathSegment(s.to_string()));
        }

        let (host, path) = match name.split_once('/') {
            Some((first, rest)) if looks_like_host(first) => (Some(first.to_string()), rest),
            _ => (None, name),
        };

        Ok(Self {
            host,
            path: path.to_string(),
            tag,
            digest,
        })
    }

    /// Last segment of the repository path, e.g. `nginx` for `library/nginx`.
    pub fn repository_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    /// The `:tag`, `@digest` or `:tag@digest` suffix exactly as it was parsed.
    pub fn suffix(&self) -> String {
        let mut suffix = String::new();
        if let Some(tag) = &self.tag {
            suffix.push(':');
            suffix.push_str(tag);
        }
        if let Some(digest) = &self.digest {
            suffix.push('@');
            suffix.push_str(digest);
        }
        suffix
    }

    /// Name of this image inside `target_registry`. Host and every leading path
    /// segment are dropped, so `org-a/app:v1` and `org-b/app:v1` map to the same name.
    pub fn mirrored_into(&self, target_registry: &str) -> String {
        format!(
            "{}/{}{}",
            target_registry,
            self.repository_name(),
            self.suffix()
        )
    }
}

fn looks_like_host(segment: &str) -> bool {
    segment.contains('.') || segment.contains(':') || segment == "localhost"
}

// <algorithm>:<encoded>, see https://github.com/opencontainers/image-spec/blob/main/descriptor.md#digests
fn is_valid_digest(digest: &str) -> bool {
    let Some((algorithm, encoded)) = digest.split_once(':') else {
        return false;
    };
    !algorithm.is_empty()
        && !encoded.is_empty()
        && algorithm
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "+._-".contains(c))
        && encoded
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "=_-".contains(c))
}
