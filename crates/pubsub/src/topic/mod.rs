mod error;

pub use error::Error;

use std::fmt;
use std::str::FromStr;

/// Separator between topic segments.
pub const SEPARATOR: char = '/';

/// Segment matching exactly one level of a published topic.
pub const WILDCARD: &str = "+";

const MULTI_LEVEL_WILDCARD: char = '#';

/// A concrete topic that messages can be published to.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Topic(String);

impl Topic {
    /// Creates a new `Topic`.
    ///
    /// # Errors
    /// Returns an error if the topic is empty, has an empty segment or contains a wildcard.
    pub fn new<K>(topic: K) -> Result<Self, Error>
    where
        K: Into<String>,
    {
        let topic = topic.into();
        validate(&topic)?;
        if topic.split(SEPARATOR).any(|segment| segment == WILDCARD) {
            return Err(Error::WildcardInTopic(topic));
        }
        Ok(Self(topic))
    }

    /// Refines the topic with one more concrete segment.
    ///
    /// # Errors
    /// Returns an error if the segment is not a valid concrete segment.
    pub fn child<K>(&self, segment: K) -> Result<Self, Error>
    where
        K: Into<String>,
    {
        let segment = segment.into();
        if segment.contains(SEPARATOR) || segment.is_empty() {
            return Err(Error::InvalidSegment(segment));
        }
        Self::new(format!("{}{SEPARATOR}{segment}", self.0))
    }

    /// Filter matching every direct child of this topic.
    #[must_use]
    pub fn any(&self) -> TopicFilter {
        TopicFilter(format!("{}{SEPARATOR}{WILDCARD}", self.0))
    }

    /// The topic as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Iterates over the segments of the topic.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split(SEPARATOR)
    }

    /// The final segment of the topic.
    #[must_use]
    pub fn last_segment(&self) -> &str {
        self.0.rsplit(SEPARATOR).next().unwrap_or_default()
    }
}

/// A subscription pattern; segments may be the single-level wildcard `+`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicFilter(String);

impl TopicFilter {
    /// Creates a new `TopicFilter`.
    ///
    /// # Errors
    /// Returns an error if the filter is empty, has an empty segment or a malformed wildcard.
    pub fn new<K>(filter: K) -> Result<Self, Error>
    where
        K: Into<String>,
    {
        let filter = filter.into();
        validate(&filter)?;
        Ok(Self(filter))
    }

    /// Whether any segment is a wildcard.
    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        self.segments().any(|segment| segment == WILDCARD)
    }

    /// Whether a published topic is matched by this filter.
    #[must_use]
    pub fn matches(&self, topic: &Topic) -> bool {
        let mut filter = self.segments();
        let mut topic = topic.segments();
        loop {
            match (filter.next(), topic.next()) {
                (None, None) => return true,
                (Some(f), Some(t)) if f == WILDCARD || f == t => {}
                _ => return false,
            }
        }
    }

    /// The filter as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Iterates over the segments of the filter.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split(SEPARATOR)
    }
}

fn validate(topic: &str) -> Result<(), Error> {
    if topic.is_empty() {
        return Err(Error::Empty);
    }
    for segment in topic.split(SEPARATOR) {
        if segment.is_empty() {
            return Err(Error::EmptySegment(topic.to_string()));
        }
        if segment.contains(MULTI_LEVEL_WILDCARD) {
            return Err(Error::MultiLevelWildcard(topic.to_string()));
        }
        if segment.contains(WILDCARD) && segment != WILDCARD {
            return Err(Error::PartialWildcard(topic.to_string()));
        }
    }
    Ok(())
}

impl From<Topic> for TopicFilter {
    fn from(topic: Topic) -> Self {
        Self(topic.0)
    }
}

impl From<Topic> for String {
    fn from(topic: Topic) -> Self {
        topic.0
    }
}

impl From<TopicFilter> for String {
    fn from(filter: TopicFilter) -> Self {
        filter.0
    }
}

impl FromStr for Topic {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl FromStr for TopicFilter {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<&str> for Topic {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for TopicFilter {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for TopicFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
