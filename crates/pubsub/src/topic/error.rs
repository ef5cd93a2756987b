use thiserror::Error;

/// An error that can occur when parsing topics.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// The topic string is empty.
    #[error("topic must not be empty")]
    Empty,

    /// One of the segments between separators is empty.
    #[error("topic `{0}` contains an empty segment")]
    EmptySegment(String),

    /// A single-level wildcard shares its segment with other characters.
    #[error("wildcard must occupy a whole segment in `{0}`")]
    PartialWildcard(String),

    /// Multi-level wildcards are not part of the topic grammar.
    #[error("multi-level wildcard is not supported in `{0}`")]
    MultiLevelWildcard(String),

    /// A segment appended to a topic contains a separator or is empty.
    #[error("`{0}` is not a valid topic segment")]
    InvalidSegment(String),

    /// A publishable topic contains a wildcard.
    #[error("topic `{0}` contains a wildcard and cannot be published to")]
    WildcardInTopic(String),
}
