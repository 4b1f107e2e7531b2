use std::fmt;

/// A Kafka partition, or any other offset-addressed stream shard.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionKey {
    stream: String,
    partition: i32,
}

impl PartitionKey {
    pub fn new(stream: impl Into<String>, partition: i32) -> Self {
        Self {
            stream: stream.into(),
            partition,
        }
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.stream, self.partition)
    }
}

/// Where a message lives on its broker.
///
/// Offsets are cumulative: committing offset `n` acknowledges everything
/// before it on the same partition. Delivery tags are acknowledged one by one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Position {
    Offset { partition: PartitionKey, offset: i64 },
    Tag { queue: String, tag: u64 },
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Position::Offset { partition, offset } => write!(f, "{partition}@{offset}"),
            Position::Tag { queue, tag } => write!(f, "{queue}#{tag}"),
        }
    }
}

/// One message pulled from a source. Never mutated after fetch.
#[derive(Debug, Clone)]
pub struct MessageUnit {
    payload: Vec<u8>,
    position: Position,
}

impl MessageUnit {
    pub fn new(payload: Vec<u8>, position: Position) -> Self {
        Self { payload, position }
    }

    pub fn offset(stream: &str, partition: i32, offset: i64, payload: Vec<u8>) -> Self {
        Self::new(
            payload,
            Position::Offset {
                partition: PartitionKey::new(stream, partition),
                offset,
            },
        )
    }

    pub fn tagged(queue: &str, tag: u64, payload: Vec<u8>) -> Self {
        Self::new(
            payload,
            Position::Tag {
                queue: queue.to_owned(),
                tag,
            },
        )
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn position(&self) -> &Position {
        &self.position
    }
}
