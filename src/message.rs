//! Byte collections with cheap operations for the session data path.

use std::collections::VecDeque;
use std::sync::Arc;

/// A byte sequence assembled from shared-ownership chunks.
///
/// Payload bytes enter a [`Message`] once and are never copied again while
/// they move through the session: fragmentation [`cut`](Message::cut)s a
/// write into segment payloads, reassembly
/// [`concatenate`](Message::concatenate)s segment payloads back into an
/// application message, and retransmission clones a segment. All of these
/// only adjust chunk references.
#[derive(Debug, Clone, Default)]
pub struct Message {
    chunks: VecDeque<Chunk>,
    len: usize,
}

/// A view into a shared byte allocation.
#[derive(Debug, Clone)]
pub struct Chunk {
    bytes: Arc<[u8]>,
    start: usize,
    end: usize,
}

impl Chunk {
    fn len(&self) -> usize {
        self.end - self.start
    }

    fn as_slice(&self) -> &[u8] {
        &self.bytes[self.start..self.end]
    }
}

impl From<Vec<u8>> for Chunk {
    fn from(bytes: Vec<u8>) -> Self {
        let end = bytes.len();
        Self {
            bytes: bytes.into(),
            start: 0,
            end,
        }
    }
}

impl From<&[u8]> for Chunk {
    fn from(bytes: &[u8]) -> Self {
        bytes.to_vec().into()
    }
}

impl<const N: usize> From<&[u8; N]> for Chunk {
    fn from(bytes: &[u8; N]) -> Self {
        bytes.as_slice().into()
    }
}

impl Message {
    /// Creates a message holding the given bytes.
    pub fn new(body: impl Into<Chunk>) -> Self {
        let chunk = body.into();
        let len = chunk.len();
        let mut chunks = VecDeque::with_capacity(1);
        if len > 0 {
            chunks.push_back(chunk);
        }
        Self { chunks, len }
    }

    /// The number of bytes in the message.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the message contains no bytes.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Appends the bytes of `other` to the end of this message.
    pub fn concatenate(&mut self, other: Message) {
        self.len += other.len;
        self.chunks.extend(other.chunks);
    }

    /// Removes the first `len` bytes and returns them as a new message.
    ///
    /// Panics if `len` exceeds the message length; callers size their cuts
    /// from [`Message::len`].
    pub fn cut(&mut self, len: usize) -> Self {
        assert!(len <= self.len, "cannot cut {len} bytes from {}", self.len);
        self.len -= len;

        let mut chunks = VecDeque::new();
        let mut to_take = len;
        while to_take > 0 {
            // The length accounting above guarantees a front chunk exists.
            let Some(mut head) = self.chunks.pop_front() else {
                break;
            };
            if head.len() <= to_take {
                to_take -= head.len();
                chunks.push_back(head);
            } else {
                let mut taken = head.clone();
                taken.end = taken.start + to_take;
                head.start += to_take;
                chunks.push_back(taken);
                self.chunks.push_front(head);
                to_take = 0;
            }
        }

        Self { chunks, len }
    }

    /// Empties the message.
    pub fn clear(&mut self) {
        self.chunks.clear();
        self.len = 0;
    }

    /// Copies the message into `buf`, returning the number of bytes copied.
    /// Copies at most `buf.len()` bytes.
    pub fn copy_to(&self, buf: &mut [u8]) -> usize {
        let mut copied = 0;
        for chunk in &self.chunks {
            if copied == buf.len() {
                break;
            }
            let slice = chunk.as_slice();
            let take = slice.len().min(buf.len() - copied);
            buf[copied..copied + take].copy_from_slice(&slice[..take]);
            copied += take;
        }
        copied
    }

    /// Returns an iterator over the bytes of the message.
    pub fn iter(&self) -> impl Iterator<Item = u8> + '_ {
        self.chunks
            .iter()
            .flat_map(|chunk| chunk.as_slice().iter().copied())
    }

    /// Collects the message into a contiguous vector.
    pub fn to_vec(&self) -> Vec<u8> {
        self.iter().collect()
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.len == other.len && self.iter().eq(other.iter())
    }
}

impl Eq for Message {}

impl From<Vec<u8>> for Message {
    fn from(bytes: Vec<u8>) -> Self {
        Message::new(bytes)
    }
}

impl From<&[u8]> for Message {
    fn from(bytes: &[u8]) -> Self {
        Message::new(bytes)
    }
}
