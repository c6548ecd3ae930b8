//! Incremental decoder for streamed turn responses.
//!
//! The backend delivers a chunked text stream of concatenated JSON objects
//! with no outer delimiter:
//!
//! ```text
//! {"response_message":"You should"}{"response_message":" rest.","sources":[...]}
//! ```
//!
//! [`FragmentSplitter`] consumes each newly arrived chunk exactly once
//! (bookkeeping by last-consumed offset, never reprocessing from zero) and
//! yields complete candidate object substrings. Each candidate is parsed
//! independently; malformed fragments are logged and skipped without
//! aborting the stream. Recognized fields merge into a turn accumulator:
//! text by concatenation in arrival order, list fields appended in
//! first-seen order and de-duplicated by value.

use super::api::ApiStreamFragment;
use crate::types::MessageSource;
use tracing::warn;

/// Terminal status of a streamed turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResponseStatus {
    /// Still growing; more fragments may arrive.
    #[default]
    Pending,
    /// Transport signalled completion; the value is now immutable.
    Done,
    /// No fragment arrived within the timeout window.
    Timeout,
}

/// Splits a growing raw stream into complete top-level JSON object strings.
///
/// Objects may nest braces internally (`sources` entries do); the scan
/// tracks brace depth and string literals so an object is emitted only when
/// its outermost brace closes. An object split across chunk boundaries is
/// held until its remainder arrives — no content is dropped or emitted
/// twice.
#[derive(Debug, Default)]
pub struct FragmentSplitter {
    raw: String,
    /// Offset of the first byte not yet part of an emitted object.
    consumed: usize,
}

impl FragmentSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a chunk of stream text, returning any newly completed objects.
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.raw.push_str(chunk);

        let mut objects = Vec::new();
        let bytes = self.raw.as_bytes();
        let mut depth = 0usize;
        let mut start = None;
        let mut in_string = false;
        let mut escaped = false;

        let mut i = self.consumed;
        while i < bytes.len() {
            let b = bytes[i];
            if in_string {
                if escaped {
                    escaped = false;
                } else if b == b'\\' {
                    escaped = true;
                } else if b == b'"' {
                    in_string = false;
                }
            } else {
                match b {
                    b'"' => in_string = true,
                    b'{' => {
                        if depth == 0 {
                            start = Some(i);
                        }
                        depth += 1;
                    }
                    b'}' => {
                        if depth > 0 {
                            depth -= 1;
                            if depth == 0 {
                                if let Some(s) = start.take() {
                                    objects.push(self.raw[s..=i].to_owned());
                                }
                                self.consumed = i + 1;
                            }
                        }
                    }
                    _ => {}
                }
            }
            i += 1;
        }

        objects
    }
}

/// Parse candidate object strings, skipping and logging malformed ones.
pub fn parse_fragments(candidates: &[String]) -> Vec<ApiStreamFragment> {
    let mut fragments = Vec::new();
    for candidate in candidates {
        match serde_json::from_str::<ApiStreamFragment>(candidate) {
            Ok(fragment) => fragments.push(fragment),
            Err(e) => warn!(error = %e, "skipping malformed stream fragment"),
        }
    }
    fragments
}

/// Accumulated state of a streamed voice turn.
///
/// Grows monotonically as fragments arrive; immutable once `status` leaves
/// [`ResponseStatus::Pending`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VoiceTurn {
    pub status: ResponseStatus,
    /// The backend's echo of the recognized user query, concatenated.
    pub user_transcript: String,
    /// Assistant reply text, concatenated in arrival order.
    pub assistant_text: String,
    /// Citations, first-seen order, de-duplicated by value.
    pub sources: Vec<MessageSource>,
    /// Base64 audio clips, first-seen order, de-duplicated by value so a
    /// consumer diffing against its seen prefix never replays a clip.
    pub audio_clips: Vec<String>,
    /// Number of fragments absorbed so far.
    pub fragments: usize,
}

impl VoiceTurn {
    /// Merge one decoded fragment into the accumulator.
    pub fn absorb(&mut self, fragment: &ApiStreamFragment) {
        if let Some(ref text) = fragment.response_message {
            self.assistant_text.push_str(text);
        }
        if let Some(ref query) = fragment.query_message {
            self.user_transcript.push_str(query);
        }
        if let Some(ref sources) = fragment.sources {
            for source in sources {
                if !self.sources.contains(source) {
                    self.sources.push(source.clone());
                }
            }
        }
        if let Some(ref clip) = fragment.audio_base64 {
            if !self.audio_clips.contains(clip) {
                self.audio_clips.push(clip.clone());
            }
        }
        self.fragments += 1;
    }

    /// Whether any fragment content has arrived.
    pub fn has_content(&self) -> bool {
        self.fragments > 0
    }
}

/// Accumulated state of a streamed chat turn.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatTurn {
    pub status: ResponseStatus,
    /// Assistant reply text, concatenated in arrival order.
    pub text: String,
    /// Citations, first-seen order, de-duplicated by value.
    pub sources: Vec<MessageSource>,
    /// Number of fragments absorbed so far.
    pub fragments: usize,
}

impl ChatTurn {
    /// Merge one decoded fragment into the accumulator.
    pub fn absorb(&mut self, fragment: &ApiStreamFragment) {
        if let Some(ref text) = fragment.response_message {
            self.text.push_str(text);
        }
        if let Some(ref sources) = fragment.sources {
            for source in sources {
                if !self.sources.contains(source) {
                    self.sources.push(source.clone());
                }
            }
        }
        self.fragments += 1;
    }

    /// Whether any fragment content has arrived.
    pub fn has_content(&self) -> bool {
        self.fragments > 0
    }
}
