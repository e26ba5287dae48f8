//! Splitting a reply into short, human-paced messages.
//!
//! A long wall of text from a chat contact reads like a bot. The chunker
//! breaks a reply at sentence and line boundaries into pieces no longer than
//! `max_words_per_chunk` / `max_chars_per_chunk`, then occasionally glues two
//! short neighbours back together so the rhythm is not too regular. Each chunk
//! after the first carries a typing delay proportional to its length.

use serde::{Deserialize, Serialize};
use solara_core::config::ChunkConfig;

/// One outbound message and the pause to observe before sending it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundChunk {
    pub text: String,
    pub delay_ms: u64,
    pub word_count: usize,
    pub char_count: usize,
}

impl OutboundChunk {
    pub fn new(text: String, delay_ms: u64) -> Self {
        Self {
            word_count: word_count(&text),
            char_count: char_count(&text),
            text,
            delay_ms,
        }
    }
}

/// Ordered chunks of one reply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkedReply {
    pub chunks: Vec<OutboundChunk>,
    pub total_chunks: usize,
}

impl ChunkedReply {
    pub fn from_chunks(chunks: Vec<OutboundChunk>) -> Self {
        Self {
            total_chunks: chunks.len(),
            chunks,
        }
    }

    /// The whole text as one chunk with no delay (zero chunks if blank).
    pub fn single(text: &str) -> Self {
        let text = text.trim();
        if text.is_empty() {
            return Self::default();
        }
        Self::from_chunks(vec![OutboundChunk::new(text.to_string(), 0)])
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn total_delay_ms(&self) -> u64 {
        self.chunks.iter().map(|c| c.delay_ms).sum()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, OutboundChunk> {
        self.chunks.iter()
    }
}

impl IntoIterator for ChunkedReply {
    type Item = OutboundChunk;
    type IntoIter = std::vec::IntoIter<OutboundChunk>;

    fn into_iter(self) -> Self::IntoIter {
        self.chunks.into_iter()
    }
}

/// Split `text` using a thread-local random source for the merge step.
pub fn chunk(text: &str, config: &ChunkConfig) -> ChunkedReply {
    chunk_with_rng(text, config, &mut fastrand::Rng::new())
}

/// Split `text`, drawing merge decisions from `rng`. A seeded `rng` makes the
/// output reproducible.
pub fn chunk_with_rng(text: &str, config: &ChunkConfig, rng: &mut fastrand::Rng) -> ChunkedReply {
    let text = text.trim();
    if text.is_empty() {
        return ChunkedReply::default();
    }

    let limits = Limits::from(config);
    if limits.fits(word_count(text), char_count(text)) {
        return ChunkedReply::single(text);
    }

    let units = units(text, &limits);
    let drafts = accumulate(units, &limits);
    let drafts = merge_short(drafts, &limits, config.join_probability, rng);

    let chunks = drafts
        .into_iter()
        .enumerate()
        .map(|(i, draft)| {
            let delay_ms = if i == 0 { 0 } else { typing_delay(&draft.text, config) };
            OutboundChunk::new(draft.text, delay_ms)
        })
        .collect();
    ChunkedReply::from_chunks(chunks)
}

/// Pause before a chunk: the time to type it at `typing_wpm`, clamped.
fn typing_delay(text: &str, config: &ChunkConfig) -> u64 {
    if config.typing_wpm == 0 {
        return config.max_delay_ms;
    }
    let raw = word_count(text) as u64 * 60_000 / u64::from(config.typing_wpm);
    raw.clamp(config.min_delay_ms, config.max_delay_ms.max(config.min_delay_ms))
}

#[derive(Debug, Clone, Copy)]
struct Limits {
    words: usize,
    chars: usize,
}

impl Limits {
    fn fits(&self, words: usize, chars: usize) -> bool {
        words <= self.words && chars <= self.chars
    }
}

impl From<&ChunkConfig> for Limits {
    fn from(config: &ChunkConfig) -> Self {
        Self {
            words: config.max_words_per_chunk.max(1),
            chars: config.max_chars_per_chunk.max(1),
        }
    }
}

/// What separated a unit from the text after it in the reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Boundary {
    Space,
    Line,
    /// One or more blank lines.
    Paragraph,
}

impl Boundary {
    fn separator(self) -> &'static str {
        match self {
            Boundary::Space => " ",
            Boundary::Line => "\n",
            Boundary::Paragraph => "\n\n",
        }
    }
}

/// A sentence (or piece of one) and the boundary that follows it.
#[derive(Debug)]
struct Unit {
    text: String,
    after: Boundary,
}

/// A chunk under construction.
#[derive(Debug)]
struct Draft {
    text: String,
    after: Boundary,
}

impl Draft {
    fn words(&self) -> usize {
        word_count(&self.text)
    }

    fn chars(&self) -> usize {
        char_count(&self.text)
    }

    fn ends_line(&self) -> bool {
        self.after != Boundary::Space
    }
}

fn word_count(s: &str) -> usize {
    s.split_whitespace().count()
}

fn char_count(s: &str) -> usize {
    s.chars().count()
}

/// Break `text` into sentence units per line, splitting any unit that alone
/// exceeds a limit. Blank lines mark the unit before them as ending a
/// paragraph.
fn units(text: &str, limits: &Limits) -> Vec<Unit> {
    let mut out: Vec<Unit> = Vec::new();
    for line in text.lines().map(str::trim) {
        if line.is_empty() {
            if let Some(last) = out.last_mut() {
                last.after = Boundary::Paragraph;
            }
            continue;
        }
        let sentences = sentences(line);
        let last = sentences.len().saturating_sub(1);
        for (i, sentence) in sentences.into_iter().enumerate() {
            let pieces = if limits.fits(word_count(sentence), char_count(sentence)) {
                vec![sentence.to_string()]
            } else {
                split_oversize(sentence, limits)
            };
            let n = pieces.len();
            for (j, piece) in pieces.into_iter().enumerate() {
                let after = if i == last && j + 1 == n {
                    Boundary::Line
                } else {
                    Boundary::Space
                };
                out.push(Unit { text: piece, after });
            }
        }
    }
    out
}

/// Split one line after sentence terminators that are followed by whitespace.
fn sentences(line: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut chars = line.char_indices().peekable();
    while let Some((_, c)) = chars.next() {
        if !matches!(c, '.' | '!' | '?' | '…') {
            continue;
        }
        if let Some(&(next_i, next)) = chars.peek() {
            if next.is_whitespace() {
                let sentence = line[start..next_i].trim();
                if !sentence.is_empty() {
                    out.push(sentence);
                }
                start = next_i;
            }
        }
    }
    let tail = line[start..].trim();
    if !tail.is_empty() {
        out.push(tail);
    }
    out
}

/// Greedy word packing for a unit that exceeds a limit on its own. A single
/// word longer than the char limit is cut at char boundaries.
fn split_oversize(sentence: &str, limits: &Limits) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut words = 0;

    for word in sentence.split_whitespace() {
        for piece in hard_split(word, limits.chars) {
            let extra = if current.is_empty() { 0 } else { 1 };
            let over = words + 1 > limits.words
                || char_count(&current) + extra + char_count(&piece) > limits.chars;
            if over && !current.is_empty() {
                out.push(std::mem::take(&mut current));
                words = 0;
            }
            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(&piece);
            words += 1;
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

fn hard_split(word: &str, max_chars: usize) -> Vec<String> {
    if char_count(word) <= max_chars {
        return vec![word.to_string()];
    }
    word.chars()
        .collect::<Vec<_>>()
        .chunks(max_chars)
        .map(|c| c.iter().collect())
        .collect()
}

/// Pack units into drafts until the next unit would break a limit. A line
/// break always closes the current draft.
fn accumulate(units: Vec<Unit>, limits: &Limits) -> Vec<Draft> {
    let mut drafts: Vec<Draft> = Vec::new();
    let mut current: Option<Draft> = None;

    for unit in units {
        current = match current.take() {
            None => Some(Draft {
                text: unit.text,
                after: unit.after,
            }),
            Some(mut draft) => {
                let words = draft.words() + word_count(&unit.text);
                let chars = draft.chars() + 1 + char_count(&unit.text);
                if limits.fits(words, chars) {
                    draft.text.push(' ');
                    draft.text.push_str(&unit.text);
                    draft.after = unit.after;
                    Some(draft)
                } else {
                    drafts.push(draft);
                    Some(Draft {
                        text: unit.text,
                        after: unit.after,
                    })
                }
            }
        };

        if current.as_ref().is_some_and(Draft::ends_line) {
            drafts.extend(current.take());
        }
    }
    drafts.extend(current);
    drafts
}

/// With probability `join_probability`, join neighbouring drafts that are both
/// at most half the word limit and still fit together.
fn merge_short(
    drafts: Vec<Draft>,
    limits: &Limits,
    join_probability: f64,
    rng: &mut fastrand::Rng,
) -> Vec<Draft> {
    let short = (limits.words / 2).max(1);
    let mut out: Vec<Draft> = Vec::with_capacity(drafts.len());

    for draft in drafts {
        if let Some(prev) = out.last_mut() {
            let both_short = prev.words() <= short && draft.words() <= short;
            let sep = prev.after.separator();
            let fits = limits.fits(
                prev.words() + draft.words(),
                prev.chars() + sep.len() + draft.chars(),
            );
            if both_short && fits && rng.f64() < join_probability {
                prev.text.push_str(sep);
                prev.text.push_str(&draft.text);
                prev.after = draft.after;
                continue;
            }
        }
        out.push(draft);
    }
    out
}
