use std::fs::{self, DirBuilder};
use std::io;
use std::path::{Path, PathBuf};

/// Creates a directory if it doesn't exist
pub fn ensure_dir(path: impl AsRef<Path>) -> io::Result<()> {
    DirBuilder::new()
        .recursive(true)
        .create(path)
}

/// Splits text into sentences. A `.`, `!` or `?` ends a sentence only when
/// followed by whitespace or the end of the text, so `5.25` stays whole.
fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        if matches!(c, '.' | '!' | '?') && chars.peek().is_none_or(|&(_, next)| next.is_whitespace()) {
            let end = i + c.len_utf8();
            let sentence = text[start..end].trim();
            if !sentence.is_empty() {
                sentences.push(sentence);
            }
            start = end;
        }
    }

    let rest = text[start..].trim();
    if !rest.is_empty() {
        sentences.push(rest);
    }
    sentences
}

/// Wraps text at word boundaries into pieces of at most `max_chars` characters.
/// Words longer than that are cut at character boundaries.
fn wrap_words(text: &str, max_chars: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current = String::new();
    let mut current_length = 0;

    for word in text.split_whitespace() {
        let mut word = word;
        while word.chars().count() > max_chars {
            if !current.is_empty() {
                pieces.push(std::mem::take(&mut current));
                current_length = 0;
            }
            let cut = word.char_indices().nth(max_chars).map_or(word.len(), |(i, _)| i);
            pieces.push(word[..cut].to_string());
            word = &word[cut..];
        }
        if word.is_empty() {
            continue;
        }

        let word_len = word.chars().count();
        if !current.is_empty() && current_length + 1 + word_len > max_chars {
            pieces.push(std::mem::take(&mut current));
            current_length = 0;
        }
        if !current.is_empty() {
            current.push(' ');
            current_length += 1;
        }
        current.push_str(word);
        current_length += word_len;
    }

    if !current.is_empty() {
        pieces.push(current);
    }
    pieces
}

/// Packs sentences into chunks of at most `max_chars` characters, keeping each
/// sentence's own terminator. Over-long sentences are wrapped.
pub fn split_into_chunks(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut current_chunk = String::new();
    let mut current_length = 0;

    for sentence in split_sentences(text) {
        let sentence = sentence.split_whitespace().collect::<Vec<_>>().join(" ");
        let pieces = if sentence.chars().count() > max_chars {
            wrap_words(&sentence, max_chars)
        } else {
            vec![sentence]
        };

        for piece in pieces {
            let piece_len = piece.chars().count();
            if !current_chunk.is_empty() && current_length + 1 + piece_len > max_chars {
                chunks.push(std::mem::take(&mut current_chunk));
                current_length = 0;
            }
            if !current_chunk.is_empty() {
                current_chunk.push(' ');
                current_length += 1;
            }
            current_chunk.push_str(&piece);
            current_length += piece_len;
        }
    }

    if !current_chunk.is_empty() {
        chunks.push(current_chunk);
    }

    chunks
}

/// Splits a document into paragraphs on blank lines; paragraphs longer than
/// `max_chars` are further packed into sentence chunks.
pub fn split_into_paragraphs(text: &str, max_chars: usize) -> Vec<String> {
    let normalized = text.replace("\r\n", "\n");
    let mut paragraphs = Vec::new();

    for block in normalized.split("\n\n") {
        let paragraph = block.split_whitespace().collect::<Vec<_>>().join(" ");
        if paragraph.is_empty() {
            continue;
        }
        if paragraph.chars().count() <= max_chars {
            paragraphs.push(paragraph);
        } else {
            paragraphs.extend(split_into_chunks(&paragraph, max_chars));
        }
    }

    paragraphs
}

/// Loads all text files from a directory recursively, in path order
pub fn load_text_files(dir_path: impl AsRef<Path>) -> io::Result<Vec<String>> {
    let mut texts = Vec::new();

    if !dir_path.as_ref().exists() {
        ensure_dir(&dir_path)?;
        return Ok(texts);
    }

    let mut paths: Vec<PathBuf> = fs::read_dir(dir_path)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<io::Result<_>>()?;
    paths.sort();

    for path in paths {
        if path.is_file() {
            if path.extension().is_some_and(|ext| ext == "txt") {
                texts.push(fs::read_to_string(path)?);
            }
        } else if path.is_dir() {
            texts.extend(load_text_files(path)?);
        }
    }

    Ok(texts)
}
