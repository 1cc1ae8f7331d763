//! Captured stream contents.

use std::borrow::Cow;
use std::fmt;

use serde::Serialize;

use crate::options::OutputMode;

/// Bytes read back from a captured stream, typed by the pipeline's
/// [`OutputMode`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Captured {
    Bytes(Vec<u8>),
    Text(String),
}

impl Captured {
    /// Wrap raw bytes for `mode`. Text is decoded lossily and newlines are
    /// normalized to `\n`.
    pub fn decode(raw: Vec<u8>, mode: OutputMode) -> Self {
        match mode {
            OutputMode::Bytes => Captured::Bytes(raw),
            OutputMode::Text => {
                let text = match String::from_utf8(raw) {
                    Ok(text) => text,
                    Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
                };
                Captured::Text(universal_newlines(text))
            }
        }
    }

    /// Decode after trimming surrounding ASCII whitespace.
    pub(crate) fn decode_trimmed(raw: &[u8], mode: OutputMode) -> Self {
        Captured::decode(raw.trim_ascii().to_vec(), mode)
    }

    pub fn empty(mode: OutputMode) -> Self {
        Captured::decode(Vec::new(), mode)
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Captured::Bytes(bytes) => bytes,
            Captured::Text(text) => text.as_bytes(),
        }
    }

    /// The text, or `None` for a bytes capture.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Captured::Bytes(_) => None,
            Captured::Text(text) => Some(text),
        }
    }

    pub fn to_string_lossy(&self) -> Cow<'_, str> {
        match self {
            Captured::Bytes(bytes) => String::from_utf8_lossy(bytes),
            Captured::Text(text) => Cow::Borrowed(text),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Captured::Bytes(bytes) => bytes,
            Captured::Text(text) => text.into_bytes(),
        }
    }
}

fn universal_newlines(text: String) -> String {
    if !text.contains('\r') {
        return text;
    }
    text.replace("\r\n", "\n").replace('\r', "\n")
}

impl fmt::Display for Captured {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_string_lossy())
    }
}

impl PartialEq<&str> for Captured {
    fn eq(&self, other: &&str) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl PartialEq<str> for Captured {
    fn eq(&self, other: &str) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}
