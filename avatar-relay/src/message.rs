use std::fmt;

use base64::{Engine, engine::general_purpose::STANDARD};
use bytes::Bytes;

/// Field delimiter inside a protocol line.
pub const DELIMITER: char = '@';

/// Author used for notices generated by the relay itself.
pub const SYSTEM_AUTHOR: &str = "SYSTEM";

const TEXT: &str = "TEXT";
const AVATAR: &str = "AVATAR";
const RENAME: &str = "RENAME";

/// One protocol line, decoded.
///
/// The last field of every variant keeps any `@` it contains, so chat text
/// and base64 payloads survive a parse/encode cycle unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text {
        author: String,
        body: String,
    },
    Avatar {
        author: String,
        filename: String,
        data: String,
    },
    Rename {
        old: String,
        new: String,
    },
    /// Anything that is not a well-formed known message; relayed verbatim.
    Opaque(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("avatar payload for '{author}' is not valid base64")]
    AvatarData {
        author: String,
        #[source]
        source: base64::DecodeError,
    },
}

impl Message {
    /// Parses one line. Trailing whitespace is ignored and empty lines yield
    /// `Ok(None)`.
    pub fn parse(line: &str) -> Result<Option<Self>, ParseError> {
        let line = line.trim_end();
        if line.is_empty() {
            return Ok(None);
        }

        let kind = line.split(DELIMITER).next().unwrap_or_default();
        let message = match kind {
            TEXT => fields::<3>(line).map(|[_, author, body]| Message::Text {
                author: author.to_string(),
                body: body.to_string(),
            }),
            AVATAR => match fields::<4>(line) {
                Some([_, author, filename, data]) => {
                    if let Err(source) = STANDARD.decode(data) {
                        return Err(ParseError::AvatarData {
                            author: author.to_string(),
                            source,
                        });
                    }
                    Some(Message::Avatar {
                        author: author.to_string(),
                        filename: filename.to_string(),
                        data: data.to_string(),
                    })
                }
                None => None,
            },
            RENAME => fields::<3>(line).map(|[_, old, new]| Message::Rename {
                old: old.to_string(),
                new: new.to_string(),
            }),
            _ => None,
        };

        Ok(Some(
            message.unwrap_or_else(|| Message::Opaque(line.to_string())),
        ))
    }

    /// A relay-generated notice.
    pub fn system(body: impl Into<String>) -> Self {
        Message::Text {
            author: SYSTEM_AUTHOR.to_string(),
            body: body.into(),
        }
    }

    /// Builds an avatar message from raw image bytes.
    pub fn avatar(author: impl Into<String>, filename: impl Into<String>, image: &[u8]) -> Self {
        Message::Avatar {
            author: author.into(),
            filename: filename.into(),
            data: STANDARD.encode(image),
        }
    }

    /// Newline-terminated wire form, ready to be queued for any number of peers.
    pub fn to_line(&self) -> Bytes {
        let mut line = self.to_string();
        line.push('\n');
        Bytes::from(line)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Text { author, body } => write!(f, "{TEXT}@{author}@{body}"),
            Message::Avatar {
                author,
                filename,
                data,
            } => write!(f, "{AVATAR}@{author}@{filename}@{data}"),
            Message::Rename { old, new } => write!(f, "{RENAME}@{old}@{new}"),
            Message::Opaque(line) => f.write_str(line),
        }
    }
}

/// Splits into exactly `N` fields, the last one taking the remainder.
fn fields<const N: usize>(line: &str) -> Option<[&str; N]> {
    let mut out = [""; N];
    let mut parts = line.splitn(N, DELIMITER);
    for slot in out.iter_mut() {
        *slot = parts.next()?;
    }
    Some(out)
}

/// Decodes the base64 image carried by an avatar message.
pub fn decode_avatar(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
    STANDARD.decode(data)
}
